pub mod types;
pub mod config;
pub mod retry;
pub mod store;
pub mod oracle;
pub mod batch;
pub mod screening;
pub mod selection;
pub mod orchestrator;
pub mod fetcher;
pub mod parser;
pub mod llm_adapter;
pub mod dispatch;
pub mod report;

pub use types::*;
pub use config::{load_config, AppConfig, AxisWeights, FileConfig, PipelineConfig};
pub use retry::RetryPolicy;
pub use store::ItemStore;
pub use oracle::OracleAdapter;
pub use screening::{ScreeningOutput, ScreeningStage};
pub use selection::{SelectionOutput, SelectionStage};
pub use orchestrator::Orchestrator;
pub use fetcher::ArxivFetcher;
pub use parser::ArxivParser;
pub use llm_adapter::GeminiOracle;
pub use dispatch::{JsonlHandoff, LogGenerator};
pub use report::export_day;
