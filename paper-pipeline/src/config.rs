use crate::retry::RetryPolicy;
use crate::types::{Category, PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The six selection axes and their default caps (sum 100).
pub const SELECTION_AXES: [(&str, u32); 6] = [
    ("clickbait_potential", 25),
    ("life_impact", 20),
    ("human_comparison", 20),
    ("strong_numbers", 15),
    ("use_case", 10),
    ("implementation", 10),
];

pub const SCREENING_AXIS: &str = "usefulness";
pub const SCREENING_MIN: u32 = 1;
pub const SCREENING_MAX: u32 = 10;

/// Categories queried when the config names none of its own.
pub const DEFAULT_CATEGORIES: [Category; 7] = [
    Category::CsAi,
    Category::CsLg,
    Category::CsCl,
    Category::CsCv,
    Category::CsRo,
    Category::CsHc,
    Category::StatMl,
];
pub const DEFAULT_LOOKBACK_HOURS: i64 = 48;
pub const MAX_LOOKBACK_HOURS: i64 = 31 * 24;

/// Upper bound for the per-call timeout and the run deadline.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const MAX_RETRY_BASE_DELAY: Duration = Duration::from_secs(60);

/// Validated axis → max points mapping for the selection stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AxisWeights(BTreeMap<String, u32>);

impl AxisWeights {
    pub fn new(weights: BTreeMap<String, u32>) -> Result<Self> {
        for name in weights.keys() {
            if !SELECTION_AXES.iter().any(|(axis, _)| axis == name) {
                return Err(PipelineError::Config(format!("unrecognized selection axis: {}", name)));
            }
        }
        for (axis, _) in SELECTION_AXES.iter() {
            match weights.get(*axis) {
                None => {
                    return Err(PipelineError::Config(format!("missing weight for selection axis: {}", axis)));
                }
                Some(0) => {
                    return Err(PipelineError::Config(format!("weight for {} must be positive", axis)));
                }
                Some(_) => {}
            }
        }
        if weights.values().try_fold(0u32, |sum, w| sum.checked_add(*w)).is_none() {
            return Err(PipelineError::Config("selection axis weights overflow their sum".to_string()));
        }
        Ok(Self(weights))
    }

    pub fn max_for(&self, axis: &str) -> Option<u32> {
        self.0.get(axis).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Highest total a selection record can reach.
    pub fn total(&self) -> u32 {
        self.0.values().fold(0u32, |sum, w| sum.saturating_add(*w))
    }
}

impl Default for AxisWeights {
    fn default() -> Self {
        Self(SELECTION_AXES.iter().map(|(axis, max)| (axis.to_string(), *max)).collect())
    }
}

/// Policy knobs for the ranking pipeline. Build through [`FileConfig`] or
/// construct directly and call [`PipelineConfig::validate`].
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub top_k: usize,
    pub weights: AxisWeights,
    pub threshold: u32,
    pub high_bound: u32,
    pub retry: RetryPolicy,
    pub batch_parallelism: usize,
    pub per_call_timeout: Duration,
    pub run_deadline: Duration,
    pub max_failure_fraction: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            top_k: 100,
            weights: AxisWeights::default(),
            threshold: 65,
            high_bound: 80,
            retry: RetryPolicy::default(),
            batch_parallelism: 4,
            per_call_timeout: Duration::from_secs(60),
            run_deadline: Duration::from_secs(4 * 60 * 60),
            max_failure_fraction: 0.2,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.top_k == 0 {
            return Err(PipelineError::Config("top_k must be at least 1".to_string()));
        }
        if self.threshold == 0 {
            return Err(PipelineError::Config("threshold must be at least 1".to_string()));
        }
        if self.threshold >= self.high_bound {
            return Err(PipelineError::Config(format!(
                "threshold ({}) must be below high_bound ({})",
                self.threshold, self.high_bound
            )));
        }
        if self.high_bound > self.weights.total() {
            return Err(PipelineError::Config(format!(
                "high_bound ({}) exceeds the sum of axis weights ({})",
                self.high_bound,
                self.weights.total()
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(PipelineError::Config("max_retry_attempts must be at least 1".to_string()));
        }
        if self.retry.base_delay > MAX_RETRY_BASE_DELAY {
            return Err(PipelineError::Config(format!(
                "retry base delay must be at most {}ms",
                MAX_RETRY_BASE_DELAY.as_millis()
            )));
        }
        if self.batch_parallelism == 0 {
            return Err(PipelineError::Config("batch_parallelism must be at least 1".to_string()));
        }
        if self.per_call_timeout.is_zero() {
            return Err(PipelineError::Config("per_call_timeout must be positive".to_string()));
        }
        if self.run_deadline <= self.per_call_timeout {
            return Err(PipelineError::Config("run_deadline must exceed per_call_timeout".to_string()));
        }
        if self.run_deadline > MAX_TIMEOUT {
            return Err(PipelineError::Config(format!(
                "run_deadline must be at most {}s",
                MAX_TIMEOUT.as_secs()
            )));
        }
        if !(0.0..=1.0).contains(&self.max_failure_fraction) || self.max_failure_fraction.is_nan() {
            return Err(PipelineError::Config(format!(
                "max_failure_fraction must be within [0, 1], got {}",
                self.max_failure_fraction
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub categories: BTreeSet<Category>,
    pub base_url: String,
    pub max_results_per_category: usize,
    pub request_interval: Duration,
    pub lookback_hours: i64,
    pub user_agent: String,
}

#[derive(Debug, Clone)]
pub struct OracleConfig {
    pub model: String,
    pub endpoint: String,
    pub abstract_char_limit: usize,
    pub api_key_env: String,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub database_url: String,
    pub output_dir: PathBuf,
}

/// Everything the launcher needs, validated.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub pipeline: PipelineConfig,
    pub catalog: CatalogConfig,
    pub oracle: OracleConfig,
    pub storage: StorageConfig,
    pub log_level: String,
}

/// TOML-backed configuration as written on disk.
/// Secrets (API keys) stay as env vars.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct FileConfig {
    pub pipeline: PipelineSection,
    pub catalog: CatalogSection,
    pub oracle: OracleSection,
    pub storage: StorageSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct PipelineSection {
    pub top_k: usize,
    pub threshold: u32,
    pub high_bound: u32,
    pub max_retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub batch_parallelism: usize,
    pub per_call_timeout_secs: u64,
    pub run_deadline_secs: u64,
    pub max_failure_fraction: f64,
    pub weights: BTreeMap<String, u32>,
}

impl Default for PipelineSection {
    fn default() -> Self {
        let defaults = PipelineConfig::default();
        Self {
            top_k: defaults.top_k,
            threshold: defaults.threshold,
            high_bound: defaults.high_bound,
            max_retry_attempts: defaults.retry.max_attempts,
            retry_base_delay_ms: defaults.retry.base_delay.as_millis() as u64,
            batch_parallelism: defaults.batch_parallelism,
            per_call_timeout_secs: defaults.per_call_timeout.as_secs(),
            run_deadline_secs: defaults.run_deadline.as_secs(),
            max_failure_fraction: defaults.max_failure_fraction,
            weights: defaults.weights.iter().map(|(k, v)| (k.to_string(), v)).collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct CatalogSection {
    pub categories: Vec<String>,
    pub base_url: String,
    pub max_results_per_category: usize,
    pub request_interval_ms: u64,
    pub lookback_hours: i64,
    pub user_agent: String,
}

impl Default for CatalogSection {
    fn default() -> Self {
        Self {
            categories: DEFAULT_CATEGORIES.iter().map(|c| c.as_str().to_string()).collect(),
            base_url: "https://export.arxiv.org/api/query".to_string(),
            max_results_per_category: 100,
            request_interval_ms: 3000,
            lookback_hours: DEFAULT_LOOKBACK_HOURS,
            user_agent: "paper-pipeline/0.1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct OracleSection {
    pub model: String,
    pub endpoint: String,
    pub abstract_char_limit: usize,
    pub api_key_env: String,
}

impl Default for OracleSection {
    fn default() -> Self {
        Self {
            model: "gemini-2.5-flash".to_string(),
            endpoint: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            abstract_char_limit: 2500,
            api_key_env: "GEMINI_API_KEY".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct StorageSection {
    pub database_url: String,
    pub output_dir: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            database_url: "sqlite://paper_pipeline.db".to_string(),
            output_dir: PathBuf::from("./output"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingSection {
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

impl FileConfig {
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| PipelineError::Config(format!("failed to parse config: {}", e)))
    }

    pub fn into_app_config(self) -> Result<AppConfig> {
        let p = self.pipeline;
        let pipeline = PipelineConfig {
            top_k: p.top_k,
            weights: AxisWeights::new(p.weights)?,
            threshold: p.threshold,
            high_bound: p.high_bound,
            retry: RetryPolicy::new(p.max_retry_attempts, Duration::from_millis(p.retry_base_delay_ms)),
            batch_parallelism: p.batch_parallelism,
            per_call_timeout: Duration::from_secs(p.per_call_timeout_secs),
            run_deadline: Duration::from_secs(p.run_deadline_secs),
            max_failure_fraction: p.max_failure_fraction,
        };
        pipeline.validate()?;

        let mut categories = BTreeSet::new();
        for raw in &self.catalog.categories {
            let category = raw
                .parse::<Category>()
                .map_err(|e| PipelineError::Config(e.to_string()))?;
            categories.insert(category);
        }
        if categories.is_empty() {
            return Err(PipelineError::Config("at least one catalog category is required".to_string()));
        }
        if self.catalog.max_results_per_category == 0 {
            return Err(PipelineError::Config("max_results_per_category must be at least 1".to_string()));
        }
        if self.catalog.lookback_hours <= 0 {
            return Err(PipelineError::Config("lookback_hours must be positive".to_string()));
        }
        if self.catalog.lookback_hours > MAX_LOOKBACK_HOURS {
            return Err(PipelineError::Config(format!(
                "lookback_hours must be at most {}",
                MAX_LOOKBACK_HOURS
            )));
        }
        url::Url::parse(&self.catalog.base_url)?;

        if self.oracle.abstract_char_limit == 0 {
            return Err(PipelineError::Config("abstract_char_limit must be at least 1".to_string()));
        }

        Ok(AppConfig {
            pipeline,
            catalog: CatalogConfig {
                categories,
                base_url: self.catalog.base_url,
                max_results_per_category: self.catalog.max_results_per_category,
                request_interval: Duration::from_millis(self.catalog.request_interval_ms),
                lookback_hours: self.catalog.lookback_hours,
                user_agent: self.catalog.user_agent,
            },
            oracle: OracleConfig {
                model: self.oracle.model,
                endpoint: self.oracle.endpoint,
                abstract_char_limit: self.oracle.abstract_char_limit,
                api_key_env: self.oracle.api_key_env,
            },
            storage: StorageConfig {
                database_url: self.storage.database_url,
                output_dir: self.storage.output_dir,
            },
            log_level: self.logging.level,
        })
    }
}

/// Load, parse and validate a TOML config file. `DATABASE_URL` overrides the
/// configured database.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| PipelineError::Config(format!("failed to read config file {}: {}", path.display(), e)))?;
    let mut file_config = FileConfig::parse(&content)?;
    if let Ok(database_url) = std::env::var("DATABASE_URL") {
        file_config.storage.database_url = database_url;
    }
    file_config.into_app_config()
}
