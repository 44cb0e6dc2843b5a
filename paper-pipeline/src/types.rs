use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub use interfaces::defs::{
    CatalogSource, Category, DispatchRecord, Generator, Item, OracleError, OracleRequest, OracleResponse,
    RubricId, ScoreRecord, ScoringOracle, Stage, Tier,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestOutcome {
    Inserted,
    Duplicate,
}

/// Day-scoped context threaded through every stage call of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub day_bucket: NaiveDate,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl RunContext {
    pub fn new(day_bucket: NaiveDate) -> Self {
        Self {
            day_bucket,
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
        }
    }
}

/// Per-run state machine. `Failed` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Fetching,
    Screening,
    Selecting,
    Dispatching,
    Done,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Fetching => "FETCHING",
            RunState::Screening => "SCREENING",
            RunState::Selecting => "SELECTING",
            RunState::Dispatching => "DISPATCHING",
            RunState::Done => "DONE",
            RunState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "FETCHING" => Ok(RunState::Fetching),
            "SCREENING" => Ok(RunState::Screening),
            "SELECTING" => Ok(RunState::Selecting),
            "DISPATCHING" => Ok(RunState::Dispatching),
            "DONE" => Ok(RunState::Done),
            "FAILED" => Ok(RunState::Failed),
            other => Err(PipelineError::Parse(format!("unknown run state: {}", other))),
        }
    }
}

/// Durable stage outputs, one per completed stage of a day bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStage {
    Ingested,
    Screened,
    Selected,
    Dispatched,
}

impl CheckpointStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStage::Ingested => "ingested",
            CheckpointStage::Screened => "screened",
            CheckpointStage::Selected => "selected",
            CheckpointStage::Dispatched => "dispatched",
        }
    }
}

impl fmt::Display for CheckpointStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckpointStage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ingested" => Ok(CheckpointStage::Ingested),
            "screened" => Ok(CheckpointStage::Screened),
            "selected" => Ok(CheckpointStage::Selected),
            "dispatched" => Ok(CheckpointStage::Dispatched),
            other => Err(PipelineError::Parse(format!("unknown checkpoint stage: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemPhase {
    Screening,
    Selection,
    Dispatch,
}

impl From<Stage> for ItemPhase {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Screening => ItemPhase::Screening,
            Stage::Selection => ItemPhase::Selection,
        }
    }
}

impl ItemPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemPhase::Screening => "screening",
            ItemPhase::Selection => "selection",
            ItemPhase::Dispatch => "dispatch",
        }
    }
}

impl FromStr for ItemPhase {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "screening" => Ok(ItemPhase::Screening),
            "selection" => Ok(ItemPhase::Selection),
            "dispatch" => Ok(ItemPhase::Dispatch),
            other => Err(PipelineError::Parse(format!("unknown item phase: {}", other))),
        }
    }
}

/// A per-item failure that was contained rather than aborting the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemError {
    pub item_id: String,
    pub phase: ItemPhase,
    pub message: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub day_bucket: NaiveDate,
    pub state: RunState,
    pub last_completed: Option<CheckpointStage>,
    /// Newly inserted items this run.
    pub ingested: usize,
    pub duplicates: usize,
    /// New items seen after the day's screening was closed; left for the next day's run.
    pub deferred: usize,
    /// Items that passed the screening cutoff.
    pub screened: usize,
    /// Items with tier other than SKIP.
    pub selected: usize,
    /// Items handed to the generator during this run.
    pub dispatched: usize,
    pub errors: Vec<ItemError>,
    pub failure: Option<String>,
}

impl RunResult {
    pub fn new(day_bucket: NaiveDate) -> Self {
        Self {
            day_bucket,
            state: RunState::Fetching,
            last_completed: None,
            ingested: 0,
            duplicates: 0,
            deferred: 0,
            screened: 0,
            selected: 0,
            dispatched: 0,
            errors: Vec::new(),
            failure: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == RunState::Done
    }
}

/// Latest persisted state of a day bucket's run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub day_bucket: NaiveDate,
    pub state: RunState,
    pub last_completed: Option<CheckpointStage>,
    pub detail: Option<String>,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Delivered,
    Rejected,
}

impl DispatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchStatus::Delivered => "delivered",
            DispatchStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for DispatchStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "delivered" => Ok(DispatchStatus::Delivered),
            "rejected" => Ok(DispatchStatus::Rejected),
            other => Err(PipelineError::Parse(format!("unknown dispatch status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchEntry {
    pub record: DispatchRecord,
    pub status: DispatchStatus,
    pub detail: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("A run for {day_bucket} is already in progress")]
    RunInProgress { day_bucket: NaiveDate },

    #[error("Oracle failed for {failed}/{total} items during {stage}")]
    SystemicOracleFailure { stage: Stage, failed: usize, total: usize },

    #[error("Run deadline of {after_ms}ms exceeded")]
    DeadlineExceeded { after_ms: u64 },

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("General error: {0}")]
    General(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
