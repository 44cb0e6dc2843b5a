use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Domain tags accepted from the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "cs.AI")]
    CsAi,
    #[serde(rename = "cs.LG")]
    CsLg,
    #[serde(rename = "cs.CL")]
    CsCl,
    #[serde(rename = "cs.CV")]
    CsCv,
    #[serde(rename = "cs.RO")]
    CsRo,
    #[serde(rename = "cs.HC")]
    CsHc,
    #[serde(rename = "cs.NE")]
    CsNe,
    #[serde(rename = "stat.ML")]
    StatMl,
}

impl Category {
    pub const ALL: [Category; 8] = [
        Category::CsAi,
        Category::CsLg,
        Category::CsCl,
        Category::CsCv,
        Category::CsRo,
        Category::CsHc,
        Category::CsNe,
        Category::StatMl,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::CsAi => "cs.AI",
            Category::CsLg => "cs.LG",
            Category::CsCl => "cs.CL",
            Category::CsCv => "cs.CV",
            Category::CsRo => "cs.RO",
            Category::CsHc => "cs.HC",
            Category::CsNe => "cs.NE",
            Category::StatMl => "stat.ML",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| UnknownVariant { kind: "category", value: s.to_string() })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// One candidate paper. Immutable once ingested; scores live in [`ScoreRecord`]s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub title: String,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    pub category: Category,
    pub published_at: DateTime<Utc>,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub pdf_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Screening,
    Selection,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Screening => "screening",
            Stage::Selection => "selection",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "screening" => Ok(Stage::Screening),
            "selection" => Ok(Stage::Selection),
            other => Err(UnknownVariant { kind: "stage", value: other.to_string() }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tier {
    AdoptHigh,
    AdoptMid,
    Skip,
}

impl Tier {
    /// Pure function of the locally computed total. Never taken from an oracle.
    pub fn classify(total_score: u32, threshold: u32, high_bound: u32) -> Tier {
        if total_score >= high_bound {
            Tier::AdoptHigh
        } else if total_score >= threshold {
            Tier::AdoptMid
        } else {
            Tier::Skip
        }
    }

    pub fn is_adopted(&self) -> bool {
        !matches!(self, Tier::Skip)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::AdoptHigh => "ADOPT_HIGH",
            Tier::AdoptMid => "ADOPT_MID",
            Tier::Skip => "SKIP",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ADOPT_HIGH" => Ok(Tier::AdoptHigh),
            "ADOPT_MID" => Ok(Tier::AdoptMid),
            "SKIP" => Ok(Tier::Skip),
            other => Err(UnknownVariant { kind: "tier", value: other.to_string() }),
        }
    }
}

/// Scores attached to an item by one stage.
///
/// No total is stored; [`ScoreRecord::total_score`] always sums `axis_scores`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub item_id: String,
    pub stage: Stage,
    pub axis_scores: BTreeMap<String, u32>,
    /// 1-based position in the screening ranking. `None` for selection records.
    pub rank: Option<u32>,
    /// `None` for screening records that made the cutoff.
    pub tier: Option<Tier>,
    pub scored_at: DateTime<Utc>,
}

impl ScoreRecord {
    pub fn new(item_id: impl Into<String>, stage: Stage, axis_scores: BTreeMap<String, u32>) -> Self {
        Self {
            item_id: item_id.into(),
            stage,
            axis_scores,
            rank: None,
            tier: None,
            scored_at: Utc::now(),
        }
    }

    pub fn total_score(&self) -> u32 {
        self.axis_scores.values().sum()
    }

    pub fn is_adopted(&self) -> bool {
        self.tier.map(|t| t.is_adopted()).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RubricId {
    /// Single axis `usefulness`, integer 1-10.
    ResearchUsefulness,
    /// Six axes, each capped by the configured weights.
    ShortsVirality,
}

impl RubricId {
    pub fn as_str(&self) -> &'static str {
        match self {
            RubricId::ResearchUsefulness => "research_usefulness",
            RubricId::ShortsVirality => "shorts_virality",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OraclePayload {
    pub title: String,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleRequest {
    pub request_id: Uuid,
    pub item_id: String,
    pub rubric: RubricId,
    pub payload: OraclePayload,
}

impl OracleRequest {
    pub fn for_item(item: &Item, rubric: RubricId) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            item_id: item.id.clone(),
            rubric,
            payload: OraclePayload {
                title: item.title.clone(),
                abstract_text: item.abstract_text.clone(),
            },
        }
    }
}

/// Raw oracle output. Axis values stay untyped until the stage validates them;
/// `raw_text` is kept for audit only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleResponse {
    pub request_id: Uuid,
    pub item_id: String,
    pub axis_scores: BTreeMap<String, serde_json::Value>,
    pub raw_text: String,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OracleError {
    #[error("oracle call timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("oracle transport error: {0}")]
    Transport(String),

    #[error("oracle rate limited")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("malformed oracle response: {0}")]
    Malformed(String),

    #[error("oracle rejected request: {0}")]
    Rejected(String),
}

impl OracleError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, OracleError::Rejected(_))
    }
}

/// Read-only projection handed to downstream generators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub item_id: String,
    pub day_bucket: NaiveDate,
    pub tier: Tier,
    pub total_score: u32,
    pub axis_scores: BTreeMap<String, u32>,
}

impl DispatchRecord {
    pub fn from_record(record: &ScoreRecord, day_bucket: NaiveDate) -> Option<Self> {
        let tier = record.tier?;
        Some(Self {
            item_id: record.item_id.clone(),
            day_bucket,
            tier,
            total_score: record.total_score(),
            axis_scores: record.axis_scores.clone(),
        })
    }
}

// Object style note:
// Collaborators behind these traits are thin I/O wrappers. They hold clients and
// settings, never pipeline state; everything durable goes through the item store.

#[async_trait]
pub trait CatalogSource: Send + Sync {
    fn source_name(&self) -> String;

    /// Items in `categories` published at or after `since`.
    async fn fetch(&self, categories: &BTreeSet<Category>, since: DateTime<Utc>) -> anyhow::Result<Vec<Item>>;
}

#[async_trait]
pub trait ScoringOracle: Send + Sync {
    fn oracle_name(&self) -> String;

    async fn score(&self, request: &OracleRequest) -> Result<OracleResponse, OracleError>;
}

#[async_trait]
pub trait Generator: Send + Sync {
    fn generator_name(&self) -> String;

    /// Hand one selected item downstream. Failures are recorded, never retried by the caller.
    async fn dispatch(&self, record: &DispatchRecord) -> anyhow::Result<()>;
}
