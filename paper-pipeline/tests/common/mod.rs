#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use paper_pipeline::config::SELECTION_AXES;
use paper_pipeline::{
    CatalogSource, Category, DispatchRecord, Generator, Item, ItemStore, OracleError, OracleRequest,
    OracleResponse, PipelineConfig, RetryPolicy, RubricId, ScoringOracle,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_test_writer()
        .try_init();
}

pub fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 3, 14).unwrap()
}

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 14, 6, 0, 0).unwrap()
}

pub fn item(id: &str, minutes_after_base: i64) -> Item {
    Item {
        id: id.to_string(),
        title: format!("Paper {}", id),
        abstract_text: format!("We study {} and report results.", id),
        category: Category::CsAi,
        published_at: base_time() + ChronoDuration::minutes(minutes_after_base),
        authors: vec!["A. Author".to_string()],
        pdf_url: Some(format!("https://arxiv.org/pdf/{}", id)),
    }
}

/// `count` items with ids `2503.00001`, `2503.00002`, ... published a minute apart.
pub fn items(count: usize) -> Vec<Item> {
    (1..=count).map(|n| item(&paper_id(n), n as i64)).collect()
}

pub fn paper_id(n: usize) -> String {
    format!("2503.{:05}", n)
}

pub async fn memory_store() -> Arc<ItemStore> {
    Arc::new(ItemStore::open("sqlite::memory:").await.unwrap())
}

/// A fresh on-disk database URL, for tests that reopen the store.
pub fn temp_db_url() -> String {
    let path = std::env::temp_dir().join(format!("paper_pipeline_test_{}.db", Uuid::new_v4()));
    format!("sqlite://{}", path.display())
}

pub fn fast_config() -> PipelineConfig {
    PipelineConfig {
        retry: RetryPolicy::new(3, Duration::from_millis(1)),
        per_call_timeout: Duration::from_secs(2),
        run_deadline: Duration::from_secs(60),
        ..PipelineConfig::default()
    }
}

/// Selection axes filled greedily, in declaration order, to reach `total`.
pub fn axes_for_total(total: u32) -> BTreeMap<String, Value> {
    let mut remaining = total;
    SELECTION_AXES
        .iter()
        .map(|(axis, max)| {
            let score = remaining.min(*max);
            remaining -= score;
            (axis.to_string(), json!(score))
        })
        .collect()
}

/// Oracle with per-item scripted answers. Unscripted items get usefulness 5
/// and a selection total of 0.
#[derive(Default)]
pub struct ScriptedOracle {
    usefulness: Mutex<HashMap<String, Value>>,
    selection: Mutex<HashMap<String, BTreeMap<String, Value>>>,
    failing: Mutex<HashMap<(RubricId, String), OracleError>>,
    flaky: Mutex<HashMap<(RubricId, String), u32>>,
    calls: Mutex<Vec<(RubricId, String)>>,
    wrong_request_id: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
}

impl ScriptedOracle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_usefulness(&self, item_id: &str, value: Value) {
        self.usefulness.lock().unwrap().insert(item_id.to_string(), value);
    }

    pub fn set_selection(&self, item_id: &str, axes: BTreeMap<String, Value>) {
        self.selection.lock().unwrap().insert(item_id.to_string(), axes);
    }

    pub fn set_selection_total(&self, item_id: &str, total: u32) {
        self.set_selection(item_id, axes_for_total(total));
    }

    /// Every call for this item and rubric fails with `error`.
    pub fn fail(&self, rubric: RubricId, item_id: &str, error: OracleError) {
        self.failing.lock().unwrap().insert((rubric, item_id.to_string()), error);
    }

    pub fn heal(&self, rubric: RubricId, item_id: &str) {
        self.failing.lock().unwrap().remove(&(rubric, item_id.to_string()));
    }

    /// The first `times` calls fail with a transport error, later calls succeed.
    pub fn fail_times(&self, rubric: RubricId, item_id: &str, times: u32) {
        self.flaky.lock().unwrap().insert((rubric, item_id.to_string()), times);
    }

    pub fn answer_with_wrong_request_id(&self, item_id: &str) {
        self.wrong_request_id.lock().unwrap().insert(item_id.to_string());
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self, rubric: RubricId) -> usize {
        self.calls.lock().unwrap().iter().filter(|(r, _)| *r == rubric).count()
    }

    pub fn calls_for(&self, rubric: RubricId, item_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, id)| *r == rubric && id == item_id)
            .count()
    }
}

#[async_trait]
impl ScoringOracle for ScriptedOracle {
    fn oracle_name(&self) -> String {
        "scripted".to_string()
    }

    async fn score(&self, request: &OracleRequest) -> Result<OracleResponse, OracleError> {
        self.calls.lock().unwrap().push((request.rubric, request.item_id.clone()));
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let key = (request.rubric, request.item_id.clone());
        if let Some(error) = self.failing.lock().unwrap().get(&key) {
            return Err(error.clone());
        }
        {
            let mut flaky = self.flaky.lock().unwrap();
            if let Some(remaining) = flaky.get_mut(&key) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(OracleError::Transport("connection reset".to_string()));
                }
            }
        }

        let axis_scores = match request.rubric {
            RubricId::ResearchUsefulness => {
                let value = self
                    .usefulness
                    .lock()
                    .unwrap()
                    .get(&request.item_id)
                    .cloned()
                    .unwrap_or(json!(5));
                BTreeMap::from([("usefulness".to_string(), value)])
            }
            RubricId::ShortsVirality => self
                .selection
                .lock()
                .unwrap()
                .get(&request.item_id)
                .cloned()
                .unwrap_or_else(|| axes_for_total(0)),
        };

        let request_id = if self.wrong_request_id.lock().unwrap().contains(&request.item_id) {
            Uuid::new_v4()
        } else {
            request.request_id
        };

        Ok(OracleResponse {
            request_id,
            item_id: request.item_id.clone(),
            axis_scores,
            raw_text: String::new(),
        })
    }
}

/// Catalog returning a fixed item list; can be switched to fail.
pub struct StaticCatalog {
    items: Mutex<Vec<Item>>,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl StaticCatalog {
    pub fn new(items: Vec<Item>) -> Arc<Self> {
        Arc::new(Self {
            items: Mutex::new(items),
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set_items(&self, items: Vec<Item>) {
        *self.items.lock().unwrap() = items;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CatalogSource for StaticCatalog {
    fn source_name(&self) -> String {
        "static".to_string()
    }

    async fn fetch(&self, _categories: &BTreeSet<Category>, _since: DateTime<Utc>) -> anyhow::Result<Vec<Item>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("catalog unreachable");
        }
        Ok(self.items.lock().unwrap().clone())
    }
}

/// Generator that remembers what it was handed; can reject chosen items.
#[derive(Default)]
pub struct RecordingGenerator {
    records: Mutex<Vec<DispatchRecord>>,
    reject: Mutex<HashSet<String>>,
}

impl RecordingGenerator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reject(&self, item_id: &str) {
        self.reject.lock().unwrap().insert(item_id.to_string());
    }

    pub fn records(&self) -> Vec<DispatchRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn ids(&self) -> Vec<String> {
        self.records().into_iter().map(|r| r.item_id).collect()
    }
}

#[async_trait]
impl Generator for RecordingGenerator {
    fn generator_name(&self) -> String {
        "recording".to_string()
    }

    async fn dispatch(&self, record: &DispatchRecord) -> anyhow::Result<()> {
        if self.reject.lock().unwrap().contains(&record.item_id) {
            anyhow::bail!("renderer unavailable");
        }
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}
