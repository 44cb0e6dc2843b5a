use crate::oracle::{OracleAdapter, OracleOutcome};
use crate::store::ItemStore;
use crate::types::{Item, ItemError, OracleRequest, OracleResponse, PipelineError, Result, RubricId, ScoreRecord, Stage};
use chrono::NaiveDate;
use futures::StreamExt;
use std::collections::HashMap;
use tracing::{info, warn};

/// What came back from scoring a set of items through the oracle.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub scored: Vec<ScoreRecord>,
    pub failed: Vec<ItemError>,
    pub submitted: usize,
}

/// Submit one rubric request per item and persist each result as it arrives.
/// `build` turns a validated response into the record to store.
pub async fn score_and_persist<F>(
    adapter: &OracleAdapter,
    store: &ItemStore,
    day: NaiveDate,
    stage: Stage,
    rubric: RubricId,
    items: &[Item],
    build: F,
) -> Result<BatchOutcome>
where
    F: Fn(&Item, &OracleResponse) -> ScoreRecord,
{
    let mut pending: HashMap<uuid::Uuid, &Item> = HashMap::with_capacity(items.len());
    let mut requests = Vec::with_capacity(items.len());
    for item in items {
        let request = OracleRequest::for_item(item, rubric);
        pending.insert(request.request_id, item);
        requests.push(request);
    }

    let mut outcome = BatchOutcome {
        submitted: requests.len(),
        ..Default::default()
    };
    if requests.is_empty() {
        return Ok(outcome);
    }

    info!(day_bucket = %day, stage = %stage, count = requests.len(), oracle = %adapter.oracle_name(), "Submitting oracle batch");

    let mut results = std::pin::pin!(adapter.score_all(requests));
    while let Some(correlated) = results.next().await {
        let Some(item) = pending.remove(&correlated.request_id) else {
            warn!(request_id = %correlated.request_id, "Oracle result for unknown request ignored");
            continue;
        };

        match correlated.outcome {
            OracleOutcome::Scored(response) => {
                let record = build(item, &response);
                store.record_score(day, &record).await?;
                outcome.scored.push(record);
            }
            OracleOutcome::Failed(error) => {
                let failure = ItemError {
                    item_id: item.id.clone(),
                    phase: stage.into(),
                    message: error.to_string(),
                    attempts: correlated.attempts,
                };
                store.record_failure(day, &failure).await?;
                outcome.failed.push(failure);
            }
        }
    }

    for item in pending.values() {
        warn!(item_id = %item.id, "No oracle result returned for item");
    }

    Ok(outcome)
}

/// Fail the stage when too large a share of the batch could not be scored.
pub fn check_failure_fraction(stage: Stage, failed: usize, submitted: usize, max_fraction: f64) -> Result<()> {
    if submitted == 0 || failed == 0 {
        return Ok(());
    }
    let fraction = failed as f64 / submitted as f64;
    if fraction > max_fraction {
        return Err(PipelineError::SystemicOracleFailure {
            stage,
            failed,
            total: submitted,
        });
    }
    Ok(())
}

/// Integral JSON numbers only; `7.0` counts, `7.5` and `"7"` do not.
pub fn whole_number(value: &serde_json::Value) -> Option<i64> {
    if let Some(n) = value.as_i64() {
        return Some(n);
    }
    value
        .as_f64()
        .filter(|f| f.is_finite() && f.fract() == 0.0)
        .map(|f| f as i64)
}
