use crate::config::{PipelineConfig, DEFAULT_CATEGORIES, DEFAULT_LOOKBACK_HOURS};
use crate::oracle::OracleAdapter;
use crate::screening::{ScreeningOutput, ScreeningStage};
use crate::selection::{SelectionOutput, SelectionStage};
use crate::store::ItemStore;
use crate::types::{
    CatalogSource, Category, CheckpointStage, DispatchRecord, DispatchStatus, Generator, IngestOutcome, Item,
    ItemError, ItemPhase, PipelineError, Result, RunContext, RunResult, RunState, ScoreRecord, ScoringOracle, Tier,
};
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Drives one day bucket through FETCHING → SCREENING → SELECTING →
/// DISPATCHING → DONE, checkpointing each stage before moving on.
///
/// Every stage reads what earlier attempts already persisted, so running the
/// same day again resumes at the first incomplete stage and never rescores
/// or re-dispatches an item.
pub struct Orchestrator {
    config: PipelineConfig,
    store: Arc<ItemStore>,
    catalog: Arc<dyn CatalogSource>,
    generator: Arc<dyn Generator>,
    screening: ScreeningStage,
    selection: SelectionStage,
    categories: BTreeSet<Category>,
    lookback: chrono::Duration,
}

impl Orchestrator {
    pub fn new(
        config: PipelineConfig,
        store: Arc<ItemStore>,
        catalog: Arc<dyn CatalogSource>,
        oracle: Arc<dyn ScoringOracle>,
        generator: Arc<dyn Generator>,
    ) -> Self {
        let adapter = Arc::new(OracleAdapter::new(
            oracle,
            config.retry,
            config.batch_parallelism,
            config.per_call_timeout,
        ));
        let screening = ScreeningStage::new(adapter.clone(), store.clone(), config.max_failure_fraction);
        let selection = SelectionStage::new(
            adapter,
            store.clone(),
            config.weights.clone(),
            config.threshold,
            config.high_bound,
            config.max_failure_fraction,
        );

        Self {
            config,
            store,
            catalog,
            generator,
            screening,
            selection,
            categories: DEFAULT_CATEGORIES.into_iter().collect(),
            lookback: chrono::Duration::hours(DEFAULT_LOOKBACK_HOURS),
        }
    }

    pub fn with_categories(mut self, categories: BTreeSet<Category>) -> Self {
        self.categories = categories;
        self
    }

    pub fn with_lookback_hours(mut self, hours: i64) -> Self {
        self.lookback = chrono::Duration::hours(hours);
        self
    }

    pub fn categories(&self) -> &BTreeSet<Category> {
        &self.categories
    }

    /// Run the pipeline for `day`. Only a run that could not start (lock held,
    /// store unavailable) returns `Err`; a run that started always comes back
    /// as a [`RunResult`], in state `FAILED` when it did not finish.
    pub async fn run(&self, day: NaiveDate) -> Result<RunResult> {
        let ctx = RunContext::new(day);
        let stale_after = self.config.run_deadline.saturating_mul(2);
        if !self.store.try_acquire_run_lock(day, ctx.run_id, stale_after).await? {
            warn!(day_bucket = %day, "Run lock held by another process");
            return Err(PipelineError::RunInProgress { day_bucket: day });
        }
        info!(day_bucket = %day, run_id = %ctx.run_id, "Run started");

        let mut result = RunResult::new(day);
        let outcome = tokio::time::timeout(self.config.run_deadline, self.drive(&ctx, &mut result)).await;
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(_) => Some(PipelineError::DeadlineExceeded {
                after_ms: u64::try_from(self.config.run_deadline.as_millis()).unwrap_or(u64::MAX),
            }),
        };

        if let Some(e) = failure {
            let detail = e.to_string();
            error!(day_bucket = %day, state = %result.state, last_completed = ?result.last_completed, "Run failed: {}", detail);
            result.state = RunState::Failed;
            if let Err(status_err) = self
                .store
                .set_run_status(day, RunState::Failed, result.last_completed, Some(&detail))
                .await
            {
                warn!(day_bucket = %day, "Could not persist FAILED state: {}", status_err);
            }
            result.failure = Some(detail);
        }

        match self.store.failures(day).await {
            Ok(errors) => result.errors = errors,
            Err(e) => warn!(day_bucket = %day, "Could not read item failures: {}", e),
        }
        if let Err(e) = self.store.release_run_lock(day, ctx.run_id).await {
            warn!(day_bucket = %day, "Could not release run lock: {}", e);
        }

        info!(
            day_bucket = %day,
            state = %result.state,
            ingested = result.ingested,
            duplicates = result.duplicates,
            screened = result.screened,
            selected = result.selected,
            dispatched = result.dispatched,
            errors = result.errors.len(),
            "Run finished"
        );
        Ok(result)
    }

    async fn drive(&self, ctx: &RunContext, result: &mut RunResult) -> Result<()> {
        let day = ctx.day_bucket;
        result.last_completed = self.store.last_checkpoint(day).await?;

        self.enter(ctx, result, RunState::Fetching).await?;
        self.fetch(ctx, result).await?;
        let items = self.store.list(day).await?;
        self.checkpoint(ctx, result, CheckpointStage::Ingested, json!({
            "run_id": ctx.run_id,
            "source": self.catalog.source_name(),
            "items": items.len(),
        }))
        .await?;

        self.enter(ctx, result, RunState::Screening).await?;
        let screened = self.screening.screen(ctx, items, self.config.top_k).await?;
        result.screened = screened.kept.len();
        self.checkpoint(ctx, result, CheckpointStage::Screened, screening_payload(&screened))
            .await?;

        self.enter(ctx, result, RunState::Selecting).await?;
        let selected = if self.store.checkpoint(day, CheckpointStage::Selected).await?.is_some() {
            self.selection.resume(ctx, screened.kept).await?
        } else {
            self.selection.select(ctx, screened.kept).await?
        };
        result.selected = selected.adopted().count();
        self.checkpoint(ctx, result, CheckpointStage::Selected, selection_payload(&selected))
            .await?;

        self.enter(ctx, result, RunState::Dispatching).await?;
        let (delivered, rejected) = self.dispatch(ctx, &selected).await?;
        result.dispatched = delivered + rejected;
        self.checkpoint(ctx, result, CheckpointStage::Dispatched, json!({
            "run_id": ctx.run_id,
            "generator": self.generator.generator_name(),
            "delivered": delivered,
            "rejected": rejected,
        }))
        .await?;

        self.enter(ctx, result, RunState::Done).await?;
        Ok(())
    }

    async fn enter(&self, ctx: &RunContext, result: &mut RunResult, state: RunState) -> Result<()> {
        info!(day_bucket = %ctx.day_bucket, from = %result.state, to = %state, "State transition");
        result.state = state;
        self.store
            .set_run_status(ctx.day_bucket, state, result.last_completed, None)
            .await
    }

    async fn checkpoint(
        &self,
        ctx: &RunContext,
        result: &mut RunResult,
        stage: CheckpointStage,
        payload: serde_json::Value,
    ) -> Result<()> {
        self.store.save_checkpoint(ctx.day_bucket, stage, &payload).await?;
        result.last_completed = result.last_completed.max(Some(stage));
        Ok(())
    }

    /// Query the catalog and ingest what it returns. Once the day's screening
    /// ranking is fixed, new ids are counted as deferred instead of ingested.
    async fn fetch(&self, ctx: &RunContext, result: &mut RunResult) -> Result<()> {
        let day = ctx.day_bucket;
        let since = fetch_window_start(day, self.lookback);
        let categories = u32::try_from(self.categories.len().max(1)).unwrap_or(u32::MAX);
        let attempt_timeout = self.config.per_call_timeout.saturating_mul(categories);

        info!(day_bucket = %day, source = %self.catalog.source_name(), since = %since, "Fetching catalog");
        let attempted = self
            .config
            .retry
            .run(
                "catalog_fetch",
                |_: &anyhow::Error| true,
                move || async move {
                    match tokio::time::timeout(attempt_timeout, self.catalog.fetch(&self.categories, since)).await {
                        Ok(fetched) => fetched,
                        Err(_) => Err(anyhow::anyhow!("catalog fetch timed out after {:?}", attempt_timeout)),
                    }
                },
            )
            .await;

        let items = match attempted.result {
            Ok(items) => items,
            Err(e) => {
                if self.store.checkpoint(day, CheckpointStage::Ingested).await?.is_some() {
                    warn!(day_bucket = %day, attempts = attempted.attempts, "Catalog unavailable, continuing from stored items: {}", e);
                    return Ok(());
                }
                return Err(PipelineError::Catalog(format!(
                    "fetch failed after {} attempts: {}",
                    attempted.attempts, e
                )));
            }
        };

        let closed = self.store.screening_closed(day).await?;
        for item in &items {
            if closed {
                if self.store.get(&item.id).await?.is_some() {
                    result.duplicates += 1;
                } else {
                    result.deferred += 1;
                }
                continue;
            }
            match self.store.ingest(item, day).await? {
                IngestOutcome::Inserted => result.ingested += 1,
                IngestOutcome::Duplicate => result.duplicates += 1,
            }
        }

        if result.deferred > 0 {
            warn!(day_bucket = %day, deferred = result.deferred, "Screening already closed for this day; new items left for the next run");
        }
        info!(
            day_bucket = %day,
            fetched = items.len(),
            inserted = result.ingested,
            duplicates = result.duplicates,
            "Ingestion complete"
        );
        Ok(())
    }

    /// Hand adopted items to the generator in screening order. Already
    /// dispatched items are skipped; generator errors are recorded, not retried.
    async fn dispatch(&self, ctx: &RunContext, selected: &SelectionOutput) -> Result<(usize, usize)> {
        let day = ctx.day_bucket;
        let mut delivered = 0;
        let mut rejected = 0;

        for (item, record) in selected.adopted() {
            if self.store.is_dispatched(day, &item.id).await? {
                continue;
            }
            let Some(dispatch) = DispatchRecord::from_record(record, day) else {
                continue;
            };

            let outcome = tokio::time::timeout(self.config.per_call_timeout, self.generator.dispatch(&dispatch)).await;
            let error = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some(format!("generator timed out after {:?}", self.config.per_call_timeout)),
            };

            match error {
                None => {
                    self.store.record_dispatch(&dispatch, DispatchStatus::Delivered, None).await?;
                    delivered += 1;
                }
                Some(message) => {
                    warn!(item_id = %item.id, generator = %self.generator.generator_name(), "Dispatch rejected: {}", message);
                    self.store
                        .record_dispatch(&dispatch, DispatchStatus::Rejected, Some(&message))
                        .await?;
                    self.store
                        .record_failure(
                            day,
                            &ItemError {
                                item_id: item.id.clone(),
                                phase: ItemPhase::Dispatch,
                                message,
                                attempts: 1,
                            },
                        )
                        .await?;
                    rejected += 1;
                }
            }
        }

        info!(day_bucket = %day, delivered, rejected, "Dispatch complete");
        Ok((delivered, rejected))
    }
}

/// Start of the catalog window for `day`: `lookback` before the end of the day (UTC).
pub fn fetch_window_start(day: NaiveDate, lookback: chrono::Duration) -> DateTime<Utc> {
    let start_of_day = Utc.from_utc_datetime(&day.and_time(NaiveTime::MIN));
    start_of_day + chrono::Duration::days(1) - lookback
}

fn ids<'a>(entries: impl Iterator<Item = &'a (Item, ScoreRecord)>) -> Vec<&'a str> {
    entries.map(|(item, _)| item.id.as_str()).collect()
}

fn screening_payload(output: &ScreeningOutput) -> serde_json::Value {
    json!({
        "kept": ids(output.kept.iter()),
        "dropped": ids(output.dropped.iter()),
        "failed": output.failed.iter().map(|f| f.item_id.as_str()).collect::<Vec<_>>(),
    })
}

fn selection_payload(output: &SelectionOutput) -> serde_json::Value {
    let by_tier = |tier: Tier| ids(output.records.iter().filter(move |(_, r)| r.tier == Some(tier)));
    json!({
        "adopt_high": by_tier(Tier::AdoptHigh),
        "adopt_mid": by_tier(Tier::AdoptMid),
        "skip": by_tier(Tier::Skip),
        "failed": output.failed.iter().map(|f| f.item_id.as_str()).collect::<Vec<_>>(),
    })
}
