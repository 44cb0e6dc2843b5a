use crate::types::{
    Category, CheckpointStage, DispatchEntry, DispatchRecord, DispatchStatus, IngestOutcome, Item, ItemError,
    ItemPhase, PipelineError, Result, RunState, RunStatus, ScoreRecord, Stage, Tier,
};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS items (
        id TEXT PRIMARY KEY,
        day_bucket TEXT NOT NULL,
        title TEXT NOT NULL,
        abstract TEXT NOT NULL,
        category TEXT NOT NULL,
        published_at_ms INTEGER NOT NULL,
        authors TEXT NOT NULL,
        pdf_url TEXT,
        ingested_at_ms INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_items_day ON items (day_bucket, published_at_ms, id)",
    r#"
    CREATE TABLE IF NOT EXISTS score_records (
        item_id TEXT NOT NULL REFERENCES items (id),
        stage TEXT NOT NULL,
        day_bucket TEXT NOT NULL,
        axis_scores TEXT NOT NULL,
        total_score INTEGER NOT NULL,
        rank INTEGER,
        tier TEXT,
        scored_at_ms INTEGER NOT NULL,
        PRIMARY KEY (item_id, stage)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_scores_day ON score_records (day_bucket, stage)",
    r#"
    CREATE TABLE IF NOT EXISTS item_failures (
        day_bucket TEXT NOT NULL,
        item_id TEXT NOT NULL,
        phase TEXT NOT NULL,
        message TEXT NOT NULL,
        attempts INTEGER NOT NULL,
        failed_at_ms INTEGER NOT NULL,
        PRIMARY KEY (day_bucket, item_id, phase)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS stage_checkpoints (
        day_bucket TEXT NOT NULL,
        stage TEXT NOT NULL,
        payload TEXT NOT NULL,
        completed_at_ms INTEGER NOT NULL,
        PRIMARY KEY (day_bucket, stage)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dispatches (
        day_bucket TEXT NOT NULL,
        item_id TEXT NOT NULL,
        tier TEXT NOT NULL,
        total_score INTEGER NOT NULL,
        axis_scores TEXT NOT NULL,
        status TEXT NOT NULL,
        detail TEXT,
        dispatched_at_ms INTEGER NOT NULL,
        PRIMARY KEY (day_bucket, item_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS run_locks (
        day_bucket TEXT PRIMARY KEY,
        holder TEXT NOT NULL,
        acquired_at_ms INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS runs (
        day_bucket TEXT PRIMARY KEY,
        state TEXT NOT NULL,
        last_completed TEXT,
        detail TEXT,
        updated_at_ms INTEGER NOT NULL
    )
    "#,
];

pub fn day_key(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| PipelineError::Parse(format!("timestamp out of range: {}", ms)))
}

/// Durable record of every item seen, plus the per-stage scores, checkpoints,
/// dispatch log and run bookkeeping that hang off it.
///
/// Items are keyed by id alone: an id seen on any earlier day is a duplicate.
pub struct ItemStore {
    db: SqlitePool,
}

impl ItemStore {
    pub async fn open(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        // Every connection to `:memory:` is its own database, so pin a single one.
        let in_memory = database_url.contains(":memory:");
        let mut pool_options = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 4 });
        if in_memory {
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }
        let db = pool_options.connect_with(options).await?;

        let store = Self { db };
        store.setup_schema().await?;
        debug!("Opened item store at {}", database_url);
        Ok(store)
    }

    pub async fn setup_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.db).await?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.db.close().await;
    }

    /// Insert an item under `day`. An id already present, on any day, is reported as a duplicate.
    pub async fn ingest(&self, item: &Item, day: NaiveDate) -> Result<IngestOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO items (id, day_bucket, title, abstract, category, published_at_ms, authors, pdf_url, ingested_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&item.id)
        .bind(day_key(day))
        .bind(&item.title)
        .bind(&item.abstract_text)
        .bind(item.category.as_str())
        .bind(item.published_at.timestamp_millis())
        .bind(serde_json::to_string(&item.authors)?)
        .bind(&item.pdf_url)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.db)
        .await?;

        if result.rows_affected() > 0 {
            Ok(IngestOutcome::Inserted)
        } else {
            debug!(item_id = %item.id, "Duplicate item ignored");
            Ok(IngestOutcome::Duplicate)
        }
    }

    pub async fn exists(&self, id: &str, day: NaiveDate) -> Result<bool> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM items WHERE id = ?1 AND day_bucket = ?2")
            .bind(id)
            .bind(day_key(day))
            .fetch_one(&self.db)
            .await?;
        Ok(row.get::<i64, _>("count") > 0)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Item>> {
        let row = sqlx::query("SELECT * FROM items WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        row.map(|r| item_from_row(&r)).transpose()
    }

    /// Items of a day, ordered by publication time then id.
    pub async fn list(&self, day: NaiveDate) -> Result<Vec<Item>> {
        let rows = sqlx::query("SELECT * FROM items WHERE day_bucket = ?1 ORDER BY published_at_ms ASC, id ASC")
            .bind(day_key(day))
            .fetch_all(&self.db)
            .await?;
        rows.iter().map(item_from_row).collect()
    }

    /// Persist a score record. Returns `false` when the item already has a
    /// record for that stage; existing records are never overwritten.
    pub async fn record_score(&self, day: NaiveDate, record: &ScoreRecord) -> Result<bool> {
        if record.stage == Stage::Selection {
            let screening = self.score_record(&record.item_id, Stage::Screening).await?;
            let kept = matches!(&screening, Some(s) if s.rank.is_some() && s.tier.is_none());
            if !kept {
                return Err(PipelineError::Invariant(format!(
                    "selection score for {} without a kept screening record",
                    record.item_id
                )));
            }
        }

        let result = sqlx::query(
            r#"
            INSERT INTO score_records (item_id, stage, day_bucket, axis_scores, total_score, rank, tier, scored_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT (item_id, stage) DO NOTHING
            "#,
        )
        .bind(&record.item_id)
        .bind(record.stage.as_str())
        .bind(day_key(day))
        .bind(serde_json::to_string(&record.axis_scores)?)
        .bind(record.total_score() as i64)
        .bind(record.rank.map(|r| r as i64))
        .bind(record.tier.map(|t| t.as_str()))
        .bind(record.scored_at.timestamp_millis())
        .execute(&self.db)
        .await?;

        let inserted = result.rows_affected() > 0;
        if inserted {
            // A later successful attempt supersedes an earlier recorded failure.
            sqlx::query("DELETE FROM item_failures WHERE day_bucket = ?1 AND item_id = ?2 AND phase = ?3")
                .bind(day_key(day))
                .bind(&record.item_id)
                .bind(ItemPhase::from(record.stage).as_str())
                .execute(&self.db)
                .await?;
        } else {
            debug!(item_id = %record.item_id, stage = %record.stage, "Score record already present, kept existing");
        }
        Ok(inserted)
    }

    pub async fn score_record(&self, item_id: &str, stage: Stage) -> Result<Option<ScoreRecord>> {
        let row = sqlx::query("SELECT * FROM score_records WHERE item_id = ?1 AND stage = ?2")
            .bind(item_id)
            .bind(stage.as_str())
            .fetch_optional(&self.db)
            .await?;
        row.map(|r| score_from_row(&r)).transpose()
    }

    /// Score records of one stage for a day, keyed by item id.
    pub async fn score_records(&self, day: NaiveDate, stage: Stage) -> Result<BTreeMap<String, ScoreRecord>> {
        let rows = sqlx::query("SELECT * FROM score_records WHERE day_bucket = ?1 AND stage = ?2")
            .bind(day_key(day))
            .bind(stage.as_str())
            .fetch_all(&self.db)
            .await?;
        let mut records = BTreeMap::new();
        for row in &rows {
            let record = score_from_row(row)?;
            records.insert(record.item_id.clone(), record);
        }
        Ok(records)
    }

    /// Fix ranks (and SKIP for dropped items) on screening records that have
    /// not been ranked yet. Runs in one transaction.
    pub async fn assign_screening_ranks(&self, day: NaiveDate, ranking: &[(String, u32, Option<Tier>)]) -> Result<()> {
        let mut tx = self.db.begin().await?;
        for (item_id, rank, tier) in ranking {
            sqlx::query(
                r#"
                UPDATE score_records SET rank = ?1, tier = ?2
                WHERE item_id = ?3 AND stage = 'screening' AND day_bucket = ?4 AND rank IS NULL
                "#,
            )
            .bind(*rank as i64)
            .bind(tier.map(|t| t.as_str()))
            .bind(item_id)
            .bind(day_key(day))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// True once the day's screening ranking has been fixed; the day's
    /// candidate set is closed from then on.
    pub async fn screening_closed(&self, day: NaiveDate) -> Result<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM score_records WHERE day_bucket = ?1 AND stage = 'screening' AND rank IS NOT NULL",
        )
        .bind(day_key(day))
        .fetch_one(&self.db)
        .await?;
        Ok(row.get::<i64, _>("count") > 0)
    }

    pub async fn record_failure(&self, day: NaiveDate, failure: &ItemError) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO item_failures (day_bucket, item_id, phase, message, attempts, failed_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (day_bucket, item_id, phase) DO UPDATE SET
                message = EXCLUDED.message,
                attempts = item_failures.attempts + EXCLUDED.attempts,
                failed_at_ms = EXCLUDED.failed_at_ms
            "#,
        )
        .bind(day_key(day))
        .bind(&failure.item_id)
        .bind(failure.phase.as_str())
        .bind(&failure.message)
        .bind(failure.attempts as i64)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.db)
        .await?;
        warn!(item_id = %failure.item_id, phase = failure.phase.as_str(), "Recorded item failure: {}", failure.message);
        Ok(())
    }

    pub async fn failures(&self, day: NaiveDate) -> Result<Vec<ItemError>> {
        let rows = sqlx::query("SELECT * FROM item_failures WHERE day_bucket = ?1 ORDER BY item_id, phase")
            .bind(day_key(day))
            .fetch_all(&self.db)
            .await?;
        rows.iter()
            .map(|row| -> Result<ItemError> {
                let phase: String = row.try_get("phase")?;
                Ok(ItemError {
                    item_id: row.try_get("item_id")?,
                    phase: ItemPhase::from_str(&phase)?,
                    message: row.try_get("message")?,
                    attempts: row.try_get::<i64, _>("attempts")? as u32,
                })
            })
            .collect()
    }

    /// Mark a stage complete for a day. The first checkpoint written wins.
    pub async fn save_checkpoint(&self, day: NaiveDate, stage: CheckpointStage, payload: &serde_json::Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO stage_checkpoints (day_bucket, stage, payload, completed_at_ms)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (day_bucket, stage) DO NOTHING
            "#,
        )
        .bind(day_key(day))
        .bind(stage.as_str())
        .bind(serde_json::to_string(payload)?)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.db)
        .await?;
        info!(day_bucket = %day, stage = %stage, "Checkpoint saved");
        Ok(())
    }

    pub async fn checkpoint(&self, day: NaiveDate, stage: CheckpointStage) -> Result<Option<serde_json::Value>> {
        let row = sqlx::query("SELECT payload FROM stage_checkpoints WHERE day_bucket = ?1 AND stage = ?2")
            .bind(day_key(day))
            .bind(stage.as_str())
            .fetch_optional(&self.db)
            .await?;
        match row {
            Some(r) => {
                let payload: String = r.try_get("payload")?;
                Ok(Some(serde_json::from_str(&payload)?))
            }
            None => Ok(None),
        }
    }

    pub async fn last_checkpoint(&self, day: NaiveDate) -> Result<Option<CheckpointStage>> {
        let rows = sqlx::query("SELECT stage FROM stage_checkpoints WHERE day_bucket = ?1")
            .bind(day_key(day))
            .fetch_all(&self.db)
            .await?;
        let mut last = None;
        for row in rows {
            let stage: String = row.try_get("stage")?;
            let stage = CheckpointStage::from_str(&stage)?;
            if last.map_or(true, |l| stage > l) {
                last = Some(stage);
            }
        }
        Ok(last)
    }

    /// Log a hand-off. Returns `false` if the item was already dispatched for this day.
    pub async fn record_dispatch(
        &self,
        record: &DispatchRecord,
        status: DispatchStatus,
        detail: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO dispatches (day_bucket, item_id, tier, total_score, axis_scores, status, detail, dispatched_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT (day_bucket, item_id) DO NOTHING
            "#,
        )
        .bind(day_key(record.day_bucket))
        .bind(&record.item_id)
        .bind(record.tier.as_str())
        .bind(record.total_score as i64)
        .bind(serde_json::to_string(&record.axis_scores)?)
        .bind(status.as_str())
        .bind(detail)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn is_dispatched(&self, day: NaiveDate, item_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM dispatches WHERE day_bucket = ?1 AND item_id = ?2")
            .bind(day_key(day))
            .bind(item_id)
            .fetch_one(&self.db)
            .await?;
        Ok(row.get::<i64, _>("count") > 0)
    }

    pub async fn dispatches(&self, day: NaiveDate) -> Result<Vec<DispatchEntry>> {
        let rows = sqlx::query("SELECT * FROM dispatches WHERE day_bucket = ?1 ORDER BY dispatched_at_ms, item_id")
            .bind(day_key(day))
            .fetch_all(&self.db)
            .await?;
        rows.iter()
            .map(|row| -> Result<DispatchEntry> {
                let tier: String = row.try_get("tier")?;
                let status: String = row.try_get("status")?;
                let axis_scores: String = row.try_get("axis_scores")?;
                Ok(DispatchEntry {
                    record: DispatchRecord {
                        item_id: row.try_get("item_id")?,
                        day_bucket: day,
                        tier: Tier::from_str(&tier).map_err(|e| PipelineError::Parse(e.to_string()))?,
                        total_score: row.try_get::<i64, _>("total_score")? as u32,
                        axis_scores: serde_json::from_str(&axis_scores)?,
                    },
                    status: DispatchStatus::from_str(&status)?,
                    detail: row.try_get("detail")?,
                })
            })
            .collect()
    }

    /// Take the per-day run lock. A lock older than `stale_after` is treated as
    /// abandoned by a crashed process and replaced.
    pub async fn try_acquire_run_lock(&self, day: NaiveDate, holder: Uuid, stale_after: Duration) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let stale_before = now.saturating_sub(i64::try_from(stale_after.as_millis()).unwrap_or(i64::MAX));

        let mut tx = self.db.begin().await?;
        let removed = sqlx::query("DELETE FROM run_locks WHERE day_bucket = ?1 AND acquired_at_ms < ?2")
            .bind(day_key(day))
            .bind(stale_before)
            .execute(&mut *tx)
            .await?;
        if removed.rows_affected() > 0 {
            warn!(day_bucket = %day, "Replaced stale run lock");
        }
        let inserted = sqlx::query(
            "INSERT INTO run_locks (day_bucket, holder, acquired_at_ms) VALUES (?1, ?2, ?3) ON CONFLICT (day_bucket) DO NOTHING",
        )
        .bind(day_key(day))
        .bind(holder.to_string())
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(inserted.rows_affected() > 0)
    }

    pub async fn release_run_lock(&self, day: NaiveDate, holder: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM run_locks WHERE day_bucket = ?1 AND holder = ?2")
            .bind(day_key(day))
            .bind(holder.to_string())
            .execute(&self.db)
            .await?;
        Ok(())
    }

    pub async fn set_run_status(
        &self,
        day: NaiveDate,
        state: RunState,
        last_completed: Option<CheckpointStage>,
        detail: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO runs (day_bucket, state, last_completed, detail, updated_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (day_bucket) DO UPDATE SET
                state = EXCLUDED.state,
                last_completed = EXCLUDED.last_completed,
                detail = EXCLUDED.detail,
                updated_at_ms = EXCLUDED.updated_at_ms
            "#,
        )
        .bind(day_key(day))
        .bind(state.as_str())
        .bind(last_completed.map(|s| s.as_str()))
        .bind(detail)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn run_status(&self, day: NaiveDate) -> Result<Option<RunStatus>> {
        let row = sqlx::query("SELECT * FROM runs WHERE day_bucket = ?1")
            .bind(day_key(day))
            .fetch_optional(&self.db)
            .await?;
        match row {
            Some(r) => {
                let state: String = r.try_get("state")?;
                let last_completed: Option<String> = r.try_get("last_completed")?;
                Ok(Some(RunStatus {
                    day_bucket: day,
                    state: RunState::from_str(&state)?,
                    last_completed: last_completed.as_deref().map(CheckpointStage::from_str).transpose()?,
                    detail: r.try_get("detail")?,
                    updated_at_ms: r.try_get("updated_at_ms")?,
                }))
            }
            None => Ok(None),
        }
    }
}

fn item_from_row(row: &SqliteRow) -> Result<Item> {
    let category: String = row.try_get("category")?;
    let authors: String = row.try_get("authors")?;
    Ok(Item {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        abstract_text: row.try_get("abstract")?,
        category: Category::from_str(&category).map_err(|e| PipelineError::Parse(e.to_string()))?,
        published_at: from_millis(row.try_get("published_at_ms")?)?,
        authors: serde_json::from_str(&authors)?,
        pdf_url: row.try_get("pdf_url")?,
    })
}

fn score_from_row(row: &SqliteRow) -> Result<ScoreRecord> {
    let stage: String = row.try_get("stage")?;
    let axis_scores: String = row.try_get("axis_scores")?;
    let tier: Option<String> = row.try_get("tier")?;
    let rank: Option<i64> = row.try_get("rank")?;
    // total_score is a query convenience only; the record recomputes it from axis_scores.
    Ok(ScoreRecord {
        item_id: row.try_get("item_id")?,
        stage: Stage::from_str(&stage).map_err(|e| PipelineError::Parse(e.to_string()))?,
        axis_scores: serde_json::from_str(&axis_scores)?,
        rank: rank.map(|r| r as u32),
        tier: tier
            .as_deref()
            .map(Tier::from_str)
            .transpose()
            .map_err(|e| PipelineError::Parse(e.to_string()))?,
        scored_at: from_millis(row.try_get("scored_at_ms")?)?,
    })
}
