use crate::batch::{check_failure_fraction, score_and_persist, whole_number};
use crate::config::{SCREENING_AXIS, SCREENING_MAX, SCREENING_MIN};
use crate::oracle::OracleAdapter;
use crate::store::ItemStore;
use crate::types::{Item, ItemError, OracleResponse, Result, RubricId, RunContext, ScoreRecord, Stage, Tier};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Default)]
pub struct ScreeningOutput {
    /// Items within the cutoff, best first.
    pub kept: Vec<(Item, ScoreRecord)>,
    /// Items ranked below the cutoff; their records carry tier SKIP.
    pub dropped: Vec<(Item, ScoreRecord)>,
    pub failed: Vec<ItemError>,
    /// Records found in the store from an earlier attempt and not rescored.
    pub reused: usize,
}

/// First-pass filter: one "research usefulness" score per item, keep the top K.
pub struct ScreeningStage {
    adapter: Arc<OracleAdapter>,
    store: Arc<ItemStore>,
    max_failure_fraction: f64,
}

impl ScreeningStage {
    pub fn new(adapter: Arc<OracleAdapter>, store: Arc<ItemStore>, max_failure_fraction: f64) -> Self {
        Self {
            adapter,
            store,
            max_failure_fraction,
        }
    }

    pub async fn screen(&self, ctx: &RunContext, items: Vec<Item>, top_k: usize) -> Result<ScreeningOutput> {
        let day = ctx.day_bucket;
        let existing = self.store.score_records(day, Stage::Screening).await?;
        if existing.values().any(|r| r.rank.is_some()) {
            info!(day_bucket = %day, records = existing.len(), "Screening ranks already fixed, reusing stored ranking");
            return Ok(Self::from_ranked(items, &existing));
        }

        let pending: Vec<Item> = items.iter().filter(|i| !existing.contains_key(&i.id)).cloned().collect();

        info!(
            day_bucket = %day,
            total = items.len(),
            pending = pending.len(),
            reused = items.len() - pending.len(),
            "Screening items"
        );

        let batch = score_and_persist(
            &self.adapter,
            &self.store,
            day,
            Stage::Screening,
            RubricId::ResearchUsefulness,
            &pending,
            |item, response| ScoreRecord::new(item.id.clone(), Stage::Screening, screening_axes(response)),
        )
        .await?;

        // Ranks are only fixed once the batch is known to be healthy.
        check_failure_fraction(Stage::Screening, batch.failed.len(), batch.submitted, self.max_failure_fraction)?;

        let mut scored: Vec<(Item, ScoreRecord)> = Vec::with_capacity(items.len());
        let mut new_records: HashMap<String, ScoreRecord> =
            batch.scored.into_iter().map(|r| (r.item_id.clone(), r)).collect();
        let mut reused = 0;
        for item in items {
            if let Some(record) = existing.get(&item.id) {
                reused += 1;
                scored.push((item, record.clone()));
            } else if let Some(record) = new_records.remove(&item.id) {
                scored.push((item, record));
            }
        }

        let ranked = rank(scored, top_k);
        let ranking: Vec<(String, u32, Option<Tier>)> = ranked
            .iter()
            .map(|(item, record)| (item.id.clone(), record.rank.unwrap_or_default(), record.tier))
            .collect();
        self.store.assign_screening_ranks(day, &ranking).await?;

        // Read back so the output reflects what is durable, including ranks fixed by an earlier attempt.
        let stored = self.store.score_records(day, Stage::Screening).await?;
        let mut output = ScreeningOutput {
            failed: batch.failed,
            reused,
            ..Default::default()
        };
        for (item, record) in ranked {
            let record = stored.get(&item.id).cloned().unwrap_or(record);
            if record.tier.is_none() {
                output.kept.push((item, record));
            } else {
                output.dropped.push((item, record));
            }
        }
        output.kept.sort_by_key(|(_, r)| r.rank.unwrap_or(u32::MAX));

        info!(
            day_bucket = %day,
            kept = output.kept.len(),
            dropped = output.dropped.len(),
            failed = output.failed.len(),
            "Screening complete"
        );
        Ok(output)
    }

    /// Rebuild the stage output from a ranking fixed by an earlier attempt.
    /// Items without a ranked record are not part of that ranking and are left out.
    fn from_ranked(items: Vec<Item>, existing: &BTreeMap<String, ScoreRecord>) -> ScreeningOutput {
        let mut output = ScreeningOutput::default();
        for item in items {
            let Some(record) = existing.get(&item.id).filter(|r| r.rank.is_some()) else {
                continue;
            };
            output.reused += 1;
            if record.tier.is_none() {
                output.kept.push((item, record.clone()));
            } else {
                output.dropped.push((item, record.clone()));
            }
        }
        output.kept.sort_by_key(|(_, r)| r.rank.unwrap_or(u32::MAX));
        output.dropped.sort_by_key(|(_, r)| r.rank.unwrap_or(u32::MAX));
        output
    }
}

/// Validate the single screening axis. Anything missing, non-numeric or
/// outside 1..=10 scores 0.
pub fn screening_axes(response: &OracleResponse) -> BTreeMap<String, u32> {
    let score = match response.axis_scores.get(SCREENING_AXIS) {
        None => {
            warn!(item_id = %response.item_id, "Screening response missing '{}', scoring 0", SCREENING_AXIS);
            0
        }
        Some(value) => match whole_number(value) {
            Some(n) if (SCREENING_MIN as i64..=SCREENING_MAX as i64).contains(&n) => n as u32,
            Some(n) => {
                warn!(item_id = %response.item_id, score = n, "Screening score out of range, scoring 0");
                0
            }
            None => {
                warn!(item_id = %response.item_id, value = %value, "Screening score not an integer, scoring 0");
                0
            }
        },
    };
    BTreeMap::from([(SCREENING_AXIS.to_string(), score)])
}

/// Total descending, then published_at ascending, then id ascending.
pub fn ranking_order(a: &(Item, ScoreRecord), b: &(Item, ScoreRecord)) -> Ordering {
    b.1.total_score()
        .cmp(&a.1.total_score())
        .then_with(|| a.0.published_at.cmp(&b.0.published_at))
        .then_with(|| a.0.id.cmp(&b.0.id))
}

/// Sort and number the scored items; the first `top_k` are kept (no tier),
/// the rest get tier SKIP.
pub fn rank(mut scored: Vec<(Item, ScoreRecord)>, top_k: usize) -> Vec<(Item, ScoreRecord)> {
    scored.sort_by(ranking_order);
    for (index, (_, record)) in scored.iter_mut().enumerate() {
        record.rank = Some(index as u32 + 1);
        record.tier = if index < top_k { None } else { Some(Tier::Skip) };
    }
    scored
}
