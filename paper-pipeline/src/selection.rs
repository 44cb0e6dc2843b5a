use crate::batch::{check_failure_fraction, score_and_persist};
use crate::config::AxisWeights;
use crate::oracle::OracleAdapter;
use crate::store::ItemStore;
use crate::types::{
    Item, ItemError, ItemPhase, OracleResponse, Result, RubricId, RunContext, ScoreRecord, Stage, Tier,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct SelectionOutput {
    /// Every scored item with its tier, in screening order.
    pub records: Vec<(Item, ScoreRecord)>,
    pub failed: Vec<ItemError>,
    pub reused: usize,
}

impl SelectionOutput {
    /// Items bound for downstream generators.
    pub fn adopted(&self) -> impl Iterator<Item = &(Item, ScoreRecord)> {
        self.records.iter().filter(|(_, r)| r.is_adopted())
    }
}

/// Second-pass filter: six-axis virality score, classified into tiers.
pub struct SelectionStage {
    adapter: Arc<OracleAdapter>,
    store: Arc<ItemStore>,
    weights: AxisWeights,
    threshold: u32,
    high_bound: u32,
    max_failure_fraction: f64,
}

impl SelectionStage {
    pub fn new(
        adapter: Arc<OracleAdapter>,
        store: Arc<ItemStore>,
        weights: AxisWeights,
        threshold: u32,
        high_bound: u32,
        max_failure_fraction: f64,
    ) -> Self {
        Self {
            adapter,
            store,
            weights,
            threshold,
            high_bound,
            max_failure_fraction,
        }
    }

    /// `screened` is the kept output of screening, best first. The returned
    /// records keep that order.
    pub async fn select(&self, ctx: &RunContext, screened: Vec<(Item, ScoreRecord)>) -> Result<SelectionOutput> {
        let day = ctx.day_bucket;
        let existing = self.store.score_records(day, Stage::Selection).await?;
        let pending: Vec<Item> = screened
            .iter()
            .filter(|(item, _)| !existing.contains_key(&item.id))
            .map(|(item, _)| item.clone())
            .collect();

        info!(
            day_bucket = %day,
            total = screened.len(),
            pending = pending.len(),
            threshold = self.threshold,
            high_bound = self.high_bound,
            "Selecting items"
        );

        let batch = score_and_persist(
            &self.adapter,
            &self.store,
            day,
            Stage::Selection,
            RubricId::ShortsVirality,
            &pending,
            |item, response| self.build_record(item, response),
        )
        .await?;

        check_failure_fraction(Stage::Selection, batch.failed.len(), batch.submitted, self.max_failure_fraction)?;

        let mut fresh: HashMap<String, ScoreRecord> = batch.scored.into_iter().map(|r| (r.item_id.clone(), r)).collect();
        let mut output = SelectionOutput {
            failed: batch.failed,
            ..Default::default()
        };
        for (item, _) in screened {
            if let Some(record) = existing.get(&item.id) {
                output.reused += 1;
                output.records.push((item, record.clone()));
            } else if let Some(record) = fresh.remove(&item.id) {
                output.records.push((item, record));
            }
        }

        let high = output.records.iter().filter(|(_, r)| r.tier == Some(Tier::AdoptHigh)).count();
        let mid = output.records.iter().filter(|(_, r)| r.tier == Some(Tier::AdoptMid)).count();
        info!(
            day_bucket = %day,
            adopt_high = high,
            adopt_mid = mid,
            skip = output.records.len() - high - mid,
            failed = output.failed.len(),
            "Selection complete"
        );
        Ok(output)
    }

    /// Stage output from stored records alone, for a day whose selection has
    /// already completed. No oracle calls are made.
    pub async fn load(&self, ctx: &RunContext, screened: Vec<(Item, ScoreRecord)>) -> Result<SelectionOutput> {
        let existing = self.store.score_records(ctx.day_bucket, Stage::Selection).await?;
        let mut output = SelectionOutput::default();
        for (item, _) in screened {
            if let Some(record) = existing.get(&item.id) {
                output.reused += 1;
                output.records.push((item, record.clone()));
            }
        }
        Ok(output)
    }

    /// Selection for a day that already has a `selected` checkpoint. Items
    /// that failed selection stay failed. Kept items with neither a record nor
    /// a recorded failure (a later screening pass ranked them) are scored now.
    pub async fn resume(&self, ctx: &RunContext, screened: Vec<(Item, ScoreRecord)>) -> Result<SelectionOutput> {
        let day = ctx.day_bucket;
        let existing = self.store.score_records(day, Stage::Selection).await?;
        let failed: HashSet<String> = self
            .store
            .failures(day)
            .await?
            .into_iter()
            .filter(|f| f.phase == ItemPhase::Selection)
            .map(|f| f.item_id)
            .collect();
        let unsettled = screened
            .iter()
            .filter(|(item, _)| !existing.contains_key(&item.id) && !failed.contains(&item.id))
            .count();

        if unsettled == 0 {
            info!(day_bucket = %day, "Selection already checkpointed, loading stored records");
            return self.load(ctx, screened).await;
        }
        info!(day_bucket = %day, unsettled, "Selection checkpointed but kept items are unscored");
        let pending = screened
            .into_iter()
            .filter(|(item, _)| existing.contains_key(&item.id) || !failed.contains(&item.id))
            .collect();
        self.select(ctx, pending).await
    }

    fn build_record(&self, item: &Item, response: &OracleResponse) -> ScoreRecord {
        let axis_scores = selection_axes(response, &self.weights);
        let mut record = ScoreRecord::new(item.id.clone(), Stage::Selection, axis_scores);
        let total = record.total_score();
        let tier = Tier::classify(total, self.threshold, self.high_bound);
        debug!(item_id = %item.id, total, tier = %tier, "Classified item");
        record.tier = Some(tier);
        record
    }
}

/// Per-axis scores for the recognised axes only. A missing or non-numeric
/// axis scores 0; numeric values are rounded and clamped to `[0, max]`.
pub fn selection_axes(response: &OracleResponse, weights: &AxisWeights) -> BTreeMap<String, u32> {
    let mut scores = BTreeMap::new();
    for (axis, max) in weights.iter() {
        let score = match response.axis_scores.get(axis).map(|v| (v, v.as_f64())) {
            None => {
                warn!(item_id = %response.item_id, axis, "Selection axis missing, scoring 0");
                0
            }
            Some((value, None)) => {
                warn!(item_id = %response.item_id, axis, value = %value, "Selection axis not numeric, scoring 0");
                0
            }
            Some((_, Some(raw))) => {
                let clamped = raw.round().clamp(0.0, max as f64);
                if clamped != raw.round() {
                    warn!(item_id = %response.item_id, axis, raw, max, "Selection axis out of range, clamped");
                }
                clamped as u32
            }
        };
        scores.insert(axis.to_string(), score);
    }

    for axis in response.axis_scores.keys() {
        if weights.max_for(axis).is_none() {
            debug!(item_id = %response.item_id, axis = %axis, "Ignoring unrecognised axis");
        }
    }
    scores
}
