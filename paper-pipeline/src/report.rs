use crate::store::ItemStore;
use crate::types::{DispatchEntry, DispatchStatus, Item, ItemError, Result, ScoreRecord, Stage, Tier};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::info;

const SUMMARY_TOP: usize = 10;
/// Spreadsheet tools read the CSV exports as UTF-8 only with this prefix.
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";
const AUTHOR_SEPARATOR: &str = " / ";

#[derive(Debug, Clone, Serialize)]
pub struct ScoredEntry<'a> {
    pub item_id: &'a str,
    pub title: &'a str,
    pub rank: Option<u32>,
    pub tier: Option<Tier>,
    pub total_score: u32,
    pub axis_scores: &'a BTreeMap<String, u32>,
}

/// Files written by [`export_day`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedFiles {
    pub items: PathBuf,
    pub screening: PathBuf,
    pub selection: PathBuf,
    pub items_csv: PathBuf,
    pub screening_csv: PathBuf,
    pub selection_csv: PathBuf,
    pub summary: PathBuf,
}

/// Write the day's items, screening and selection results as JSON and CSV
/// plus a markdown summary under `<dir>/<YYYY-MM>/`.
pub async fn export_day(store: &ItemStore, day: NaiveDate, dir: &Path) -> Result<ExportedFiles> {
    let items = store.list(day).await?;
    let screening = store.score_records(day, Stage::Screening).await?;
    let selection = store.score_records(day, Stage::Selection).await?;
    let failures = store.failures(day).await?;
    let dispatches = store.dispatches(day).await?;

    let titles: HashMap<&str, &str> = items.iter().map(|i| (i.id.as_str(), i.title.as_str())).collect();
    let screening_order = by_screening_rank(&screening);
    let screening_entries = entries(&screening_order, &screening, &titles);
    let selection_entries = entries(&screening_order, &selection, &titles);

    let month_dir = dir.join(day.format("%Y-%m").to_string());
    tokio::fs::create_dir_all(&month_dir).await?;
    let stamp = day.format("%Y%m%d").to_string();
    let files = ExportedFiles {
        items: month_dir.join(format!("items_{}.json", stamp)),
        screening: month_dir.join(format!("screening_{}.json", stamp)),
        selection: month_dir.join(format!("selection_{}.json", stamp)),
        items_csv: month_dir.join(format!("items_{}.csv", stamp)),
        screening_csv: month_dir.join(format!("screening_{}.csv", stamp)),
        selection_csv: month_dir.join(format!("selection_{}.csv", stamp)),
        summary: month_dir.join(format!("summary_{}.md", stamp)),
    };

    tokio::fs::write(&files.items, serde_json::to_vec_pretty(&items)?).await?;
    tokio::fs::write(&files.screening, serde_json::to_vec_pretty(&screening_entries)?).await?;
    tokio::fs::write(&files.selection, serde_json::to_vec_pretty(&selection_entries)?).await?;
    tokio::fs::write(&files.items_csv, items_csv(&items)?).await?;
    tokio::fs::write(&files.screening_csv, entries_csv(&screening_entries)?).await?;
    tokio::fs::write(&files.selection_csv, entries_csv(&selection_entries)?).await?;
    let summary = render_summary(day, &items, &screening_entries, &selection_entries, &failures, &dispatches);
    tokio::fs::write(&files.summary, summary).await?;

    info!(day_bucket = %day, dir = %month_dir.display(), "Exported day artifacts");
    Ok(files)
}

/// Item ids in screening rank order; unranked records go last by id.
fn by_screening_rank(screening: &BTreeMap<String, ScoreRecord>) -> Vec<&str> {
    let mut ids: Vec<(&str, Option<u32>)> = screening.values().map(|r| (r.item_id.as_str(), r.rank)).collect();
    ids.sort_by_key(|(id, rank)| (rank.unwrap_or(u32::MAX), *id));
    ids.into_iter().map(|(id, _)| id).collect()
}

fn entries<'a>(
    order: &[&'a str],
    records: &'a BTreeMap<String, ScoreRecord>,
    titles: &HashMap<&'a str, &'a str>,
) -> Vec<ScoredEntry<'a>> {
    order
        .iter()
        .filter_map(|id| records.get(*id))
        .map(|r| ScoredEntry {
            item_id: &r.item_id,
            title: titles.get(r.item_id.as_str()).copied().unwrap_or(""),
            rank: r.rank,
            tier: r.tier,
            total_score: r.total_score(),
            axis_scores: &r.axis_scores,
        })
        .collect()
}

/// Paper metadata, one row per item. Authors are joined with " / ".
pub fn items_csv(items: &[Item]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(UTF8_BOM.to_vec());
    writer.write_record(["item_id", "title", "category", "published_at", "authors", "pdf_url", "abstract"])?;
    for item in items {
        writer.write_record([
            item.id.as_str(),
            item.title.as_str(),
            item.category.as_str(),
            item.published_at.to_rfc3339().as_str(),
            item.authors.join(AUTHOR_SEPARATOR).as_str(),
            item.pdf_url.as_deref().unwrap_or(""),
            item.abstract_text.as_str(),
        ])?;
    }
    finish_csv(writer)
}

/// Scored entries in the given order, one column per axis seen in any entry.
pub fn entries_csv(entries: &[ScoredEntry<'_>]) -> Result<Vec<u8>> {
    let axes: BTreeSet<&str> = entries
        .iter()
        .flat_map(|e| e.axis_scores.keys().map(String::as_str))
        .collect();

    let mut writer = csv::Writer::from_writer(UTF8_BOM.to_vec());
    let mut header = vec!["item_id", "title", "rank", "tier", "total_score"];
    header.extend(axes.iter().copied());
    writer.write_record(&header)?;

    for entry in entries {
        let mut row = vec![
            entry.item_id.to_string(),
            entry.title.to_string(),
            entry.rank.map(|r| r.to_string()).unwrap_or_default(),
            entry.tier.map(|t| t.as_str().to_string()).unwrap_or_default(),
            entry.total_score.to_string(),
        ];
        row.extend(
            axes.iter()
                .map(|axis| entry.axis_scores.get(*axis).map(|v| v.to_string()).unwrap_or_default()),
        );
        writer.write_record(&row)?;
    }
    finish_csv(writer)
}

fn finish_csv(writer: csv::Writer<Vec<u8>>) -> Result<Vec<u8>> {
    writer.into_inner().map_err(|e| e.into_error().into())
}

pub fn render_summary(
    day: NaiveDate,
    items: &[Item],
    screening: &[ScoredEntry<'_>],
    selection: &[ScoredEntry<'_>],
    failures: &[ItemError],
    dispatches: &[DispatchEntry],
) -> String {
    let kept = screening.iter().filter(|e| e.rank.is_some() && e.tier.is_none()).count();
    let tier_count = |tier: Tier| selection.iter().filter(|e| e.tier == Some(tier)).count();
    let delivered = dispatches.iter().filter(|d| d.status == DispatchStatus::Delivered).count();

    let mut lines = vec![
        format!("# Paper pipeline summary {}", day.format("%Y-%m-%d")),
        String::new(),
        "| Stage | Count |".to_string(),
        "|---|---|".to_string(),
        format!("| Ingested | {} |", items.len()),
        format!("| Screened | {} |", screening.len()),
        format!("| Kept after screening | {} |", kept),
        format!("| Selection scored | {} |", selection.len()),
        format!("| ADOPT_HIGH | {} |", tier_count(Tier::AdoptHigh)),
        format!("| ADOPT_MID | {} |", tier_count(Tier::AdoptMid)),
        format!("| SKIP | {} |", tier_count(Tier::Skip)),
        format!("| Dispatched | {} / {} |", delivered, dispatches.len()),
        format!("| Failures | {} |", failures.len()),
    ];

    let mut adopted: Vec<&ScoredEntry<'_>> = selection.iter().filter(|e| e.tier.is_some_and(|t| t.is_adopted())).collect();
    adopted.sort_by(|a, b| b.total_score.cmp(&a.total_score));
    if !adopted.is_empty() {
        lines.extend([String::new(), "## Top selected".to_string(), String::new()]);
        for (index, entry) in adopted.iter().take(SUMMARY_TOP).enumerate() {
            let tier = entry.tier.map(|t| t.as_str()).unwrap_or("-");
            lines.push(format!(
                "{}. **{}** ({}, {} pts) `{}`",
                index + 1,
                entry.title,
                tier,
                entry.total_score,
                entry.item_id
            ));
            let axes: Vec<String> = entry.axis_scores.iter().map(|(k, v)| format!("{} {}", k, v)).collect();
            lines.push(format!("   - {}", axes.join(", ")));
        }
    }

    if !failures.is_empty() {
        lines.extend([String::new(), "## Failures".to_string(), String::new()]);
        lines.extend(failures.iter().map(|failure| {
            format!(
                "- `{}` during {} after {} attempt(s): {}",
                failure.item_id,
                failure.phase.as_str(),
                failure.attempts,
                failure.message
            )
        }));
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}
