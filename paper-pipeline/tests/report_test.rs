mod common;

use common::{day, item, memory_store};
use paper_pipeline::dispatch::handoff_path;
use paper_pipeline::report::items_csv;
use paper_pipeline::{
    export_day, DispatchRecord, DispatchStatus, Generator, ItemError, ItemPhase, JsonlHandoff, Result, ScoreRecord,
    Stage, Tier,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

fn temp_dir() -> PathBuf {
    std::env::temp_dir().join(format!("paper-pipeline-{}", Uuid::new_v4()))
}

fn record(id: &str, tier: Tier, total: u32) -> DispatchRecord {
    DispatchRecord {
        item_id: id.to_string(),
        day_bucket: day(),
        tier,
        total_score: total,
        axis_scores: BTreeMap::from([("clickbait_potential".to_string(), total)]),
    }
}

#[tokio::test]
async fn test_jsonl_handoff_appends_one_line_per_record() -> Result<()> {
    let dir = temp_dir();
    let handoff = JsonlHandoff::new(&dir);
    let first = record("2503.00001", Tier::AdoptHigh, 85);
    let second = record("2503.00002", Tier::AdoptMid, 70);

    handoff.dispatch(&first).await.unwrap();
    handoff.dispatch(&second).await.unwrap();

    let path = handoff_path(&dir, &first);
    assert_eq!(path, dir.join("2025-03").join("handoff").join("dispatch_20250314.jsonl"));
    assert_eq!(handoff.queue_path(&second), path);

    let content = tokio::fs::read_to_string(&path).await?;
    let lines: Vec<DispatchRecord> = content
        .lines()
        .map(|line| serde_json::from_str(line))
        .collect::<std::result::Result<_, _>>()?;
    assert_eq!(lines, vec![first, second]);

    tokio::fs::remove_dir_all(&dir).await?;
    Ok(())
}

#[tokio::test]
async fn test_export_day_writes_artifacts_and_summary() -> Result<()> {
    let store = memory_store().await;
    for (id, minutes) in [("a", 1), ("b", 2), ("c", 3)] {
        store.ingest(&item(id, minutes), day()).await?;
    }
    for (id, usefulness) in [("a", 9), ("b", 7), ("c", 2)] {
        let axes = BTreeMap::from([("usefulness".to_string(), usefulness)]);
        store.record_score(day(), &ScoreRecord::new(id, Stage::Screening, axes)).await?;
    }
    store
        .assign_screening_ranks(
            day(),
            &[
                ("a".to_string(), 1, None),
                ("b".to_string(), 2, None),
                ("c".to_string(), 3, Some(Tier::Skip)),
            ],
        )
        .await?;
    let mut adopted = ScoreRecord::new("a", Stage::Selection, BTreeMap::from([("life_impact".to_string(), 82)]));
    adopted.tier = Some(Tier::AdoptHigh);
    store.record_score(day(), &adopted).await?;
    store
        .record_failure(
            day(),
            &ItemError {
                item_id: "b".to_string(),
                phase: ItemPhase::Selection,
                message: "oracle timed out".to_string(),
                attempts: 3,
            },
        )
        .await?;
    store
        .record_dispatch(&record("a", Tier::AdoptHigh, 82), DispatchStatus::Delivered, None)
        .await?;

    let dir = temp_dir();
    let files = export_day(&store, day(), &dir).await?;
    assert_eq!(files.summary, dir.join("2025-03").join("summary_20250314.md"));

    let items: serde_json::Value = serde_json::from_slice(&tokio::fs::read(&files.items).await?)?;
    assert_eq!(items.as_array().map(Vec::len), Some(3));

    let screening: serde_json::Value = serde_json::from_slice(&tokio::fs::read(&files.screening).await?)?;
    let ranked: Vec<&str> = screening
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|e| e["item_id"].as_str())
        .collect();
    assert_eq!(ranked, vec!["a", "b", "c"]);
    assert_eq!(screening[2]["tier"], "SKIP");

    let selection: serde_json::Value = serde_json::from_slice(&tokio::fs::read(&files.selection).await?)?;
    assert_eq!(selection[0]["total_score"], 82);
    assert_eq!(selection[0]["title"], "Paper a");

    let screening_csv = tokio::fs::read_to_string(&files.screening_csv).await?;
    let screening_rows: Vec<&str> = screening_csv.trim_start_matches('\u{feff}').lines().collect();
    assert!(screening_csv.starts_with('\u{feff}'));
    assert_eq!(
        screening_rows,
        vec![
            "item_id,title,rank,tier,total_score,usefulness",
            "a,Paper a,1,,9,9",
            "b,Paper b,2,,7,7",
            "c,Paper c,3,SKIP,2,2",
        ]
    );

    let selection_csv = tokio::fs::read_to_string(&files.selection_csv).await?;
    let selection_rows: Vec<&str> = selection_csv.trim_start_matches('\u{feff}').lines().collect();
    assert_eq!(
        selection_rows,
        vec!["item_id,title,rank,tier,total_score,life_impact", "a,Paper a,,ADOPT_HIGH,82,82"]
    );
    assert_eq!(files.items_csv, dir.join("2025-03").join("items_20250314.csv"));

    let summary = tokio::fs::read_to_string(&files.summary).await?;
    assert!(summary.contains("# Paper pipeline summary 2025-03-14"));
    assert!(summary.contains("| Kept after screening | 2 |"));
    assert!(summary.contains("| ADOPT_HIGH | 1 |"));
    assert!(summary.contains("| Dispatched | 1 / 1 |"));
    assert!(summary.contains("1. **Paper a** (ADOPT_HIGH, 82 pts) `a`"));
    assert!(summary.contains("`b` during selection after 3 attempt(s): oracle timed out"));

    tokio::fs::remove_dir_all(&dir).await?;
    Ok(())
}

#[test]
fn test_items_csv_quotes_fields_and_joins_authors() -> Result<()> {
    let mut paper = item("2503.00001", 0);
    paper.title = "Faster, \"smarter\" agents".to_string();
    paper.authors = vec!["Ada Lovelace".to_string(), "Alan Turing".to_string()];
    paper.pdf_url = None;

    let bytes = items_csv(&[paper])?;
    assert!(bytes.starts_with(&[0xEF, 0xBB, 0xBF]));
    let text = String::from_utf8(bytes[3..].to_vec()).unwrap();
    let rows: Vec<&str> = text.lines().collect();
    assert_eq!(rows[0], "item_id,title,category,published_at,authors,pdf_url,abstract");
    assert!(
        rows[1].starts_with("2503.00001,\"Faster, \"\"smarter\"\" agents\",cs.AI,"),
        "{}",
        rows[1]
    );
    assert!(rows[1].contains(",Ada Lovelace / Alan Turing,,"), "{}", rows[1]);
    Ok(())
}
