use crate::types::{DispatchRecord, Generator};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

/// Appends each dispatched record as one JSON line to
/// `<output_dir>/<YYYY-MM>/handoff/dispatch_<YYYYMMDD>.jsonl`, the queue read
/// by the translation, script and rendering tools.
pub struct JsonlHandoff {
    output_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlHandoff {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn queue_path(&self, record: &DispatchRecord) -> PathBuf {
        handoff_path(&self.output_dir, record)
    }
}

pub fn handoff_path(output_dir: &Path, record: &DispatchRecord) -> PathBuf {
    output_dir
        .join(record.day_bucket.format("%Y-%m").to_string())
        .join("handoff")
        .join(format!("dispatch_{}.jsonl", record.day_bucket.format("%Y%m%d")))
}

#[async_trait]
impl Generator for JsonlHandoff {
    fn generator_name(&self) -> String {
        "jsonl_handoff".to_string()
    }

    async fn dispatch(&self, record: &DispatchRecord) -> anyhow::Result<()> {
        let path = self.queue_path(record);
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Logs each record and delivers nowhere. Used for dry runs.
pub struct LogGenerator;

#[async_trait]
impl Generator for LogGenerator {
    fn generator_name(&self) -> String {
        "log".to_string()
    }

    async fn dispatch(&self, record: &DispatchRecord) -> anyhow::Result<()> {
        info!(
            item_id = %record.item_id,
            tier = %record.tier,
            total_score = record.total_score,
            "Dry run dispatch"
        );
        Ok(())
    }
}
