use std::path::Path;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crawlcorpus_core::RawPageRecord;

/// Appends `pages.raw.jsonl` during the crawl. The Engine is the sole writer
/// for a given job (§5) — a single mutex here just serializes concurrent
/// fetch workers within this process, it isn't a cross-process lock.
pub struct RawPageWriter {
    file: Mutex<File>,
}

impl RawPageWriter {
    pub async fn create(output_dir: &Path, job_id: uuid::Uuid) -> std::io::Result<Self> {
        let job_dir = output_dir.join(job_id.to_string());
        fs::create_dir_all(&job_dir).await?;
        let path = job_dir.join("pages.raw.jsonl");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self { file: Mutex::new(file) })
    }

    pub async fn append(&self, record: &RawPageRecord) -> std::io::Result<()> {
        let mut line = serde_json::to_string(record).expect("RawPageRecord always serializes");
        line.push('\n');
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }
}
