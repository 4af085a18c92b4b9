//! Post-crawl pass (§4.5): dedup, write `pages.jsonl`/`summary.json`/`kb/*.md`,
//! register artifacts, set the job's terminal state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};

use crawlcorpus_core::{ExportedPageRecord, Job, JobState, JobSummary, RawPageRecord};
use crawlcorpus_store::{StateFields, Store};

pub async fn finalize(store: &Store, output_dir: &Path, job: &Job) -> anyhow::Result<()> {
    let job_dir = output_dir.join(job.id.to_string());
    match run(store, &job_dir, job).await {
        Ok(()) => {
            let terminal = if job.cancel_requested { JobState::Cancelled } else { JobState::Done };
            store.set_state(job.id, terminal, StateFields::default()).await?;
            store.log_event(job.id, "info", "job_finalized", None).await?;
        }
        Err(e) => {
            let fields = StateFields { last_error: Some(format!("finalize: {e}")), ..Default::default() };
            store.set_state(job.id, JobState::Failed, fields).await?;
            store.log_event(job.id, "error", "finalize_failed", None).await?;
            return Err(e);
        }
    }
    Ok(())
}

async fn run(store: &Store, job_dir: &Path, job: &Job) -> anyhow::Result<()> {
    fs::create_dir_all(job_dir.join("kb")).await?;

    let raw_records = read_raw_records(&job_dir.join("pages.raw.jsonl")).await?;
    let mut by_hash: HashMap<String, Vec<RawPageRecord>> = HashMap::new();
    for record in raw_records {
        by_hash.entry(record.content_hash.clone()).or_default().push(record);
    }

    let documents = store.list_documents(job.id).await?;
    let mut exported = Vec::with_capacity(documents.len());
    for doc in &documents {
        let Some(group) = by_hash.get(&doc.content_hash) else {
            continue;
        };
        let primary = group
            .iter()
            .find(|r| r.canonical_url == doc.primary_canonical)
            .or_else(|| group.first())
            .cloned();
        let Some(primary) = primary else { continue };
        let url_aliases: Vec<String> = group
            .iter()
            .map(|r| r.url.clone())
            .filter(|u| u != &primary.url)
            .collect();
        exported.push(ExportedPageRecord { page: primary, url_aliases });
    }

    write_jsonl(&job_dir.join("pages.jsonl"), &exported).await?;

    let summary = build_summary(store, job, &by_hash, documents.len() as u64).await?;
    let summary_path = job_dir.join("summary.json");
    fs::write(&summary_path, serde_json::to_vec_pretty(&summary)?).await?;

    for record in &exported {
        let slug = kb_slug(&record.page.content_hash, record.page.title.as_deref());
        let body = render_kb_markdown(record);
        fs::write(job_dir.join("kb").join(format!("{slug}.md")), body).await?;
    }

    register_artifacts(store, job.id, job_dir, &exported).await?;

    Ok(())
}

async fn read_raw_records(path: &Path) -> anyhow::Result<Vec<RawPageRecord>> {
    let Ok(file) = fs::File::open(path).await else {
        return Ok(Vec::new());
    };
    let mut lines = BufReader::new(file).lines();
    let mut records = Vec::new();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }
    Ok(records)
}

async fn write_jsonl(path: &Path, records: &[ExportedPageRecord]) -> anyhow::Result<()> {
    let mut out = String::new();
    for record in records {
        out.push_str(&serde_json::to_string(record)?);
        out.push('\n');
    }
    fs::write(path, out).await?;
    Ok(())
}

async fn build_summary(
    store: &Store,
    job: &Job,
    by_hash: &HashMap<String, Vec<RawPageRecord>>,
    total_exported: u64,
) -> anyhow::Result<JobSummary> {
    let mut status_code_histogram: HashMap<String, u64> = HashMap::new();
    for records in by_hash.values() {
        for r in records {
            *status_code_histogram.entry(r.status_code.to_string()).or_insert(0) += 1;
        }
    }

    let failed = store.list_failed_entries(job.id).await?;
    let mut error_counts: HashMap<String, u64> = HashMap::new();
    for entry in &failed {
        let key = entry.last_error.clone().unwrap_or_else(|| "unknown_error".to_string());
        *error_counts.entry(key).or_insert(0) += 1;
    }
    let mut top_error_types: Vec<(String, u64)> = error_counts.into_iter().collect();
    top_error_types.sort_by_key(|(_, count)| std::cmp::Reverse(*count));
    top_error_types.truncate(10);

    let finished_at = job.finished_at.unwrap_or_else(Utc::now);
    let elapsed_seconds = job.started_at.map(|s| (finished_at - s).num_seconds()).unwrap_or(0);

    Ok(JobSummary {
        total_fetched: job.pages_fetched,
        total_exported,
        total_errors: job.errors_count,
        site_status: job.site_status.as_str().to_string(),
        started_at: job.started_at,
        finished_at,
        elapsed_seconds,
        status_code_histogram,
        top_error_types,
    })
}

fn kb_slug(content_hash: &str, title: Option<&str>) -> String {
    let short_hash = &content_hash[..content_hash.len().min(10)];
    let title_part = title
        .map(|t| {
            t.to_lowercase()
                .chars()
                .map(|c| if c.is_alphanumeric() { c } else { '-' })
                .collect::<String>()
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "untitled".to_string());
    let title_part: String = title_part.split('-').filter(|s| !s.is_empty()).collect::<Vec<_>>().join("-");
    format!("{title_part}-{short_hash}")
}

fn render_kb_markdown(record: &ExportedPageRecord) -> String {
    format!(
        "---\ntitle: {:?}\nurl: {:?}\ncontent_hash: {:?}\n---\n\n{}\n",
        record.page.title.clone().unwrap_or_default(),
        record.page.url,
        record.page.content_hash,
        record.page.text,
    )
}

async fn register_artifacts(
    store: &Store,
    job_id: uuid::Uuid,
    job_dir: &Path,
    exported: &[ExportedPageRecord],
) -> anyhow::Result<()> {
    let mut paths: Vec<PathBuf> = vec![job_dir.join("pages.raw.jsonl"), job_dir.join("pages.jsonl"), job_dir.join("summary.json")];
    for record in exported {
        let slug = kb_slug(&record.page.content_hash, record.page.title.as_deref());
        paths.push(job_dir.join("kb").join(format!("{slug}.md")));
    }

    for path in paths {
        let Ok(bytes) = fs::read(&path).await else {
            continue;
        };
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let sha256 = format!("{:x}", hasher.finalize());
        let rel_path = path
            .strip_prefix(job_dir.parent().unwrap_or(job_dir))
            .unwrap_or(&path)
            .to_string_lossy()
            .to_string();
        store.register_artifact(job_id, &rel_path, bytes.len() as i64, &sha256).await?;
    }
    Ok(())
}
