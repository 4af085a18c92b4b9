use anyhow::Result;
use sqlx::postgres::PgRow;
use sqlx::Row;
use std::str::FromStr;

use crawlcorpus_core::{
    Document, FrontierEntry, FrontierState, Job, JobConfigParams, JobState, SiteStatus,
};

pub fn row_to_job(row: &PgRow) -> Result<Job> {
    Ok(Job {
        id: row.try_get("id")?,
        access_token_hash: row.try_get("access_token_hash")?,
        config: JobConfigParams {
            seed_url: row.try_get("seed_url")?,
            allowed_host: row.try_get("allowed_host")?,
            max_pages: row.try_get::<i64, _>("max_pages")? as u64,
            timeout_seconds: row.try_get::<i64, _>("timeout_seconds")? as u64,
            ignore_path_prefixes: row.try_get("ignore_path_prefixes")?,
            force_js: row.try_get("force_js")?,
        },
        state: JobState::from_str(row.try_get::<String, _>("state")?.as_str())
            .map_err(|e| anyhow::anyhow!(e.to_string()))?,
        pages_fetched: row.try_get::<i64, _>("pages_fetched")? as u64,
        pages_exported: row.try_get::<i64, _>("pages_exported")? as u64,
        errors_count: row.try_get::<i64, _>("errors_count")? as u64,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        expires_at: row.try_get("expires_at")?,
        heartbeat_at: row.try_get("heartbeat_at")?,
        last_progress_at: row.try_get("last_progress_at")?,
        restart_count: row.try_get("restart_count")?,
        site_status: SiteStatus::from_str(row.try_get::<String, _>("site_status")?.as_str())
            .map_err(|e| anyhow::anyhow!(e.to_string()))?,
        block_evidence: row.try_get("block_evidence")?,
        last_error: row.try_get("last_error")?,
        cancel_requested: row.try_get("cancel_requested")?,
    })
}

pub fn row_to_frontier_entry(row: &PgRow) -> Result<FrontierEntry> {
    Ok(FrontierEntry {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        url: row.try_get("url")?,
        canonical_url: row.try_get("canonical_url")?,
        state: FrontierState::from_str(row.try_get::<String, _>("state")?.as_str())
            .map_err(|e| anyhow::anyhow!(e.to_string()))?,
        depth: row.try_get::<i32, _>("depth")? as u32,
        priority: row.try_get("priority")?,
        discovered_at: row.try_get("discovered_at")?,
        leased_at: row.try_get("leased_at")?,
        leased_by: row.try_get("leased_by")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
        retry_count: row.try_get::<i32, _>("retry_count")? as u32,
        last_error: row.try_get("last_error")?,
        last_status_code: row.try_get("last_status_code")?,
        earliest_visible_at: row.try_get("earliest_visible_at")?,
        fetched_at: row.try_get("fetched_at")?,
        parsed_at: row.try_get("parsed_at")?,
        stored_at: row.try_get("stored_at")?,
    })
}

pub fn row_to_document(row: &PgRow) -> Result<Document> {
    Ok(Document {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        content_hash: row.try_get("content_hash")?,
        title_hash: row.try_get("title_hash")?,
        primary_url: row.try_get("primary_url")?,
        primary_canonical: row.try_get("primary_canonical")?,
        title: row.try_get("title")?,
        language: row.try_get("language")?,
        doc_type: row.try_get("doc_type")?,
        quality_score: row.try_get("quality_score")?,
        quality_passed: row.try_get("quality_passed")?,
        first_seen_at: row.try_get("first_seen_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
        version: row.try_get("version")?,
    })
}
