use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// §4.1 job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Finalizing,
    Done,
    Failed,
    Cancelled,
    Expired,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Finalizing => "finalizing",
            JobState::Done => "done",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
            JobState::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Done | JobState::Failed | JobState::Cancelled | JobState::Expired
        )
    }

    /// Returns whether `self -> next` is an allowed edge per §4.1's DAG.
    /// `expired` is reachable from any non-terminal state regardless of this table —
    /// callers check TTL separately (see the Open Question in DESIGN.md).
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Running, Finalizing)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Finalizing, Done)
                | (Finalizing, Cancelled)
                | (Finalizing, Failed)
        )
    }
}

impl std::str::FromStr for JobState {
    type Err = crate::error::CrawlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "queued" => JobState::Queued,
            "running" => JobState::Running,
            "finalizing" => JobState::Finalizing,
            "done" => JobState::Done,
            "failed" => JobState::Failed,
            "cancelled" => JobState::Cancelled,
            "expired" => JobState::Expired,
            other => {
                return Err(crate::error::CrawlError::Config(format!(
                    "unknown job state: {other}"
                )))
            }
        })
    }
}

/// §3 FrontierEntry states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrontierState {
    Queued,
    Fetching,
    Fetched,
    Parsed,
    Stored,
    Failed,
    Skipped,
}

impl FrontierState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrontierState::Queued => "queued",
            FrontierState::Fetching => "fetching",
            FrontierState::Fetched => "fetched",
            FrontierState::Parsed => "parsed",
            FrontierState::Stored => "stored",
            FrontierState::Failed => "failed",
            FrontierState::Skipped => "skipped",
        }
    }
}

impl std::str::FromStr for FrontierState {
    type Err = crate::error::CrawlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "queued" => FrontierState::Queued,
            "fetching" => FrontierState::Fetching,
            "fetched" => FrontierState::Fetched,
            "parsed" => FrontierState::Parsed,
            "stored" => FrontierState::Stored,
            "failed" => FrontierState::Failed,
            "skipped" => FrontierState::Skipped,
            other => {
                return Err(crate::error::CrawlError::Config(format!(
                    "unknown frontier state: {other}"
                )))
            }
        })
    }
}

/// §3 DocumentURL alias reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AliasReason {
    Canonical,
    ContentHash,
    Redirect,
    LanguageVariant,
}

impl AliasReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AliasReason::Canonical => "canonical",
            AliasReason::ContentHash => "content_hash",
            AliasReason::Redirect => "redirect",
            AliasReason::LanguageVariant => "language_variant",
        }
    }
}

/// §4.4.4 derived site status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SiteStatus {
    #[default]
    Normal,
    Throttled,
    Blocked,
    LoginRequired,
    SwitchedToJs,
}

impl SiteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SiteStatus::Normal => "normal",
            SiteStatus::Throttled => "throttled",
            SiteStatus::Blocked => "blocked",
            SiteStatus::LoginRequired => "login_required",
            SiteStatus::SwitchedToJs => "switched_to_js",
        }
    }
}

impl std::str::FromStr for SiteStatus {
    type Err = crate::error::CrawlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "normal" => SiteStatus::Normal,
            "throttled" => SiteStatus::Throttled,
            "blocked" => SiteStatus::Blocked,
            "login_required" => SiteStatus::LoginRequired,
            "switched_to_js" => SiteStatus::SwitchedToJs,
            other => {
                return Err(crate::error::CrawlError::Config(format!(
                    "unknown site status: {other}"
                )))
            }
        })
    }
}

/// §4.4.3 quality gate verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityVerdict {
    Pass,
    Marginal,
    Fail,
}

/// Immutable creation-time configuration for a job (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfigParams {
    pub seed_url: String,
    pub allowed_host: String,
    pub max_pages: u64,
    pub timeout_seconds: u64,
    pub ignore_path_prefixes: Vec<String>,
    pub force_js: bool,
}

/// §3 Job — one crawl instance, persisted row-for-row in the Store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub access_token_hash: String,
    pub config: JobConfigParams,
    pub state: JobState,
    pub pages_fetched: u64,
    pub pages_exported: u64,
    pub errors_count: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub last_progress_at: Option<DateTime<Utc>>,
    pub restart_count: i32,
    pub site_status: SiteStatus,
    pub block_evidence: Option<serde_json::Value>,
    pub last_error: Option<String>,
    pub cancel_requested: bool,
}

/// §3 FrontierEntry — one pending/completed URL for one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontierEntry {
    pub id: Uuid,
    pub job_id: Uuid,
    pub url: String,
    pub canonical_url: String,
    pub state: FrontierState,
    pub depth: u32,
    pub priority: f64,
    pub discovered_at: DateTime<Utc>,
    pub leased_at: Option<DateTime<Utc>>,
    pub leased_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub last_status_code: Option<i32>,
    pub earliest_visible_at: DateTime<Utc>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub parsed_at: Option<DateTime<Utc>>,
    pub stored_at: Option<DateTime<Utc>>,
}

pub const MAX_RETRIES: u32 = 3;

/// §3 Document — a deduplicated piece of content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub job_id: Uuid,
    pub content_hash: String,
    pub title_hash: Option<String>,
    pub primary_url: String,
    pub primary_canonical: String,
    pub title: Option<String>,
    pub language: Option<String>,
    pub doc_type: String,
    pub quality_score: f64,
    pub quality_passed: bool,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub version: i32,
}

/// §3 DocumentURL (alias).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentUrl {
    pub document_id: Uuid,
    pub url: String,
    pub canonical_url: String,
    pub reason: AliasReason,
}

/// §3 JobEvent — append-only log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub id: i64,
    pub job_id: Uuid,
    pub level: String,
    pub event: String,
    pub data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Registered output artifact, written by the Finalizer (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobArtifact {
    pub id: i64,
    pub job_id: Uuid,
    pub path: String,
    pub byte_size: i64,
    pub sha256: String,
    pub created_at: DateTime<Utc>,
}

/// One line of `pages.raw.jsonl` (§6), emitted incrementally as the crawl runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPageRecord {
    pub url: String,
    pub canonical_url: String,
    pub status_code: u16,
    pub depth: u32,
    pub title: Option<String>,
    pub text: String,
    pub outlinks: Vec<String>,
    pub extracted_at: DateTime<Utc>,
    pub quality_score: f64,
    pub quality_passed: bool,
    pub content_hash: String,
}

/// One line of `pages.jsonl` (§6) — a deduplicated record with aliases attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedPageRecord {
    #[serde(flatten)]
    pub page: RawPageRecord,
    pub url_aliases: Vec<String>,
}

/// The job wire shape consumed by the (out-of-scope) HTTP control plane / UI (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: Uuid,
    pub state: String,
    pub start_url: String,
    pub allowed_host: String,
    pub max_pages: u64,
    pub pages_fetched: u64,
    pub pages_exported: u64,
    pub errors_count: u64,
    pub elapsed_seconds: Option<i64>,
    pub site_status: String,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub download_url: Option<String>,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        let elapsed_seconds = job.started_at.map(|started| {
            let end = job.finished_at.unwrap_or_else(Utc::now);
            (end - started).num_seconds()
        });
        let download_url = matches!(job.state, JobState::Done | JobState::Cancelled)
            .then(|| format!("/jobs/{}/download", job.id));
        JobView {
            job_id: job.id,
            state: job.state.as_str().to_string(),
            start_url: job.config.seed_url.clone(),
            allowed_host: job.config.allowed_host.clone(),
            max_pages: job.config.max_pages,
            pages_fetched: job.pages_fetched,
            pages_exported: job.pages_exported,
            errors_count: job.errors_count,
            elapsed_seconds,
            site_status: job.site_status.as_str().to_string(),
            last_error: job.last_error.clone(),
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            expires_at: job.expires_at,
            download_url,
        }
    }
}

/// §4.5 summary.json shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub total_fetched: u64,
    pub total_exported: u64,
    pub total_errors: u64,
    pub site_status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_seconds: i64,
    pub status_code_histogram: HashMap<String, u64>,
    pub top_error_types: Vec<(String, u64)>,
}
