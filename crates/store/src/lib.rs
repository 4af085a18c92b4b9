use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use crawlcorpus_core::{
    AliasReason, CrawlError, Document, FrontierEntry, Job, JobArtifact, JobConfigParams, JobEvent,
    JobState, SiteStatus, MAX_RETRIES,
};

mod rows;
use rows::{row_to_frontier_entry, row_to_job};

/// Durable state: jobs, the URL frontier, documents, URL aliases, events and
/// artifacts. Every job/frontier mutation funnels through here so a
/// crashed/restarted worker can resume exactly where the Store left off (§4.2).
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

/// Outcome of a completed fetch+extract attempt, as recorded by `complete_url`.
#[derive(Debug, Clone)]
pub enum CompleteOutcome {
    Stored {
        status_code: u16,
    },
    Failed {
        status_code: Option<u16>,
        error: String,
    },
    Skipped {
        reason: String,
    },
}

impl Store {
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::with_pool_size(database_url, 20).await
    }

    pub async fn with_pool_size(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        info!(max_connections, "connected to postgres");
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::raw_sql(include_str!("../migrations/001_init.sql"))
            .execute(&self.pool)
            .await?;
        info!("migrations complete");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ---------------------------------------------------------------- Jobs

    pub async fn create_job(
        &self,
        config: JobConfigParams,
        access_token_hash: &str,
        expiry_hours: i64,
    ) -> Result<Job> {
        let expires_at = Utc::now() + ChronoDuration::hours(expiry_hours);
        let row = sqlx::query(
            r#"INSERT INTO jobs (access_token_hash, seed_url, allowed_host, max_pages, timeout_seconds, ignore_path_prefixes, force_js, expires_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
               RETURNING *"#,
        )
        .bind(access_token_hash)
        .bind(&config.seed_url)
        .bind(&config.allowed_host)
        .bind(config.max_pages as i64)
        .bind(config.timeout_seconds as i64)
        .bind(&config.ignore_path_prefixes)
        .bind(config.force_js)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await?;
        let job = row_to_job(&row)?;
        self.log_event(job.id, "info", "job_created", None).await?;
        Ok(job)
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_job(&r)).transpose()
    }

    /// Selects the oldest queued job, atomically sets state=running, and
    /// returns it. `FOR UPDATE SKIP LOCKED` lets multiple supervisor
    /// instances race this call safely — only one wins each row.
    pub async fn claim_next_queued_job(&self, worker_id: &str) -> Result<Option<Job>> {
        let mut tx = self.pool.begin().await?;
        let candidate = sqlx::query(
            "SELECT id FROM jobs WHERE state = 'queued' ORDER BY created_at ASC LIMIT 1 FOR UPDATE SKIP LOCKED",
        )
        .fetch_optional(&mut *tx)
        .await?;
        let Some(candidate) = candidate else {
            tx.commit().await?;
            return Ok(None);
        };
        let id: Uuid = candidate.get("id");
        let now = Utc::now();
        let row = sqlx::query(
            r#"UPDATE jobs SET state = 'running', started_at = $1, heartbeat_at = $1, last_progress_at = $1
               WHERE id = $2 RETURNING *"#,
        )
        .bind(now)
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        let job = row_to_job(&row)?;
        self.log_event(job.id, "info", "job_claimed", Some(serde_json::json!({ "worker_id": worker_id })))
            .await?;
        Ok(Some(job))
    }

    pub async fn heartbeat(
        &self,
        job_id: Uuid,
        pages_fetched: u64,
        pages_exported: u64,
        errors_count: u64,
        progressed: bool,
    ) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"UPDATE jobs SET heartbeat_at = $1, pages_fetched = $2, pages_exported = $3, errors_count = $4,
               last_progress_at = CASE WHEN $5 THEN $1 ELSE last_progress_at END
               WHERE id = $6 AND state NOT IN ('done', 'failed', 'cancelled', 'expired')"#,
        )
        .bind(now)
        .bind(pages_fetched as i64)
        .bind(pages_exported as i64)
        .bind(errors_count as i64)
        .bind(progressed)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_state(
        &self,
        job_id: Uuid,
        new_state: JobState,
        fields: StateFields,
    ) -> Result<(), CrawlError> {
        let current = self
            .get_job(job_id)
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))?
            .ok_or_else(|| CrawlError::Storage("job not found".into()))?;

        if !current.state.can_transition_to(new_state) && new_state != JobState::Expired {
            return Err(CrawlError::Storage(format!(
                "illegal transition {:?} -> {:?}",
                current.state, new_state
            )));
        }

        let finished_at = new_state.is_terminal().then(Utc::now);
        sqlx::query(
            r#"UPDATE jobs SET state = $1, finished_at = COALESCE($2, finished_at),
               site_status = COALESCE($3, site_status), last_error = COALESCE($4, last_error),
               restart_count = COALESCE($5, restart_count)
               WHERE id = $6"#,
        )
        .bind(new_state.as_str())
        .bind(finished_at)
        .bind(fields.site_status.map(|s| s.as_str().to_string()))
        .bind(fields.last_error)
        .bind(fields.restart_count)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| CrawlError::Storage(e.to_string()))?;

        self.log_event(
            job_id,
            "info",
            "state_transition",
            Some(serde_json::json!({ "from": current.state.as_str(), "to": new_state.as_str() })),
        )
        .await
        .map_err(|e| CrawlError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Reset a job to `queued` for a supervisor-driven restart, bumping restart_count.
    pub async fn requeue_for_restart(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET state = 'queued', restart_count = restart_count + 1, started_at = NULL WHERE id = $1",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn request_cancel(&self, job_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE jobs SET cancel_requested = TRUE WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        self.log_event(job_id, "info", "cancel_requested", None).await?;
        Ok(())
    }

    pub async fn list_non_terminal_jobs(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE state NOT IN ('done', 'failed', 'cancelled', 'expired')",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_job).collect::<Result<Vec<_>>>()
    }

    /// Expire any non-terminal job past its TTL, overriding running/finalizing
    /// regardless of current state (see DESIGN.md's Open Question decision).
    pub async fn expire_overdue_jobs(&self) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            r#"UPDATE jobs SET state = 'expired', finished_at = NOW()
               WHERE state NOT IN ('done', 'failed', 'cancelled', 'expired') AND expires_at <= NOW()
               RETURNING id"#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    // ----------------------------------------------------------- Frontier

    /// No-op if (job_id, canonical_url) already exists.
    pub async fn enqueue_url(
        &self,
        job_id: Uuid,
        url: &str,
        canonical_url: &str,
        depth: u32,
        priority: f64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"INSERT INTO frontier_entries (job_id, url, canonical_url, depth, priority)
               VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT (job_id, canonical_url) DO NOTHING"#,
        )
        .bind(job_id)
        .bind(url)
        .bind(canonical_url)
        .bind(depth as i32)
        .bind(priority)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Count of frontier entries still counting toward the job's page budget
    /// (queued, in-flight, or already stored) — used by admission (§4.4.1).
    pub async fn count_budgeted_entries(&self, job_id: Uuid) -> Result<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM frontier_entries WHERE job_id = $1 AND state != 'failed' AND state != 'skipped'",
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("n") as u64)
    }

    /// Atomically selects up to `batch` visible entries — state=queued with
    /// earliest_visible_at due, or state=fetching with an expired lease — and
    /// leases them to `worker_id`.
    pub async fn lease_urls(
        &self,
        job_id: Uuid,
        worker_id: &str,
        batch: i64,
        ttl: ChronoDuration,
    ) -> Result<Vec<FrontierEntry>> {
        let now = Utc::now();
        let lease_expires_at = now + ttl;
        let mut tx = self.pool.begin().await?;
        let ids = sqlx::query(
            r#"SELECT id FROM frontier_entries
               WHERE job_id = $1
                 AND ((state = 'queued' AND earliest_visible_at <= $2)
                      OR (state = 'fetching' AND lease_expires_at < $2))
               ORDER BY priority DESC, discovered_at ASC
               LIMIT $3
               FOR UPDATE SKIP LOCKED"#,
        )
        .bind(job_id)
        .bind(now)
        .bind(batch)
        .fetch_all(&mut *tx)
        .await?;
        let ids: Vec<Uuid> = ids.iter().map(|r| r.get("id")).collect();
        if ids.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"UPDATE frontier_entries SET state = 'fetching', leased_at = $1, leased_by = $2, lease_expires_at = $3
               WHERE id = ANY($4)
               RETURNING *"#,
        )
        .bind(now)
        .bind(worker_id)
        .bind(lease_expires_at)
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        rows.iter().map(row_to_frontier_entry).collect::<Result<Vec<_>>>()
    }

    /// Moves an entry to its terminal per-fetch state and records the outcome.
    pub async fn complete_url(&self, entry_id: Uuid, outcome: CompleteOutcome) -> Result<()> {
        let now = Utc::now();
        match outcome {
            CompleteOutcome::Stored { status_code } => {
                sqlx::query(
                    r#"UPDATE frontier_entries SET state = 'stored', fetched_at = $1, parsed_at = $1, stored_at = $1,
                       last_status_code = $2 WHERE id = $3"#,
                )
                .bind(now)
                .bind(status_code as i32)
                .bind(entry_id)
                .execute(&self.pool)
                .await?;
            }
            CompleteOutcome::Failed { status_code, error } => {
                sqlx::query(
                    r#"UPDATE frontier_entries SET state = 'failed', last_status_code = $1, last_error = $2
                       WHERE id = $3"#,
                )
                .bind(status_code.map(|s| s as i32))
                .bind(error)
                .bind(entry_id)
                .execute(&self.pool)
                .await?;
            }
            CompleteOutcome::Skipped { reason } => {
                sqlx::query("UPDATE frontier_entries SET state = 'skipped', last_error = $1 WHERE id = $2")
                    .bind(reason)
                    .bind(entry_id)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    /// Restore an entry to `queued` for retry, incrementing retry_count and
    /// deferring visibility by `backoff` (§4.4.5). Abandons after MAX_RETRIES.
    pub async fn retry_or_fail(
        &self,
        entry: &FrontierEntry,
        error: &str,
        status_code: Option<u16>,
        backoff: std::time::Duration,
    ) -> Result<bool> {
        if entry.retry_count >= MAX_RETRIES {
            self.complete_url(
                entry.id,
                CompleteOutcome::Failed {
                    status_code,
                    error: error.to_string(),
                },
            )
            .await?;
            return Ok(false);
        }
        let earliest_visible_at = Utc::now() + ChronoDuration::from_std(backoff).unwrap_or_default();
        sqlx::query(
            r#"UPDATE frontier_entries SET state = 'queued', retry_count = retry_count + 1,
               last_error = $1, last_status_code = $2, earliest_visible_at = $3,
               leased_at = NULL, leased_by = NULL, lease_expires_at = NULL
               WHERE id = $4"#,
        )
        .bind(error)
        .bind(status_code.map(|s| s as i32))
        .bind(earliest_visible_at)
        .bind(entry.id)
        .execute(&self.pool)
        .await?;
        Ok(true)
    }

    /// Leases whose TTL elapsed become visible again for the next `lease_urls` call.
    /// Returns how many were reclaimed.
    pub async fn expire_stale_leases(&self, job_id: Uuid) -> Result<u64> {
        let result = sqlx::query(
            r#"UPDATE frontier_entries SET state = 'queued', leased_at = NULL, leased_by = NULL, lease_expires_at = NULL
               WHERE job_id = $1 AND state = 'fetching' AND lease_expires_at < NOW()"#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Resets all non-terminal entries to `queued` (state != failed/stored) for
    /// the one-way fallback switch to the JS fetcher (§4.4.2).
    pub async fn requeue_inflight_for_fallback(&self, job_id: Uuid) -> Result<u64> {
        let result = sqlx::query(
            r#"UPDATE frontier_entries SET state = 'queued', leased_at = NULL, leased_by = NULL, lease_expires_at = NULL
               WHERE job_id = $1 AND state IN ('fetching', 'fetched', 'parsed')"#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn frontier_is_empty(&self, job_id: Uuid) -> Result<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM frontier_entries WHERE job_id = $1 AND state IN ('queued', 'fetching')",
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("n") == 0)
    }

    /// Recent completed fetches for the blocking detector (§4.4.4), most recent first.
    pub async fn recent_completed_entries(&self, job_id: Uuid, limit: i64) -> Result<Vec<FrontierEntry>> {
        let rows = sqlx::query(
            r#"SELECT * FROM frontier_entries WHERE job_id = $1 AND state IN ('stored', 'failed')
               ORDER BY COALESCE(stored_at, fetched_at) DESC LIMIT $2"#,
        )
        .bind(job_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_frontier_entry).collect::<Result<Vec<_>>>()
    }

    /// Failed frontier entries for a job, most recent first — feeds the
    /// Finalizer's top-error-types histogram (§4.5).
    pub async fn list_failed_entries(&self, job_id: Uuid) -> Result<Vec<FrontierEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM frontier_entries WHERE job_id = $1 AND state = 'failed' ORDER BY discovered_at DESC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_frontier_entry).collect::<Result<Vec<_>>>()
    }

    // ---------------------------------------------------------- Documents

    /// Deterministic: if (job_id, content_hash) exists, returns the existing
    /// document unchanged (only last_seen_at/version bump); else inserts as
    /// the primary for that hash.
    pub async fn upsert_document(&self, job_id: Uuid, new_doc: NewDocument<'_>) -> Result<(Document, bool)> {
        let NewDocument { content_hash, title_hash, primary_url, primary_canonical, title, language, quality_score, quality_passed } = new_doc;
        let mut tx = self.pool.begin().await?;
        if let Some(row) = sqlx::query("SELECT * FROM documents WHERE job_id = $1 AND content_hash = $2 FOR UPDATE")
            .bind(job_id)
            .bind(content_hash)
            .fetch_optional(&mut *tx)
            .await?
        {
            let now = Utc::now();
            let updated = sqlx::query(
                "UPDATE documents SET last_seen_at = $1, version = version + 1 WHERE id = $2 RETURNING *",
            )
            .bind(now)
            .bind(row.get::<Uuid, _>("id"))
            .fetch_one(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok((rows::row_to_document(&updated)?, false));
        }
        let row = sqlx::query(
            r#"INSERT INTO documents (job_id, content_hash, title_hash, primary_url, primary_canonical, title, language, doc_type, quality_score, quality_passed)
               VALUES ($1, $2, $3, $4, $5, $6, $7, 'html', $8, $9)
               RETURNING *"#,
        )
        .bind(job_id)
        .bind(content_hash)
        .bind(title_hash)
        .bind(primary_url)
        .bind(primary_canonical)
        .bind(title)
        .bind(language)
        .bind(quality_score)
        .bind(quality_passed)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok((rows::row_to_document(&row)?, true))
    }

    pub async fn attach_url_alias(
        &self,
        document_id: Uuid,
        url: &str,
        canonical_url: &str,
        reason: AliasReason,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO document_urls (document_id, url, canonical_url, reason)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT (document_id, canonical_url) DO NOTHING"#,
        )
        .bind(document_id)
        .bind(url)
        .bind(canonical_url)
        .bind(reason.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_documents(&self, job_id: Uuid) -> Result<Vec<Document>> {
        let rows = sqlx::query("SELECT * FROM documents WHERE job_id = $1 ORDER BY first_seen_at ASC")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(rows::row_to_document).collect::<Result<Vec<_>>>()
    }

    pub async fn list_aliases(&self, document_id: Uuid) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT url FROM document_urls WHERE document_id = $1 ORDER BY created_at ASC")
            .bind(document_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("url")).collect())
    }

    // -------------------------------------------------------------- Events

    pub async fn log_event(
        &self,
        job_id: Uuid,
        level: &str,
        event: &str,
        data: Option<serde_json::Value>,
    ) -> Result<()> {
        sqlx::query("INSERT INTO job_events (job_id, level, event, data) VALUES ($1, $2, $3, $4)")
            .bind(job_id)
            .bind(level)
            .bind(event)
            .bind(data)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_events(&self, job_id: Uuid) -> Result<Vec<JobEvent>> {
        let rows = sqlx::query("SELECT * FROM job_events WHERE job_id = $1 ORDER BY created_at ASC")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| JobEvent {
                id: r.get("id"),
                job_id: r.get("job_id"),
                level: r.get("level"),
                event: r.get("event"),
                data: r.get("data"),
                created_at: r.get("created_at"),
            })
            .collect())
    }

    // ----------------------------------------------------------- Artifacts

    pub async fn register_artifact(
        &self,
        job_id: Uuid,
        path: &str,
        byte_size: i64,
        sha256: &str,
    ) -> Result<JobArtifact> {
        let row = sqlx::query(
            "INSERT INTO job_artifacts (job_id, path, byte_size, sha256) VALUES ($1, $2, $3, $4) RETURNING *",
        )
        .bind(job_id)
        .bind(path)
        .bind(byte_size)
        .bind(sha256)
        .fetch_one(&self.pool)
        .await?;
        Ok(JobArtifact {
            id: row.get("id"),
            job_id: row.get("job_id"),
            path: row.get("path"),
            byte_size: row.get("byte_size"),
            sha256: row.get("sha256"),
            created_at: row.get("created_at"),
        })
    }

    pub async fn list_artifacts(&self, job_id: Uuid) -> Result<Vec<JobArtifact>> {
        let rows = sqlx::query("SELECT * FROM job_artifacts WHERE job_id = $1 ORDER BY created_at ASC")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| JobArtifact {
                id: r.get("id"),
                job_id: r.get("job_id"),
                path: r.get("path"),
                byte_size: r.get("byte_size"),
                sha256: r.get("sha256"),
                created_at: r.get("created_at"),
            })
            .collect())
    }
}

/// Optional fields applied alongside a `set_state` transition.
#[derive(Debug, Clone, Default)]
pub struct StateFields {
    pub site_status: Option<SiteStatus>,
    pub last_error: Option<String>,
    pub restart_count: Option<i32>,
}

/// Parameters for `upsert_document`.
#[derive(Debug, Clone, Copy)]
pub struct NewDocument<'a> {
    pub content_hash: &'a str,
    pub title_hash: Option<&'a str>,
    pub primary_url: &'a str,
    pub primary_canonical: &'a str,
    pub title: Option<&'a str>,
    pub language: Option<&'a str>,
    pub quality_score: f64,
    pub quality_passed: bool,
}
