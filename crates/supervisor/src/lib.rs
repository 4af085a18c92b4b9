//! Single polling loop (§4.3): claims queued jobs, monitors heartbeats and
//! progress, restarts or fails stuck jobs, and runs finalization.

pub mod finalizer;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crawlcorpus_core::{AppConfig, Job, JobFatalError, JobState};
use crawlcorpus_engine::{CrawlEngine, EngineOutcome};
use crawlcorpus_store::{StateFields, Store};

struct RunningEngine {
    job_id: Uuid,
    handle: JoinHandle<Result<EngineOutcome, JobFatalError>>,
}

pub struct Supervisor {
    store: Arc<Store>,
    config: AppConfig,
    output_dir: PathBuf,
    current: Mutex<Option<RunningEngine>>,
}

impl Supervisor {
    pub fn new(store: Arc<Store>, config: AppConfig) -> Self {
        let output_dir = PathBuf::from(&config.output.output_dir);
        Self { store, config, output_dir, current: Mutex::new(None) }
    }

    /// Drives the supervisor loop forever at `poll_interval_seconds` cadence.
    pub async fn run(self: Arc<Self>) -> ! {
        let interval = std::time::Duration::from_secs(self.config.supervisor.poll_interval_seconds);
        loop {
            if let Err(e) = self.tick().await {
                warn!(error = %e, "supervisor tick failed");
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn tick(&self) -> anyhow::Result<()> {
        self.evaluate_stalls().await?;
        self.expire_leases().await?;
        let expired = self.store.expire_overdue_jobs().await?;
        for job_id in expired {
            self.store.log_event(job_id, "info", "job_expired", None).await?;
        }

        self.reap_finished_engine().await?;

        let mut current = self.current.lock().await;
        if current.is_none() {
            if let Some(job) = self.store.claim_next_queued_job("supervisor").await? {
                info!(job_id = %job.id, "claimed job, starting engine");
                *current = Some(self.spawn_engine(job));
            }
        }
        Ok(())
    }

    fn spawn_engine(&self, job: Job) -> RunningEngine {
        let job_id = job.id;
        let store = Arc::clone(&self.store);
        let config = self.config.clone();
        let handle = tokio::spawn(async move {
            let engine = CrawlEngine::new(store, config);
            engine.run(job).await
        });
        RunningEngine { job_id, handle }
    }

    /// If the running engine's task has completed, join it and (if it left
    /// the job in `finalizing`) run the Finalizer inline (§4.3 step 5).
    async fn reap_finished_engine(&self) -> anyhow::Result<()> {
        let mut current = self.current.lock().await;
        let Some(running) = current.as_ref() else {
            return Ok(());
        };
        if !running.handle.is_finished() {
            return Ok(());
        }
        let RunningEngine { job_id, handle } = current.take().unwrap();
        match handle.await {
            Ok(Ok(_)) => info!(%job_id, "engine exited normally"),
            Ok(Err(e)) => warn!(%job_id, error = %e, "engine exited with fatal error"),
            Err(join_err) => warn!(%job_id, error = %join_err, "engine task panicked"),
        }

        if let Some(job) = self.store.get_job(job_id).await? {
            if job.state == JobState::Finalizing {
                finalizer::finalize(&self.store, &self.output_dir, &job).await?;
            }
        }
        Ok(())
    }

    /// §4.3 step 2: leases past TTL become visible again.
    async fn expire_leases(&self) -> anyhow::Result<()> {
        for job in self.store.list_non_terminal_jobs().await? {
            let reclaimed = self.store.expire_stale_leases(job.id).await?;
            if reclaimed > 0 {
                info!(job_id = %job.id, reclaimed, "reclaimed expired leases");
            }
        }
        Ok(())
    }

    /// §4.3 stall rules, evaluated only for state=running.
    async fn evaluate_stalls(&self) -> anyhow::Result<()> {
        let cfg = &self.config.supervisor;
        let now = Utc::now();
        for job in self.store.list_non_terminal_jobs().await? {
            if job.state != JobState::Running {
                continue;
            }

            let orphaned = job
                .heartbeat_at
                .map(|hb| (now - hb).num_seconds() > cfg.orphaned_threshold_seconds)
                .unwrap_or(false);
            let stalled = job.pages_fetched > 0
                && job
                    .last_progress_at
                    .map(|lp| (now - lp).num_seconds() > cfg.stalled_threshold_seconds)
                    .unwrap_or(false);
            let hard_stalled = job.pages_fetched == 0
                && job
                    .started_at
                    .map(|s| (now - s).num_seconds() > cfg.hard_stalled_threshold_seconds)
                    .unwrap_or(false);

            if hard_stalled {
                self.abort_and_fail(job.id, "hard_stalled_zero_pages").await?;
            } else if orphaned || stalled {
                let reason = if orphaned { "orphaned_no_heartbeat" } else { "stalled_no_progress" };
                if job.restart_count < cfg.max_restarts {
                    self.abort_and_restart(job.id, reason).await?;
                } else {
                    self.abort_and_fail(job.id, reason).await?;
                }
            }
        }
        Ok(())
    }

    async fn abort_and_restart(&self, job_id: Uuid, reason: &str) -> anyhow::Result<()> {
        self.abort_stale_engine(job_id).await;
        self.store.requeue_for_restart(job_id).await?;
        self.store
            .log_event(job_id, "warn", "job_restarted", Some(serde_json::json!({ "reason": reason })))
            .await?;
        Ok(())
    }

    async fn abort_and_fail(&self, job_id: Uuid, reason: &str) -> anyhow::Result<()> {
        self.abort_stale_engine(job_id).await;
        let fields = StateFields { last_error: Some(reason.to_string()), ..Default::default() };
        self.store.set_state(job_id, JobState::Failed, fields).await.ok();
        self.store
            .log_event(job_id, "error", "job_failed", Some(serde_json::json!({ "reason": reason })))
            .await?;
        Ok(())
    }

    async fn abort_stale_engine(&self, job_id: Uuid) {
        let mut current = self.current.lock().await;
        if let Some(running) = current.as_ref() {
            if running.job_id == job_id {
                running.handle.abort();
                *current = None;
            }
        }
    }
}
