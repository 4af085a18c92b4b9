//! The per-job worker (§4.4): leases URLs from the frontier, fans out
//! concurrent fetches, pipes results through the extractor and quality gate,
//! enqueues discovered links, and owns fetcher selection / fallback,
//! blocking detection, and retry policy.

pub mod admission;
pub mod blocking;
mod output;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crawlcorpus_core::{
    AliasReason, AppConfig, CrawlError, Extractor, Fetcher, Job, JobFatalError, RawPageRecord, SiteStatus,
};
use crawlcorpus_extractor::{content_hash, title_hash, AltHtmlExtractor, HtmlExtractor};
use crawlcorpus_fetcher::{HttpFetcher, JsFetcher};
use crawlcorpus_store::{CompleteOutcome, Store};

use blocking::{BlockingDetector, FetchRecord};
use output::RawPageWriter;

const LEASE_BATCH: i64 = 1;
const POLL_INTERVAL: Duration = Duration::from_millis(250);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(60);
const FALLBACK_MIN_FETCHES: u64 = 10;
const FALLBACK_MIN_ELAPSED: Duration = Duration::from_secs(30);

/// Outcome of a completed `Run` (§4.4's public contract).
#[derive(Debug, Clone)]
pub enum EngineOutcome {
    /// Frontier drained or budget met; finalize as `done` (or `cancelled`).
    Normal,
    /// Fatal error; the supervisor transitions the job to `failed`.
    Error(String),
}

/// Per-job worker. One instance runs one job at a time; the Supervisor owns
/// the lifetime of the task that drives `run`.
pub struct CrawlEngine {
    store: Arc<Store>,
    config: AppConfig,
    output_dir: PathBuf,
}

impl CrawlEngine {
    pub fn new(store: Arc<Store>, config: AppConfig) -> Self {
        let output_dir = PathBuf::from(&config.output.output_dir);
        Self { store, config, output_dir }
    }

    /// Runs the job to a cooperative exit, then writes the one transition the
    /// engine is responsible for (§4.1/§4.3): `running -> finalizing` on a
    /// normal exit, or `running -> failed` on a fatal error.
    pub async fn run(&self, job: Job) -> Result<EngineOutcome, JobFatalError> {
        let job_id = job.id;
        match self.run_inner(job).await {
            Ok(outcome) => {
                let _ = self
                    .store
                    .set_state(job_id, crawlcorpus_core::JobState::Finalizing, Default::default())
                    .await;
                Ok(outcome)
            }
            Err(err) => {
                let fields = crawlcorpus_store::StateFields {
                    last_error: Some(err.to_string()),
                    ..Default::default()
                };
                let _ = self.store.set_state(job_id, crawlcorpus_core::JobState::Failed, fields).await;
                Err(err)
            }
        }
    }

    async fn run_inner(&self, job: Job) -> Result<EngineOutcome, JobFatalError> {
        let job_id = job.id;
        let allowed_host = job.config.allowed_host.clone();

        let canon_seed = admission::canonicalize(&job.config.seed_url)
            .map_err(|e| JobFatalError::Internal(format!("bad seed url: {e}")))?;
        self.store
            .enqueue_url(job_id, &job.config.seed_url, &canon_seed, 0, 1.0)
            .await
            .map_err(|e| JobFatalError::Store(e.to_string()))?;

        let use_js = job.config.force_js || js_heavy_host(&allowed_host, &self.config.crawler.js_heavy_host_patterns);
        let http_fetcher: Arc<dyn Fetcher> = Arc::new(
            HttpFetcher::new(
                &self.config.crawler.user_agent,
                self.config.crawler.concurrent_requests,
                10 * 1024 * 1024,
            )
            .map_err(|e| JobFatalError::Internal(e.to_string()))?,
        );
        let js_fetcher: Arc<dyn Fetcher> = Arc::new(
            JsFetcher::new(&self.config.crawler.js_render_service_url, self.config.crawler.js_concurrency)
                .map_err(|e| JobFatalError::Internal(e.to_string()))?,
        );

        let raw_writer = Arc::new(
            RawPageWriter::create(&self.output_dir, job_id)
                .await
                .map_err(JobFatalError::OutputWrite)?,
        );

        let state = Arc::new(SharedState::new());
        if use_js {
            state.site_status_override(SiteStatus::SwitchedToJs);
        }
        let active_fetcher: Arc<Mutex<Arc<dyn Fetcher>>> = Arc::new(Mutex::new(if use_js {
            Arc::clone(&js_fetcher)
        } else {
            Arc::clone(&http_fetcher)
        }));

        let heartbeat_handle = self.spawn_heartbeat(job_id, Arc::clone(&state));

        let start = tokio::time::Instant::now();
        let mut fallback_done = use_js;
        let mut workers = self.spawn_workers(job_id, &job, Arc::clone(&active_fetcher), Arc::clone(&state), Arc::clone(&raw_writer)).await;

        loop {
            tokio::time::sleep(POLL_INTERVAL).await;

            if state.cancel.load(Ordering::Relaxed) {
                info!(%job_id, "cancel observed, draining in-flight fetches");
                break;
            }

            let budgeted = self
                .store
                .count_budgeted_entries(job_id)
                .await
                .map_err(|e| JobFatalError::Store(e.to_string()))?;
            if budgeted >= job.config.max_pages {
                info!(%job_id, budgeted, max_pages = job.config.max_pages, "budget reached");
                break;
            }

            if state.in_flight.load(Ordering::Relaxed) == 0 {
                let empty = self
                    .store
                    .frontier_is_empty(job_id)
                    .await
                    .map_err(|e| JobFatalError::Store(e.to_string()))?;
                if empty {
                    info!(%job_id, "frontier drained");
                    break;
                }
            }

            if !fallback_done && should_fallback(&state, start.elapsed()) {
                fallback_done = true;
                info!(%job_id, "falling back to js fetcher");
                state.shutdown.store(true, Ordering::Relaxed);
                drain(&mut workers, DRAIN_TIMEOUT).await;
                self.store
                    .requeue_inflight_for_fallback(job_id)
                    .await
                    .map_err(|e| JobFatalError::Store(e.to_string()))?;
                self.store
                    .log_event(job_id, "info", "fallback_to_js", None)
                    .await
                    .map_err(|e| JobFatalError::Store(e.to_string()))?;
                state.site_status_override(SiteStatus::SwitchedToJs);
                *active_fetcher.lock().await = Arc::clone(&js_fetcher);
                state.shutdown.store(false, Ordering::Relaxed);
                workers = self.spawn_workers(job_id, &job, Arc::clone(&active_fetcher), Arc::clone(&state), Arc::clone(&raw_writer)).await;
                continue;
            }

            if matches!(state.site_status(), SiteStatus::Blocked | SiteStatus::LoginRequired) && fallback_done {
                let reason = format!("site_status_{}", state.site_status().as_str());
                state.shutdown.store(true, Ordering::Relaxed);
                drain(&mut workers, DRAIN_TIMEOUT).await;
                heartbeat_handle.abort();
                return Err(JobFatalError::SiteBlocked(reason));
            }
        }

        state.shutdown.store(true, Ordering::Relaxed);
        drain(&mut workers, DRAIN_TIMEOUT).await;
        heartbeat_handle.abort();

        Ok(EngineOutcome::Normal)
    }

    fn spawn_heartbeat(&self, job_id: Uuid, state: Arc<SharedState>) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let interval = Duration::from_secs(self.config.supervisor.heartbeat_interval_seconds);
        tokio::spawn(async move {
            let mut last_seen = 0u64;
            loop {
                tokio::time::sleep(interval).await;
                let pages_fetched = state.pages_fetched.load(Ordering::Relaxed);
                let pages_exported = state.pages_exported.load(Ordering::Relaxed);
                let errors_count = state.errors_count.load(Ordering::Relaxed);
                let progressed = pages_fetched > last_seen;
                last_seen = pages_fetched;
                if store
                    .heartbeat(job_id, pages_fetched, pages_exported, errors_count, progressed)
                    .await
                    .is_err()
                {
                    warn!(%job_id, "heartbeat write failed");
                }
                if let Ok(Some(job)) = store.get_job(job_id).await {
                    if job.cancel_requested {
                        state.cancel.store(true, Ordering::Relaxed);
                    }
                }
            }
        })
    }

    async fn spawn_workers(
        &self,
        job_id: Uuid,
        job: &Job,
        active_fetcher: Arc<Mutex<Arc<dyn Fetcher>>>,
        state: Arc<SharedState>,
        raw_writer: Arc<RawPageWriter>,
    ) -> JoinSet<()> {
        let concurrency = active_fetcher.lock().await.max_concurrency();
        let mut set = JoinSet::new();
        let lease_ttl = ChronoDuration::seconds(self.config.supervisor.lease_ttl_seconds);
        let download_delay = self.config.crawler.download_delay();
        let depth_limit = self.config.crawler.depth_limit;
        let allowed_host = job.config.allowed_host.clone();
        let ignore_prefixes = job.config.ignore_path_prefixes.clone();
        let timeout = Duration::from_secs(job.config.timeout_seconds);
        let quality_cfg = self.config.quality.clone();

        for worker_id in 0..concurrency {
            let store = Arc::clone(&self.store);
            let active_fetcher = Arc::clone(&active_fetcher);
            let state = Arc::clone(&state);
            let raw_writer = Arc::clone(&raw_writer);
            let allowed_host = allowed_host.clone();
            let ignore_prefixes = ignore_prefixes.clone();
            let quality_cfg = quality_cfg.clone();
            let worker_label = format!("{job_id}-w{worker_id}");

            set.spawn(async move {
                loop {
                    if state.shutdown.load(Ordering::Relaxed) {
                        return;
                    }
                    let leased = store.lease_urls(job_id, &worker_label, LEASE_BATCH, lease_ttl).await;
                    let entries = match leased {
                        Ok(entries) => entries,
                        Err(e) => {
                            warn!(%job_id, error = %e, "lease failed");
                            tokio::time::sleep(POLL_INTERVAL).await;
                            continue;
                        }
                    };
                    if entries.is_empty() {
                        tokio::time::sleep(POLL_INTERVAL).await;
                        continue;
                    }

                    for entry in entries {
                        state.in_flight.fetch_add(1, Ordering::Relaxed);
                        let fetcher = Arc::clone(&*active_fetcher.lock().await);

                        let result = fetcher.fetch(&entry.url, timeout).await;
                        match result {
                            Ok(outcome) => {
                                let is_captcha = crawlcorpus_extractor::captcha::looks_like_captcha(
                                    &String::from_utf8_lossy(&outcome.body),
                                );
                                let is_login_redirect =
                                    crawlcorpus_extractor::captcha::looks_like_login_redirect(&outcome.final_url);

                                if outcome.status_code >= 500 || outcome.status_code == 429 {
                                    let backoff = backoff_for(entry.retry_count);
                                    let error = format!("http_{}", outcome.status_code);
                                    let retried = store
                                        .retry_or_fail(&entry, &error, Some(outcome.status_code), backoff)
                                        .await
                                        .unwrap_or(false);
                                    if !retried {
                                        state.errors_count.fetch_add(1, Ordering::Relaxed);
                                    }
                                    state.blocking.lock().await.record(FetchRecord {
                                        status_code: outcome.status_code,
                                        is_captcha,
                                        is_login_redirect,
                                        is_duplicate: false,
                                        quality_passed: false,
                                    });
                                    state.in_flight.fetch_sub(1, Ordering::Relaxed);
                                    continue;
                                }
                                if outcome.status_code >= 400 {
                                    let _ = store
                                        .complete_url(
                                            entry.id,
                                            CompleteOutcome::Failed {
                                                status_code: Some(outcome.status_code),
                                                error: format!("http_{}", outcome.status_code),
                                            },
                                        )
                                        .await;
                                    state.errors_count.fetch_add(1, Ordering::Relaxed);
                                    state.blocking.lock().await.record(FetchRecord {
                                        status_code: outcome.status_code,
                                        is_captcha,
                                        is_login_redirect,
                                        is_duplicate: false,
                                        quality_passed: false,
                                    });
                                    state.in_flight.fetch_sub(1, Ordering::Relaxed);
                                    continue;
                                }

                                let extracted = HtmlExtractor.extract(&outcome.body, &outcome.final_url);
                                let Ok(extracted) = extracted else {
                                    let _ = store
                                        .complete_url(
                                            entry.id,
                                            CompleteOutcome::Skipped { reason: "extraction_failed".into() },
                                        )
                                        .await;
                                    state.in_flight.fetch_sub(1, Ordering::Relaxed);
                                    continue;
                                };

                                let mut quality = crawlcorpus_extractor::score(
                                    extracted.main_text.len(),
                                    extracted.outlinks.len(),
                                    extracted.html_len,
                                    &quality_cfg,
                                );
                                let mut extracted = extracted;

                                // §4.4.3: marginal pages get one re-extraction attempt with
                                // the alternate extractor before being written off.
                                if quality.verdict == crawlcorpus_core::QualityVerdict::Marginal {
                                    if let Ok(alt) = AltHtmlExtractor.extract(&outcome.body, &outcome.final_url) {
                                        let alt_quality = crawlcorpus_extractor::score(
                                            alt.main_text.len(),
                                            alt.outlinks.len(),
                                            alt.html_len,
                                            &quality_cfg,
                                        );
                                        if alt_quality.score > quality.score {
                                            extracted = alt;
                                            quality = alt_quality;
                                        }
                                    }
                                }
                                let quality_passed = quality.verdict == crawlcorpus_core::QualityVerdict::Pass;
                                if !quality_passed {
                                    if let Some(reason) = quality.reason(
                                        extracted.main_text.len(),
                                        extracted.outlinks.len(),
                                        extracted.html_len,
                                        &quality_cfg,
                                    ) {
                                        debug!(url = %entry.url, verdict = ?quality.verdict, %reason, "quality gate rejected page");
                                    }
                                }
                                let hash = content_hash(&extracted.main_text);

                                let mut is_duplicate = false;
                                if quality_passed {
                                    let title_hash_owned = extracted.title.as_ref().map(|t| title_hash(t));
                                    let upsert = store
                                        .upsert_document(
                                            job_id,
                                            crawlcorpus_store::NewDocument {
                                                content_hash: &hash,
                                                title_hash: title_hash_owned.as_deref(),
                                                primary_url: &entry.url,
                                                primary_canonical: &entry.canonical_url,
                                                title: extracted.title.as_deref(),
                                                language: extracted.language.as_deref(),
                                                quality_score: quality.score,
                                                quality_passed: true,
                                            },
                                        )
                                        .await;
                                    if let Ok((doc, is_new)) = upsert {
                                        is_duplicate = !is_new;
                                        let _ = store
                                            .attach_url_alias(doc.id, &entry.url, &entry.canonical_url, AliasReason::Canonical)
                                            .await;
                                        if is_new {
                                            state.pages_exported.fetch_add(1, Ordering::Relaxed);
                                        }
                                    }
                                }

                                let record = RawPageRecord {
                                    url: entry.url.clone(),
                                    canonical_url: entry.canonical_url.clone(),
                                    status_code: outcome.status_code,
                                    depth: entry.depth,
                                    title: extracted.title.clone(),
                                    text: extracted.main_text.clone(),
                                    outlinks: extracted.outlinks.clone(),
                                    extracted_at: chrono::Utc::now(),
                                    quality_score: quality.score,
                                    quality_passed,
                                    content_hash: hash,
                                };
                                let _ = raw_writer.append(&record).await;

                                for outlink in &extracted.outlinks {
                                    if let Ok(url) = Url::parse(outlink) {
                                        if admission::is_admissible(&url, &allowed_host, &ignore_prefixes, entry.depth + 1, depth_limit) {
                                            if let Ok(canon) = admission::canonicalize(outlink) {
                                                let priority = 1.0 / (entry.depth as f64 + 2.0);
                                                let _ = store
                                                    .enqueue_url(job_id, outlink, &canon, entry.depth + 1, priority)
                                                    .await;
                                            }
                                        }
                                    }
                                }

                                let _ = store
                                    .complete_url(entry.id, CompleteOutcome::Stored { status_code: outcome.status_code })
                                    .await;
                                state.pages_fetched.fetch_add(1, Ordering::Relaxed);
                                state.fetches_completed.fetch_add(1, Ordering::Relaxed);
                                state.total_text_len.fetch_add(extracted.main_text.len() as u64, Ordering::Relaxed);
                                state.total_extracted.fetch_add(1, Ordering::Relaxed);
                                if quality_passed {
                                    state.passed_count.fetch_add(1, Ordering::Relaxed);
                                }
                                state.blocking.lock().await.record(FetchRecord {
                                    status_code: outcome.status_code,
                                    is_captcha,
                                    is_login_redirect,
                                    is_duplicate,
                                    quality_passed,
                                });
                            }
                            Err(err) => {
                                let failed = handle_fetch_error(&store, &entry, &err).await;
                                if failed {
                                    state.errors_count.fetch_add(1, Ordering::Relaxed);
                                }
                                state.fetches_completed.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        state.in_flight.fetch_sub(1, Ordering::Relaxed);
                    }

                    if !download_delay.is_zero() {
                        tokio::time::sleep(download_delay).await;
                    }
                }
            });
        }
        set
    }
}

/// Returns true if the entry ended up terminally `failed` (vs. requeued for retry).
async fn handle_fetch_error(store: &Store, entry: &crawlcorpus_core::FrontierEntry, err: &CrawlError) -> bool {
    if err.is_retryable() {
        let backoff = backoff_for(entry.retry_count);
        !store.retry_or_fail(entry, &err.to_string(), None, backoff).await.unwrap_or(false)
    } else {
        let _ = store
            .complete_url(entry.id, CompleteOutcome::Failed { status_code: None, error: err.to_string() })
            .await;
        true
    }
}

fn backoff_for(retry_count: u32) -> Duration {
    let secs = 2u64.saturating_pow(retry_count).min(60);
    Duration::from_secs(secs)
}

fn js_heavy_host(host: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| host_matches_pattern(host, p))
}

fn host_matches_pattern(host: &str, pattern: &str) -> bool {
    match pattern.strip_prefix("*.") {
        Some(suffix) => host.ends_with(suffix),
        None => host.eq_ignore_ascii_case(pattern),
    }
}

async fn drain(set: &mut JoinSet<()>, bound: Duration) {
    let _ = tokio::time::timeout(bound, async {
        while set.join_next().await.is_some() {}
    })
    .await;
    set.abort_all();
}

/// §4.4.2's fallback-trigger mean-text-length threshold (independent of the
/// quality gate's own MIN_TEXT_LENGTH_SUCCESS, though it happens to match).
const FALLBACK_MIN_MEAN_TEXT_LEN: u64 = 200;
const FALLBACK_DUP_RATIO_THRESHOLD: f64 = 0.5;

fn should_fallback(state: &SharedState, elapsed: Duration) -> bool {
    let completed = state.fetches_completed.load(Ordering::Relaxed);
    if completed < FALLBACK_MIN_FETCHES && elapsed < FALLBACK_MIN_ELAPSED {
        return false;
    }
    let passed = state.passed_count.load(Ordering::Relaxed);
    let extracted = state.total_extracted.load(Ordering::Relaxed);
    let mean_len = state.total_text_len.load(Ordering::Relaxed).checked_div(extracted).unwrap_or(0);
    let weak_text = passed == 0 && mean_len < FALLBACK_MIN_MEAN_TEXT_LEN;
    let dup_heavy = state.blocking.try_lock().map(|g| g.dup_ratio() > FALLBACK_DUP_RATIO_THRESHOLD).unwrap_or(false);
    weak_text || dup_heavy || matches!(state.site_status(), SiteStatus::Blocked | SiteStatus::LoginRequired)
}

struct SharedState {
    pages_fetched: AtomicU64,
    pages_exported: AtomicU64,
    errors_count: AtomicU64,
    fetches_completed: AtomicU64,
    passed_count: AtomicU64,
    total_text_len: AtomicU64,
    total_extracted: AtomicU64,
    in_flight: AtomicU64,
    cancel: AtomicBool,
    shutdown: AtomicBool,
    blocking: Mutex<BlockingDetector>,
    site_status_override: Mutex<Option<SiteStatus>>,
}

impl SharedState {
    fn new() -> Self {
        Self {
            pages_fetched: AtomicU64::new(0),
            pages_exported: AtomicU64::new(0),
            errors_count: AtomicU64::new(0),
            fetches_completed: AtomicU64::new(0),
            passed_count: AtomicU64::new(0),
            total_text_len: AtomicU64::new(0),
            total_extracted: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            cancel: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            blocking: Mutex::new(BlockingDetector::new()),
            site_status_override: Mutex::new(None),
        }
    }

    fn site_status(&self) -> SiteStatus {
        if let Ok(guard) = self.site_status_override.try_lock() {
            if let Some(status) = *guard {
                return status;
            }
        }
        if let Ok(guard) = self.blocking.try_lock() {
            return guard.site_status();
        }
        SiteStatus::Normal
    }

    fn site_status_override(&self, status: SiteStatus) {
        if let Ok(mut guard) = self.site_status_override.try_lock() {
            *guard = Some(status);
        }
    }
}
