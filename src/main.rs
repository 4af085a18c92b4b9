mod cli;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use sha2::Digest;
use tracing::warn;

// Use mimalloc to prevent memory bloat (glibc malloc doesn't release memory with high concurrency)
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use crawlcorpus_core::{AppConfig, JobConfigParams, JobState, JobView};
use crawlcorpus_store::{StateFields, Store};
use crawlcorpus_supervisor::Supervisor;

use crate::cli::{Cli, Commands};

fn main() -> Result<()> {
    // Custom Tokio runtime for high fetch concurrency.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(32) // Increase from default (CPU cores)
        .thread_stack_size(8 * 1024 * 1024) // 8MB stack per thread
        .max_blocking_threads(512) // Allow more blocking operations
        .enable_all()
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config_str = std::fs::read_to_string(&cli.config).unwrap_or_else(|_| {
        warn!(path = %cli.config, "config file not found, using defaults");
        include_str!("../config/default.toml").to_string()
    });
    let mut config: AppConfig = toml::from_str(&config_str)?;

    if let Ok(v) = std::env::var("CONCURRENT_REQUESTS") {
        if let Ok(n) = v.parse::<usize>() {
            if n > 0 {
                config.crawler.concurrent_requests = n;
            }
        }
    }
    if let Ok(v) = std::env::var("JS_CONCURRENCY") {
        if let Ok(n) = v.parse::<usize>() {
            if n > 0 {
                config.crawler.js_concurrency = n;
            }
        }
    }
    if let Ok(v) = std::env::var("DATABASE_URL") {
        config.database.postgres_url = v;
    }

    let store = Arc::new(Store::with_pool_size(&config.database.postgres_url, config.database.max_connections).await?);
    store.run_migrations().await?;

    match cli.command {
        Commands::Serve => {
            let supervisor = Arc::new(Supervisor::new(Arc::clone(&store), config));
            supervisor.run().await;
        }
        Commands::CreateJob { seed_url, allowed_host, max_pages, timeout_seconds, ignore_path_prefixes, force_js } => {
            let max_pages = max_pages
                .unwrap_or(config.crawler.default_max_pages)
                .min(config.crawler.max_pages_limit);
            let params = JobConfigParams {
                seed_url,
                allowed_host,
                max_pages,
                timeout_seconds,
                ignore_path_prefixes,
                force_js,
            };
            let access_token_hash = format!("{:x}", sha2::Sha256::digest(uuid::Uuid::new_v4().as_bytes()));
            let job = store.create_job(params, &access_token_hash, config.job.expiry_hours).await?;
            println!("{}", serde_json::to_string_pretty(&JobView::from(&job))?);
        }
        Commands::Status { job_id } => match store.get_job(job_id).await? {
            Some(job) => println!("{}", serde_json::to_string_pretty(&JobView::from(&job))?),
            None => eprintln!("job {job_id} not found"),
        },
        Commands::Cancel { job_id } => {
            store.request_cancel(job_id).await?;
            if let Some(job) = store.get_job(job_id).await? {
                if job.state == JobState::Queued {
                    store
                        .set_state(job_id, JobState::Cancelled, StateFields::default())
                        .await
                        .ok();
                }
            }
            println!("cancel requested for job {job_id}");
        }
    }

    Ok(())
}
