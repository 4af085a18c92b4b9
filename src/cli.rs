use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "crawlcorpus", about = "Documentation-site crawler orchestration core")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config/default.toml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the supervisor loop: claims queued jobs, runs the crawl engine,
    /// finalizes terminal jobs. Blocks forever.
    Serve,
    /// Create a job (stand-in for the out-of-scope HTTP control plane).
    CreateJob {
        /// Seed URL to start crawling from
        #[arg(long)]
        seed_url: String,

        /// Host the crawl is restricted to
        #[arg(long)]
        allowed_host: String,

        /// Maximum pages to fetch
        #[arg(long)]
        max_pages: Option<u64>,

        /// Per-fetch timeout in seconds
        #[arg(long, default_value = "30")]
        timeout_seconds: u64,

        /// Path prefixes to exclude from crawling (comma-separated)
        #[arg(long, value_delimiter = ',')]
        ignore_path_prefixes: Vec<String>,

        /// Force the JS-rendering fetcher from the start
        #[arg(long)]
        force_js: bool,
    },
    /// Print a job's current wire-shape status.
    Status {
        job_id: uuid::Uuid,
    },
    /// Request cooperative cancellation of a running job.
    Cancel {
        job_id: uuid::Uuid,
    },
}
