use std::time::Duration;

use serde::Deserialize;

/// Crawl orchestration configuration, loaded from `config/default.toml` and
/// overridden by environment variables in `main`.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub crawler: CrawlerConfig,
    pub supervisor: SupervisorConfig,
    pub quality: QualityConfig,
    pub job: JobConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub postgres_url: String,
    #[serde(default = "default_pool_size")]
    pub max_connections: u32,
}

fn default_pool_size() -> u32 {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct CrawlerConfig {
    #[serde(default = "default_concurrent_requests")]
    pub concurrent_requests: usize,
    #[serde(default = "default_js_concurrency")]
    pub js_concurrency: usize,
    #[serde(default = "default_download_delay_ms")]
    pub download_delay_ms: u64,
    #[serde(default = "default_depth_limit")]
    pub depth_limit: u32,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_max_pages")]
    pub max_pages_limit: u64,
    #[serde(default = "default_default_max_pages")]
    pub default_max_pages: u64,
    #[serde(default)]
    pub js_heavy_host_patterns: Vec<String>,
    #[serde(default = "default_js_render_service_url")]
    pub js_render_service_url: String,
}

fn default_concurrent_requests() -> usize {
    128
}
fn default_js_concurrency() -> usize {
    4
}
fn default_download_delay_ms() -> u64 {
    20
}
fn default_depth_limit() -> u32 {
    20
}
fn default_user_agent() -> String {
    "SkrappBot/1.0".to_string()
}
fn default_max_pages() -> u64 {
    1000
}
fn default_default_max_pages() -> u64 {
    100
}
fn default_js_render_service_url() -> String {
    "http://localhost:9222/render".to_string()
}

impl CrawlerConfig {
    pub fn download_delay(&self) -> Duration {
        Duration::from_millis(self.download_delay_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_seconds: i64,
    #[serde(default = "default_orphaned_threshold")]
    pub orphaned_threshold_seconds: i64,
    #[serde(default = "default_stalled_threshold")]
    pub stalled_threshold_seconds: i64,
    #[serde(default = "default_hard_stalled_threshold")]
    pub hard_stalled_threshold_seconds: i64,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: i32,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_seconds: u64,
}

fn default_poll_interval() -> u64 {
    1
}
fn default_heartbeat_interval() -> u64 {
    15
}
fn default_lease_ttl() -> i64 {
    30
}
fn default_orphaned_threshold() -> i64 {
    120
}
fn default_stalled_threshold() -> i64 {
    300
}
fn default_hard_stalled_threshold() -> i64 {
    180
}
fn default_max_restarts() -> i32 {
    2
}
fn default_drain_timeout() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct QualityConfig {
    #[serde(default = "default_min_marginal")]
    pub min_text_length_marginal: usize,
    #[serde(default = "default_min_success")]
    pub min_text_length_success: usize,
    #[serde(default = "default_pass_threshold")]
    pub pass_threshold: f64,
    #[serde(default = "default_marginal_threshold")]
    pub marginal_threshold: f64,
}

fn default_min_marginal() -> usize {
    50
}
fn default_min_success() -> usize {
    200
}
fn default_pass_threshold() -> f64 {
    0.6
}
fn default_marginal_threshold() -> f64 {
    0.3
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_text_length_marginal: default_min_marginal(),
            min_text_length_success: default_min_success(),
            pass_threshold: default_pass_threshold(),
            marginal_threshold: default_marginal_threshold(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct JobConfig {
    #[serde(default = "default_expiry_hours")]
    pub expiry_hours: i64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_expiry_hours() -> i64 {
    24
}
fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
}

fn default_output_dir() -> String {
    "data/jobs".to_string()
}
