use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CrawlError;

/// §6 Fetcher contract — the interface the Crawl Engine consumes. Two
/// variants implement it: a fast concurrent HTTP client and a browser-driven
/// variant for JS-rendered sites. The engine stays uniform across both.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Must follow redirects up to 10 and report the final URL.
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<FetchOutcome, CrawlError>;

    /// How many fetches this backend can run concurrently (default N=128 for
    /// HTTP, 1-4 for JS per §4.4).
    fn max_concurrency(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub status_code: u16,
    pub final_url: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub elapsed_ms: u64,
    pub fetched_at: DateTime<Utc>,
}

/// §6 Extractor contract — a pluggable text-extraction library, treated as an
/// external collaborator. Outlinks are fully-resolved absolute URLs.
pub trait Extractor: Send + Sync + 'static {
    fn extract(&self, html_bytes: &[u8], base_url: &str) -> Result<Extracted, CrawlError>;
}

#[derive(Debug, Clone, Default)]
pub struct Extracted {
    pub title: Option<String>,
    pub main_text: String,
    pub outlinks: Vec<String>,
    pub language: Option<String>,
    pub html_len: usize,
}
