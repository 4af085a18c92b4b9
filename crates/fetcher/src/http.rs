use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use crawlcorpus_core::{CrawlError, FetchOutcome, Fetcher};

const MAX_REDIRECTS: usize = 10;

/// Plain concurrent HTTP client fetcher — the default backend (§4.4.2).
pub struct HttpFetcher {
    client: reqwest::Client,
    max_concurrency: usize,
    max_body_size: usize,
}

impl HttpFetcher {
    pub fn new(user_agent: &str, max_concurrency: usize, max_body_size: usize) -> Result<Self, CrawlError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(|e| CrawlError::Config(e.to_string()))?;
        Ok(Self {
            client,
            max_concurrency,
            max_body_size,
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn fetch(&self, url: &str, timeout: Duration) -> Result<FetchOutcome, CrawlError> {
        let start = Instant::now();
        debug!(url, "fetching via http");

        let resp = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;

        let status_code = resp.status().as_u16();
        let final_url = resp.url().to_string();

        let mut headers = HashMap::new();
        for (k, v) in resp.headers() {
            if let Ok(val) = v.to_str() {
                headers.insert(k.as_str().to_string(), val.to_string());
            }
        }
        let content_type = headers.get("content-type").cloned();

        let body = resp.bytes().await.map_err(|e| {
            warn!(url, error = %e, "http body read failed");
            CrawlError::Network(e.to_string())
        })?;

        if body.len() > self.max_body_size {
            return Err(CrawlError::BodyTooLarge {
                size: body.len(),
                max: self.max_body_size,
            });
        }

        Ok(FetchOutcome {
            status_code,
            final_url,
            headers,
            body: body.to_vec(),
            content_type,
            elapsed_ms: start.elapsed().as_millis() as u64,
            fetched_at: chrono::Utc::now(),
        })
    }

    fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }
}

fn classify_reqwest_error(e: &reqwest::Error) -> CrawlError {
    if e.is_redirect() {
        CrawlError::RedirectLoop(MAX_REDIRECTS as u32)
    } else if e.is_timeout() {
        CrawlError::Timeout(30)
    } else {
        CrawlError::Network(e.to_string())
    }
}
