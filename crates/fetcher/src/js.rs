use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crawlcorpus_core::{CrawlError, FetchOutcome, Fetcher};

/// Post-load settle wait observed by the render service before returning the
/// DOM snapshot (§5: "60 s (JS render includes a 2 s post-load wait)").
const POST_LOAD_WAIT_MS: u64 = 2_000;

#[derive(Serialize)]
struct RenderRequest<'a> {
    url: &'a str,
    wait_ms: u64,
}

#[derive(Deserialize)]
struct RenderResponse {
    status_code: u16,
    final_url: String,
    html: String,
    content_type: Option<String>,
}

/// Client for the browser instance (§1: treated as an opaque fetch backend).
/// Talks to an external render service over HTTP rather than driving a
/// browser directly — the actual browser process is out of scope.
pub struct JsFetcher {
    client: reqwest::Client,
    render_service_url: String,
    max_concurrency: usize,
}

impl JsFetcher {
    pub fn new(render_service_url: &str, max_concurrency: usize) -> Result<Self, CrawlError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| CrawlError::Config(e.to_string()))?;
        Ok(Self {
            client,
            render_service_url: render_service_url.to_string(),
            max_concurrency,
        })
    }
}

#[async_trait]
impl Fetcher for JsFetcher {
    fn name(&self) -> &'static str {
        "js"
    }

    async fn fetch(&self, url: &str, timeout: Duration) -> Result<FetchOutcome, CrawlError> {
        let start = Instant::now();
        debug!(url, "fetching via js render service");

        let resp = self
            .client
            .post(&self.render_service_url)
            .timeout(timeout)
            .json(&RenderRequest {
                url,
                wait_ms: POST_LOAD_WAIT_MS,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CrawlError::Timeout(timeout.as_secs())
                } else {
                    CrawlError::Network(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            return Err(CrawlError::Network(format!(
                "render service returned {}",
                resp.status()
            )));
        }

        let rendered: RenderResponse = resp
            .json()
            .await
            .map_err(|e| CrawlError::Network(format!("render service response: {e}")))?;

        let mut headers = HashMap::new();
        if let Some(ct) = &rendered.content_type {
            headers.insert("content-type".to_string(), ct.clone());
        }

        Ok(FetchOutcome {
            status_code: rendered.status_code,
            final_url: rendered.final_url,
            headers,
            body: rendered.html.into_bytes(),
            content_type: rendered.content_type,
            elapsed_ms: start.elapsed().as_millis() as u64,
            fetched_at: chrono::Utc::now(),
        })
    }

    fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }
}
