use thiserror::Error;

/// Errors a single fetch attempt can raise. `is_retryable` drives §4.4.5's
/// retry policy without the caller having to pattern-match every variant.
#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("network error: {0}")]
    Network(String),

    #[error("timeout after {0}s")]
    Timeout(u64),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("http {status}: {0}", status = .0)]
    Http(u16),

    #[error("too many redirects (>{0})")]
    RedirectLoop(u32),

    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("site blocked: {0}")]
    SiteBlocked(String),

    #[error("body too large: {size} bytes (max {max})")]
    BodyTooLarge { size: usize, max: usize },

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl CrawlError {
    /// Retryable per §4.4.5: network error, 5xx, 429.
    pub fn is_retryable(&self) -> bool {
        match self {
            CrawlError::Network(_) | CrawlError::Timeout(_) => true,
            CrawlError::Http(status) => *status == 429 || (500..600).contains(status),
            _ => false,
        }
    }
}

/// Why a job ended up in a terminal-but-unsuccessful state.
#[derive(Error, Debug)]
pub enum JobFatalError {
    #[error("store I/O failure: {0}")]
    Store(String),

    #[error("output write failure: {0}")]
    OutputWrite(#[from] std::io::Error),

    #[error("site blocked: {0}")]
    SiteBlocked(String),

    #[error("internal error: {0}")]
    Internal(String),
}
