pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::{AppConfig, QualityConfig};
pub use error::{CrawlError, JobFatalError};
pub use traits::{Extracted, Extractor, FetchOutcome, Fetcher};
pub use types::*;
