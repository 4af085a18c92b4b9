//! Turns a fetched page into main text, title, outlinks and a quality
//! verdict (§2 item 3, §4.4.3).

pub mod captcha;
pub mod html;
pub mod quality;

use sha2::{Digest, Sha256};

pub use quality::{score, QualityScore};

use crawlcorpus_core::{CrawlError, Extracted, Extractor};

/// Default HTML extractor, grounded on `scraper`-based DOM traversal.
pub struct HtmlExtractor;

impl Extractor for HtmlExtractor {
    fn extract(&self, html_bytes: &[u8], base_url: &str) -> Result<Extracted, CrawlError> {
        html::parse(html_bytes, base_url)
    }
}

/// Alternate extractor tried on marginal-quality pages (§4.4.3): favors named
/// content containers and strips common boilerplate tags instead of taking
/// the whole `<body>`.
pub struct AltHtmlExtractor;

impl Extractor for AltHtmlExtractor {
    fn extract(&self, html_bytes: &[u8], base_url: &str) -> Result<Extracted, CrawlError> {
        html::parse_alternate(html_bytes, base_url)
    }
}

/// Content hash used for deduplication (§3 Document.content_hash): sha256
/// over the normalized (whitespace-collapsed) extracted text.
pub fn content_hash(main_text: &str) -> String {
    let normalized: String = main_text.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Hash of the title alone, for `Document.title_hash`.
pub fn title_hash(title: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.trim().to_lowercase().as_bytes());
    format!("{:x}", hasher.finalize())
}
