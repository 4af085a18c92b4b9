//! Two fetcher backends behind one contract (§4.4.2, §6): a concurrent HTTP
//! client for plain pages, and a thin client over an external JS-rendering
//! service for sites that need a browser. The engine only ever sees `Fetcher`.

mod http;
mod js;

pub use http::HttpFetcher;
pub use js::JsFetcher;
