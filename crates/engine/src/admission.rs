use url::Url;

use crawlcorpus_core::CrawlError;

const EXCLUDED_EXTENSIONS: &[&str] = &[
    "pdf", "zip", "png", "jpg", "jpeg", "gif", "svg", "webp", "ico", "css", "js", "xml", "json",
];

/// Deterministic canonicalization (§4.4.1): lowercase scheme+host, strip
/// fragment, strip default port, drop the query string, collapse duplicate
/// slashes, strip a trailing slash (except on the root path). Idempotent —
/// `canonicalize(canonicalize(u)) == canonicalize(u)` (§8 property 7).
pub fn canonicalize(url_str: &str) -> Result<String, CrawlError> {
    let mut url = Url::parse(url_str).map_err(|e| CrawlError::InvalidUrl(e.to_string()))?;

    url.set_fragment(None);
    url.set_query(None);

    let scheme = url.scheme().to_lowercase();
    url.set_scheme(&scheme)
        .map_err(|_| CrawlError::InvalidUrl(url_str.to_string()))?;

    if let Some(host) = url.host_str() {
        let host = host.to_lowercase();
        url.set_host(Some(&host))
            .map_err(|e| CrawlError::InvalidUrl(e.to_string()))?;
    }

    if is_default_port(&scheme, url.port()) {
        let _ = url.set_port(None);
    }

    let collapsed = collapse_slashes(url.path());
    let path = if collapsed.len() > 1 {
        collapsed.trim_end_matches('/').to_string()
    } else {
        collapsed
    };
    url.set_path(if path.is_empty() { "/" } else { &path });

    Ok(url.to_string())
}

fn is_default_port(scheme: &str, port: Option<u16>) -> bool {
    matches!((scheme, port), ("http", Some(80)) | ("https", Some(443)))
}

fn collapse_slashes(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut last_was_slash = false;
    for c in path.chars() {
        if c == '/' {
            if last_was_slash {
                continue;
            }
            last_was_slash = true;
        } else {
            last_was_slash = false;
        }
        out.push(c);
    }
    out
}

/// §4.4.1 admission rule, minus the frontier budget check (the caller holds
/// the Store and checks that separately since it requires a query).
pub fn is_admissible(url: &Url, allowed_host: &str, ignore_path_prefixes: &[String], depth: u32, depth_limit: u32) -> bool {
    if url.scheme() != "http" && url.scheme() != "https" {
        return false;
    }
    let Some(host) = url.host_str() else {
        return false;
    };
    if !host.eq_ignore_ascii_case(allowed_host) {
        return false;
    }
    let path = url.path();
    if ignore_path_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
        return false;
    }
    if let Some(ext) = extension_of(path) {
        if EXCLUDED_EXTENSIONS.contains(&ext.to_lowercase().as_str()) {
            return false;
        }
    }
    depth <= depth_limit
}

fn extension_of(path: &str) -> Option<&str> {
    let last_segment = path.rsplit('/').next()?;
    last_segment.rsplit_once('.').map(|(_, ext)| ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalization_is_idempotent() {
        let u = "HTTP://Example.COM:80/a//b/?x=1#frag";
        let once = canonicalize(u).unwrap();
        let twice = canonicalize(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn strips_default_port_and_fragment_and_query() {
        let c = canonicalize("https://example.com:443/a/b/?q=1#x").unwrap();
        assert_eq!(c, "https://example.com/a/b");
    }

    #[test]
    fn keeps_root_slash() {
        let c = canonicalize("https://example.com").unwrap();
        assert_eq!(c, "https://example.com/");
    }

    #[test]
    fn rejects_non_matching_host() {
        let url = Url::parse("https://evil.example.com/a").unwrap();
        assert!(!is_admissible(&url, "example.com", &[], 0, 20));
    }

    #[test]
    fn rejects_excluded_extension() {
        let url = Url::parse("https://example.com/file.pdf").unwrap();
        assert!(!is_admissible(&url, "example.com", &[], 0, 20));
    }

    #[test]
    fn rejects_ignored_prefix() {
        let url = Url::parse("https://example.com/admin/x").unwrap();
        assert!(!is_admissible(
            &url,
            "example.com",
            &["/admin".to_string()],
            0,
            20
        ));
    }
}
