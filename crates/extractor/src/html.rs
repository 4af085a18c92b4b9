use scraper::{Html, Selector};
use url::Url;

use crawlcorpus_core::{CrawlError, Extracted};

pub fn parse(html_bytes: &[u8], base_url: &str) -> Result<Extracted, CrawlError> {
    let html_str = String::from_utf8_lossy(html_bytes);
    let html_len = html_str.len();
    let base = Url::parse(base_url).map_err(|e| CrawlError::InvalidUrl(e.to_string()))?;

    let document = Html::parse_document(&html_str);

    let title = selector("title")
        .and_then(|s| document.select(&s).next())
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty());

    let main_text = selector("body")
        .and_then(|s| document.select(&s).next())
        .map(|el| {
            el.text()
                .collect::<Vec<_>>()
                .join(" ")
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default();

    let outlinks = extract_outlinks(&document, &base);

    let language = selector("html")
        .and_then(|s| document.select(&s).next())
        .and_then(|el| el.value().attr("lang").map(|s| s.to_string()));

    if main_text.is_empty() && title.is_none() {
        return Err(CrawlError::Extraction("no extractable content".into()));
    }

    Ok(Extracted {
        title,
        main_text,
        outlinks,
        language,
        html_len,
    })
}

/// Re-extraction pass for marginal-quality pages (§4.4.3): tries a priority
/// list of likely content containers instead of the whole `<body>`, falling
/// back to `<body>` text with common boilerplate tags excluded.
pub fn parse_alternate(html_bytes: &[u8], base_url: &str) -> Result<Extracted, CrawlError> {
    let html_str = String::from_utf8_lossy(html_bytes);
    let html_len = html_str.len();
    let base = Url::parse(base_url).map_err(|e| CrawlError::InvalidUrl(e.to_string()))?;

    let document = Html::parse_document(&html_str);

    let title = selector("title")
        .and_then(|s| document.select(&s).next())
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty());

    const CONTENT_CONTAINERS: &[&str] =
        &["article", "main", "[role=main]", "#content", ".content", ".post", ".entry-content"];
    let main_text = CONTENT_CONTAINERS
        .iter()
        .find_map(|sel| {
            let sel = selector(sel)?;
            document.select(&sel).next().map(|el| collapse_text(el.text()))
        })
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| body_text_excluding_boilerplate(&document));

    let outlinks = extract_outlinks(&document, &base);

    let language = selector("html")
        .and_then(|s| document.select(&s).next())
        .and_then(|el| el.value().attr("lang").map(|s| s.to_string()));

    if main_text.is_empty() && title.is_none() {
        return Err(CrawlError::Extraction("no extractable content".into()));
    }

    Ok(Extracted { title, main_text, outlinks, language, html_len })
}

fn collapse_text<'a>(fragments: impl Iterator<Item = &'a str>) -> String {
    fragments.collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

const BOILERPLATE_TAGS: &str = "nav, header, footer, aside, script, style";

/// Body text with common boilerplate containers' own text excluded.
fn body_text_excluding_boilerplate(document: &Html) -> String {
    let Some(body_sel) = selector("body") else { return String::new() };
    let Some(body) = document.select(&body_sel).next() else { return String::new() };
    let Some(boilerplate_sel) = selector(BOILERPLATE_TAGS) else {
        return collapse_text(body.text());
    };
    let excluded: std::collections::HashSet<_> = document.select(&boilerplate_sel).map(|el| el.id()).collect();
    let text = body
        .descendants()
        .filter_map(|node| node.value().as_text().map(|t| (node, t)))
        .filter(|(node, _)| node.ancestors().all(|a| !excluded.contains(&a.id())))
        .map(|(_, t)| t.as_ref())
        .collect::<Vec<_>>()
        .join(" ");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn selector(s: &str) -> Option<Selector> {
    Selector::parse(s).ok()
}

/// Resolves every `<a href>` to a fully-qualified absolute URL (§6: "Outlinks
/// are fully-resolved absolute URLs"), dropping non-navigable schemes.
fn extract_outlinks(document: &Html, base: &Url) -> Vec<String> {
    let Some(sel) = selector("a[href]") else {
        return Vec::new();
    };
    document
        .select(&sel)
        .filter_map(|el| {
            let href = el.value().attr("href")?;
            if href.is_empty()
                || href.starts_with('#')
                || href.starts_with("javascript:")
                || href.starts_with("mailto:")
                || href.starts_with("tel:")
                || href.starts_with("data:")
            {
                return None;
            }
            base.join(href).ok().map(|u| u.to_string())
        })
        .collect()
}
