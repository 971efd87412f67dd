use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use scraper::{Html, Selector};
use url::Url;

use super::error::FetchError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    /// URL the page was requested under (normalized).
    pub url: String,
    /// URL after redirects.
    pub final_url: String,
    pub status: u16,
    pub html: String,
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(Duration::from_secs(10).min(timeout))
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(8))
            .pool_max_idle_per_host(8)
            .build()
            .map_err(|e| FetchError::Http {
                url: String::new(),
                reason: format!("client build failed: {e}"),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let parsed = Url::parse(url).map_err(|_| FetchError::InvalidUrl(url.to_string()))?;
        let res = self.client.get(parsed).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout {
                    url: url.to_string(),
                }
            } else {
                FetchError::Http {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = res.status();
        let final_url = res.url().to_string();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let content_type = res
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        if !content_type.is_empty() && !content_type.contains("html") {
            return Err(FetchError::NotHtml {
                url: url.to_string(),
                content_type,
            });
        }

        let html = res.text().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout {
                    url: url.to_string(),
                }
            } else {
                FetchError::Http {
                    url: url.to_string(),
                    reason: format!("body read failed: {e}"),
                }
            }
        })?;

        Ok(FetchedPage {
            url: url.to_string(),
            final_url,
            status: status.as_u16(),
            html,
        })
    }
}

/// Parse and canonicalize a crawlable URL: http(s) only, fragment dropped,
/// path and query kept as-is.
pub fn normalize_crawl_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut url = Url::parse(trimmed).ok()?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return None;
    }
    url.host_str()?;
    url.set_fragment(None);
    Some(url.to_string())
}

pub fn host_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
}

pub fn is_same_host(candidate: &str, root_host: &str) -> bool {
    Url::parse(candidate)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.eq_ignore_ascii_case(root_host)))
        .unwrap_or(false)
}

fn resolve_href(page_url: &Url, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty()
        || href.starts_with('#')
        || href.starts_with("mailto:")
        || href.starts_with("javascript:")
        || href.starts_with("tel:")
    {
        return None;
    }

    let resolved = page_url.join(href).ok()?;
    normalize_crawl_url(resolved.as_str())
}

/// Same-host, http(s), fragment-free links of a page in document order,
/// each listed once.
pub fn extract_links(html: &str, page_url: &str) -> Vec<String> {
    let Ok(base) = Url::parse(page_url) else {
        return Vec::new();
    };
    let Some(root_host) = base.host_str().map(str::to_string) else {
        return Vec::new();
    };
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };

    let doc = Html::parse_document(html);
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for el in doc.select(&selector) {
        let Some(href) = el.value().attr("href") else {
            continue;
        };
        let Some(resolved) = resolve_href(&base, href) else {
            continue;
        };
        if !is_same_host(&resolved, &root_host) {
            continue;
        }
        if seen.insert(resolved.clone()) {
            out.push(resolved);
        }
    }
    out
}
