//! Shared HTTP plumbing for the upstream clients.
//!
//! All three upstream services (analytics, AI controller, curation) are
//! called through a `reqwest::Client` built here with one bounded timeout,
//! and the two paginated listings share [`collect_pages`].

use anyhow::{bail, Result};
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

/// Build a client whose every request is bounded by `timeout`.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .user_agent(concat!("session-curator/", env!("CARGO_PKG_VERSION")))
        .build()?;
    Ok(client)
}

/// `Authorization` header value for the token-authenticated services.
pub fn token_header(token: &str) -> String {
    format!("Token {}", token)
}

/// One page of a `next`-cursor listing.
#[derive(Debug, Deserialize)]
pub struct Page<T> {
    #[serde(default = "Vec::new")]
    pub results: Vec<T>,
    #[serde(default)]
    pub next: Option<String>,
}

/// Items gathered from a paginated listing, plus the fault that cut it
/// short, if any.
#[derive(Debug)]
pub struct Pages<T> {
    pub items: Vec<T>,
    pub pages: usize,
    pub error: Option<anyhow::Error>,
}

/// Follow `next` cursors starting from `first`, accumulating `results`.
///
/// A failure on any page stops the walk and keeps what was collected so
/// far; the failure is returned alongside rather than instead of the items.
/// An empty or absent cursor ends pagination.
pub async fn collect_pages<T, F>(first: RequestBuilder, mut follow: F) -> Pages<T>
where
    T: DeserializeOwned,
    F: FnMut(&str) -> RequestBuilder,
{
    let mut items = Vec::new();
    let mut pages = 0usize;
    let mut request = Some(first);

    while let Some(req) = request.take() {
        let page: Page<T> = match fetch_json(req).await {
            Ok(page) => page,
            Err(error) => {
                return Pages {
                    items,
                    pages,
                    error: Some(error),
                }
            }
        };
        pages += 1;
        items.extend(page.results);

        request = match page.next.as_deref() {
            Some(next) if !next.is_empty() => Some(follow(next)),
            _ => None,
        };
    }

    Pages {
        items,
        pages,
        error: None,
    }
}

/// Send a request and decode a JSON body, treating non-2xx as an error.
pub async fn fetch_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let body_text = response.text().await.unwrap_or_default();
        bail!("HTTP {}: {}", status, truncate(&body_text, 200));
    }
    Ok(response.json::<T>().await?)
}

/// Send a request, discarding the body, treating non-2xx as an error.
pub async fn send_checked(request: RequestBuilder) -> Result<()> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let body_text = response.text().await.unwrap_or_default();
        bail!("HTTP {}: {}", status, truncate(&body_text, 200));
    }
    Ok(())
}

/// Request builder for a `next` cursor, reusing method and headers.
pub fn follow_with<'a>(
    client: &'a reqwest::Client,
    method: Method,
    headers: Vec<(&'static str, String)>,
) -> impl FnMut(&str) -> RequestBuilder + 'a {
    move |url: &str| {
        let mut req = client.request(method.clone(), url);
        for (name, value) in &headers {
            req = req.header(*name, value);
        }
        req
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_tolerates_missing_next() {
        let page: Page<u32> = serde_json::from_str(r#"{"results": [1, 2]}"#).unwrap();
        assert_eq!(page.results, vec![1, 2]);
        assert!(page.next.is_none());
    }

    #[test]
    fn page_accepts_null_next() {
        let page: Page<u32> = serde_json::from_str(r#"{"results": [], "next": null}"#).unwrap();
        assert!(page.results.is_empty());
        assert!(page.next.is_none());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }
}
