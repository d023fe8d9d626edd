//! HTTP transport shared by both ingestors.
//!
//! [`HttpClient`] is the seam: the REST ingestor wraps a [`BasicClient`]
//! in a [`Bearer`] decorator, the feed ingestor uses it bare, and tests
//! substitute canned responders.

mod auth;
mod basic;

pub use auth::Bearer;
pub use basic::BasicClient;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::IngestError;

#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, req: reqwest::Request) -> reqwest::Result<reqwest::Response>;
}

/// Issues a GET and returns the body bytes, classifying failures so the
/// retry layer can act on them: 429 becomes a rate-limit signal carrying
/// any `Retry-After` hint, 5xx is transient, other non-success statuses
/// are permanent.
pub async fn fetch_bytes<C: HttpClient>(client: &C, url: &str) -> Result<Vec<u8>, IngestError> {
    let parsed = url
        .parse()
        .map_err(|e| IngestError::Permanent(format!("invalid url {url}: {e}")))?;
    let req = reqwest::Request::new(reqwest::Method::GET, parsed);

    let resp = client
        .execute(req)
        .await
        .map_err(IngestError::from_reqwest)?;

    let status = resp.status();
    if !status.is_success() {
        let retry_after = parse_retry_after(resp.headers());
        return Err(IngestError::from_status(status, retry_after));
    }

    let body = resp
        .bytes()
        .await
        .map_err(IngestError::from_reqwest)?;
    Ok(body.to_vec())
}

/// Reads a delay-seconds `Retry-After` header. HTTP-date forms are rare on
/// transit APIs and are ignored.
fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};

    #[test]
    fn test_parse_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("30"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_parse_retry_after_absent_or_date() {
        assert_eq!(parse_retry_after(&HeaderMap::new()), None);

        let mut headers = HeaderMap::new();
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2026 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers), None);
    }
}
