//! Error taxonomy for the ingestion pipeline.
//!
//! Fetch and decode failures are classified so the retry layer can decide
//! what to do with them: transient errors back off and retry, rate-limit
//! signals honor the server-provided delay, everything else propagates.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    /// Network failure or 5xx response. Retried with exponential backoff.
    #[error("transient failure: {0}")]
    Transient(String),

    /// HTTP 429. Retried after the server-provided delay when one is given;
    /// a hinted wait does not consume a retry attempt.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Non-retryable HTTP failure (4xx other than 429, bad URL).
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// Malformed payload or feed. Fails the whole cycle, never retried.
    #[error("decode failure: {0}")]
    Decode(String),
}

impl IngestError {
    /// Errors the retry layer backs off and retries.
    pub fn is_transient(&self) -> bool {
        matches!(self, IngestError::Transient(_))
    }

    /// Classifies a reqwest error. Connection and timeout failures are
    /// transient; everything else (bad URL, TLS misconfiguration) is not.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            IngestError::Transient(err.to_string())
        } else {
            IngestError::Permanent(err.to_string())
        }
    }

    /// Classifies a non-success HTTP status.
    pub fn from_status(status: reqwest::StatusCode, retry_after: Option<Duration>) -> Self {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            IngestError::RateLimited { retry_after }
        } else if status.is_server_error() {
            IngestError::Transient(format!("server returned {status}"))
        } else {
            IngestError::Permanent(format!("server returned {status}"))
        }
    }
}
