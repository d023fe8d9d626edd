//! Source ingestors: fetch raw payloads and normalize them into
//! [`NormalizedRecord`]s.
//!
//! Each source implements [`SourceIngestor`]; the polling engine drives the
//! fetch/normalize pair once per cycle and wraps the result in an
//! [`IngestionOutcome`] for the orchestrator.

mod feed;
mod rest;

pub use feed::{FeedIngestor, FeedKind, FeedStatus};
pub use rest::RestIngestor;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::IngestError;
use crate::model::{NormalizedRecord, RecordSource};

/// One fetched body, labeled with the endpoint or feed it came from.
pub struct RawPart {
    pub label: &'static str,
    pub body: Bytes,
}

/// Everything a single poll cycle pulled from a source.
pub struct RawPayload {
    pub parts: Vec<RawPart>,
}

#[async_trait]
pub trait SourceIngestor: Send + Sync {
    fn name(&self) -> &'static str;

    fn source(&self) -> RecordSource;

    /// Pulls the source's endpoints once. Retry and rate limiting happen
    /// inside, so a returned error is already final for this cycle.
    async fn fetch(&self) -> Result<RawPayload, IngestError>;

    /// Decodes a payload into validated records. Structurally invalid
    /// records are dropped and counted, not surfaced as errors; a payload
    /// that cannot be decoded at all fails the cycle.
    fn normalize(&self, raw: &RawPayload) -> Result<Vec<NormalizedRecord>, IngestError>;

    /// Running total of records dropped by validation.
    fn dropped(&self) -> u64;
}

/// Result of one completed poll cycle, sent to the orchestrator consumer.
#[derive(Debug)]
pub struct IngestionOutcome {
    pub success: bool,
    pub source: RecordSource,
    pub records: Vec<NormalizedRecord>,
    pub count: usize,
    pub captured_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl IngestionOutcome {
    pub fn succeeded(source: RecordSource, records: Vec<NormalizedRecord>) -> Self {
        Self {
            success: true,
            source,
            count: records.len(),
            records,
            captured_at: Utc::now(),
            error: None,
        }
    }

    pub fn failed(source: RecordSource, error: &IngestError) -> Self {
        Self {
            success: false,
            source,
            records: Vec::new(),
            count: 0,
            captured_at: Utc::now(),
            error: Some(error.to_string()),
        }
    }
}
