//! Record republishing.
//!
//! Downstream consumers get every event record as JSON on a per-type
//! topic. [`MessageBus`] is the transport seam; [`ChannelBus`] is the
//! in-process implementation backed by a tokio broadcast channel, which
//! keeps delivery at-least-once for every live subscriber.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

use crate::model::NormalizedRecord;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("bus closed")]
    Closed,
}

/// One published event: per-type topic, natural-id key, JSON payload with
/// RFC 3339 datetimes.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: &'static str,
    pub key: String,
    pub payload: String,
}

impl BusMessage {
    /// `None` for reference records, which are persisted but never
    /// republished.
    pub fn for_record(record: &NormalizedRecord) -> Result<Option<Self>, BusError> {
        let Some(topic) = record.topic() else {
            return Ok(None);
        };
        Ok(Some(Self {
            topic,
            key: record.natural_id().to_string(),
            payload: serde_json::to_string(record)?,
        }))
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, message: BusMessage) -> Result<(), BusError>;
}

pub struct ChannelBus {
    tx: broadcast::Sender<BusMessage>,
    published: AtomicU64,
    unobserved: AtomicU64,
}

impl ChannelBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            published: AtomicU64::new(0),
            unobserved: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Messages published while no subscriber was attached.
    pub fn unobserved(&self) -> u64 {
        self.unobserved.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MessageBus for ChannelBus {
    async fn publish(&self, message: BusMessage) -> Result<(), BusError> {
        debug!(topic = message.topic, key = %message.key, "publishing record");
        self.published.fetch_add(1, Ordering::Relaxed);
        // A send error only means nobody is subscribed right now; the
        // pipeline keeps running either way.
        if self.tx.send(message).is_err() {
            self.unobserved.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}
