//! Pipeline assembly and lifecycle.
//!
//! The orchestrator wires the concrete pieces together — ingestors,
//! polling engines, aggregator, persistence, bus — spawns one task per
//! engine plus the single fan-in consumer, and owns shutdown. Nothing
//! here is global; everything is constructed here and handed down.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::analytics::{
    Aggregator, AnomalyReport, RecordCounts, RouteSummary, ServiceHealth, ServiceSummary,
    SummaryReport,
};
use crate::bus::{BusMessage, ChannelBus, MessageBus};
use crate::config::Settings;
use crate::fetch::{BasicClient, Bearer};
use crate::ingest::{FeedIngestor, FeedStatus, IngestionOutcome, RestIngestor, SourceIngestor};
use crate::poll::{EngineHandle, EngineHealth, PollingEngine};
use crate::ratelimit::RateLimiter;
use crate::retry::RetryPolicy;
use crate::storage::{PersistenceGateway, StoredPrediction};

const OUTCOME_QUEUE_DEPTH: usize = 16;
const BUS_QUEUE_DEPTH: usize = 1024;

/// Combined health report across every subsystem.
#[derive(Debug, Serialize)]
pub struct PipelineHealth {
    pub generated_at: DateTime<Utc>,
    pub engines: Vec<EngineHealth>,
    pub records: RecordCounts,
    pub storage_ok: bool,
    pub published: u64,
    /// Publishes that found no live subscriber.
    pub unobserved: u64,
    pub feeds: Vec<FeedStatus>,
}

pub struct Pipeline {
    aggregator: Arc<Mutex<Aggregator>>,
    gateway: Arc<PersistenceGateway>,
    bus: Arc<ChannelBus>,
    engines: Vec<EngineHandle>,
    tasks: Vec<JoinHandle<()>>,
    consumer: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
    feeds: Option<Arc<FeedIngestor<BasicClient>>>,
}

impl Pipeline {
    /// Builds the production pipeline from settings: the bearer-auth REST
    /// source and the binary feed source, one engine each.
    pub async fn start(settings: &Settings) -> Result<Self> {
        let gateway = PersistenceGateway::connect(&settings.database_url)
            .await
            .context("opening the relational store")?;
        let retry = RetryPolicy::new(
            settings.max_retries,
            settings.retry_base_delay,
            settings.retry_max_delay,
        );

        let rest: Arc<dyn SourceIngestor> = Arc::new(RestIngestor::new(
            Bearer::new(BasicClient::new(), &settings.rest_api_key),
            settings.rest_base_url.clone(),
            settings.route_filter.clone(),
            settings.stop_filter.clone(),
            RateLimiter::per_minute(settings.rate_limit_per_minute),
            retry.clone(),
        ));
        let feed = Arc::new(FeedIngestor::new(
            BasicClient::new(),
            settings.feed_base_url.clone(),
            retry,
            settings.feed_stale_after,
        ));

        let mut pipeline = Self::assemble(
            vec![rest, feed.clone()],
            gateway,
            settings.aggregator_capacity,
            settings.poll_interval,
        );
        pipeline.feeds = Some(feed);
        Ok(pipeline)
    }

    /// Wires the given ingestors into a running pipeline. Split out from
    /// [`start`](Self::start) so tests can substitute sources.
    pub fn assemble(
        ingestors: Vec<Arc<dyn SourceIngestor>>,
        gateway: PersistenceGateway,
        aggregator_capacity: usize,
        poll_interval: Duration,
    ) -> Self {
        let aggregator = Arc::new(Mutex::new(Aggregator::new(aggregator_capacity)));
        let gateway = Arc::new(gateway);
        let bus = Arc::new(ChannelBus::new(BUS_QUEUE_DEPTH));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (outcome_tx, outcome_rx) = mpsc::channel(OUTCOME_QUEUE_DEPTH);

        let mut engines = Vec::with_capacity(ingestors.len());
        let mut tasks = Vec::with_capacity(ingestors.len());
        for ingestor in ingestors {
            let engine = PollingEngine::new(ingestor, poll_interval);
            engines.push(engine.handle());
            tasks.push(tokio::spawn(
                engine.run(outcome_tx.clone(), shutdown_rx.clone()),
            ));
        }
        // The engines hold the only senders; once they stop, the consumer
        // drains and exits.
        drop(outcome_tx);

        let consumer = tokio::spawn(consume(
            outcome_rx,
            Arc::clone(&aggregator),
            Arc::clone(&gateway),
            Arc::clone(&bus),
        ));

        Self {
            aggregator,
            gateway,
            bus,
            engines,
            tasks,
            consumer,
            shutdown,
            feeds: None,
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<BusMessage> {
        self.bus.subscribe()
    }

    pub async fn health(&self) -> PipelineHealth {
        let records = self.aggregator.lock().await.counts();
        PipelineHealth {
            generated_at: Utc::now(),
            engines: self.engines.iter().map(|e| e.health()).collect(),
            records,
            storage_ok: self.gateway.probe().await.is_ok(),
            published: self.bus.published(),
            unobserved: self.bus.unobserved(),
            feeds: self
                .feeds
                .as_ref()
                .map(|f| f.feed_status())
                .unwrap_or_default(),
        }
    }

    pub async fn summary(&self) -> SummaryReport {
        self.aggregator.lock().await.summary()
    }

    pub async fn route_summary(&self) -> Vec<RouteSummary> {
        self.aggregator.lock().await.route_summary()
    }

    pub async fn service_health(&self) -> ServiceHealth {
        self.aggregator.lock().await.service_health()
    }

    pub async fn service_summary(&self) -> ServiceSummary {
        self.aggregator.lock().await.service_summary()
    }

    pub async fn detect_anomalies(&self) -> AnomalyReport {
        self.aggregator.lock().await.detect_anomalies()
    }

    pub async fn recent_predictions(&self, limit: i64) -> Result<Vec<StoredPrediction>> {
        Ok(self.gateway.recent_predictions(limit).await?)
    }

    /// Signals every engine, then waits for the engines and the consumer
    /// to reach their terminal states.
    pub async fn shutdown(self) -> Result<()> {
        info!("shutting down pipeline");
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            task.await.context("engine task panicked")?;
        }
        self.consumer.await.context("consumer task panicked")?;
        info!("pipeline stopped");
        Ok(())
    }
}

/// The single fan-in consumer: aggregate, persist, republish. Channel
/// ordering guarantees each engine's cycles are processed in order.
/// Failed cycles are logged and skipped.
async fn consume(
    mut outcomes: mpsc::Receiver<IngestionOutcome>,
    aggregator: Arc<Mutex<Aggregator>>,
    gateway: Arc<PersistenceGateway>,
    bus: Arc<ChannelBus>,
) {
    while let Some(outcome) = outcomes.recv().await {
        if !outcome.success {
            warn!(
                source = outcome.source.as_str(),
                error = outcome.error.as_deref().unwrap_or("unknown"),
                "skipping failed cycle"
            );
            continue;
        }
        {
            let mut agg = aggregator.lock().await;
            for record in &outcome.records {
                agg.process(record);
            }
        }

        match gateway.store_batch(outcome.source, &outcome.records).await {
            Ok(batch) if batch.failed > 0 => {
                warn!(
                    source = outcome.source.as_str(),
                    failed = batch.failed,
                    total = batch.total,
                    "batch stored partially"
                );
            }
            Ok(_) => {}
            // Storage being down must not stall aggregation or publishing.
            Err(err) => {
                warn!(source = outcome.source.as_str(), error = %err, "batch store failed");
            }
        }

        for record in &outcome.records {
            match BusMessage::for_record(record) {
                Ok(Some(message)) => {
                    if let Err(err) = bus.publish(message).await {
                        warn!(error = %err, "publish failed");
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(id = record.natural_id(), error = %err, "record not publishable");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_pipeline_shuts_down_cleanly() {
        let gateway = PersistenceGateway::connect("sqlite::memory:").await.unwrap();
        let pipeline = Pipeline::assemble(Vec::new(), gateway, 100, Duration::from_secs(15));

        let health = pipeline.health().await;
        assert!(health.storage_ok);
        assert!(health.engines.is_empty());
        assert_eq!(health.records.predictions, 0);
        assert_eq!(health.published, 0);
        assert_eq!(health.unobserved, 0);

        pipeline.shutdown().await.unwrap();
    }
}
