//! Fixed-interval polling engine, one per source.
//!
//! Each engine owns its ingestor and loops Idle → Polling → Idle until the
//! shutdown channel flips. Every cycle sends an outcome to the orchestrator
//! over an `mpsc` channel; failed cycles carry the error and no records. A
//! failure streak of five or more marks the engine degraded without
//! stopping it.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, instrument, warn};

use crate::ingest::{IngestionOutcome, SourceIngestor};
use crate::model::NormalizedRecord;

const DEGRADED_AFTER: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Polling,
    Stopped,
}

impl EngineState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => EngineState::Polling,
            2 => EngineState::Stopped,
            _ => EngineState::Idle,
        }
    }
}

/// Point-in-time view of one engine, reported by the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub source: &'static str,
    pub state: EngineState,
    pub healthy: bool,
    pub cycles: u64,
    pub total_ingested: u64,
    pub total_errors: u64,
    pub consecutive_failures: u64,
    pub records_dropped: u64,
}

struct Shared {
    state: AtomicU8,
    cycles: AtomicU64,
    total_ingested: AtomicU64,
    total_errors: AtomicU64,
    consecutive_failures: AtomicU64,
}

/// Query handle that outlives the running engine task.
#[derive(Clone)]
pub struct EngineHandle {
    ingestor: Arc<dyn SourceIngestor>,
    shared: Arc<Shared>,
}

impl EngineHandle {
    pub fn health(&self) -> EngineHealth {
        let streak = self.shared.consecutive_failures.load(Ordering::Relaxed);
        EngineHealth {
            source: self.ingestor.name(),
            state: EngineState::from_u8(self.shared.state.load(Ordering::Relaxed)),
            healthy: streak < DEGRADED_AFTER,
            cycles: self.shared.cycles.load(Ordering::Relaxed),
            total_ingested: self.shared.total_ingested.load(Ordering::Relaxed),
            total_errors: self.shared.total_errors.load(Ordering::Relaxed),
            consecutive_failures: streak,
            records_dropped: self.ingestor.dropped(),
        }
    }
}

pub struct PollingEngine {
    ingestor: Arc<dyn SourceIngestor>,
    interval: Duration,
    shared: Arc<Shared>,
}

impl PollingEngine {
    pub fn new(ingestor: Arc<dyn SourceIngestor>, interval: Duration) -> Self {
        Self {
            ingestor,
            interval,
            shared: Arc::new(Shared {
                state: AtomicU8::new(EngineState::Idle as u8),
                cycles: AtomicU64::new(0),
                total_ingested: AtomicU64::new(0),
                total_errors: AtomicU64::new(0),
                consecutive_failures: AtomicU64::new(0),
            }),
        }
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            ingestor: Arc::clone(&self.ingestor),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Poll loop. Returns when shutdown flips or the outcome channel
    /// closes; an in-flight cycle always finishes first.
    #[instrument(skip_all, fields(source = self.ingestor.name()))]
    pub async fn run(
        self,
        outcomes: mpsc::Sender<IngestionOutcome>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(interval_secs = self.interval.as_secs(), "engine started");
        while !*shutdown.borrow() {
            self.shared
                .state
                .store(EngineState::Polling as u8, Ordering::Relaxed);
            let started = tokio::time::Instant::now();
            let result = self.cycle().await;
            let elapsed = started.elapsed();
            self.shared.cycles.fetch_add(1, Ordering::Relaxed);

            match result {
                Ok(records) => {
                    self.shared
                        .total_ingested
                        .fetch_add(records.len() as u64, Ordering::Relaxed);
                    self.shared.consecutive_failures.store(0, Ordering::Relaxed);
                    info!(
                        count = records.len(),
                        elapsed_ms = elapsed.as_millis() as u64,
                        "cycle complete"
                    );
                    let outcome = IngestionOutcome::succeeded(self.ingestor.source(), records);
                    if outcomes.send(outcome).await.is_err() {
                        // Consumer is gone; nothing left to poll for.
                        break;
                    }
                }
                Err(err) => {
                    self.shared.total_errors.fetch_add(1, Ordering::Relaxed);
                    let streak = self
                        .shared
                        .consecutive_failures
                        .fetch_add(1, Ordering::Relaxed)
                        + 1;
                    if streak >= DEGRADED_AFTER {
                        error!(%err, streak, "engine degraded, continuing to poll");
                    } else {
                        warn!(%err, streak, "cycle failed");
                    }
                    let outcome = IngestionOutcome::failed(self.ingestor.source(), &err);
                    if outcomes.send(outcome).await.is_err() {
                        break;
                    }
                }
            }

            self.shared
                .state
                .store(EngineState::Idle as u8, Ordering::Relaxed);
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => {}
            }
        }
        self.shared
            .state
            .store(EngineState::Stopped as u8, Ordering::Relaxed);
        info!("engine stopped");
    }

    async fn cycle(&self) -> Result<Vec<NormalizedRecord>, crate::error::IngestError> {
        let raw = self.ingestor.fetch().await?;
        self.ingestor.normalize(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IngestError;
    use crate::ingest::RawPayload;
    use crate::model::{test_support, RecordSource};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    struct StubIngestor {
        failing: AtomicBool,
    }

    impl StubIngestor {
        fn new(failing: bool) -> Self {
            Self {
                failing: AtomicBool::new(failing),
            }
        }
    }

    #[async_trait]
    impl SourceIngestor for StubIngestor {
        fn name(&self) -> &'static str {
            "stub"
        }

        fn source(&self) -> RecordSource {
            RecordSource::RestApi
        }

        async fn fetch(&self) -> Result<RawPayload, IngestError> {
            if self.failing.load(Ordering::Relaxed) {
                Err(IngestError::Transient("stub failure".into()))
            } else {
                Ok(RawPayload { parts: Vec::new() })
            }
        }

        fn normalize(&self, _raw: &RawPayload) -> Result<Vec<NormalizedRecord>, IngestError> {
            Ok(vec![test_support::prediction("Red", "s1", Some(30))])
        }

        fn dropped(&self) -> u64 {
            0
        }
    }

    fn start(
        failing: bool,
    ) -> (
        EngineHandle,
        mpsc::Receiver<IngestionOutcome>,
        watch::Sender<bool>,
        tokio::task::JoinHandle<()>,
    ) {
        let engine = PollingEngine::new(
            Arc::new(StubIngestor::new(failing)),
            Duration::from_secs(15),
        );
        let handle = engine.handle();
        let (tx, rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(engine.run(tx, shutdown_rx));
        (handle, rx, shutdown_tx, task)
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_cycles_send_outcomes() {
        let (handle, mut rx, shutdown, task) = start(false);

        let first = rx.recv().await.unwrap();
        assert!(first.success);
        assert_eq!(first.count, 1);

        tokio::time::advance(Duration::from_secs(16)).await;
        let second = rx.recv().await.unwrap();
        assert!(second.success);

        let health = handle.health();
        assert!(health.healthy);
        assert_eq!(health.total_ingested, 2);
        assert_eq!(health.total_errors, 0);

        shutdown.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(handle.health().state, EngineState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_streak_reported_and_degrades() {
        let (handle, mut rx, shutdown, task) = start(true);

        // Each failed cycle still produces an outcome; receiving it is the
        // synchronization point for that cycle.
        for _ in 0..6 {
            let outcome = rx.recv().await.unwrap();
            assert!(!outcome.success);
            assert!(outcome.records.is_empty());
            assert!(outcome.error.is_some());
        }

        let health = handle.health();
        assert!(health.total_errors >= DEGRADED_AFTER);
        assert!(!health.healthy);
        assert_eq!(health.total_ingested, 0);

        shutdown.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_sleep() {
        let (handle, mut rx, shutdown, task) = start(false);
        let _ = rx.recv().await.unwrap();

        // Engine is mid-sleep; the signal should end it without waiting
        // out the interval.
        shutdown.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(handle.health().state, EngineState::Stopped);
        assert_eq!(handle.health().cycles, 1);
    }
}
