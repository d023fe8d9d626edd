//! Fan-in aggregator: bounded rolling buffers plus the query surface.
//!
//! `process` is append-only and never fails for a structurally valid
//! record. Every query recomputes from current buffer contents, so views
//! are always consistent with each other at the moment they are taken.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::anomaly;
use super::types::{
    AnomalyReport, DelayBuckets, DelayStats, RecordCounts, RouteSummary, ServiceHealth,
    ServiceStatus, ServiceSummary, StopSummary, SummaryReport,
};
use super::utility::{mean, percent};
use crate::model::NormalizedRecord;

#[derive(Debug, Clone)]
pub struct PredictionEntry {
    pub route_id: String,
    pub stop_id: String,
    pub delay: Option<f64>,
    pub arrival_time: Option<DateTime<Utc>>,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct VehicleEntry {
    route_id: Option<String>,
    captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct TripUpdateEntry {
    route_id: Option<String>,
    delay: Option<f64>,
    captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct AlertEntry {
    severity: Option<String>,
    routes: Vec<String>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    captured_at: DateTime<Utc>,
}

impl AlertEntry {
    /// Active when `now` falls inside the period; an unbounded side is
    /// treated as open.
    fn active_at(&self, now: DateTime<Utc>) -> bool {
        self.start.is_none_or(|s| s <= now) && self.end.is_none_or(|e| e >= now)
    }
}

pub struct Aggregator {
    capacity: usize,
    predictions: VecDeque<PredictionEntry>,
    vehicles: VecDeque<VehicleEntry>,
    trip_updates: VecDeque<TripUpdateEntry>,
    alerts: VecDeque<AlertEntry>,
    routes_seen: u64,
    stops_seen: u64,
    trips_seen: u64,
}

fn push_bounded<T>(buf: &mut VecDeque<T>, capacity: usize, entry: T) {
    if buf.len() == capacity {
        buf.pop_front();
    }
    buf.push_back(entry);
}

impl Aggregator {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            predictions: VecDeque::new(),
            vehicles: VecDeque::new(),
            trip_updates: VecDeque::new(),
            alerts: VecDeque::new(),
            routes_seen: 0,
            stops_seen: 0,
            trips_seen: 0,
        }
    }

    /// Appends one record into its type buffer, evicting the oldest entry
    /// once the buffer is at capacity.
    pub fn process(&mut self, record: &NormalizedRecord) {
        match record {
            NormalizedRecord::Prediction(p) => push_bounded(
                &mut self.predictions,
                self.capacity,
                PredictionEntry {
                    route_id: p.route_id.clone(),
                    stop_id: p.stop_id.clone(),
                    delay: p.delay.map(|d| d as f64),
                    arrival_time: p.arrival_time,
                    captured_at: p.captured_at,
                },
            ),
            NormalizedRecord::VehiclePosition(v) => push_bounded(
                &mut self.vehicles,
                self.capacity,
                VehicleEntry {
                    route_id: v.route_id.clone(),
                    captured_at: v.captured_at,
                },
            ),
            NormalizedRecord::TripUpdate(t) => push_bounded(
                &mut self.trip_updates,
                self.capacity,
                TripUpdateEntry {
                    route_id: t.route_id.clone(),
                    delay: t.delay,
                    captured_at: t.captured_at,
                },
            ),
            NormalizedRecord::Alert(a) => push_bounded(
                &mut self.alerts,
                self.capacity,
                AlertEntry {
                    severity: a.severity_level.clone(),
                    routes: a.affected_routes.clone(),
                    start: a.active_period_start,
                    end: a.active_period_end,
                    captured_at: a.captured_at,
                },
            ),
            NormalizedRecord::Route(_) => self.routes_seen += 1,
            NormalizedRecord::Stop(_) => self.stops_seen += 1,
            NormalizedRecord::Trip(_) => {
                // Reference data: counted for health, not buffered.
                self.trips_seen += 1;
            }
        }
        debug!(record_type = record.record_type(), "aggregated record");
    }

    pub fn counts(&self) -> RecordCounts {
        RecordCounts {
            predictions: self.predictions.len(),
            vehicle_positions: self.vehicles.len(),
            trip_updates: self.trip_updates.len(),
            alerts: self.alerts.len(),
            routes: self.routes_seen,
            stops: self.stops_seen,
            trips: self.trips_seen,
        }
    }

    pub fn summary(&self) -> SummaryReport {
        self.summarize(None)
    }

    /// Same as [`summary`](Self::summary), restricted to records captured
    /// within the trailing window.
    pub fn time_window_summary(&self, window: Duration) -> SummaryReport {
        let cutoff = Utc::now() - chrono::Duration::from_std(window).unwrap_or_default();
        self.summarize(Some(cutoff))
    }

    fn summarize(&self, cutoff: Option<DateTime<Utc>>) -> SummaryReport {
        let keep = |captured: DateTime<Utc>| cutoff.is_none_or(|c| captured >= c);

        let predictions: Vec<&PredictionEntry> = self
            .predictions
            .iter()
            .filter(|e| keep(e.captured_at))
            .collect();
        let vehicles: Vec<&VehicleEntry> = self
            .vehicles
            .iter()
            .filter(|e| keep(e.captured_at))
            .collect();
        let trip_updates = self
            .trip_updates
            .iter()
            .filter(|e| keep(e.captured_at))
            .count();
        let alerts: Vec<&AlertEntry> = self
            .alerts
            .iter()
            .filter(|e| keep(e.captured_at))
            .collect();

        let delays: Vec<f64> = predictions.iter().filter_map(|e| e.delay).collect();
        let delay = delay_stats(&delays);
        let mut buckets = DelayBuckets::default();
        for d in &delays {
            buckets.add(*d);
        }

        let mut alert_severity: HashMap<String, usize> = HashMap::new();
        for a in &alerts {
            let key = a.severity.clone().unwrap_or_else(|| "unknown".to_string());
            *alert_severity.entry(key).or_default() += 1;
        }

        let delayed_percent = percent(delay.delayed, predictions.len());
        let status = ServiceStatus::from_thresholds(delayed_percent, alerts.len());

        SummaryReport {
            generated_at: Utc::now(),
            counts: RecordCounts {
                predictions: predictions.len(),
                vehicle_positions: vehicles.len(),
                trip_updates,
                alerts: alerts.len(),
                routes: self.routes_seen,
                stops: self.stops_seen,
                trips: self.trips_seen,
            },
            delay,
            buckets,
            alert_severity,
            routes: self.route_summaries(&predictions, &vehicles, &alerts),
            stops: self.stop_summaries(&predictions),
            status,
        }
    }

    pub fn route_summary(&self) -> Vec<RouteSummary> {
        let predictions: Vec<&PredictionEntry> = self.predictions.iter().collect();
        let vehicles: Vec<&VehicleEntry> = self.vehicles.iter().collect();
        let alerts: Vec<&AlertEntry> = self.alerts.iter().collect();
        self.route_summaries(&predictions, &vehicles, &alerts)
    }

    fn route_summaries(
        &self,
        predictions: &[&PredictionEntry],
        vehicles: &[&VehicleEntry],
        alerts: &[&AlertEntry],
    ) -> Vec<RouteSummary> {
        #[derive(Default)]
        struct Acc {
            delays: Vec<f64>,
            predictions: usize,
            vehicles: usize,
            alerts: usize,
        }

        // BTreeMap keeps route ordering stable across calls.
        let mut by_route: BTreeMap<String, Acc> = BTreeMap::new();
        for p in predictions {
            let acc = by_route.entry(p.route_id.clone()).or_default();
            acc.predictions += 1;
            if let Some(d) = p.delay {
                acc.delays.push(d);
            }
        }
        for v in vehicles {
            if let Some(route_id) = &v.route_id {
                by_route.entry(route_id.clone()).or_default().vehicles += 1;
            }
        }
        for a in alerts {
            for route_id in &a.routes {
                by_route.entry(route_id.clone()).or_default().alerts += 1;
            }
        }

        by_route
            .into_iter()
            .map(|(route_id, acc)| {
                let delay = delay_stats(&acc.delays);
                let mut buckets = DelayBuckets::default();
                for d in &acc.delays {
                    buckets.add(*d);
                }
                let delayed_percent = percent(delay.delayed, acc.predictions);
                let status = ServiceStatus::from_thresholds(delayed_percent, acc.alerts);
                RouteSummary {
                    route_id,
                    prediction_count: acc.predictions,
                    vehicle_count: acc.vehicles,
                    alert_count: acc.alerts,
                    delay,
                    delayed_percent,
                    buckets,
                    status,
                }
            })
            .collect()
    }

    pub fn stop_summary(&self) -> Vec<StopSummary> {
        let predictions: Vec<&PredictionEntry> = self.predictions.iter().collect();
        self.stop_summaries(&predictions)
    }

    fn stop_summaries(&self, predictions: &[&PredictionEntry]) -> Vec<StopSummary> {
        let mut by_stop: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for p in predictions {
            *counts.entry(p.stop_id.clone()).or_default() += 1;
            if let Some(d) = p.delay {
                by_stop.entry(p.stop_id.clone()).or_default().push(d);
            }
        }

        counts
            .into_iter()
            .map(|(stop_id, prediction_count)| {
                let delays = by_stop.remove(&stop_id).unwrap_or_default();
                let delay = delay_stats(&delays);
                let delayed_percent = percent(delay.delayed, prediction_count);
                let status = ServiceStatus::from_thresholds(delayed_percent, 0);
                StopSummary {
                    stop_id,
                    prediction_count,
                    delay,
                    delayed_percent,
                    status,
                }
            })
            .collect()
    }

    pub fn service_health(&self) -> ServiceHealth {
        let now = Utc::now();
        let total = self.predictions.len();
        let delays: Vec<f64> = self.predictions.iter().filter_map(|e| e.delay).collect();
        let delayed = delays.iter().filter(|d| **d > 0.0).count();
        let delayed_percent = percent(delayed, total);
        let active_alerts = self.alerts.iter().filter(|a| a.active_at(now)).count();

        ServiceHealth {
            generated_at: now,
            total_predictions: total,
            on_time_percent: 100.0 - delayed_percent,
            delayed_count: delayed,
            avg_delay: mean(&delays),
            active_alerts,
            status: ServiceStatus::from_thresholds(delayed_percent, active_alerts),
        }
    }

    pub fn detect_anomalies(&self) -> AnomalyReport {
        let now = Utc::now();
        let entries: Vec<PredictionEntry> = self.predictions.iter().cloned().collect();
        let active_alerts = self.alerts.iter().filter(|a| a.active_at(now)).count();
        anomaly::detect(&entries, active_alerts)
    }

    /// Combined report: on-time performance, the anomaly pass, and a
    /// 0-100 score grading the whole service.
    pub fn service_summary(&self) -> ServiceSummary {
        let health = self.service_health();
        let anomalies = self.detect_anomalies();

        let mut score = 100i32;
        if health.total_predictions > 0 {
            if health.on_time_percent < 80.0 {
                score -= 20;
            } else if health.on_time_percent < 90.0 {
                score -= 10;
            }
        }
        score -= 15 * anomalies.high_severity_count() as i32;
        if health.active_alerts > 5 {
            score -= 10;
        }
        let score = score.max(0);

        ServiceSummary {
            generated_at: Utc::now(),
            health,
            anomalies,
            score,
            status: ServiceStatus::from_score(score),
        }
    }

    /// Drops every buffered record and resets the reference counters.
    pub fn clear(&mut self) {
        self.predictions.clear();
        self.vehicles.clear();
        self.trip_updates.clear();
        self.alerts.clear();
        self.routes_seen = 0;
        self.stops_seen = 0;
        self.trips_seen = 0;
    }
}

fn delay_stats(delays: &[f64]) -> DelayStats {
    DelayStats {
        count: delays.len(),
        delayed: delays.iter().filter(|d| **d > 0.0).count(),
        avg_delay: mean(delays),
        min_delay: delays.iter().copied().fold(None, |acc: Option<f64>, d| {
            Some(acc.map_or(d, |a| a.min(d)))
        }),
        max_delay: delays.iter().copied().fold(None, |acc: Option<f64>, d| {
            Some(acc.map_or(d, |a| a.max(d)))
        }),
    }
}
