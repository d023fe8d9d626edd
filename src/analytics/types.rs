//! Report shapes produced by the aggregator's query surface.
//!
//! Everything here is plain serializable data; the computation lives in
//! the aggregator and anomaly modules.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Four-level service grade used by every view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Excellent => "excellent",
            ServiceStatus::Good => "good",
            ServiceStatus::Fair => "fair",
            ServiceStatus::Poor => "poor",
        }
    }

    /// Threshold grading shared by the route, stop, and health views.
    pub fn from_thresholds(delayed_percent: f64, alert_count: usize) -> Self {
        if delayed_percent > 20.0 || alert_count > 10 {
            ServiceStatus::Poor
        } else if delayed_percent > 10.0 || alert_count > 5 {
            ServiceStatus::Fair
        } else if delayed_percent > 5.0 || alert_count > 2 {
            ServiceStatus::Good
        } else {
            ServiceStatus::Excellent
        }
    }

    /// Score grading used by the combined service summary.
    pub fn from_score(score: i32) -> Self {
        if score >= 80 {
            ServiceStatus::Excellent
        } else if score >= 60 {
            ServiceStatus::Good
        } else if score >= 40 {
            ServiceStatus::Fair
        } else {
            ServiceStatus::Poor
        }
    }
}

/// Aggregate delay statistics over whichever delays are known.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DelayStats {
    /// Records carrying a delay value.
    pub count: usize,
    /// Records with delay > 0.
    pub delayed: usize,
    pub avg_delay: Option<f64>,
    pub min_delay: Option<f64>,
    pub max_delay: Option<f64>,
}

/// Positive delays bucketed by severity: minor <= 300 s, moderate <= 900 s,
/// major above.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DelayBuckets {
    pub minor: usize,
    pub moderate: usize,
    pub major: usize,
}

impl DelayBuckets {
    pub fn add(&mut self, delay: f64) {
        if delay <= 0.0 {
            return;
        }
        if delay <= 300.0 {
            self.minor += 1;
        } else if delay <= 900.0 {
            self.moderate += 1;
        } else {
            self.major += 1;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteSummary {
    pub route_id: String,
    pub prediction_count: usize,
    pub vehicle_count: usize,
    pub alert_count: usize,
    pub delay: DelayStats,
    pub delayed_percent: f64,
    pub buckets: DelayBuckets,
    pub status: ServiceStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopSummary {
    pub stop_id: String,
    pub prediction_count: usize,
    pub delay: DelayStats,
    pub delayed_percent: f64,
    pub status: ServiceStatus,
}

/// Per-type record counts currently held in the buffers.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RecordCounts {
    pub predictions: usize,
    pub vehicle_positions: usize,
    pub trip_updates: usize,
    pub alerts: usize,
    pub routes: u64,
    pub stops: u64,
    pub trips: u64,
}

/// The top-level aggregate view.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryReport {
    pub generated_at: DateTime<Utc>,
    pub counts: RecordCounts,
    pub delay: DelayStats,
    pub buckets: DelayBuckets,
    pub alert_severity: HashMap<String, usize>,
    pub routes: Vec<RouteSummary>,
    pub stops: Vec<StopSummary>,
    pub status: ServiceStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub generated_at: DateTime<Utc>,
    pub total_predictions: usize,
    pub on_time_percent: f64,
    pub delayed_count: usize,
    pub avg_delay: Option<f64>,
    pub active_alerts: usize,
    pub status: ServiceStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct Anomaly {
    pub route_id: String,
    pub stop_id: String,
    pub delay: f64,
    /// How far above the flagging threshold, in seconds.
    pub excess: f64,
}

/// Severity of one grouped finding in an anomaly pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalySeverity {
    Medium,
    High,
}

/// Alert-storm finding: active alerts exceeded the storm threshold.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceDisruption {
    pub active_alerts: usize,
    pub severity: AnomalySeverity,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnomalyReport {
    pub generated_at: DateTime<Utc>,
    pub sample_size: usize,
    pub mean_delay: Option<f64>,
    pub stddev: Option<f64>,
    pub threshold: Option<f64>,
    /// Flagged delay records, grouped into a single finding.
    pub anomalies: Vec<Anomaly>,
    /// Severity of the delay-spike finding; `None` when nothing flagged.
    pub severity: Option<AnomalySeverity>,
    pub confidence: f64,
    pub disruption: Option<ServiceDisruption>,
}

impl AnomalyReport {
    /// High-severity findings in this pass. The service score charges one
    /// penalty per finding, not per flagged record.
    pub fn high_severity_count(&self) -> usize {
        let spike = matches!(self.severity, Some(AnomalySeverity::High)) as usize;
        let storm = self
            .disruption
            .as_ref()
            .is_some_and(|d| d.severity == AnomalySeverity::High) as usize;
        spike + storm
    }
}

/// Health, anomalies, and the score-based overall grade in one report.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSummary {
    pub generated_at: DateTime<Utc>,
    pub health: ServiceHealth,
    pub anomalies: AnomalyReport,
    pub score: i32,
    pub status: ServiceStatus,
}
