//! Rolling aggregation and service-quality analysis.

mod aggregator;
mod anomaly;
mod types;
mod utility;

pub use aggregator::{Aggregator, PredictionEntry};
pub use types::{
    Anomaly, AnomalyReport, AnomalySeverity, DelayBuckets, DelayStats, RecordCounts, RouteSummary,
    ServiceDisruption, ServiceHealth, ServiceStatus, ServiceSummary, StopSummary, SummaryReport,
};
