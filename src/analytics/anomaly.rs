//! Statistical outlier detection over the prediction buffer.

use chrono::Utc;

use super::aggregator::PredictionEntry;
use super::types::{Anomaly, AnomalyReport, AnomalySeverity, ServiceDisruption};
use super::utility::{mean, sample_stddev};

/// Extreme-event count above which the delay-spike finding is high
/// severity (and confidence rises).
const HIGH_SEVERITY_AFTER: usize = 5;
/// Active alerts above this raise a service-disruption finding.
const ALERT_STORM_THRESHOLD: usize = 10;

/// Flags predictions whose delay exceeds mean + 3 sigma over the given
/// entries (sample standard deviation). One grouped report per pass;
/// fewer than two known delays can never flag anything. An active-alert
/// count past the storm threshold adds a high-severity disruption
/// finding to the same pass.
pub fn detect(entries: &[PredictionEntry], active_alerts: usize) -> AnomalyReport {
    let delays: Vec<f64> = entries.iter().filter_map(|e| e.delay).collect();
    let mean_delay = mean(&delays);
    let stddev = sample_stddev(&delays);

    let threshold = match (mean_delay, stddev) {
        (Some(m), Some(s)) => Some(m + 3.0 * s),
        _ => None,
    };

    let anomalies: Vec<Anomaly> = match threshold {
        Some(t) => entries
            .iter()
            .filter_map(|e| {
                let delay = e.delay?;
                (delay > t).then(|| Anomaly {
                    route_id: e.route_id.clone(),
                    stop_id: e.stop_id.clone(),
                    delay,
                    excess: delay - t,
                })
            })
            .collect(),
        None => Vec::new(),
    };

    let severity = if anomalies.is_empty() {
        None
    } else if anomalies.len() > HIGH_SEVERITY_AFTER {
        Some(AnomalySeverity::High)
    } else {
        Some(AnomalySeverity::Medium)
    };
    // More extreme events mean the deviation is real rather than noise.
    let confidence = if anomalies.len() > HIGH_SEVERITY_AFTER {
        0.85
    } else {
        0.70
    };

    let disruption = (active_alerts > ALERT_STORM_THRESHOLD).then(|| ServiceDisruption {
        active_alerts,
        severity: AnomalySeverity::High,
    });

    AnomalyReport {
        generated_at: Utc::now(),
        sample_size: delays.len(),
        mean_delay,
        stddev,
        threshold,
        anomalies,
        severity,
        confidence,
        disruption,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(delay: Option<f64>) -> PredictionEntry {
        PredictionEntry {
            route_id: "Red".to_string(),
            stop_id: "place-sstat".to_string(),
            delay,
            arrival_time: None,
            captured_at: Utc::now(),
        }
    }

    #[test]
    fn test_uniform_delays_produce_no_anomalies() {
        let entries: Vec<_> = (0..20).map(|_| entry(Some(120.0))).collect();
        let report = detect(&entries, 0);
        assert_eq!(report.stddev, Some(0.0));
        assert!(report.anomalies.is_empty());
        assert_eq!(report.severity, None);
        assert!(report.disruption.is_none());
        assert_eq!(report.high_severity_count(), 0);
    }

    #[test]
    fn test_extreme_outlier_flagged_as_medium() {
        let mut entries: Vec<_> = (0..30).map(|_| entry(Some(60.0))).collect();
        entries.push(entry(Some(3000.0)));
        let report = detect(&entries, 0);
        assert_eq!(report.anomalies.len(), 1);
        assert_eq!(report.anomalies[0].delay, 3000.0);
        assert!(report.anomalies[0].excess > 0.0);
        assert_eq!(report.severity, Some(AnomalySeverity::Medium));
        assert_eq!(report.confidence, 0.70);
        assert_eq!(report.high_severity_count(), 0);
    }

    #[test]
    fn test_many_extremes_escalate_to_high() {
        let mut entries: Vec<_> = (0..100).map(|_| entry(Some(60.0))).collect();
        for _ in 0..6 {
            entries.push(entry(Some(3500.0)));
        }
        let report = detect(&entries, 0);
        assert!(report.anomalies.len() > 5);
        assert_eq!(report.severity, Some(AnomalySeverity::High));
        assert_eq!(report.confidence, 0.85);
        assert_eq!(report.high_severity_count(), 1);
    }

    #[test]
    fn test_alert_storm_raises_disruption() {
        let entries: Vec<_> = (0..10).map(|_| entry(Some(60.0))).collect();
        let report = detect(&entries, 11);
        let disruption = report.disruption.as_ref().unwrap();
        assert_eq!(disruption.active_alerts, 11);
        assert_eq!(disruption.severity, AnomalySeverity::High);
        assert_eq!(report.high_severity_count(), 1);
    }

    #[test]
    fn test_alert_storm_threshold_is_exclusive() {
        let report = detect(&[], 10);
        assert!(report.disruption.is_none());
        assert_eq!(report.high_severity_count(), 0);
    }

    #[test]
    fn test_too_few_samples_never_flag() {
        let report = detect(&[entry(Some(3000.0))], 0);
        assert!(report.threshold.is_none());
        assert!(report.anomalies.is_empty());
        assert_eq!(report.severity, None);
    }

    #[test]
    fn test_missing_delays_excluded_from_sample() {
        let entries = vec![entry(None), entry(Some(60.0)), entry(None)];
        let report = detect(&entries, 0);
        assert_eq!(report.sample_size, 1);
        assert!(report.anomalies.is_empty());
    }
}
