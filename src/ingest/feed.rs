//! GTFS-Realtime binary feed source.
//!
//! Pulls the three protobuf feeds (vehicle positions, trip updates,
//! alerts), decodes them with the generated `transit_realtime` types, and
//! walks every entity presence-first: an absent optional field becomes
//! `None`, never a protobuf default.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prost::Message;
use tracing::{debug, warn};

use super::{IngestError, NormalizedRecord, RawPart, RawPayload, RecordSource, SourceIngestor};
use crate::fetch::{fetch_bytes, HttpClient};
use crate::gtfs_rt::{
    alert::{Effect, SeverityLevel},
    vehicle_position::{CongestionLevel, OccupancyStatus, VehicleStopStatus},
    FeedMessage, TranslatedString,
};
use crate::model::{Alert, TripUpdate, VehiclePosition};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedKind {
    VehiclePositions,
    TripUpdates,
    Alerts,
}

impl FeedKind {
    pub const ALL: [FeedKind; 3] = [
        FeedKind::VehiclePositions,
        FeedKind::TripUpdates,
        FeedKind::Alerts,
    ];

    fn path(&self) -> &'static str {
        match self {
            FeedKind::VehiclePositions => "VehiclePositions.pb",
            FeedKind::TripUpdates => "TripUpdates.pb",
            FeedKind::Alerts => "Alerts.pb",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            FeedKind::VehiclePositions => "vehicle_positions",
            FeedKind::TripUpdates => "trip_updates",
            FeedKind::Alerts => "alerts",
        }
    }

    fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.label() == label)
    }
}

/// Freshness of one feed category, derived from its envelope timestamp.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FeedStatus {
    pub feed: &'static str,
    pub last_updated: Option<DateTime<Utc>>,
    pub age: Option<Duration>,
    pub stale: bool,
}

pub struct FeedIngestor<C> {
    client: C,
    base_url: String,
    retry: RetryPolicy,
    stale_after: Duration,
    freshness: Mutex<HashMap<FeedKind, DateTime<Utc>>>,
    dropped: AtomicU64,
}

impl<C: HttpClient> FeedIngestor<C> {
    pub fn new(
        client: C,
        base_url: impl Into<String>,
        retry: RetryPolicy,
        stale_after: Duration,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            retry,
            stale_after,
            freshness: Mutex::new(HashMap::new()),
            dropped: AtomicU64::new(0),
        }
    }

    /// Freshness of every feed category. Informational only; a stale feed
    /// keeps being ingested.
    pub fn feed_status(&self) -> Vec<FeedStatus> {
        let freshness = self.freshness.lock().expect("freshness lock poisoned");
        let now = Utc::now();
        FeedKind::ALL
            .into_iter()
            .map(|kind| {
                let last_updated = freshness.get(&kind).copied();
                let age = last_updated
                    .and_then(|t| (now - t).to_std().ok());
                let stale = match age {
                    Some(age) => age > self.stale_after,
                    None => true,
                };
                FeedStatus {
                    feed: kind.label(),
                    last_updated,
                    age,
                    stale,
                }
            })
            .collect()
    }

    fn note_header(&self, kind: FeedKind, epoch_seconds: Option<u64>) {
        if let Some(ts) = epoch_seconds.and_then(|s| DateTime::from_timestamp(s as i64, 0)) {
            self.freshness
                .lock()
                .expect("freshness lock poisoned")
                .insert(kind, ts);
        }
    }

    fn drop_invalid(&self, record: &NormalizedRecord, reason: &dyn std::fmt::Display) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        warn!(
            record_type = record.record_type(),
            id = record.natural_id(),
            %reason,
            "dropping invalid record"
        );
    }
}

#[async_trait]
impl<C: HttpClient> SourceIngestor for FeedIngestor<C> {
    fn name(&self) -> &'static str {
        "gtfs_rt"
    }

    fn source(&self) -> RecordSource {
        RecordSource::GtfsRt
    }

    async fn fetch(&self) -> Result<RawPayload, IngestError> {
        let mut parts = Vec::with_capacity(FeedKind::ALL.len());
        let mut last_error = None;
        for kind in FeedKind::ALL {
            let url = format!("{}/{}", self.base_url.trim_end_matches('/'), kind.path());
            match self.retry.run(|| fetch_bytes(&self.client, &url)).await {
                Ok(body) => {
                    debug!(feed = kind.label(), bytes = body.len(), "fetched feed");
                    parts.push(RawPart {
                        label: kind.label(),
                        body: body.into(),
                    });
                }
                // One dead category should not starve the others.
                Err(err) => {
                    warn!(feed = kind.label(), error = %err, "feed category unavailable");
                    last_error = Some(err);
                }
            }
        }
        if parts.is_empty() {
            return Err(last_error
                .unwrap_or_else(|| IngestError::Transient("no feed categories fetched".into())));
        }
        Ok(RawPayload { parts })
    }

    fn normalize(&self, raw: &RawPayload) -> Result<Vec<NormalizedRecord>, IngestError> {
        let captured_at = Utc::now();
        let mut records = Vec::new();
        for part in &raw.parts {
            let Some(kind) = FeedKind::from_label(part.label) else {
                continue;
            };
            let message = FeedMessage::decode(part.body.as_ref())
                .map_err(|e| IngestError::Decode(format!("{} feed: {e}", part.label)))?;
            self.note_header(kind, message.header.timestamp);

            for entity in &message.entity {
                if entity.is_deleted() {
                    continue;
                }
                let record = match kind {
                    FeedKind::VehiclePositions => {
                        entity.vehicle.as_ref().and_then(|vp| {
                            vehicle_record(&entity.id, vp, captured_at)
                        })
                    }
                    FeedKind::TripUpdates => entity
                        .trip_update
                        .as_ref()
                        .map(|tu| trip_update_record(&entity.id, tu, captured_at)),
                    FeedKind::Alerts => entity
                        .alert
                        .as_ref()
                        .map(|a| alert_record(&entity.id, a, captured_at)),
                };
                let Some(record) = record else { continue };
                match record.validate() {
                    Ok(()) => records.push(record),
                    Err(reason) => self.drop_invalid(&record, &reason),
                }
            }
        }
        Ok(records)
    }

    fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// A vehicle entity without a position carries nothing we aggregate on.
fn vehicle_record(
    entity_id: &str,
    vp: &crate::gtfs_rt::VehiclePosition,
    captured_at: DateTime<Utc>,
) -> Option<NormalizedRecord> {
    let position = vp.position.as_ref()?;
    let vehicle_id = vp
        .vehicle
        .as_ref()
        .and_then(|v| v.id.clone())
        .unwrap_or_else(|| entity_id.to_string());
    Some(NormalizedRecord::VehiclePosition(VehiclePosition {
        vehicle_id,
        trip_id: vp.trip.as_ref().and_then(|t| t.trip_id.clone()),
        route_id: vp.trip.as_ref().and_then(|t| t.route_id.clone()),
        stop_id: vp.stop_id.clone(),
        latitude: position.latitude as f64,
        longitude: position.longitude as f64,
        bearing: position.bearing.map(|b| b as f64),
        speed: position.speed.map(|s| s as f64),
        current_status: vp
            .current_status
            .and_then(|v| VehicleStopStatus::try_from(v).ok())
            .map(|s| s.as_str_name().to_ascii_lowercase()),
        congestion_level: vp
            .congestion_level
            .and_then(|v| CongestionLevel::try_from(v).ok())
            .map(congestion_str)
            .map(String::from),
        occupancy_status: vp
            .occupancy_status
            .and_then(|v| OccupancyStatus::try_from(v).ok())
            .map(|s| s.as_str_name().to_ascii_lowercase()),
        source: RecordSource::GtfsRt,
        captured_at,
    }))
}

fn trip_update_record(
    entity_id: &str,
    tu: &crate::gtfs_rt::TripUpdate,
    captured_at: DateTime<Utc>,
) -> NormalizedRecord {
    // Mean of whichever arrival/departure delays are actually present.
    let delays: Vec<f64> = tu
        .stop_time_update
        .iter()
        .flat_map(|stu| {
            [
                stu.arrival.as_ref().and_then(|e| e.delay),
                stu.departure.as_ref().and_then(|e| e.delay),
            ]
        })
        .flatten()
        .map(f64::from)
        .collect();
    let delay = if delays.is_empty() {
        None
    } else {
        Some(delays.iter().sum::<f64>() / delays.len() as f64)
    };

    let trip_id = tu
        .trip
        .trip_id
        .clone()
        .unwrap_or_else(|| entity_id.to_string());

    NormalizedRecord::TripUpdate(TripUpdate {
        trip_id,
        route_id: tu.trip.route_id.clone(),
        vehicle_id: tu.vehicle.as_ref().and_then(|v| v.id.clone()),
        delay,
        stop_time_update_count: tu.stop_time_update.len(),
        source: RecordSource::GtfsRt,
        captured_at,
    })
}

fn alert_record(
    entity_id: &str,
    alert: &crate::gtfs_rt::Alert,
    captured_at: DateTime<Utc>,
) -> NormalizedRecord {
    let mut affected_routes = Vec::new();
    let mut affected_stops = Vec::new();
    let mut affected_trips = Vec::new();
    for selector in &alert.informed_entity {
        if let Some(route_id) = &selector.route_id {
            if !affected_routes.contains(route_id) {
                affected_routes.push(route_id.clone());
            }
        }
        if let Some(stop_id) = &selector.stop_id {
            if !affected_stops.contains(stop_id) {
                affected_stops.push(stop_id.clone());
            }
        }
        if let Some(trip_id) = selector.trip.as_ref().and_then(|t| t.trip_id.clone()) {
            if !affected_trips.contains(&trip_id) {
                affected_trips.push(trip_id);
            }
        }
    }

    let period = alert.active_period.first();
    NormalizedRecord::Alert(Alert {
        alert_id: entity_id.to_string(),
        header_text: translated(alert.header_text.as_ref()),
        description_text: translated(alert.description_text.as_ref()),
        url: translated(alert.url.as_ref()),
        effect: alert
            .effect
            .and_then(|v| Effect::try_from(v).ok())
            .map(|e| e.as_str_name().to_ascii_lowercase()),
        severity_level: alert
            .severity_level
            .and_then(|v| SeverityLevel::try_from(v).ok())
            .map(severity_str)
            .map(String::from),
        affected_routes,
        affected_stops,
        affected_trips,
        active_period_start: period
            .and_then(|p| p.start)
            .and_then(|s| DateTime::from_timestamp(s as i64, 0)),
        active_period_end: period
            .and_then(|p| p.end)
            .and_then(|e| DateTime::from_timestamp(e as i64, 0)),
        source: RecordSource::GtfsRt,
        captured_at,
    })
}

fn translated(text: Option<&TranslatedString>) -> Option<String> {
    text?.translation.first().map(|t| t.text.clone())
}

fn congestion_str(level: CongestionLevel) -> &'static str {
    match level {
        CongestionLevel::UnknownCongestionLevel => "unknown",
        CongestionLevel::RunningSmoothly => "smooth",
        CongestionLevel::StopAndGo => "moderate",
        CongestionLevel::Congestion | CongestionLevel::SevereCongestion => "severe",
    }
}

fn severity_str(level: SeverityLevel) -> &'static str {
    match level {
        SeverityLevel::UnknownSeverity => "unknown",
        SeverityLevel::Info => "info",
        SeverityLevel::Warning => "warning",
        SeverityLevel::Severe => "severe",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::BasicClient;
    use crate::gtfs_rt::{
        trip_update::{StopTimeEvent, StopTimeUpdate},
        EntitySelector, FeedEntity, FeedHeader, Position, TimeRange, TripDescriptor,
        VehicleDescriptor,
    };

    fn ingestor() -> FeedIngestor<BasicClient> {
        FeedIngestor::new(
            BasicClient::new(),
            "https://example.test/realtime",
            RetryPolicy::new(0, Duration::from_millis(1), Duration::from_millis(1)),
            Duration::from_secs(15 * 60),
        )
    }

    fn envelope(entities: Vec<FeedEntity>, timestamp: Option<u64>) -> FeedMessage {
        FeedMessage {
            header: FeedHeader {
                gtfs_realtime_version: "2.0".to_string(),
                incrementality: None,
                timestamp,
                feed_version: None,
            },
            entity: entities,
        }
    }

    fn payload(kind: FeedKind, message: &FeedMessage) -> RawPayload {
        RawPayload {
            parts: vec![RawPart {
                label: kind.label(),
                body: message.encode_to_vec().into(),
            }],
        }
    }

    fn stop_time(arrival: Option<i32>, departure: Option<i32>) -> StopTimeUpdate {
        StopTimeUpdate {
            stop_sequence: None,
            stop_id: None,
            arrival: arrival.map(|d| StopTimeEvent {
                delay: Some(d),
                time: None,
                uncertainty: None,
            }),
            departure: departure.map(|d| StopTimeEvent {
                delay: Some(d),
                time: None,
                uncertainty: None,
            }),
            schedule_relationship: None,
        }
    }

    #[test]
    fn test_trip_update_delay_is_mean_of_present_events() {
        let tu = crate::gtfs_rt::TripUpdate {
            trip: TripDescriptor {
                trip_id: Some("trip-1".into()),
                route_id: Some("Red".into()),
                ..Default::default()
            },
            vehicle: None,
            stop_time_update: vec![
                stop_time(Some(60), Some(120)),
                stop_time(Some(180), None),
                stop_time(None, None),
            ],
            timestamp: None,
            delay: None,
        };
        let message = envelope(
            vec![FeedEntity {
                id: "e1".into(),
                is_deleted: None,
                trip_update: Some(tu),
                vehicle: None,
                alert: None,
            }],
            Some(1_000),
        );

        let records = ingestor()
            .normalize(&payload(FeedKind::TripUpdates, &message))
            .unwrap();
        assert_eq!(records.len(), 1);
        let NormalizedRecord::TripUpdate(t) = &records[0] else {
            panic!("expected trip update");
        };
        assert_eq!(t.trip_id, "trip-1");
        assert_eq!(t.delay, Some(120.0));
        assert_eq!(t.stop_time_update_count, 3);
    }

    #[test]
    fn test_trip_update_without_delays_has_none() {
        let tu = crate::gtfs_rt::TripUpdate {
            trip: TripDescriptor::default(),
            vehicle: None,
            stop_time_update: vec![stop_time(None, None)],
            timestamp: None,
            delay: None,
        };
        let message = envelope(
            vec![FeedEntity {
                id: "e1".into(),
                is_deleted: None,
                trip_update: Some(tu),
                vehicle: None,
                alert: None,
            }],
            None,
        );
        let records = ingestor()
            .normalize(&payload(FeedKind::TripUpdates, &message))
            .unwrap();
        let NormalizedRecord::TripUpdate(t) = &records[0] else {
            panic!("expected trip update");
        };
        // Falls back to the entity id when the descriptor omits the trip.
        assert_eq!(t.trip_id, "e1");
        assert_eq!(t.delay, None);
    }

    #[test]
    fn test_vehicle_without_position_skipped() {
        let vp = crate::gtfs_rt::VehiclePosition {
            vehicle: Some(VehicleDescriptor {
                id: Some("veh-1".into()),
                label: None,
                license_plate: None,
            }),
            ..Default::default()
        };
        let message = envelope(
            vec![FeedEntity {
                id: "e1".into(),
                is_deleted: None,
                trip_update: None,
                vehicle: Some(vp),
                alert: None,
            }],
            None,
        );
        let records = ingestor()
            .normalize(&payload(FeedKind::VehiclePositions, &message))
            .unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_vehicle_enums_presence_checked() {
        let vp = crate::gtfs_rt::VehiclePosition {
            vehicle: Some(VehicleDescriptor {
                id: Some("veh-1".into()),
                label: None,
                license_plate: None,
            }),
            position: Some(Position {
                latitude: 42.35,
                longitude: -71.06,
                bearing: None,
                odometer: None,
                speed: Some(8.5),
            }),
            occupancy_status: Some(OccupancyStatus::FewSeatsAvailable as i32),
            ..Default::default()
        };
        let message = envelope(
            vec![FeedEntity {
                id: "e1".into(),
                is_deleted: None,
                trip_update: None,
                vehicle: Some(vp),
                alert: None,
            }],
            None,
        );
        let records = ingestor()
            .normalize(&payload(FeedKind::VehiclePositions, &message))
            .unwrap();
        let NormalizedRecord::VehiclePosition(v) = &records[0] else {
            panic!("expected vehicle position");
        };
        assert_eq!(v.occupancy_status.as_deref(), Some("few_seats_available"));
        // Absent optional enums stay absent, defaults notwithstanding.
        assert_eq!(v.current_status, None);
        assert_eq!(v.congestion_level, None);
        assert_eq!(v.speed, Some(8.5));
    }

    #[test]
    fn test_alert_selectors_and_severity() {
        let alert = crate::gtfs_rt::Alert {
            active_period: vec![TimeRange {
                start: Some(1_700_000_000),
                end: None,
            }],
            informed_entity: vec![
                EntitySelector {
                    route_id: Some("Red".into()),
                    ..Default::default()
                },
                EntitySelector {
                    route_id: Some("Red".into()),
                    stop_id: Some("place-sstat".into()),
                    ..Default::default()
                },
            ],
            severity_level: Some(SeverityLevel::Severe as i32),
            header_text: Some(TranslatedString {
                translation: vec![crate::gtfs_rt::translated_string::Translation {
                    text: "Shuttle buses replace service".into(),
                    language: Some("en".into()),
                }],
            }),
            ..Default::default()
        };
        let message = envelope(
            vec![FeedEntity {
                id: "alert-7".into(),
                is_deleted: None,
                trip_update: None,
                vehicle: None,
                alert: Some(alert),
            }],
            None,
        );
        let records = ingestor()
            .normalize(&payload(FeedKind::Alerts, &message))
            .unwrap();
        let NormalizedRecord::Alert(a) = &records[0] else {
            panic!("expected alert");
        };
        assert_eq!(a.alert_id, "alert-7");
        assert_eq!(a.affected_routes, vec!["Red"]);
        assert_eq!(a.affected_stops, vec!["place-sstat"]);
        assert_eq!(a.severity_level.as_deref(), Some("severe"));
        assert_eq!(
            a.header_text.as_deref(),
            Some("Shuttle buses replace service")
        );
        assert!(a.active_period_start.is_some());
        assert!(a.active_period_end.is_none());
    }

    #[test]
    fn test_deleted_entity_skipped() {
        let message = envelope(
            vec![FeedEntity {
                id: "gone".into(),
                is_deleted: Some(true),
                trip_update: None,
                vehicle: None,
                alert: Some(crate::gtfs_rt::Alert::default()),
            }],
            None,
        );
        let records = ingestor()
            .normalize(&payload(FeedKind::Alerts, &message))
            .unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_truncated_feed_fails_cycle() {
        let raw = RawPayload {
            parts: vec![RawPart {
                label: FeedKind::TripUpdates.label(),
                body: vec![0xff, 0xff, 0xff].into(),
            }],
        };
        assert!(matches!(
            ingestor().normalize(&raw),
            Err(IngestError::Decode(_))
        ));
    }

    #[test]
    fn test_feed_status_tracks_header_timestamp() {
        let ing = ingestor();
        // Nothing seen yet: everything stale.
        assert!(ing.feed_status().iter().all(|s| s.stale));

        let now = Utc::now().timestamp() as u64;
        let message = envelope(vec![], Some(now));
        ing.normalize(&payload(FeedKind::TripUpdates, &message))
            .unwrap();

        let status = ing.feed_status();
        let tu = status
            .iter()
            .find(|s| s.feed == "trip_updates")
            .unwrap();
        assert!(!tu.stale);
        assert!(tu.last_updated.is_some());
        let vp = status
            .iter()
            .find(|s| s.feed == "vehicle_positions")
            .unwrap();
        assert!(vp.stale);
    }
}
