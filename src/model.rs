//! Common record model shared by every source.
//!
//! Both ingestors normalize their payloads into [`NormalizedRecord`] before
//! anything downstream sees them. Validation happens here too: a record that
//! fails [`NormalizedRecord::validate`] never reaches the aggregator, the
//! store, or the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Delay values outside this bound (seconds) are considered corrupt.
pub const MAX_DELAY_SECONDS: f64 = 3600.0;

/// Which external system produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordSource {
    RestApi,
    GtfsRt,
}

impl RecordSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordSource::RestApi => "rest_api",
            RecordSource::GtfsRt => "gtfs_rt",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub prediction_id: String,
    pub trip_id: String,
    pub stop_id: String,
    pub route_id: String,
    pub vehicle_id: Option<String>,
    pub arrival_time: Option<DateTime<Utc>>,
    pub departure_time: Option<DateTime<Utc>>,
    pub schedule_relationship: Option<String>,
    pub status: Option<String>,
    /// Seconds behind (positive) or ahead of (negative) schedule.
    pub delay: Option<i64>,
    pub source: RecordSource,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehiclePosition {
    pub vehicle_id: String,
    pub trip_id: Option<String>,
    pub route_id: Option<String>,
    pub stop_id: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub bearing: Option<f64>,
    pub speed: Option<f64>,
    pub current_status: Option<String>,
    pub congestion_level: Option<String>,
    pub occupancy_status: Option<String>,
    pub source: RecordSource,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripUpdate {
    pub trip_id: String,
    pub route_id: Option<String>,
    pub vehicle_id: Option<String>,
    /// Mean of all present arrival/departure delays across the trip's
    /// stop-time updates. `None` when no update carried a delay.
    pub delay: Option<f64>,
    pub stop_time_update_count: usize,
    pub source: RecordSource,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: String,
    pub header_text: Option<String>,
    pub description_text: Option<String>,
    pub url: Option<String>,
    pub effect: Option<String>,
    pub severity_level: Option<String>,
    pub affected_routes: Vec<String>,
    pub affected_stops: Vec<String>,
    pub affected_trips: Vec<String>,
    pub active_period_start: Option<DateTime<Utc>>,
    pub active_period_end: Option<DateTime<Utc>>,
    pub source: RecordSource,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub route_id: String,
    pub route_name: String,
    pub route_type: i64,
    pub route_color: Option<String>,
    pub route_text_color: Option<String>,
    pub source: RecordSource,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stop {
    pub stop_id: String,
    pub stop_name: String,
    pub stop_lat: Option<f64>,
    pub stop_lon: Option<f64>,
    pub wheelchair_boarding: Option<i64>,
    pub source: RecordSource,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trip {
    pub trip_id: String,
    pub route_id: String,
    pub service_id: Option<String>,
    pub trip_headsign: Option<String>,
    pub direction_id: Option<i64>,
    pub source: RecordSource,
    pub captured_at: DateTime<Utc>,
}

/// Tagged union over everything the pipeline normalizes.
///
/// Consumption points match exhaustively; adding a variant is a compile
/// error everywhere it matters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NormalizedRecord {
    Prediction(Prediction),
    VehiclePosition(VehiclePosition),
    TripUpdate(TripUpdate),
    Alert(Alert),
    Route(Route),
    Stop(Stop),
    Trip(Trip),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing identity field: {0}")]
    MissingIdentity(&'static str),
    #[error("delay {0} outside ±3600s bound")]
    DelayOutOfRange(i64),
    #[error("coordinates ({0}, {1}) outside valid range")]
    BadCoordinates(String, String),
}

impl NormalizedRecord {
    /// Primary natural id, used as the bus publish key.
    pub fn natural_id(&self) -> &str {
        match self {
            NormalizedRecord::Prediction(p) => &p.prediction_id,
            NormalizedRecord::VehiclePosition(v) => &v.vehicle_id,
            NormalizedRecord::TripUpdate(t) => &t.trip_id,
            NormalizedRecord::Alert(a) => &a.alert_id,
            NormalizedRecord::Route(r) => &r.route_id,
            NormalizedRecord::Stop(s) => &s.stop_id,
            NormalizedRecord::Trip(t) => &t.trip_id,
        }
    }

    /// Bus topic for event records. Reference data (routes/stops/trips) is
    /// persisted but not republished.
    pub fn topic(&self) -> Option<&'static str> {
        match self {
            NormalizedRecord::Prediction(_) => Some("transit.predictions"),
            NormalizedRecord::VehiclePosition(_) => Some("transit.vehicles"),
            NormalizedRecord::TripUpdate(_) => Some("transit.trip-updates"),
            NormalizedRecord::Alert(_) => Some("transit.alerts"),
            NormalizedRecord::Route(_)
            | NormalizedRecord::Stop(_)
            | NormalizedRecord::Trip(_) => None,
        }
    }

    pub fn record_type(&self) -> &'static str {
        match self {
            NormalizedRecord::Prediction(_) => "prediction",
            NormalizedRecord::VehiclePosition(_) => "vehicle_position",
            NormalizedRecord::TripUpdate(_) => "trip_update",
            NormalizedRecord::Alert(_) => "alert",
            NormalizedRecord::Route(_) => "route",
            NormalizedRecord::Stop(_) => "stop",
            NormalizedRecord::Trip(_) => "trip",
        }
    }

    pub fn source(&self) -> RecordSource {
        match self {
            NormalizedRecord::Prediction(p) => p.source,
            NormalizedRecord::VehiclePosition(v) => v.source,
            NormalizedRecord::TripUpdate(t) => t.source,
            NormalizedRecord::Alert(a) => a.source,
            NormalizedRecord::Route(r) => r.source,
            NormalizedRecord::Stop(s) => s.source,
            NormalizedRecord::Trip(t) => t.source,
        }
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        match self {
            NormalizedRecord::Prediction(p) => p.captured_at,
            NormalizedRecord::VehiclePosition(v) => v.captured_at,
            NormalizedRecord::TripUpdate(t) => t.captured_at,
            NormalizedRecord::Alert(a) => a.captured_at,
            NormalizedRecord::Route(r) => r.captured_at,
            NormalizedRecord::Stop(s) => s.captured_at,
            NormalizedRecord::Trip(t) => t.captured_at,
        }
    }

    /// Enforces the data-model invariants. Records that fail are dropped by
    /// the ingestors before aggregation or storage.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            NormalizedRecord::Prediction(p) => {
                require(&p.prediction_id, "prediction_id")?;
                require(&p.trip_id, "trip_id")?;
                require(&p.stop_id, "stop_id")?;
                require(&p.route_id, "route_id")?;
                if let Some(delay) = p.delay {
                    check_delay(delay as f64)?;
                }
                Ok(())
            }
            NormalizedRecord::VehiclePosition(v) => {
                require(&v.vehicle_id, "vehicle_id")?;
                check_coordinates(v.latitude, v.longitude)
            }
            NormalizedRecord::TripUpdate(t) => {
                require(&t.trip_id, "trip_id")?;
                if let Some(delay) = t.delay {
                    check_delay(delay)?;
                }
                Ok(())
            }
            NormalizedRecord::Alert(a) => require(&a.alert_id, "alert_id"),
            NormalizedRecord::Route(r) => require(&r.route_id, "route_id"),
            NormalizedRecord::Stop(s) => {
                require(&s.stop_id, "stop_id")?;
                if let (Some(lat), Some(lon)) = (s.stop_lat, s.stop_lon) {
                    check_coordinates(lat, lon)?;
                }
                Ok(())
            }
            NormalizedRecord::Trip(t) => {
                require(&t.trip_id, "trip_id")?;
                require(&t.route_id, "route_id")
            }
        }
    }
}

fn require(value: &str, field: &'static str) -> Result<(), ValidationError> {
    if value.is_empty() {
        Err(ValidationError::MissingIdentity(field))
    } else {
        Ok(())
    }
}

fn check_delay(delay: f64) -> Result<(), ValidationError> {
    if !delay.is_finite() || delay.abs() > MAX_DELAY_SECONDS {
        Err(ValidationError::DelayOutOfRange(delay as i64))
    } else {
        Ok(())
    }
}

fn check_coordinates(lat: f64, lon: f64) -> Result<(), ValidationError> {
    let ok = lat.is_finite()
        && lon.is_finite()
        && (-90.0..=90.0).contains(&lat)
        && (-180.0..=180.0).contains(&lon);
    if ok {
        Ok(())
    } else {
        Err(ValidationError::BadCoordinates(
            lat.to_string(),
            lon.to_string(),
        ))
    }
}
