//! Idempotent relational persistence over SQLite.
//!
//! Every event record gets its missing parent rows auto-created first, is
//! checked against its idempotency key, and is inserted with canonical
//! integer codes for the enum-ish fields. Each `store`/`store_batch` call
//! appends exactly one `ingestion_log` row.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{info, warn};
use uuid::Uuid;

use super::codes;
use super::StorageError;
use crate::model::{NormalizedRecord, RecordSource};

#[derive(Debug, Clone, Serialize)]
pub struct StoreOutcome {
    pub success: bool,
    /// Row id of the stored (or already-present) record.
    pub stored_id: Option<String>,
    /// True when the idempotency key matched an existing row.
    pub deduplicated: bool,
    pub error: Option<String>,
}

impl StoreOutcome {
    fn stored(id: String) -> Self {
        Self {
            success: true,
            stored_id: Some(id),
            deduplicated: false,
            error: None,
        }
    }

    fn deduplicated(id: String) -> Self {
        Self {
            success: true,
            stored_id: Some(id),
            deduplicated: true,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            success: false,
            stored_id: None,
            deduplicated: false,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct BatchOutcome {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub status: &'static str,
}

impl BatchOutcome {
    fn status_for(succeeded: usize, failed: usize) -> &'static str {
        if failed == 0 {
            "success"
        } else if succeeded > 0 {
            "partial"
        } else {
            "error"
        }
    }
}

/// One row of the read-back surface for predictions.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct StoredPrediction {
    pub id: String,
    pub prediction_id: String,
    pub trip_id: String,
    pub stop_id: String,
    pub route_id: String,
    pub arrival_time: Option<DateTime<Utc>>,
    pub delay_seconds: Option<i64>,
    pub status: Option<String>,
    pub source: String,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct StoredHealthSummary {
    pub window_hours: i64,
    pub total_predictions: i64,
    pub delayed: i64,
    pub avg_delay_seconds: Option<f64>,
    pub ingestion_runs: i64,
}

pub struct PersistenceGateway {
    pool: SqlitePool,
}

impl PersistenceGateway {
    /// Opens the pool and applies the embedded migrations. In-memory
    /// databases are pinned to a single connection so every query sees
    /// the same database.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let in_memory =
            database_url.contains(":memory:") || database_url.contains("mode=memory");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!(in_memory, "storage ready");
        Ok(Self { pool })
    }

    /// Stores one record. Failures are reported in the outcome, not as an
    /// `Err`; `Err` is reserved for the database itself being unusable.
    pub async fn store(&self, record: &NormalizedRecord) -> Result<StoreOutcome, StorageError> {
        let started = Utc::now();
        let mut tx = self.pool.begin().await?;
        match store_record(&mut tx, record).await {
            Ok(outcome) => {
                append_log(
                    &mut *tx,
                    record.source(),
                    "store",
                    1,
                    1,
                    0,
                    "success",
                    None,
                    started,
                )
                .await?;
                tx.commit().await?;
                Ok(outcome)
            }
            Err(err) => {
                drop(tx);
                warn!(record_type = record.record_type(), error = %err, "store failed");
                let mut conn = self.pool.acquire().await?;
                append_log(
                    &mut *conn,
                    record.source(),
                    "store",
                    1,
                    0,
                    1,
                    "error",
                    Some(&err.to_string()),
                    started,
                )
                .await?;
                Ok(StoreOutcome::failed(err.to_string()))
            }
        }
    }

    /// Stores a whole poll cycle in one transaction. A record that fails
    /// is counted and skipped; it never aborts the rest of the batch.
    pub async fn store_batch(
        &self,
        source: RecordSource,
        records: &[NormalizedRecord],
    ) -> Result<BatchOutcome, StorageError> {
        let started = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut succeeded = 0usize;
        let mut failed = 0usize;
        let mut first_error: Option<String> = None;

        for record in records {
            match store_record(&mut tx, record).await {
                Ok(_) => succeeded += 1,
                Err(err) => {
                    failed += 1;
                    warn!(
                        record_type = record.record_type(),
                        id = record.natural_id(),
                        error = %err,
                        "record skipped in batch"
                    );
                    first_error.get_or_insert_with(|| err.to_string());
                }
            }
        }

        let status = BatchOutcome::status_for(succeeded, failed);
        append_log(
            &mut *tx,
            source,
            "store_batch",
            records.len(),
            succeeded,
            failed,
            status,
            first_error.as_deref(),
            started,
        )
        .await?;
        tx.commit().await?;

        Ok(BatchOutcome {
            total: records.len(),
            succeeded,
            failed,
            status,
        })
    }

    /// Most recently captured predictions, newest first.
    pub async fn recent_predictions(
        &self,
        limit: i64,
    ) -> Result<Vec<StoredPrediction>, StorageError> {
        let rows = sqlx::query_as::<_, StoredPrediction>(
            "SELECT id, prediction_id, trip_id, stop_id, route_id, arrival_time, \
             delay_seconds, status, source, captured_at \
             FROM predictions ORDER BY captured_at DESC, id LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Stored-side health view over the trailing window.
    pub async fn service_health_summary(
        &self,
        hours: i64,
    ) -> Result<StoredHealthSummary, StorageError> {
        let cutoff = Utc::now() - chrono::Duration::hours(hours);
        let (total, delayed, avg): (i64, i64, Option<f64>) = sqlx::query_as(
            "SELECT COUNT(*), \
             COALESCE(SUM(CASE WHEN delay_seconds > 0 THEN 1 ELSE 0 END), 0), \
             AVG(delay_seconds) \
             FROM predictions WHERE captured_at >= ?",
        )
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;
        let runs: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM ingestion_log WHERE started_at >= ?")
                .bind(cutoff)
                .fetch_one(&self.pool)
                .await?;
        Ok(StoredHealthSummary {
            window_hours: hours,
            total_predictions: total,
            delayed,
            avg_delay_seconds: avg,
            ingestion_runs: runs,
        })
    }

    /// Cheap connectivity check for the health report.
    pub async fn probe(&self) -> Result<(), StorageError> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}

async fn store_record(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    record: &NormalizedRecord,
) -> Result<StoreOutcome, sqlx::Error> {
    let now = Utc::now();
    match record {
        NormalizedRecord::Prediction(p) => {
            ensure_route(&mut *tx, &p.route_id, now).await?;
            ensure_stop(&mut *tx, &p.stop_id, now).await?;
            ensure_trip(&mut *tx, &p.trip_id, &p.route_id, now).await?;
            if let Some(vehicle_id) = &p.vehicle_id {
                ensure_vehicle(&mut *tx, vehicle_id, now).await?;
            }

            // NULL-safe idempotency lookup: `IS` matches NULL = NULL where
            // `=` would not.
            let existing: Option<String> = sqlx::query_scalar(
                "SELECT id FROM predictions \
                 WHERE trip_id = ? AND stop_id = ? AND arrival_time IS ?",
            )
            .bind(&p.trip_id)
            .bind(&p.stop_id)
            .bind(p.arrival_time)
            .fetch_optional(&mut **tx)
            .await?;
            if let Some(id) = existing {
                return Ok(StoreOutcome::deduplicated(id));
            }

            let id = Uuid::new_v4().to_string();
            sqlx::query(
                "INSERT INTO predictions \
                 (id, prediction_id, trip_id, stop_id, route_id, vehicle_id, arrival_time, \
                  departure_time, schedule_relationship, status, delay_seconds, source, \
                  captured_at, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(&p.prediction_id)
            .bind(&p.trip_id)
            .bind(&p.stop_id)
            .bind(&p.route_id)
            .bind(&p.vehicle_id)
            .bind(p.arrival_time)
            .bind(p.departure_time)
            .bind(
                p.schedule_relationship
                    .as_deref()
                    .and_then(codes::schedule_relationship),
            )
            .bind(&p.status)
            .bind(p.delay)
            .bind(p.source.as_str())
            .bind(p.captured_at)
            .bind(now)
            .execute(&mut **tx)
            .await?;
            Ok(StoreOutcome::stored(id))
        }
        NormalizedRecord::VehiclePosition(v) => {
            ensure_vehicle(&mut *tx, &v.vehicle_id, now).await?;
            let id = Uuid::new_v4().to_string();
            sqlx::query(
                "INSERT INTO vehicle_positions \
                 (id, vehicle_id, trip_id, route_id, stop_id, latitude, longitude, bearing, \
                  speed, current_status, congestion_level, occupancy_status, source, \
                  captured_at, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(&v.vehicle_id)
            .bind(&v.trip_id)
            .bind(&v.route_id)
            .bind(&v.stop_id)
            .bind(v.latitude)
            .bind(v.longitude)
            .bind(v.bearing)
            .bind(v.speed)
            .bind(&v.current_status)
            .bind(v.congestion_level.as_deref().and_then(codes::congestion_level))
            .bind(v.occupancy_status.as_deref().and_then(codes::occupancy_status))
            .bind(v.source.as_str())
            .bind(v.captured_at)
            .bind(now)
            .execute(&mut **tx)
            .await?;
            Ok(StoreOutcome::stored(id))
        }
        NormalizedRecord::TripUpdate(t) => {
            let route_id = t.route_id.as_deref().unwrap_or("unknown");
            ensure_route(&mut *tx, route_id, now).await?;
            ensure_trip(&mut *tx, &t.trip_id, route_id, now).await?;
            if let Some(vehicle_id) = &t.vehicle_id {
                ensure_vehicle(&mut *tx, vehicle_id, now).await?;
            }
            let id = Uuid::new_v4().to_string();
            sqlx::query(
                "INSERT INTO trip_updates \
                 (id, trip_id, route_id, vehicle_id, delay_seconds, stop_time_update_count, \
                  source, captured_at, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(&t.trip_id)
            .bind(&t.route_id)
            .bind(&t.vehicle_id)
            .bind(t.delay)
            .bind(t.stop_time_update_count as i64)
            .bind(t.source.as_str())
            .bind(t.captured_at)
            .bind(now)
            .execute(&mut **tx)
            .await?;
            Ok(StoreOutcome::stored(id))
        }
        NormalizedRecord::Alert(a) => {
            let existing: Option<String> =
                sqlx::query_scalar("SELECT id FROM alerts WHERE alert_id = ?")
                    .bind(&a.alert_id)
                    .fetch_optional(&mut **tx)
                    .await?;
            if let Some(id) = existing {
                return Ok(StoreOutcome::deduplicated(id));
            }

            let id = Uuid::new_v4().to_string();
            sqlx::query(
                "INSERT INTO alerts \
                 (id, alert_id, header_text, description_text, url, effect, severity_level, \
                  affected_routes, affected_stops, affected_trips, active_period_start, \
                  active_period_end, source, captured_at, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(&a.alert_id)
            .bind(&a.header_text)
            .bind(&a.description_text)
            .bind(&a.url)
            .bind(&a.effect)
            .bind(&a.severity_level)
            .bind(json_list(&a.affected_routes))
            .bind(json_list(&a.affected_stops))
            .bind(json_list(&a.affected_trips))
            .bind(a.active_period_start)
            .bind(a.active_period_end)
            .bind(a.source.as_str())
            .bind(a.captured_at)
            .bind(now)
            .execute(&mut **tx)
            .await?;
            Ok(StoreOutcome::stored(id))
        }
        NormalizedRecord::Route(r) => {
            sqlx::query(
                "INSERT INTO routes (route_id, route_name, route_type, route_color, \
                 route_text_color, updated_at) VALUES (?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(route_id) DO UPDATE SET route_name = excluded.route_name, \
                 route_type = excluded.route_type, route_color = excluded.route_color, \
                 route_text_color = excluded.route_text_color, updated_at = excluded.updated_at",
            )
            .bind(&r.route_id)
            .bind(&r.route_name)
            .bind(r.route_type)
            .bind(&r.route_color)
            .bind(&r.route_text_color)
            .bind(now)
            .execute(&mut **tx)
            .await?;
            Ok(StoreOutcome::stored(r.route_id.clone()))
        }
        NormalizedRecord::Stop(s) => {
            sqlx::query(
                "INSERT INTO stops (stop_id, stop_name, stop_lat, stop_lon, \
                 wheelchair_boarding, updated_at) VALUES (?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(stop_id) DO UPDATE SET stop_name = excluded.stop_name, \
                 stop_lat = excluded.stop_lat, stop_lon = excluded.stop_lon, \
                 wheelchair_boarding = excluded.wheelchair_boarding, \
                 updated_at = excluded.updated_at",
            )
            .bind(&s.stop_id)
            .bind(&s.stop_name)
            .bind(s.stop_lat)
            .bind(s.stop_lon)
            .bind(s.wheelchair_boarding)
            .bind(now)
            .execute(&mut **tx)
            .await?;
            Ok(StoreOutcome::stored(s.stop_id.clone()))
        }
        NormalizedRecord::Trip(t) => {
            ensure_route(&mut *tx, &t.route_id, now).await?;
            sqlx::query(
                "INSERT INTO trips (trip_id, route_id, service_id, trip_headsign, \
                 direction_id, updated_at) VALUES (?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(trip_id) DO UPDATE SET route_id = excluded.route_id, \
                 service_id = excluded.service_id, trip_headsign = excluded.trip_headsign, \
                 direction_id = excluded.direction_id, updated_at = excluded.updated_at",
            )
            .bind(&t.trip_id)
            .bind(&t.route_id)
            .bind(&t.service_id)
            .bind(&t.trip_headsign)
            .bind(t.direction_id)
            .bind(now)
            .execute(&mut **tx)
            .await?;
            Ok(StoreOutcome::stored(t.trip_id.clone()))
        }
    }
}

// Placeholder parents keep foreign keys satisfied until the reference
// record itself arrives and upserts the real row.

async fn ensure_route(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    route_id: &str,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT OR IGNORE INTO routes (route_id, route_name, updated_at) VALUES (?, ?, ?)")
        .bind(route_id)
        .bind(format!("Route {route_id}"))
        .bind(now)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn ensure_stop(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    stop_id: &str,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT OR IGNORE INTO stops (stop_id, stop_name, updated_at) VALUES (?, ?, ?)")
        .bind(stop_id)
        .bind(format!("Stop {stop_id}"))
        .bind(now)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn ensure_trip(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    trip_id: &str,
    route_id: &str,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT OR IGNORE INTO trips (trip_id, route_id, updated_at) VALUES (?, ?, ?)")
        .bind(trip_id)
        .bind(route_id)
        .bind(now)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn ensure_vehicle(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    vehicle_id: &str,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT OR IGNORE INTO vehicles (vehicle_id, updated_at) VALUES (?, ?)")
        .bind(vehicle_id)
        .bind(now)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn append_log(
    conn: &mut SqliteConnection,
    source: RecordSource,
    operation: &str,
    total: usize,
    succeeded: usize,
    failed: usize,
    status: &str,
    error: Option<&str>,
    started_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO ingestion_log \
         (id, source, operation, total, succeeded, failed, status, error, started_at, \
          completed_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(source.as_str())
    .bind(operation)
    .bind(total as i64)
    .bind(succeeded as i64)
    .bind(failed as i64)
    .bind(status)
    .bind(error)
    .bind(started_at)
    .bind(Utc::now())
    .execute(conn)
    .await?;
    Ok(())
}

fn json_list(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_support;
    use crate::model::{NormalizedRecord, Prediction, Route};

    async fn gateway() -> PersistenceGateway {
        PersistenceGateway::connect("sqlite::memory:").await.unwrap()
    }

    fn prediction_with_arrival(arrival: Option<DateTime<Utc>>) -> NormalizedRecord {
        NormalizedRecord::Prediction(Prediction {
            prediction_id: "pred-1".to_string(),
            trip_id: "trip-1".to_string(),
            stop_id: "place-sstat".to_string(),
            route_id: "Red".to_string(),
            vehicle_id: Some("veh-1".to_string()),
            arrival_time: arrival,
            departure_time: None,
            schedule_relationship: Some("scheduled".to_string()),
            status: None,
            delay: Some(120),
            source: RecordSource::RestApi,
            captured_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_store_creates_missing_parents() {
        let gw = gateway().await;
        let outcome = gw.store(&prediction_with_arrival(Some(Utc::now()))).await.unwrap();
        assert!(outcome.success);
        assert!(!outcome.deduplicated);

        let health = gw.service_health_summary(1).await.unwrap();
        assert_eq!(health.total_predictions, 1);
        assert_eq!(health.delayed, 1);
        assert_eq!(health.ingestion_runs, 1);
    }

    #[tokio::test]
    async fn test_prediction_idempotency_key() {
        let gw = gateway().await;
        let arrival = Some(Utc::now());
        let first = gw.store(&prediction_with_arrival(arrival)).await.unwrap();
        let second = gw.store(&prediction_with_arrival(arrival)).await.unwrap();
        assert!(second.deduplicated);
        assert_eq!(first.stored_id, second.stored_id);

        let rows = gw.recent_predictions(10).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_null_arrival_deduplicates() {
        let gw = gateway().await;
        let first = gw.store(&prediction_with_arrival(None)).await.unwrap();
        let second = gw.store(&prediction_with_arrival(None)).await.unwrap();
        assert!(second.deduplicated);
        assert_eq!(first.stored_id, second.stored_id);
    }

    #[tokio::test]
    async fn test_alert_deduplicates_by_alert_id() {
        let gw = gateway().await;
        let alert = test_support::alert("alert-7", &["Red"], Some("severe"));
        let first = gw.store(&alert).await.unwrap();
        let second = gw.store(&alert).await.unwrap();
        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.stored_id, second.stored_id);
    }

    #[tokio::test]
    async fn test_route_upsert_replaces_placeholder() {
        let gw = gateway().await;
        gw.store(&prediction_with_arrival(Some(Utc::now()))).await.unwrap();

        // Placeholder came first; the real route record overwrites it.
        let route = NormalizedRecord::Route(Route {
            route_id: "Red".to_string(),
            route_name: "Red Line".to_string(),
            route_type: 1,
            route_color: Some("DA291C".to_string()),
            route_text_color: None,
            source: RecordSource::RestApi,
            captured_at: Utc::now(),
        });
        gw.store(&route).await.unwrap();

        let name: String = sqlx::query_scalar("SELECT route_name FROM routes WHERE route_id = ?")
            .bind("Red")
            .fetch_one(&gw.pool)
            .await
            .unwrap();
        assert_eq!(name, "Red Line");
    }

    #[tokio::test]
    async fn test_batch_counts_and_log_status() {
        let gw = gateway().await;
        let records = vec![
            test_support::prediction("Red", "s1", Some(60)),
            test_support::prediction("Red", "s2", Some(300)),
            test_support::vehicle(Some("Red"), 42.35, -71.06),
        ];
        let outcome = gw
            .store_batch(RecordSource::RestApi, &records)
            .await
            .unwrap();
        assert_eq!(outcome.total, 3);
        assert_eq!(outcome.succeeded, 3);
        assert_eq!(outcome.failed, 0);
        assert_eq!(outcome.status, "success");

        let (op, status): (String, String) = sqlx::query_as(
            "SELECT operation, status FROM ingestion_log ORDER BY started_at DESC LIMIT 1",
        )
        .fetch_one(&gw.pool)
        .await
        .unwrap();
        assert_eq!(op, "store_batch");
        assert_eq!(status, "success");
    }

    #[tokio::test]
    async fn test_recent_predictions_round_trip() {
        let gw = gateway().await;
        for i in 0..5 {
            let mut record = test_support::prediction("Red", &format!("s{i}"), Some(i * 60));
            if let NormalizedRecord::Prediction(p) = &mut record {
                p.trip_id = format!("trip-{i}");
                p.captured_at = Utc::now() - chrono::Duration::seconds(100 - i);
            }
            gw.store(&record).await.unwrap();
        }
        let rows = gw.recent_predictions(3).await.unwrap();
        assert_eq!(rows.len(), 3);
        // Newest first.
        assert_eq!(rows[0].stop_id, "s4");
        assert_eq!(rows[0].delay_seconds, Some(240));
    }

    #[tokio::test]
    async fn test_unrecognized_codes_stored_null() {
        let gw = gateway().await;
        let mut record = test_support::prediction("Red", "s1", Some(60));
        if let NormalizedRecord::Prediction(p) = &mut record {
            p.schedule_relationship = Some("detour".to_string());
        }
        gw.store(&record).await.unwrap();

        let code: Option<i64> =
            sqlx::query_scalar("SELECT schedule_relationship FROM predictions LIMIT 1")
                .fetch_one(&gw.pool)
                .await
                .unwrap();
        assert_eq!(code, None);
    }

    #[tokio::test]
    async fn test_probe() {
        let gw = gateway().await;
        gw.probe().await.unwrap();
    }
}
