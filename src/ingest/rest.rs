//! JSON:API REST source.
//!
//! Pulls `/predictions`, `/vehicles`, and `/routes` from the authenticated
//! REST endpoint, one rate-limited request each, and flattens the JSON:API
//! resource shape (`type`/`id`/`attributes`/`relationships`) into the
//! common record model.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{IngestError, NormalizedRecord, RawPart, RawPayload, RecordSource, SourceIngestor};
use crate::fetch::{fetch_bytes, HttpClient};
use crate::model::{Prediction, Route, VehiclePosition};
use crate::ratelimit::RateLimiter;
use crate::retry::RetryPolicy;

pub struct RestIngestor<C> {
    client: C,
    base_url: String,
    route_filter: Vec<String>,
    stop_filter: Vec<String>,
    limiter: RateLimiter,
    retry: RetryPolicy,
    dropped: AtomicU64,
}

impl<C: HttpClient> RestIngestor<C> {
    pub fn new(
        client: C,
        base_url: impl Into<String>,
        route_filter: Vec<String>,
        stop_filter: Vec<String>,
        limiter: RateLimiter,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            route_filter,
            stop_filter,
            limiter,
            retry,
            dropped: AtomicU64::new(0),
        }
    }

    fn endpoint_url(&self, endpoint: &str) -> String {
        let mut url = format!("{}/{endpoint}", self.base_url.trim_end_matches('/'));
        let mut params: Vec<String> = Vec::new();
        if endpoint == "predictions" {
            params.push("include=stop,trip,route".to_string());
            if !self.stop_filter.is_empty() {
                params.push(format!("filter[stop]={}", self.stop_filter.join(",")));
            }
        }
        if !self.route_filter.is_empty() && endpoint != "routes" {
            params.push(format!("filter[route]={}", self.route_filter.join(",")));
        }
        if !params.is_empty() {
            url.push('?');
            url.push_str(&params.join("&"));
        }
        url
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

const ENDPOINTS: [&str; 3] = ["predictions", "vehicles", "routes"];

#[async_trait]
impl<C: HttpClient> SourceIngestor for RestIngestor<C> {
    fn name(&self) -> &'static str {
        "rest_api"
    }

    fn source(&self) -> RecordSource {
        RecordSource::RestApi
    }

    async fn fetch(&self) -> Result<RawPayload, IngestError> {
        let mut parts = Vec::with_capacity(ENDPOINTS.len());
        for endpoint in ENDPOINTS {
            let url = self.endpoint_url(endpoint);
            // The limiter sits inside the retried closure so a retried
            // request is re-admitted like any other.
            let body = self
                .retry
                .run(|| async {
                    self.limiter.admit().await;
                    fetch_bytes(&self.client, &url).await
                })
                .await?;
            debug!(endpoint, bytes = body.len(), "fetched REST endpoint");
            parts.push(RawPart {
                label: endpoint,
                body: body.into(),
            });
        }
        Ok(RawPayload { parts })
    }

    fn normalize(&self, raw: &RawPayload) -> Result<Vec<NormalizedRecord>, IngestError> {
        let captured_at = Utc::now();
        let mut records = Vec::new();
        for part in &raw.parts {
            let doc: Document = serde_json::from_slice(&part.body)
                .map_err(|e| IngestError::Decode(format!("{} payload: {e}", part.label)))?;
            for resource in doc.data {
                let Some(record) = resource_to_record(&resource, captured_at) else {
                    warn!(
                        resource_type = %resource.kind,
                        id = %resource.id,
                        "skipping unrecognized or incomplete resource"
                    );
                    continue;
                };
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

#[derive(Deserialize)]
struct Document {
    #[serde(default)]
    data: Vec<Resource>,
}

#[derive(Deserialize)]
struct Resource {
    #[serde(rename = "type")]
    kind: String,
    id: String,
    #[serde(default)]
    attributes: serde_json::Value,
    #[serde(default)]
    relationships: serde_json::Value,
}

impl Resource {
    fn attr_str(&self, key: &str) -> Option<String> {
        self.attributes.get(key)?.as_str().map(String::from)
    }

    fn attr_i64(&self, key: &str) -> Option<i64> {
        self.attributes.get(key)?.as_i64()
    }

    fn attr_f64(&self, key: &str) -> Option<f64> {
        self.attributes.get(key)?.as_f64()
    }

    fn attr_time(&self, key: &str) -> Option<DateTime<Utc>> {
        let raw = self.attributes.get(key)?.as_str()?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    /// `relationships.<name>.data.id`, the JSON:API linkage shape.
    fn rel_id(&self, name: &str) -> Option<String> {
        self.relationships
            .get(name)?
            .get("data")?
            .get("id")?
            .as_str()
            .map(String::from)
    }
}

/// Flattens one JSON:API resource. `None` means the type is unrecognized
/// or the resource is missing something structural (for vehicles, a
/// position); validation of field ranges happens afterwards.
fn resource_to_record(res: &Resource, captured_at: DateTime<Utc>) -> Option<NormalizedRecord> {
    match res.kind.as_str() {
        "prediction" => Some(NormalizedRecord::Prediction(Prediction {
            prediction_id: res.id.clone(),
            trip_id: res.rel_id("trip")?,
            stop_id: res.rel_id("stop")?,
            route_id: res.rel_id("route")?,
            vehicle_id: res.rel_id("vehicle"),
            arrival_time: res.attr_time("arrival_time"),
            departure_time: res.attr_time("departure_time"),
            schedule_relationship: res
                .attr_str("schedule_relationship")
                .map(|s| s.to_ascii_lowercase()),
            status: res.attr_str("status"),
            delay: res.attr_i64("delay"),
            source: RecordSource::RestApi,
            captured_at,
        })),
        "vehicle" => Some(NormalizedRecord::VehiclePosition(VehiclePosition {
            vehicle_id: res.id.clone(),
            trip_id: res.rel_id("trip"),
            route_id: res.rel_id("route"),
            stop_id: res.rel_id("stop"),
            latitude: res.attr_f64("latitude")?,
            longitude: res.attr_f64("longitude")?,
            bearing: res.attr_f64("bearing"),
            speed: res.attr_f64("speed"),
            current_status: res
                .attr_str("current_status")
                .map(|s| s.to_ascii_lowercase()),
            congestion_level: None,
            occupancy_status: res
                .attr_str("occupancy_status")
                .map(|s| s.to_ascii_lowercase()),
            source: RecordSource::RestApi,
            captured_at,
        })),
        "route" => Some(NormalizedRecord::Route(Route {
            route_id: res.id.clone(),
            route_name: res
                .attr_str("long_name")
                .or_else(|| res.attr_str("short_name"))
                .unwrap_or_else(|| format!("Route {}", res.id)),
            route_type: res.attr_i64("type").unwrap_or_default(),
            route_color: res.attr_str("color"),
            route_text_color: res.attr_str("text_color"),
            source: RecordSource::RestApi,
            captured_at,
        })),
        _ => None,
    }
}
