//! Environment-driven configuration.
//!
//! Values load from the process environment (a `.env` file is read by the
//! binary before this runs). Every knob has a default except the REST API
//! key, which is required because the REST source cannot authenticate
//! without it.

use anyhow::{Context, Result};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Bearer token for the REST source.
    pub rest_api_key: String,
    pub rest_base_url: String,
    pub feed_base_url: String,

    pub database_url: String,

    /// Fixed interval between poll cycles, per engine.
    pub poll_interval: Duration,

    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,

    /// Sliding-window quota for the REST source.
    pub rate_limit_per_minute: usize,

    /// A feed category older than this is reported stale.
    pub feed_stale_after: Duration,

    /// Route ids passed as `filter[route]`; empty means no filter.
    pub route_filter: Vec<String>,

    /// Stop ids passed as `filter[stop]` on the predictions endpoint.
    pub stop_filter: Vec<String>,

    /// Ring-buffer capacity per record type in the aggregator.
    pub aggregator_capacity: usize,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let rest_api_key = std::env::var("TRANSIT_API_KEY")
            .context("TRANSIT_API_KEY must be set for the REST source")?;

        let route_filter = env_list("TRANSIT_ROUTE_FILTER");
        let stop_filter = env_list("TRANSIT_STOP_FILTER");

        Ok(Self {
            rest_api_key,
            rest_base_url: env_or("TRANSIT_REST_BASE_URL", "https://api-v3.mbta.com"),
            feed_base_url: env_or("TRANSIT_FEED_BASE_URL", "https://cdn.mbta.com/realtime"),
            database_url: env_or("DATABASE_URL", "sqlite://transit.db?mode=rwc"),
            poll_interval: Duration::from_secs(env_parse("POLL_INTERVAL_SECONDS", 15)),
            max_retries: env_parse("MAX_RETRIES", 3),
            retry_base_delay: Duration::from_secs(env_parse("RETRY_DELAY_SECONDS", 5)),
            retry_max_delay: Duration::from_secs(env_parse("RETRY_MAX_DELAY_SECONDS", 60)),
            rate_limit_per_minute: env_parse("RATE_LIMIT_PER_MINUTE", 1000),
            feed_stale_after: Duration::from_secs(env_parse("FEED_STALE_MINUTES", 15) * 60),
            route_filter,
            stop_filter,
            aggregator_capacity: env_parse("AGGREGATOR_CAPACITY", 50_000),
        })
    }
}

/// Store location alone, for the read-only subcommands that never touch
/// the REST source and so need no API key.
pub fn database_url_from_env() -> String {
    env_or("DATABASE_URL", "sqlite://transit.db?mode=rwc")
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
