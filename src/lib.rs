pub mod analytics;
pub mod bus;
pub mod config;
pub mod error;
pub mod fetch;
pub mod ingest;
pub mod model;
pub mod orchestrator;
pub mod poll;
pub mod ratelimit;
pub mod retry;
pub mod storage;

pub mod gtfs_rt {
    include!(concat!(env!("OUT_DIR"), "/transit_realtime.rs"));
}
