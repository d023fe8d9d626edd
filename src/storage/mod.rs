//! Relational persistence: idempotent writes, audit log, read-back views.

mod codes;
mod gateway;

pub use gateway::{
    BatchOutcome, PersistenceGateway, StoreOutcome, StoredHealthSummary, StoredPrediction,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}
