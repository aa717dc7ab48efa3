//! Durable catalog + alert storage and HTTP fetch utilities for Pokemon Scout.

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

mod alerts;
mod catalog;
pub mod fetch;
mod migrate;
mod persistence;

pub use alerts::AlertStore;
pub use catalog::Catalog;
pub use fetch::{absolute_url, BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher};
pub use migrate::{MigrationReport, SCHEMA_VERSION};
pub use persistence::{Database, Tables, DEFAULT_DEBOUNCE};

pub const CRATE_NAME: &str = "scout-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("integrity fault: {0}")]
    Integrity(String),
    #[error("database is closed")]
    Closed,
    #[error("migration failed: {0}")]
    Migration(String),
    #[error("i/o error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl StorageError {
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        Self::NotFound { entity, id }
    }
}

/// Open the data file and hand back the two stores sharing it.
pub fn open_stores(
    path: impl Into<PathBuf>,
    debounce: std::time::Duration,
    base_currency: &str,
) -> Result<(Catalog, AlertStore), StorageError> {
    let db = Database::open(path, debounce)?;
    Ok((
        Catalog::new(db.clone()).with_base_currency(base_currency),
        AlertStore::new(db),
    ))
}
