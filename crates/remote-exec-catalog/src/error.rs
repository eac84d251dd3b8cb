//! Catalog errors.

use std::path::PathBuf;

use thiserror::Error;

/// Catalog error.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Failed to open catalog at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: sqlx::Error,
    },

    #[error("Failed to create catalog directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("Catalog query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("Invalid schema version {0} found")]
    InvalidVersion(i64),

    #[error("Schema version {0} is newer than this build supports")]
    NewerSchema(u64),
}
