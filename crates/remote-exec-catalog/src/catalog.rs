//! Opening the catalog database.

use std::path::Path;

use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};

use crate::error::CatalogError;

/// Handle to the catalog database.
#[derive(Debug, Clone)]
pub struct Catalog {
    pool: SqlitePool,
}

impl Catalog {
    /// Open the catalog stored at `path`, creating the file and its parent
    /// directory when missing.
    ///
    /// # Errors
    /// Returns error if the directory cannot be created or the database
    /// cannot be opened.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|source| CatalogError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        tracing::debug!(path = %path.display(), "Opened catalog");
        Ok(Self { pool })
    }

    /// Open a private in-memory catalog.
    ///
    /// The pool is pinned to one connection that is never recycled, since
    /// every SQLite in-memory connection is its own database.
    ///
    /// # Errors
    /// Returns error if SQLite cannot be initialised.
    pub async fn open_in_memory() -> Result<Self, CatalogError> {
        let options = SqliteConnectOptions::new().in_memory(true);
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|source| CatalogError::Open {
                path: ":memory:".into(),
                source,
            })?;
        Ok(Self { pool })
    }

    /// The underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("catalog.db");

        let catalog = Catalog::open(&path).await.unwrap();
        assert!(path.exists());
        catalog.close().await;
    }

    #[tokio::test]
    async fn test_in_memory_keeps_state_between_queries() {
        let catalog = Catalog::open_in_memory().await.unwrap();
        sqlx::query("CREATE TABLE scratch (id INTEGER)")
            .execute(catalog.pool())
            .await
            .unwrap();
        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM scratch")
            .fetch_one(catalog.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
