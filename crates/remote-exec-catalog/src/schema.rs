//! Schema versioning and bootstrap.

use crate::{catalog::Catalog, error::CatalogError};

/// Schema version this build creates and understands.
pub const CURRENT_SCHEMA_VERSION: u64 = 1;

const V1_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS schema_info (
        version INTEGER
    )",
    "INSERT INTO schema_info VALUES (1)",
    "CREATE TABLE IF NOT EXISTS targets (
        uuid      TEXT PRIMARY KEY,
        name      TEXT,
        summary   TEXT,
        plugin    TEXT,
        endpoint  TEXT
    )",
    "CREATE TABLE IF NOT EXISTS stores (
        uuid      TEXT PRIMARY KEY,
        name      TEXT,
        summary   TEXT,
        plugin    TEXT,
        endpoint  TEXT
    )",
    "CREATE TABLE IF NOT EXISTS schedules (
        uuid      TEXT PRIMARY KEY,
        name      TEXT,
        summary   TEXT,
        timespec  TEXT
    )",
    "CREATE TABLE IF NOT EXISTS retention (
        uuid     TEXT PRIMARY KEY,
        name     TEXT,
        summary  TEXT,
        expiry   INTEGER
    )",
    "CREATE TABLE IF NOT EXISTS jobs (
        uuid            TEXT PRIMARY KEY,
        target_uuid     TEXT,
        store_uuid      TEXT,
        schedule_uuid   TEXT,
        retention_uuid  TEXT,
        paused          INTEGER,
        name            TEXT,
        summary         TEXT
    )",
    "CREATE TABLE IF NOT EXISTS archives (
        uuid         TEXT PRIMARY KEY,
        target_uuid  TEXT,
        store_uuid   TEXT,
        store_key    TEXT,
        taken_at     TEXT,
        expires_at   TEXT,
        notes        TEXT
    )",
    "CREATE TABLE IF NOT EXISTS tasks (
        uuid          TEXT PRIMARY KEY,
        owner         TEXT,
        op            TEXT,
        args          TEXT,
        job_uuid      TEXT,
        archive_uuid  TEXT,
        status        TEXT,
        started_at    TEXT,
        stopped_at    TEXT,
        log           TEXT,
        debug         TEXT
    )",
];

impl Catalog {
    /// Stored schema version; 0 when the catalog has never been set up.
    ///
    /// # Errors
    /// Returns error if the catalog cannot be queried or holds a negative
    /// version.
    pub async fn schema_version(&self) -> Result<u64, CatalogError> {
        let has_table: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = 'schema_info'",
        )
        .fetch_one(self.pool())
        .await?;
        if has_table == 0 {
            return Ok(0);
        }

        let stored: Option<i64> = sqlx::query_scalar("SELECT version FROM schema_info LIMIT 1")
            .fetch_optional(self.pool())
            .await?;

        match stored {
            None => Ok(0),
            Some(v) => u64::try_from(v).map_err(|_| CatalogError::InvalidVersion(v)),
        }
    }

    /// Bring the catalog up to [`CURRENT_SCHEMA_VERSION`].
    ///
    /// An uninitialised catalog is bootstrapped in a single transaction; a
    /// current one is left alone.
    ///
    /// # Errors
    /// Returns [`CatalogError::NewerSchema`] if the catalog was created by a
    /// newer build, or a query error if bootstrapping fails.
    pub async fn setup(&self) -> Result<(), CatalogError> {
        match self.schema_version().await? {
            0 => {
                tracing::info!(version = CURRENT_SCHEMA_VERSION, "Bootstrapping catalog schema");
                let mut tx = self.pool().begin().await?;
                for statement in V1_SCHEMA {
                    sqlx::query(statement).execute(&mut *tx).await?;
                }
                tx.commit().await?;
                Ok(())
            }
            CURRENT_SCHEMA_VERSION => {
                tracing::debug!("Catalog schema is current");
                Ok(())
            }
            newer => Err(CatalogError::NewerSchema(newer)),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    async fn table_count(catalog: &Catalog) -> i64 {
        sqlx::query_scalar("SELECT count(*) FROM sqlite_master WHERE type = 'table'")
            .fetch_one(catalog.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_fresh_catalog_is_version_zero() {
        let catalog = Catalog::open_in_memory().await.unwrap();
        assert_eq!(catalog.schema_version().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_setup_bootstraps_version_one() {
        let catalog = Catalog::open_in_memory().await.unwrap();
        assert_ok!(catalog.setup().await);

        assert_eq!(catalog.schema_version().await.unwrap(), 1);
        assert_eq!(table_count(&catalog).await, 8);
    }

    #[tokio::test]
    async fn test_setup_is_idempotent() {
        let catalog = Catalog::open_in_memory().await.unwrap();
        assert_ok!(catalog.setup().await);
        assert_ok!(catalog.setup().await);

        let rows: i64 = sqlx::query_scalar("SELECT count(*) FROM schema_info")
            .fetch_one(catalog.pool())
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn test_newer_schema_is_rejected_untouched() {
        let catalog = Catalog::open_in_memory().await.unwrap();
        sqlx::query("CREATE TABLE IF NOT EXISTS schema_info (version INTEGER)")
            .execute(catalog.pool())
            .await
            .unwrap();
        sqlx::query("INSERT INTO schema_info VALUES (2)")
            .execute(catalog.pool())
            .await
            .unwrap();

        let err = assert_err!(catalog.setup().await);
        assert!(matches!(err, CatalogError::NewerSchema(2)));
        assert_eq!(table_count(&catalog).await, 1);
        assert_eq!(catalog.schema_version().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_version_beyond_u32_is_newer_schema() {
        let catalog = Catalog::open_in_memory().await.unwrap();
        sqlx::query("CREATE TABLE schema_info (version INTEGER)")
            .execute(catalog.pool())
            .await
            .unwrap();
        sqlx::query("INSERT INTO schema_info VALUES (5000000000)")
            .execute(catalog.pool())
            .await
            .unwrap();

        let err = assert_err!(catalog.setup().await);
        assert!(matches!(err, CatalogError::NewerSchema(5_000_000_000)));
        assert_eq!(table_count(&catalog).await, 1);
    }

    #[tokio::test]
    async fn test_empty_schema_info_counts_as_uninitialised() {
        let catalog = Catalog::open_in_memory().await.unwrap();
        sqlx::query("CREATE TABLE IF NOT EXISTS schema_info (version INTEGER)")
            .execute(catalog.pool())
            .await
            .unwrap();
        assert_eq!(catalog.schema_version().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_negative_version_is_an_error() {
        let catalog = Catalog::open_in_memory().await.unwrap();
        sqlx::query("CREATE TABLE IF NOT EXISTS schema_info (version INTEGER)")
            .execute(catalog.pool())
            .await
            .unwrap();
        sqlx::query("INSERT INTO schema_info VALUES (-1)")
            .execute(catalog.pool())
            .await
            .unwrap();

        let err = assert_err!(catalog.schema_version().await);
        assert!(matches!(err, CatalogError::InvalidVersion(-1)));
    }

    #[tokio::test]
    async fn test_file_catalog_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.db");

        let catalog = Catalog::open(&path).await.unwrap();
        catalog.setup().await.unwrap();
        catalog.close().await;

        let reopened = Catalog::open(&path).await.unwrap();
        assert_eq!(reopened.schema_version().await.unwrap(), CURRENT_SCHEMA_VERSION);
    }
}
