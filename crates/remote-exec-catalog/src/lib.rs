//! Catalog database for targets, stores, schedules, jobs and archives.
//!
//! Only opening the database and bootstrapping its schema live here; the
//! agent itself never reads or writes catalog rows.

pub mod catalog;
pub mod error;
pub mod schema;

pub use catalog::Catalog;
pub use error::CatalogError;
pub use schema::CURRENT_SCHEMA_VERSION;
