//! # Evolve Postgres
//!
//! A Postgres [`LogStoreBackend`](evolve_core::log_store::LogStoreBackend) for the migration
//! engine, together with the versioned schema it needs.

#![deny(missing_docs)]

pub mod log_store;
pub mod schema;

pub use log_store::{DEFAULT_LOCK_KEY, PgLogStore, PgLogStoreError};
pub use schema::{SchemaMigration, SchemaMigrationError, SchemaMigrator};
