//! Versioned DDL for the tables the [`PgLogStore`](crate::PgLogStore) works on.
//!
//! Every step is a list of statements with a version and a name. Applied steps are recorded in
//! `_evolve_schema_migrations` together with a SHA-256 checksum of their statements, so a step
//! that was edited after it ran is refused. These steps have nothing to do with the event
//! migrations the engine runs over the log.
//!
//! ```rust,ignore
//! let applied = SchemaMigrator::new(pool).run().await?;
//! ```
//!
//! New steps go into a new `mXXX_*.rs` file and at the end of [`SCHEMA`]. Steps are never
//! edited once released.

mod m001_create_position_tables;
mod m002_create_staging_tables;
mod m003_create_derived_tables;
mod m004_create_migration_state;
mod m005_add_timestamp_text;

use sha2::{Digest, Sha256};
use sqlx::{FromRow, PgPool};
use std::collections::BTreeMap;

/// Every schema step, ascending by version.
pub const SCHEMA: &[SchemaMigration] = &[
    m001_create_position_tables::MIGRATION,
    m002_create_staging_tables::MIGRATION,
    m003_create_derived_tables::MIGRATION,
    m004_create_migration_state::MIGRATION,
    m005_add_timestamp_text::MIGRATION,
];

/// Errors raised while bringing the schema up to date.
#[derive(Debug, thiserror::Error)]
pub enum SchemaMigrationError {
    /// Reading or writing the tracking table failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A recorded step no longer matches its statements.
    #[error("Schema migration {version} ({name}) checksum mismatch: expected {expected}, found {found}")]
    ChecksumMismatch {
        /// Version of the step.
        version: i64,
        /// Name of the step.
        name: String,
        /// Checksum stored when the step ran.
        expected: String,
        /// Checksum of the statements in this build.
        found: String,
    },

    /// The database ran a step this build does not know.
    #[error("Schema migration {version} ({name}) is newer than this build")]
    UnknownVersion {
        /// Version of the step.
        version: i64,
        /// Name recorded for it.
        name: String,
    },

    /// A statement of a step failed; the step was rolled back.
    #[error("Schema migration {version} ({name}) failed: {source}")]
    MigrationFailed {
        /// Version of the step.
        version: i64,
        /// Name of the step.
        name: &'static str,
        /// The failing statement's error.
        source: sqlx::Error,
    },
}

/// One schema step.
#[derive(Debug, Clone, Copy)]
pub struct SchemaMigration {
    /// Unique, increasing version.
    pub version: i64,
    /// Snake case name, e.g. `create_position_tables`.
    pub name: &'static str,
    /// DDL run in order inside one transaction.
    pub statements: &'static [&'static str],
}

impl SchemaMigration {
    /// Hex SHA-256 over version, name and statements.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.version.to_le_bytes());
        hasher.update(self.name.as_bytes());
        for statement in self.statements {
            hasher.update(statement.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

/// A row of `_evolve_schema_migrations`.
#[derive(Debug, Clone, FromRow)]
pub struct AppliedSchemaMigration {
    /// Version of the step.
    pub version: i64,
    /// Name of the step.
    pub name: String,
    /// When it ran.
    pub applied_at: chrono::DateTime<chrono::Utc>,
    /// Checksum stored when it ran.
    pub checksum: String,
}

/// Runs the pending steps of [`SCHEMA`], each exactly once.
#[derive(Debug, Clone)]
pub struct SchemaMigrator {
    pool: PgPool,
}

impl SchemaMigrator {
    /// Creates a migrator over `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn ensure_tracking_table(&self) -> Result<(), SchemaMigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _evolve_schema_migrations (
                version BIGINT PRIMARY KEY,
                name VARCHAR(255) NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                checksum VARCHAR(64) NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Checks the recorded steps against this build and returns the ones still to run.
    async fn verify(&self) -> Result<Vec<&'static SchemaMigration>, SchemaMigrationError> {
        let recorded: BTreeMap<i64, AppliedSchemaMigration> = self
            .applied()
            .await?
            .into_iter()
            .map(|record| (record.version, record))
            .collect();

        for record in recorded.values() {
            let Some(step) = SCHEMA.iter().find(|step| step.version == record.version) else {
                return Err(SchemaMigrationError::UnknownVersion {
                    version: record.version,
                    name: record.name.clone(),
                });
            };
            let found = step.checksum();
            if found != record.checksum {
                return Err(SchemaMigrationError::ChecksumMismatch {
                    version: record.version,
                    name: record.name.clone(),
                    expected: record.checksum.clone(),
                    found,
                });
            }
        }

        Ok(SCHEMA
            .iter()
            .filter(|step| !recorded.contains_key(&step.version))
            .collect())
    }

    /// Runs every pending step in its own transaction and returns how many ran.
    pub async fn run(&self) -> Result<usize, SchemaMigrationError> {
        let pending = self.verify().await?;
        if pending.is_empty() {
            log::debug!("Schema is up to date");
            return Ok(0);
        }

        for step in &pending {
            log::info!("Running schema migration {} ({})", step.version, step.name);
            let failed = |source| SchemaMigrationError::MigrationFailed {
                version: step.version,
                name: step.name,
                source,
            };
            let mut tx = self.pool.begin().await?;
            for statement in step.statements {
                sqlx::query(*statement)
                    .execute(&mut *tx)
                    .await
                    .map_err(failed)?;
            }
            sqlx::query(
                "INSERT INTO _evolve_schema_migrations (version, name, checksum) VALUES ($1, $2, $3)",
            )
            .bind(step.version)
            .bind(step.name)
            .bind(step.checksum())
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
        }

        log::info!("Applied {} schema migrations", pending.len());
        Ok(pending.len())
    }

    /// The highest recorded version, `0` on a fresh database.
    pub async fn current_version(&self) -> Result<i64, SchemaMigrationError> {
        Ok(self
            .applied()
            .await?
            .last()
            .map_or(0, |record| record.version))
    }

    /// The steps not recorded yet. Fails like [`run`](Self::run) on a tampered or newer schema.
    pub async fn pending(&self) -> Result<Vec<&'static SchemaMigration>, SchemaMigrationError> {
        self.verify().await
    }

    /// The recorded steps, ascending.
    pub async fn applied(&self) -> Result<Vec<AppliedSchemaMigration>, SchemaMigrationError> {
        self.ensure_tracking_table().await?;
        Ok(sqlx::query_as::<_, AppliedSchemaMigration>(
            "SELECT version, name, applied_at, checksum FROM _evolve_schema_migrations ORDER BY version",
        )
        .fetch_all(&self.pool)
        .await?)
    }
}
