//! Schema migration 002: the staging area a migration run writes to, shaped like the live log.

use super::SchemaMigration;

pub(super) const MIGRATION: SchemaMigration = SchemaMigration {
    version: 2,
    name: "create_staging_tables",
    statements: &[
        r#"
        CREATE TABLE IF NOT EXISTS evolve_staged_positions (
            position BIGINT PRIMARY KEY,
            migration_index INTEGER NOT NULL,
            timestamp TIMESTAMPTZ,
            information JSON
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS evolve_staged_events (
            position BIGINT NOT NULL REFERENCES evolve_staged_positions (position) ON DELETE CASCADE,
            weight INTEGER NOT NULL,
            data JSON NOT NULL,
            PRIMARY KEY (position, weight)
        )
        "#,
    ],
};
