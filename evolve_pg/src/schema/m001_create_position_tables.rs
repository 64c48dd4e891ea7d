//! Schema migration 001: the live position log.
//!
//! Events are stored as `JSON`, not `JSONB`, so that field order survives a round trip.

use super::SchemaMigration;

pub(super) const MIGRATION: SchemaMigration = SchemaMigration {
    version: 1,
    name: "create_position_tables",
    statements: &[
        r#"
        CREATE TABLE IF NOT EXISTS evolve_positions (
            position BIGINT PRIMARY KEY,
            migration_index INTEGER NOT NULL,
            timestamp TIMESTAMPTZ,
            information JSON
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS evolve_events (
            position BIGINT NOT NULL REFERENCES evolve_positions (position) ON DELETE CASCADE,
            weight INTEGER NOT NULL,
            data JSON NOT NULL,
            PRIMARY KEY (position, weight)
        )
        "#,
    ],
};
