//! Schema migration 004: the single-row staging state, seeded as idle.

use super::SchemaMigration;

pub(super) const MIGRATION: SchemaMigration = SchemaMigration {
    version: 4,
    name: "create_migration_state",
    statements: &[
        r#"
        CREATE TABLE IF NOT EXISTS evolve_migration_state (
            id SMALLINT PRIMARY KEY CHECK (id = 1),
            phase VARCHAR(16) NOT NULL CHECK (phase IN ('idle', 'staged', 'swapped')),
            target_mi INTEGER,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
        r#"
        INSERT INTO evolve_migration_state (id, phase)
        VALUES (1, 'idle')
        ON CONFLICT (id) DO NOTHING
        "#,
    ],
};
