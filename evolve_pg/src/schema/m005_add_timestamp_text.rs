//! Schema migration 005: the timestamp text as it was written.
//!
//! `TIMESTAMPTZ` normalizes offsets and keeps microseconds only, so the original RFC 3339 text
//! is stored next to it and preferred when reading.

use super::SchemaMigration;

pub(super) const MIGRATION: SchemaMigration = SchemaMigration {
    version: 5,
    name: "add_timestamp_text",
    statements: &[
        "ALTER TABLE evolve_positions ADD COLUMN IF NOT EXISTS timestamp_text TEXT",
        "ALTER TABLE evolve_staged_positions ADD COLUMN IF NOT EXISTS timestamp_text TEXT",
    ],
};
