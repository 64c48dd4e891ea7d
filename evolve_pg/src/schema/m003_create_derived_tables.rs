//! Schema migration 003: materialized models and the collection field index, rebuilt from the
//! live log on finalize.

use super::SchemaMigration;

pub(super) const MIGRATION: SchemaMigration = SchemaMigration {
    version: 3,
    name: "create_derived_tables",
    statements: &[
        r#"
        CREATE TABLE IF NOT EXISTS evolve_models (
            fqid VARCHAR(255) PRIMARY KEY,
            collection VARCHAR(255) NOT NULL,
            id BIGINT NOT NULL,
            data JSON NOT NULL,
            deleted BOOLEAN NOT NULL,
            position BIGINT NOT NULL
        )
        "#,
        r#"
        CREATE INDEX IF NOT EXISTS idx_evolve_models_collection
            ON evolve_models (collection, id)
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS evolve_collection_fields (
            collectionfield VARCHAR(255) PRIMARY KEY,
            position BIGINT NOT NULL
        )
        "#,
    ],
};
