use crate::error::MigrationError;
use crate::event::Event;
use crate::migration::{EventMigration, MigrationContext};
use std::collections::BTreeMap;

/// Drops fields from every event of their collection.
///
/// `Create` always survives the removal. Any other event whose payload becomes empty is dropped.
#[derive(Debug, Clone)]
pub struct RemoveFieldsMigration {
    target: i32,
    name: &'static str,
    collection_fields: BTreeMap<String, Vec<String>>,
}

impl RemoveFieldsMigration {
    /// A migration to `target` that removes nothing yet.
    pub fn new(target: i32, name: &'static str) -> Self {
        Self {
            target,
            name,
            collection_fields: BTreeMap::new(),
        }
    }

    /// Shorthand for a single `collection.field`.
    pub fn single(target: i32, name: &'static str, collection: &str, field: &str) -> Self {
        Self::new(target, name).field(collection, field)
    }

    /// Adds `collection.field` to the removed fields.
    pub fn field(mut self, collection: &str, field: &str) -> Self {
        let fields = self
            .collection_fields
            .entry(collection.to_string())
            .or_default();
        if !fields.iter().any(|f| f == field) {
            fields.push(field.to_string());
        }
        self
    }
}

impl EventMigration for RemoveFieldsMigration {
    fn target_migration_index(&self) -> i32 {
        self.target
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn migrate_event(
        &mut self,
        event: &Event,
        _ctx: &MigrationContext<'_>,
    ) -> Result<Option<Vec<Event>>, MigrationError> {
        let Some(fields) = self.collection_fields.get(event.collection()) else {
            return Ok(None);
        };
        let names: Vec<&str> = fields.iter().map(String::as_str).collect();
        let mut rewritten = event.clone();
        if !rewritten.remove_fields(&names) {
            return Ok(None);
        }
        if rewritten.is_empty() {
            return Ok(Some(Vec::new()));
        }
        Ok(Some(vec![rewritten]))
    }
}
