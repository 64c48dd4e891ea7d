use crate::error::MigrationError;
use crate::event::Event;
use crate::migration::{EventMigration, MigrationContext};
use serde_json::Value;

/// Converts a renamed value, e.g. a scalar into a one-element list.
pub type ValueTransform = Box<dyn Fn(Value) -> Value + Send>;

/// Renames `collection.old` to `collection.new` in every event carrying field data.
///
/// When both names appear in one payload the new one wins and the old one is dropped.
pub struct RenameFieldMigration {
    target: i32,
    name: &'static str,
    collection: String,
    old_field: String,
    new_field: String,
    transform: Option<ValueTransform>,
}

impl RenameFieldMigration {
    /// A plain rename.
    pub fn new(
        target: i32,
        name: &'static str,
        collection: &str,
        old_field: &str,
        new_field: &str,
    ) -> Self {
        Self {
            target,
            name,
            collection: collection.to_string(),
            old_field: old_field.to_string(),
            new_field: new_field.to_string(),
            transform: None,
        }
    }

    /// Applies `transform` to renamed values of `Create` and `Update` payloads.
    pub fn with_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(Value) -> Value + Send + 'static,
    {
        self.transform = Some(Box::new(transform));
        self
    }
}

impl std::fmt::Debug for RenameFieldMigration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenameFieldMigration")
            .field("target", &self.target)
            .field("collection", &self.collection)
            .field("old_field", &self.old_field)
            .field("new_field", &self.new_field)
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

impl EventMigration for RenameFieldMigration {
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
        if event.collection() != self.collection {
            return Ok(None);
        }
        let transform = self
            .transform
            .as_deref()
            .map(|f| f as &dyn Fn(Value) -> Value);
        let mut rewritten = event.clone();
        if !rewritten.rename_field(&self.old_field, &self.new_field, transform) {
            return Ok(None);
        }
        if rewritten.is_empty() {
            return Ok(Some(Vec::new()));
        }
        Ok(Some(vec![rewritten]))
    }
}
