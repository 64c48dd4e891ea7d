use crate::error::MigrationError;
use crate::event::{Event, Fields};
use crate::migration::{EventMigration, MigrationContext};

/// Fills default values into every `Create` of a collection that lacks them.
///
/// A field that is absent or `null` receives the default. Other events are untouched.
#[derive(Debug, Clone)]
pub struct AddFieldsMigration {
    target: i32,
    name: &'static str,
    collection: String,
    defaults: Fields,
}

impl AddFieldsMigration {
    /// A migration filling `defaults` into creates of `collection`.
    pub fn new(target: i32, name: &'static str, collection: &str, defaults: Fields) -> Self {
        Self {
            target,
            name,
            collection: collection.to_string(),
            defaults,
        }
    }
}

impl EventMigration for AddFieldsMigration {
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
        let Event::Create { fqid, fields } = event else {
            return Ok(None);
        };
        if !fqid.is_in(&self.collection) {
            return Ok(None);
        }
        let missing: Vec<_> = self
            .defaults
            .iter()
            .filter(|(key, _)| fields.get(*key).is_none_or(|v| v.is_null()))
            .collect();
        if missing.is_empty() {
            return Ok(None);
        }
        let mut fields = fields.clone();
        for (key, value) in missing {
            fields.insert(key.clone(), value.clone());
        }
        Ok(Some(vec![Event::create(fqid.clone(), fields)]))
    }
}
