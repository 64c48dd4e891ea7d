use crate::error::MigrationError;
use crate::event::Event;
use crate::migration::{EventMigration, MigrationContext};
use serde_json::Value;
use std::collections::BTreeMap;

/// Numbers the models of a collection per group, in creation order.
///
/// The counters are seeded lazily on the first `Create` seen, from the highest number already
/// present per group in the rewritten log. A `Create` that already carries a number keeps it and
/// raises its group's counter.
#[derive(Debug, Clone)]
pub struct SequentialNumbersMigration {
    target: i32,
    name: &'static str,
    collection: String,
    field: String,
    group_field: String,
    counters: Option<BTreeMap<i64, i64>>,
}

impl SequentialNumbersMigration {
    /// Numbers `collection.field` per value of `collection.group_field`.
    pub fn new(
        target: i32,
        name: &'static str,
        collection: &str,
        field: &str,
        group_field: &str,
    ) -> Self {
        Self {
            target,
            name,
            collection: collection.to_string(),
            field: field.to_string(),
            group_field: group_field.to_string(),
            counters: None,
        }
    }

    fn seed(&self, ctx: &MigrationContext<'_>) -> BTreeMap<i64, i64> {
        let mut counters = BTreeMap::new();
        let models = ctx.new.get_all(
            &self.collection,
            Some(&[self.field.as_str(), self.group_field.as_str()][..]),
        );
        for model in models.values() {
            let (Some(group), Some(number)) =
                (model.get_i64(&self.group_field), model.get_i64(&self.field))
            else {
                continue;
            };
            let counter = counters.entry(group).or_insert(0);
            *counter = (*counter).max(number);
        }
        log::debug!(
            "Seeded {} counters for {}.{}",
            counters.len(),
            self.collection,
            self.field
        );
        counters
    }
}

impl EventMigration for SequentialNumbersMigration {
    fn target_migration_index(&self) -> i32 {
        self.target
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn migrate_event(
        &mut self,
        event: &Event,
        ctx: &MigrationContext<'_>,
    ) -> Result<Option<Vec<Event>>, MigrationError> {
        let Event::Create { fqid, fields } = event else {
            return Ok(None);
        };
        if !fqid.is_in(&self.collection) {
            return Ok(None);
        }
        let group = fields
            .get(&self.group_field)
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                MigrationError::assertion(fqid, format!("create must carry {}", self.group_field))
            })?;
        if self.counters.is_none() {
            self.counters = Some(self.seed(ctx));
        }
        let counters = self.counters.get_or_insert_with(BTreeMap::new);
        let counter = counters.entry(group).or_insert(0);

        if let Some(existing) = fields.get(&self.field).and_then(Value::as_i64) {
            *counter = (*counter).max(existing);
            return Ok(None);
        }
        *counter += 1;
        let mut fields = fields.clone();
        fields.insert(self.field.clone(), Value::from(*counter));
        Ok(Some(vec![Event::create(fqid.clone(), fields)]))
    }
}
