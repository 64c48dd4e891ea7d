//! MI 8: events that change nothing are pruned.
//!
//! Update keys that repeat the current value, deleted fields that are not there, list additions
//! already present and removals not present are dropped against the rewritten state. An event
//! left without payload is dropped entirely.

use evolve_core::prelude::*;
use serde_json::Value;

/// The migration index this migration raises the log to.
pub const TARGET: i32 = 8;

/// See the module documentation.
pub fn migration() -> Migration {
    Migration::event(RemoveUnnecessaryEvents)
}

/// Event migration behind [`migration`].
#[derive(Debug, Default)]
pub struct RemoveUnnecessaryEvents;

fn current_list(model: &Model, field: &str) -> Option<Vec<Value>> {
    model.get_list(field).cloned()
}

/// Prunes one side of a list update. Keys whose list ends up empty are dropped, unless the field
/// is missing on the model: the update then still materializes it.
fn prune_lists(
    model: &Model,
    lists: &ListFields,
    keep: impl Fn(&str, &[Value], &Value) -> bool,
) -> ListFields {
    let mut pruned = ListFields::new();
    for (field, values) in lists {
        let Value::Array(values) = values else {
            pruned.insert(field.clone(), values.clone());
            continue;
        };
        match current_list(model, field) {
            Some(current) => {
                let values: Vec<Value> = values
                    .iter()
                    .filter(|value| keep(field.as_str(), current.as_slice(), *value))
                    .cloned()
                    .collect();
                if !values.is_empty() {
                    pruned.insert(field.clone(), Value::Array(values));
                }
            }
            None => {
                pruned.insert(field.clone(), Value::Array(values.clone()));
            }
        }
    }
    pruned
}

/// [`prune_lists`] over an optional side. An absent side stays absent and a side emptied by
/// pruning disappears.
fn prune_side(
    model: &Model,
    side: &Option<ListFields>,
    keep: impl Fn(&str, &[Value], &Value) -> bool,
) -> Option<ListFields> {
    let lists = side.as_ref()?;
    let pruned = prune_lists(model, lists, keep);
    if pruned.is_empty() && !lists.is_empty() {
        return None;
    }
    Some(pruned)
}

impl EventMigration for RemoveUnnecessaryEvents {
    fn target_migration_index(&self) -> i32 {
        TARGET
    }

    fn name(&self) -> &'static str {
        "remove_unnecessary_events"
    }

    fn migrate_event(
        &mut self,
        event: &Event,
        ctx: &MigrationContext<'_>,
    ) -> Result<Option<Vec<Event>>, MigrationError> {
        let rewritten = match event {
            Event::Update { fqid, fields } => {
                let model = ctx.new.get_model(fqid)?;
                let pruned: Fields = fields
                    .iter()
                    .filter(|(key, value)| match model.get(key) {
                        Some(current) => current != *value,
                        None => !value.is_null(),
                    })
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect();
                if pruned.len() == fields.len() {
                    return Ok(None);
                }
                Event::update(fqid.clone(), pruned)
            }
            Event::DeleteFields { fqid, fields } => {
                let model = ctx.new.get_model(fqid)?;
                let pruned: Vec<String> = fields
                    .iter()
                    .filter(|field| model.get(field).is_some())
                    .cloned()
                    .collect();
                if pruned.len() == fields.len() {
                    return Ok(None);
                }
                Event::DeleteFields {
                    fqid: fqid.clone(),
                    fields: pruned,
                }
            }
            Event::ListUpdate { fqid, add, remove } => {
                let model = ctx.new.get_model(fqid)?;
                let pruned_add =
                    prune_side(&model, add, |_, current, value| !current.contains(value));
                let added = |field: &str, value: &Value| {
                    add.as_ref()
                        .and_then(|add| add.get(field))
                        .and_then(Value::as_array)
                        .is_some_and(|values| values.contains(value))
                };
                let pruned_remove = prune_side(&model, remove, |field, current, value| {
                    current.contains(value) || added(field, value)
                });
                if &pruned_add == add && &pruned_remove == remove {
                    return Ok(None);
                }
                Event::ListUpdate {
                    fqid: fqid.clone(),
                    add: pruned_add,
                    remove: pruned_remove,
                }
            }
            Event::Create { .. } | Event::Delete { .. } | Event::Restore { .. } => return Ok(None),
        };
        if rewritten.is_empty() {
            log::debug!(
                "Position {}: dropping no-op {} on {}",
                ctx.position,
                event.kind().as_str(),
                event.fqid()
            );
            return Ok(Some(Vec::new()));
        }
        Ok(Some(vec![rewritten]))
    }
}
