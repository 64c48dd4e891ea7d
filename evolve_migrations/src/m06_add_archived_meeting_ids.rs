//! MI 6: archived meetings are tracked explicitly.
//!
//! A meeting whose `is_active_in_organization_id` is unset or `0` is archived. The migration
//! writes `meeting.is_archived_in_organization_id` next to every change of the active flag and
//! keeps `organization/1.archived_meeting_ids` in step through additional events at the end of
//! each position. Changes made while `organization/1` does not exist yet are held back and
//! written at the end of the first position in which it exists.

use crate::ONE_ORGANIZATION_ID;
use evolve_core::fields;
use evolve_core::prelude::*;
use serde_json::{Value, json};
use std::collections::BTreeMap;

/// The migration index this migration raises the log to.
pub const TARGET: i32 = 6;

const ACTIVE: &str = "is_active_in_organization_id";
const ARCHIVED: &str = "is_archived_in_organization_id";

/// See the module documentation.
pub fn migration() -> Migration {
    Migration::event(AddArchivedMeetingIds::default())
}

/// Event migration behind [`migration`].
#[derive(Debug, Default)]
pub struct AddArchivedMeetingIds {
    /// Archived state of each meeting changed since `archived_meeting_ids` was last written.
    pending: BTreeMap<u64, bool>,
}

fn is_active(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(value) => value.as_i64() != Some(0),
    }
}

fn is_archived(model: &Model) -> bool {
    model.get(ARCHIVED).is_some_and(|v| !v.is_null())
}

impl AddArchivedMeetingIds {
    /// The update bringing the archived flag of `fqid` from `was_archived` to `archived`.
    fn transition(&mut self, fqid: &Fqid, was_archived: bool, archived: bool) -> Option<Fields> {
        if was_archived == archived {
            return None;
        }
        self.pending.insert(fqid.id(), archived);
        Some(if archived {
            fields! {ARCHIVED => ONE_ORGANIZATION_ID}
        } else {
            fields! {ARCHIVED => null}
        })
    }
}

impl EventMigration for AddArchivedMeetingIds {
    fn target_migration_index(&self) -> i32 {
        TARGET
    }

    fn name(&self) -> &'static str {
        "add_archived_meeting_ids"
    }

    fn migrate_event(
        &mut self,
        event: &Event,
        ctx: &MigrationContext<'_>,
    ) -> Result<Option<Vec<Event>>, MigrationError> {
        if event.collection() != "meeting" {
            return Ok(None);
        }
        match event {
            Event::Create { fqid, fields } => {
                if is_active(fields.get(ACTIVE)) {
                    return Ok(None);
                }
                self.pending.insert(fqid.id(), true);
                let mut fields = fields.clone();
                fields.insert(ARCHIVED.to_string(), json!(ONE_ORGANIZATION_ID));
                Ok(Some(vec![Event::create(fqid.clone(), fields)]))
            }
            Event::Update { fqid, fields } if fields.contains_key(ACTIVE) => {
                let was_archived = is_archived(&ctx.new.get_model(fqid)?);
                let Some(change) =
                    self.transition(fqid, was_archived, !is_active(fields.get(ACTIVE)))
                else {
                    return Ok(None);
                };
                let mut fields = fields.clone();
                fields.extend(change);
                Ok(Some(vec![Event::update(fqid.clone(), fields)]))
            }
            Event::DeleteFields { fqid, fields } if fields.iter().any(|f| f == ACTIVE) => {
                let was_archived = is_archived(&ctx.new.get_model(fqid)?);
                let Some(change) = self.transition(fqid, was_archived, true) else {
                    return Ok(None);
                };
                Ok(Some(vec![event.clone(), Event::update(fqid.clone(), change)]))
            }
            Event::Delete { fqid } => {
                if is_archived(&ctx.new.get_model(fqid)?) {
                    self.pending.insert(fqid.id(), false);
                }
                Ok(None)
            }
            Event::Restore { fqid } => {
                let (model, _) = ctx.new.get_model_ignore_deleted(fqid)?;
                if is_archived(&model) {
                    self.pending.insert(fqid.id(), true);
                }
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    fn get_additional_events(
        &mut self,
        ctx: &MigrationContext<'_>,
    ) -> Result<Option<Vec<Event>>, MigrationError> {
        if self.pending.is_empty() {
            return Ok(None);
        }
        let organization = Fqid::new("organization", ONE_ORGANIZATION_ID)
            .map_err(|e| MigrationError::Codec(e.into()))?;
        if !ctx.new.model_exists(&organization) {
            log::debug!(
                "Position {}: no {organization}, holding back {} archived meeting changes",
                ctx.position,
                self.pending.len()
            );
            return Ok(None);
        }
        let pending = std::mem::take(&mut self.pending);
        let (archived, restored): (Vec<_>, Vec<_>) =
            pending.iter().partition(|(_, archived)| **archived);
        let ids = |entries: Vec<(&u64, &bool)>| -> Value {
            Value::Array(entries.into_iter().map(|(id, _)| json!(id)).collect())
        };
        let mut add = ListFields::new();
        let mut remove = ListFields::new();
        if !archived.is_empty() {
            add.insert("archived_meeting_ids".to_string(), ids(archived));
        }
        if !restored.is_empty() {
            remove.insert("archived_meeting_ids".to_string(), ids(restored));
        }
        Ok(Some(vec![Event::ListUpdate {
            fqid: organization,
            add: (!add.is_empty()).then_some(add),
            remove: (!remove.is_empty()).then_some(remove),
        }]))
    }
}
