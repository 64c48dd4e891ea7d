//! The migration traits.
//!
//! A migration raises the log from `target_migration_index - 1` to `target_migration_index`. It is
//! either an [`EventMigration`], which rewrites the log position by position, or a
//! [`ModelMigration`], which reads the projected models once the stream is settled and answers
//! with [`RequestEvent`]s.
//!
//! # Example
//!
//! ```rust
//! use evolve_core::prelude::*;
//!
//! /// Drops every `agenda_item` whose `type` is `"hidden"` at creation.
//! struct DropHiddenAgendaItems;
//!
//! impl EventMigration for DropHiddenAgendaItems {
//!     fn target_migration_index(&self) -> i32 { 7 }
//!     fn name(&self) -> &'static str { "drop_hidden_agenda_items" }
//!
//!     fn migrate_event(
//!         &mut self,
//!         event: &Event,
//!         _ctx: &MigrationContext<'_>,
//!     ) -> Result<Option<Vec<Event>>, MigrationError> {
//!         match event {
//!             Event::Create { fqid, fields }
//!                 if fqid.is_in("agenda_item") && fields.get("type") == Some(&"hidden".into()) =>
//!             {
//!                 Ok(Some(vec![]))
//!             }
//!             _ => Ok(None),
//!         }
//!     }
//! }
//! ```

use crate::accessor::MigrationReader;
use crate::error::MigrationError;
use crate::event::{Event, Fields, ListFields};
use crate::fqid::Fqid;

/// What a migration sees while a position is replayed.
pub struct MigrationContext<'a> {
    /// The log as it entered this migration, up to just before the current event.
    pub old: &'a dyn MigrationReader,
    /// The rewritten log, including events emitted earlier in the current position.
    pub new: &'a dyn MigrationReader,
    /// The position being replayed.
    pub position: u64,
}

/// Rewrites events position by position.
///
/// Per position the engine calls [`position_init`](Self::position_init), then
/// [`migrate_event`](Self::migrate_event) for every event in order, then
/// [`get_additional_events`](Self::get_additional_events). Calls are strictly serial.
pub trait EventMigration: Send {
    /// The migration index this migration raises the log to.
    fn target_migration_index(&self) -> i32;

    /// Human readable name, used in logs and position information.
    fn name(&self) -> &'static str;

    /// Resets per-position state.
    fn position_init(&mut self, _ctx: &MigrationContext<'_>) -> Result<(), MigrationError> {
        Ok(())
    }

    /// `None` keeps the event, `Some(events)` replaces it (empty drops it).
    fn migrate_event(
        &mut self,
        event: &Event,
        ctx: &MigrationContext<'_>,
    ) -> Result<Option<Vec<Event>>, MigrationError>;

    /// Events appended to the end of the current position.
    fn get_additional_events(
        &mut self,
        _ctx: &MigrationContext<'_>,
    ) -> Result<Option<Vec<Event>>, MigrationError> {
        Ok(None)
    }
}

/// Reads the projected models and requests changes against them.
pub trait ModelMigration: Send {
    /// The migration index this migration raises the log to.
    fn target_migration_index(&self) -> i32;

    /// Human readable name, used in logs and position information.
    fn name(&self) -> &'static str;

    /// Requests to apply, `None` or an empty list when nothing changes.
    fn migrate_models(
        &mut self,
        reader: &dyn MigrationReader,
    ) -> Result<Option<Vec<RequestEvent>>, MigrationError>;
}

/// A migration of either kind.
pub enum Migration {
    /// Rewrites the event stream.
    Event(Box<dyn EventMigration>),
    /// Operates on the projected models.
    Model(Box<dyn ModelMigration>),
}

impl Migration {
    /// Wraps an event migration.
    pub fn event(migration: impl EventMigration + 'static) -> Self {
        Migration::Event(Box::new(migration))
    }

    /// Wraps a model migration.
    pub fn model(migration: impl ModelMigration + 'static) -> Self {
        Migration::Model(Box::new(migration))
    }

    /// The declared target index.
    pub fn target_migration_index(&self) -> i32 {
        match self {
            Migration::Event(m) => m.target_migration_index(),
            Migration::Model(m) => m.target_migration_index(),
        }
    }

    /// The declared name.
    pub fn name(&self) -> &'static str {
        match self {
            Migration::Event(m) => m.name(),
            Migration::Model(m) => m.name(),
        }
    }
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Migration::Event(_) => "Event",
            Migration::Model(_) => "Model",
        };
        f.debug_struct("Migration")
            .field("kind", &kind)
            .field("target_migration_index", &self.target_migration_index())
            .field("name", &self.name())
            .finish()
    }
}

/// A change requested by a model migration.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestEvent {
    /// Create a model.
    Create {
        /// The model.
        fqid: Fqid,
        /// Initial fields; nulls are dropped.
        fields: Fields,
    },
    /// Change fields of a live model.
    Update {
        /// The model.
        fqid: Fqid,
        /// Fields to set; `null` deletes.
        fields: Fields,
        /// Values added to list fields.
        list_add: ListFields,
        /// Values removed from list fields.
        list_remove: ListFields,
    },
    /// Soft-delete a model.
    Delete {
        /// The model.
        fqid: Fqid,
    },
    /// Restore a soft-deleted model.
    Restore {
        /// The model.
        fqid: Fqid,
    },
}

impl RequestEvent {
    /// An update setting `fields` only.
    pub fn update(fqid: Fqid, fields: Fields) -> Self {
        RequestEvent::Update {
            fqid,
            fields,
            list_add: ListFields::new(),
            list_remove: ListFields::new(),
        }
    }

    /// Translates the request into ordinary events.
    ///
    /// An update becomes an `Update` of its non-null fields, a `DeleteFields` of its null fields
    /// and a `ListUpdate` of its list changes, each only when non-empty.
    pub fn into_events(self) -> Vec<Event> {
        match self {
            RequestEvent::Create { fqid, fields } => {
                let fields = fields.into_iter().filter(|(_, v)| !v.is_null()).collect();
                vec![Event::Create { fqid, fields }]
            }
            RequestEvent::Update {
                fqid,
                fields,
                list_add,
                list_remove,
            } => {
                let mut events = Vec::new();
                let mut set = Fields::new();
                let mut deleted = Vec::new();
                for (key, value) in fields {
                    if value.is_null() {
                        deleted.push(key);
                    } else {
                        set.insert(key, value);
                    }
                }
                if !set.is_empty() {
                    events.push(Event::Update {
                        fqid: fqid.clone(),
                        fields: set,
                    });
                }
                if !deleted.is_empty() {
                    events.push(Event::DeleteFields {
                        fqid: fqid.clone(),
                        fields: deleted,
                    });
                }
                if !list_add.is_empty() || !list_remove.is_empty() {
                    events.push(Event::ListUpdate {
                        fqid,
                        add: (!list_add.is_empty()).then_some(list_add),
                        remove: (!list_remove.is_empty()).then_some(list_remove),
                    });
                }
                events
            }
            RequestEvent::Delete { fqid } => vec![Event::Delete { fqid }],
            RequestEvent::Restore { fqid } => vec![Event::Restore { fqid }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields;
    use crate::fqid::fqid;
    use serde_json::json;

    #[test]
    fn update_request_splits_into_update_deletefields_and_listupdate() {
        let mut list_add = ListFields::new();
        list_add.insert("ids".into(), json!([1]));
        let request = RequestEvent::Update {
            fqid: fqid("a", 1),
            fields: fields! {"x" => 1, "y" => null},
            list_add,
            list_remove: ListFields::new(),
        };
        let events = request.into_events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], Event::update(fqid("a", 1), fields! {"x" => 1}));
        assert_eq!(events[1], Event::delete_fields(fqid("a", 1), ["y"]));
        assert!(matches!(events[2], Event::ListUpdate { .. }));
    }

    #[test]
    fn empty_update_request_yields_nothing() {
        assert!(RequestEvent::update(fqid("a", 1), fields! {}).into_events().is_empty());
    }

    #[test]
    fn create_request_drops_nulls() {
        let events = RequestEvent::Create {
            fqid: fqid("a", 1),
            fields: fields! {"x" => 1, "y" => null},
        }
        .into_events();
        assert_eq!(events, vec![Event::create(fqid("a", 1), fields! {"x" => 1})]);
    }
}
