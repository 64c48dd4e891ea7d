//! The event model and its persisted wire form.
//!
//! An [`Event`] is one mutation of one model. The closed set of variants is matched exhaustively
//! wherever events are rewritten, so the field-level helpers here ([`Event::remove_fields`],
//! [`Event::rename_field`], [`Event::is_empty`]) cover every variant that can carry field data.
//!
//! On disk an event is a JSON object with a `type` discriminator:
//!
//! ```json
//! {"type": "create", "fqid": "topic/1", "fields": {"title": "Agenda"}}
//! {"type": "update", "fqid": "topic/1", "fields": {"title": null}}
//! {"type": "deletefields", "fqid": "topic/1", "fields": ["title"]}
//! {"type": "listfields", "fqid": "meeting/1", "list_fields": {"add": {"topic_ids": [1]}}}
//! {"type": "delete", "fqid": "topic/1"}
//! {"type": "restore", "fqid": "topic/1"}
//! ```

use crate::error::CodecError;
use crate::fqid::Fqid;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Field name to value, in insertion order.
pub type Fields = Map<String, Value>;

/// Field name to list of values, used by `ListUpdate`. Every value is a JSON array.
pub type ListFields = Map<String, Value>;

/// The lists of one side of a `ListUpdate`, empty when the side is absent.
pub fn lists(side: &Option<ListFields>) -> impl Iterator<Item = (&String, &Value)> {
    side.iter().flatten()
}

/// A single model mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEvent", into = "RawEvent")]
pub enum Event {
    /// Establishes a model that is absent or soft-deleted.
    Create {
        /// The model.
        fqid: Fqid,
        /// Initial fields.
        fields: Fields,
    },
    /// Overlays fields onto a live model; `null` deletes a field.
    Update {
        /// The model.
        fqid: Fqid,
        /// Fields to overlay.
        fields: Fields,
    },
    /// Removes fields from a live model.
    DeleteFields {
        /// The model.
        fqid: Fqid,
        /// Names of the removed fields.
        fields: Vec<String>,
    },
    /// Per-field list union and difference.
    ///
    /// A side is `None` when its key is absent on the wire, so `{"add": {}}` survives a round
    /// trip.
    ListUpdate {
        /// The model.
        fqid: Fqid,
        /// Values added to each list field.
        add: Option<ListFields>,
        /// Values removed from each list field.
        remove: Option<ListFields>,
    },
    /// Soft-deletes a live model.
    Delete {
        /// The model.
        fqid: Fqid,
    },
    /// Revives a soft-deleted model.
    Restore {
        /// The model.
        fqid: Fqid,
    },
}

/// The discriminator of an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// `create`
    Create,
    /// `update`
    Update,
    /// `deletefields`
    DeleteFields,
    /// `listfields`
    ListUpdate,
    /// `delete`
    Delete,
    /// `restore`
    Restore,
}

impl EventKind {
    /// The `type` value used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Create => "create",
            EventKind::Update => "update",
            EventKind::DeleteFields => "deletefields",
            EventKind::ListUpdate => "listfields",
            EventKind::Delete => "delete",
            EventKind::Restore => "restore",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "create" => EventKind::Create,
            "update" => EventKind::Update,
            "deletefields" => EventKind::DeleteFields,
            "listfields" => EventKind::ListUpdate,
            "delete" => EventKind::Delete,
            "restore" => EventKind::Restore,
            _ => return None,
        })
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Event {
    /// Builds a `Create` event.
    pub fn create(fqid: Fqid, fields: Fields) -> Self {
        Event::Create { fqid, fields }
    }

    /// Builds an `Update` event.
    pub fn update(fqid: Fqid, fields: Fields) -> Self {
        Event::Update { fqid, fields }
    }

    /// Builds a `DeleteFields` event.
    pub fn delete_fields<I, S>(fqid: Fqid, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Event::DeleteFields {
            fqid,
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    /// Builds a `ListUpdate` event from `(field, values)` pairs. A side without pairs is left
    /// out.
    pub fn list_update<A, R>(fqid: Fqid, add: A, remove: R) -> Self
    where
        A: IntoIterator<Item = (String, Vec<Value>)>,
        R: IntoIterator<Item = (String, Vec<Value>)>,
    {
        let to_map = |pairs: Vec<(String, Vec<Value>)>| {
            let map: ListFields = pairs
                .into_iter()
                .map(|(field, values)| (field, Value::Array(values)))
                .collect();
            (!map.is_empty()).then_some(map)
        };
        Event::ListUpdate {
            fqid,
            add: to_map(add.into_iter().collect()),
            remove: to_map(remove.into_iter().collect()),
        }
    }

    /// Builds a `Delete` event.
    pub fn delete(fqid: Fqid) -> Self {
        Event::Delete { fqid }
    }

    /// Builds a `Restore` event.
    pub fn restore(fqid: Fqid) -> Self {
        Event::Restore { fqid }
    }

    /// The model this event mutates.
    pub fn fqid(&self) -> &Fqid {
        match self {
            Event::Create { fqid, .. }
            | Event::Update { fqid, .. }
            | Event::DeleteFields { fqid, .. }
            | Event::ListUpdate { fqid, .. }
            | Event::Delete { fqid }
            | Event::Restore { fqid } => fqid,
        }
    }

    /// The collection of the mutated model.
    pub fn collection(&self) -> &str {
        self.fqid().collection()
    }

    /// The discriminator.
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Create { .. } => EventKind::Create,
            Event::Update { .. } => EventKind::Update,
            Event::DeleteFields { .. } => EventKind::DeleteFields,
            Event::ListUpdate { .. } => EventKind::ListUpdate,
            Event::Delete { .. } => EventKind::Delete,
            Event::Restore { .. } => EventKind::Restore,
        }
    }

    /// Names of every field the event touches, in payload order.
    pub fn field_names(&self) -> Vec<&str> {
        match self {
            Event::Create { fields, .. } | Event::Update { fields, .. } => {
                fields.keys().map(String::as_str).collect()
            }
            Event::DeleteFields { fields, .. } => fields.iter().map(String::as_str).collect(),
            Event::ListUpdate { add, remove, .. } => {
                let mut names: Vec<&str> = lists(add).map(|(name, _)| name.as_str()).collect();
                for (name, _) in lists(remove) {
                    if !names.contains(&name.as_str()) {
                        names.push(name);
                    }
                }
                names
            }
            Event::Delete { .. } | Event::Restore { .. } => Vec::new(),
        }
    }

    /// `true` when the event carries field data but none is left.
    ///
    /// `Create`, `Delete` and `Restore` are never empty: they change the model lifecycle on their
    /// own.
    pub fn is_empty(&self) -> bool {
        match self {
            Event::Update { fields, .. } => fields.is_empty(),
            Event::DeleteFields { fields, .. } => fields.is_empty(),
            Event::ListUpdate { add, remove, .. } => {
                lists(add).next().is_none() && lists(remove).next().is_none()
            }
            Event::Create { .. } | Event::Delete { .. } | Event::Restore { .. } => false,
        }
    }

    /// Removes the named fields from whatever payload the event carries.
    ///
    /// Returns `true` when something was removed.
    pub fn remove_fields(&mut self, names: &[&str]) -> bool {
        match self {
            Event::Create { fields, .. } | Event::Update { fields, .. } => {
                let before = fields.len();
                fields.retain(|key, _| !names.contains(&key.as_str()));
                before != fields.len()
            }
            Event::DeleteFields { fields, .. } => {
                let before = fields.len();
                fields.retain(|key| !names.contains(&key.as_str()));
                before != fields.len()
            }
            Event::ListUpdate { add, remove, .. } => {
                let added = retain_lists(add, names);
                let removed = retain_lists(remove, names);
                added || removed
            }
            Event::Delete { .. } | Event::Restore { .. } => false,
        }
    }

    /// Renames `old` to `new` in whatever payload the event carries.
    ///
    /// `transform` is applied to renamed values of `Create` and `Update` payloads. A renamed
    /// `Create` value that is (or becomes) `null` is dropped, since a create never stores null.
    /// When both names are present in one payload the `new` entry wins and `old` is dropped.
    ///
    /// Returns `true` when the event changed.
    pub fn rename_field(
        &mut self,
        old: &str,
        new: &str,
        transform: Option<&dyn Fn(Value) -> Value>,
    ) -> bool {
        match self {
            Event::Create { fields, .. } => rename_in_map(fields, old, new, transform, true),
            Event::Update { fields, .. } => rename_in_map(fields, old, new, transform, false),
            Event::DeleteFields { fields, .. } => {
                if !fields.iter().any(|f| f == old) {
                    return false;
                }
                let has_new = fields.iter().any(|f| f == new);
                let mut renamed = Vec::with_capacity(fields.len());
                for field in fields.drain(..) {
                    if field == old {
                        if !has_new {
                            renamed.push(new.to_string());
                        }
                    } else {
                        renamed.push(field);
                    }
                }
                *fields = renamed;
                true
            }
            Event::ListUpdate { add, remove, .. } => {
                let added = add
                    .as_mut()
                    .is_some_and(|add| rename_in_map(add, old, new, None, false));
                let removed = remove
                    .as_mut()
                    .is_some_and(|remove| rename_in_map(remove, old, new, None, false));
                added || removed
            }
            Event::Delete { .. } | Event::Restore { .. } => false,
        }
    }

    /// Decodes the wire form.
    pub fn from_value(value: Value) -> Result<Self, CodecError> {
        let raw: RawEvent =
            serde_json::from_value(value).map_err(|e| CodecError::malformed(e.to_string()))?;
        Event::try_from(raw)
    }

    /// Encodes the wire form.
    pub fn to_value(&self) -> Value {
        let raw = RawEvent::from(self.clone());
        // RawEvent only holds strings and JSON values, encoding it cannot fail.
        serde_json::to_value(raw).unwrap_or(Value::Null)
    }
}

/// Drops `names` from one side of a list update. A side emptied here disappears.
fn retain_lists(side: &mut Option<ListFields>, names: &[&str]) -> bool {
    let Some(map) = side else {
        return false;
    };
    let before = map.len();
    map.retain(|key, _| !names.contains(&key.as_str()));
    if map.len() == before {
        return false;
    }
    if map.is_empty() {
        *side = None;
    }
    true
}

fn rename_in_map(
    fields: &mut Map<String, Value>,
    old: &str,
    new: &str,
    transform: Option<&dyn Fn(Value) -> Value>,
    drop_null: bool,
) -> bool {
    if !fields.contains_key(old) {
        return false;
    }
    let has_new = fields.contains_key(new);
    let mut renamed = Map::with_capacity(fields.len());
    for (key, value) in std::mem::take(fields) {
        if key != old {
            renamed.insert(key, value);
            continue;
        }
        if has_new {
            continue;
        }
        let value = match transform {
            Some(transform) => transform(value),
            None => value,
        };
        if drop_null && value.is_null() {
            continue;
        }
        renamed.insert(new.to_string(), value);
    }
    *fields = renamed;
    true
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.fqid())
    }
}

/// The persisted shape of an event, before per-type validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    fqid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fields: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    list_fields: Option<RawListFields>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawListFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    add: Option<ListFields>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    remove: Option<ListFields>,
}

impl From<Event> for RawEvent {
    fn from(event: Event) -> Self {
        let kind = event.kind().as_str().to_string();
        let fqid = event.fqid().to_string();
        let (fields, list_fields) = match event {
            Event::Create { fields, .. } | Event::Update { fields, .. } => {
                (Some(Value::Object(fields)), None)
            }
            Event::DeleteFields { fields, .. } => (
                Some(Value::Array(fields.into_iter().map(Value::String).collect())),
                None,
            ),
            Event::ListUpdate { add, remove, .. } => (
                None,
                Some(RawListFields { add, remove }),
            ),
            Event::Delete { .. } | Event::Restore { .. } => (None, None),
        };
        RawEvent {
            kind,
            fqid,
            fields,
            list_fields,
        }
    }
}

fn check_list_values(side: &Option<ListFields>, key: &str) -> Result<(), CodecError> {
    match lists(side).find(|(_, values)| !values.is_array()) {
        Some((field, _)) => Err(CodecError::malformed(format!(
            "list_fields.{key}.{field} must be a list"
        ))),
        None => Ok(()),
    }
}

impl TryFrom<RawEvent> for Event {
    type Error = CodecError;

    fn try_from(raw: RawEvent) -> Result<Self, Self::Error> {
        let kind = EventKind::parse(&raw.kind)
            .ok_or_else(|| CodecError::malformed(format!("unknown event type {:?}", raw.kind)))?;
        let fqid: Fqid = raw.fqid.parse()?;
        let unexpected = |key: &str| CodecError::malformed(format!("{kind} event must not carry {key}"));

        match kind {
            EventKind::Create | EventKind::Update => {
                if raw.list_fields.is_some() {
                    return Err(unexpected("list_fields"));
                }
                let fields = match raw.fields {
                    Some(Value::Object(fields)) => fields,
                    Some(_) => return Err(CodecError::malformed("fields must be an object")),
                    None => return Err(CodecError::malformed(format!("{kind} event needs fields"))),
                };
                Ok(if kind == EventKind::Create {
                    Event::Create { fqid, fields }
                } else {
                    Event::Update { fqid, fields }
                })
            }
            EventKind::DeleteFields => {
                if raw.list_fields.is_some() {
                    return Err(unexpected("list_fields"));
                }
                let names = match raw.fields {
                    Some(Value::Array(names)) => names,
                    Some(_) => return Err(CodecError::malformed("fields must be a list")),
                    None => return Err(CodecError::malformed("deletefields event needs fields")),
                };
                let fields = names
                    .into_iter()
                    .map(|name| match name {
                        Value::String(name) => Ok(name),
                        other => Err(CodecError::malformed(format!(
                            "field name must be a string, got {other}"
                        ))),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Event::DeleteFields { fqid, fields })
            }
            EventKind::ListUpdate => {
                if raw.fields.is_some() {
                    return Err(unexpected("fields"));
                }
                let list_fields = raw
                    .list_fields
                    .ok_or_else(|| CodecError::malformed("listfields event needs list_fields"))?;
                check_list_values(&list_fields.add, "add")?;
                check_list_values(&list_fields.remove, "remove")?;
                Ok(Event::ListUpdate {
                    fqid,
                    add: list_fields.add,
                    remove: list_fields.remove,
                })
            }
            EventKind::Delete | EventKind::Restore => {
                if raw.fields.is_some() {
                    return Err(unexpected("fields"));
                }
                if raw.list_fields.is_some() {
                    return Err(unexpected("list_fields"));
                }
                Ok(if kind == EventKind::Delete {
                    Event::Delete { fqid }
                } else {
                    Event::Restore { fqid }
                })
            }
        }
    }
}

/// Builds a [`Fields`] map from `key => value` pairs.
///
/// ```
/// use evolve_core::fields;
/// let f = fields! { "title" => "Agenda", "weight" => 3 };
/// assert_eq!(f["weight"], 3);
/// ```
#[macro_export]
macro_rules! fields {
    () => { $crate::event::Fields::new() };
    ($($key:expr => $value:tt),+ $(,)?) => {{
        let mut map = $crate::event::Fields::new();
        $( map.insert(::std::string::String::from($key), ::serde_json::json!($value)); )+
        map
    }};
}
