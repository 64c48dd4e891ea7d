//! Materialized models and the projection that builds them from events.

use crate::error::ProjectionError;
use crate::event::{Event, Fields, ListFields};
use crate::fqid::Fqid;
use crate::position::Position;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Key of the soft-delete flag in [`Model::to_value`].
pub const META_DELETED: &str = "meta_deleted";
/// Key of the last mutating position in [`Model::to_value`].
pub const META_POSITION: &str = "meta_position";

/// The materialized state of one FQID.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Model {
    /// Current fields. A field set to `null` is absent.
    pub fields: Fields,
    /// Whether the last lifecycle event was a `Delete`.
    pub meta_deleted: bool,
    /// The position of the last event touching this model.
    pub meta_position: u64,
}

impl Model {
    /// Reads a field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Reads an integer field.
    pub fn get_i64(&self, field: &str) -> Option<i64> {
        self.get(field).and_then(Value::as_i64)
    }

    /// Reads a string field.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    /// Reads a list field, `None` when absent or not a list.
    pub fn get_list(&self, field: &str) -> Option<&Vec<Value>> {
        self.get(field).and_then(Value::as_array)
    }

    /// The fields plus `meta_deleted` and `meta_position`.
    pub fn to_value(&self) -> Value {
        let mut map = self.fields.clone();
        map.insert(META_DELETED.to_string(), Value::Bool(self.meta_deleted));
        map.insert(META_POSITION.to_string(), Value::from(self.meta_position));
        Value::Object(map)
    }

    /// A copy restricted to `fields`; meta fields are kept.
    pub fn project(&self, fields: &[&str]) -> Model {
        Model {
            fields: self
                .fields
                .iter()
                .filter(|(key, _)| fields.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
            meta_deleted: self.meta_deleted,
            meta_position: self.meta_position,
        }
    }
}

/// Every model of a log, built by applying events in order.
///
/// Keeps a collection index of the live ids so that per-collection reads stay ordered and cheap.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelStore {
    models: BTreeMap<Fqid, Model>,
    live_ids: BTreeMap<String, BTreeSet<u64>>,
}

impl ModelStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replays `positions` from scratch.
    pub fn replay(positions: &[Position]) -> Result<Self, ProjectionError> {
        let mut store = Self::new();
        for position in positions {
            store.apply_position(position)?;
        }
        Ok(store)
    }

    /// Applies every event of `position` in order.
    pub fn apply_position(&mut self, position: &Position) -> Result<(), ProjectionError> {
        for event in &position.events {
            self.apply(event, position.position)?;
        }
        Ok(())
    }

    /// Applies one event written at `position`.
    pub fn apply(&mut self, event: &Event, position: u64) -> Result<(), ProjectionError> {
        match event {
            Event::Create { fqid, fields } => {
                if self.live(fqid).is_some() {
                    return Err(ProjectionError::ModelExists(fqid.clone()));
                }
                let fields = fields
                    .iter()
                    .filter(|(_, value)| !value.is_null())
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect();
                self.models.insert(
                    fqid.clone(),
                    Model {
                        fields,
                        meta_deleted: false,
                        meta_position: position,
                    },
                );
                self.index(fqid);
            }
            Event::Update { fqid, fields } => {
                let model = self.live_mut(fqid)?;
                for (key, value) in fields {
                    if value.is_null() {
                        model.fields.retain(|k, _| k != key);
                    } else {
                        model.fields.insert(key.clone(), value.clone());
                    }
                }
                model.meta_position = position;
            }
            Event::DeleteFields { fqid, fields } => {
                let model = self.live_mut(fqid)?;
                model.fields.retain(|key, _| !fields.contains(key));
                model.meta_position = position;
            }
            Event::ListUpdate { fqid, add, remove } => {
                let model = self.live_mut(fqid)?;
                let none = ListFields::new();
                apply_list_update(
                    fqid,
                    model,
                    add.as_ref().unwrap_or(&none),
                    remove.as_ref().unwrap_or(&none),
                )?;
                model.meta_position = position;
            }
            Event::Delete { fqid } => {
                let model = self.live_mut(fqid)?;
                model.meta_deleted = true;
                model.meta_position = position;
                self.unindex(fqid);
            }
            Event::Restore { fqid } => {
                let model = self
                    .models
                    .get_mut(fqid)
                    .ok_or_else(|| ProjectionError::ModelDoesNotExist(fqid.clone()))?;
                if !model.meta_deleted {
                    return Err(ProjectionError::ModelNotDeleted(fqid.clone()));
                }
                model.meta_deleted = false;
                model.meta_position = position;
                self.index(fqid);
            }
        }
        Ok(())
    }

    /// The live model, `None` if absent or deleted.
    pub fn live(&self, fqid: &Fqid) -> Option<&Model> {
        self.models.get(fqid).filter(|m| !m.meta_deleted)
    }

    /// The model including soft-deleted ones.
    pub fn get(&self, fqid: &Fqid) -> Option<&Model> {
        self.models.get(fqid)
    }

    /// Live ids of `collection`, ascending.
    pub fn live_ids(&self, collection: &str) -> Vec<u64> {
        self.live_ids
            .get(collection)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Every model, including soft-deleted ones, ordered by FQID.
    pub fn iter(&self) -> impl Iterator<Item = (&Fqid, &Model)> {
        self.models.iter()
    }

    /// Number of models, including soft-deleted ones.
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// `true` when no model was ever created.
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    fn live_mut(&mut self, fqid: &Fqid) -> Result<&mut Model, ProjectionError> {
        self.models
            .get_mut(fqid)
            .filter(|m| !m.meta_deleted)
            .ok_or_else(|| ProjectionError::ModelDoesNotExist(fqid.clone()))
    }

    fn index(&mut self, fqid: &Fqid) {
        self.live_ids
            .entry(fqid.collection().to_string())
            .or_default()
            .insert(fqid.id());
    }

    fn unindex(&mut self, fqid: &Fqid) {
        if let Some(ids) = self.live_ids.get_mut(fqid.collection()) {
            ids.remove(&fqid.id());
        }
    }
}

fn apply_list_update(
    fqid: &Fqid,
    model: &mut Model,
    add: &ListFields,
    remove: &ListFields,
) -> Result<(), ProjectionError> {
    let mut touched: Vec<&String> = add.keys().collect();
    touched.extend(remove.keys().filter(|k| !add.contains_key(*k)));

    for field in touched {
        let mut current = match model.fields.get(field) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(values)) => values.clone(),
            Some(_) => {
                return Err(ProjectionError::NotAList {
                    fqid: fqid.clone(),
                    field: field.clone(),
                });
            }
        };
        if let Some(Value::Array(values)) = add.get(field) {
            for value in values {
                if !current.contains(value) {
                    current.push(value.clone());
                }
            }
        }
        if let Some(Value::Array(values)) = remove.get(field) {
            current.retain(|value| !values.contains(value));
        }
        model.fields.insert(field.clone(), Value::Array(current));
    }
    Ok(())
}

/// The derived tables rebuilt by finalization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DerivedTables {
    /// Every model (soft-deleted ones included) of the live log.
    pub models: ModelStore,
    /// `collection/field` to the last position whose event touched it.
    pub collection_fields: BTreeMap<String, u64>,
}

impl DerivedTables {
    /// Builds the derived tables of `positions`.
    pub fn build(positions: &[Position]) -> Result<Self, ProjectionError> {
        let models = ModelStore::replay(positions)?;
        let mut collection_fields = BTreeMap::new();
        for position in positions {
            for event in &position.events {
                for field in event.field_names() {
                    collection_fields.insert(
                        format!("{}/{}", event.collection(), field),
                        position.position,
                    );
                }
            }
        }
        Ok(Self {
            models,
            collection_fields,
        })
    }
}
