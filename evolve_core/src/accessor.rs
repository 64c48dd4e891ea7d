//! Read accessors handed to migrations.

use crate::error::MigrationError;
use crate::fqid::Fqid;
use crate::model::{Model, ModelStore};
use std::collections::BTreeMap;

/// Read-only view of materialized models at the current replay point.
///
/// Migrations receive two of these: `old` over the log as it entered the migration and `new`
/// over everything the migration emitted so far.
pub trait MigrationReader {
    /// The live model; fails with `ModelDoesNotExist` when absent or deleted.
    fn get_model(&self, fqid: &Fqid) -> Result<Model, MigrationError>;

    /// The model including soft-deleted ones, with its deleted flag.
    fn get_model_ignore_deleted(&self, fqid: &Fqid) -> Result<(Model, bool), MigrationError>;

    /// `true` for live models.
    fn model_exists(&self, fqid: &Fqid) -> bool;

    /// Live ids of `collection`, ascending.
    fn get_all_ids_for_collection(&self, collection: &str) -> Vec<u64>;

    /// Ids of `collection` including soft-deleted ones, ascending.
    fn get_all_ids_for_collection_ignore_deleted(&self, collection: &str) -> Vec<u64>;

    /// Live models of `collection` keyed by id, restricted to `fields` when given.
    fn get_all(&self, collection: &str, fields: Option<&[&str]>) -> BTreeMap<u64, Model>;

    /// Set when the run is a preview on an in-memory log rather than a run that stages to disk.
    fn is_in_memory_migration(&self) -> bool;
}

/// [`MigrationReader`] over a [`ModelStore`].
#[derive(Debug, Clone, Copy)]
pub struct Accessor<'a> {
    store: &'a ModelStore,
    in_memory: bool,
}

impl<'a> Accessor<'a> {
    /// Wraps `store`.
    pub fn new(store: &'a ModelStore, in_memory: bool) -> Self {
        Self { store, in_memory }
    }
}

impl MigrationReader for Accessor<'_> {
    fn get_model(&self, fqid: &Fqid) -> Result<Model, MigrationError> {
        self.store
            .live(fqid)
            .cloned()
            .ok_or_else(|| MigrationError::ModelDoesNotExist(fqid.clone()))
    }

    fn get_model_ignore_deleted(&self, fqid: &Fqid) -> Result<(Model, bool), MigrationError> {
        self.store
            .get(fqid)
            .map(|model| (model.clone(), model.meta_deleted))
            .ok_or_else(|| MigrationError::ModelDoesNotExist(fqid.clone()))
    }

    fn model_exists(&self, fqid: &Fqid) -> bool {
        self.store.live(fqid).is_some()
    }

    fn get_all_ids_for_collection(&self, collection: &str) -> Vec<u64> {
        self.store.live_ids(collection)
    }

    fn get_all_ids_for_collection_ignore_deleted(&self, collection: &str) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .store
            .iter()
            .filter(|(fqid, _)| fqid.collection() == collection)
            .map(|(fqid, _)| fqid.id())
            .collect();
        ids.sort_unstable();
        ids
    }

    fn get_all(&self, collection: &str, fields: Option<&[&str]>) -> BTreeMap<u64, Model> {
        self.store
            .live_ids(collection)
            .into_iter()
            .filter_map(|id| {
                let fqid = Fqid::new(collection, id).ok()?;
                let model = self.store.live(&fqid)?;
                Some((
                    id,
                    match fields {
                        Some(fields) => model.project(fields),
                        None => model.clone(),
                    },
                ))
            })
            .collect()
    }

    fn is_in_memory_migration(&self) -> bool {
        self.in_memory
    }
}
