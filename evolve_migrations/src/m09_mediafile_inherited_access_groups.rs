//! MI 9: recompute the inherited access of the mediafile tree.
//!
//! Every mediafile inherits the intersection of its own `access_group_ids` with what its parent
//! directory grants. A mediafile without groups under a public parent (or at the root) is public.
//! The tree is held as an arena keyed by id with parent and child adjacency and walked
//! depth-first with an explicit stack.

use evolve_core::fields;
use evolve_core::prelude::*;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// The migration index this migration raises the log to.
pub const TARGET: i32 = 9;

/// See the module documentation.
pub fn migration() -> Migration {
    Migration::model(MediafileInheritedAccessGroups)
}

/// Model migration behind [`migration`].
#[derive(Debug, Default)]
pub struct MediafileInheritedAccessGroups;

#[derive(Debug)]
struct Node {
    parent: Option<u64>,
    is_directory: bool,
    access_group_ids: Vec<i64>,
    is_public: Option<bool>,
    inherited_access_group_ids: Option<Vec<i64>>,
}

fn ids(value: Option<&Value>) -> Vec<i64> {
    value
        .and_then(Value::as_array)
        .map(|values| values.iter().filter_map(Value::as_i64).collect())
        .unwrap_or_default()
}

/// Access of one mediafile given what its parent grants. `parent` is `None` at the root.
fn inherit(access_group_ids: &[i64], parent: Option<(bool, &[i64])>) -> (bool, Vec<i64>) {
    let parent_groups = parent.map(|(_, groups)| groups).unwrap_or_default();
    if !parent_groups.is_empty() && !access_group_ids.is_empty() {
        let groups = access_group_ids
            .iter()
            .copied()
            .filter(|id| parent_groups.contains(id))
            .collect();
        (false, groups)
    } else if !access_group_ids.is_empty() {
        (false, access_group_ids.to_vec())
    } else if !parent_groups.is_empty() {
        (false, parent_groups.to_vec())
    } else {
        (parent.is_none_or(|(public, _)| public), Vec::new())
    }
}

fn mediafile(id: u64) -> Result<Fqid, MigrationError> {
    Fqid::new("mediafile", id).map_err(|e| MigrationError::Codec(e.into()))
}

struct Arena {
    nodes: BTreeMap<u64, Node>,
    children: BTreeMap<u64, Vec<u64>>,
}

impl Arena {
    fn load(reader: &dyn MigrationReader) -> Result<Self, MigrationError> {
        let models = reader.get_all(
            "mediafile",
            Some(&[
                "parent_id",
                "is_directory",
                "access_group_ids",
                "is_public",
                "inherited_access_group_ids",
            ][..]),
        );
        let nodes: BTreeMap<u64, Node> = models
            .iter()
            .map(|(id, model)| {
                let node = Node {
                    parent: model.get("parent_id").and_then(Value::as_u64),
                    is_directory: model
                        .get("is_directory")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                    access_group_ids: ids(model.get("access_group_ids")),
                    is_public: model.get("is_public").and_then(Value::as_bool),
                    inherited_access_group_ids: model
                        .get("inherited_access_group_ids")
                        .map(|v| ids(Some(v))),
                };
                (*id, node)
            })
            .collect();

        let mut children: BTreeMap<u64, Vec<u64>> = BTreeMap::new();
        for (id, node) in &nodes {
            let Some(parent_id) = node.parent else {
                continue;
            };
            let Some(parent) = nodes.get(&parent_id) else {
                return Err(MigrationError::ModelDoesNotExist(mediafile(parent_id)?));
            };
            if !parent.is_directory {
                return Err(MigrationError::assertion(
                    &mediafile(parent_id)?,
                    format!("parent of mediafile/{id} is not a directory"),
                ));
            }
            children.entry(parent_id).or_default().push(*id);
        }
        Ok(Self { nodes, children })
    }

    /// Walks every tree from its root and returns the nodes whose stored access differs.
    fn recompute(&self) -> Result<BTreeMap<u64, (bool, Vec<i64>)>, MigrationError> {
        let mut changed = BTreeMap::new();
        let mut visited = BTreeSet::new();
        let mut computed: BTreeMap<u64, (bool, Vec<i64>)> = BTreeMap::new();
        let mut stack: Vec<u64> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.parent.is_none())
            .map(|(id, _)| *id)
            .rev()
            .collect();

        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            let parent = node
                .parent
                .and_then(|p| computed.get(&p))
                .map(|(public, groups)| (*public, groups.as_slice()));
            let access = inherit(&node.access_group_ids, parent);
            if node.is_public != Some(access.0)
                || node.inherited_access_group_ids.as_deref() != Some(access.1.as_slice())
            {
                changed.insert(id, access.clone());
            }
            computed.insert(id, access);
            if let Some(children) = self.children.get(&id) {
                stack.extend(children.iter().rev());
            }
        }

        if let Some(orphan) = self.nodes.keys().find(|id| !visited.contains(*id)) {
            return Err(MigrationError::assertion(
                &mediafile(*orphan)?,
                "parent chain does not end in a root",
            ));
        }
        Ok(changed)
    }
}

impl ModelMigration for MediafileInheritedAccessGroups {
    fn target_migration_index(&self) -> i32 {
        TARGET
    }

    fn name(&self) -> &'static str {
        "mediafile_inherited_access_groups"
    }

    fn migrate_models(
        &mut self,
        reader: &dyn MigrationReader,
    ) -> Result<Option<Vec<RequestEvent>>, MigrationError> {
        let arena = Arena::load(reader)?;
        let changed = arena.recompute()?;
        log::debug!(
            "{} of {} mediafiles change their inherited access",
            changed.len(),
            arena.nodes.len()
        );
        changed
            .into_iter()
            .map(|(id, (is_public, groups))| -> Result<RequestEvent, MigrationError> {
                Ok(RequestEvent::update(
                    mediafile(id)?,
                    fields! {
                        "is_public" => is_public,
                        "inherited_access_group_ids" => groups,
                    },
                ))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }
}
