//! MI 10: genders become models of the organization.
//!
//! Every distinct `user.gender` string becomes a `gender` model (reusing an existing one with the
//! same name). Users point at it through `gender_id` and lose the string, the organization lists
//! the new genders in `gender_ids`. Previews skip the migration since it allocates ids.

use crate::ONE_ORGANIZATION_ID;
use evolve_core::fields;
use evolve_core::prelude::*;
use serde_json::{Value, json};
use std::collections::BTreeMap;

/// The migration index this migration raises the log to.
pub const TARGET: i32 = 10;

/// See the module documentation.
pub fn migration() -> Migration {
    Migration::model(AddOrganizationGenders)
}

/// Model migration behind [`migration`].
#[derive(Debug, Default)]
pub struct AddOrganizationGenders;

fn fqid(collection: &str, id: u64) -> Result<Fqid, MigrationError> {
    Fqid::new(collection, id).map_err(|e| MigrationError::Codec(e.into()))
}

/// A gender and the users moving to it.
struct Gender {
    id: u64,
    created: bool,
    user_ids: Vec<u64>,
}

impl ModelMigration for AddOrganizationGenders {
    fn target_migration_index(&self) -> i32 {
        TARGET
    }

    fn name(&self) -> &'static str {
        "add_organization_genders"
    }

    fn migrate_models(
        &mut self,
        reader: &dyn MigrationReader,
    ) -> Result<Option<Vec<RequestEvent>>, MigrationError> {
        if reader.is_in_memory_migration() {
            log::info!("Skipping {} in an in-memory run", self.name());
            return Ok(None);
        }

        let mut genders: BTreeMap<String, Gender> = reader
            .get_all("gender", Some(&["name"][..]))
            .into_iter()
            .filter_map(|(id, model)| {
                let name = model.get_str("name")?.to_string();
                Some((
                    name,
                    Gender {
                        id,
                        created: false,
                        user_ids: Vec::new(),
                    },
                ))
            })
            .collect();
        // Deleted genders keep their ids.
        let mut next_id = reader
            .get_all_ids_for_collection_ignore_deleted("gender")
            .last()
            .copied()
            .unwrap_or(0);

        let mut users = Vec::new();
        for (user_id, user) in reader.get_all("user", Some(&["gender"][..])) {
            let Some(name) = user.get_str("gender").filter(|name| !name.is_empty()) else {
                continue;
            };
            let gender = genders.entry(name.to_string()).or_insert_with(|| {
                next_id += 1;
                Gender {
                    id: next_id,
                    created: true,
                    user_ids: Vec::new(),
                }
            });
            gender.user_ids.push(user_id);
            users.push((user_id, gender.id));
        }
        if users.is_empty() {
            return Ok(None);
        }

        let organization = fqid("organization", ONE_ORGANIZATION_ID)?;
        let has_organization = reader.model_exists(&organization);
        let mut requests = Vec::new();
        let mut created = Vec::new();
        let mut ordered: Vec<_> = genders.iter().collect();
        ordered.sort_by_key(|(_, gender)| gender.id);
        for (name, gender) in ordered {
            if gender.created {
                let mut fields = fields! {
                    "id" => (gender.id),
                    "name" => name,
                    "user_ids" => (gender.user_ids),
                };
                if has_organization {
                    fields.insert("organization_id".to_string(), json!(ONE_ORGANIZATION_ID));
                }
                requests.push(RequestEvent::Create {
                    fqid: fqid("gender", gender.id)?,
                    fields,
                });
                created.push(json!(gender.id));
            } else if !gender.user_ids.is_empty() {
                let mut list_add = ListFields::new();
                list_add.insert("user_ids".to_string(), json!(gender.user_ids));
                requests.push(RequestEvent::Update {
                    fqid: fqid("gender", gender.id)?,
                    fields: Fields::new(),
                    list_add,
                    list_remove: ListFields::new(),
                });
            }
        }
        for (user_id, gender_id) in users {
            requests.push(RequestEvent::update(
                fqid("user", user_id)?,
                fields! {"gender_id" => gender_id, "gender" => null},
            ));
        }
        if has_organization && !created.is_empty() {
            let mut list_add = ListFields::new();
            list_add.insert("gender_ids".to_string(), Value::Array(created));
            requests.push(RequestEvent::Update {
                fqid: organization,
                fields: Fields::new(),
                list_add,
                list_remove: ListFields::new(),
            });
        }
        log::debug!("{} gender requests", requests.len());
        Ok(Some(requests))
    }
}
