//! MI 7: users get an identity provider id.
//!
//! `idp_id` is the username, suffixed with `_` and the SAML id when the user has one.

use evolve_core::prelude::*;
use serde_json::{Value, json};

/// The migration index this migration raises the log to.
pub const TARGET: i32 = 7;

/// See the module documentation.
pub fn migration() -> Migration {
    Migration::event(AddUserIdpId)
}

/// Event migration behind [`migration`].
#[derive(Debug, Default)]
pub struct AddUserIdpId;

fn idp_id(username: Option<&Value>, saml_id: Option<&Value>) -> Option<Value> {
    let username = username.and_then(Value::as_str)?;
    Some(match saml_id.and_then(Value::as_str) {
        Some(saml_id) => json!(format!("{username}_{saml_id}")),
        None => json!(username),
    })
}

impl EventMigration for AddUserIdpId {
    fn target_migration_index(&self) -> i32 {
        TARGET
    }

    fn name(&self) -> &'static str {
        "add_user_idp_id"
    }

    fn migrate_event(
        &mut self,
        event: &Event,
        ctx: &MigrationContext<'_>,
    ) -> Result<Option<Vec<Event>>, MigrationError> {
        if event.collection() != "user" {
            return Ok(None);
        }
        match event {
            Event::Create { fqid, fields } => {
                if fields.get("idp_id").is_some_and(|v| !v.is_null()) {
                    return Ok(None);
                }
                let Some(idp_id) = idp_id(fields.get("username"), fields.get("saml_id")) else {
                    return Ok(None);
                };
                let mut fields = fields.clone();
                fields.insert("idp_id".to_string(), idp_id);
                Ok(Some(vec![Event::create(fqid.clone(), fields)]))
            }
            Event::Update { fqid, fields }
                if fields.contains_key("username") || fields.contains_key("saml_id") =>
            {
                let current = ctx.new.get_model(fqid)?;
                let pick = |field: &str| match fields.get(field) {
                    Some(value) => Some(value),
                    None => current.get(field),
                };
                let idp_id = idp_id(pick("username"), pick("saml_id")).unwrap_or(Value::Null);
                if current.get("idp_id").unwrap_or(&Value::Null) == &idp_id {
                    return Ok(None);
                }
                let mut fields = fields.clone();
                fields.insert("idp_id".to_string(), idp_id);
                Ok(Some(vec![Event::update(fqid.clone(), fields)]))
            }
            Event::DeleteFields { fqid, fields }
                if fields.iter().any(|f| f == "username" || f == "saml_id") =>
            {
                let current = ctx.new.get_model(fqid)?;
                let pick = |field: &str| {
                    if fields.iter().any(|f| f == field) {
                        None
                    } else {
                        current.get(field)
                    }
                };
                let idp_id = idp_id(pick("username"), pick("saml_id")).unwrap_or(Value::Null);
                if current.get("idp_id").unwrap_or(&Value::Null) == &idp_id {
                    return Ok(None);
                }
                let mut update = Fields::new();
                update.insert("idp_id".to_string(), idp_id);
                Ok(Some(vec![event.clone(), Event::update(fqid.clone(), update)]))
            }
            _ => Ok(None),
        }
    }
}
