//! MI 4: a committee can have several template meetings.

use evolve_core::prelude::*;
use serde_json::Value;

/// The migration index this migration raises the log to.
pub const TARGET: i32 = 4;

/// Renames `committee.template_meeting_id` to `template_meeting_ids`, wrapping the id in a list.
pub fn migration() -> Migration {
    Migration::event(
        RenameFieldMigration::new(
            TARGET,
            "rename_committee_template_meeting_id",
            "committee",
            "template_meeting_id",
            "template_meeting_ids",
        )
        .with_transform(into_list),
    )
}

fn into_list(value: Value) -> Value {
    match value {
        Value::Null => Value::Null,
        list @ Value::Array(_) => list,
        id => Value::Array(vec![id]),
    }
}
