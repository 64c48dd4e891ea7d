//! MI 5: meetings carry their CSV export settings.

use evolve_core::fields;
use evolve_core::prelude::*;

/// The migration index this migration raises the log to.
pub const TARGET: i32 = 5;

/// Fills the export and delegation defaults into meeting creates.
pub fn migration() -> Migration {
    Migration::event(AddFieldsMigration::new(
        TARGET,
        "add_meeting_export_defaults",
        "meeting",
        fields! {
            "export_csv_encoding" => "utf-8",
            "export_csv_separator" => ";",
            "users_enable_vote_delegations" => true,
        },
    ))
}
