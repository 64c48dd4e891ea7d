//! MI 2: `motion_state.dont_set_identifier` is gone.

use evolve_core::prelude::*;

/// The migration index this migration raises the log to.
pub const TARGET: i32 = 2;

/// Drops `motion_state.dont_set_identifier` from every event.
pub fn migration() -> Migration {
    Migration::event(RemoveFieldsMigration::single(
        TARGET,
        "remove_motion_state_dont_set_identifier",
        "motion_state",
        "dont_set_identifier",
    ))
}
