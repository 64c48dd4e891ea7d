//! MI 3: topics are numbered per meeting.

use evolve_core::prelude::*;

/// The migration index this migration raises the log to.
pub const TARGET: i32 = 3;

/// Writes `topic.sequential_number`, counting per `meeting_id` in creation order.
pub fn migration() -> Migration {
    Migration::event(SequentialNumbersMigration::new(
        TARGET,
        "add_topic_sequential_numbers",
        "topic",
        "sequential_number",
        "meeting_id",
    ))
}
