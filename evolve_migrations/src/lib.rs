//! # Evolve migrations
//!
//! The migration chain of the meeting management schema. Each module raises the log by one
//! migration index; [`registry`] registers all of them.
//!
//! | index | migration |
//! |-------|-----------|
//! | 2 | drop `motion_state.dont_set_identifier` |
//! | 3 | number topics per meeting |
//! | 4 | `committee.template_meeting_id` becomes `template_meeting_ids` |
//! | 5 | meeting export defaults |
//! | 6 | archived meetings |
//! | 7 | `user.idp_id` |
//! | 8 | prune events that change nothing |
//! | 9 | inherited mediafile access |
//! | 10 | gender models |

#![deny(missing_docs)]

pub mod m02_remove_motion_state_dont_set_identifier;
pub mod m03_add_topic_sequential_numbers;
pub mod m04_rename_committee_template_meeting_id;
pub mod m05_add_meeting_export_defaults;
pub mod m06_add_archived_meeting_ids;
pub mod m07_add_user_idp_id;
pub mod m08_remove_unnecessary_events;
pub mod m09_mediafile_inherited_access_groups;
pub mod m10_add_organization_genders;

use evolve_core::prelude::*;

/// The id of the single organization model.
pub const ONE_ORGANIZATION_ID: u64 = 1;

/// The highest migration index of the chain.
pub const LATEST: i32 = m10_add_organization_genders::TARGET;

/// Every migration of the chain, in order.
pub const MIGRATIONS: &[fn() -> Migration] = &[
    m02_remove_motion_state_dont_set_identifier::migration,
    m03_add_topic_sequential_numbers::migration,
    m04_rename_committee_template_meeting_id::migration,
    m05_add_meeting_export_defaults::migration,
    m06_add_archived_meeting_ids::migration,
    m07_add_user_idp_id::migration,
    m08_remove_unnecessary_events::migration,
    m09_mediafile_inherited_access_groups::migration,
    m10_add_organization_genders::migration,
];

/// A registry holding the whole chain.
pub fn registry() -> Result<MigrationRegistry, RegistryError> {
    registry_up_to(LATEST)
}

/// A registry holding the chain up to and including migration index `max`.
pub fn registry_up_to(max: i32) -> Result<MigrationRegistry, RegistryError> {
    let mut registry = MigrationRegistry::new();
    for factory in MIGRATIONS {
        let factory = *factory;
        if factory().target_migration_index() <= max {
            registry.register(factory)?;
        }
    }
    log::debug!("Registered {} migrations", registry.len());
    Ok(registry)
}
