//! # Evolve
//!
//! Core of the event migration engine: the event model and its wire form, the model projection,
//! the read accessors handed to migrations, the migration traits and declarative primitives, the
//! registry, the storage backend trait and the [`MigrationEngine`](engine::MigrationEngine).

#![deny(missing_docs)]

pub mod accessor;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod fqid;
pub mod log_store;
pub mod migration;
pub mod model;
pub mod position;
pub mod primitives;
pub mod registry;

pub mod prelude {
    //! The prelude module for the `evolve_core` crate.
    pub use crate::accessor::{Accessor, MigrationReader};
    pub use crate::config::{CancelHandle, EngineConfig};
    pub use crate::engine::{MigrationEngine, MigrationOutcome, MigrationStatus};
    pub use crate::error::{
        CodecError, EngineError, MigrationError, ProjectionError, RegistryError,
    };
    pub use crate::event::{Event, EventKind, Fields, ListFields};
    pub use crate::fields;
    pub use crate::fqid::{BadFqid, Fqid};
    pub use crate::log_store::{LogStoreBackend, PositionStream, StagingPhase};
    pub use crate::migration::{
        EventMigration, Migration, MigrationContext, ModelMigration, RequestEvent,
    };
    pub use crate::model::{DerivedTables, Model, ModelStore};
    pub use crate::position::{
        BASELINE_MIGRATION_INDEX, Position, Timestamp, decode_log, encode_log,
    };
    pub use crate::primitives::{
        AddFieldsMigration, RemoveFieldsMigration, RenameFieldMigration,
        SequentialNumbersMigration, ValueTransform,
    };
    pub use crate::registry::{MigrationFactory, MigrationRegistry};
}
