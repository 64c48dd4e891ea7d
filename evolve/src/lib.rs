//! # Evolve
//!
//! Event migration engine for an append-only log of model mutations. This crate bundles the
//! engine, the migration chain and the storage backends enabled through features, and ships the
//! `evolve` command line tool.

#![deny(missing_docs)]

/// The migration chain of the meeting management schema.
pub mod migrations {
    //! Re-exports the `evolve_migrations` crate.
    pub use evolve_migrations::*;
}

#[cfg(feature = "in-memory")]
/// The in-memory log store.
pub mod mem {
    //! Re-exports the `evolve_mem` crate.
    pub use evolve_mem::*;
}

#[cfg(feature = "postgres")]
/// The Postgres log store.
pub mod pg {
    //! Re-exports the `evolve_pg` crate.
    pub use evolve_pg::*;
}

pub mod prelude {
    //! The prelude module for the `evolve` crate.
    pub use evolve_core::prelude::*;

    #[cfg(feature = "in-memory")]
    pub use super::mem::InMemoryLogStore;
    #[cfg(feature = "postgres")]
    pub use super::pg::{PgLogStore, PgLogStoreError};
}
