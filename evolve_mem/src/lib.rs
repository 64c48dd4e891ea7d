//! # Evolve memory store
//!
//! In-memory implementation of evolve's [`LogStoreBackend`](evolve_core::log_store::LogStoreBackend),
//! used by tests and by the CLI when it migrates a log file.
//!
//! ```ignore
//! use evolve_core::prelude::*;
//! use evolve_mem::InMemoryLogStore;
//!
//! let store = InMemoryLogStore::with_positions(positions);
//! let engine = MigrationEngine::new(store.clone(), registry);
//! engine.finalize().await?;
//! let migrated = store.positions().await;
//! ```

#![deny(missing_docs)]

mod log_store;

pub use log_store::*;
