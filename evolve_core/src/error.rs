//! Error taxonomy of the migration engine.
//!
//! Errors are layered the same way the engine is: codec and projection failures are raised by the
//! data model, [`MigrationError`] is what a migration returns, [`RegistryError`] guards the chain,
//! and [`EngineError`] is the run-level error that carries the position context and maps onto the
//! CLI exit codes.

use crate::fqid::{BadFqid, Fqid};
use std::fmt;

/// Failure decoding the persisted wire form of an event or position.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    /// Unknown event type, missing or unexpected key, or wrongly typed payload.
    #[error("malformed event: {reason}")]
    Malformed {
        /// What was wrong with the record.
        reason: String,
    },
    /// The `fqid` key does not parse.
    #[error(transparent)]
    BadFqid(#[from] BadFqid),
}

impl CodecError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}

/// An event could not be applied to the materialized models.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProjectionError {
    /// The model is absent or soft-deleted.
    #[error("model {0} does not exist")]
    ModelDoesNotExist(Fqid),
    /// `Create` on a live model.
    #[error("model {0} already exists")]
    ModelExists(Fqid),
    /// `Restore` on a model that is not deleted.
    #[error("model {0} is not deleted")]
    ModelNotDeleted(Fqid),
    /// `ListUpdate` on a field whose current value is not a list.
    #[error("field {field} of {fqid} is not a list")]
    NotAList {
        /// The model.
        fqid: Fqid,
        /// The offending field.
        field: String,
    },
}

impl ProjectionError {
    /// The model the error refers to.
    pub fn fqid(&self) -> &Fqid {
        match self {
            Self::ModelDoesNotExist(fqid)
            | Self::ModelExists(fqid)
            | Self::ModelNotDeleted(fqid)
            | Self::NotAList { fqid, .. } => fqid,
        }
    }
}

/// Error raised from inside a migration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MigrationError {
    /// A required read through an accessor missed.
    #[error("model {0} does not exist")]
    ModelDoesNotExist(Fqid),
    /// The data violated an invariant the migration relies on.
    #[error("assertion failed for {fqid}: {message}")]
    AssertionFailure {
        /// The offending model.
        fqid: Fqid,
        /// What was expected.
        message: String,
    },
    /// An emitted event could not be applied.
    #[error(transparent)]
    Projection(#[from] ProjectionError),
    /// A value could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl MigrationError {
    /// Shorthand for [`MigrationError::AssertionFailure`].
    pub fn assertion(fqid: &Fqid, message: impl Into<String>) -> Self {
        Self::AssertionFailure {
            fqid: fqid.clone(),
            message: message.into(),
        }
    }

    /// The model the error refers to, if any.
    pub fn fqid(&self) -> Option<&Fqid> {
        match self {
            Self::ModelDoesNotExist(fqid) | Self::AssertionFailure { fqid, .. } => Some(fqid),
            Self::Projection(e) => Some(e.fqid()),
            Self::Codec(_) => None,
        }
    }
}

/// Errors of the migration registry and chain planning.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Two migrations registered for the same target index.
    #[error("duplicate migration for migration index {0}")]
    DuplicateMigration(i32),
    /// A target index between the stored and the maximal one has no migration.
    #[error("migration chain broken: no migration registered for migration index {missing}")]
    MigrationChainBroken {
        /// The first missing index.
        missing: i32,
    },
    /// The migration declares another index than the slot it was registered under.
    #[error("migration registered for index {key} declares target index {declared}")]
    IndexMismatch {
        /// The registry key.
        key: i32,
        /// What the migration reports.
        declared: i32,
    },
}

/// The run-level error. Any of these aborts the run and discards staging.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Registry or chain validation failed before anything was written.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A migration raised, or one of its events could not be applied.
    #[error(
        "migration to index {target_mi} failed at {}: {source}",
        MigrationLocation::new(.position, .source, .event_index)
    )]
    Migration {
        /// The target index of the failing migration.
        target_mi: i32,
        /// The position being replayed, if the failure happened during replay.
        position: Option<u64>,
        /// Index of the event within the position, if known.
        event_index: Option<usize>,
        /// The underlying failure.
        source: MigrationError,
    },

    /// A position carries an index newer than any registered migration.
    #[error("position {position} has migration index {found}, newer than the latest known index {max}")]
    MigrationIndexTooHigh {
        /// The offending position.
        position: u64,
        /// Its migration index.
        found: i32,
        /// The maximal registered target index.
        max: i32,
    },

    /// The storage backend failed.
    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A cancel signal was honoured between two positions.
    #[error("migration to index {target_mi} cancelled before position {position}")]
    Cancelled {
        /// The migration that was running.
        target_mi: i32,
        /// The next position that would have been replayed.
        position: u64,
    },
}

impl EngineError {
    /// Wraps a backend error.
    pub fn storage<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Storage(Box::new(err))
    }

    /// Exit code of the CLI for this error: `1` chain broken, `2` storage, `3` migration raised.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Registry(_) | Self::MigrationIndexTooHigh { .. } => 1,
            Self::Storage(_) => 2,
            Self::Migration { source, .. } => match source {
                MigrationError::Codec(_) => 2,
                _ => 3,
            },
            Self::Cancelled { .. } => 3,
        }
    }
}

struct MigrationLocation<'a> {
    position: Option<u64>,
    fqid: Option<&'a Fqid>,
    event_index: Option<usize>,
}

impl<'a> MigrationLocation<'a> {
    fn new(
        position: &Option<u64>,
        source: &'a MigrationError,
        event_index: &Option<usize>,
    ) -> Self {
        Self {
            position: *position,
            fqid: source.fqid(),
            event_index: *event_index,
        }
    }
}

impl fmt::Display for MigrationLocation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.position {
            Some(position) => write!(f, "position {position}")?,
            None => write!(f, "model migration")?,
        }
        if let Some(fqid) = self.fqid {
            write!(f, ", fqid {fqid}")?;
        }
        if let Some(index) = self.event_index {
            write!(f, ", event {index}")?;
        }
        Ok(())
    }
}
