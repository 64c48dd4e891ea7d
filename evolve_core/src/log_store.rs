//! This module defines the `LogStoreBackend` trait, the storage interface the migration engine
//! runs against. A backend holds the live position log, a staging area for the rewritten log,
//! the derived tables rebuilt on finalization, and an exclusive migration lock.

use crate::model::DerivedTables;
use crate::position::Position;
use async_trait::async_trait;
use futures_core::Stream;
use std::pin::Pin;

/// A stream of positions in ascending order.
pub trait PositionStream:
    Stream<Item = Result<Position, Box<dyn std::error::Error + Send + Sync>>> + Send
{
}

impl<T> PositionStream for T where
    T: Stream<Item = Result<Position, Box<dyn std::error::Error + Send + Sync>>> + Send
{
}

/// Where a backend is in the staging protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StagingPhase {
    /// Nothing staged.
    #[default]
    Idle,
    /// A rewritten log up to `target_mi` sits in staging.
    Staged {
        /// The migration index of the staged positions.
        target_mi: i32,
    },
    /// Staging was swapped into the live log; derived tables are not rebuilt yet.
    Swapped {
        /// The migration index of the now live positions.
        target_mi: i32,
    },
}

impl std::fmt::Display for StagingPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StagingPhase::Idle => write!(f, "idle"),
            StagingPhase::Staged { target_mi } => write!(f, "staged (migration index {target_mi})"),
            StagingPhase::Swapped { target_mi } => {
                write!(f, "swapped (migration index {target_mi})")
            }
        }
    }
}

/// A trait that defines the behavior of a position log storage backend.
#[async_trait]
pub trait LogStoreBackend: Send + Sync {
    /// The error when a storage operation fails
    type Error: std::error::Error + Send + Sync + 'static;

    /// Takes the exclusive migration lock. Fails when someone else holds it.
    async fn acquire_lock(&self) -> Result<(), Self::Error>;

    /// Releases the migration lock.
    async fn release_lock(&self) -> Result<(), Self::Error>;

    /// Streams the live log in ascending position order.
    async fn read_positions(
        &self,
    ) -> Result<Pin<Box<dyn PositionStream + Send + 'life0>>, Self::Error>;

    /// The current staging phase.
    async fn staging_phase(&self) -> Result<StagingPhase, Self::Error>;

    /// Replaces the staging area with `positions`, the log after the step to `target_mi`, in one
    /// transaction.
    async fn write_staging(
        &self,
        positions: &[Position],
        target_mi: i32,
    ) -> Result<(), Self::Error>;

    /// Drops whatever is staged. A `Staged` phase returns to `Idle`, a `Swapped` one is kept so
    /// that finalize can resume.
    async fn discard_staging(&self) -> Result<(), Self::Error>;

    /// Makes the staged log the live log and moves to [`StagingPhase::Swapped`].
    async fn swap_in_staging(&self) -> Result<(), Self::Error>;

    /// Replaces the derived tables.
    async fn rebuild_derived(&self, derived: &DerivedTables) -> Result<(), Self::Error>;

    /// Clears the staging bookkeeping after a completed finalize.
    async fn clear_staging(&self) -> Result<(), Self::Error>;
}
