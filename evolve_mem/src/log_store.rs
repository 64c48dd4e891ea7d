use async_trait::async_trait;
use futures_core::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{Mutex, OwnedMutexGuard};

use evolve_core::prelude::*;

/// A storage operation that can be made to fail once, for exercising abort paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    /// The next `write_staging`.
    WriteStaging,
    /// The next `swap_in_staging`.
    Swap,
    /// The next `rebuild_derived`.
    Rebuild,
}

/// The in-memory data store.
#[derive(Debug, Default)]
struct LogData {
    live: Vec<Position>,
    staged: Option<Vec<Position>>,
    phase: StagingPhase,
    derived: DerivedTables,
    fail_next: Option<FailPoint>,
}

impl LogData {
    fn injected(&mut self, point: FailPoint) -> Result<(), InMemoryLogStoreError> {
        if self.fail_next == Some(point) {
            self.fail_next = None;
            log::debug!("Injected failure at {point:?}");
            return Err(InMemoryLogStoreError::Injected(point));
        }
        Ok(())
    }
}

/// An in-memory position log.
///
/// Clones share the same data and the same migration lock. Nothing is persisted.
#[derive(Clone, Debug, Default)]
pub struct InMemoryLogStore {
    data: Arc<Mutex<LogData>>,
    lock: Arc<Mutex<()>>,
    held: Arc<Mutex<Option<OwnedMutexGuard<()>>>>,
}

impl InMemoryLogStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        log::debug!("Creating a new InMemoryLogStore");
        Self::default()
    }

    /// Creates a store whose live log is `positions`.
    pub fn with_positions(positions: Vec<Position>) -> Self {
        log::debug!("Creating an InMemoryLogStore with {} positions", positions.len());
        Self {
            data: Arc::new(Mutex::new(LogData {
                live: positions,
                ..LogData::default()
            })),
            ..Self::default()
        }
    }

    /// A copy of the live log.
    pub async fn positions(&self) -> Vec<Position> {
        self.data.lock().await.live.clone()
    }

    /// A copy of the staged log, if any.
    pub async fn staged_positions(&self) -> Option<Vec<Position>> {
        self.data.lock().await.staged.clone()
    }

    /// A copy of the derived tables last rebuilt.
    pub async fn derived(&self) -> DerivedTables {
        self.data.lock().await.derived.clone()
    }

    /// Makes the next call of the given operation fail.
    pub async fn fail_next(&self, point: FailPoint) {
        self.data.lock().await.fail_next = Some(point);
    }

    /// `true` while some holder owns the migration lock.
    pub async fn is_locked(&self) -> bool {
        self.held.lock().await.is_some()
    }
}

/// Errors returned by the InMemoryLogStore
#[derive(Debug, thiserror::Error)]
pub enum InMemoryLogStoreError {
    /// Another holder owns the migration lock.
    #[error("the migration lock is held by another run")]
    LockHeld,
    /// Release without a prior acquire.
    #[error("the migration lock is not held")]
    LockNotHeld,
    /// Swap without staged positions.
    #[error("nothing is staged")]
    NoStaging,
    /// A failure requested through [`InMemoryLogStore::fail_next`].
    #[error("injected failure at {0:?}")]
    Injected(FailPoint),
}

#[async_trait]
impl LogStoreBackend for InMemoryLogStore {
    type Error = InMemoryLogStoreError;

    async fn acquire_lock(&self) -> Result<(), Self::Error> {
        let guard = self
            .lock
            .clone()
            .try_lock_owned()
            .map_err(|_| InMemoryLogStoreError::LockHeld)?;
        *self.held.lock().await = Some(guard);
        log::debug!("InMemoryLogStore: lock acquired");
        Ok(())
    }

    async fn release_lock(&self) -> Result<(), Self::Error> {
        match self.held.lock().await.take() {
            Some(_guard) => {
                log::debug!("InMemoryLogStore: lock released");
                Ok(())
            }
            None => Err(InMemoryLogStoreError::LockNotHeld),
        }
    }

    async fn read_positions(
        &self,
    ) -> Result<Pin<Box<dyn PositionStream + Send + 'life0>>, Self::Error> {
        let snapshot = self.data.lock().await.live.clone();
        log::debug!("Reading {} positions", snapshot.len());
        let stream: Pin<Box<dyn PositionStream + Send>> =
            Box::pin(InMemoryPositionStream::new(snapshot));
        Ok(stream)
    }

    async fn staging_phase(&self) -> Result<StagingPhase, Self::Error> {
        Ok(self.data.lock().await.phase)
    }

    async fn write_staging(
        &self,
        positions: &[Position],
        target_mi: i32,
    ) -> Result<(), Self::Error> {
        let mut data = self.data.lock().await;
        data.injected(FailPoint::WriteStaging)?;
        data.staged = Some(positions.to_vec());
        data.phase = StagingPhase::Staged { target_mi };
        log::debug!(
            "Staged {} positions at migration index {target_mi}",
            positions.len()
        );
        Ok(())
    }

    async fn discard_staging(&self) -> Result<(), Self::Error> {
        let mut data = self.data.lock().await;
        data.staged = None;
        if matches!(data.phase, StagingPhase::Staged { .. }) {
            data.phase = StagingPhase::Idle;
        }
        log::debug!("Staging discarded");
        Ok(())
    }

    async fn swap_in_staging(&self) -> Result<(), Self::Error> {
        let mut data = self.data.lock().await;
        data.injected(FailPoint::Swap)?;
        let StagingPhase::Staged { target_mi } = data.phase else {
            return Err(InMemoryLogStoreError::NoStaging);
        };
        let staged = data.staged.take().ok_or(InMemoryLogStoreError::NoStaging)?;
        data.live = staged;
        data.phase = StagingPhase::Swapped { target_mi };
        log::debug!("Swapped staging into the live log at migration index {target_mi}");
        Ok(())
    }

    async fn rebuild_derived(&self, derived: &DerivedTables) -> Result<(), Self::Error> {
        let mut data = self.data.lock().await;
        data.injected(FailPoint::Rebuild)?;
        data.derived = derived.clone();
        Ok(())
    }

    async fn clear_staging(&self) -> Result<(), Self::Error> {
        let mut data = self.data.lock().await;
        data.staged = None;
        data.phase = StagingPhase::Idle;
        Ok(())
    }
}

/// A stream over a snapshot of the live log.
pub struct InMemoryPositionStream {
    positions: std::vec::IntoIter<Position>,
}

impl InMemoryPositionStream {
    fn new(positions: Vec<Position>) -> Self {
        Self {
            positions: positions.into_iter(),
        }
    }
}

impl Stream for InMemoryPositionStream {
    type Item = Result<Position, Box<dyn std::error::Error + Send + Sync>>;

    fn poll_next(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Poll::Ready(self.positions.next().map(Ok))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.positions.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    fn sample_log() -> Vec<Position> {
        vec![
            Position::new(
                1,
                1,
                vec![Event::create(
                    Fqid::new("topic", 1).unwrap(),
                    evolve_core::fields! {"title" => "a"},
                )],
            ),
            Position::new(2, 1, vec![]),
        ]
    }

    #[tokio::test]
    async fn lock_is_exclusive_across_clones() {
        let store = InMemoryLogStore::new();
        let other = store.clone();
        store.acquire_lock().await.unwrap();
        assert!(matches!(
            other.acquire_lock().await,
            Err(InMemoryLogStoreError::LockHeld)
        ));
        store.release_lock().await.unwrap();
        other.acquire_lock().await.unwrap();
        assert!(other.is_locked().await);
        other.release_lock().await.unwrap();
        assert!(matches!(
            other.release_lock().await,
            Err(InMemoryLogStoreError::LockNotHeld)
        ));
    }

    #[tokio::test]
    async fn reads_a_snapshot_in_order() {
        let store = InMemoryLogStore::with_positions(sample_log());
        let mut stream = store.read_positions().await.unwrap();
        let mut numbers = Vec::new();
        while let Some(position) = stream.next().await {
            numbers.push(position.unwrap().position);
        }
        assert_eq!(numbers, vec![1, 2]);
    }

    #[tokio::test]
    async fn staging_protocol_moves_through_phases() {
        let store = InMemoryLogStore::with_positions(sample_log());
        let mut migrated = sample_log();
        for p in migrated.iter_mut() {
            p.migration_index = 2;
        }

        assert!(matches!(
            store.swap_in_staging().await,
            Err(InMemoryLogStoreError::NoStaging)
        ));
        store.write_staging(&migrated, 2).await.unwrap();
        assert_eq!(
            store.staging_phase().await.unwrap(),
            StagingPhase::Staged { target_mi: 2 }
        );
        assert_eq!(store.positions().await, sample_log());

        store.swap_in_staging().await.unwrap();
        assert_eq!(
            store.staging_phase().await.unwrap(),
            StagingPhase::Swapped { target_mi: 2 }
        );
        assert_eq!(store.positions().await, migrated);

        store.clear_staging().await.unwrap();
        assert_eq!(store.staging_phase().await.unwrap(), StagingPhase::Idle);
    }

    #[tokio::test]
    async fn discard_keeps_the_live_log() {
        let store = InMemoryLogStore::with_positions(sample_log());
        store.write_staging(&[], 2).await.unwrap();
        store.discard_staging().await.unwrap();
        assert_eq!(store.staging_phase().await.unwrap(), StagingPhase::Idle);
        assert!(store.staged_positions().await.is_none());
        assert_eq!(store.positions().await, sample_log());
    }

    #[tokio::test]
    async fn injected_failures_fire_once() {
        let store = InMemoryLogStore::new();
        store.fail_next(FailPoint::WriteStaging).await;
        assert!(store.write_staging(&[], 2).await.is_err());
        assert!(store.write_staging(&[], 2).await.is_ok());
    }
}
