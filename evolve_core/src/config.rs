//! Configuration of a migration run.

/// Tuning knobs for [`MigrationEngine`](crate::engine::MigrationEngine).
#[derive(Clone)]
pub struct EngineConfig {
    /// Log a progress line every this many replayed positions.
    ///
    /// `0` disables progress logging.
    ///
    /// Default: 1,000 positions
    pub progress_interval: u64,

    /// Compare the `new` accessor projection with a fresh replay of the rewritten log after every
    /// event migration step and abort on mismatch.
    ///
    /// This doubles the projection work and is meant for test runs and first runs of a new
    /// migration.
    ///
    /// Default: `false`
    pub verify_projection: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            progress_interval: 1_000,
            verify_projection: false,
        }
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("progress_interval", &self.progress_interval)
            .field("verify_projection", &self.verify_projection)
            .finish()
    }
}

/// Requests cancellation of a running migration.
///
/// The engine checks the flag between positions. Cloning the handle shares the signal.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: std::sync::Arc<tokio::sync::watch::Sender<bool>>,
}

impl CancelHandle {
    pub(crate) fn new() -> (Self, tokio::sync::watch::Receiver<bool>) {
        let (tx, rx) = tokio::sync::watch::channel(false);
        (
            Self {
                tx: std::sync::Arc::new(tx),
            },
            rx,
        )
    }

    /// Signals the engine to stop before the next position.
    pub fn cancel(&self) {
        // send_replace stores the value even when no receiver is alive.
        self.tx.send_replace(true);
    }

    /// Clears a previous cancellation so the engine can run again.
    pub fn reset(&self) {
        self.tx.send_replace(false);
    }

    /// `true` once [`cancel`](Self::cancel) was called.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}
