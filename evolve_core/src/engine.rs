//! The migration orchestrator.
//!
//! [`MigrationEngine`] plans the chain of migrations between the stored migration index and the
//! highest registered one, replays the position log through every migration in order and hands
//! the result to a [`LogStoreBackend`]:
//!
//! - [`preview`](MigrationEngine::preview) keeps everything in memory and writes nothing,
//! - [`migrate`](MigrationEngine::migrate) writes the rewritten log to staging after every step,
//! - [`finalize`](MigrationEngine::finalize) additionally swaps staging in and rebuilds the
//!   derived tables, and resumes a finalize that stopped after the swap.
//!
//! Any error aborts the run and discards staging, leaving the live log untouched.

use crate::accessor::Accessor;
use crate::config::{CancelHandle, EngineConfig};
use crate::error::{EngineError, MigrationError, RegistryError};
use crate::event::Event;
use crate::fqid::Fqid;
use crate::log_store::{LogStoreBackend, StagingPhase};
use crate::migration::{EventMigration, Migration, MigrationContext, ModelMigration, RequestEvent};
use crate::model::{DerivedTables, ModelStore};
use crate::position::{BASELINE_MIGRATION_INDEX, Position};
use crate::registry::MigrationRegistry;
use log::{debug, info, warn};
use serde_json::json;
use tokio_stream::StreamExt;
use uuid::Uuid;

/// What a run did.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationOutcome {
    /// Identifies the run in logs.
    pub run_id: Uuid,
    /// The stored migration index before the run, `None` for an empty log.
    pub from_mi: Option<i32>,
    /// The migration index the log was raised to, `None` when nothing ran.
    pub to_mi: Option<i32>,
    /// Target indices of the migrations that ran, ascending.
    pub applied: Vec<i32>,
    /// The rewritten log. Empty when nothing ran.
    pub positions: Vec<Position>,
    /// Whether the rewritten log is now live.
    pub finalized: bool,
    /// Whether the run only completed an interrupted finalize.
    pub resumed: bool,
}

impl MigrationOutcome {
    fn noop(run_id: Uuid, from_mi: Option<i32>) -> Self {
        Self {
            run_id,
            from_mi,
            to_mi: None,
            applied: Vec::new(),
            positions: Vec::new(),
            finalized: false,
            resumed: false,
        }
    }

    /// `true` when no migration ran and nothing was resumed.
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty() && !self.resumed
    }
}

/// Where a log stands relative to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    /// The lowest migration index across all positions, `None` for an empty log.
    pub stored_mi: Option<i32>,
    /// The highest registered target index.
    pub max_target_mi: Option<i32>,
    /// Target indices a migrate would run.
    pub pending: Vec<i32>,
    /// The backend's staging phase.
    pub phase: StagingPhase,
    /// Number of live positions.
    pub positions: usize,
}

struct Plan {
    stored_mi: Option<i32>,
    chain: Vec<i32>,
}

/// Runs registered migrations against a [`LogStoreBackend`].
pub struct MigrationEngine<B>
where
    B: LogStoreBackend,
{
    backend: B,
    registry: MigrationRegistry,
    config: EngineConfig,
    cancel: CancelHandle,
    cancelled: tokio::sync::watch::Receiver<bool>,
}

impl<B> MigrationEngine<B>
where
    B: LogStoreBackend,
{
    /// Creates an engine with the default configuration.
    pub fn new(backend: B, registry: MigrationRegistry) -> Self {
        let (cancel, cancelled) = CancelHandle::new();
        Self {
            backend,
            registry,
            config: EngineConfig::default(),
            cancel,
            cancelled,
        }
    }

    /// Replaces the configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers a migration under the index it declares.
    pub fn register<F>(&mut self, factory: F) -> Result<(), RegistryError>
    where
        F: Fn() -> Migration + Send + Sync + 'static,
    {
        self.registry.register(factory)
    }

    /// The storage backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The registered migrations.
    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    /// The active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// A handle that cancels the running migration between two positions.
    ///
    /// Cancellation is sticky: call [`CancelHandle::reset`] before running again.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Reports the stored index, the pending chain and the staging phase. Takes no lock.
    pub async fn status(&self) -> Result<MigrationStatus, EngineError> {
        let positions = self.load_positions().await?;
        let phase = self
            .backend
            .staging_phase()
            .await
            .map_err(EngineError::storage)?;
        let plan = self.plan(&positions)?;
        Ok(MigrationStatus {
            stored_mi: plan.stored_mi,
            max_target_mi: self.registry.max_target(),
            pending: plan.chain,
            phase,
            positions: positions.len(),
        })
    }

    /// Runs the chain in memory and returns the rewritten log. Nothing is written and no lock is
    /// taken; migrations see `is_in_memory_migration() == true`.
    pub async fn preview(&self) -> Result<MigrationOutcome, EngineError> {
        let run_id = Uuid::new_v4();
        let positions = self.load_positions().await?;
        let plan = self.plan(&positions)?;
        if plan.chain.is_empty() {
            info!("[{run_id}] Preview: nothing to migrate");
            return Ok(MigrationOutcome::noop(run_id, plan.stored_mi));
        }
        info!(
            "[{run_id}] Previewing migration indices {:?} over {} positions",
            plan.chain,
            positions.len()
        );
        let positions = self.run_chain(run_id, positions, &plan.chain, true).await?;
        Ok(MigrationOutcome {
            run_id,
            from_mi: plan.stored_mi,
            to_mi: plan.chain.last().copied(),
            applied: plan.chain,
            positions,
            finalized: false,
            resumed: false,
        })
    }

    /// Runs the chain and leaves the rewritten log in staging.
    pub async fn migrate(&self) -> Result<MigrationOutcome, EngineError> {
        self.locked(false).await
    }

    /// Runs the chain, swaps staging into the live log and rebuilds the derived tables.
    ///
    /// A finalize interrupted after the swap is resumed at the rebuild.
    pub async fn finalize(&self) -> Result<MigrationOutcome, EngineError> {
        self.locked(true).await
    }

    async fn locked(&self, finalize: bool) -> Result<MigrationOutcome, EngineError> {
        self.backend
            .acquire_lock()
            .await
            .map_err(EngineError::storage)?;
        debug!("Migration lock acquired");

        let result = if finalize {
            self.finalize_locked().await
        } else {
            self.migrate_locked().await
        };

        let released = self
            .backend
            .release_lock()
            .await
            .map_err(EngineError::storage);
        debug!("Migration lock released");
        let outcome = result?;
        released?;
        Ok(outcome)
    }

    async fn migrate_locked(&self) -> Result<MigrationOutcome, EngineError> {
        let run_id = Uuid::new_v4();
        let positions = self.load_positions().await?;
        if let StagingPhase::Swapped { target_mi } = self.phase().await? {
            warn!(
                "[{run_id}] A finalize to migration index {target_mi} is incomplete, run finalize to finish it"
            );
        }
        let plan = self.plan(&positions)?;
        if plan.chain.is_empty() {
            info!("[{run_id}] Nothing to migrate");
            return Ok(MigrationOutcome::noop(run_id, plan.stored_mi));
        }
        info!(
            "[{run_id}] Migrating {} positions from migration index {:?} through {:?}",
            positions.len(),
            plan.stored_mi,
            plan.chain
        );

        let positions = self
            .staged(run_id, self.run_chain(run_id, positions, &plan.chain, false))
            .await?;
        info!("[{run_id}] Migration staged, run finalize to make it live");
        Ok(MigrationOutcome {
            run_id,
            from_mi: plan.stored_mi,
            to_mi: plan.chain.last().copied(),
            applied: plan.chain,
            positions,
            finalized: false,
            resumed: false,
        })
    }

    async fn finalize_locked(&self) -> Result<MigrationOutcome, EngineError> {
        let run_id = Uuid::new_v4();

        if let StagingPhase::Swapped { target_mi } = self.phase().await? {
            info!("[{run_id}] Resuming finalize to migration index {target_mi} after swap");
            let positions = self.load_positions().await?;
            self.rebuild_and_clear(run_id, target_mi, &positions).await?;
            return Ok(MigrationOutcome {
                run_id,
                from_mi: Some(target_mi),
                to_mi: Some(target_mi),
                applied: Vec::new(),
                positions,
                finalized: true,
                resumed: true,
            });
        }

        let positions = self.load_positions().await?;
        let plan = self.plan(&positions)?;
        let Some(&to_mi) = plan.chain.last() else {
            if self.phase().await? != StagingPhase::Idle {
                self.backend
                    .discard_staging()
                    .await
                    .map_err(EngineError::storage)?;
            }
            info!("[{run_id}] Nothing to finalize");
            return Ok(MigrationOutcome::noop(run_id, plan.stored_mi));
        };
        info!(
            "[{run_id}] Finalizing {} positions from migration index {:?} to {to_mi}",
            positions.len(),
            plan.stored_mi
        );

        let positions = self
            .staged(run_id, self.run_chain(run_id, positions, &plan.chain, false))
            .await?;

        self.backend
            .swap_in_staging()
            .await
            .map_err(EngineError::storage)?;
        info!("[{run_id}] Staging swapped into the live log");
        self.rebuild_and_clear(run_id, to_mi, &positions).await?;

        Ok(MigrationOutcome {
            run_id,
            from_mi: plan.stored_mi,
            to_mi: Some(to_mi),
            applied: plan.chain,
            positions,
            finalized: true,
            resumed: false,
        })
    }

    /// Awaits a staging run and discards staging if it fails.
    async fn staged<F>(&self, run_id: Uuid, run: F) -> Result<Vec<Position>, EngineError>
    where
        F: std::future::Future<Output = Result<Vec<Position>, EngineError>>,
    {
        match run.await {
            Ok(positions) => Ok(positions),
            Err(err) => {
                warn!("[{run_id}] Migration aborted: {err}");
                if let Err(discard) = self.backend.discard_staging().await {
                    warn!("[{run_id}] Failed to discard staging: {discard}");
                }
                Err(err)
            }
        }
    }

    async fn rebuild_and_clear(
        &self,
        run_id: Uuid,
        target_mi: i32,
        positions: &[Position],
    ) -> Result<(), EngineError> {
        let derived =
            DerivedTables::build(positions).map_err(|source| EngineError::Migration {
                target_mi,
                position: None,
                event_index: None,
                source: source.into(),
            })?;
        self.backend
            .rebuild_derived(&derived)
            .await
            .map_err(EngineError::storage)?;
        debug!(
            "[{run_id}] Rebuilt {} models and {} collection fields",
            derived.models.len(),
            derived.collection_fields.len()
        );
        self.backend
            .clear_staging()
            .await
            .map_err(EngineError::storage)?;
        info!("[{run_id}] Finalized at migration index {target_mi}");
        Ok(())
    }

    async fn phase(&self) -> Result<StagingPhase, EngineError> {
        self.backend
            .staging_phase()
            .await
            .map_err(EngineError::storage)
    }

    async fn load_positions(&self) -> Result<Vec<Position>, EngineError> {
        let mut stream = self
            .backend
            .read_positions()
            .await
            .map_err(EngineError::storage)?;
        let mut positions = Vec::new();
        while let Some(position) = stream.next().await {
            positions.push(position.map_err(EngineError::Storage)?);
        }
        debug!("Loaded {} positions", positions.len());
        Ok(positions)
    }

    fn plan(&self, positions: &[Position]) -> Result<Plan, EngineError> {
        let max_known = self
            .registry
            .max_target()
            .unwrap_or(BASELINE_MIGRATION_INDEX)
            .max(BASELINE_MIGRATION_INDEX);
        if let Some(position) = positions.iter().find(|p| p.migration_index > max_known) {
            return Err(EngineError::MigrationIndexTooHigh {
                position: position.position,
                found: position.migration_index,
                max: max_known,
            });
        }
        let Some(stored_mi) = positions.iter().map(|p| p.migration_index).min() else {
            return Ok(Plan {
                stored_mi: None,
                chain: Vec::new(),
            });
        };
        let chain = self.registry.plan(stored_mi)?;
        debug!("Stored migration index {stored_mi}, chain {chain:?}");
        Ok(Plan {
            stored_mi: Some(stored_mi),
            chain,
        })
    }

    async fn run_chain(
        &self,
        run_id: Uuid,
        mut positions: Vec<Position>,
        chain: &[i32],
        in_memory: bool,
    ) -> Result<Vec<Position>, EngineError> {
        let migrations = self.registry.instantiate(chain)?;
        for mut migration in migrations {
            let target = migration.target_migration_index();
            info!(
                "[{run_id}] Running migration {} to migration index {target}",
                migration.name()
            );
            positions = match &mut migration {
                Migration::Event(m) => self.run_event_step(m.as_mut(), positions, in_memory)?,
                Migration::Model(m) => self.run_model_step(m.as_mut(), positions, in_memory)?,
            };
            if !in_memory {
                self.backend
                    .write_staging(&positions, target)
                    .await
                    .map_err(EngineError::storage)?;
                debug!(
                    "[{run_id}] Staged {} positions at migration index {target}",
                    positions.len()
                );
            }
        }
        Ok(positions)
    }

    fn check_cancelled(&self, target_mi: i32, position: u64) -> Result<(), EngineError> {
        if *self.cancelled.borrow() {
            warn!("Cancelled migration to index {target_mi} before position {position}");
            return Err(EngineError::Cancelled {
                target_mi,
                position,
            });
        }
        Ok(())
    }

    fn run_event_step(
        &self,
        migration: &mut dyn EventMigration,
        input: Vec<Position>,
        in_memory: bool,
    ) -> Result<Vec<Position>, EngineError> {
        let target_mi = migration.target_migration_index();
        let name = migration.name();
        let fail = |position: u64, event_index: Option<usize>, source: MigrationError| {
            EngineError::Migration {
                target_mi,
                position: Some(position),
                event_index,
                source,
            }
        };

        let total = input.len();
        let mut old = ModelStore::new();
        let mut new = ModelStore::new();
        let mut output = Vec::with_capacity(total);

        for (done, position) in input.into_iter().enumerate() {
            let number = position.position;
            self.check_cancelled(target_mi, number)?;

            if position.migration_index >= target_mi {
                old.apply_position(&position)
                    .map_err(|e| fail(number, None, e.into()))?;
                new.apply_position(&position)
                    .map_err(|e| fail(number, None, e.into()))?;
                output.push(position);
                continue;
            }

            {
                let (o, n) = (Accessor::new(&old, in_memory), Accessor::new(&new, in_memory));
                let ctx = MigrationContext {
                    old: &o,
                    new: &n,
                    position: number,
                };
                migration
                    .position_init(&ctx)
                    .map_err(|e| fail(number, None, e))?;
            }

            let mut events = Vec::with_capacity(position.events.len());
            for (index, event) in position.events.iter().enumerate() {
                let emitted = {
                    let (o, n) = (Accessor::new(&old, in_memory), Accessor::new(&new, in_memory));
                    let ctx = MigrationContext {
                        old: &o,
                        new: &n,
                        position: number,
                    };
                    migration
                        .migrate_event(event, &ctx)
                        .map_err(|e| fail(number, Some(index), e))?
                };
                let emitted = emitted.unwrap_or_else(|| vec![event.clone()]);
                for e in &emitted {
                    new.apply(e, number)
                        .map_err(|err| fail(number, Some(index), err.into()))?;
                }
                old.apply(event, number)
                    .map_err(|err| fail(number, Some(index), err.into()))?;
                events.extend(emitted);
            }

            let additional = {
                let (o, n) = (Accessor::new(&old, in_memory), Accessor::new(&new, in_memory));
                let ctx = MigrationContext {
                    old: &o,
                    new: &n,
                    position: number,
                };
                migration
                    .get_additional_events(&ctx)
                    .map_err(|e| fail(number, None, e))?
            };
            if let Some(additional) = additional {
                for e in &additional {
                    new.apply(e, number)
                        .map_err(|err| fail(number, None, err.into()))?;
                }
                events.extend(additional);
            }

            output.push(Position {
                position: number,
                migration_index: target_mi,
                timestamp: position.timestamp,
                information: position.information,
                events,
            });
            self.progress(name, target_mi, done + 1, total);
        }

        if self.config.verify_projection {
            self.verify(target_mi, &new, &output)?;
        }
        Ok(output)
    }

    fn run_model_step(
        &self,
        migration: &mut dyn ModelMigration,
        mut positions: Vec<Position>,
        in_memory: bool,
    ) -> Result<Vec<Position>, EngineError> {
        let target_mi = migration.target_migration_index();
        let fail = |position: Option<u64>, event_index: Option<usize>, source: MigrationError| {
            EngineError::Migration {
                target_mi,
                position,
                event_index,
                source,
            }
        };

        let mut store =
            ModelStore::replay(&positions).map_err(|e| fail(None, None, e.into()))?;
        let requests = {
            let reader = Accessor::new(&store, in_memory);
            migration
                .migrate_models(&reader)
                .map_err(|e| fail(None, None, e))?
        };

        for position in positions.iter_mut() {
            position.migration_index = position.migration_index.max(target_mi);
        }

        let events: Vec<Event> = requests
            .unwrap_or_default()
            .into_iter()
            .flat_map(RequestEvent::into_events)
            .collect();
        if events.is_empty() {
            debug!("Model migration {} requested no changes", migration.name());
            return Ok(positions);
        }

        let last = positions.last();
        let number = last.map_or(1, |p| p.position + 1);
        let mut position = Position::new(number, target_mi, events);
        position.timestamp = last.and_then(|p| p.timestamp.clone());
        position.information = Some(json!({ "migration": migration.name() }));
        for (index, event) in position.events.iter().enumerate() {
            store
                .apply(event, number)
                .map_err(|e| fail(Some(number), Some(index), e.into()))?;
        }
        debug!(
            "Model migration {} appended position {number} with {} events",
            migration.name(),
            position.events.len()
        );
        positions.push(position);
        Ok(positions)
    }

    fn progress(&self, name: &str, target_mi: i32, done: usize, total: usize) {
        let interval = self.config.progress_interval;
        if interval > 0 && (done as u64) % interval == 0 {
            info!("Migration {name} to index {target_mi}: {done}/{total} positions");
        }
    }

    fn verify(
        &self,
        target_mi: i32,
        new: &ModelStore,
        output: &[Position],
    ) -> Result<(), EngineError> {
        let fail = |fqid: &Fqid, message: &str| EngineError::Migration {
            target_mi,
            position: None,
            event_index: None,
            source: MigrationError::assertion(fqid, message),
        };
        let fresh = ModelStore::replay(output).map_err(|e| EngineError::Migration {
            target_mi,
            position: None,
            event_index: None,
            source: e.into(),
        })?;
        for (fqid, model) in new.iter() {
            if fresh.get(fqid) != Some(model) {
                return Err(fail(fqid, "projection diverges from a replay of the rewritten log"));
            }
        }
        if let Some((fqid, _)) = fresh.iter().find(|(fqid, _)| new.get(fqid).is_none()) {
            return Err(fail(fqid, "model is missing from the projection"));
        }
        debug!("Verified projection at migration index {target_mi}");
        Ok(())
    }
}

impl<B> std::fmt::Debug for MigrationEngine<B>
where
    B: LogStoreBackend,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationEngine")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}
