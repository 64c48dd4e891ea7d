//! The migration registry: target migration index to migration constructor.

use crate::error::RegistryError;
use crate::migration::Migration;
use std::collections::BTreeMap;

/// Builds a fresh migration instance for one run.
pub type MigrationFactory = Box<dyn Fn() -> Migration + Send + Sync>;

/// Exactly one migration constructor per target migration index.
#[derive(Default)]
pub struct MigrationRegistry {
    factories: BTreeMap<i32, MigrationFactory>,
}

impl MigrationRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` under the target index its migrations declare.
    pub fn register<F>(&mut self, factory: F) -> Result<(), RegistryError>
    where
        F: Fn() -> Migration + Send + Sync + 'static,
    {
        let target = factory().target_migration_index();
        self.register_at(target, factory)
    }

    /// Registers `factory` under an explicit key.
    ///
    /// The key is checked against the declared index when the chain is instantiated.
    pub fn register_at<F>(&mut self, target: i32, factory: F) -> Result<(), RegistryError>
    where
        F: Fn() -> Migration + Send + Sync + 'static,
    {
        if self.factories.contains_key(&target) {
            return Err(RegistryError::DuplicateMigration(target));
        }
        log::debug!("Registered migration for migration index {target}");
        self.factories.insert(target, Box::new(factory));
        Ok(())
    }

    /// The highest registered target index.
    pub fn max_target(&self) -> Option<i32> {
        self.factories.keys().next_back().copied()
    }

    /// Registered target indices, ascending.
    pub fn targets(&self) -> Vec<i32> {
        self.factories.keys().copied().collect()
    }

    /// Number of registered migrations.
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// `true` when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// The target indices to run for a log stored at `stored_mi`: every index in
    /// `(stored_mi, max_target]`, with no gaps.
    pub fn plan(&self, stored_mi: i32) -> Result<Vec<i32>, RegistryError> {
        let Some(max) = self.max_target() else {
            return Ok(Vec::new());
        };
        let mut chain = Vec::new();
        for target in stored_mi.saturating_add(1)..=max {
            if !self.factories.contains_key(&target) {
                return Err(RegistryError::MigrationChainBroken { missing: target });
            }
            chain.push(target);
        }
        Ok(chain)
    }

    /// Builds fresh instances for `chain`, checking each declared index against its key.
    pub fn instantiate(&self, chain: &[i32]) -> Result<Vec<Migration>, RegistryError> {
        chain
            .iter()
            .map(|&key| {
                let factory = self
                    .factories
                    .get(&key)
                    .ok_or(RegistryError::MigrationChainBroken { missing: key })?;
                let migration = factory();
                let declared = migration.target_migration_index();
                if declared != key {
                    return Err(RegistryError::IndexMismatch { key, declared });
                }
                Ok(migration)
            })
            .collect()
    }
}

impl std::fmt::Debug for MigrationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationRegistry")
            .field("targets", &self.targets())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MigrationError;
    use crate::event::Event;
    use crate::migration::{EventMigration, MigrationContext};

    struct Noop(i32);

    impl EventMigration for Noop {
        fn target_migration_index(&self) -> i32 {
            self.0
        }

        fn name(&self) -> &'static str {
            "noop"
        }

        fn migrate_event(
            &mut self,
            _event: &Event,
            _ctx: &MigrationContext<'_>,
        ) -> Result<Option<Vec<Event>>, MigrationError> {
            Ok(None)
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = MigrationRegistry::new();
        registry.register(|| Migration::event(Noop(2))).unwrap();
        assert_eq!(
            registry.register(|| Migration::event(Noop(2))),
            Err(RegistryError::DuplicateMigration(2))
        );
    }

    #[test]
    fn plan_covers_open_closed_interval() {
        let mut registry = MigrationRegistry::new();
        for target in 2..=5 {
            registry.register(move || Migration::event(Noop(target))).unwrap();
        }
        assert_eq!(registry.plan(1).unwrap(), vec![2, 3, 4, 5]);
        assert_eq!(registry.plan(3).unwrap(), vec![4, 5]);
        assert!(registry.plan(5).unwrap().is_empty());
    }

    #[test]
    fn gap_breaks_the_chain() {
        let mut registry = MigrationRegistry::new();
        registry.register(|| Migration::event(Noop(2))).unwrap();
        registry.register(|| Migration::event(Noop(4))).unwrap();
        assert_eq!(
            registry.plan(1),
            Err(RegistryError::MigrationChainBroken { missing: 3 })
        );
        assert_eq!(registry.plan(3).unwrap(), vec![4]);
    }

    #[test]
    fn declared_index_must_match_key() {
        let mut registry = MigrationRegistry::new();
        registry.register_at(2, || Migration::event(Noop(3))).unwrap();
        let err = registry.instantiate(&registry.plan(1).unwrap()).unwrap_err();
        assert_eq!(err, RegistryError::IndexMismatch { key: 2, declared: 3 });
    }
}
