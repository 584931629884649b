//! Step catalog
//!
//! Registered steps are held in an immutable [`CatalogSnapshot`] behind an
//! `RwLock<Arc<_>>`. Writers build a new snapshot and swap it in, so a
//! planner holding a snapshot never observes a half-applied update.

use crate::domain::step::Step;
use crate::{CoreError, StepId};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Producers and consumers of one attribute across the catalog
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeIndex {
    pub providers: BTreeSet<StepId>,
    pub consumers: BTreeSet<StepId>,
}

/// Immutable view of the registered steps
#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    steps: BTreeMap<StepId, Arc<Step>>,
    attributes: BTreeMap<String, AttributeIndex>,
}

impl CatalogSnapshot {
    /// Build a snapshot from a set of steps, validating each
    pub fn from_steps(steps: impl IntoIterator<Item = Step>) -> Result<Self, CoreError> {
        let mut snapshot = Self::default();
        for step in steps {
            step.validate()?;
            snapshot.steps.insert(step.id.clone(), Arc::new(step));
        }
        snapshot.reindex();
        Ok(snapshot)
    }

    pub fn get(&self, id: &StepId) -> Option<&Step> {
        self.steps.get(id).map(|s| s.as_ref())
    }

    pub fn contains(&self, id: &StepId) -> bool {
        self.steps.contains_key(id)
    }

    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.values().map(|s| s.as_ref())
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Steps declaring `name` as an output
    pub fn providers_of(&self, name: &str) -> impl Iterator<Item = &StepId> {
        self.attributes
            .get(name)
            .into_iter()
            .flat_map(|idx| idx.providers.iter())
    }

    /// Steps declaring `name` as a required or optional input
    pub fn consumers_of(&self, name: &str) -> impl Iterator<Item = &StepId> {
        self.attributes
            .get(name)
            .into_iter()
            .flat_map(|idx| idx.consumers.iter())
    }

    fn reindex(&mut self) {
        let mut attributes: BTreeMap<String, AttributeIndex> = BTreeMap::new();
        for step in self.steps.values() {
            for (name, spec) in &step.attributes {
                let entry = attributes.entry(name.clone()).or_default();
                if spec.is_output() {
                    entry.providers.insert(step.id.clone());
                } else if spec.is_input() {
                    entry.consumers.insert(step.id.clone());
                }
            }
        }
        self.attributes = attributes;
    }
}

/// Shared, read-mostly registry of steps
#[derive(Debug, Default)]
pub struct StepCatalog {
    current: RwLock<Arc<CatalogSnapshot>>,
}

impl StepCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot; later updates do not affect it
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Register a new step
    pub fn register(&self, step: Step) -> Result<(), CoreError> {
        step.validate()?;
        self.modify(|steps| {
            if steps.contains_key(&step.id) {
                return Err(CoreError::StepExists(step.id.0.clone()));
            }
            info!(step_id = %step.id, step_type = step.step_type.as_str(), "Registered step");
            steps.insert(step.id.clone(), Arc::new(step));
            Ok(())
        })
    }

    /// Replace an existing step
    pub fn update(&self, step: Step) -> Result<(), CoreError> {
        step.validate()?;
        self.modify(|steps| {
            if !steps.contains_key(&step.id) {
                return Err(CoreError::UnknownStep(step.id.0.clone()));
            }
            info!(step_id = %step.id, version = %step.version, "Updated step");
            steps.insert(step.id.clone(), Arc::new(step));
            Ok(())
        })
    }

    /// Remove a step, returning its last definition
    pub fn unregister(&self, id: &StepId) -> Result<Step, CoreError> {
        let mut removed = None;
        self.modify(|steps| match steps.remove(id) {
            Some(step) => {
                removed = Some(step);
                Ok(())
            }
            None => Err(CoreError::UnknownStep(id.0.clone())),
        })?;
        info!(step_id = %id, "Unregistered step");
        removed
            .map(|step| (*step).clone())
            .ok_or_else(|| CoreError::UnknownStep(id.0.clone()))
    }

    pub fn get(&self, id: &StepId) -> Option<Step> {
        self.snapshot().get(id).cloned()
    }

    /// All steps ordered by ID
    pub fn list(&self) -> Vec<Step> {
        self.snapshot().steps().cloned().collect()
    }

    fn modify<F>(&self, f: F) -> Result<(), CoreError>
    where
        F: FnOnce(&mut BTreeMap<StepId, Arc<Step>>) -> Result<(), CoreError>,
    {
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut steps = guard.steps.clone();
        f(&mut steps)?;

        let mut next = CatalogSnapshot {
            steps,
            attributes: BTreeMap::new(),
        };
        next.reindex();
        debug!(steps = next.len(), "Catalog snapshot replaced");
        *guard = Arc::new(next);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::attribute::{AttributeRole, AttributeSpec, AttributeType};
    use crate::domain::step::StepType;

    fn producer(id: &str, output: &str) -> Step {
        Step::new(id, StepType::Script)
            .with_script("jexl", "{}")
            .with_attribute(output, AttributeSpec::new(AttributeRole::Output, AttributeType::Any))
    }

    #[test]
    fn test_register_and_get() {
        let catalog = StepCatalog::new();
        catalog.register(producer("a", "x")).unwrap();

        assert!(catalog.get(&StepId::from("a")).is_some());
        assert_eq!(catalog.list().len(), 1);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let catalog = StepCatalog::new();
        catalog.register(producer("a", "x")).unwrap();
        assert_eq!(
            catalog.register(producer("a", "y")),
            Err(CoreError::StepExists("a".to_string()))
        );
    }

    #[test]
    fn test_update_requires_existing_step() {
        let catalog = StepCatalog::new();
        assert!(matches!(
            catalog.update(producer("a", "x")),
            Err(CoreError::UnknownStep(_))
        ));

        catalog.register(producer("a", "x")).unwrap();
        catalog.update(producer("a", "y")).unwrap();

        let snapshot = catalog.snapshot();
        assert_eq!(snapshot.providers_of("y").count(), 1);
        assert_eq!(snapshot.providers_of("x").count(), 0);
    }

    #[test]
    fn test_invalid_step_rejected() {
        let catalog = StepCatalog::new();
        let step = Step::new("bad", StepType::Sync);
        assert!(matches!(
            catalog.register(step),
            Err(CoreError::InvalidStepDefinition(_))
        ));
        assert!(catalog.list().is_empty());
    }

    #[test]
    fn test_snapshot_isolated_from_updates() {
        let catalog = StepCatalog::new();
        catalog.register(producer("a", "x")).unwrap();
        let before = catalog.snapshot();

        catalog.unregister(&StepId::from("a")).unwrap();

        assert!(before.contains(&StepId::from("a")));
        assert!(!catalog.snapshot().contains(&StepId::from("a")));
    }

    #[test]
    fn test_unregister_unknown() {
        let catalog = StepCatalog::new();
        assert!(matches!(
            catalog.unregister(&StepId::from("ghost")),
            Err(CoreError::UnknownStep(_))
        ));
    }

    #[test]
    fn test_consumer_index() {
        let consumer = Step::new("b", StepType::Script)
            .with_script("jexl", "{}")
            .with_attribute("x", AttributeSpec::new(AttributeRole::Required, AttributeType::Any));
        let snapshot = CatalogSnapshot::from_steps(vec![producer("a", "x"), consumer]).unwrap();

        assert_eq!(snapshot.consumers_of("x").collect::<Vec<_>>(), vec![&StepId::from("b")]);
        assert_eq!(snapshot.providers_of("x").collect::<Vec<_>>(), vec![&StepId::from("a")]);
    }
}
