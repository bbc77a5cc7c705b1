//! Storage seam: the narrow collaborator interface the engine requires
//!
//! Persistence is not this crate's concern. [`ExperimentStore`] is the
//! complete contract: get/create/update by id, an atomic insert-if-absent
//! for allocations (the uniqueness constraint on
//! `(experiment_id, allocation_key)`), atomic counter increments, and an
//! append-only event log. A relational backend maps each method to one
//! statement; [`MemoryStore`] is the in-process reference implementation
//! used by tests and embedded callers.
//!
//! Store errors are opaque (`anyhow::Error`): an unreachable backend is
//! the caller's infrastructure problem, not something this crate retries.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::experiment::{
    Experiment, ExperimentAllocation, ExperimentEvent, ExperimentStatus, HoldoutGroup,
    HoldoutMembership,
};

/// Result of an atomic allocation insert.
///
/// When two concurrent calls race for the same new identity, exactly one
/// observes `Inserted`; the loser gets `Existing` with the winner's row
/// and must not count a second participant.
#[derive(Debug, Clone)]
pub enum AllocationInsert {
    Inserted,
    Existing(ExperimentAllocation),
}

/// The collaborator contract for durable experiment state.
pub trait ExperimentStore: Send + Sync {
    fn get_experiment(&self, id: &str) -> Result<Option<Experiment>>;
    fn create_experiment(&self, experiment: Experiment) -> Result<bool>;
    fn update_experiment(&self, experiment: Experiment) -> Result<()>;

    fn find_allocation(
        &self,
        experiment_id: &str,
        allocation_key: &str,
    ) -> Result<Option<ExperimentAllocation>>;
    /// Lookup by allocation id alone; the engine validates experiment
    /// ownership so a mismatch can be reported distinctly from absence.
    fn find_allocation_by_id(&self, allocation_id: &Uuid)
        -> Result<Option<ExperimentAllocation>>;

    /// Insert-if-absent on `(experiment_id, allocation_key)`. Must be
    /// atomic with respect to concurrent inserts of the same key.
    fn insert_allocation_if_absent(
        &self,
        allocation: ExperimentAllocation,
    ) -> Result<AllocationInsert>;

    /// Bump exposure count and last-exposure timestamp.
    fn record_exposure(
        &self,
        experiment_id: &str,
        allocation_key: &str,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Explicit removal request; returns whether a row was deleted.
    fn remove_allocation(&self, experiment_id: &str, allocation_key: &str) -> Result<bool>;

    /// Atomically increment experiment.total_participants and the chosen
    /// variant's participants/unique_users. Paired with the allocation
    /// insert so racing callers cannot double-count.
    fn record_participant(&self, experiment_id: &str, variant_name: &str) -> Result<()>;

    /// Atomically increment variant.total_events, and conversions plus
    /// the recomputed conversion_rate when `is_conversion`.
    fn record_event_aggregate(
        &self,
        experiment_id: &str,
        variant_name: &str,
        is_conversion: bool,
    ) -> Result<()>;

    /// Append an immutable event.
    fn append_event(&self, event: ExperimentEvent) -> Result<()>;
    fn events_for(&self, experiment_id: &str) -> Result<Vec<ExperimentEvent>>;

    fn put_holdout_group(&self, group: HoldoutGroup) -> Result<()>;
    fn get_holdout_group(&self, id: &str) -> Result<Option<HoldoutGroup>>;
    fn active_holdout_groups(&self) -> Result<Vec<HoldoutGroup>>;
    fn add_holdout_membership(&self, membership: HoldoutMembership) -> Result<()>;
    fn has_holdout_membership(&self, group_id: &str, allocation_key: &str) -> Result<bool>;

    /// Whether the identity already holds an allocation in any currently
    /// running experiment from `experiment_ids` (mutual exclusivity).
    fn has_running_allocation_in(
        &self,
        experiment_ids: &[String],
        allocation_key: &str,
    ) -> Result<bool>;
}

#[derive(Default)]
struct Inner {
    experiments: HashMap<String, Experiment>,
    /// Keyed by (experiment_id, allocation_key), the uniqueness constraint
    allocations: HashMap<(String, String), ExperimentAllocation>,
    /// Secondary index: allocation id -> primary key
    allocation_ids: HashMap<Uuid, (String, String)>,
    events: Vec<ExperimentEvent>,
    holdout_groups: HashMap<String, HoldoutGroup>,
    holdout_members: HashSet<(String, String)>,
}

/// In-memory reference store.
///
/// A single `RwLock` over all state makes every trait method atomic,
/// which is exactly the behavior a relational backend provides through
/// its uniqueness constraint and atomic UPDATEs.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExperimentStore for MemoryStore {
    fn get_experiment(&self, id: &str) -> Result<Option<Experiment>> {
        Ok(self.inner.read().experiments.get(id).cloned())
    }

    fn create_experiment(&self, experiment: Experiment) -> Result<bool> {
        let mut inner = self.inner.write();
        if inner.experiments.contains_key(&experiment.id) {
            return Ok(false);
        }
        inner.experiments.insert(experiment.id.clone(), experiment);
        Ok(true)
    }

    fn update_experiment(&self, experiment: Experiment) -> Result<()> {
        let mut inner = self.inner.write();
        if !inner.experiments.contains_key(&experiment.id) {
            return Err(anyhow!("experiment {} does not exist", experiment.id));
        }
        inner.experiments.insert(experiment.id.clone(), experiment);
        Ok(())
    }

    fn find_allocation(
        &self,
        experiment_id: &str,
        allocation_key: &str,
    ) -> Result<Option<ExperimentAllocation>> {
        let key = (experiment_id.to_string(), allocation_key.to_string());
        Ok(self.inner.read().allocations.get(&key).cloned())
    }

    fn find_allocation_by_id(
        &self,
        allocation_id: &Uuid,
    ) -> Result<Option<ExperimentAllocation>> {
        let inner = self.inner.read();
        let Some(key) = inner.allocation_ids.get(allocation_id) else {
            return Ok(None);
        };
        Ok(inner.allocations.get(key).cloned())
    }

    fn insert_allocation_if_absent(
        &self,
        allocation: ExperimentAllocation,
    ) -> Result<AllocationInsert> {
        let mut inner = self.inner.write();
        let key = (allocation.experiment_id.clone(), allocation.allocation_key.clone());
        if let Some(existing) = inner.allocations.get(&key) {
            return Ok(AllocationInsert::Existing(existing.clone()));
        }
        inner.allocation_ids.insert(allocation.id, key.clone());
        inner.allocations.insert(key, allocation);
        Ok(AllocationInsert::Inserted)
    }

    fn record_exposure(
        &self,
        experiment_id: &str,
        allocation_key: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let key = (experiment_id.to_string(), allocation_key.to_string());
        let alloc = inner
            .allocations
            .get_mut(&key)
            .ok_or_else(|| anyhow!("allocation not found for exposure update"))?;
        alloc.exposure_count += 1;
        alloc.last_exposure = at;
        Ok(())
    }

    fn remove_allocation(&self, experiment_id: &str, allocation_key: &str) -> Result<bool> {
        let mut inner = self.inner.write();
        let key = (experiment_id.to_string(), allocation_key.to_string());
        match inner.allocations.remove(&key) {
            Some(alloc) => {
                inner.allocation_ids.remove(&alloc.id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn record_participant(&self, experiment_id: &str, variant_name: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let exp = inner
            .experiments
            .get_mut(experiment_id)
            .ok_or_else(|| anyhow!("experiment {experiment_id} does not exist"))?;
        exp.total_participants += 1;
        let variant = exp
            .variant_mut(variant_name)
            .ok_or_else(|| anyhow!("variant {variant_name} does not exist"))?;
        variant.participants += 1;
        variant.unique_users += 1;
        variant.recompute_conversion_rate();
        Ok(())
    }

    fn record_event_aggregate(
        &self,
        experiment_id: &str,
        variant_name: &str,
        is_conversion: bool,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let exp = inner
            .experiments
            .get_mut(experiment_id)
            .ok_or_else(|| anyhow!("experiment {experiment_id} does not exist"))?;
        let variant = exp
            .variant_mut(variant_name)
            .ok_or_else(|| anyhow!("variant {variant_name} does not exist"))?;
        variant.total_events += 1;
        if is_conversion {
            variant.conversions += 1;
            variant.recompute_conversion_rate();
        }
        Ok(())
    }

    fn append_event(&self, event: ExperimentEvent) -> Result<()> {
        self.inner.write().events.push(event);
        Ok(())
    }

    fn events_for(&self, experiment_id: &str) -> Result<Vec<ExperimentEvent>> {
        Ok(self
            .inner
            .read()
            .events
            .iter()
            .filter(|e| e.experiment_id == experiment_id)
            .cloned()
            .collect())
    }

    fn put_holdout_group(&self, group: HoldoutGroup) -> Result<()> {
        self.inner.write().holdout_groups.insert(group.id.clone(), group);
        Ok(())
    }

    fn get_holdout_group(&self, id: &str) -> Result<Option<HoldoutGroup>> {
        Ok(self.inner.read().holdout_groups.get(id).cloned())
    }

    fn active_holdout_groups(&self) -> Result<Vec<HoldoutGroup>> {
        Ok(self
            .inner
            .read()
            .holdout_groups
            .values()
            .filter(|g| g.active)
            .cloned()
            .collect())
    }

    fn add_holdout_membership(&self, membership: HoldoutMembership) -> Result<()> {
        self.inner
            .write()
            .holdout_members
            .insert((membership.group_id, membership.allocation_key));
        Ok(())
    }

    fn has_holdout_membership(&self, group_id: &str, allocation_key: &str) -> Result<bool> {
        let key = (group_id.to_string(), allocation_key.to_string());
        Ok(self.inner.read().holdout_members.contains(&key))
    }

    fn has_running_allocation_in(
        &self,
        experiment_ids: &[String],
        allocation_key: &str,
    ) -> Result<bool> {
        let inner = self.inner.read();
        for id in experiment_ids {
            let running = inner
                .experiments
                .get(id)
                .map(|e| e.status == ExperimentStatus::Running)
                .unwrap_or(false);
            if !running {
                continue;
            }
            let key = (id.clone(), allocation_key.to_string());
            if inner.allocations.contains_key(&key) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::{ExperimentBuilder, Variant};

    fn sample_allocation(experiment_id: &str, key: &str) -> ExperimentAllocation {
        let now = Utc::now();
        ExperimentAllocation {
            id: Uuid::new_v4(),
            experiment_id: experiment_id.to_string(),
            variant_name: "control".to_string(),
            allocation_key: key.to_string(),
            bucket_value: 0.42,
            exposure_count: 1,
            first_exposure: now,
            last_exposure: now,
        }
    }

    #[test]
    fn test_insert_if_absent_returns_existing_on_conflict() {
        let store = MemoryStore::new();
        let first = sample_allocation("exp", "key1");
        let first_id = first.id;

        assert!(matches!(
            store.insert_allocation_if_absent(first).unwrap(),
            AllocationInsert::Inserted
        ));

        let second = sample_allocation("exp", "key1");
        match store.insert_allocation_if_absent(second).unwrap() {
            AllocationInsert::Existing(existing) => assert_eq!(existing.id, first_id),
            AllocationInsert::Inserted => panic!("duplicate key must not insert"),
        }
    }

    #[test]
    fn test_allocation_id_index() {
        let store = MemoryStore::new();
        let alloc = sample_allocation("exp_a", "key1");
        let id = alloc.id;
        store.insert_allocation_if_absent(alloc).unwrap();

        let found = store.find_allocation_by_id(&id).unwrap().unwrap();
        assert_eq!(found.experiment_id, "exp_a");
        assert!(store.find_allocation_by_id(&Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_participant_counters() {
        let store = MemoryStore::new();
        let exp = ExperimentBuilder::new("exp", "t")
            .variant(Variant::control("control", 0.5))
            .variant(Variant::new("treatment", 0.5))
            .build()
            .unwrap();
        store.create_experiment(exp).unwrap();

        store.record_participant("exp", "treatment").unwrap();
        store.record_participant("exp", "treatment").unwrap();

        let exp = store.get_experiment("exp").unwrap().unwrap();
        assert_eq!(exp.total_participants, 2);
        assert_eq!(exp.variant("treatment").unwrap().participants, 2);
        assert_eq!(exp.variant("control").unwrap().participants, 0);
    }

    #[test]
    fn test_remove_allocation() {
        let store = MemoryStore::new();
        store.insert_allocation_if_absent(sample_allocation("exp", "key1")).unwrap();
        assert!(store.remove_allocation("exp", "key1").unwrap());
        assert!(!store.remove_allocation("exp", "key1").unwrap());
        assert!(store.find_allocation("exp", "key1").unwrap().is_none());
    }
}
