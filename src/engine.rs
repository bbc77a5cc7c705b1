//! Experiment engine: allocation, event tracking, lifecycle, holdouts
//!
//! The engine is a plain constructed object over an injected store and
//! config (no singletons, no globals). All state lives behind the
//! [`ExperimentStore`] seam; the engine itself is freely shareable and
//! every method is safe under concurrent use.
//!
//! Allocation is idempotent per identity: the first call buckets, every
//! later call returns the persisted variant and bumps exposure counters.
//! Already-allocated identities are never re-evaluated against rules, so
//! a later targeting change cannot silently reassign a live user.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::eligibility::EligibilityEvaluator;
use crate::errors::{
    AllocationError, AllocationResult, ExperimentError, ExperimentResult,
};
use crate::experiment::{
    AllocationOutcome, Experiment, ExperimentAllocation, ExperimentEvent, ExperimentStatus,
    HoldoutGroup, HoldoutMembership, UserContext,
};
use crate::hashing;
use crate::store::{AllocationInsert, ExperimentStore};

/// How an event identifies the allocation it belongs to
#[derive(Debug, Clone)]
pub enum AllocationRef {
    /// Explicit allocation id, validated against the experiment
    Id(Uuid),
    /// Derive the allocation key from a user context
    Context(UserContext),
}

/// The engine. Cheap to clone via `Arc` sharing of the store.
pub struct ExperimentEngine {
    store: Arc<dyn ExperimentStore>,
    config: EngineConfig,
    evaluator: EligibilityEvaluator,
}

impl ExperimentEngine {
    pub fn new(store: Arc<dyn ExperimentStore>, config: EngineConfig) -> Self {
        let evaluator = EligibilityEvaluator::new(Arc::clone(&store), &config.salt);
        Self { store, config, evaluator }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // =========================================================================
    // Lifecycle administration
    // =========================================================================

    /// Register a draft experiment. Validates structural invariants
    /// (weight sum <= 1.0, unique variant names).
    pub fn create_experiment(&self, experiment: Experiment) -> ExperimentResult<()> {
        experiment.validate().map_err(ExperimentError::InvalidExperiment)?;
        let id = experiment.id.clone();
        if !self.store.create_experiment(experiment)? {
            return Err(ExperimentError::AlreadyExists(id));
        }
        debug!(experiment_id = %id, "experiment created");
        Ok(())
    }

    pub fn start_experiment(&self, id: &str) -> ExperimentResult<()> {
        self.transition(id, ExperimentStatus::Running)
    }

    pub fn pause_experiment(&self, id: &str) -> ExperimentResult<()> {
        self.transition(id, ExperimentStatus::Paused)
    }

    pub fn resume_experiment(&self, id: &str) -> ExperimentResult<()> {
        self.transition(id, ExperimentStatus::Running)
    }

    pub fn complete_experiment(&self, id: &str) -> ExperimentResult<()> {
        self.transition(id, ExperimentStatus::Completed)
    }

    fn transition(&self, id: &str, to: ExperimentStatus) -> ExperimentResult<()> {
        let mut experiment = self
            .store
            .get_experiment(id)?
            .ok_or_else(|| ExperimentError::ExperimentNotFound(id.to_string()))?;

        if !experiment.can_transition(to) {
            return Err(ExperimentError::InvalidTransition {
                id: id.to_string(),
                from: experiment.status.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }

        let now = Utc::now();
        match to {
            ExperimentStatus::Running if experiment.started_at.is_none() => {
                experiment.started_at = Some(now);
            }
            ExperimentStatus::Completed => experiment.completed_at = Some(now),
            _ => {}
        }
        experiment.status = to;
        self.store.update_experiment(experiment)?;
        debug!(experiment_id = %id, status = to.as_str(), "experiment transitioned");
        Ok(())
    }

    /// Read-only aggregate snapshot for the statistics modules. May lag
    /// concurrent traffic; eventual consistency is the contract here.
    pub fn experiment_snapshot(&self, id: &str) -> ExperimentResult<Experiment> {
        self.store
            .get_experiment(id)?
            .ok_or_else(|| ExperimentError::ExperimentNotFound(id.to_string()))
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate a context to a variant, or return its existing allocation.
    ///
    /// `forced_variant` bypasses bucketing (testing/override path) but is
    /// still subject to eligibility and idempotence.
    pub fn allocate(
        &self,
        experiment_id: &str,
        ctx: &UserContext,
        forced_variant: Option<&str>,
    ) -> AllocationResult<AllocationOutcome> {
        let experiment = self
            .store
            .get_experiment(experiment_id)?
            .ok_or_else(|| AllocationError::ExperimentNotFound(experiment_id.to_string()))?;

        if experiment.status != ExperimentStatus::Running {
            return Err(AllocationError::NotRunning {
                id: experiment_id.to_string(),
                status: experiment.status.as_str().to_string(),
            });
        }

        let identity = hashing::identity_of(ctx)?;
        let key = hashing::allocation_key(identity, &self.config.salt);

        // Idempotent reuse: a persisted allocation wins over everything,
        // including rule changes since it was created.
        if let Some(existing) = self.store.find_allocation(experiment_id, &key)? {
            self.store.record_exposure(experiment_id, &key, Utc::now())?;
            return Ok(self.outcome(&experiment, existing, false));
        }

        let eligibility = self.evaluator.evaluate(&experiment, ctx)?;
        if !eligibility.eligible {
            let reason = eligibility.reason.unwrap_or_else(|| "unknown".to_string());
            debug!(experiment_id, reason = %reason, "context ineligible");
            return Err(AllocationError::Ineligible { reason });
        }

        let bucket = hashing::bucket_value(&key);
        let variant_name = match forced_variant {
            Some(name) => {
                if experiment.variant(name).is_none() {
                    return Err(AllocationError::UnknownVariant(name.to_string()));
                }
                name.to_string()
            }
            None => select_variant(&experiment, bucket)?,
        };

        let now = Utc::now();
        let allocation = ExperimentAllocation {
            id: Uuid::new_v4(),
            experiment_id: experiment_id.to_string(),
            variant_name: variant_name.clone(),
            allocation_key: key.clone(),
            bucket_value: bucket,
            exposure_count: 1,
            first_exposure: now,
            last_exposure: now,
        };

        match self.store.insert_allocation_if_absent(allocation.clone())? {
            AllocationInsert::Inserted => {
                self.store.record_participant(experiment_id, &variant_name)?;
                debug!(experiment_id, variant = %variant_name, "new allocation");
                Ok(self.outcome(&experiment, allocation, true))
            }
            // Lost a race for the same new identity: return the winner's
            // variant transparently, count nothing twice.
            AllocationInsert::Existing(winner) => {
                self.store.record_exposure(experiment_id, &key, now)?;
                Ok(self.outcome(&experiment, winner, false))
            }
        }
    }

    /// Remove an identity's allocation on explicit request.
    pub fn remove_allocation(
        &self,
        experiment_id: &str,
        ctx: &UserContext,
    ) -> AllocationResult<bool> {
        let identity = hashing::identity_of(ctx)?;
        let key = hashing::allocation_key(identity, &self.config.salt);
        Ok(self.store.remove_allocation(experiment_id, &key)?)
    }

    fn outcome(
        &self,
        experiment: &Experiment,
        allocation: ExperimentAllocation,
        is_new: bool,
    ) -> AllocationOutcome {
        let variant_config = experiment
            .variant(&allocation.variant_name)
            .map(|v| v.config.clone())
            .unwrap_or(Value::Null);
        AllocationOutcome {
            allocation_id: allocation.id,
            experiment_id: allocation.experiment_id,
            variant_name: allocation.variant_name,
            variant_config,
            is_new_allocation: is_new,
        }
    }

    // =========================================================================
    // Event tracking
    // =========================================================================

    /// Record an outcome event against an allocation.
    ///
    /// An event whose type equals the experiment's primary metric is a
    /// conversion and moves `conversions`/`conversion_rate`; any other
    /// type only increments `total_events`.
    pub fn track_event(
        &self,
        experiment_id: &str,
        allocation_ref: AllocationRef,
        event_type: &str,
        value: Option<f64>,
        data: Option<Value>,
    ) -> ExperimentResult<()> {
        let experiment = self
            .store
            .get_experiment(experiment_id)?
            .ok_or_else(|| ExperimentError::ExperimentNotFound(experiment_id.to_string()))?;

        if experiment.status == ExperimentStatus::Completed {
            return Err(ExperimentError::ExperimentCompleted(experiment_id.to_string()));
        }

        let allocation = self.resolve_allocation(experiment_id, &allocation_ref)?;

        let is_conversion = event_type == experiment.primary_metric;
        let event = ExperimentEvent {
            id: Uuid::new_v4(),
            experiment_id: experiment_id.to_string(),
            variant_name: allocation.variant_name.clone(),
            allocation_id: allocation.id,
            event_type: event_type.to_string(),
            value,
            data,
            recorded_at: Utc::now(),
        };

        self.store.append_event(event)?;
        self.store
            .record_event_aggregate(experiment_id, &allocation.variant_name, is_conversion)?;

        debug!(
            experiment_id,
            variant = %allocation.variant_name,
            event_type,
            is_conversion,
            "event recorded"
        );
        Ok(())
    }

    fn resolve_allocation(
        &self,
        experiment_id: &str,
        allocation_ref: &AllocationRef,
    ) -> ExperimentResult<ExperimentAllocation> {
        match allocation_ref {
            AllocationRef::Id(id) => {
                let allocation = self
                    .store
                    .find_allocation_by_id(id)?
                    .ok_or(ExperimentError::NoAllocation)?;
                if allocation.experiment_id != experiment_id {
                    return Err(ExperimentError::AllocationMismatch {
                        allocation_id: id.to_string(),
                        experiment_id: experiment_id.to_string(),
                    });
                }
                Ok(allocation)
            }
            AllocationRef::Context(ctx) => {
                let identity =
                    hashing::identity_of(ctx).map_err(|_| ExperimentError::MissingContext)?;
                let key = hashing::allocation_key(identity, &self.config.salt);
                self.store
                    .find_allocation(experiment_id, &key)?
                    .ok_or(ExperimentError::NoAllocation)
            }
        }
    }

    // =========================================================================
    // Holdout administration
    // =========================================================================

    /// Create an active holdout group. `percentage` of `Some(p)` holds
    /// out a deterministic fraction of all identities; `None` restricts
    /// the group to explicit enrollments.
    pub fn create_holdout_group(
        &self,
        id: &str,
        name: &str,
        percentage: Option<f64>,
    ) -> ExperimentResult<()> {
        let group = HoldoutGroup {
            id: id.to_string(),
            name: name.to_string(),
            active: true,
            percentage: percentage.map(|p| p.clamp(0.0, 1.0)),
            created_at: Utc::now(),
        };
        self.store.put_holdout_group(group)?;
        Ok(())
    }

    pub fn deactivate_holdout_group(&self, id: &str) -> ExperimentResult<()> {
        let mut group = self
            .store
            .get_holdout_group(id)?
            .ok_or_else(|| ExperimentError::HoldoutNotFound(id.to_string()))?;
        group.active = false;
        self.store.put_holdout_group(group)?;
        Ok(())
    }

    /// Explicitly enroll an identity into a holdout group. Membership is
    /// keyed by allocation key, so it survives salt-stable re-evaluation.
    pub fn enroll_in_holdout(&self, group_id: &str, ctx: &UserContext) -> ExperimentResult<()> {
        if self.store.get_holdout_group(group_id)?.is_none() {
            return Err(ExperimentError::HoldoutNotFound(group_id.to_string()));
        }
        let identity = hashing::identity_of(ctx).map_err(|_| ExperimentError::MissingContext)?;
        let key = hashing::allocation_key(identity, &self.config.salt);
        self.store.add_holdout_membership(HoldoutMembership {
            group_id: group_id.to_string(),
            allocation_key: key,
            enrolled_at: Utc::now(),
        })?;
        Ok(())
    }
}

/// Walk variants in their fixed declaration order, accumulating traffic
/// weights; the first variant whose cumulative weight reaches the bucket
/// value wins, so a bucket landing exactly on a boundary belongs to the
/// earlier variant. Weights summing below 1.0 leave a tail of bucket
/// values with no variant; those identities stay unallocated.
fn select_variant(experiment: &Experiment, bucket: f64) -> AllocationResult<String> {
    let mut cumulative = 0.0;
    for variant in &experiment.variants {
        cumulative += variant.weight;
        // Zero-weight variants stay unreachable by bucketing even when
        // the bucket lands exactly on their boundary.
        if variant.weight > 0.0 && bucket <= cumulative {
            return Ok(variant.name.clone());
        }
    }
    Err(AllocationError::NoVariantSelected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::{ExperimentBuilder, Variant};

    fn experiment(weights: &[(&str, f64)]) -> Experiment {
        let mut builder = ExperimentBuilder::new("exp", "test");
        for (i, (name, w)) in weights.iter().enumerate() {
            let v = if i == 0 { Variant::control(name, *w) } else { Variant::new(name, *w) };
            builder = builder.variant(v);
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_select_variant_boundaries() {
        let exp = experiment(&[("a", 0.3), ("b", 0.3), ("c", 0.4)]);
        assert_eq!(select_variant(&exp, 0.0).unwrap(), "a");
        assert_eq!(select_variant(&exp, 0.29).unwrap(), "a");
        // A bucket landing exactly on a cumulative boundary belongs to
        // the earlier variant.
        assert_eq!(select_variant(&exp, 0.3).unwrap(), "a");
        assert_eq!(select_variant(&exp, 0.31).unwrap(), "b");
        assert_eq!(select_variant(&exp, 0.3 + 0.3).unwrap(), "b");
        assert_eq!(select_variant(&exp, 0.61).unwrap(), "c");
        assert_eq!(select_variant(&exp, 0.999).unwrap(), "c");
    }

    #[test]
    fn test_select_variant_skips_zero_weight() {
        let exp = experiment(&[("a", 0.0), ("b", 1.0)]);
        assert_eq!(select_variant(&exp, 0.0).unwrap(), "b");
        assert_eq!(select_variant(&exp, 0.5).unwrap(), "b");
    }

    #[test]
    fn test_select_variant_undersized_weights() {
        let exp = experiment(&[("a", 0.35), ("b", 0.35)]);
        assert_eq!(select_variant(&exp, 0.1).unwrap(), "a");
        assert!(matches!(
            select_variant(&exp, 0.85),
            Err(AllocationError::NoVariantSelected)
        ));
    }
}
