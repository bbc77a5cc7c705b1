//! Core data model: experiments, variants, contexts, allocations, events
//!
//! Every type here is a plain serializable record. Mutation rules:
//! - Variant aggregates are touched only by the allocation engine
//!   (participants) and the event tracker (conversions, total events);
//!   `conversion_rate` is recomputed after every conversion increment.
//! - Allocations are created once and updated only for exposure tracking.
//! - Events are append-only facts and never change after recording.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::constants::DEFAULT_MIN_SAMPLE_SIZE;

/// Tolerance when checking that variant weights do not exceed 1.0.
const WEIGHT_SUM_EPSILON: f64 = 1e-9;

/// Lifecycle status of an experiment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    /// Being configured, allocation not yet possible
    Draft,
    /// Actively allocating and collecting data
    Running,
    /// No new allocations; existing allocations keep serving
    Paused,
    /// Terminal: no further allocation or event recording
    Completed,
}

impl ExperimentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
        }
    }
}

/// One arm of an experiment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    /// Name, unique within the experiment
    pub name: String,
    /// Marks the baseline arm
    pub is_control: bool,
    /// Fraction of traffic assigned to this variant (0.0-1.0). The sum
    /// across variants may be below 1.0; the remainder is unallocated.
    pub weight: f64,
    /// Opaque, caller-defined feature-flag payload. Never interpreted
    /// by the engine.
    #[serde(default)]
    pub config: Value,

    // Running aggregates
    pub participants: u64,
    pub conversions: u64,
    pub unique_users: u64,
    pub total_events: u64,
    /// Derived: conversions / participants, 0 when participants is 0
    pub conversion_rate: f64,
}

impl Variant {
    pub fn new(name: &str, weight: f64) -> Self {
        Self {
            name: name.to_string(),
            is_control: false,
            weight,
            config: Value::Null,
            participants: 0,
            conversions: 0,
            unique_users: 0,
            total_events: 0,
            conversion_rate: 0.0,
        }
    }

    pub fn control(name: &str, weight: f64) -> Self {
        Self { is_control: true, ..Self::new(name, weight) }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    /// Recompute the derived conversion rate from the counters.
    pub fn recompute_conversion_rate(&mut self) {
        self.conversion_rate = if self.participants == 0 {
            0.0
        } else {
            self.conversions as f64 / self.participants as f64
        };
    }
}

/// Operator for a custom targeting rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    Contains,
    In,
    NotIn,
}

/// A single custom rule applied to `UserContext::custom_properties[field]`.
/// A field missing from the context fails the rule; absence is never a pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomRule {
    pub field: String,
    pub operator: RuleOperator,
    pub value: Value,
}

/// Targeting rules: membership tests. An absent list imposes no constraint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetingRules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_segments: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub countries: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platforms: Option<Vec<String>>,
    #[serde(default)]
    pub custom_rules: Vec<CustomRule>,
}

/// Inclusion rules: minimums the context must meet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InclusionRules {
    /// Minimum account age in days
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_account_age_days: Option<i64>,
    /// Require completed onboarding
    #[serde(default)]
    pub require_onboarding: bool,
}

/// Exclusion rules: conditions that remove a context from the pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExclusionRules {
    /// Explicit user-id blacklist
    #[serde(default)]
    pub excluded_user_ids: Vec<String>,
    /// Exclude employees
    #[serde(default)]
    pub exclude_employees: bool,
    /// Exclude synthetic/test users
    #[serde(default)]
    pub exclude_test_users: bool,
    /// Honor per-user experimentation opt-out
    #[serde(default)]
    pub exclude_opted_out: bool,
    /// Experiments this one is mutually exclusive with: a user already
    /// allocated in any *running* experiment on this list is rejected.
    #[serde(default)]
    pub mutually_exclusive_with: Vec<String>,
}

/// A named test with variants, rules, and running counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub name: String,
    pub status: ExperimentStatus,
    pub variants: Vec<Variant>,
    #[serde(default)]
    pub targeting: TargetingRules,
    #[serde(default)]
    pub inclusion: InclusionRules,
    #[serde(default)]
    pub exclusion: ExclusionRules,
    /// Event type treated as the conversion metric
    pub primary_metric: String,
    /// Minimum per-variant sample size before analysis is trusted
    pub min_sample_size: u64,
    pub total_participants: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Experiment {
    /// Sum of all variant traffic weights. Must never exceed 1.0.
    pub fn weight_sum(&self) -> f64 {
        self.variants.iter().map(|v| v.weight).sum()
    }

    /// Validate structural invariants (weight sum, unique variant names,
    /// at least one variant).
    pub fn validate(&self) -> Result<(), String> {
        if self.variants.is_empty() {
            return Err("experiment must have at least one variant".to_string());
        }
        let sum = self.weight_sum();
        if sum > 1.0 + WEIGHT_SUM_EPSILON {
            return Err(format!("variant weights sum to {sum:.4}, must be <= 1.0"));
        }
        for v in &self.variants {
            if !(0.0..=1.0).contains(&v.weight) {
                return Err(format!("variant '{}' has weight {} outside [0,1]", v.name, v.weight));
            }
        }
        let mut names: Vec<&str> = self.variants.iter().map(|v| v.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.variants.len() {
            return Err("variant names must be unique within an experiment".to_string());
        }
        Ok(())
    }

    pub fn variant(&self, name: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.name == name)
    }

    pub fn variant_mut(&mut self, name: &str) -> Option<&mut Variant> {
        self.variants.iter_mut().find(|v| v.name == name)
    }

    /// Whether a lifecycle transition is permitted.
    ///
    /// draft -> running, running <-> paused, running/paused -> completed.
    /// Completed is terminal.
    pub fn can_transition(&self, to: ExperimentStatus) -> bool {
        use ExperimentStatus::*;
        matches!(
            (self.status, to),
            (Draft, Running) | (Running, Paused) | (Paused, Running) | (Running, Completed)
                | (Paused, Completed)
        )
    }
}

/// Builder for experiments, mirroring the configured-then-built lifecycle
#[derive(Debug)]
pub struct ExperimentBuilder {
    experiment: Experiment,
}

impl ExperimentBuilder {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            experiment: Experiment {
                id: id.to_string(),
                name: name.to_string(),
                status: ExperimentStatus::Draft,
                variants: Vec::new(),
                targeting: TargetingRules::default(),
                inclusion: InclusionRules::default(),
                exclusion: ExclusionRules::default(),
                primary_metric: "conversion".to_string(),
                min_sample_size: DEFAULT_MIN_SAMPLE_SIZE,
                total_participants: 0,
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
            },
        }
    }

    pub fn variant(mut self, variant: Variant) -> Self {
        self.experiment.variants.push(variant);
        self
    }

    pub fn targeting(mut self, rules: TargetingRules) -> Self {
        self.experiment.targeting = rules;
        self
    }

    pub fn inclusion(mut self, rules: InclusionRules) -> Self {
        self.experiment.inclusion = rules;
        self
    }

    pub fn exclusion(mut self, rules: ExclusionRules) -> Self {
        self.experiment.exclusion = rules;
        self
    }

    pub fn primary_metric(mut self, metric: &str) -> Self {
        self.experiment.primary_metric = metric.to_string();
        self
    }

    pub fn min_sample_size(mut self, n: u64) -> Self {
        self.experiment.min_sample_size = n;
        self
    }

    /// Validate and produce the draft experiment.
    pub fn build(self) -> Result<Experiment, String> {
        self.experiment.validate()?;
        Ok(self.experiment)
    }
}

/// Ephemeral caller-supplied context; never persisted by the engine.
/// At least one of `user_id` / `session_id` is required for allocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_segment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_age_days: Option<i64>,
    #[serde(default)]
    pub has_completed_onboarding: bool,
    #[serde(default)]
    pub is_employee: bool,
    #[serde(default)]
    pub is_test_user: bool,
    #[serde(default)]
    pub opted_out: bool,
    /// Open bag consumed by custom targeting rules
    #[serde(default)]
    pub custom_properties: HashMap<String, Value>,
}

impl UserContext {
    pub fn for_user(user_id: &str) -> Self {
        Self { user_id: Some(user_id.to_string()), ..Self::default() }
    }

    pub fn for_session(session_id: &str) -> Self {
        Self { session_id: Some(session_id.to_string()), ..Self::default() }
    }
}

/// Durable link between one identity and one variant within one experiment.
///
/// At most one allocation exists per (experiment_id, allocation_key); the
/// store enforces this with insert-if-absent semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentAllocation {
    pub id: Uuid,
    pub experiment_id: String,
    pub variant_name: String,
    /// Salted one-way hash of the identity; the uniqueness key
    pub allocation_key: String,
    /// Raw [0,1) hash outcome, kept for audit
    pub bucket_value: f64,
    pub exposure_count: u64,
    pub first_exposure: DateTime<Utc>,
    pub last_exposure: DateTime<Utc>,
}

/// Outcome of an `allocate()` call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationOutcome {
    pub allocation_id: Uuid,
    pub experiment_id: String,
    pub variant_name: String,
    /// The chosen variant's opaque configuration payload
    pub variant_config: Value,
    /// True on first-time bucketing, false on idempotent reuse
    pub is_new_allocation: bool,
}

/// Immutable recorded fact about an allocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentEvent {
    pub id: Uuid,
    pub experiment_id: String,
    pub variant_name: String,
    pub allocation_id: Uuid,
    /// Freeform; matching the experiment's primary metric makes it a
    /// conversion
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub recorded_at: DateTime<Utc>,
}

/// A named cohort of identities excluded from experimentation entirely
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoldoutGroup {
    pub id: String,
    pub name: String,
    pub active: bool,
    /// Deterministic fraction of all identities held out (0.0-1.0).
    /// None means membership is explicit-enrollment only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// Explicit enrollment of one allocation key into a holdout group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoldoutMembership {
    pub group_id: String,
    pub allocation_key: String,
    pub enrolled_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_variant_experiment(w1: f64, w2: f64) -> Experiment {
        ExperimentBuilder::new("exp_1", "test")
            .variant(Variant::control("control", w1))
            .variant(Variant::new("treatment", w2))
            .build()
            .unwrap()
    }

    #[test]
    fn test_weight_sum_over_one_rejected() {
        let result = ExperimentBuilder::new("exp_1", "test")
            .variant(Variant::control("control", 0.6))
            .variant(Variant::new("treatment", 0.6))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_weight_sum_under_one_accepted() {
        let exp = two_variant_experiment(0.35, 0.35);
        assert!((exp.weight_sum() - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_duplicate_variant_names_rejected() {
        let result = ExperimentBuilder::new("exp_1", "test")
            .variant(Variant::control("a", 0.5))
            .variant(Variant::new("a", 0.5))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_conversion_rate_recompute() {
        let mut v = Variant::new("t", 0.5);
        v.recompute_conversion_rate();
        assert_eq!(v.conversion_rate, 0.0);

        v.participants = 200;
        v.conversions = 30;
        v.recompute_conversion_rate();
        assert!((v.conversion_rate - 0.15).abs() < 1e-12);
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut exp = two_variant_experiment(0.5, 0.5);
        assert!(exp.can_transition(ExperimentStatus::Running));
        assert!(!exp.can_transition(ExperimentStatus::Completed));

        exp.status = ExperimentStatus::Running;
        assert!(exp.can_transition(ExperimentStatus::Paused));
        assert!(exp.can_transition(ExperimentStatus::Completed));

        exp.status = ExperimentStatus::Completed;
        assert!(!exp.can_transition(ExperimentStatus::Running));
        assert!(!exp.can_transition(ExperimentStatus::Paused));
    }
}
