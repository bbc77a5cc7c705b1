//! Eligibility evaluation: targeting, inclusion, exclusion, holdout
//!
//! Checks run in a fixed order and short-circuit on the first failure.
//! Every failure carries a distinct reason string so telemetry can see
//! exactly which single rule removed a context from the pool:
//!
//! 1. Targeting rules (segment/country/platform membership, custom rules)
//! 2. Inclusion rules (minimum account age, onboarding)
//! 3. Exclusion rules (blacklist, employee, test user, opt-out,
//!    mutual exclusivity)
//! 4. Holdout-group membership, experiment-wide and independent of the
//!    rules above
//!
//! Ineligibility is an expected, frequent outcome. It reports back to the
//! caller as data, not as a system error.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::HOLDOUT_DOMAIN;
use crate::errors::AllocationResult;
use crate::experiment::{CustomRule, Experiment, RuleOperator, UserContext};
use crate::hashing;
use crate::store::ExperimentStore;

/// Outcome of an eligibility evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Eligibility {
    pub eligible: bool,
    /// Distinct reason string on failure, None when eligible
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Eligibility {
    fn pass() -> Self {
        Self { eligible: true, reason: None }
    }

    fn fail(reason: impl Into<String>) -> Self {
        Self { eligible: false, reason: Some(reason.into()) }
    }
}

/// Applies an experiment's rules and global holdout state to a context.
pub struct EligibilityEvaluator {
    store: Arc<dyn ExperimentStore>,
    salt: String,
}

impl EligibilityEvaluator {
    pub fn new(store: Arc<dyn ExperimentStore>, salt: &str) -> Self {
        Self { store, salt: salt.to_string() }
    }

    /// Run the full ordered check chain.
    ///
    /// Only storage failures surface as errors; rule failures are an
    /// `Eligibility` with `eligible: false`.
    pub fn evaluate(
        &self,
        experiment: &Experiment,
        ctx: &UserContext,
    ) -> AllocationResult<Eligibility> {
        if let Some(fail) = check_targeting(&experiment.targeting, ctx) {
            return Ok(fail);
        }
        if let Some(fail) = check_inclusion(&experiment.inclusion, ctx) {
            return Ok(fail);
        }
        if let Some(fail) = self.check_exclusion(experiment, ctx)? {
            return Ok(fail);
        }
        if let Some(fail) = self.check_holdout(ctx)? {
            return Ok(fail);
        }
        Ok(Eligibility::pass())
    }

    fn check_exclusion(
        &self,
        experiment: &Experiment,
        ctx: &UserContext,
    ) -> AllocationResult<Option<Eligibility>> {
        let rules = &experiment.exclusion;

        if let Some(user_id) = &ctx.user_id {
            if rules.excluded_user_ids.iter().any(|id| id == user_id) {
                return Ok(Some(Eligibility::fail("excluded_user")));
            }
        }
        if rules.exclude_employees && ctx.is_employee {
            return Ok(Some(Eligibility::fail("employee")));
        }
        if rules.exclude_test_users && ctx.is_test_user {
            return Ok(Some(Eligibility::fail("test_user")));
        }
        if rules.exclude_opted_out && ctx.opted_out {
            return Ok(Some(Eligibility::fail("opted_out")));
        }

        if !rules.mutually_exclusive_with.is_empty() {
            let identity = hashing::identity_of(ctx)?;
            let key = hashing::allocation_key(identity, &self.salt);
            let conflict = self
                .store
                .has_running_allocation_in(&rules.mutually_exclusive_with, &key)?;
            if conflict {
                return Ok(Some(Eligibility::fail("mutually_exclusive")));
            }
        }

        Ok(None)
    }

    /// Holdout exclusion is experiment-wide: membership in any active
    /// group rejects the context regardless of the experiment's own rules.
    fn check_holdout(&self, ctx: &UserContext) -> AllocationResult<Option<Eligibility>> {
        let groups = self.store.active_holdout_groups()?;
        if groups.is_empty() {
            return Ok(None);
        }

        let identity = hashing::identity_of(ctx)?;
        let key = hashing::allocation_key(identity, &self.salt);

        for group in groups {
            if self.store.has_holdout_membership(&group.id, &key)? {
                return Ok(Some(Eligibility::fail("holdout")));
            }
            if let Some(pct) = group.percentage {
                let domain = format!("{HOLDOUT_DOMAIN}:{}", group.id);
                if hashing::domain_bucket_value(&key, &domain) < pct {
                    return Ok(Some(Eligibility::fail("holdout")));
                }
            }
        }

        Ok(None)
    }
}

fn check_targeting(
    rules: &crate::experiment::TargetingRules,
    ctx: &UserContext,
) -> Option<Eligibility> {
    if let Some(segments) = &rules.user_segments {
        let matched = ctx
            .user_segment
            .as_ref()
            .map(|s| segments.contains(s))
            .unwrap_or(false);
        if !matched {
            return Some(Eligibility::fail("targeting_segment"));
        }
    }
    if let Some(countries) = &rules.countries {
        let matched = ctx
            .country
            .as_ref()
            .map(|c| countries.contains(c))
            .unwrap_or(false);
        if !matched {
            return Some(Eligibility::fail("targeting_country"));
        }
    }
    if let Some(platforms) = &rules.platforms {
        let matched = ctx
            .platform
            .as_ref()
            .map(|p| platforms.contains(p))
            .unwrap_or(false);
        if !matched {
            return Some(Eligibility::fail("targeting_platform"));
        }
    }
    for rule in &rules.custom_rules {
        if !custom_rule_matches(rule, ctx) {
            return Some(Eligibility::fail(format!("custom_rule:{}", rule.field)));
        }
    }
    None
}

fn check_inclusion(
    rules: &crate::experiment::InclusionRules,
    ctx: &UserContext,
) -> Option<Eligibility> {
    if let Some(min_age) = rules.min_account_age_days {
        let old_enough = ctx.account_age_days.map(|age| age >= min_age).unwrap_or(false);
        if !old_enough {
            return Some(Eligibility::fail("min_account_age"));
        }
    }
    if rules.require_onboarding && !ctx.has_completed_onboarding {
        return Some(Eligibility::fail("onboarding_required"));
    }
    None
}

/// Apply one custom rule. A field missing from the custom properties
/// fails the rule; absence is never a pass.
fn custom_rule_matches(rule: &CustomRule, ctx: &UserContext) -> bool {
    let Some(actual) = ctx.custom_properties.get(&rule.field) else {
        return false;
    };

    match rule.operator {
        RuleOperator::Equals => values_equal(actual, &rule.value),
        RuleOperator::NotEquals => !values_equal(actual, &rule.value),
        RuleOperator::GreaterThan => match (actual.as_f64(), rule.value.as_f64()) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        },
        RuleOperator::LessThan => match (actual.as_f64(), rule.value.as_f64()) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        },
        RuleOperator::Contains => match (actual, &rule.value) {
            (Value::String(haystack), Value::String(needle)) => haystack.contains(needle),
            (Value::Array(items), needle) => items.iter().any(|v| values_equal(v, needle)),
            _ => false,
        },
        RuleOperator::In => match &rule.value {
            Value::Array(options) => options.iter().any(|v| values_equal(actual, v)),
            _ => false,
        },
        RuleOperator::NotIn => match &rule.value {
            Value::Array(options) => !options.iter().any(|v| values_equal(actual, v)),
            _ => false,
        },
    }
}

/// Value equality with numeric coercion: `5` and `5.0` compare equal.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}
