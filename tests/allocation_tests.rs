//! Allocation engine integration tests.
//!
//! Covers the core allocation properties:
//! - Determinism: fixed identity + fixed salt always hash the same way.
//! - Idempotence: re-allocating returns the same variant and does not
//!   move participant counts.
//! - Uniformity: bucketing matches configured traffic weights at scale.
//! - Weight-sum invariant: undersized weights leave a tail unallocated.
//! - Holdout exclusion, forced variants, lifecycle gating, and the
//!   concurrent same-identity race.
//!
//! Run with: `cargo test --test allocation_tests`

use std::sync::Arc;
use std::thread;

use experiment_engine::config::EngineConfig;
use experiment_engine::engine::ExperimentEngine;
use experiment_engine::errors::AllocationError;
use experiment_engine::experiment::{
    Experiment, ExperimentBuilder, TargetingRules, UserContext, Variant,
};
use experiment_engine::hashing;
use experiment_engine::store::MemoryStore;

// ═══════════════════════════════════════════════════════════════════════
// Test infrastructure
// ═══════════════════════════════════════════════════════════════════════

const TEST_SALT: &str = "allocation-test-salt";

fn engine() -> ExperimentEngine {
    ExperimentEngine::new(Arc::new(MemoryStore::new()), EngineConfig::new(TEST_SALT))
}

fn fifty_fifty(id: &str) -> Experiment {
    ExperimentBuilder::new(id, "fifty-fifty")
        .variant(Variant::control("control", 0.5))
        .variant(Variant::new("treatment", 0.5))
        .build()
        .expect("valid experiment")
}

fn running_engine(experiment: Experiment) -> ExperimentEngine {
    let engine = engine();
    let id = experiment.id.clone();
    engine.create_experiment(experiment).expect("create");
    engine.start_experiment(&id).expect("start");
    engine
}

// ═══════════════════════════════════════════════════════════════════════
// Determinism and idempotence
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn hashing_is_deterministic_across_calls() {
    let key_a = hashing::allocation_key("user_123", TEST_SALT);
    let key_b = hashing::allocation_key("user_123", TEST_SALT);
    assert_eq!(key_a, key_b);
    assert_eq!(hashing::bucket_value(&key_a), hashing::bucket_value(&key_b));
}

#[test]
fn repeated_allocation_returns_same_variant() {
    let engine = running_engine(fifty_fifty("exp"));
    let ctx = UserContext::for_user("user_1");

    let first = engine.allocate("exp", &ctx, None).expect("first allocate");
    assert!(first.is_new_allocation);

    for _ in 0..5 {
        let again = engine.allocate("exp", &ctx, None).expect("re-allocate");
        assert_eq!(again.variant_name, first.variant_name);
        assert_eq!(again.allocation_id, first.allocation_id);
        assert!(!again.is_new_allocation);
    }
}

#[test]
fn repeated_allocation_does_not_recount_participants() {
    let engine = running_engine(fifty_fifty("exp"));
    let ctx = UserContext::for_user("user_1");

    engine.allocate("exp", &ctx, None).expect("first");
    engine.allocate("exp", &ctx, None).expect("second");
    engine.allocate("exp", &ctx, None).expect("third");

    let snapshot = engine.experiment_snapshot("exp").expect("snapshot");
    assert_eq!(snapshot.total_participants, 1);
    let allocated: u64 = snapshot.variants.iter().map(|v| v.participants).sum();
    assert_eq!(allocated, 1);
}

#[test]
fn session_identity_works_when_no_user_id() {
    let engine = running_engine(fifty_fifty("exp"));
    let ctx = UserContext::for_session("session_abc");
    assert!(engine.allocate("exp", &ctx, None).is_ok());
}

#[test]
fn missing_identity_is_rejected() {
    let engine = running_engine(fifty_fifty("exp"));
    let err = engine.allocate("exp", &UserContext::default(), None).unwrap_err();
    assert!(matches!(err, AllocationError::NoIdentity));
}

// ═══════════════════════════════════════════════════════════════════════
// Uniformity and weight handling
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn bucket_values_are_uniform_over_100k_identities() {
    // 50/50 split: each half of [0,1) should catch 50% +/- 2%.
    let n = 100_000;
    let mut below_half = 0u64;
    for i in 0..n {
        let key = hashing::allocation_key(&format!("uniformity_user_{i}"), TEST_SALT);
        if hashing::bucket_value(&key) < 0.5 {
            below_half += 1;
        }
    }
    let fraction = below_half as f64 / n as f64;
    assert!((fraction - 0.5).abs() < 0.02, "fraction {fraction} outside 0.5 +/- 0.02");
}

#[test]
fn allocation_split_matches_weights() {
    let experiment = ExperimentBuilder::new("exp", "uneven")
        .variant(Variant::control("control", 0.8))
        .variant(Variant::new("treatment", 0.2))
        .build()
        .expect("valid");
    let engine = running_engine(experiment);

    let n = 5_000;
    let mut treatment = 0u64;
    for i in 0..n {
        let ctx = UserContext::for_user(&format!("split_user_{i}"));
        let outcome = engine.allocate("exp", &ctx, None).expect("allocate");
        if outcome.variant_name == "treatment" {
            treatment += 1;
        }
    }
    let fraction = treatment as f64 / n as f64;
    assert!((fraction - 0.2).abs() < 0.03, "treatment fraction {fraction} outside 0.2 +/- 0.03");
}

#[test]
fn undersized_weights_leave_tail_unallocated() {
    // Weights sum to 0.7: roughly 30% of identities must fail with
    // NoVariantSelected, never silently landing in the last variant.
    let experiment = ExperimentBuilder::new("exp", "partial")
        .variant(Variant::control("control", 0.35))
        .variant(Variant::new("treatment", 0.35))
        .build()
        .expect("valid");
    let engine = running_engine(experiment);

    let n = 5_000;
    let mut unallocated = 0u64;
    for i in 0..n {
        let ctx = UserContext::for_user(&format!("partial_user_{i}"));
        match engine.allocate("exp", &ctx, None) {
            Ok(_) => {}
            Err(AllocationError::NoVariantSelected) => unallocated += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    let fraction = unallocated as f64 / n as f64;
    assert!((fraction - 0.3).abs() < 0.03, "unallocated fraction {fraction} outside 0.3 +/- 0.03");
}

// ═══════════════════════════════════════════════════════════════════════
// Lifecycle gating, eligibility, forced variants
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn draft_and_paused_experiments_do_not_allocate() {
    let engine = engine();
    engine.create_experiment(fifty_fifty("exp")).expect("create");

    let ctx = UserContext::for_user("user_1");
    assert!(matches!(
        engine.allocate("exp", &ctx, None).unwrap_err(),
        AllocationError::NotRunning { .. }
    ));

    engine.start_experiment("exp").expect("start");
    engine.allocate("exp", &ctx, None).expect("runs while running");

    engine.pause_experiment("exp").expect("pause");
    assert!(matches!(
        engine.allocate("exp", &ctx, None).unwrap_err(),
        AllocationError::NotRunning { .. }
    ));

    // Resume: existing allocation is preserved and reused.
    engine.resume_experiment("exp").expect("resume");
    let outcome = engine.allocate("exp", &ctx, None).expect("reuse after resume");
    assert!(!outcome.is_new_allocation);
}

#[test]
fn unknown_experiment_fails() {
    let engine = engine();
    assert!(matches!(
        engine.allocate("missing", &UserContext::for_user("u"), None).unwrap_err(),
        AllocationError::ExperimentNotFound(_)
    ));
}

#[test]
fn targeting_failure_carries_reason() {
    let experiment = ExperimentBuilder::new("exp", "targeted")
        .variant(Variant::control("control", 0.5))
        .variant(Variant::new("treatment", 0.5))
        .targeting(TargetingRules {
            countries: Some(vec!["US".to_string()]),
            ..Default::default()
        })
        .build()
        .expect("valid");
    let engine = running_engine(experiment);

    let mut ctx = UserContext::for_user("user_de");
    ctx.country = Some("DE".to_string());
    match engine.allocate("exp", &ctx, None).unwrap_err() {
        AllocationError::Ineligible { reason } => assert_eq!(reason, "targeting_country"),
        other => panic!("expected ineligible, got {other}"),
    }
}

#[test]
fn forced_variant_bypasses_bucketing_but_not_eligibility() {
    let experiment = ExperimentBuilder::new("exp", "forced")
        .variant(Variant::control("control", 1.0))
        .variant(Variant::new("treatment", 0.0))
        .build()
        .expect("valid");
    let engine = running_engine(experiment);

    // Zero-weight variant is unreachable by bucketing but reachable by
    // the override path.
    let outcome = engine
        .allocate("exp", &UserContext::for_user("qa_user"), Some("treatment"))
        .expect("forced allocate");
    assert_eq!(outcome.variant_name, "treatment");

    assert!(matches!(
        engine
            .allocate("exp", &UserContext::for_user("qa_user_2"), Some("nope"))
            .unwrap_err(),
        AllocationError::UnknownVariant(_)
    ));
}

#[test]
fn removed_allocation_rebuckets_on_next_call() {
    let engine = running_engine(fifty_fifty("exp"));
    let ctx = UserContext::for_user("user_1");

    let first = engine.allocate("exp", &ctx, None).expect("first");
    assert!(engine.remove_allocation("exp", &ctx).expect("remove"));

    let second = engine.allocate("exp", &ctx, None).expect("second");
    assert!(second.is_new_allocation);
    // Same bucket, same salt: the variant is identical even though the
    // allocation row is new.
    assert_eq!(second.variant_name, first.variant_name);
    assert_ne!(second.allocation_id, first.allocation_id);
}

// ═══════════════════════════════════════════════════════════════════════
// Holdout groups
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn enrolled_holdout_member_is_rejected_everywhere() {
    let engine = engine();
    engine.create_experiment(fifty_fifty("exp_a")).expect("create a");
    engine.create_experiment(fifty_fifty("exp_b")).expect("create b");
    engine.start_experiment("exp_a").expect("start a");
    engine.start_experiment("exp_b").expect("start b");

    engine.create_holdout_group("global_holdout", "Global holdout", None).expect("group");
    let ctx = UserContext::for_user("held_out_user");
    engine.enroll_in_holdout("global_holdout", &ctx).expect("enroll");

    for exp in ["exp_a", "exp_b"] {
        match engine.allocate(exp, &ctx, None).unwrap_err() {
            AllocationError::Ineligible { reason } => assert_eq!(reason, "holdout"),
            other => panic!("expected holdout rejection, got {other}"),
        }
    }

    // A different identity is unaffected.
    assert!(engine.allocate("exp_a", &UserContext::for_user("free_user"), None).is_ok());
}

#[test]
fn percentage_holdout_is_deterministic() {
    let engine = running_engine(fifty_fifty("exp"));
    engine.create_holdout_group("pct", "10% holdout", Some(0.10)).expect("group");

    let mut held = 0u64;
    let n = 2_000;
    for i in 0..n {
        let ctx = UserContext::for_user(&format!("pct_user_{i}"));
        match engine.allocate("exp", &ctx, None) {
            Err(AllocationError::Ineligible { reason }) if reason == "holdout" => held += 1,
            Ok(_) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    let fraction = held as f64 / n as f64;
    assert!((fraction - 0.10).abs() < 0.03, "holdout fraction {fraction} outside 0.10 +/- 0.03");

    // Re-evaluation gives identical answers identity by identity.
    let ctx = UserContext::for_user("pct_user_0");
    let first = engine.allocate("exp", &ctx, None).map(|o| o.variant_name);
    let second = engine.allocate("exp", &ctx, None).map(|o| o.variant_name);
    match (first, second) {
        (Ok(a), Ok(b)) => assert_eq!(a, b),
        (Err(AllocationError::Ineligible { .. }), Err(AllocationError::Ineligible { .. })) => {}
        (a, b) => panic!("holdout decision flapped: {a:?} vs {b:?}"),
    }
}

#[test]
fn deactivated_holdout_stops_excluding() {
    let engine = running_engine(fifty_fifty("exp"));
    engine.create_holdout_group("temp", "Temporary", None).expect("group");
    let ctx = UserContext::for_user("returning_user");
    engine.enroll_in_holdout("temp", &ctx).expect("enroll");

    assert!(engine.allocate("exp", &ctx, None).is_err());
    engine.deactivate_holdout_group("temp").expect("deactivate");
    assert!(engine.allocate("exp", &ctx, None).is_ok());
}

// ═══════════════════════════════════════════════════════════════════════
// Concurrency: the same-new-identity race
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn concurrent_allocation_of_same_identity_counts_once() {
    let store = Arc::new(MemoryStore::new());
    let engine = Arc::new(ExperimentEngine::new(
        Arc::clone(&store) as Arc<dyn experiment_engine::store::ExperimentStore>,
        EngineConfig::new(TEST_SALT),
    ));
    engine.create_experiment(fifty_fifty("exp")).expect("create");
    engine.start_experiment("exp").expect("start");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = Arc::clone(&engine);
        handles.push(thread::spawn(move || {
            let ctx = UserContext::for_user("raced_user");
            engine.allocate("exp", &ctx, None).expect("allocate")
        }));
    }

    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().expect("join")).collect();

    // Exactly one allocation row survives; every thread saw its variant.
    let first_variant = &outcomes[0].variant_name;
    assert!(outcomes.iter().all(|o| &o.variant_name == first_variant));
    assert_eq!(outcomes.iter().filter(|o| o.is_new_allocation).count(), 1);

    let snapshot = engine.experiment_snapshot("exp").expect("snapshot");
    assert_eq!(snapshot.total_participants, 1);
}
