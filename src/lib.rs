//! Experiment Engine Library
//!
//! Deterministic experiment allocation and statistical analysis for
//! multi-variant testing. Built as a plain library: callers inject a
//! store and a config, the engine returns allocation and analysis
//! decisions. No HTTP layer, no database schema, no global state.
//!
//! # Key Features
//! - Salted, collision-resistant user-to-variant bucketing; the same
//!   identity always receives the same variant
//! - Targeting / inclusion / exclusion rules and global holdout groups
//! - Idempotent allocation with exposure tracking and audit fields
//! - Frequentist tests (two-proportion Z, Welch's t), sample-size and
//!   power planning, winner detection
//! - Bayesian Beta-Binomial comparison with Monte Carlo
//!   probability-of-superiority and expected loss
//! - Sequential early stopping (SPRT, O'Brien-Fleming) and bandit
//!   allocation (UCB1, Thompson Sampling)
//!
//! # Quick start
//!
//! ```
//! use std::sync::Arc;
//! use experiment_engine::config::EngineConfig;
//! use experiment_engine::engine::ExperimentEngine;
//! use experiment_engine::experiment::{ExperimentBuilder, UserContext, Variant};
//! use experiment_engine::store::MemoryStore;
//!
//! let store = Arc::new(MemoryStore::new());
//! let engine = ExperimentEngine::new(store, EngineConfig::new("secret-salt"));
//!
//! let experiment = ExperimentBuilder::new("checkout_cta", "Checkout CTA copy")
//!     .variant(Variant::control("control", 0.5))
//!     .variant(Variant::new("treatment", 0.5))
//!     .build()
//!     .unwrap();
//! engine.create_experiment(experiment).unwrap();
//! engine.start_experiment("checkout_cta").unwrap();
//!
//! let outcome = engine
//!     .allocate("checkout_cta", &UserContext::for_user("user_1"), None)
//!     .unwrap();
//! assert!(outcome.is_new_allocation);
//! ```

pub mod config;
pub mod constants;
pub mod eligibility;
pub mod engine;
pub mod errors;
pub mod experiment;
pub mod hashing;
pub mod stats;
pub mod store;

// Re-export dependencies to ensure tests/consumers use the same version
pub use chrono;
pub use parking_lot;
pub use uuid;
