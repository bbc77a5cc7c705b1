//! Documented constants for the experiment engine
//!
//! All tunable parameters in one place with justification for their values.
//! Centralizing constants prevents magic numbers and makes tuning easier.

// =============================================================================
// STATISTICAL DEFAULTS
// =============================================================================

/// Default significance level (alpha) for hypothesis tests
///
/// Justification:
/// - p < 0.05 is the conventional threshold for product experimentation
/// - Combined with the default 80% power, yields the standard 2.8-sigma
///   total error budget used across the industry
pub const DEFAULT_SIGNIFICANCE_LEVEL: f64 = 0.05;

/// Default statistical power (1 - beta) for sample-size planning
pub const DEFAULT_POWER: f64 = 0.80;

/// Default confidence threshold for winner detection
///
/// A variant is only declared the winner when its achieved confidence
/// (1 - p-value) strictly exceeds this value AND its lift is positive.
/// A treatment at exactly the threshold is reported as "no winner".
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.95;

/// Minimum per-variant sample size before winner detection runs a test
///
/// Justification:
/// - Below ~100 observations per group the normal approximation to the
///   binomial is unreliable and early "winners" are mostly noise
pub const DEFAULT_MIN_SAMPLE_SIZE: u64 = 100;

// =============================================================================
// MONTE CARLO
// =============================================================================

/// Number of posterior draws for Bayesian probability-of-superiority
///
/// Justification:
/// - 10,000 draws give a standard error of ~0.5% on the superiority
///   probability, well below the 95%/5% decision thresholds
/// - Fixed iteration count keeps every call bounded (no convergence loop)
pub const MONTE_CARLO_SAMPLES: usize = 10_000;

/// Default Beta prior parameters (uniform prior)
///
/// Beta(1, 1) is flat over [0, 1]: every conversion rate is equally
/// likely before data arrives. Callers with informative priors pass
/// their own.
pub const DEFAULT_PRIOR_ALPHA: f64 = 1.0;
pub const DEFAULT_PRIOR_BETA: f64 = 1.0;

// =============================================================================
// FEASIBILITY CAPS
// Sample-size planning reports a feasibility score in [0, 1] that decays
// linearly as the required sample size and duration approach these caps.
// =============================================================================

/// Maximum practical per-test user volume before a test is infeasible
pub const MAX_FEASIBLE_SAMPLE_SIZE: f64 = 50_000.0;

/// Maximum practical test duration in days
///
/// Justification:
/// - Past ~90 days, seasonality and cohort drift confound the comparison
/// - Matches the quarter boundary most teams plan against
pub const MAX_FEASIBLE_DURATION_DAYS: f64 = 90.0;

// =============================================================================
// BANDITS
// =============================================================================

/// Default exploration parameter for UCB1
///
/// sqrt(2) is the theoretical constant from the original UCB1 regret
/// bound (Auer et al. 2002). Larger values explore more aggressively.
pub const UCB1_EXPLORATION_PARAM: f64 = std::f64::consts::SQRT_2;

// =============================================================================
// HASHING
// =============================================================================

/// Domain prefix for holdout-group bucket derivation
///
/// Keeps percentage-based holdout membership independent of experiment
/// bucketing: the same identity hashes to unrelated points in [0, 1)
/// for the two purposes.
pub const HOLDOUT_DOMAIN: &str = "holdout";
