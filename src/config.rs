//! Engine configuration
//!
//! Sensible defaults, overridable from the environment. The engine takes
//! a constructed [`EngineConfig`] by value (dependency injection); there
//! is no process-global configuration.

use std::env;

use crate::constants::{
    DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_MIN_SAMPLE_SIZE, MONTE_CARLO_SAMPLES,
};

/// Development-only placeholder salt
const DEV_SALT: &str = "dev-insecure-salt";

/// Configuration for an [`crate::engine::ExperimentEngine`]
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Secret salt for allocation-key derivation.
    ///
    /// Operational hazard: rotating this invalidates the reproducibility
    /// of every existing allocation. Identities will re-bucket as if
    /// never seen. Treat it like a signing key.
    pub salt: String,
    /// Confidence a variant must strictly exceed to be declared a winner
    pub confidence_threshold: f64,
    /// Per-variant sample size winner detection requires before testing
    pub min_sample_size: u64,
    /// Posterior draws per Bayesian comparison
    pub monte_carlo_samples: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            salt: DEV_SALT.to_string(),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            min_sample_size: DEFAULT_MIN_SAMPLE_SIZE,
            monte_carlo_samples: MONTE_CARLO_SAMPLES,
        }
    }
}

impl EngineConfig {
    pub fn new(salt: &str) -> Self {
        Self { salt: salt.to_string(), ..Self::default() }
    }

    /// Load from environment variables with production safety checks.
    ///
    /// - `EXP_SALT`: allocation-key salt (required in production)
    /// - `EXP_CONFIDENCE_THRESHOLD`: winner-detection threshold
    /// - `EXP_MIN_SAMPLE_SIZE`: minimum per-variant sample size
    /// - `EXP_MONTE_CARLO_SAMPLES`: Bayesian posterior draws
    ///
    /// In production mode (`EXP_ENV=production`), warns loudly if the
    /// salt is left at the development default: every deployment would
    /// bucket users identically and predictably.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(salt) = env::var("EXP_SALT") {
            if !salt.trim().is_empty() {
                config.salt = salt;
            }
        }

        if let Ok(val) = env::var("EXP_CONFIDENCE_THRESHOLD") {
            if let Ok(n) = val.parse::<f64>() {
                config.confidence_threshold = n.clamp(0.5, 0.999);
            }
        }

        if let Ok(val) = env::var("EXP_MIN_SAMPLE_SIZE") {
            if let Ok(n) = val.parse() {
                config.min_sample_size = n;
            }
        }

        if let Ok(val) = env::var("EXP_MONTE_CARLO_SAMPLES") {
            if let Ok(n) = val.parse::<usize>() {
                config.monte_carlo_samples = n.max(1000);
            }
        }

        let is_production = env::var("EXP_ENV")
            .map(|v| {
                let v = v.to_lowercase();
                v == "production" || v == "prod"
            })
            .unwrap_or(false);

        if is_production && config.salt == DEV_SALT {
            tracing::warn!(
                "PRODUCTION WARNING: allocation salt is the development default. \
                 Set EXP_SALT to a deployment secret."
            );
        }

        config
    }
}
