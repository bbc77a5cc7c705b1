//! Bayesian analysis: Beta-Binomial posteriors and Monte Carlo comparison
//!
//! The conjugate update is exact: posterior alpha' = prior alpha +
//! conversions, beta' = prior beta + failures. Probability of superiority
//! and expected loss come from a fixed-size Monte Carlo draw over both
//! posteriors; the Beta sampler is `rand_distr` (gamma-ratio construction
//! with Marsaglia-Tsang under the hood) rather than hand-rolled variates.
//!
//! The RNG is injected so callers and tests control determinism.

use rand::Rng;
use rand_distr::{Beta, Distribution};
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_PRIOR_ALPHA, DEFAULT_PRIOR_BETA, MONTE_CARLO_SAMPLES};
use crate::errors::{StatisticalError, StatsResult};
use crate::stats::normal_quantile;

/// A Beta posterior over a conversion rate
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BetaPosterior {
    pub alpha: f64,
    pub beta: f64,
}

impl BetaPosterior {
    /// Conjugate update from observed counts.
    pub fn from_counts(
        prior_alpha: f64,
        prior_beta: f64,
        conversions: u64,
        participants: u64,
    ) -> StatsResult<Self> {
        if prior_alpha <= 0.0 {
            return Err(StatisticalError::InvalidParameter {
                name: "prior_alpha",
                value: prior_alpha,
            });
        }
        if prior_beta <= 0.0 {
            return Err(StatisticalError::InvalidParameter {
                name: "prior_beta",
                value: prior_beta,
            });
        }
        if conversions > participants {
            return Err(StatisticalError::InvalidParameter {
                name: "conversions",
                value: conversions as f64,
            });
        }
        Ok(Self {
            alpha: prior_alpha + conversions as f64,
            beta: prior_beta + (participants - conversions) as f64,
        })
    }

    /// Uniform-prior shorthand: Beta(1, 1) updated with the counts.
    pub fn uniform_prior(conversions: u64, participants: u64) -> StatsResult<Self> {
        Self::from_counts(DEFAULT_PRIOR_ALPHA, DEFAULT_PRIOR_BETA, conversions, participants)
    }

    pub fn mean(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }

    pub fn variance(&self) -> f64 {
        let s = self.alpha + self.beta;
        (self.alpha * self.beta) / (s * s * (s + 1.0))
    }

    /// Credible interval via normal approximation around the posterior
    /// mean and variance. An approximation, not exact Beta quantiles;
    /// accurate once both parameters are reasonably large.
    pub fn credible_interval(&self, level: f64) -> (f64, f64) {
        let z = normal_quantile(1.0 - (1.0 - level) / 2.0);
        let sd = self.variance().sqrt();
        let mean = self.mean();
        ((mean - z * sd).max(0.0), (mean + z * sd).min(1.0))
    }

    fn sampler(&self) -> StatsResult<Beta<f64>> {
        Beta::new(self.alpha, self.beta).map_err(|_| StatisticalError::InvalidParameter {
            name: "posterior",
            value: self.alpha,
        })
    }
}

/// Result of a Bayesian two-variant comparison
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BayesianTestResult {
    pub control_posterior: BetaPosterior,
    pub treatment_posterior: BetaPosterior,
    /// Monte Carlo estimate of P(treatment rate > control rate)
    pub probability_treatment_better: f64,
    /// Mean over draws of max(0, control - treatment): the conversion
    /// rate given up if treatment ships and is actually worse
    pub expected_loss: f64,
    /// Mean relative lift over draws
    pub expected_lift: f64,
    /// 95% credible interval for the treatment posterior
    pub credible_interval: (f64, f64),
    /// Confident in either direction: probability >= 0.95 or <= 0.05
    pub is_significant: bool,
    pub samples: usize,
}

/// Compare two variants under Beta-Binomial posteriors.
///
/// `(conversions, participants)` per group; `samples` of 0 uses the
/// default draw count.
pub fn beta_binomial_test<R: Rng + ?Sized>(
    control: (u64, u64),
    treatment: (u64, u64),
    prior: (f64, f64),
    samples: usize,
    rng: &mut R,
) -> StatsResult<BayesianTestResult> {
    if control.1 == 0 || treatment.1 == 0 {
        return Err(StatisticalError::ZeroSampleSize);
    }
    let samples = if samples == 0 { MONTE_CARLO_SAMPLES } else { samples };

    let control_posterior = BetaPosterior::from_counts(prior.0, prior.1, control.0, control.1)?;
    let treatment_posterior =
        BetaPosterior::from_counts(prior.0, prior.1, treatment.0, treatment.1)?;

    let control_dist = control_posterior.sampler()?;
    let treatment_dist = treatment_posterior.sampler()?;

    let mut wins = 0usize;
    let mut loss_sum = 0.0;
    let mut lift_sum = 0.0;

    for _ in 0..samples {
        let c = control_dist.sample(rng);
        let t = treatment_dist.sample(rng);
        if t > c {
            wins += 1;
        }
        loss_sum += (c - t).max(0.0);
        // Beta draws are strictly positive for alpha > 0, so the ratio
        // is always finite here.
        lift_sum += (t - c) / c;
    }

    let probability_treatment_better = wins as f64 / samples as f64;

    Ok(BayesianTestResult {
        control_posterior,
        treatment_posterior,
        probability_treatment_better,
        expected_loss: loss_sum / samples as f64,
        expected_lift: lift_sum / samples as f64,
        credible_interval: treatment_posterior.credible_interval(0.95),
        is_significant: probability_treatment_better >= 0.95
            || probability_treatment_better <= 0.05,
        samples,
    })
}
