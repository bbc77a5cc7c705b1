//! Statistical analysis: frequentist, Bayesian, sequential, bandit
//!
//! Everything in this family is pure and read-only: functions take
//! aggregate counts (or per-arm summaries) and return results, with no
//! store access and no side effects. They may run concurrently with
//! allocation and event traffic; they simply see a slightly stale
//! snapshot.
//!
//! Degenerate inputs fail with [`crate::errors::StatisticalError`]
//! instead of leaking NaN into a result callers would mistake for a
//! finished test.

pub mod bandit;
pub mod bayesian;
pub mod frequentist;
pub mod sequential;

use statrs::function::erf;

/// Standard normal CDF via the complementary error function.
pub(crate) fn normal_cdf(x: f64) -> f64 {
    0.5 * erf::erfc(-x / std::f64::consts::SQRT_2)
}

/// Standard normal quantile (inverse CDF).
pub(crate) fn normal_quantile(p: f64) -> f64 {
    std::f64::consts::SQRT_2 * erf::erf_inv(2.0 * p - 1.0)
}

/// Relative lift convention used across the crate:
/// `+inf` when the baseline is zero and the treatment positive, `0` when
/// both are zero. Callers must expect non-finite values here.
pub fn relative_lift(baseline: f64, treatment: f64) -> f64 {
    if baseline == 0.0 {
        if treatment > 0.0 {
            f64::INFINITY
        } else {
            0.0
        }
    } else {
        (treatment - baseline) / baseline
    }
}
