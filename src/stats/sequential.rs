//! Sequential testing: SPRT and O'Brien-Fleming group boundaries
//!
//! Both procedures let an experiment stop before its planned sample size
//! without inflating the false-positive rate. The SPRT monitors a
//! log-likelihood ratio continuously; O'Brien-Fleming adjusts the
//! significance boundary at a fixed number of interim looks, spending
//! almost no alpha early and relaxing toward the nominal critical value
//! as information accrues.

use serde::{Deserialize, Serialize};

use crate::errors::{StatisticalError, StatsResult};
use crate::stats::{normal_cdf, normal_quantile};

/// Early-stopping decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequentialDecision {
    StopForSuccess,
    StopForFutility,
    Continue,
}

/// Result of a sequential probability ratio test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SprtResult {
    pub log_likelihood_ratio: f64,
    /// log((1 - beta) / alpha): cross above to accept the alternative
    pub upper_boundary: f64,
    /// log(beta / (1 - alpha)): cross below to accept the null
    pub lower_boundary: f64,
    pub decision: SequentialDecision,
}

/// Wald's SPRT on binomial outcomes.
///
/// Null hypothesis: conversion rate equals `control_rate`. Alternative:
/// rate equals `control_rate + minimum_effect`.
pub fn sprt(
    conversions: u64,
    participants: u64,
    control_rate: f64,
    minimum_effect: f64,
    alpha: f64,
    beta: f64,
) -> StatsResult<SprtResult> {
    if participants == 0 {
        return Err(StatisticalError::ZeroSampleSize);
    }
    if conversions > participants {
        return Err(StatisticalError::InvalidParameter {
            name: "conversions",
            value: conversions as f64,
        });
    }
    let p0 = control_rate;
    let p1 = control_rate + minimum_effect;
    if !(0.0..1.0).contains(&p0) || p0 == 0.0 {
        return Err(StatisticalError::InvalidParameter { name: "control_rate", value: p0 });
    }
    if !(0.0..1.0).contains(&p1) || p1 == 0.0 {
        return Err(StatisticalError::InvalidParameter { name: "minimum_effect", value: p1 });
    }
    validate_rate("alpha", alpha)?;
    validate_rate("beta", beta)?;

    let x = conversions as f64;
    let n = participants as f64;
    let log_likelihood_ratio =
        x * (p1 / p0).ln() + (n - x) * ((1.0 - p1) / (1.0 - p0)).ln();

    let upper_boundary = ((1.0 - beta) / alpha).ln();
    let lower_boundary = (beta / (1.0 - alpha)).ln();

    let decision = if log_likelihood_ratio >= upper_boundary {
        SequentialDecision::StopForSuccess
    } else if log_likelihood_ratio <= lower_boundary {
        SequentialDecision::StopForFutility
    } else {
        SequentialDecision::Continue
    };

    Ok(SprtResult { log_likelihood_ratio, upper_boundary, lower_boundary, decision })
}

/// Result of an O'Brien-Fleming interim analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObrienFlemingResult {
    /// Fraction of planned information collected so far
    pub information_fraction: f64,
    /// Cumulative alpha spent by the spending function at this fraction
    pub alpha_spent: f64,
    /// |Z| must reach this to stop for efficacy
    pub efficacy_boundary: f64,
    /// |Z| below this stops for futility; None before the midpoint
    pub futility_boundary: Option<f64>,
    pub decision: SequentialDecision,
}

/// O'Brien-Fleming interim look.
///
/// The efficacy boundary is `z_{alpha/2} / sqrt(t)`: very tight at early
/// information fractions, relaxing to the nominal critical value at
/// `t = 1`. Futility is only evaluated past the midpoint of planned
/// analyses, with a boundary ramping linearly from 0 up to `z_beta`, so
/// an experiment can never be stopped for futility in its first half.
pub fn obrien_fleming(
    z_statistic: f64,
    analysis_number: u32,
    planned_analyses: u32,
    alpha: f64,
    beta: f64,
) -> StatsResult<ObrienFlemingResult> {
    if planned_analyses == 0 || analysis_number == 0 || analysis_number > planned_analyses {
        return Err(StatisticalError::InvalidParameter {
            name: "analysis_number",
            value: analysis_number as f64,
        });
    }
    validate_rate("alpha", alpha)?;
    validate_rate("beta", beta)?;

    let information_fraction = analysis_number as f64 / planned_analyses as f64;
    let z_alpha = normal_quantile(1.0 - alpha / 2.0);

    let efficacy_boundary = z_alpha / information_fraction.sqrt();
    let alpha_spent = 2.0 * (1.0 - normal_cdf(efficacy_boundary));

    let futility_boundary = if information_fraction > 0.5 {
        let z_beta = normal_quantile(1.0 - beta);
        Some(z_beta * (2.0 * information_fraction - 1.0))
    } else {
        None
    };

    let decision = if z_statistic.abs() >= efficacy_boundary {
        SequentialDecision::StopForSuccess
    } else if let Some(futility) = futility_boundary {
        if z_statistic.abs() < futility {
            SequentialDecision::StopForFutility
        } else {
            SequentialDecision::Continue
        }
    } else {
        SequentialDecision::Continue
    };

    Ok(ObrienFlemingResult {
        information_fraction,
        alpha_spent,
        efficacy_boundary,
        futility_boundary,
        decision,
    })
}

fn validate_rate(name: &'static str, value: f64) -> StatsResult<()> {
    if !(0.0..1.0).contains(&value) || value == 0.0 {
        return Err(StatisticalError::InvalidParameter { name, value });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sprt_boundaries() {
        // alpha = beta = 0.05: upper = ln(19) ~ 2.944, lower = -ln(19).
        let result = sprt(10, 100, 0.10, 0.05, 0.05, 0.05).unwrap();
        assert!((result.upper_boundary - 2.944).abs() < 0.01);
        assert!((result.lower_boundary + 2.944).abs() < 0.01);
    }

    #[test]
    fn test_sprt_high_conversions_stop_for_success() {
        // 30% observed against a 10% null and 15% alternative: the
        // likelihood ratio overwhelmingly favors the alternative.
        let result = sprt(300, 1000, 0.10, 0.05, 0.05, 0.05).unwrap();
        assert_eq!(result.decision, SequentialDecision::StopForSuccess);
    }

    #[test]
    fn test_sprt_null_rate_stops_for_futility() {
        let result = sprt(100, 1000, 0.10, 0.05, 0.05, 0.05).unwrap();
        assert_eq!(result.decision, SequentialDecision::StopForFutility);
    }

    #[test]
    fn test_sprt_ambiguous_continues() {
        // Observed rate halfway between the hypotheses on little data.
        let result = sprt(6, 50, 0.10, 0.05, 0.05, 0.05).unwrap();
        assert_eq!(result.decision, SequentialDecision::Continue);
    }

    #[test]
    fn test_obf_boundary_tightens_early() {
        let early = obrien_fleming(0.0, 1, 5, 0.05, 0.20).unwrap();
        let late = obrien_fleming(0.0, 5, 5, 0.05, 0.20).unwrap();
        assert!(early.efficacy_boundary > late.efficacy_boundary);
        // Final-look boundary is the nominal critical value.
        assert!((late.efficacy_boundary - 1.96).abs() < 0.01);
        assert!(early.alpha_spent < late.alpha_spent);
    }

    #[test]
    fn test_obf_no_futility_before_midpoint() {
        let result = obrien_fleming(0.0, 2, 5, 0.05, 0.20).unwrap();
        assert!(result.futility_boundary.is_none());
        assert_eq!(result.decision, SequentialDecision::Continue);
    }

    #[test]
    fn test_obf_futility_past_midpoint() {
        // z ~ 0 at 80% information: no hope of recovering significance.
        let result = obrien_fleming(0.05, 4, 5, 0.05, 0.20).unwrap();
        assert!(result.futility_boundary.is_some());
        assert_eq!(result.decision, SequentialDecision::StopForFutility);
    }

    #[test]
    fn test_obf_efficacy_stop() {
        let result = obrien_fleming(5.0, 2, 5, 0.05, 0.20).unwrap();
        assert_eq!(result.decision, SequentialDecision::StopForSuccess);
    }
}
