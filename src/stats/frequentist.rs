//! Frequentist hypothesis testing
//!
//! Two-proportion Z-test, Welch's t-test, sample-size and power
//! calculations, and winner detection over variant aggregates. CDFs and
//! quantiles come from statrs rather than lookup tables, so p-values are
//! exact to floating-point precision.

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};

use crate::constants::{
    DEFAULT_POWER, MAX_FEASIBLE_DURATION_DAYS, MAX_FEASIBLE_SAMPLE_SIZE,
};
use crate::errors::{StatisticalError, StatsResult};
use crate::stats::{normal_cdf, normal_quantile, relative_lift};

/// Alternative hypothesis direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Alternative {
    TwoSided,
    /// Treatment rate greater than control
    Greater,
    /// Treatment rate less than control
    Less,
}

/// Result of a two-proportion Z-test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZTestResult {
    pub control_rate: f64,
    pub treatment_rate: f64,
    pub z_score: f64,
    pub p_value: f64,
    /// Confidence interval for the difference in proportions
    /// (unpooled standard error)
    pub confidence_interval: (f64, f64),
    /// Cohen's h
    pub effect_size: f64,
    /// (p2 - p1) / p1; +inf when p1 = 0 and p2 > 0
    pub relative_lift: f64,
    pub is_significant: bool,
    pub confidence_level: f64,
}

/// Two-proportion Z-test with pooled standard error for the statistic
/// and unpooled standard error for the interval.
pub fn z_test(
    control_conversions: u64,
    control_n: u64,
    treatment_conversions: u64,
    treatment_n: u64,
    confidence_level: f64,
    alternative: Alternative,
) -> StatsResult<ZTestResult> {
    if control_n == 0 || treatment_n == 0 {
        return Err(StatisticalError::ZeroSampleSize);
    }
    validate_level("confidence_level", confidence_level)?;

    let n1 = control_n as f64;
    let n2 = treatment_n as f64;
    let p1 = control_conversions as f64 / n1;
    let p2 = treatment_conversions as f64 / n2;

    let pooled = (control_conversions + treatment_conversions) as f64 / (n1 + n2);
    let se_pooled = (pooled * (1.0 - pooled) * (1.0 / n1 + 1.0 / n2)).sqrt();
    if se_pooled == 0.0 {
        // Both proportions at 0 or both at 1: no variability to test.
        return Err(StatisticalError::ZeroStandardError);
    }

    let z = (p2 - p1) / se_pooled;
    let p_value = p_value_for(z, alternative, normal_cdf);

    let alpha = 1.0 - confidence_level;
    let z_crit = normal_quantile(1.0 - alpha / 2.0);
    let se_unpooled = (p1 * (1.0 - p1) / n1 + p2 * (1.0 - p2) / n2).sqrt();
    let diff = p2 - p1;
    let confidence_interval = (diff - z_crit * se_unpooled, diff + z_crit * se_unpooled);

    let cohens_h = 2.0 * p2.sqrt().asin() - 2.0 * p1.sqrt().asin();

    Ok(ZTestResult {
        control_rate: p1,
        treatment_rate: p2,
        z_score: z,
        p_value,
        confidence_interval,
        effect_size: cohens_h,
        relative_lift: relative_lift(p1, p2),
        is_significant: p_value < alpha,
        confidence_level,
    })
}

/// Result of a Welch's t-test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TTestResult {
    pub t_score: f64,
    /// Welch-Satterthwaite degrees of freedom
    pub degrees_of_freedom: f64,
    pub p_value: f64,
    pub confidence_interval: (f64, f64),
    /// Cohen's d with pooled standard deviation
    pub effect_size: f64,
    pub relative_lift: f64,
    pub is_significant: bool,
    pub confidence_level: f64,
}

/// Welch's unequal-variance t-test on per-group summary statistics.
#[allow(clippy::too_many_arguments)]
pub fn t_test(
    control_mean: f64,
    control_std: f64,
    control_n: u64,
    treatment_mean: f64,
    treatment_std: f64,
    treatment_n: u64,
    confidence_level: f64,
    alternative: Alternative,
) -> StatsResult<TTestResult> {
    if control_n == 0 || treatment_n == 0 {
        return Err(StatisticalError::ZeroSampleSize);
    }
    if control_std == 0.0 && treatment_std == 0.0 {
        return Err(StatisticalError::ZeroVariance);
    }
    validate_level("confidence_level", confidence_level)?;

    let n1 = control_n as f64;
    let n2 = treatment_n as f64;
    let var1 = control_std * control_std;
    let var2 = treatment_std * treatment_std;

    let se_sq = var1 / n1 + var2 / n2;
    let se = se_sq.sqrt();

    // Welch-Satterthwaite approximation. Guard the n=1 denominators.
    let denom1 = if n1 > 1.0 { (var1 / n1).powi(2) / (n1 - 1.0) } else { f64::INFINITY };
    let denom2 = if n2 > 1.0 { (var2 / n2).powi(2) / (n2 - 1.0) } else { f64::INFINITY };
    let df = if denom1.is_infinite() && denom2.is_infinite() {
        1.0
    } else {
        se_sq * se_sq / (denom1 + denom2)
    };

    let t = (treatment_mean - control_mean) / se;

    // Student-t CDF for small df, normal approximation past 30.
    let (p_value, crit) = if df > 30.0 {
        let alpha = 1.0 - confidence_level;
        (p_value_for(t, alternative, normal_cdf), normal_quantile(1.0 - alpha / 2.0))
    } else {
        let dist = StudentsT::new(0.0, 1.0, df).map_err(|_| {
            StatisticalError::InvalidParameter { name: "degrees_of_freedom", value: df }
        })?;
        let cdf = |x: f64| dist.cdf(x);
        let alpha = 1.0 - confidence_level;
        (p_value_for(t, alternative, cdf), dist.inverse_cdf(1.0 - alpha / 2.0))
    };

    let diff = treatment_mean - control_mean;
    let confidence_interval = (diff - crit * se, diff + crit * se);

    // Cohen's d via pooled standard deviation.
    let pooled_var = if n1 + n2 > 2.0 {
        ((n1 - 1.0) * var1 + (n2 - 1.0) * var2) / (n1 + n2 - 2.0)
    } else {
        (var1 + var2) / 2.0
    };
    let cohens_d = if pooled_var > 0.0 { diff / pooled_var.sqrt() } else { 0.0 };

    let alpha = 1.0 - confidence_level;
    Ok(TTestResult {
        t_score: t,
        degrees_of_freedom: df,
        p_value,
        confidence_interval,
        effect_size: cohens_d,
        relative_lift: relative_lift(control_mean, treatment_mean),
        is_significant: p_value < alpha,
        confidence_level,
    })
}

/// Sample-size plan for a two-proportion test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleSizePlan {
    /// Required sample size per group
    pub per_group: u64,
    pub total: u64,
    /// Expected treatment rate under the minimum detectable effect
    pub expected_treatment_rate: f64,
    /// Days to collect `total` users at the assumed daily traffic
    pub estimated_duration_days: u64,
    /// Linearly decaying score in [0, 1]; 0 means the test is infeasible
    /// within the configured user-volume and duration caps
    pub feasibility_score: f64,
}

/// Per-group sample size via the standard two-proportion formula.
///
/// `mde` is relative (fraction of baseline) when `relative_mde`, absolute
/// otherwise. `daily_traffic` is the experiment-wide arrival rate used
/// for the duration estimate.
pub fn sample_size(
    baseline_rate: f64,
    mde: f64,
    relative_mde: bool,
    significance_level: f64,
    power: f64,
    daily_traffic: f64,
) -> StatsResult<SampleSizePlan> {
    if !(0.0..1.0).contains(&baseline_rate) || baseline_rate == 0.0 {
        return Err(StatisticalError::InvalidParameter {
            name: "baseline_rate",
            value: baseline_rate,
        });
    }
    validate_level("power", power)?;
    if !(0.0..1.0).contains(&significance_level) || significance_level == 0.0 {
        return Err(StatisticalError::InvalidParameter {
            name: "significance_level",
            value: significance_level,
        });
    }
    if daily_traffic <= 0.0 {
        return Err(StatisticalError::InvalidParameter {
            name: "daily_traffic",
            value: daily_traffic,
        });
    }

    let p1 = baseline_rate;
    let p2 = if relative_mde { p1 * (1.0 + mde) } else { p1 + mde };
    if !(0.0..1.0).contains(&p2) || p2 == p1 {
        return Err(StatisticalError::InvalidParameter { name: "mde", value: mde });
    }

    let z_alpha = normal_quantile(1.0 - significance_level / 2.0);
    let z_beta = normal_quantile(power);

    let numerator = (z_alpha + z_beta).powi(2) * (p1 * (1.0 - p1) + p2 * (1.0 - p2));
    let per_group = (numerator / (p2 - p1).powi(2)).ceil() as u64;
    let total = per_group * 2;

    let duration_days = (total as f64 / daily_traffic).ceil() as u64;

    let volume_ratio = per_group as f64 / MAX_FEASIBLE_SAMPLE_SIZE;
    let duration_ratio = duration_days as f64 / MAX_FEASIBLE_DURATION_DAYS;
    let feasibility_score = (1.0 - volume_ratio.max(duration_ratio)).clamp(0.0, 1.0);

    Ok(SampleSizePlan {
        per_group,
        total,
        expected_treatment_rate: p2,
        estimated_duration_days: duration_days,
        feasibility_score,
    })
}

/// Achieved power at the observed sample sizes, plus what is still needed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerAnalysis {
    pub achieved_power: f64,
    /// Per-group sample size to reach 80% power at the observed effect;
    /// None when the observed effect is zero (no target exists)
    pub needed_per_group: Option<u64>,
}

/// Power actually achieved by the observed counts.
pub fn power_analysis(
    control_conversions: u64,
    control_n: u64,
    treatment_conversions: u64,
    treatment_n: u64,
    significance_level: f64,
) -> StatsResult<PowerAnalysis> {
    if control_n == 0 || treatment_n == 0 {
        return Err(StatisticalError::ZeroSampleSize);
    }

    let n1 = control_n as f64;
    let n2 = treatment_n as f64;
    let p1 = control_conversions as f64 / n1;
    let p2 = treatment_conversions as f64 / n2;

    let se = (p1 * (1.0 - p1) / n1 + p2 * (1.0 - p2) / n2).sqrt();
    if se == 0.0 {
        return Err(StatisticalError::ZeroStandardError);
    }

    let z_alpha = normal_quantile(1.0 - significance_level / 2.0);
    let achieved_power = normal_cdf((p2 - p1).abs() / se - z_alpha).clamp(0.0, 1.0);

    let needed_per_group = if p2 == p1 {
        None
    } else {
        let z_beta = normal_quantile(DEFAULT_POWER);
        let numerator = (z_alpha + z_beta).powi(2) * (p1 * (1.0 - p1) + p2 * (1.0 - p2));
        Some((numerator / (p2 - p1).powi(2)).ceil() as u64)
    };

    Ok(PowerAnalysis { achieved_power, needed_per_group })
}

/// Aggregate counts for one variant, input to winner detection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantCounts {
    pub name: String,
    pub is_control: bool,
    pub conversions: u64,
    pub participants: u64,
}

/// One variant-vs-control comparison inside a winner report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantComparison {
    pub variant: String,
    /// 1 - p_value from the Z-test against control
    pub confidence: f64,
    pub relative_lift: f64,
    /// Both groups reached the minimum sample size and the test ran
    pub tested: bool,
}

/// Winner detection report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WinnerResult {
    pub has_winner: bool,
    pub winner: Option<String>,
    /// The variant used as baseline
    pub control: String,
    pub comparisons: Vec<VariantComparison>,
}

/// Designate a control, test every other variant against it, and declare
/// a winner only when some variant's confidence strictly exceeds the
/// threshold AND its lift is positive. Ties and sub-threshold results
/// report no winner rather than guessing.
pub fn detect_winner(
    variants: &[VariantCounts],
    confidence_threshold: f64,
    min_sample_size: u64,
) -> StatsResult<WinnerResult> {
    if variants.len() < 2 {
        return Err(StatisticalError::InsufficientVariants { needed: 2, got: variants.len() });
    }

    // Marked control wins; otherwise the variant with the most
    // participants serves as baseline.
    let control = variants
        .iter()
        .find(|v| v.is_control)
        .or_else(|| variants.iter().max_by_key(|v| v.participants))
        .ok_or(StatisticalError::InsufficientVariants { needed: 2, got: 0 })?;

    let mut comparisons = Vec::with_capacity(variants.len() - 1);
    let mut best: Option<(&VariantCounts, f64, f64)> = None;

    for candidate in variants.iter().filter(|v| v.name != control.name) {
        let enough = candidate.participants >= min_sample_size
            && control.participants >= min_sample_size;

        if !enough {
            comparisons.push(VariantComparison {
                variant: candidate.name.clone(),
                confidence: 0.0,
                relative_lift: 0.0,
                tested: false,
            });
            continue;
        }

        let test = z_test(
            control.conversions,
            control.participants,
            candidate.conversions,
            candidate.participants,
            confidence_threshold,
            Alternative::TwoSided,
        );

        // Degenerate pairs (both rates identical at the boundary) simply
        // produce no evidence; they are not a caller bug here.
        let (confidence, lift) = match test {
            Ok(result) => (1.0 - result.p_value, result.relative_lift),
            Err(StatisticalError::ZeroStandardError) => (0.0, 0.0),
            Err(err) => return Err(err),
        };

        comparisons.push(VariantComparison {
            variant: candidate.name.clone(),
            confidence,
            relative_lift: lift,
            tested: true,
        });

        if confidence > confidence_threshold && lift > 0.0 {
            let better = match best {
                Some((_, best_conf, _)) => confidence > best_conf,
                None => true,
            };
            if better {
                best = Some((candidate, confidence, lift));
            }
        }
    }

    Ok(WinnerResult {
        has_winner: best.is_some(),
        winner: best.map(|(v, _, _)| v.name.clone()),
        control: control.name.clone(),
        comparisons,
    })
}

/// Tail probability for a test statistic under the given alternative.
fn p_value_for(statistic: f64, alternative: Alternative, cdf: impl Fn(f64) -> f64) -> f64 {
    match alternative {
        Alternative::TwoSided => 2.0 * (1.0 - cdf(statistic.abs())),
        Alternative::Greater => 1.0 - cdf(statistic),
        Alternative::Less => cdf(statistic),
    }
}

fn validate_level(name: &'static str, value: f64) -> StatsResult<()> {
    if !(0.0..1.0).contains(&value) || value == 0.0 {
        return Err(StatisticalError::InvalidParameter { name, value });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_z_test_zero_sample_fails() {
        assert_eq!(
            z_test(0, 0, 5, 100, 0.95, Alternative::TwoSided).unwrap_err(),
            StatisticalError::ZeroSampleSize
        );
    }

    #[test]
    fn test_z_test_degenerate_proportions_fail() {
        // Both groups at zero conversions: pooled SE is zero.
        assert_eq!(
            z_test(0, 100, 0, 100, 0.95, Alternative::TwoSided).unwrap_err(),
            StatisticalError::ZeroStandardError
        );
    }

    #[test]
    fn test_one_sided_p_value_is_half_of_two_sided() {
        let two = z_test(50, 1000, 65, 1000, 0.95, Alternative::TwoSided).unwrap();
        let one = z_test(50, 1000, 65, 1000, 0.95, Alternative::Greater).unwrap();
        assert!((two.p_value - 2.0 * one.p_value).abs() < 1e-12);
    }

    #[test]
    fn test_t_test_zero_variance_fails() {
        assert_eq!(
            t_test(1.0, 0.0, 50, 1.0, 0.0, 50, 0.95, Alternative::TwoSided).unwrap_err(),
            StatisticalError::ZeroVariance
        );
    }

    #[test]
    fn test_t_test_large_sample_matches_z() {
        // With df >> 30 the Welch test uses the normal approximation, so
        // a 2-sigma difference lands near p = 0.045.
        let result =
            t_test(10.0, 5.0, 1000, 10.45, 5.0, 1000, 0.95, Alternative::TwoSided).unwrap();
        assert!(result.degrees_of_freedom > 30.0);
        assert!(result.p_value < 0.05);
        assert!(result.p_value > 0.02);
    }

    #[test]
    fn test_sample_size_known_case() {
        // Baseline 10%, +20% relative MDE, alpha 0.05, power 0.8:
        // the standard formula gives ~3,800 per group.
        let plan = sample_size(0.10, 0.20, true, 0.05, 0.80, 1000.0).unwrap();
        assert!(plan.per_group > 3_000 && plan.per_group < 4_500, "n={}", plan.per_group);
        assert_eq!(plan.total, plan.per_group * 2);
        assert!((plan.expected_treatment_rate - 0.12).abs() < 1e-12);
        assert!(plan.feasibility_score > 0.8);
    }

    #[test]
    fn test_sample_size_feasibility_decays() {
        // A tiny MDE needs a huge sample; feasibility collapses to 0.
        let plan = sample_size(0.10, 0.01, true, 0.05, 0.80, 100.0).unwrap();
        assert!(plan.per_group > 50_000);
        assert_eq!(plan.feasibility_score, 0.0);
    }

    #[test]
    fn test_power_analysis_more_data_more_power() {
        let small = power_analysis(50, 1000, 65, 1000, 0.05).unwrap();
        let large = power_analysis(500, 10_000, 650, 10_000, 0.05).unwrap();
        assert!(large.achieved_power > small.achieved_power);
        assert!(small.needed_per_group.is_some());
    }

    #[test]
    fn test_detect_winner_needs_two_variants() {
        let one = vec![VariantCounts {
            name: "a".to_string(),
            is_control: true,
            conversions: 10,
            participants: 100,
        }];
        assert!(matches!(
            detect_winner(&one, 0.95, 100).unwrap_err(),
            StatisticalError::InsufficientVariants { .. }
        ));
    }

    #[test]
    fn test_detect_winner_skips_small_samples() {
        let variants = vec![
            VariantCounts {
                name: "control".to_string(),
                is_control: true,
                conversions: 5,
                participants: 50,
            },
            VariantCounts {
                name: "treatment".to_string(),
                is_control: false,
                conversions: 20,
                participants: 50,
            },
        ];
        let result = detect_winner(&variants, 0.95, 100).unwrap();
        assert!(!result.has_winner);
        assert!(!result.comparisons[0].tested);
    }
}
