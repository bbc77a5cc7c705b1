//! Multi-armed bandit allocation: UCB1 and Thompson Sampling
//!
//! Bandit strategies trade exploration for exploitation when the goal is
//! maximizing reward during the test rather than a clean hypothesis test
//! afterwards. UCB1 is deterministic given the counts; Thompson Sampling
//! draws one Beta posterior sample per arm per call through the Bayesian
//! module's posterior type.

use rand::Rng;
use rand_distr::Distribution;
use serde::{Deserialize, Serialize};

use crate::errors::{StatisticalError, StatsResult};
use crate::stats::bayesian::BetaPosterior;

/// Observed pull/reward totals for one arm (arbitrary-valued rewards)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArmStats {
    pub name: String,
    pub pulls: u64,
    pub total_reward: f64,
}

impl ArmStats {
    pub fn mean_reward(&self) -> f64 {
        if self.pulls == 0 {
            0.0
        } else {
            self.total_reward / self.pulls as f64
        }
    }
}

/// Per-arm UCB1 scoring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ucb1Arm {
    pub name: String,
    pub mean_reward: f64,
    /// mean + c * sqrt(ln(total_pulls) / pulls); infinite for unplayed
    /// arms so every arm is explored at least once
    pub confidence_bound: f64,
    /// pulls * (best observed mean - this arm's mean)
    pub regret: f64,
}

/// UCB1 ranking over all arms
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ucb1Result {
    pub arms: Vec<Ucb1Arm>,
    /// Arm with the highest confidence bound
    pub recommended: String,
    pub total_regret: f64,
}

/// Rank arms by upper confidence bound.
pub fn ucb1(arms: &[ArmStats], exploration_param: f64) -> StatsResult<Ucb1Result> {
    if arms.len() < 2 {
        return Err(StatisticalError::InsufficientVariants { needed: 2, got: arms.len() });
    }
    if exploration_param <= 0.0 {
        return Err(StatisticalError::InvalidParameter {
            name: "exploration_param",
            value: exploration_param,
        });
    }

    let total_pulls: u64 = arms.iter().map(|a| a.pulls).sum();
    // Best observed mean among played arms only; rewards may be negative,
    // so an empty fold must not invent a zero-mean arm.
    let best_mean = arms
        .iter()
        .filter(|a| a.pulls > 0)
        .map(|a| a.mean_reward())
        .fold(f64::NEG_INFINITY, f64::max);

    let mut scored = Vec::with_capacity(arms.len());
    let mut total_regret = 0.0;

    for arm in arms {
        let mean = arm.mean_reward();
        let confidence_bound = if arm.pulls == 0 {
            f64::INFINITY
        } else {
            mean + exploration_param * ((total_pulls as f64).ln() / arm.pulls as f64).sqrt()
        };
        // Unplayed arms accrue no regret; with no played arms at all,
        // best_mean is -inf and this guard keeps regret finite.
        let regret = if arm.pulls == 0 { 0.0 } else { arm.pulls as f64 * (best_mean - mean) };
        total_regret += regret;
        scored.push(Ucb1Arm { name: arm.name.clone(), mean_reward: mean, confidence_bound, regret });
    }

    let recommended = scored
        .iter()
        .max_by(|a, b| {
            a.confidence_bound
                .partial_cmp(&b.confidence_bound)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|a| a.name.clone())
        .ok_or(StatisticalError::InsufficientVariants { needed: 2, got: 0 })?;

    Ok(Ucb1Result { arms: scored, recommended, total_regret })
}

/// Binary-reward counts for one Thompson arm
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryArm {
    pub name: String,
    pub successes: u64,
    pub pulls: u64,
}

/// One posterior draw per arm
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThompsonDraw {
    pub name: String,
    pub sample: f64,
    pub posterior_mean: f64,
}

/// Thompson Sampling outcome for one selection round
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThompsonResult {
    pub draws: Vec<ThompsonDraw>,
    /// Arm whose posterior sample was highest this round
    pub recommended: String,
}

/// Draw one Beta posterior sample per arm; the highest draw is the
/// recommended pull. Successive calls with a fresh RNG state naturally
/// allocate traffic in proportion to each arm's probability of being
/// the best.
pub fn thompson_sampling<R: Rng + ?Sized>(
    arms: &[BinaryArm],
    prior: (f64, f64),
    rng: &mut R,
) -> StatsResult<ThompsonResult> {
    if arms.len() < 2 {
        return Err(StatisticalError::InsufficientVariants { needed: 2, got: arms.len() });
    }

    let mut draws = Vec::with_capacity(arms.len());
    for arm in arms {
        let posterior = BetaPosterior::from_counts(prior.0, prior.1, arm.successes, arm.pulls)?;
        let dist = rand_distr::Beta::new(posterior.alpha, posterior.beta).map_err(|_| {
            StatisticalError::InvalidParameter { name: "posterior", value: posterior.alpha }
        })?;
        draws.push(ThompsonDraw {
            name: arm.name.clone(),
            sample: dist.sample(rng),
            posterior_mean: posterior.mean(),
        });
    }

    let recommended = draws
        .iter()
        .max_by(|a, b| a.sample.partial_cmp(&b.sample).unwrap_or(std::cmp::Ordering::Equal))
        .map(|d| d.name.clone())
        .ok_or(StatisticalError::InsufficientVariants { needed: 2, got: 0 })?;

    Ok(ThompsonResult { draws, recommended })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn arm(name: &str, pulls: u64, total_reward: f64) -> ArmStats {
        ArmStats { name: name.to_string(), pulls, total_reward }
    }

    #[test]
    fn test_ucb1_unplayed_arm_has_priority() {
        let arms = vec![arm("a", 100, 30.0), arm("b", 0, 0.0)];
        let result = ucb1(&arms, std::f64::consts::SQRT_2).unwrap();
        assert_eq!(result.recommended, "b");
        assert!(result.arms[1].confidence_bound.is_infinite());
    }

    #[test]
    fn test_ucb1_exploits_clear_leader() {
        // Both arms well-sampled; the better arm's bound dominates.
        let arms = vec![arm("a", 500, 50.0), arm("b", 500, 150.0)];
        let result = ucb1(&arms, std::f64::consts::SQRT_2).unwrap();
        assert_eq!(result.recommended, "b");
    }

    #[test]
    fn test_ucb1_regret_accounting() {
        let arms = vec![arm("best", 100, 50.0), arm("worse", 200, 60.0)];
        let result = ucb1(&arms, std::f64::consts::SQRT_2).unwrap();
        // best mean = 0.5; worse mean = 0.3; regret = 200 * 0.2 = 40.
        let worse = result.arms.iter().find(|a| a.name == "worse").unwrap();
        assert!((worse.regret - 40.0).abs() < 1e-9);
        assert!((result.total_regret - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_ucb1_regret_with_negative_rewards() {
        // Rewards may be arbitrary-valued (costs, losses). The baseline
        // for regret is the best played arm's mean, not zero.
        let arms = vec![arm("less_bad", 10, -5.0), arm("worse", 10, -10.0)];
        let result = ucb1(&arms, std::f64::consts::SQRT_2).unwrap();
        let less_bad = result.arms.iter().find(|a| a.name == "less_bad").unwrap();
        let worse = result.arms.iter().find(|a| a.name == "worse").unwrap();
        assert_eq!(less_bad.regret, 0.0);
        // 10 pulls * (-0.5 - (-1.0)) mean gap.
        assert!((worse.regret - 5.0).abs() < 1e-9);
        assert!((result.total_regret - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_ucb1_all_unplayed_arms_have_zero_regret() {
        let arms = vec![arm("a", 0, 0.0), arm("b", 0, 0.0)];
        let result = ucb1(&arms, std::f64::consts::SQRT_2).unwrap();
        assert_eq!(result.total_regret, 0.0);
        assert!(result.arms.iter().all(|a| a.regret == 0.0));
        assert!(result.arms.iter().all(|a| a.confidence_bound.is_infinite()));
    }

    #[test]
    fn test_ucb1_needs_two_arms() {
        assert!(matches!(
            ucb1(&[arm("a", 10, 5.0)], 1.0).unwrap_err(),
            StatisticalError::InsufficientVariants { .. }
        ));
    }

    #[test]
    fn test_thompson_prefers_stronger_arm() {
        let arms = vec![
            BinaryArm { name: "weak".to_string(), successes: 10, pulls: 1000 },
            BinaryArm { name: "strong".to_string(), successes: 300, pulls: 1000 },
        ];
        let mut rng = StdRng::seed_from_u64(42);
        let mut strong_wins = 0;
        for _ in 0..100 {
            let result = thompson_sampling(&arms, (1.0, 1.0), &mut rng).unwrap();
            if result.recommended == "strong" {
                strong_wins += 1;
            }
        }
        // With this much separation the strong arm should win essentially
        // every round.
        assert!(strong_wins >= 99, "strong arm won only {strong_wins}/100");
    }

    #[test]
    fn test_thompson_uncertain_arms_both_get_picked() {
        let arms = vec![
            BinaryArm { name: "a".to_string(), successes: 2, pulls: 10 },
            BinaryArm { name: "b".to_string(), successes: 3, pulls: 10 },
        ];
        let mut rng = StdRng::seed_from_u64(42);
        let mut a_wins = 0;
        for _ in 0..200 {
            if thompson_sampling(&arms, (1.0, 1.0), &mut rng).unwrap().recommended == "a" {
                a_wins += 1;
            }
        }
        // Posterior overlap is large; both arms must still be explored.
        assert!(a_wins > 20 && a_wins < 180, "a won {a_wins}/200");
    }
}
