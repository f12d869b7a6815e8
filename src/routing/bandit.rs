//! Bandit arm scoring.

use rand::Rng;
use rand_distr::{Beta, Distribution};

use crate::types::{BanditArmState, RoutingStrategy, UpstreamCandidate};

/// Exploitation score under epsilon-greedy: Laplace-smoothed success rate.
pub fn greedy_score(arm: &BanditArmState) -> f64 {
    arm.smoothed_success_rate()
}

/// One Thompson sample from the arm's Beta posterior.
pub fn thompson_sample<R: Rng + ?Sized>(arm: &BanditArmState, rng: &mut R) -> f64 {
    let alpha = arm.alpha.max(f64::MIN_POSITIVE);
    let beta = arm.beta.max(f64::MIN_POSITIVE);
    match Beta::new(alpha, beta) {
        Ok(dist) => dist.sample(rng),
        Err(_) => greedy_score(arm),
    }
}

/// Weighted-mode score: weight scaled down by observed failure share.
pub fn weighted_score(candidate: &UpstreamCandidate) -> f64 {
    let arm = &candidate.arm;
    let failure_rate = if arm.total_trials == 0 {
        0.0
    } else {
        arm.failures as f64 / arm.total_trials as f64
    };
    let penalty = (candidate.routing.failure_penalty * failure_rate).min(1.0);
    candidate.weight as f64 * (1.0 - penalty)
}

/// Score one candidate under `strategy`.
pub fn score<R: Rng + ?Sized>(
    candidate: &UpstreamCandidate,
    strategy: RoutingStrategy,
    rng: &mut R,
) -> f64 {
    match strategy {
        RoutingStrategy::EpsilonGreedy => greedy_score(&candidate.arm),
        RoutingStrategy::Thompson => thompson_sample(&candidate.arm, rng),
        RoutingStrategy::Weighted => weighted_score(candidate),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn cold_arm_scores_half() {
        let arm = BanditArmState::fresh("a");
        assert!((greedy_score(&arm) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn thompson_sample_stays_in_unit_interval() {
        let mut arm = BanditArmState::fresh("a");
        arm.alpha = 8.0;
        arm.beta = 2.0;
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let s = thompson_sample(&arm, &mut rng);
            assert!((0.0..=1.0).contains(&s));
        }
    }

    #[test]
    fn thompson_favors_successful_arm_on_average() {
        let mut good = BanditArmState::fresh("good");
        good.alpha = 90.0;
        good.beta = 10.0;
        let mut bad = BanditArmState::fresh("bad");
        bad.alpha = 10.0;
        bad.beta = 90.0;

        let mut rng = StdRng::seed_from_u64(42);
        let wins = (0..200)
            .filter(|_| thompson_sample(&good, &mut rng) > thompson_sample(&bad, &mut rng))
            .count();
        assert!(wins > 150, "good arm won only {wins}/200 draws");
    }
}
