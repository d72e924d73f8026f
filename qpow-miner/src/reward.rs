//! Process-reward scoring of header hashes

use qpow_core::{digest_high_u64, Digest512, Target};

/// Reward for a hash that meets its target
pub const SUCCESS_REWARD: f64 = 100.0;

/// Scale of the proximity reward
pub const PROXIMITY_SCALE: f64 = 10.0;

/// Bonus added to every evaluated hash
pub const EXPLORATION_BONUS: f64 = 0.01;

/// Scores a candidate hash against the target
pub trait RewardModel: Send + Sync {
    /// Higher is better; success must score strictly above any miss
    fn score(&self, hash: &Digest512, target: &Target) -> f64;
}

/// `100` on success, otherwise `10 * (1 - min(1, h / 2t)) + 0.01` over the
/// high 64 bits of hash and target
#[derive(Debug, Clone, Copy, Default)]
pub struct ProximityReward;

impl RewardModel for ProximityReward {
    fn score(&self, hash: &Digest512, target: &Target) -> f64 {
        if target.is_met_by(hash) {
            return SUCCESS_REWARD;
        }

        let h = digest_high_u64(hash) as f64;
        let t = target.high_u64() as f64;
        let ratio = if t == 0.0 { 1.0 } else { (h / (2.0 * t)).min(1.0) };
        PROXIMITY_SCALE * (1.0 - ratio) + EXPLORATION_BONUS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_with_high(high: u64) -> Digest512 {
        let mut digest = [0xffu8; 64];
        digest[..8].copy_from_slice(&high.to_be_bytes());
        digest
    }

    #[test]
    fn test_success_scores_hundred() {
        let target = Target::from_compact(0x207f_ffff).unwrap();
        assert_eq!(ProximityReward.score(&[0u8; 64], &target), SUCCESS_REWARD);
    }

    #[test]
    fn test_far_miss_scores_bonus_only() {
        let target = Target::from_compact(0x1d00_ffff).unwrap();
        let score = ProximityReward.score(&digest_with_high(u64::MAX), &target);
        assert!((score - EXPLORATION_BONUS).abs() < 1e-12);
    }

    #[test]
    fn test_near_miss_scores_between() {
        let target = Target::from_compact(0x2000_ffff).unwrap();
        // Just above the target: h is about t, so the score is about 5
        let near = digest_with_high(target.high_u64() + 1);
        let score = ProximityReward.score(&near, &target);
        assert!(score > 4.9 && score < 5.1, "score {score}");
    }

    #[test]
    fn test_closer_scores_higher() {
        let target = Target::from_compact(0x2000_ffff).unwrap();
        let t = target.high_u64();
        let closer = ProximityReward.score(&digest_with_high(t + 10), &target);
        let farther = ProximityReward.score(&digest_with_high(t + t / 2), &target);
        assert!(closer > farther);
    }

    #[test]
    fn test_zero_target_never_divides() {
        let target = Target::from_leading_zero_bits(256);
        let score = ProximityReward.score(&digest_with_high(5), &target);
        assert!((score - EXPLORATION_BONUS).abs() < 1e-12);
    }
}
