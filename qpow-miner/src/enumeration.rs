//! Sequential nonce scan, the baseline strategy

use crate::decomposition::{decompose, report, SubProblemReport};
use crate::reward::{ProximityReward, RewardModel};
use crate::{Miner, MiningBudget, MiningResult};
use qpow_consensus::Block;
use qpow_core::Digest512;
use std::time::Instant;
use tracing::{debug, warn};

/// Tries `nonce, nonce + 1, ...` from the candidate's current nonce
pub struct EnumerationMiner {
    reward: Box<dyn RewardModel>,
    last_report: Vec<SubProblemReport>,
}

impl EnumerationMiner {
    /// Scanner scoring with the proximity reward
    pub fn new() -> Self {
        Self {
            reward: Box::new(ProximityReward),
            last_report: Vec::new(),
        }
    }

    /// Sub-problem outcomes of the latest attempt
    pub fn last_report(&self) -> &[SubProblemReport] {
        &self.last_report
    }
}

impl Default for EnumerationMiner {
    fn default() -> Self {
        Self::new()
    }
}

impl Miner for EnumerationMiner {
    fn mine(&mut self, candidate: &mut Block, budget: &MiningBudget) -> MiningResult {
        let started = Instant::now();
        let problems = decompose(candidate);

        let Ok(target) = candidate.header.target() else {
            warn!(bits = candidate.header.bits, "Candidate carries invalid bits");
            self.last_report = report(&problems, false);
            return MiningResult {
                success: false,
                nonce: candidate.header.nonce,
                hash: candidate.header.hash(),
                score: 0.0,
                iterations: 0,
                elapsed: started.elapsed(),
            };
        };

        let mut nonce = candidate.header.nonce;
        let mut iterations = 0u64;
        let mut best: Option<(u32, Digest512, f64)> = None;
        let mut success;

        loop {
            candidate.header.nonce = nonce;
            let hash = candidate.header.hash();
            let score = self.reward.score(&hash, &target);
            iterations += 1;
            success = target.is_met_by(&hash);
            if success || best.map_or(true, |(_, _, s)| score > s) {
                best = Some((nonce, hash, score));
            }

            if success
                || iterations >= budget.max_iterations
                || started.elapsed() >= budget.time_limit
                || !budget.is_running()
            {
                break;
            }
            nonce = nonce.wrapping_add(1);
        }

        // The loop runs at least once
        let (nonce, hash, score) = best.unwrap_or((nonce, candidate.header.hash(), 0.0));
        candidate.header.nonce = nonce;
        self.last_report = report(&problems, success);
        let elapsed = started.elapsed();
        debug!(
            success,
            iterations,
            nonce,
            score,
            elapsed_ms = elapsed.as_millis() as u64,
            "Enumeration finished"
        );

        MiningResult {
            success,
            nonce,
            hash,
            score,
            iterations,
            elapsed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decomposition::SubProblemStatus;
    use qpow_consensus::Transaction;
    use qpow_core::Target;
    use std::time::Duration;

    fn candidate(bits: u32) -> Block {
        let txs = vec![Transaction::coinbase("miner", 50.0, 0).with_timestamp(7)];
        Block::genesis(txs, bits, 7).unwrap()
    }

    #[test]
    fn test_finds_first_valid_nonce() {
        let mut block = candidate(0x207f_ffff);
        let mut miner = EnumerationMiner::new();
        let result = miner.mine(&mut block, &MiningBudget::new(1_000, Duration::from_secs(10)));
        assert!(result.success);
        assert_eq!(block.header.nonce, result.nonce);
        assert!(block.header.meets_target());

        // No earlier nonce meets the target
        for nonce in 0..result.nonce {
            let mut probe = block.clone();
            probe.header.nonce = nonce;
            assert!(!probe.header.meets_target());
        }
        assert_eq!(miner.last_report()[0].status, SubProblemStatus::Solved);
    }

    #[test]
    fn test_exhausted_budget_keeps_best_nonce() {
        let target = Target::from_compact(0x0300_0001).unwrap();
        let mut block = candidate(0x0300_0001);
        block.header.nonce = 100;
        let result = EnumerationMiner::new().mine(&mut block, &MiningBudget::new(25, Duration::from_secs(10)));
        assert!(!result.success);
        assert_eq!(result.iterations, 25);
        assert!((100..125).contains(&result.nonce));

        // The reported state is the one left in the header
        assert_eq!(block.header.nonce, result.nonce);
        assert_eq!(block.header.hash(), result.hash);
        assert_eq!(ProximityReward.score(&result.hash, &target), result.score);

        // and no scanned nonce scores higher
        for nonce in 100..125 {
            let mut other = block.clone();
            other.header.nonce = nonce;
            assert!(ProximityReward.score(&other.header.hash(), &target) <= result.score);
        }
    }

    #[test]
    fn test_best_state_consistent_across_starts() {
        let target = Target::from_compact(0x2000_ffff).unwrap();
        for start in (0..50u32).map(|i| i * 1_000) {
            let mut block = candidate(0x2000_ffff);
            block.header.nonce = start;
            let result = EnumerationMiner::new().mine(&mut block, &MiningBudget::new(20, Duration::from_secs(10)));
            assert_eq!(ProximityReward.score(&result.hash, &target), result.score, "start {start}");
            assert_eq!(block.header.nonce, result.nonce);
        }
    }

    #[test]
    fn test_scan_wraps_at_max_nonce() {
        let mut block = candidate(0x0300_0001);
        block.header.nonce = u32::MAX;
        let result = EnumerationMiner::new().mine(&mut block, &MiningBudget::new(3, Duration::from_secs(10)));
        assert_eq!(result.iterations, 3);
        assert!([u32::MAX, 0, 1].contains(&result.nonce));
    }
}
