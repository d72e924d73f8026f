//! qPoW Miner - nonce search over candidate blocks
//!
//! Two strategies implement the [`Miner`] capability: a Monte Carlo tree
//! search guided by a process-reward model, and a plain sequential scan used
//! as the baseline. Both write the nonce they settle on back into the
//! candidate header.

pub mod actions;
pub mod decomposition;
pub mod enumeration;
pub mod mcts;
pub mod reward;

pub use actions::NonceMove;
pub use decomposition::{SubProblem, SubProblemReport, SubProblemStatus};
pub use enumeration::EnumerationMiner;
pub use mcts::{MctsConfig, MctsMiner};
pub use reward::{ProximityReward, RewardModel};

use qpow_consensus::Block;
use qpow_core::Digest512;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Limits on one mining attempt
#[derive(Debug, Clone)]
pub struct MiningBudget {
    /// Maximum hash evaluations
    pub max_iterations: u64,

    /// Wall-clock limit
    pub time_limit: Duration,

    /// Cleared by the owner to stop the search early
    pub running: Arc<AtomicBool>,
}

impl MiningBudget {
    /// Budget with a fresh running flag
    pub fn new(max_iterations: u64, time_limit: Duration) -> Self {
        Self {
            max_iterations,
            time_limit,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Share an existing running flag
    pub fn with_running(mut self, running: Arc<AtomicBool>) -> Self {
        self.running = running;
        self
    }

    /// Whether the owner still wants the search to continue
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

impl Default for MiningBudget {
    fn default() -> Self {
        Self::new(10_000, Duration::from_secs(10))
    }
}

/// Outcome of one mining attempt
#[derive(Debug, Clone)]
pub struct MiningResult {
    /// Whether the header now meets its target
    pub success: bool,

    /// Nonce written back to the candidate
    pub nonce: u32,

    /// Header hash at that nonce
    pub hash: Digest512,

    /// Best reward observed
    pub score: f64,

    /// Hash evaluations performed
    pub iterations: u64,

    /// Wall-clock time spent
    pub elapsed: Duration,
}

/// Capability shared by nonce-search strategies
pub trait Miner: Send {
    /// Search for a nonce that makes `candidate` meet its target
    ///
    /// Exhausting the budget is not an error; the result reports
    /// `success = false` and the best nonce found is written back.
    fn mine(&mut self, candidate: &mut Block, budget: &MiningBudget) -> MiningResult;
}
