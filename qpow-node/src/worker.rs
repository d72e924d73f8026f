//! Background mining on top of the local chain head
//!
//! Each attempt snapshots a candidate under the chain read lock, searches for
//! a nonce on a blocking thread, then re-takes the write lock and admits the
//! block only if the head has not moved in the meantime.

use crate::settings::MiningSettings;
use crate::{NodeError, Result};
use qpow_consensus::{Block, BlockId, ConsensusError};
use qpow_network::Node;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pause after an attempt that failed outright
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// What one mining attempt ended with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MiningOutcome {
    /// The block was admitted at `height` and propagated
    Admitted { height: u64, nonce: u32, iterations: u64 },

    /// The budget ran out before a valid nonce was found
    Exhausted { iterations: u64 },

    /// Another block extended the head while we were searching
    Stale,

    /// The chain refused the mined block
    Rejected(String),
}

/// Running totals for a worker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MiningStats {
    pub attempts: u64,
    pub admitted: u64,
    pub exhausted: u64,
    pub stale: u64,
    pub rejected: u64,
    pub iterations: u64,
}

impl MiningStats {
    fn record(&mut self, outcome: &MiningOutcome) {
        self.attempts += 1;
        match outcome {
            MiningOutcome::Admitted { iterations, .. } => {
                self.admitted += 1;
                self.iterations += iterations;
            }
            MiningOutcome::Exhausted { iterations } => {
                self.exhausted += 1;
                self.iterations += iterations;
            }
            MiningOutcome::Stale => self.stale += 1,
            MiningOutcome::Rejected(_) => self.rejected += 1,
        }
    }
}

pub struct MiningWorker {
    node: Arc<Node>,
    settings: MiningSettings,
    reward_address: String,
    running: Arc<AtomicBool>,
    stats: Mutex<MiningStats>,
}

impl MiningWorker {
    /// Worker mining on `node` and paying rewards to `reward_address`
    pub fn new(node: Arc<Node>, settings: MiningSettings, reward_address: impl Into<String>) -> Self {
        Self {
            node,
            settings,
            reward_address: reward_address.into(),
            running: Arc::new(AtomicBool::new(true)),
            stats: Mutex::new(MiningStats::default()),
        }
    }

    /// Whether the loop has not been stopped
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stop the loop; an attempt in flight returns at its next budget check
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Counters since the worker was created
    pub async fn stats(&self) -> MiningStats {
        self.stats.lock().await.clone()
    }

    /// Run attempts until stopped or the node shuts down
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let worker = Arc::clone(self);
        tokio::spawn(async move { worker.run().await })
    }

    pub async fn run(&self) {
        info!(node = %self.node.node_id(), miner = ?self.settings.miner, "Mining worker started");
        let mut attempt = 0u64;
        while self.is_running() && self.node.is_running() {
            match self.mine_once(attempt).await {
                Ok(outcome) => debug!(attempt, ?outcome, "Mining attempt finished"),
                Err(e) => {
                    warn!(attempt, error = %e, "Mining attempt failed");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
            attempt = attempt.wrapping_add(1);
            tokio::task::yield_now().await;
        }
        info!(node = %self.node.node_id(), "Mining worker stopped");
    }

    /// One candidate, one search, one admission attempt
    pub async fn mine_once(&self, attempt: u64) -> Result<MiningOutcome> {
        let (candidate, head, height) = self.make_candidate().await?;

        let mut miner = self.settings.build_miner(attempt);
        let budget = self.settings.budget().with_running(Arc::clone(&self.running));
        let (block, result) = tokio::task::spawn_blocking(move || {
            let mut block = candidate;
            let result = miner.mine(&mut block, &budget);
            (block, result)
        })
        .await
        .map_err(|e| NodeError::Worker(e.to_string()))?;

        let outcome = if result.success {
            self.admit(block, head, height, result.iterations).await
        } else {
            MiningOutcome::Exhausted {
                iterations: result.iterations,
            }
        };
        if let MiningOutcome::Admitted { height, nonce, .. } = &outcome {
            info!(height, nonce, iterations = result.iterations, elapsed_ms = result.elapsed.as_millis() as u64, "Mined block");
        } else {
            debug!(height, score = result.score, "No block this attempt");
        }

        self.stats.lock().await.record(&outcome);
        Ok(outcome)
    }

    async fn make_candidate(&self) -> Result<(Block, BlockId, u64)> {
        let transactions = self.node.pool().read().await.select(self.settings.max_transactions);
        let chain = self.node.chain().read().await;
        let head = chain.latest().map(Block::id).ok_or(ConsensusError::NotInitialized)?;
        let candidate = chain.candidate(&self.reward_address, transactions)?;
        Ok((candidate, head, chain.length() as u64))
    }

    async fn admit(&self, block: Block, head: BlockId, height: u64, iterations: u64) -> MiningOutcome {
        let mut chain = self.node.chain().write().await;
        if chain.latest().map(Block::id) != Some(head) {
            return MiningOutcome::Stale;
        }
        let submitted = chain.submit_block(block.clone());
        drop(chain);

        let pooled = block.transactions.get(1..).unwrap_or_default();
        if let Err(e) = submitted {
            warn!(error = %e, "Mined block refused, evicting its transactions");
            self.node.pool().write().await.remove_included(pooled);
            return MiningOutcome::Rejected(e.to_string());
        }

        self.node.pool().write().await.remove_included(pooled);
        if let Err(e) = self.node.propagate_block(&block).await {
            warn!(height, error = %e, "Failed to propagate mined block");
        }
        MiningOutcome::Admitted {
            height,
            nonce: block.header.nonce,
            iterations,
        }
    }
}
