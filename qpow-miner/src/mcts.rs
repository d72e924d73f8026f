//! Monte Carlo tree search over nonces
//!
//! Each tree node stands for a nonce; the root is nonce zero. Edges are
//! [`NonceMove`]s drawn from a seeded generator when the node is created.
//! One iteration selects a leaf by UCB1, expands one untried move, hashes
//! the header at the new nonce, scores it with the reward model and
//! backpropagates the reward.

use crate::actions::{catalogue, CatalogueSpec, NonceMove};
use crate::decomposition::{decompose, report, SubProblemReport};
use crate::reward::{ProximityReward, RewardModel};
use crate::{Miner, MiningBudget, MiningResult};
use qpow_consensus::Block;
use qpow_core::{Digest512, Target};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, warn};

/// Search parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MctsConfig {
    /// UCB1 exploration weight
    pub exploration_weight: f64,

    /// Unit of increment and decrement moves
    pub step: u32,

    /// Moves of each class offered per node
    pub actions_per_class: usize,

    /// Inclusive range of quantum-jump levels
    pub jump_levels: (u32, u32),

    /// Width of the window random moves draw from
    pub random_window: u32,

    /// Seed of the move generator
    pub seed: u64,
}

impl Default for MctsConfig {
    fn default() -> Self {
        Self {
            exploration_weight: std::f64::consts::SQRT_2,
            step: 16,
            actions_per_class: 2,
            jump_levels: (1, 4),
            random_window: 1 << 20,
            seed: 0x5eed,
        }
    }
}

impl MctsConfig {
    fn catalogue_spec(&self) -> CatalogueSpec {
        CatalogueSpec {
            step: self.step,
            actions_per_class: self.actions_per_class,
            jump_levels: self.jump_levels,
            random_window: self.random_window,
        }
    }
}

#[derive(Debug)]
struct TreeNode {
    nonce: u32,
    parent: Option<usize>,
    children: Vec<usize>,
    untried: Vec<NonceMove>,
    visits: u64,
    total_reward: f64,
}

/// Arena-allocated search tree
#[derive(Debug, Default)]
struct SearchTree {
    nodes: Vec<TreeNode>,
}

impl SearchTree {
    fn push(&mut self, nonce: u32, parent: Option<usize>, untried: Vec<NonceMove>) -> usize {
        let index = self.nodes.len();
        self.nodes.push(TreeNode {
            nonce,
            parent,
            children: Vec::new(),
            untried,
            visits: 0,
            total_reward: 0.0,
        });
        if let Some(p) = parent {
            self.nodes[p].children.push(index);
        }
        index
    }

    fn ucb1(&self, index: usize, parent_visits: u64, weight: f64) -> f64 {
        let node = &self.nodes[index];
        if node.visits == 0 {
            return f64::INFINITY;
        }
        let visits = node.visits as f64;
        let exploitation = node.total_reward / visits;
        let exploration = weight * ((parent_visits.max(1) as f64).ln() / visits).sqrt();
        exploitation + exploration
    }

    /// Descend while the node is fully expanded and has children
    fn select(&self, weight: f64) -> usize {
        let mut current = 0;
        loop {
            let node = &self.nodes[current];
            if !node.untried.is_empty() || node.children.is_empty() {
                return current;
            }
            let parent_visits = node.visits;
            current = node
                .children
                .iter()
                .copied()
                .max_by(|a, b| {
                    self.ucb1(*a, parent_visits, weight)
                        .total_cmp(&self.ucb1(*b, parent_visits, weight))
                })
                .unwrap_or(current);
        }
    }

    fn backpropagate(&mut self, mut index: usize, reward: f64) {
        loop {
            let node = &mut self.nodes[index];
            node.visits += 1;
            node.total_reward += reward;
            match node.parent {
                Some(parent) => index = parent,
                None => return,
            }
        }
    }
}

/// Best evaluation seen so far
#[derive(Debug, Clone, Copy)]
struct Best {
    nonce: u32,
    hash: Digest512,
    score: f64,
}

/// MCTS miner with a pluggable reward model
pub struct MctsMiner {
    config: MctsConfig,
    reward: Box<dyn RewardModel>,
    last_report: Vec<SubProblemReport>,
}

impl MctsMiner {
    /// Miner with the proximity reward
    pub fn new(config: MctsConfig) -> Self {
        Self::with_reward(config, Box::new(ProximityReward))
    }

    /// Miner with a custom reward model
    pub fn with_reward(config: MctsConfig, reward: Box<dyn RewardModel>) -> Self {
        Self {
            config,
            reward,
            last_report: Vec::new(),
        }
    }

    /// Search parameters
    pub fn config(&self) -> &MctsConfig {
        &self.config
    }

    /// Sub-problem outcomes of the latest attempt
    pub fn last_report(&self) -> &[SubProblemReport] {
        &self.last_report
    }

    fn evaluate(&self, candidate: &mut Block, nonce: u32, target: &Target) -> (Digest512, f64) {
        candidate.header.nonce = nonce;
        let hash = candidate.header.hash();
        (hash, self.reward.score(&hash, target))
    }
}

impl Default for MctsMiner {
    fn default() -> Self {
        Self::new(MctsConfig::default())
    }
}

impl Miner for MctsMiner {
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

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let spec = self.config.catalogue_spec();
        let root_nonce = 0;
        let mut tree = SearchTree::default();
        tree.push(root_nonce, None, catalogue(&spec, &mut rng));

        let (hash, score) = self.evaluate(candidate, root_nonce, &target);
        tree.backpropagate(0, score);
        let mut best = Best { nonce: root_nonce, hash, score };
        let mut iterations = 1u64;
        let mut success = target.is_met_by(&hash);

        while !success
            && iterations < budget.max_iterations
            && started.elapsed() < budget.time_limit
            && budget.is_running()
        {
            let leaf = tree.select(self.config.exploration_weight);

            let node = match tree.nodes[leaf].untried.pop() {
                Some(action) => {
                    let nonce = action.apply(tree.nodes[leaf].nonce);
                    tree.push(nonce, Some(leaf), catalogue(&spec, &mut rng))
                }
                // Terminal leaf: re-simulate it
                None => leaf,
            };

            let nonce = tree.nodes[node].nonce;
            let (hash, score) = self.evaluate(candidate, nonce, &target);
            iterations += 1;
            tree.backpropagate(node, score);

            if score > best.score {
                best = Best { nonce, hash, score };
            }
            if target.is_met_by(&hash) {
                success = true;
                best = Best { nonce, hash, score };
            }
        }

        candidate.header.nonce = best.nonce;
        self.last_report = report(&problems, success);

        let elapsed = started.elapsed();
        debug!(
            success,
            iterations,
            nodes = tree.nodes.len(),
            score = best.score,
            elapsed_ms = elapsed.as_millis() as u64,
            "MCTS search finished"
        );

        MiningResult {
            success,
            nonce: best.nonce,
            hash: best.hash,
            score: best.score,
            iterations,
            elapsed,
        }
    }
}
