//! The canonical chain and its admission rules

use crate::block::{Block, BlockId, BLOCK_ID_LEN};
use crate::consensus::{ConsensusParams, ConsensusPolicy};
use crate::constants::{BASE_UNITS_PER_COIN, GENESIS_TIMESTAMP, SNAPSHOT_MAGIC};
use crate::error::ValidationError;
use crate::fortuna::{
    parse_stake_kernel, stake_kernel_transaction, BasicCollateralPolicy, FortunaRegistry,
    RewardDistribution, StakeId, StakeRecord,
};
use crate::stylometry::StylometricValidator;
use crate::transaction::{unix_now, Transaction};
use crate::validator::{check_merkle, BlockValidator};
use crate::{ConsensusError, Result};
use qpow_core::Target;
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Deterministic genesis block shared by every node of a network
pub fn default_genesis(bits: u32) -> Result<Block> {
    let reward = Transaction::coinbase("qpow-genesis", 0.0, 0).with_timestamp(GENESIS_TIMESTAMP);
    let timestamp = u32::try_from(GENESIS_TIMESTAMP).unwrap_or(u32::MAX);
    Block::genesis(vec![reward], bits, timestamp)
}

/// The local view of the chain plus the stake registry it drives
#[derive(Debug, Clone)]
pub struct ChainManager {
    /// Admitted blocks, genesis first
    blocks: Vec<Block>,

    /// Block id -> height
    index: HashMap<BlockId, usize>,

    policy: ConsensusPolicy,
    validator: BlockValidator,
    fortuna: FortunaRegistry,

    /// Optional authorship layer
    authorship: Option<StylometricValidator>,

    /// Staking payout of the latest admitted block
    last_distribution: Option<RewardDistribution>,
}

impl ChainManager {
    /// Empty chain with the default signature policy
    pub fn new(params: ConsensusParams) -> Self {
        Self::with_validator(params, BlockValidator::default())
    }

    /// Empty chain with an explicit validator
    pub fn with_validator(params: ConsensusParams, validator: BlockValidator) -> Self {
        let policy = ConsensusPolicy::new(params);
        let fortuna = FortunaRegistry::with_policies(
            policy.clone(),
            Arc::new(BasicCollateralPolicy),
            validator.verifier().clone(),
        );
        Self {
            blocks: Vec::new(),
            index: HashMap::new(),
            policy,
            validator,
            fortuna,
            authorship: None,
            last_distribution: None,
        }
    }

    /// Install the genesis block without proof-of-work
    ///
    /// Only the zero parent and the Merkle root are checked.
    pub fn initialize(&mut self, genesis: Block) -> Result<()> {
        if !self.blocks.is_empty() {
            return Err(ConsensusError::AlreadyInitialized);
        }
        check_postulated_genesis(&genesis)?;
        info!(id = %short_id(&genesis.id()), "Initialized chain with genesis");
        self.admit(genesis);
        Ok(())
    }

    /// Whether a genesis block is present
    pub fn is_initialized(&self) -> bool {
        !self.blocks.is_empty()
    }

    /// Validation rules for `block` as the next block
    pub fn check_block(&self, block: &Block) -> std::result::Result<(), ValidationError> {
        check_extension(&self.policy, &self.validator, &self.fortuna, &self.blocks, block)
    }

    /// Boolean form of [`Self::check_block`]
    pub fn validate_block(&self, block: &Block) -> bool {
        self.check_block(block).is_ok()
    }

    /// Validate and append; on an empty chain the block is checked as genesis
    pub fn submit_block(&mut self, block: Block) -> Result<()> {
        self.check_block(&block)?;
        self.admit(block);
        Ok(())
    }

    /// Boolean form of [`Self::submit_block`]
    pub fn add_block(&mut self, block: Block) -> bool {
        let id = block.id();
        match self.submit_block(block) {
            Ok(()) => true,
            Err(e) => {
                debug!(id = %short_id(&id), error = %e, "Rejected block");
                false
            }
        }
    }

    /// Like [`Self::submit_block`], then applies the authorship check
    pub fn submit_authored_block(&mut self, block: Block, author: &str) -> Result<()> {
        self.check_block(&block)?;
        if let Some(authorship) = &self.authorship {
            if !authorship.verify(author, &block)? {
                return Err(ValidationError::AuthorRejected(author.to_string()).into());
            }
        }
        self.admit(block);
        Ok(())
    }

    /// Boolean form of [`Self::submit_authored_block`]
    pub fn add_authored_block(&mut self, block: Block, author: &str) -> bool {
        match self.submit_authored_block(block, author) {
            Ok(()) => true,
            Err(e) => {
                debug!(author, error = %e, "Rejected authored block");
                false
            }
        }
    }

    /// Latest admitted block
    pub fn latest(&self) -> Option<&Block> {
        self.blocks.last()
    }

    /// Number of admitted blocks
    pub fn length(&self) -> usize {
        self.blocks.len()
    }

    /// Block at `height`
    pub fn block_at(&self, height: u64) -> Option<&Block> {
        usize::try_from(height).ok().and_then(|h| self.blocks.get(h))
    }

    /// Block with the given id
    pub fn find(&self, id: &BlockId) -> Option<&Block> {
        self.index.get(id).map(|h| &self.blocks[*h])
    }

    /// Whether a block id is on the chain
    pub fn contains(&self, id: &BlockId) -> bool {
        self.index.contains_key(id)
    }

    /// All admitted blocks
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Up to `max` blocks starting at `from_height`
    pub fn blocks_from(&self, from_height: u64, max: usize) -> Vec<Block> {
        let start = usize::try_from(from_height).unwrap_or(usize::MAX);
        self.blocks.iter().skip(start).take(max).cloned().collect()
    }

    /// Adopt `other` if it is strictly longer, shares our genesis and every
    /// block is valid against its predecessor
    pub fn resolve_conflicts(&mut self, other: Vec<Block>) -> bool {
        if other.len() <= self.blocks.len() {
            return false;
        }
        if let (Some(ours), Some(theirs)) = (self.blocks.first(), other.first()) {
            if ours.id() != theirs.id() {
                debug!("Ignoring chain with a different genesis");
                return false;
            }
        }

        let mut registry = self.fortuna.clone();
        registry.reset_chain_state();
        let mut accepted: Vec<Block> = Vec::with_capacity(other.len());
        let mut distribution = None;

        for block in other {
            let outcome = if accepted.is_empty() {
                check_postulated_genesis(&block).map_err(|e| match e {
                    ConsensusError::Validation(v) => v,
                    _ => ValidationError::MerkleMismatch,
                })
            } else {
                check_extension(&self.policy, &self.validator, &registry, &accepted, &block)
            };
            if let Err(e) = outcome {
                debug!(height = accepted.len(), error = %e, "Candidate chain rejected");
                return false;
            }
            accepted.push(block);
            distribution = apply_to_registry(&self.policy, &mut registry, &accepted);
        }

        let previous = self.blocks.len();
        self.index = accepted.iter().enumerate().map(|(h, b)| (b.id(), h)).collect();
        self.blocks = accepted;
        self.fortuna = registry;
        self.last_distribution = distribution;
        self.check_invariants(1);

        info!(previous, length = self.blocks.len(), "Replaced chain with a longer valid chain");
        true
    }

    /// Compact bits the next block must carry
    pub fn next_bits(&self, proof_of_stake: bool) -> Result<u32> {
        self.policy.expected_bits(&self.blocks, proof_of_stake)
    }

    /// PoW candidate on the head: coinbase to `miner`, then `transactions`
    pub fn candidate(&self, miner: &str, transactions: Vec<Transaction>) -> Result<Block> {
        let parent = self.latest().ok_or(ConsensusError::NotInitialized)?;
        let height = self.blocks.len() as u64;

        let reward = self.policy.params().block_reward;
        let staked = self
            .fortuna
            .clone()
            .distribute_rewards(height, reward)
            .distributed();
        let coinbase = Transaction::coinbase(miner, units_to_coins(reward - staked), height);

        let mut all = Vec::with_capacity(transactions.len() + 1);
        all.push(coinbase);
        all.extend(transactions);

        let timestamp = candidate_timestamp(parent);
        Block::with_timestamp(parent.id(), all, self.next_bits(false)?, timestamp)
    }

    /// Stake-path candidate produced by `stake`
    pub fn stake_candidate(&self, stake: &StakeId, transactions: Vec<Transaction>) -> Result<Block> {
        let parent = self.latest().ok_or(ConsensusError::NotInitialized)?;
        let record = self
            .fortuna
            .get(stake)
            .filter(|r| r.active)
            .ok_or_else(|| ValidationError::UnknownStake(hex::encode(stake)))?;
        let height = self.blocks.len() as u64;
        let timestamp = candidate_timestamp(parent);

        let mut all = Vec::with_capacity(transactions.len() + 1);
        all.push(stake_kernel_transaction(record, height, u64::from(timestamp)));
        all.extend(transactions);

        Ok(Block::with_timestamp(parent.id(), all, self.next_bits(true)?, timestamp)?.into_proof_of_stake())
    }

    /// Consensus policy in use
    pub fn policy(&self) -> &ConsensusPolicy {
        &self.policy
    }

    /// Stake registry
    pub fn fortuna(&self) -> &FortunaRegistry {
        &self.fortuna
    }

    /// Mutable stake registry, for registrations and retirements
    pub fn fortuna_mut(&mut self) -> &mut FortunaRegistry {
        &mut self.fortuna
    }

    /// Staking payout of the latest block
    pub fn last_distribution(&self) -> Option<&RewardDistribution> {
        self.last_distribution.as_ref()
    }

    /// Enable or disable the authorship layer
    pub fn set_authorship(&mut self, authorship: Option<StylometricValidator>) {
        self.authorship = authorship;
    }

    /// Authorship layer, if enabled
    pub fn authorship_mut(&mut self) -> Option<&mut StylometricValidator> {
        self.authorship.as_mut()
    }

    /// Write the chain and stake records to `path`
    pub fn save_snapshot(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut out = Vec::new();
        out.extend_from_slice(SNAPSHOT_MAGIC);
        out.extend_from_slice(&u32_len(self.blocks.len())?.to_le_bytes());
        for block in &self.blocks {
            let encoded = block.encode()?;
            out.extend_from_slice(&u32_len(encoded.len())?.to_le_bytes());
            out.extend_from_slice(&encoded);
        }

        let records: Vec<&StakeRecord> = self.fortuna.records().collect();
        let stakes = serde_json::to_vec(&records)?;
        out.extend_from_slice(&u32_len(stakes.len())?.to_le_bytes());
        out.extend_from_slice(&stakes);

        let staging = path.with_extension("tmp");
        std::fs::write(&staging, &out)?;
        std::fs::rename(&staging, path)?;
        info!(path = %path.display(), blocks = self.blocks.len(), "Saved chain snapshot");
        Ok(())
    }

    /// Rebuild a chain from a snapshot, revalidating every block
    pub fn load_snapshot(path: impl AsRef<Path>, params: ConsensusParams) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let mut cursor = Cursor::new(bytes.as_slice());

        let mut magic = [0u8; 4];
        read_snapshot(&mut cursor, &mut magic)?;
        if &magic != SNAPSHOT_MAGIC {
            return Err(ConsensusError::Snapshot("bad magic".to_string()));
        }

        let count = read_snapshot_u32(&mut cursor)? as usize;
        let mut blocks = Vec::with_capacity(count.min(bytes.len() / 4));
        for _ in 0..count {
            let len = read_snapshot_u32(&mut cursor)? as usize;
            let remaining = bytes.len() - cursor.position() as usize;
            if len > remaining {
                return Err(ConsensusError::Snapshot("truncated block".to_string()));
            }
            let mut encoded = vec![0u8; len];
            read_snapshot(&mut cursor, &mut encoded)?;
            blocks.push(Block::decode(&encoded)?);
        }

        let stakes_len = read_snapshot_u32(&mut cursor)? as usize;
        let mut stakes = vec![0u8; stakes_len.min(bytes.len())];
        read_snapshot(&mut cursor, &mut stakes)?;
        let records: Vec<StakeRecord> = serde_json::from_slice(&stakes)?;

        let mut chain = Self::new(params);
        chain.fortuna.restore(records);
        chain.fortuna.reset_chain_state();

        let mut blocks = blocks.into_iter();
        if let Some(genesis) = blocks.next() {
            chain.initialize(genesis)?;
        }
        for block in blocks {
            let height = chain.length();
            chain
                .submit_block(block)
                .map_err(|e| ConsensusError::Snapshot(format!("block {height}: {e}")))?;
        }
        info!(blocks = chain.length(), "Loaded chain snapshot");
        Ok(chain)
    }

    fn admit(&mut self, block: Block) {
        let id = block.id();
        let pos = block.header.is_proof_of_stake();
        self.index.insert(id, self.blocks.len());
        self.blocks.push(block);

        let distribution = apply_to_registry(&self.policy, &mut self.fortuna, &self.blocks);
        if let Some(d) = &distribution {
            if !d.shares.is_empty() {
                debug!(height = d.height, stakers = d.shares.len(), "Paid staking rewards");
            }
        }
        self.last_distribution = distribution;
        self.check_invariants(self.blocks.len().saturating_sub(1).max(1));

        info!(
            height = self.blocks.len() - 1,
            id = %short_id(&id),
            proof_of_stake = pos,
            "Admitted block"
        );
    }

    /// Panics if linkage or the id index is broken from height `from` on
    fn check_invariants(&self, from: usize) {
        assert_eq!(
            self.index.len(),
            self.blocks.len(),
            "chain index holds {} ids for {} blocks",
            self.index.len(),
            self.blocks.len()
        );
        for height in from..self.blocks.len() {
            let parent = self.blocks[height - 1].id();
            assert_eq!(
                self.blocks[height].header.prev_block_hash,
                parent,
                "block at height {height} does not link to {}",
                hex::encode(parent)
            );
        }
    }
}

/// Rules for `block` on top of `prefix`, with stake checks against `registry`
fn check_extension(
    policy: &ConsensusPolicy,
    validator: &BlockValidator,
    registry: &FortunaRegistry,
    prefix: &[Block],
    block: &Block,
) -> std::result::Result<(), ValidationError> {
    let Some(parent) = prefix.last() else {
        return validator.check_genesis(block);
    };
    validator.check_against_parent(block, &parent.header)?;

    let proof_of_stake = block.header.is_proof_of_stake();
    if proof_of_stake || policy.params().enforce_difficulty {
        let expected = policy
            .expected_bits(prefix, proof_of_stake)
            .map_err(|_| ValidationError::InvalidBits(parent.header.bits))?;
        if block.header.bits != expected {
            return Err(ValidationError::UnexpectedBits {
                expected,
                got: block.header.bits,
            });
        }
    }

    if proof_of_stake {
        let kernel = block
            .transactions
            .first()
            .ok_or(ValidationError::MissingStakeKernel)?;
        let stake = parse_stake_kernel(kernel).ok_or(ValidationError::MissingStakeKernel)?;
        let owner_matches = registry.get(&stake).is_some_and(|r| r.owner == kernel.sender);
        if !owner_matches {
            return Err(ValidationError::UnknownStake(hex::encode(stake)));
        }
        registry.check_eligible(&stake)?;
    }
    Ok(())
}

/// Pay stakers for the last block of `chain` and advance the context
fn apply_to_registry(
    policy: &ConsensusPolicy,
    registry: &mut FortunaRegistry,
    chain: &[Block],
) -> Option<RewardDistribution> {
    let block = chain.last()?;
    let height = (chain.len() - 1) as u64;

    let distribution = (height > 0).then(|| registry.distribute_rewards(height, policy.params().block_reward));

    let pos_target = match policy
        .expected_bits(chain, true)
        .and_then(|bits| Target::from_compact(bits).map_err(ConsensusError::from))
    {
        Ok(target) => target,
        Err(e) => {
            warn!(height, error = %e, "Could not derive the next PoS target");
            Target::from_leading_zero_bits(256)
        }
    };
    registry.observe_block(height, block.id(), u64::from(block.header.timestamp), pos_target);
    distribution
}

fn check_postulated_genesis(genesis: &Block) -> Result<()> {
    if genesis.header.prev_block_hash != [0u8; BLOCK_ID_LEN] {
        return Err(ValidationError::NonZeroGenesisParent.into());
    }
    check_merkle(genesis)?;
    Ok(())
}

fn candidate_timestamp(parent: &Block) -> u32 {
    u32::try_from(unix_now())
        .unwrap_or(u32::MAX)
        .max(parent.header.timestamp)
}

fn units_to_coins(units: u64) -> f64 {
    units as f64 / BASE_UNITS_PER_COIN as f64
}

fn short_id(id: &BlockId) -> String {
    hex::encode(&id[..8])
}

fn u32_len(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| ConsensusError::Snapshot(format!("length {len} exceeds u32")))
}

fn read_snapshot(cursor: &mut Cursor<&[u8]>, buf: &mut [u8]) -> Result<()> {
    cursor
        .read_exact(buf)
        .map_err(|_| ConsensusError::Snapshot("unexpected end of snapshot".to_string()))
}

fn read_snapshot_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    let mut word = [0u8; 4];
    read_snapshot(cursor, &mut word)?;
    Ok(u32::from_le_bytes(word))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::TRIVIAL_BITS;

    fn params() -> ConsensusParams {
        ConsensusParams {
            stake_min_age: 0,
            block_reward: 1_000,
            ..ConsensusParams::default()
        }
    }

    fn solve(mut block: Block) -> Block {
        while !block.header.meets_target() {
            block.header.nonce += 1;
        }
        block
    }

    fn chain_of(len: usize) -> ChainManager {
        let mut chain = ChainManager::new(params());
        chain.initialize(default_genesis(TRIVIAL_BITS).unwrap()).unwrap();
        while chain.length() < len {
            let block = solve(chain.candidate("miner", vec![]).unwrap());
            assert!(chain.add_block(block));
        }
        chain
    }

    #[test]
    fn test_initialize_once() {
        let mut chain = ChainManager::new(params());
        assert!(!chain.is_initialized());
        chain.initialize(default_genesis(TRIVIAL_BITS).unwrap()).unwrap();
        assert!(matches!(
            chain.initialize(default_genesis(TRIVIAL_BITS).unwrap()),
            Err(ConsensusError::AlreadyInitialized)
        ));
        assert_eq!(chain.length(), 1);
    }

    #[test]
    fn test_candidate_requires_genesis() {
        let chain = ChainManager::new(params());
        assert!(matches!(
            chain.candidate("m", vec![]),
            Err(ConsensusError::NotInitialized)
        ));
    }

    #[test]
    fn test_extend_and_query() {
        let chain = chain_of(4);
        assert_eq!(chain.length(), 4);
        let head = chain.latest().unwrap();
        assert_eq!(chain.block_at(3), Some(head));
        assert!(chain.contains(&head.id()));
        assert_eq!(chain.find(&chain.blocks()[1].id()), chain.block_at(1));
        assert_eq!(chain.blocks_from(1, 2).len(), 2);
        assert_eq!(chain.blocks_from(3, 10).len(), 1);
        assert!(chain.blocks_from(9, 10).is_empty());
    }

    #[test]
    fn test_rejected_block_leaves_chain_unchanged() {
        let mut chain = chain_of(2);
        let mut block = solve(chain.candidate("m", vec![]).unwrap());
        block.header.prev_block_hash = [9u8; 32];
        let block = solve(block);
        let before = chain.latest().unwrap().id();
        assert!(!chain.add_block(block));
        assert_eq!(chain.length(), 2);
        assert_eq!(chain.latest().unwrap().id(), before);
    }

    #[test]
    fn test_wrong_bits_rejected() {
        let chain = chain_of(2);
        let mut block = chain.candidate("m", vec![]).unwrap();
        block.header.bits = 0x2100_ffff;
        let block = solve(block);
        assert!(matches!(
            chain.check_block(&block),
            Err(ValidationError::UnexpectedBits { .. })
        ));
    }

    #[test]
    fn test_resolve_conflicts_prefers_longer() {
        let mut short = chain_of(2);
        let long = chain_of(4);
        assert!(short.resolve_conflicts(long.blocks().to_vec()));
        assert_eq!(short.length(), 4);
        assert!(!short.resolve_conflicts(chain_of(3).blocks().to_vec()));
        assert_eq!(short.length(), 4);
    }

    #[test]
    fn test_resolve_conflicts_rejects_other_genesis() {
        let mut ours = chain_of(1);
        let mut theirs = ChainManager::new(params());
        let genesis = Block::genesis(vec![], TRIVIAL_BITS, 5).unwrap();
        theirs.initialize(genesis).unwrap();
        let block = solve(theirs.candidate("m", vec![]).unwrap());
        assert!(theirs.add_block(block));
        assert!(!ours.resolve_conflicts(theirs.blocks().to_vec()));
    }

    #[test]
    fn test_resolve_conflicts_rejects_invalid_block() {
        let mut ours = chain_of(1);
        let mut blocks = chain_of(3).blocks().to_vec();
        blocks[2].transactions.push(Transaction::new("a", "b", 1.0, vec![1]));
        assert!(!ours.resolve_conflicts(blocks));
        assert_eq!(ours.length(), 1);
    }

    #[test]
    fn test_stake_path_block() {
        let mut chain = chain_of(2);
        let stake = chain
            .fortuna_mut()
            .register_at("staker", "utxo:1", vec![7; 64], 0)
            .unwrap();
        let block = solve(chain.stake_candidate(&stake, vec![]).unwrap());
        assert!(block.header.is_proof_of_stake());
        assert_eq!(chain.check_block(&block), Ok(()));
        assert!(chain.add_block(block));

        let paid = chain.last_distribution().unwrap();
        assert_eq!(paid.height, 2);
        assert_eq!(paid.shares.get(&stake), Some(&330));
        assert_eq!(chain.fortuna().get(&stake).unwrap().last_reward_height, Some(2));
    }

    #[test]
    fn test_stake_path_requires_registered_stake() {
        let mut chain = chain_of(2);
        let stake = chain
            .fortuna_mut()
            .register_at("staker", "utxo:1", vec![7; 64], 0)
            .unwrap();
        let block = solve(chain.stake_candidate(&stake, vec![]).unwrap());
        chain.fortuna_mut().retire(&stake).unwrap();
        assert!(matches!(
            chain.check_block(&block),
            Err(ValidationError::UnknownStake(_))
        ));
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let chain = chain_of(3);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.bin");
        chain.save_snapshot(&path).unwrap();

        let loaded = ChainManager::load_snapshot(&path, params()).unwrap();
        assert_eq!(loaded.length(), 3);
        assert_eq!(loaded.latest().unwrap().id(), chain.latest().unwrap().id());
    }

    #[test]
    fn test_snapshot_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.bin");
        std::fs::write(&path, b"NOPE\0\0\0\0").unwrap();
        assert!(matches!(
            ChainManager::load_snapshot(&path, params()),
            Err(ConsensusError::Snapshot(_))
        ));
    }
}
