//! Fortuna stake registry
//!
//! Stakes are registered against an external collateral reference and a
//! quantum-resistant signature. Records are never removed; retiring a stake
//! only clears its active flag. The registry follows admitted blocks so that
//! eligibility can be evaluated against the current chain context.

use crate::block::{truncate_id, BlockId};
use crate::consensus::ConsensusPolicy;
use crate::error::{StakeError, ValidationError};
use crate::transaction::{unix_now, Transaction};
use crate::validator::{LengthPolicy, SignatureVerifier};
use qpow_core::{qhash, Target};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, info};

/// Truncated digest of `owner || collateral_ref`
pub type StakeId = [u8; 32];

/// Recipient prefix of a stake kernel transaction
pub const STAKE_RECIPIENT_PREFIX: &str = "stake:";

/// Longest accepted collateral reference
pub const MAX_COLLATERAL_REF_LEN: usize = 128;

/// One registered stake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeRecord {
    #[serde(with = "hex")]
    pub id: StakeId,
    pub owner: String,
    pub collateral_ref: String,
    pub registered_at: u64,
    pub last_reward_height: Option<u64>,
    #[serde(with = "hex")]
    pub signature: Vec<u8>,
    pub active: bool,
}

/// Decides whether a collateral reference is acceptable
pub trait CollateralPolicy: Send + Sync + Debug {
    /// Check `collateral_ref` offered by `owner`
    fn verify(&self, owner: &str, collateral_ref: &str) -> std::result::Result<(), String>;
}

/// Accepts any non-empty printable ASCII reference of bounded length
#[derive(Debug, Clone, Default)]
pub struct BasicCollateralPolicy;

impl CollateralPolicy for BasicCollateralPolicy {
    fn verify(&self, owner: &str, collateral_ref: &str) -> std::result::Result<(), String> {
        if owner.is_empty() {
            return Err("owner is empty".to_string());
        }
        if collateral_ref.is_empty() {
            return Err("collateral reference is empty".to_string());
        }
        if collateral_ref.len() > MAX_COLLATERAL_REF_LEN {
            return Err(format!(
                "collateral reference longer than {MAX_COLLATERAL_REF_LEN} bytes"
            ));
        }
        if !collateral_ref.chars().all(|c| c.is_ascii_graphic()) {
            return Err("collateral reference must be printable ASCII".to_string());
        }
        Ok(())
    }
}

/// Chain state that stake eligibility is evaluated against
#[derive(Debug, Clone)]
pub struct EligibilityContext {
    /// Height of the latest observed block
    pub height: u64,

    /// Timestamp of the latest observed block
    pub timestamp: u64,

    /// Most recent block ids, oldest first
    pub recent_ids: Vec<BlockId>,

    /// PoS target for the next block
    pub pos_target: Target,
}

impl Default for EligibilityContext {
    fn default() -> Self {
        Self {
            height: 0,
            timestamp: 0,
            recent_ids: Vec::new(),
            pos_target: Target::from_leading_zero_bits(256),
        }
    }
}

/// Outcome of splitting the staking pool for one block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewardDistribution {
    /// Height the rewards were paid at
    pub height: u64,

    /// Base units paid to each eligible stake
    pub shares: BTreeMap<StakeId, u64>,

    /// Undistributed part of the pool, returned to the miner
    pub remainder: u64,
}

impl RewardDistribution {
    /// Total paid to stakers
    pub fn distributed(&self) -> u64 {
        self.shares.values().sum()
    }
}

/// Registry of Fortuna stakes
#[derive(Debug, Clone)]
pub struct FortunaRegistry {
    stakes: BTreeMap<StakeId, StakeRecord>,
    context: EligibilityContext,
    policy: ConsensusPolicy,
    collateral: Arc<dyn CollateralPolicy>,
    verifier: Arc<dyn SignatureVerifier>,
}

impl FortunaRegistry {
    /// Registry with the default collateral and signature policies
    pub fn new(policy: ConsensusPolicy) -> Self {
        Self::with_policies(
            policy,
            Arc::new(BasicCollateralPolicy),
            Arc::new(LengthPolicy::default()),
        )
    }

    /// Registry with explicit collateral and signature policies
    pub fn with_policies(
        policy: ConsensusPolicy,
        collateral: Arc<dyn CollateralPolicy>,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Self {
        Self {
            stakes: BTreeMap::new(),
            context: EligibilityContext::default(),
            policy,
            collateral,
            verifier,
        }
    }

    /// Register a stake now
    pub fn register(
        &mut self,
        owner: &str,
        collateral_ref: &str,
        signature: Vec<u8>,
    ) -> std::result::Result<StakeId, StakeError> {
        self.register_at(owner, collateral_ref, signature, unix_now())
    }

    /// Register a stake with an explicit registration timestamp
    pub fn register_at(
        &mut self,
        owner: &str,
        collateral_ref: &str,
        signature: Vec<u8>,
        timestamp: u64,
    ) -> std::result::Result<StakeId, StakeError> {
        self.collateral
            .verify(owner, collateral_ref)
            .map_err(StakeError::BadCollateral)?;

        let message = registration_message(owner, collateral_ref);
        if !self.verifier.verify(&message, &signature, true) {
            return Err(StakeError::BadSignature);
        }

        let id = stake_id_for(owner, collateral_ref);
        if self.stakes.contains_key(&id) {
            return Err(StakeError::DuplicateStake(hex::encode(id)));
        }

        self.stakes.insert(
            id,
            StakeRecord {
                id,
                owner: owner.to_string(),
                collateral_ref: collateral_ref.to_string(),
                registered_at: timestamp,
                last_reward_height: None,
                signature,
                active: true,
            },
        );
        info!(stake = %hex::encode(&id[..8]), owner, "Registered stake");
        Ok(id)
    }

    /// Mark a stake inactive
    pub fn retire(&mut self, id: &StakeId) -> std::result::Result<(), StakeError> {
        let record = self
            .stakes
            .get_mut(id)
            .ok_or_else(|| StakeError::UnknownStake(hex::encode(id)))?;
        record.active = false;
        info!(stake = %hex::encode(&id[..8]), "Retired stake");
        Ok(())
    }

    /// Look up a stake
    pub fn get(&self, id: &StakeId) -> Option<&StakeRecord> {
        self.stakes.get(id)
    }

    /// Ids of active stakes, in id order
    pub fn active_stakes(&self) -> Vec<StakeId> {
        self.stakes
            .values()
            .filter(|r| r.active)
            .map(|r| r.id)
            .collect()
    }

    /// Every record, active or retired
    pub fn records(&self) -> impl Iterator<Item = &StakeRecord> {
        self.stakes.values()
    }

    /// Number of registered stakes
    pub fn len(&self) -> usize {
        self.stakes.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.stakes.is_empty()
    }

    /// Staking share of a block reward
    pub fn calculate_reward(&self, block_reward: u64) -> u64 {
        block_reward * self.policy.params().reward_percentage / 100
    }

    /// Current eligibility context
    pub fn context(&self) -> &EligibilityContext {
        &self.context
    }

    /// Seconds between registration and the latest observed block
    pub fn coin_age(&self, record: &StakeRecord) -> u64 {
        self.context.timestamp.saturating_sub(record.registered_at)
    }

    /// Whether a stake may produce the next block
    pub fn is_eligible(&self, id: &StakeId) -> bool {
        self.check_eligible(id).is_ok()
    }

    /// Typed form of [`Self::is_eligible`]
    pub fn check_eligible(&self, id: &StakeId) -> std::result::Result<(), ValidationError> {
        let record = self
            .stakes
            .get(id)
            .filter(|r| r.active)
            .ok_or_else(|| ValidationError::UnknownStake(hex::encode(id)))?;

        let eligible = self.policy.is_stake_eligible(
            self.coin_age(record),
            &self.context.recent_ids,
            id,
            &self.context.pos_target,
        );
        if eligible {
            Ok(())
        } else {
            Err(ValidationError::IneligibleStake(hex::encode(id)))
        }
    }

    /// Split the staking pool over stakes eligible at `height`
    ///
    /// A stake already rewarded at `height` or later is skipped. Every paid
    /// stake records `height` as its last reward.
    pub fn distribute_rewards(&mut self, height: u64, block_reward: u64) -> RewardDistribution {
        let pool = self.calculate_reward(block_reward);
        let winners: Vec<StakeId> = self
            .stakes
            .values()
            .filter(|r| r.last_reward_height.map_or(true, |h| h < height))
            .map(|r| r.id)
            .filter(|id| self.is_eligible(id))
            .collect();

        if winners.is_empty() {
            return RewardDistribution {
                height,
                shares: BTreeMap::new(),
                remainder: pool,
            };
        }

        let share = pool / winners.len() as u64;
        let mut shares = BTreeMap::new();
        for id in winners {
            if let Some(record) = self.stakes.get_mut(&id) {
                record.last_reward_height = Some(height);
            }
            shares.insert(id, share);
        }

        let distribution = RewardDistribution {
            height,
            remainder: pool - share * shares.len() as u64,
            shares,
        };
        debug!(
            height,
            stakers = distribution.shares.len(),
            share,
            remainder = distribution.remainder,
            "Distributed staking rewards"
        );
        distribution
    }

    /// Advance the eligibility context past an admitted block
    pub fn observe_block(&mut self, height: u64, id: BlockId, timestamp: u64, pos_target: Target) {
        let depth = self.policy.params().stake_modifier_depth.max(1);
        self.context.recent_ids.push(id);
        if self.context.recent_ids.len() > depth {
            let excess = self.context.recent_ids.len() - depth;
            self.context.recent_ids.drain(..excess);
        }
        self.context.height = height;
        self.context.timestamp = timestamp;
        self.context.pos_target = pos_target;
    }

    /// Forget chain-derived state so another chain can be replayed
    pub fn reset_chain_state(&mut self) {
        self.context = EligibilityContext::default();
        for record in self.stakes.values_mut() {
            record.last_reward_height = None;
        }
    }

    /// Re-insert records loaded from a snapshot
    pub fn restore(&mut self, records: Vec<StakeRecord>) {
        for record in records {
            self.stakes.insert(record.id, record);
        }
    }
}

/// Stake id for an owner and collateral reference
pub fn stake_id_for(owner: &str, collateral_ref: &str) -> StakeId {
    truncate_id(&qhash(&registration_message(owner, collateral_ref)))
}

/// Bytes a registration signature covers
///
/// Each field is preceded by its length as a little-endian u32.
pub fn registration_message(owner: &str, collateral_ref: &str) -> Vec<u8> {
    let mut message = Vec::with_capacity(8 + owner.len() + collateral_ref.len());
    for field in [owner, collateral_ref] {
        message.extend_from_slice(&(field.len() as u32).to_le_bytes());
        message.extend_from_slice(field.as_bytes());
    }
    message
}

/// First transaction of a stake-path block, naming the producing stake
pub fn stake_kernel_transaction(record: &StakeRecord, height: u64, timestamp: u64) -> Transaction {
    Transaction {
        sender: record.owner.clone(),
        recipient: format!("{STAKE_RECIPIENT_PREFIX}{}", hex::encode(record.id)),
        amount: 0.0,
        signature: record.signature.clone(),
        timestamp,
        is_quantum_signed: true,
        nonce: height,
    }
}

/// Stake id named by a stake kernel transaction
pub fn parse_stake_kernel(tx: &Transaction) -> Option<StakeId> {
    let encoded = tx.recipient.strip_prefix(STAKE_RECIPIENT_PREFIX)?;
    let bytes = hex::decode(encoded).ok()?;
    StakeId::try_from(bytes.as_slice()).ok()
}
