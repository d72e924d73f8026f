//! Hybrid PoW/PoS consensus policy
//!
//! Difficulty follows the parent's PoW target and is recomputed on every
//! retarget-window boundary from the observed mean block time. Stake-path
//! blocks use the PoW target made `pos_difficulty_modifier` bits easier and
//! must present a stake kernel below that target.

use crate::block::{Block, BlockId};
use crate::constants::{BASE_UNITS_PER_COIN, BLOCK_TIME};
use crate::fortuna::StakeId;
use crate::Result;
use qpow_core::{tribus, Digest512, Target};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Tunable consensus parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusParams {
    /// Leading zero bits of the initial PoW target
    pub pow_difficulty_bits: u32,

    /// How many bits easier the PoS target is than the PoW target
    pub pos_difficulty_modifier: u32,

    /// Minimum coin age before a stake may produce blocks (seconds)
    pub stake_min_age: u64,

    /// Desired block interval (seconds)
    pub target_block_time: u64,

    /// Blocks per retarget window
    pub retarget_window: u64,

    /// Reward per block in base units
    pub block_reward: u64,

    /// Share of the block reward paid to stakers
    pub reward_percentage: u64,

    /// Require PoW blocks to carry the expected compact bits
    pub enforce_difficulty: bool,

    /// How many recent block ids feed the stake modifier
    pub stake_modifier_depth: usize,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        Self {
            pow_difficulty_bits: 24,
            pos_difficulty_modifier: 4,
            stake_min_age: 8 * 60 * 60,
            target_block_time: BLOCK_TIME,
            retarget_window: 2016,
            block_reward: 50 * BASE_UNITS_PER_COIN,
            reward_percentage: 33,
            enforce_difficulty: true,
            stake_modifier_depth: 8,
        }
    }
}

impl ConsensusParams {
    /// Fast parameters for local testnets
    pub fn testnet() -> Self {
        Self {
            pow_difficulty_bits: 8,
            stake_min_age: 60,
            target_block_time: 5,
            retarget_window: 10,
            ..Self::default()
        }
    }

    /// Compact bits of the initial PoW target
    pub fn initial_bits(&self) -> u32 {
        Target::from_leading_zero_bits(self.pow_difficulty_bits).to_compact()
    }
}

/// Easiest target any PoW block may use
pub fn pow_limit() -> Target {
    Target::from_compact(Target::max().to_compact()).unwrap_or_else(|_| Target::max())
}

/// Difficulty and stake-kernel rules over a chain prefix
#[derive(Debug, Clone, Default)]
pub struct ConsensusPolicy {
    params: ConsensusParams,
}

impl ConsensusPolicy {
    /// Create a policy from parameters
    pub fn new(params: ConsensusParams) -> Self {
        Self { params }
    }

    /// Parameters in use
    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    /// PoW bits for the block following `chain`
    pub fn next_pow_bits(&self, chain: &[Block]) -> Result<u32> {
        if chain.is_empty() {
            return Ok(self.params.initial_bits());
        }

        let parent_bits = chain
            .iter()
            .rev()
            .find(|b| !b.header.is_proof_of_stake())
            .map_or_else(|| self.params.initial_bits(), |b| b.header.bits);

        let window = self.params.retarget_window;
        let height = chain.len() as u64;
        if window < 2 || height % window != 0 {
            return Ok(parent_bits);
        }

        let start = chain.len() - window as usize;
        let first = u64::from(chain[start].header.timestamp);
        let last = u64::from(chain[chain.len() - 1].header.timestamp);
        let bits = self.retarget(parent_bits, last.saturating_sub(first), window - 1)?;
        debug!(
            height,
            old_bits = format!("0x{parent_bits:08x}"),
            new_bits = format!("0x{bits:08x}"),
            "Retargeted difficulty"
        );
        Ok(bits)
    }

    /// Compact bits the block following `chain` must carry
    pub fn expected_bits(&self, chain: &[Block], proof_of_stake: bool) -> Result<u32> {
        let pow_bits = self.next_pow_bits(chain)?;
        if proof_of_stake {
            self.pos_bits(pow_bits)
        } else {
            Ok(pow_bits)
        }
    }

    /// Scale `old_bits` by the observed span over `intervals` block gaps
    ///
    /// The factor is clamped to `[1/4, 4]`. A harder target rounds its
    /// compact form up and an easier one rounds down, so the clamp holds
    /// exactly after encoding. The result never exceeds the PoW limit.
    pub fn retarget(&self, old_bits: u32, actual_span: u64, intervals: u64) -> Result<u32> {
        let old = Target::from_compact(old_bits)?;
        let expected = self.params.target_block_time.max(1) * intervals.max(1);

        let (numerator, denominator) = if actual_span.saturating_mul(4) < expected {
            (1, 4)
        } else if actual_span > expected.saturating_mul(4) {
            (4, 1)
        } else {
            (actual_span, expected)
        };

        let harder = numerator < denominator;
        let scaled = old.scale(numerator, denominator, harder).min(pow_limit());
        let bits = if harder {
            scaled.to_compact_rounded_up()
        } else {
            scaled.to_compact()
        };
        Ok(bits)
    }

    /// PoS target derived from PoW bits
    pub fn pos_target(&self, pow_bits: u32) -> Result<Target> {
        Ok(Target::from_compact(pow_bits)?
            .eased_by(self.params.pos_difficulty_modifier)
            .min(pow_limit()))
    }

    /// Compact form of [`Self::pos_target`]
    pub fn pos_bits(&self, pow_bits: u32) -> Result<u32> {
        Ok(self.pos_target(pow_bits)?.to_compact())
    }

    /// Reward share paid to stakers, in base units
    pub fn staking_pool(&self) -> u64 {
        self.params.block_reward * self.params.reward_percentage / 100
    }

    /// Whether a stake with `coin_age` wins the kernel lottery
    pub fn is_stake_eligible(
        &self,
        coin_age: u64,
        recent_ids: &[BlockId],
        stake_id: &StakeId,
        pos_target: &Target,
    ) -> bool {
        if coin_age < self.params.stake_min_age {
            return false;
        }
        let modifier = stake_modifier(recent_ids, stake_id);
        pos_target.is_met_by(&stake_kernel(&modifier, coin_age))
    }
}

/// `Tribus(recent block ids || stake id)`
pub fn stake_modifier(recent_ids: &[BlockId], stake_id: &StakeId) -> Digest512 {
    let mut data = Vec::with_capacity((recent_ids.len() + 1) * stake_id.len());
    for id in recent_ids {
        data.extend_from_slice(id);
    }
    data.extend_from_slice(stake_id);
    tribus(&data)
}

/// `Tribus(stake modifier || coin age)`
pub fn stake_kernel(modifier: &Digest512, coin_age: u64) -> Digest512 {
    let mut data = Vec::with_capacity(modifier.len() + 8);
    data.extend_from_slice(modifier);
    data.extend_from_slice(&coin_age.to_le_bytes());
    tribus(&data)
}
