//! qPoW Consensus - blocks, validation and hybrid PoW/PoS rules
//!
//! This crate holds the chain data model and everything that decides whether
//! a block may be admitted: the validity rules, the difficulty and stake
//! policy, the Fortuna stake registry, the chain manager that owns the
//! canonical chain, and the optional stylometric authorship layer.

pub mod block;
pub mod chain;
pub mod consensus;
pub mod error;
pub mod fortuna;
pub mod stylometry;
pub mod transaction;
pub mod validator;

pub use block::{merkle_root, Block, BlockHeader, BlockId, ClassicBlockView, HEADER_LEN};
pub use chain::{default_genesis, ChainManager};
pub use consensus::{ConsensusParams, ConsensusPolicy};
pub use error::{ConsensusError, StakeError, ValidationError};
pub use fortuna::{CollateralPolicy, FortunaRegistry, RewardDistribution, StakeId, StakeRecord};
pub use stylometry::{Fingerprint, StylometricValidator, StylometryConfig};
pub use transaction::{Transaction, TransactionPool};
pub use validator::{BlockValidator, LengthPolicy, SignatureVerifier};

/// Result type for consensus operations
pub type Result<T> = std::result::Result<T, ConsensusError>;

/// Block height in the chain
pub type BlockHeight = u64;

/// Consensus protocol version
pub const CONSENSUS_VERSION: &str = "0.1.0";

/// Network configuration constants
pub mod constants {
    /// Base units in one coin
    pub const BASE_UNITS_PER_COIN: u64 = 100_000_000;

    /// Block time target (in seconds)
    pub const BLOCK_TIME: u64 = 30;

    /// Maximum transactions per block
    pub const MAX_TRANSACTIONS_PER_BLOCK: usize = 1000;

    /// Maximum pending transactions in a pool
    pub const MAX_POOL_SIZE: usize = 10_000;

    /// Easiest practical compact target; roughly every other hash meets it
    pub const TRIVIAL_BITS: u32 = 0x207f_ffff;

    /// Timestamp of the default genesis block
    pub const GENESIS_TIMESTAMP: u64 = 1_700_000_000;

    /// Leading bytes of a chain snapshot file
    pub const SNAPSHOT_MAGIC: &[u8; 4] = b"QPOW";
}
