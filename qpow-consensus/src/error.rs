//! Error types for the consensus layer

use qpow_core::CoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("Duplicate transaction")]
    DuplicateTransaction,

    #[error("Transaction pool is full")]
    TransactionPoolFull,

    #[error("Nonce {nonce} already used by {sender}")]
    ReplayedNonce { sender: String, nonce: u64 },

    #[error("Block validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Stake error: {0}")]
    Stake(#[from] StakeError),

    #[error("Chain is already initialized")]
    AlreadyInitialized,

    #[error("Chain has no genesis block")]
    NotInitialized,

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for ConsensusError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

/// Reason a block was refused by the validation rules
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Block does not link to its parent: expected {expected}, got {got}")]
    BadLinkage { expected: String, got: String },

    #[error("Genesis block must have an all-zero parent")]
    NonZeroGenesisParent,

    #[error("Merkle root does not match the transactions")]
    MerkleMismatch,

    #[error("Compact target 0x{0:08x} is invalid")]
    InvalidBits(u32),

    #[error("Block hash does not meet its target")]
    InsufficientWork,

    #[error("Unexpected difficulty: expected 0x{expected:08x}, got 0x{got:08x}")]
    UnexpectedBits { expected: u32, got: u32 },

    #[error("Transaction {index} has an invalid signature")]
    BadSignature { index: usize },

    #[error("Transaction {index} has an invalid amount")]
    InvalidAmount { index: usize },

    #[error("Transaction {index} could not be serialized")]
    UnhashableTransaction { index: usize },

    #[error("Stake-path block is missing its stake kernel transaction")]
    MissingStakeKernel,

    #[error("Stake {0} is unknown or retired")]
    UnknownStake(String),

    #[error("Stake {0} is not eligible at this height")]
    IneligibleStake(String),

    #[error("Block authorship rejected for {0}")]
    AuthorRejected(String),
}

/// Failures of the Fortuna stake registry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StakeError {
    #[error("Collateral reference rejected: {0}")]
    BadCollateral(String),

    #[error("Stake registration signature rejected")]
    BadSignature,

    #[error("Stake {0} is already registered")]
    DuplicateStake(String),

    #[error("Stake {0} is not registered")]
    UnknownStake(String),
}
