//! Block validity rules
//!
//! A block is valid relative to its parent when it links to the parent id,
//! its Merkle root matches its transactions, its header digest meets the
//! target encoded in `bits`, and every transaction passes the signature
//! policy. Genesis replaces linkage with an all-zero parent.

use crate::block::{Block, BlockHeader, BLOCK_ID_LEN};
use crate::error::ValidationError;
use crate::transaction::Transaction;
use std::fmt::Debug;
use std::sync::Arc;

/// Minimum classical signature length under the default policy
pub const MIN_CLASSICAL_SIGNATURE_LEN: usize = 1;

/// Minimum quantum-resistant signature length under the default policy
pub const MIN_QUANTUM_SIGNATURE_LEN: usize = 64;

/// Pluggable check of opaque signature bytes
pub trait SignatureVerifier: Send + Sync + Debug {
    /// Whether `signature` is acceptable for `message`
    fn verify(&self, message: &[u8], signature: &[u8], quantum: bool) -> bool;
}

/// Default policy: only signature lengths are checked
#[derive(Debug, Clone)]
pub struct LengthPolicy {
    pub classical_min: usize,
    pub quantum_min: usize,
}

impl Default for LengthPolicy {
    fn default() -> Self {
        Self {
            classical_min: MIN_CLASSICAL_SIGNATURE_LEN,
            quantum_min: MIN_QUANTUM_SIGNATURE_LEN,
        }
    }
}

impl SignatureVerifier for LengthPolicy {
    fn verify(&self, _message: &[u8], signature: &[u8], quantum: bool) -> bool {
        let min = if quantum { self.quantum_min } else { self.classical_min };
        signature.len() >= min
    }
}

/// Applies the validity rules with a configurable signature policy
#[derive(Debug, Clone)]
pub struct BlockValidator {
    verifier: Arc<dyn SignatureVerifier>,
}

impl Default for BlockValidator {
    fn default() -> Self {
        Self::new(Arc::new(LengthPolicy::default()))
    }
}

impl BlockValidator {
    /// Create a validator around a signature policy
    pub fn new(verifier: Arc<dyn SignatureVerifier>) -> Self {
        Self { verifier }
    }

    /// Signature policy in use
    pub fn verifier(&self) -> &Arc<dyn SignatureVerifier> {
        &self.verifier
    }

    /// All rules for a block extending `parent`
    pub fn check_against_parent(
        &self,
        block: &Block,
        parent: &BlockHeader,
    ) -> Result<(), ValidationError> {
        let expected = parent.id();
        if block.header.prev_block_hash != expected {
            return Err(ValidationError::BadLinkage {
                expected: hex::encode(expected),
                got: hex::encode(block.header.prev_block_hash),
            });
        }
        self.check_contents(block)
    }

    /// Genesis rules: zero parent plus Merkle, work and signatures
    pub fn check_genesis(&self, block: &Block) -> Result<(), ValidationError> {
        if block.header.prev_block_hash != [0u8; BLOCK_ID_LEN] {
            return Err(ValidationError::NonZeroGenesisParent);
        }
        self.check_contents(block)
    }

    /// Boolean form of [`Self::check_against_parent`]
    pub fn is_valid(&self, block: &Block, parent: &BlockHeader) -> bool {
        self.check_against_parent(block, parent).is_ok()
    }

    /// Boolean form of [`Self::check_genesis`]
    pub fn is_valid_genesis(&self, block: &Block) -> bool {
        self.check_genesis(block).is_ok()
    }

    /// Check one transaction's amount and signature
    pub fn check_transaction(&self, index: usize, tx: &Transaction) -> Result<(), ValidationError> {
        if !tx.has_valid_amount() {
            return Err(ValidationError::InvalidAmount { index });
        }
        let message = tx
            .signing_bytes()
            .map_err(|_| ValidationError::UnhashableTransaction { index })?;
        if !self.verifier.verify(&message, &tx.signature, tx.is_quantum_signed) {
            return Err(ValidationError::BadSignature { index });
        }
        Ok(())
    }

    fn check_contents(&self, block: &Block) -> Result<(), ValidationError> {
        check_merkle(block)?;
        check_proof_of_work(&block.header)?;
        for (index, tx) in block.transactions.iter().enumerate() {
            self.check_transaction(index, tx)?;
        }
        Ok(())
    }
}

/// The stored Merkle root must match the transactions
pub fn check_merkle(block: &Block) -> Result<(), ValidationError> {
    match block.compute_merkle_root() {
        Ok(root) if root == block.header.merkle_root => Ok(()),
        Ok(_) => Err(ValidationError::MerkleMismatch),
        Err(_) => {
            let index = block
                .transactions
                .iter()
                .position(|tx| !tx.has_valid_amount())
                .unwrap_or(0);
            Err(ValidationError::InvalidAmount { index })
        }
    }
}

/// The header digest must be strictly below the target in `bits`
pub fn check_proof_of_work(header: &BlockHeader) -> Result<(), ValidationError> {
    let target = header
        .target()
        .map_err(|_| ValidationError::InvalidBits(header.bits))?;
    if !target.is_met_by(&header.hash()) {
        return Err(ValidationError::InsufficientWork);
    }
    Ok(())
}
