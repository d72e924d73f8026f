//! Value transfers and the pending transaction pool

use crate::{ConsensusError, Result};
use qpow_core::{qhash, Digest512};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

/// Sender name used by block-reward transactions
pub const COINBASE_SENDER: &str = "coinbase";

/// A transfer between two named accounts
///
/// The field order below is the canonical JSON order; it must not change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    /// Sending account
    pub sender: String,

    /// Receiving account
    pub recipient: String,

    /// Transferred amount, finite and non-negative
    pub amount: f64,

    /// Opaque signature bytes (hex in JSON)
    #[serde(with = "hex")]
    pub signature: Vec<u8>,

    /// Creation time in seconds since the epoch
    pub timestamp: u64,

    /// Whether the signature claims the quantum-resistant scheme
    pub is_quantum_signed: bool,

    /// Replay guard, unique per sender
    pub nonce: u64,
}

impl Transaction {
    /// Create a classical transfer stamped with the current time
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        amount: f64,
        signature: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            sender: sender.into(),
            recipient: recipient.into(),
            amount,
            signature: signature.into(),
            timestamp: unix_now(),
            is_quantum_signed: false,
            nonce: 0,
        }
    }

    /// Block reward paid to `recipient`; the nonce is the block height
    pub fn coinbase(recipient: impl Into<String>, amount: f64, height: u64) -> Self {
        Self {
            sender: COINBASE_SENDER.to_string(),
            recipient: recipient.into(),
            amount,
            signature: COINBASE_SENDER.as_bytes().to_vec(),
            timestamp: unix_now(),
            is_quantum_signed: false,
            nonce: height,
        }
    }

    /// Set the replay nonce
    pub fn with_nonce(mut self, nonce: u64) -> Self {
        self.nonce = nonce;
        self
    }

    /// Set the timestamp
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Mark the signature as quantum-resistant
    pub fn quantum_signed(mut self) -> Self {
        self.is_quantum_signed = true;
        self
    }

    /// Whether this is a block-reward transaction
    pub fn is_coinbase(&self) -> bool {
        self.sender == COINBASE_SENDER
    }

    /// Whether the amount is finite and non-negative
    pub fn has_valid_amount(&self) -> bool {
        self.amount.is_finite() && self.amount >= 0.0
    }

    /// Canonical JSON encoding
    pub fn to_canonical_json(&self) -> Result<Vec<u8>> {
        if !self.amount.is_finite() {
            return Err(ConsensusError::InvalidTransaction(format!(
                "amount {} has no JSON encoding",
                self.amount
            )));
        }
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a canonical JSON encoding
    pub fn from_canonical_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| ConsensusError::Decode(e.to_string()))
    }

    /// 512-bit digest of the canonical JSON
    pub fn hash(&self) -> Result<Digest512> {
        Ok(qhash(&self.to_canonical_json()?))
    }

    /// Hex transaction id (the full digest)
    pub fn txid(&self) -> Result<String> {
        Ok(hex::encode(self.hash()?))
    }

    /// Bytes covered by the signature (every field except the signature)
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        let signable = SignableTx {
            sender: &self.sender,
            recipient: &self.recipient,
            amount: self.amount,
            timestamp: self.timestamp,
            is_quantum_signed: self.is_quantum_signed,
            nonce: self.nonce,
        };
        Ok(serde_json::to_vec(&signable)?)
    }
}

/// Transaction data for signing (excludes signature to avoid recursion)
#[derive(Serialize)]
struct SignableTx<'a> {
    sender: &'a str,
    recipient: &'a str,
    amount: f64,
    timestamp: u64,
    is_quantum_signed: bool,
    nonce: u64,
}

/// Seconds since the epoch, clamped at zero
pub(crate) fn unix_now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}

/// Bounded pool of transactions waiting for a block
#[derive(Debug)]
pub struct TransactionPool {
    /// Pending transactions by hex id
    pending: HashMap<String, Transaction>,

    /// Arrival order of pending ids
    order: VecDeque<String>,

    /// `(sender, nonce)` pairs already pending or included
    used_nonces: HashSet<(String, u64)>,

    /// Maximum number of pending transactions
    max_size: usize,
}

impl Default for TransactionPool {
    fn default() -> Self {
        Self::new(crate::constants::MAX_POOL_SIZE)
    }
}

impl TransactionPool {
    /// Create a new transaction pool
    pub fn new(max_size: usize) -> Self {
        Self {
            pending: HashMap::new(),
            order: VecDeque::new(),
            used_nonces: HashSet::new(),
            max_size,
        }
    }

    /// Add a transaction to the pool, returning its id
    pub fn add_transaction(&mut self, tx: Transaction) -> Result<String> {
        if tx.is_coinbase() {
            return Err(ConsensusError::InvalidTransaction(
                "coinbase transactions cannot be pooled".to_string(),
            ));
        }
        if !tx.has_valid_amount() {
            return Err(ConsensusError::InvalidTransaction(format!(
                "amount {} must be finite and non-negative",
                tx.amount
            )));
        }

        let txid = tx.txid()?;
        if self.pending.contains_key(&txid) {
            return Err(ConsensusError::DuplicateTransaction);
        }

        let replay_key = (tx.sender.clone(), tx.nonce);
        if self.used_nonces.contains(&replay_key) {
            return Err(ConsensusError::ReplayedNonce {
                sender: tx.sender,
                nonce: tx.nonce,
            });
        }

        if self.pending.len() >= self.max_size {
            return Err(ConsensusError::TransactionPoolFull);
        }

        self.used_nonces.insert(replay_key);
        self.order.push_back(txid.clone());
        self.pending.insert(txid.clone(), tx);
        Ok(txid)
    }

    /// Look up a pending transaction by id
    pub fn get(&self, txid: &str) -> Option<&Transaction> {
        self.pending.get(txid)
    }

    /// Whether a transaction id is pending
    pub fn contains(&self, txid: &str) -> bool {
        self.pending.contains_key(txid)
    }

    /// Oldest pending transactions, up to `limit`, left in the pool
    pub fn select(&self, limit: usize) -> Vec<Transaction> {
        self.order
            .iter()
            .filter_map(|id| self.pending.get(id))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Forget transactions that an admitted block included
    ///
    /// Their `(sender, nonce)` pairs stay reserved. Returns how many pending
    /// entries were dropped.
    pub fn remove_included(&mut self, included: &[Transaction]) -> usize {
        let mut removed = 0;
        for tx in included.iter().filter(|tx| !tx.is_coinbase()) {
            self.used_nonces.insert((tx.sender.clone(), tx.nonce));

            // A pending entry with the same sender and nonce is now a replay
            let conflicting: Vec<String> = self
                .pending
                .iter()
                .filter(|(_, p)| p.sender == tx.sender && p.nonce == tx.nonce)
                .map(|(id, _)| id.clone())
                .collect();
            for id in conflicting {
                self.pending.remove(&id);
                removed += 1;
            }
        }
        self.order.retain(|id| self.pending.contains_key(id));
        removed
    }

    /// Get pending transaction count
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
