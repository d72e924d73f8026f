//! Block headers, blocks, Merkle roots and the binary block codec

use crate::transaction::{unix_now, Transaction};
use crate::{ConsensusError, Result};
use qpow_core::{qhash, Digest512, Target, DIGEST_LEN};
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Read};

/// Packed header size in bytes
pub const HEADER_LEN: usize = 112;

/// Length of a block id
pub const BLOCK_ID_LEN: usize = 32;

/// Truncated header hash stored in a child's `prev_block_hash`
pub type BlockId = [u8; BLOCK_ID_LEN];

/// Current header version
pub const BLOCK_VERSION: u32 = 1;

/// Version bit marking a stake-path block
pub const STAKE_FLAG: u32 = 0x8000_0000;

/// Upper bound on the size of one encoded transaction
const MAX_TX_LEN: usize = 1 << 20;

/// Fixed-width block header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_block_hash: BlockId,
    pub merkle_root: Digest512,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// Little-endian packing: version, parent, merkle root, time, bits, nonce
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(&self.prev_block_hash);
        out[36..100].copy_from_slice(&self.merkle_root);
        out[100..104].copy_from_slice(&self.timestamp.to_le_bytes());
        out[104..108].copy_from_slice(&self.bits.to_le_bytes());
        out[108..112].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    /// Parse a packed header
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HEADER_LEN {
            return Err(ConsensusError::Decode(format!(
                "header must be {HEADER_LEN} bytes, got {}",
                bytes.len()
            )));
        }

        let word = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let mut prev_block_hash = [0u8; BLOCK_ID_LEN];
        prev_block_hash.copy_from_slice(&bytes[4..36]);
        let mut merkle_root = [0u8; DIGEST_LEN];
        merkle_root.copy_from_slice(&bytes[36..100]);

        Ok(Self {
            version: word(0),
            prev_block_hash,
            merkle_root,
            timestamp: word(100),
            bits: word(104),
            nonce: word(108),
        })
    }

    /// Digest of the packed header
    pub fn hash(&self) -> Digest512 {
        qhash(&self.to_bytes())
    }

    /// First 32 bytes of the header digest
    pub fn id(&self) -> BlockId {
        truncate_id(&self.hash())
    }

    /// Expanded target for `bits`
    pub fn target(&self) -> Result<Target> {
        Ok(Target::from_compact(self.bits)?)
    }

    /// Whether the header digest meets its own target
    pub fn meets_target(&self) -> bool {
        self.target().map(|t| t.is_met_by(&self.hash())).unwrap_or(false)
    }

    /// Whether the stake flag is set
    pub fn is_proof_of_stake(&self) -> bool {
        self.version & STAKE_FLAG != 0
    }
}

/// A header and its ordered transactions
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Candidate block on top of `prev_block_hash`, stamped now, nonce zero
    pub fn new(prev_block_hash: BlockId, transactions: Vec<Transaction>, bits: u32) -> Result<Self> {
        let timestamp = u32::try_from(unix_now()).unwrap_or(u32::MAX);
        Self::with_timestamp(prev_block_hash, transactions, bits, timestamp)
    }

    /// Candidate block with an explicit timestamp
    pub fn with_timestamp(
        prev_block_hash: BlockId,
        transactions: Vec<Transaction>,
        bits: u32,
        timestamp: u32,
    ) -> Result<Self> {
        let merkle_root = merkle_root_of(&transactions)?;
        Ok(Self {
            header: BlockHeader {
                version: BLOCK_VERSION,
                prev_block_hash,
                merkle_root,
                timestamp,
                bits,
                nonce: 0,
            },
            transactions,
        })
    }

    /// Genesis block: zero parent, the given coinbase transactions
    pub fn genesis(transactions: Vec<Transaction>, bits: u32, timestamp: u32) -> Result<Self> {
        Self::with_timestamp([0u8; BLOCK_ID_LEN], transactions, bits, timestamp)
    }

    /// Mark the block as stake-path
    pub fn into_proof_of_stake(mut self) -> Self {
        self.header.version |= STAKE_FLAG;
        self
    }

    /// Digest of the header
    pub fn hash(&self) -> Digest512 {
        self.header.hash()
    }

    /// Block id (truncated header digest)
    pub fn id(&self) -> BlockId {
        self.header.id()
    }

    /// Merkle root recomputed from the transactions
    pub fn compute_merkle_root(&self) -> Result<Digest512> {
        merkle_root_of(&self.transactions)
    }

    /// Recompute and store the Merkle root after editing transactions
    pub fn refresh_merkle_root(&mut self) -> Result<()> {
        self.header.merkle_root = self.compute_merkle_root()?;
        Ok(())
    }

    /// Whether the stored Merkle root matches the transactions
    pub fn has_valid_merkle_root(&self) -> bool {
        self.compute_merkle_root()
            .map(|root| root == self.header.merkle_root)
            .unwrap_or(false)
    }

    /// Binary encoding: header, tx count, length-prefixed canonical JSON
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(HEADER_LEN + 4 + self.transactions.len() * 192);
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&len_u32(self.transactions.len())?.to_le_bytes());
        for tx in &self.transactions {
            let json = tx.to_canonical_json()?;
            out.extend_from_slice(&len_u32(json.len())?.to_le_bytes());
            out.extend_from_slice(&json);
        }
        Ok(out)
    }

    /// Parse the binary encoding; trailing bytes are an error
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);

        let mut header_bytes = [0u8; HEADER_LEN];
        read_exact(&mut cursor, &mut header_bytes, "header")?;
        let header = BlockHeader::from_bytes(&header_bytes)?;

        let count = read_u32(&mut cursor, "transaction count")? as usize;
        let remaining = bytes.len() - cursor.position() as usize;
        if count > remaining / 4 {
            return Err(ConsensusError::Decode(format!(
                "transaction count {count} exceeds the remaining {remaining} bytes"
            )));
        }

        let mut transactions = Vec::with_capacity(count);
        for index in 0..count {
            let len = read_u32(&mut cursor, "transaction length")? as usize;
            if len > MAX_TX_LEN {
                return Err(ConsensusError::Decode(format!(
                    "transaction {index} is {len} bytes"
                )));
            }
            let mut json = vec![0u8; len];
            read_exact(&mut cursor, &mut json, "transaction body")?;
            transactions.push(Transaction::from_canonical_json(&json)?);
        }

        if (cursor.position() as usize) != bytes.len() {
            return Err(ConsensusError::Decode(format!(
                "{} trailing bytes after block",
                bytes.len() - cursor.position() as usize
            )));
        }

        Ok(Self { header, transactions })
    }

    /// Classical-compatibility JSON view
    pub fn to_classic_view(&self) -> Result<ClassicBlockView> {
        let tx = self
            .transactions
            .iter()
            .map(|t| {
                Ok(ClassicTxView {
                    txid: hex::encode(&t.hash()?[..BLOCK_ID_LEN]),
                    sender: t.sender.clone(),
                    recipient: t.recipient.clone(),
                    amount: t.amount,
                    signature: hex::encode(&t.signature),
                    is_quantum: t.is_quantum_signed,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ClassicBlockView {
            hash: hex::encode(self.id()),
            version: self.header.version,
            previousblockhash: hex::encode(self.header.prev_block_hash),
            merkleroot: hex::encode(self.header.merkle_root),
            time: self.header.timestamp,
            bits: format!("0x{:08x}", self.header.bits),
            nonce: self.header.nonce,
            tx,
        })
    }
}

/// Bitcoin-style JSON rendering of a block; `hash` and `txid` are truncated
/// to 32 bytes for display only
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassicBlockView {
    pub hash: String,
    pub version: u32,
    pub previousblockhash: String,
    pub merkleroot: String,
    pub time: u32,
    pub bits: String,
    pub nonce: u32,
    pub tx: Vec<ClassicTxView>,
}

/// Transaction entry of [`ClassicBlockView`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassicTxView {
    pub txid: String,
    pub sender: String,
    pub recipient: String,
    pub amount: f64,
    pub signature: String,
    pub is_quantum: bool,
}

/// Merkle root over transaction digests
///
/// No leaves give 64 zero bytes and one leaf is its own root. Odd levels
/// duplicate their last element.
pub fn merkle_root(leaves: &[Digest512]) -> Digest512 {
    if leaves.is_empty() {
        return [0u8; DIGEST_LEN];
    }

    let mut level = leaves.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let left = &pair[0];
                let right = pair.get(1).unwrap_or(left);
                let mut joined = [0u8; 2 * DIGEST_LEN];
                joined[..DIGEST_LEN].copy_from_slice(left);
                joined[DIGEST_LEN..].copy_from_slice(right);
                qhash(&joined)
            })
            .collect();
    }
    level[0]
}

/// Merkle root of a transaction list
pub fn merkle_root_of(transactions: &[Transaction]) -> Result<Digest512> {
    let leaves = transactions
        .iter()
        .map(Transaction::hash)
        .collect::<Result<Vec<_>>>()?;
    Ok(merkle_root(&leaves))
}

/// First 32 bytes of a digest
pub fn truncate_id(digest: &Digest512) -> BlockId {
    let mut id = [0u8; BLOCK_ID_LEN];
    id.copy_from_slice(&digest[..BLOCK_ID_LEN]);
    id
}

fn len_u32(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| ConsensusError::SerializationError(format!("length {len} exceeds u32")))
}

fn read_exact(cursor: &mut Cursor<&[u8]>, buf: &mut [u8], what: &str) -> Result<()> {
    cursor
        .read_exact(buf)
        .map_err(|_| ConsensusError::Decode(format!("truncated {what}")))
}

fn read_u32(cursor: &mut Cursor<&[u8]>, what: &str) -> Result<u32> {
    let mut word = [0u8; 4];
    read_exact(cursor, &mut word, what)?;
    Ok(u32::from_le_bytes(word))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> Block {
        let txs = vec![
            Transaction::coinbase("miner", 50.0, 1).with_timestamp(1_700_000_000),
            Transaction::new("alice", "bob", 1.25, vec![9; 4])
                .with_nonce(3)
                .with_timestamp(1_700_000_001),
        ];
        let mut block = Block::with_timestamp([7u8; 32], txs, 0x1f00_ffff, 1_700_000_002).unwrap();
        block.header.nonce = 42;
        block
    }

    #[test]
    fn test_header_packing_layout() {
        let header = sample_block().header;
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(&bytes[0..4], &1u32.to_le_bytes());
        assert_eq!(&bytes[4..36], &[7u8; 32]);
        assert_eq!(&bytes[104..108], &0x1f00_ffffu32.to_le_bytes());
        assert_eq!(&bytes[108..112], &42u32.to_le_bytes());
        assert_eq!(BlockHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_header_rejects_wrong_length() {
        assert!(BlockHeader::from_bytes(&[0u8; 111]).is_err());
    }

    #[test]
    fn test_id_is_hash_prefix() {
        let block = sample_block();
        assert_eq!(&block.id()[..], &block.hash()[..32]);
    }

    #[test]
    fn test_nonce_changes_hash() {
        let mut block = sample_block();
        let before = block.hash();
        block.header.nonce += 1;
        assert_ne!(before, block.hash());
    }

    #[test]
    fn test_merkle_empty_and_singleton() {
        assert_eq!(merkle_root(&[]), [0u8; 64]);
        let leaf = qhash(b"only");
        assert_eq!(merkle_root(&[leaf]), leaf);
    }

    #[test]
    fn test_merkle_odd_level_duplicates_last() {
        let a = qhash(b"a");
        let b = qhash(b"b");
        let c = qhash(b"c");
        assert_eq!(merkle_root(&[a, b, c]), merkle_root(&[a, b, c, c]));
        assert_ne!(merkle_root(&[a, b]), merkle_root(&[b, a]));
    }

    #[test]
    fn test_block_codec_roundtrip() {
        let block = sample_block();
        let bytes = block.encode().unwrap();
        let decoded = Block::decode(&bytes).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.hash(), block.hash());
    }

    #[test]
    fn test_decode_rejects_truncated_and_trailing() {
        let bytes = sample_block().encode().unwrap();
        assert!(Block::decode(&bytes[..bytes.len() - 1]).is_err());
        assert!(Block::decode(&bytes[..50]).is_err());

        let mut extended = bytes.clone();
        extended.push(0);
        assert!(Block::decode(&extended).is_err());
    }

    #[test]
    fn test_decode_rejects_absurd_count() {
        let mut bytes = sample_block().header.to_bytes().to_vec();
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(Block::decode(&bytes).is_err());
    }

    #[test]
    fn test_stake_flag() {
        let block = sample_block();
        assert!(!block.header.is_proof_of_stake());
        let staked = block.into_proof_of_stake();
        assert!(staked.header.is_proof_of_stake());
        assert_eq!(staked.header.version & !STAKE_FLAG, BLOCK_VERSION);
    }

    #[test]
    fn test_classic_view() {
        let block = sample_block();
        let view = block.to_classic_view().unwrap();
        assert_eq!(view.hash.len(), 64);
        assert_eq!(view.merkleroot.len(), 128);
        assert_eq!(view.bits, "0x1f00ffff");
        assert_eq!(view.nonce, 42);
        assert_eq!(view.tx.len(), 2);
        assert_eq!(view.tx[1].signature, "09090909");
        assert_eq!(view.tx[1].txid.len(), 64);

        let json = serde_json::to_value(&view).unwrap();
        assert!(json.get("previousblockhash").is_some());
        assert_eq!(json["tx"][0]["is_quantum"], false);
    }

    #[test]
    fn test_empty_block_has_zero_root() {
        let block = Block::genesis(Vec::new(), 0x207f_ffff, 0).unwrap();
        assert_eq!(block.header.merkle_root, [0u8; 64]);
        assert!(block.has_valid_merkle_root());
    }
}
