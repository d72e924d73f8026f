//! Wire messages and their framing
//!
//! A frame is a 4-byte little-endian length followed by that many bytes of
//! UTF-8 JSON. The JSON object always carries a string `type`; the remaining
//! fields are the payload. Blocks travel as base64 of their binary encoding,
//! transactions as base64 of their canonical JSON.

use crate::{NetworkError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use qpow_consensus::{Block, Transaction};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Width of the frame length prefix
pub const FRAME_HEADER_LEN: usize = 4;

/// A decoded frame whose `type` may or may not be known to this node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Envelope {
    /// Envelope of `kind` with no fields
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: Map::new(),
        }
    }

    /// Parse a frame body
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Frame body bytes
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| NetworkError::SerializationError(e.to_string()))
    }

    /// Interpret the envelope as one of the known messages
    pub fn into_message(self) -> Result<Message> {
        let mut object = self.payload;
        object.insert("type".to_string(), Value::String(self.kind));
        Ok(serde_json::from_value(Value::Object(object))?)
    }
}

/// Messages understood by the default handlers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// An offered block
    Block { block: String },

    /// An offered transaction
    Transaction { transaction: String },

    /// Request for blocks starting at a height
    GetBlocks { from_height: u64, max: u32 },

    /// Request for pooled transactions by txid
    GetTransactions { ids: Vec<String> },

    /// Reply to `get_blocks`
    Chain { blocks: Vec<String> },

    /// Reply to `get_transactions`
    Transactions { transactions: Vec<String> },
}

impl Message {
    pub const BLOCK: &'static str = "block";
    pub const TRANSACTION: &'static str = "transaction";
    pub const GET_BLOCKS: &'static str = "get_blocks";
    pub const GET_TRANSACTIONS: &'static str = "get_transactions";
    pub const CHAIN: &'static str = "chain";
    pub const TRANSACTIONS: &'static str = "transactions";

    /// `block` message carrying the encoded block
    pub fn block(block: &Block) -> Result<Self> {
        Ok(Self::Block {
            block: encode_block(block)?,
        })
    }

    /// `transaction` message carrying the encoded transaction
    pub fn transaction(tx: &Transaction) -> Result<Self> {
        Ok(Self::Transaction {
            transaction: encode_transaction(tx)?,
        })
    }

    /// `chain` reply with every block encoded
    pub fn chain(blocks: &[Block]) -> Result<Self> {
        let blocks = blocks.iter().map(encode_block).collect::<Result<_>>()?;
        Ok(Self::Chain { blocks })
    }

    /// `transactions` reply with every transaction encoded
    pub fn transactions(txs: &[Transaction]) -> Result<Self> {
        let transactions = txs.iter().map(encode_transaction).collect::<Result<_>>()?;
        Ok(Self::Transactions { transactions })
    }

    /// Value of the `type` field
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Block { .. } => Self::BLOCK,
            Self::Transaction { .. } => Self::TRANSACTION,
            Self::GetBlocks { .. } => Self::GET_BLOCKS,
            Self::GetTransactions { .. } => Self::GET_TRANSACTIONS,
            Self::Chain { .. } => Self::CHAIN,
            Self::Transactions { .. } => Self::TRANSACTIONS,
        }
    }

    /// Flatten into the wire envelope
    pub fn into_envelope(self) -> Result<Envelope> {
        let value = serde_json::to_value(&self).map_err(|e| NetworkError::SerializationError(e.to_string()))?;
        Ok(serde_json::from_value(value)?)
    }
}

/// Base64 of the binary block encoding
pub fn encode_block(block: &Block) -> Result<String> {
    Ok(STANDARD.encode(block.encode()?))
}

/// Block from its base64 wire form
pub fn decode_block(encoded: &str) -> Result<Block> {
    let bytes = STANDARD.decode(encoded)?;
    Block::decode(&bytes).map_err(|e| NetworkError::Decode(e.to_string()))
}

/// Base64 of the canonical transaction JSON
pub fn encode_transaction(tx: &Transaction) -> Result<String> {
    Ok(STANDARD.encode(tx.to_canonical_json()?))
}

/// Transaction from its base64 wire form
pub fn decode_transaction(encoded: &str) -> Result<Transaction> {
    let bytes = STANDARD.decode(encoded)?;
    Transaction::from_canonical_json(&bytes).map_err(|e| NetworkError::Decode(e.to_string()))
}

/// Length-prefixed frame for `envelope`
pub fn encode_frame(envelope: &Envelope, max_len: usize) -> Result<Vec<u8>> {
    let body = envelope.to_vec()?;
    if body.len() > max_len {
        return Err(NetworkError::FrameTooLarge {
            len: body.len(),
            max: max_len,
        });
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Read one frame body; `None` when the peer closed the stream
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(header) as usize;
    if len > max_len {
        return Err(NetworkError::FrameTooLarge { len, max: max_len });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Write one length-prefixed envelope, refusing frames over `max_len`
pub async fn write_frame<W>(writer: &mut W, envelope: &Envelope, max_len: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(envelope, max_len)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use qpow_consensus::constants::TRIVIAL_BITS;

    const MAX: usize = 16 * 1024 * 1024;

    fn sample_block() -> Block {
        let txs = vec![
            Transaction::coinbase("miner", 50.0, 0).with_timestamp(1),
            Transaction::new("a", "b", 1.5, vec![1, 2, 3]).with_timestamp(2),
        ];
        Block::genesis(txs, TRIVIAL_BITS, 3).unwrap()
    }

    #[test]
    fn test_wire_shape() {
        let envelope = Message::GetBlocks { from_height: 4, max: 10 }.into_envelope().unwrap();
        let json: Value = serde_json::from_slice(&envelope.to_vec().unwrap()).unwrap();
        assert_eq!(json["type"], "get_blocks");
        assert_eq!(json["from_height"], 4);
        assert_eq!(json["max"], 10);
    }

    #[test]
    fn test_unknown_type_still_parses() {
        let envelope = Envelope::from_slice(br#"{"type":"ping","n":1}"#).unwrap();
        assert_eq!(envelope.kind, "ping");
        assert_eq!(envelope.payload["n"], 1);
        assert!(envelope.into_message().is_err());
    }

    #[test]
    fn test_missing_type_rejected() {
        let err = Envelope::from_slice(br#"{"block":"AA=="}"#).unwrap_err();
        assert!(err.is_decode());
    }

    #[test]
    fn test_block_payload_preserves_hash() {
        let block = sample_block();
        let envelope = Message::block(&block).unwrap().into_envelope().unwrap();
        let Message::Block { block: encoded } = envelope.into_message().unwrap() else {
            panic!("expected a block message");
        };
        assert_eq!(decode_block(&encoded).unwrap().hash(), block.hash());
    }

    #[test]
    fn test_bad_base64_is_decode_error() {
        assert!(decode_block("not base64!").unwrap_err().is_decode());
        assert!(decode_transaction(&STANDARD.encode(b"{}")).unwrap_err().is_decode());
    }

    #[test]
    fn test_frame_prefix_is_little_endian() {
        let envelope = Envelope::new("chain");
        let frame = encode_frame(&envelope, MAX).unwrap();
        let body_len = u32::from_le_bytes(frame[..4].try_into().unwrap()) as usize;
        assert_eq!(body_len, frame.len() - FRAME_HEADER_LEN);
    }

    #[tokio::test]
    async fn test_frame_read_write() {
        let envelope = Message::transaction(&Transaction::new("a", "b", 2.0, vec![9]))
            .unwrap()
            .into_envelope()
            .unwrap();
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &envelope, MAX).await.unwrap();

        let mut reader = buffer.as_slice();
        let body = read_frame(&mut reader, MAX).await.unwrap().unwrap();
        assert_eq!(Envelope::from_slice(&body).unwrap(), envelope);
        assert!(read_frame(&mut reader, MAX).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut frame = (64u32).to_le_bytes().to_vec();
        frame.extend_from_slice(&[b' '; 64]);
        let mut reader = frame.as_slice();
        assert!(matches!(
            read_frame(&mut reader, 32).await,
            Err(NetworkError::FrameTooLarge { len: 64, max: 32 })
        ));
    }
}
