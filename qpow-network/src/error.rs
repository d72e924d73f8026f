//! Error types for the qPoW network layer

use qpow_consensus::ConsensusError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Malformed message: {0}")]
    Decode(String),

    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Network connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection to {0} is closed")]
    ConnectionClosed(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Node is already running")]
    AlreadyRunning,

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Consensus error: {0}")]
    Consensus(#[from] ConsensusError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetworkError {
    /// Whether the error came from a malformed peer message
    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decode(_))
    }
}

impl From<serde_json::Error> for NetworkError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

impl From<base64::DecodeError> for NetworkError {
    fn from(e: base64::DecodeError) -> Self {
        Self::Decode(e.to_string())
    }
}
