//! Error types for the node process

use qpow_consensus::ConsensusError;
use qpow_network::NetworkError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Consensus error: {0}")]
    Consensus(#[from] ConsensusError),

    #[error("Mining task failed: {0}")]
    Worker(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
