//! qPoW Network Layer - framed JSON peer protocol and block propagation
//!
//! Every node listens on a TCP port and serves each connection on its own
//! task. Frames carry a JSON object tagged by `type`; handlers registered per
//! type answer on the same connection. Blocks and transactions admitted
//! locally are pushed to every known peer, and receivers drop what they have
//! already seen.

pub mod error;
pub mod handler;
pub mod message;
pub mod node;
pub mod peer;

pub use error::NetworkError;
pub use handler::{HandlerRegistry, MessageHandler};
pub use message::{Envelope, Message};
pub use node::{Node, NodeContext, SharedChain, SharedPool};
pub use peer::{PeerInfo, PeerTable, SeenCache};

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Result type for network operations
pub type Result<T> = std::result::Result<T, NetworkError>;

/// Network protocol version
pub const NETWORK_VERSION: &str = "0.1.0";

/// Largest accepted frame body
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Network configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Identifier other nodes know us by
    pub node_id: String,

    /// Listening host
    pub host: String,

    /// Listening port; 0 picks a free one
    pub port: u16,

    /// Idle read limit per connection (seconds)
    pub read_timeout_secs: u64,

    /// Outbound connect limit (seconds)
    pub connect_timeout_secs: u64,

    /// Time connections get to finish after shutdown (milliseconds)
    pub shutdown_grace_ms: u64,

    /// Largest frame body in bytes
    pub max_frame_len: usize,

    /// Malformed messages tolerated before a connection is closed
    pub decode_error_threshold: u32,

    /// Most blocks sent in one `chain` reply
    pub max_blocks_per_message: u32,

    /// Remembered block and transaction hashes
    pub seen_capacity: usize,

    /// Queued outgoing frames per connection
    pub outbox_capacity: usize,

    /// Pending transaction limit
    pub pool_capacity: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            node_id: "node".to_string(),
            host: "127.0.0.1".to_string(),
            port: 9333,
            read_timeout_secs: 10,
            connect_timeout_secs: 5,
            shutdown_grace_ms: 2_000,
            max_frame_len: MAX_FRAME_LEN,
            decode_error_threshold: 3,
            max_blocks_per_message: 10_000,
            seen_capacity: 10_000,
            outbox_capacity: 64,
            pool_capacity: qpow_consensus::constants::MAX_POOL_SIZE,
        }
    }
}

impl NetworkConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
