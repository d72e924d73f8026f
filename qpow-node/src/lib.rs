//! qPoW Node - configuration, mining worker and process runtime
//!
//! Ties the consensus, miner and network crates into a runnable node: TOML
//! settings, a background worker that mines on the current head, and an
//! in-process testnet for exercising several nodes on loopback.

pub mod error;
pub mod runtime;
pub mod settings;
pub mod testnet;
pub mod worker;

pub use error::NodeError;
pub use runtime::NodeRuntime;
pub use settings::{MinerKind, MiningSettings, NodeSettings, PeerAddress};
pub use testnet::Testnet;
pub use worker::{MiningOutcome, MiningStats, MiningWorker};

/// Result type for node operations
pub type Result<T> = std::result::Result<T, NodeError>;
