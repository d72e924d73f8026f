//! qPoW Core - quantum-resistant hashing and difficulty targets
//!
//! This crate provides the leaf primitives every other qPoW crate builds on:
//! the domain-separated 512-bit hash (single-stage and Tribus cascade) and the
//! 256-bit target arithmetic behind the compact `bits` encoding.

pub mod error;
pub mod hash;
pub mod target;

pub use error::CoreError;
pub use hash::{qhash, tribus, Digest512, QrHash, QuantumHasher, TribusHash, DIGEST_LEN};
pub use target::{digest_high_u64, meets_target, Target};

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// qPoW protocol version
pub const QPOW_VERSION: &str = "0.1.0";
