//! Error types for qPoW core operations

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Compact target 0x{bits:08x} does not fit in 256 bits")]
    TargetOverflow { bits: u32 },

    #[error("Invalid length: expected {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },
}
