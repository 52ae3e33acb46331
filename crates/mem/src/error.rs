//! Error types for the low-level memory operations

use crate::address::Address;

/// Error type for typed reads, writes, copies, fills and compares.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// A zero address was passed where a real one is required
    #[error("invalid address")]
    InvalidAddress,

    /// The protection change guarding the access was rejected by the OS
    #[error("protection change failed at {0}")]
    InvalidProtectChange(Address),

    /// The source range is not readable
    #[error("memory at {0} is not readable")]
    UnreadableMemory(Address),

    /// The destination range is not writeable
    #[error("memory at {0} is not writeable")]
    UnwriteableMemory(Address),

    /// A zero-length range was passed
    #[error("zero-sized range")]
    NullSize,

    /// The destination address of a copy is zero
    #[error("invalid copy destination")]
    InvalidDestination,

    /// The source address of a copy is zero
    #[error("invalid copy source")]
    InvalidSource,
}
