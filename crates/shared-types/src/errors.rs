//! # Error Types
//!
//! Errors shared across crates.

use thiserror::Error;

/// Errors raised while encoding or decoding wire frames.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Serialization failed.
    #[error("Encode failed: {0}")]
    Encode(String),

    /// Frame could not be parsed.
    #[error("Malformed frame: {0}")]
    Decode(String),

    /// Frame exceeds the hard size limit.
    #[error("Frame too large: {size} bytes > {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },
}

/// Node operational states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Normal operation.
    Running,
    /// Halted after a fatal invariant violation (awaiting intervention).
    HaltedAwaitingIntervention,
}
