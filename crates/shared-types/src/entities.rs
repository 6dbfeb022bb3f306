//! # Core Primitive Entities
//!
//! Fixed-width identifiers used across the consensus core.

use serde::{Deserialize, Serialize};
use std::fmt;

// Re-export U256 from primitive-types for stake arithmetic everywhere
pub use primitive_types::U256;

/// A 32-byte hash (BLAKE3 or Keccak-256 depending on the domain).
pub type Hash = [u8; 32];

/// The all-zero hash, used as the parent of genesis.
pub const ZERO_HASH: Hash = [0u8; 32];

/// A 20-byte account address.
pub type Address = [u8; 20];

/// Slot number since genesis.
pub type Slot = u64;

/// Epoch number since genesis.
pub type EpochNumber = u64;

/// Basis-point denominator (10_000 bps = 100%).
pub const BPS_DENOMINATOR: u64 = 10_000;

/// Identifier of a remote peer as reported by the network layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct PeerId(pub [u8; 32]);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&short_hex(&self.0))
    }
}

/// Abbreviated hex rendering for log fields (first four bytes).
pub fn short_hex(bytes: &[u8]) -> String {
    let end = bytes.len().min(4);
    format!("0x{}", hex::encode(&bytes[..end]))
}

/// Multiply `amount` by `bps / 10_000`, rounding down.
pub fn apply_bps(amount: U256, bps: u64) -> U256 {
    amount.saturating_mul(U256::from(bps)) / U256::from(BPS_DENOMINATOR)
}

/// Multiply `amount` by `percent / 100`, rounding down.
pub fn apply_percent(amount: U256, percent: u8) -> U256 {
    amount.saturating_mul(U256::from(percent)) / U256::from(100u8)
}
