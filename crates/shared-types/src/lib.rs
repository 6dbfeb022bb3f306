//! # Shared Types Crate
//!
//! Primitive identifiers shared by the PoC-Chain crates and the wire codec
//! used for every consensus message.
//!
//! ## Design Principles
//!
//! - **Single Source of Truth**: hashes, addresses and stake amounts are
//!   defined once here so every crate agrees on their width.
//! - **Opaque Bytes at the Edge**: the network layer hands the consensus core
//!   raw frames; decoding happens through [`codec`] with a hard size limit.

pub mod codec;
pub mod entities;
pub mod errors;

pub use codec::{decode, encode, MAX_FRAME_SIZE};
pub use entities::*;
pub use errors::*;
