//! # Shared Crypto
//!
//! Cryptographic primitives used by the PoC consensus core.
//!
//! | Module | Algorithm | Use Case |
//! |--------|-----------|----------|
//! | `signatures` | Ed25519 | Block proposal signing, double-sign evidence |
//! | `bls` | BLS12-381 (`min_pk`) | Attestation signing and aggregation |
//! | `vrf` | BLS12-381 unique signatures | Committee and proposer tickets |
//! | `hashing` | BLAKE3 | Content addressing, VRF output |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bls;
pub mod errors;
pub mod hashing;
pub mod signatures;
pub mod vrf;

// Re-exports
pub use bls::{BlsKeyPair, BlsPublicKey, BlsSignature};
pub use errors::CryptoError;
pub use hashing::{blake3_derive_key, blake3_hash, blake3_hash_many, Blake3Hasher};
pub use signatures::{Ed25519KeyPair, Ed25519PublicKey, Ed25519Signature};
pub use vrf::{VrfKeyPair, VrfOutput, VrfProof, VrfPublicKey};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
