//! # Verifiable Random Function
//!
//! A BLS-signature VRF: the proof is a BLS signature over the input under a
//! VRF-specific domain tag, and the output is the BLAKE3 hash of the proof.
//!
//! BLS signatures are unique for a given key and message, so a validator
//! cannot grind alternative outputs for the same input. Anyone holding the
//! public key and the input can recompute and check the output.

use serde::{Deserialize, Serialize};

use crate::bls::{BlsKeyPair, BlsPublicKey, BlsSignature};
use crate::hashing::blake3_hash;
use crate::CryptoError;

const VRF_DST: &[u8] = b"POC_VRF_BLS12381G2_XMD:SHA-256_SSWU_RO_";

/// 32-byte pseudorandom VRF output.
pub type VrfOutput = [u8; 32];

/// VRF proof (a 96-byte BLS signature).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VrfProof(BlsSignature);

impl VrfProof {
    /// The output this proof commits to.
    pub fn output(&self) -> VrfOutput {
        blake3_hash(&self.0.to_bytes())
    }

    /// Raw proof bytes.
    pub fn to_bytes(&self) -> [u8; 96] {
        self.0.to_bytes()
    }

    /// Decode a proof.
    pub fn from_bytes(bytes: &[u8; 96]) -> Result<Self, CryptoError> {
        BlsSignature::from_bytes(bytes).map(VrfProof)
    }
}

/// Public half of a VRF keypair, as stored in the validator registry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VrfPublicKey(BlsPublicKey);

impl VrfPublicKey {
    /// Check `proof` over `input` and return its output.
    pub fn verify(&self, input: &[u8], proof: &VrfProof) -> Result<VrfOutput, CryptoError> {
        if self.0.verify_with_dst(input, &proof.0, VRF_DST) {
            Ok(proof.output())
        } else {
            Err(CryptoError::SignatureVerificationFailed)
        }
    }

    /// Check `proof` over `input` and that it yields `claimed`.
    pub fn verify_output(
        &self,
        input: &[u8],
        proof: &VrfProof,
        claimed: &VrfOutput,
    ) -> Result<(), CryptoError> {
        if &self.verify(input, proof)? == claimed {
            Ok(())
        } else {
            Err(CryptoError::VrfOutputMismatch)
        }
    }

    /// Compressed key bytes.
    pub fn to_bytes(&self) -> [u8; 48] {
        self.0.to_bytes()
    }
}

/// VRF keypair.
pub struct VrfKeyPair(BlsKeyPair);

impl VrfKeyPair {
    /// Generate a random keypair.
    pub fn generate() -> Result<Self, CryptoError> {
        BlsKeyPair::generate().map(VrfKeyPair)
    }

    /// Deterministic keypair from input key material.
    pub fn from_ikm(ikm: &[u8; 32]) -> Result<Self, CryptoError> {
        BlsKeyPair::from_ikm(ikm).map(VrfKeyPair)
    }

    /// Public key.
    pub fn public_key(&self) -> VrfPublicKey {
        VrfPublicKey(self.0.public_key())
    }

    /// Evaluate the VRF over `input`.
    pub fn prove(&self, input: &[u8]) -> (VrfOutput, VrfProof) {
        let proof = VrfProof(self.0.sign_with_dst(input, VRF_DST));
        (proof.output(), proof)
    }
}
