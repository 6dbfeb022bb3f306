//! Local validator key material.
//!
//! A validator holds three independent keys: Ed25519 for block proposals,
//! BLS for attestations and a BLS VRF key for committee tickets. All three
//! can be derived from one 32-byte seed.

use crate::domain::validator::{Registration, Validator, ValidatorId};
use shared_crypto::{
    blake3_derive_key, BlsKeyPair, CryptoError, Ed25519KeyPair, VrfKeyPair,
};
use shared_types::U256;

pub struct ValidatorKeys {
    pub signing: Ed25519KeyPair,
    pub attestation: BlsKeyPair,
    pub vrf: VrfKeyPair,
}

impl ValidatorKeys {
    /// Derive all three keys from a master seed.
    pub fn from_seed(seed: [u8; 32]) -> Result<Self, CryptoError> {
        let signing = Ed25519KeyPair::from_seed(blake3_derive_key("poc validator ed25519", &seed));
        let attestation = BlsKeyPair::from_ikm(&blake3_derive_key("poc validator bls", &seed))?;
        let vrf = VrfKeyPair::from_ikm(&blake3_derive_key("poc validator vrf", &seed))?;
        Ok(Self {
            signing,
            attestation,
            vrf,
        })
    }

    pub fn id(&self) -> ValidatorId {
        ValidatorId::from_signing_key(&self.signing.public_key())
    }

    /// Registration request carrying a proof of possession.
    pub fn registration(&self, stake: U256) -> Registration {
        Registration {
            signing_key: self.signing.public_key(),
            attestation_key: self.attestation.public_key(),
            vrf_key: self.vrf.public_key(),
            proof_of_possession: self.attestation.proof_of_possession(),
            stake,
        }
    }

    /// Registry entry for a genesis validator.
    pub fn genesis_validator(&self, stake: U256) -> Validator {
        Validator::genesis(
            self.signing.public_key(),
            self.attestation.public_key(),
            self.vrf.public_key(),
            stake,
        )
    }
}
