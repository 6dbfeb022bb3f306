//! Attestation entity
//!
//! An attestation is a committee member's vote for a source→target checkpoint
//! link, signed with the member's BLS attestation key.

use crate::domain::aggregation::AggregationError;
use crate::domain::validator::{ValidatorId, ValidatorRegistry};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use shared_crypto::{BlsKeyPair, BlsSignature, Blake3Hasher};
use shared_types::{short_hex, EpochNumber, Hash, Slot};
use std::fmt;

/// Below this many attestations a batch is verified sequentially.
pub const BATCH_THRESHOLD: usize = 8;

const ATTESTATION_DOMAIN: &[u8] = b"poc-attestation-v1";

/// (epoch, block hash) pair naming a checkpoint.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CheckpointRef {
    pub epoch: EpochNumber,
    pub block_hash: Hash,
}

impl CheckpointRef {
    pub fn new(epoch: EpochNumber, block_hash: Hash) -> Self {
        Self { epoch, block_hash }
    }
}

impl fmt::Debug for CheckpointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checkpoint({}@{})", short_hex(&self.block_hash), self.epoch)
    }
}

impl fmt::Display for CheckpointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", short_hex(&self.block_hash), self.epoch)
    }
}

/// The signed content of an attestation; aggregates group by exact equality.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttestationData {
    pub slot: Slot,
    pub source: CheckpointRef,
    pub target: CheckpointRef,
}

impl AttestationData {
    /// Message signed by every attester of this data.
    pub fn signing_root(&self) -> Hash {
        let mut hasher = Blake3Hasher::new();
        hasher
            .update(ATTESTATION_DOMAIN)
            .update(&self.slot.to_be_bytes())
            .update(&self.source.epoch.to_be_bytes())
            .update(&self.source.block_hash)
            .update(&self.target.epoch.to_be_bytes())
            .update(&self.target.block_hash);
        hasher.finalize()
    }

    /// `self` strictly surrounds `other`.
    pub fn surrounds(&self, other: &AttestationData) -> bool {
        self.source.epoch < other.source.epoch && self.target.epoch > other.target.epoch
    }

    /// Same target epoch, different target block.
    pub fn is_double_vote(&self, other: &AttestationData) -> bool {
        self.target.epoch == other.target.epoch && self.target.block_hash != other.target.block_hash
    }
}

/// A single validator's signed vote.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    pub validator: ValidatorId,
    pub data: AttestationData,
    pub signature: BlsSignature,
}

impl Attestation {
    pub fn sign(validator: ValidatorId, data: AttestationData, key: &BlsKeyPair) -> Self {
        Self {
            validator,
            data,
            signature: key.sign(&data.signing_root()),
        }
    }

    pub fn signing_root(&self) -> Hash {
        self.data.signing_root()
    }

    /// Check the signature against the registered attestation key.
    pub fn verify(&self, registry: &ValidatorRegistry) -> Result<(), AggregationError> {
        let validator = registry
            .get(&self.validator)
            .ok_or(AggregationError::UnknownValidator(self.validator))?;
        if validator
            .attestation_key
            .verify(&self.signing_root(), &self.signature)
        {
            Ok(())
        } else {
            Err(AggregationError::InvalidSignature)
        }
    }

    /// Slashable conflict with another vote of the same validator.
    pub fn conflicts_with(&self, other: &Attestation) -> bool {
        self.validator == other.validator
            && (self.data.is_double_vote(&other.data)
                || self.data.surrounds(&other.data)
                || other.data.surrounds(&self.data))
    }
}

/// Verify many attestations, in parallel once the batch is large enough.
///
/// Results are positionally aligned with the input.
pub fn verify_batch(
    attestations: &[Attestation],
    registry: &ValidatorRegistry,
) -> Vec<Result<(), AggregationError>> {
    if attestations.len() < BATCH_THRESHOLD {
        return attestations.iter().map(|a| a.verify(registry)).collect();
    }
    attestations
        .par_iter()
        .map(|a| a.verify(registry))
        .collect()
}
