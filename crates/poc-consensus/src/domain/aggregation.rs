//! # Attestation Aggregation
//!
//! Attestations sharing the exact same [`AttestationData`] compress into one
//! aggregate: the BLS point sum of their signatures plus a participation
//! bitfield indexed by duty position (see [`EpochAssignment::attesters`]).
//!
//! - Merging aggregates over different data is rejected.
//! - Merging overlapping bitfields is rejected (no double counting).
//! - Re-inserting a vote that is already covered is a no-op.
//!
//! Attested stake is never trusted from the wire; it is recomputed from the
//! bitfield, the epoch's attester list and the registry snapshot.

use crate::domain::attestation::{Attestation, AttestationData, CheckpointRef};
use crate::domain::selection::EpochAssignment;
use crate::domain::validator::{ValidatorId, ValidatorRegistry};
use bitvec::prelude::*;
use serde::{Deserialize, Serialize};
use shared_crypto::{BlsPublicKey, BlsSignature, CryptoError};
use shared_types::{EpochNumber, U256};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Aggregation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AggregationError {
    #[error("Invalid attestation signature")]
    InvalidSignature,

    #[error("Attestation from unknown validator {0}")]
    UnknownValidator(ValidatorId),

    #[error("Validator {0} has no attestation duty this epoch")]
    NoDuty(ValidatorId),

    #[error("Attestation slot {slot} does not match assigned slot {assigned}")]
    WrongSlot { slot: u64, assigned: u64 },

    #[error("Cannot merge aggregates over different attestation data")]
    DataMismatch,

    #[error("Aggregates have overlapping participants")]
    Overlap,

    #[error("Participation bitfield has {got} bits, epoch has {expected} attesters")]
    BitfieldLength { expected: usize, got: usize },

    #[error("Aggregate has no participants")]
    Empty,

    #[error("Signature aggregation failed: {0}")]
    Crypto(#[from] CryptoError),
}

/// Compressed set of identical votes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationAggregate {
    pub data: AttestationData,
    pub participants: BitVec<u8, Msb0>,
    pub signature: BlsSignature,
}

impl AttestationAggregate {
    /// Wrap a single attestation from a duty holder.
    pub fn from_attestation(
        attestation: &Attestation,
        assignment: &EpochAssignment,
    ) -> Result<Self, AggregationError> {
        let position = assignment
            .position(&attestation.validator)
            .ok_or(AggregationError::NoDuty(attestation.validator))?;
        let mut participants = bitvec![u8, Msb0; 0; assignment.attester_count()];
        participants.set(position, true);
        Ok(Self {
            data: attestation.data,
            participants,
            signature: attestation.signature.clone(),
        })
    }

    pub fn participant_count(&self) -> usize {
        self.participants.count_ones()
    }

    pub fn overlaps(&self, other: &AttestationAggregate) -> bool {
        self.participants
            .iter_ones()
            .any(|i| other.participants.get(i).is_some_and(|b| *b))
    }

    /// Every participant of `other` is already in `self`.
    pub fn covers(&self, other: &AttestationAggregate) -> bool {
        other
            .participants
            .iter_ones()
            .all(|i| self.participants.get(i).is_some_and(|b| *b))
    }

    /// Fold a disjoint aggregate over the same data into this one.
    pub fn merge(&mut self, other: &AttestationAggregate) -> Result<(), AggregationError> {
        if self.data != other.data {
            return Err(AggregationError::DataMismatch);
        }
        if self.participants.len() != other.participants.len() {
            return Err(AggregationError::BitfieldLength {
                expected: self.participants.len(),
                got: other.participants.len(),
            });
        }
        if self.overlaps(other) {
            return Err(AggregationError::Overlap);
        }
        self.signature = self.signature.combine(&other.signature)?;
        for i in other.participants.iter_ones() {
            self.participants.set(i, true);
        }
        Ok(())
    }

    /// Validators whose bits are set.
    pub fn validators(&self, assignment: &EpochAssignment) -> Vec<ValidatorId> {
        self.participants
            .iter_ones()
            .filter_map(|i| assignment.attester_at(i))
            .collect()
    }

    /// Verify the aggregate signature against the participants' keys.
    pub fn verify(
        &self,
        assignment: &EpochAssignment,
        registry: &ValidatorRegistry,
    ) -> Result<(), AggregationError> {
        if self.participants.len() != assignment.attester_count() {
            return Err(AggregationError::BitfieldLength {
                expected: assignment.attester_count(),
                got: self.participants.len(),
            });
        }
        let validators = self.validators(assignment);
        if validators.is_empty() {
            return Err(AggregationError::Empty);
        }
        let keys = validators
            .iter()
            .map(|id| {
                registry
                    .get(id)
                    .map(|v| &v.attestation_key)
                    .ok_or(AggregationError::UnknownValidator(*id))
            })
            .collect::<Result<Vec<&BlsPublicKey>, _>>()?;

        if self
            .signature
            .fast_aggregate_verify(&self.data.signing_root(), &keys)
        {
            Ok(())
        } else {
            Err(AggregationError::InvalidSignature)
        }
    }

    /// Active stake behind the set bits.
    pub fn attested_stake(&self, assignment: &EpochAssignment, registry: &ValidatorRegistry) -> U256 {
        self.validators(assignment)
            .iter()
            .fold(U256::zero(), |acc, id| acc.saturating_add(registry.voting_stake(id)))
    }
}

/// Result of offering an attestation to the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Folded into an existing aggregate
    Merged,
    /// Started a new aggregate
    Created,
    /// Already covered; nothing changed
    Duplicate,
}

#[derive(Clone, Debug)]
struct PoolEntry {
    aggregate: AttestationAggregate,
    validators: BTreeSet<ValidatorId>,
}

/// Aggregates grouped by attestation data.
///
/// Votes for one link can arrive under several slots (each attester
/// attests at its own slot), so link stake is the union across all data that
/// share a `(source, target)` pair.
#[derive(Debug, Default)]
pub struct AttestationPool {
    entries: BTreeMap<AttestationData, Vec<PoolEntry>>,
}

impl AttestationPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert an already-verified attestation from a duty holder.
    pub fn insert(
        &mut self,
        attestation: &Attestation,
        assignment: &EpochAssignment,
    ) -> Result<InsertOutcome, AggregationError> {
        let incoming = AttestationAggregate::from_attestation(attestation, assignment)?;
        let group = self.entries.entry(attestation.data).or_default();

        if group.iter().any(|e| e.aggregate.covers(&incoming)) {
            return Ok(InsertOutcome::Duplicate);
        }
        if let Some(entry) = group.iter_mut().find(|e| !e.aggregate.overlaps(&incoming)) {
            entry.aggregate.merge(&incoming)?;
            entry.validators.insert(attestation.validator);
            return Ok(InsertOutcome::Merged);
        }
        group.push(PoolEntry {
            aggregate: incoming,
            validators: [attestation.validator].into_iter().collect(),
        });
        Ok(InsertOutcome::Created)
    }

    /// Validators that voted for the `source → target` link.
    pub fn link_voters(&self, source: &CheckpointRef, target: &CheckpointRef) -> BTreeSet<ValidatorId> {
        self.entries
            .iter()
            .filter(|(data, _)| data.source == *source && data.target == *target)
            .flat_map(|(_, group)| group.iter().flat_map(|e| e.validators.iter().copied()))
            .collect()
    }

    /// Active stake behind the `source → target` link, each validator once.
    pub fn link_stake(
        &self,
        source: &CheckpointRef,
        target: &CheckpointRef,
        registry: &ValidatorRegistry,
    ) -> U256 {
        self.link_voters(source, target)
            .iter()
            .fold(U256::zero(), |acc, id| acc.saturating_add(registry.voting_stake(id)))
    }

    /// Targets voted for from `source`.
    pub fn targets_from(&self, source: &CheckpointRef) -> BTreeSet<CheckpointRef> {
        self.entries
            .keys()
            .filter(|data| data.source == *source)
            .map(|data| data.target)
            .collect()
    }

    /// Validators with any included vote targeting `epoch`.
    pub fn participants(&self, epoch: EpochNumber) -> BTreeSet<ValidatorId> {
        self.entries
            .iter()
            .filter(|(data, _)| data.target.epoch == epoch)
            .flat_map(|(_, group)| group.iter().flat_map(|e| e.validators.iter().copied()))
            .collect()
    }

    /// Aggregates for one piece of data.
    pub fn aggregates(&self, data: &AttestationData) -> Vec<&AttestationAggregate> {
        self.entries
            .get(data)
            .map(|group| group.iter().map(|e| &e.aggregate).collect())
            .unwrap_or_default()
    }

    /// Drop everything targeting epochs before `epoch`.
    pub fn prune(&mut self, epoch: EpochNumber) {
        self.entries.retain(|data, _| data.target.epoch >= epoch);
    }
}
