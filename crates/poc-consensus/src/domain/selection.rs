//! # Committee & Proposer Selection
//!
//! Each validator evaluates its VRF over `(epoch, seed)` and publishes the
//! resulting ticket. Tickets reach the chain inside blocks; from the tickets a
//! chain carries every node computes the same assignment:
//!
//! - `sort_key = output / score` (lower wins; zero score sorts last)
//! - committee = the K lowest sort keys, K capped by the eligible count
//! - slot proposer = the committee member with the lowest
//!   `blake3(output || slot) / score`
//! - every Active validator attests once per epoch. The committee holds the
//!   first duty positions, the remaining Active validators follow in
//!   `blake3(seed || id)` order, and position `p` attests at
//!   `start + p % epoch_length`
//!
//! When the total score of the eligible set is zero (bootstrap), every
//! validator is weighted equally. An epoch without a single eligible ticket
//! draws its committee from every Active validator using public outputs
//! `blake3(seed || epoch || id)`, so the chain never stalls on missing
//! tickets.
//!
//! The next epoch's seed mixes the previous seed with the XOR of the
//! committee's outputs (RANDAO-style), hashed with Keccak-256.

use crate::domain::validator::{Validator, ValidatorId, ValidatorRegistry};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use shared_crypto::{blake3_hash_many, VrfKeyPair, VrfOutput, VrfProof};
use shared_types::{EpochNumber, Hash, Slot, U256};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Selection errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("No active validators for epoch {epoch}")]
    NoEligibleValidators { epoch: EpochNumber },

    #[error("Ticket for unknown validator {0}")]
    UnknownValidator(ValidatorId),

    #[error("Validator {0} is not eligible for selection")]
    NotEligible(ValidatorId),

    #[error("Invalid VRF ticket from validator {validator}")]
    InvalidTicket { validator: ValidatorId },

    #[error("Ticket is for epoch {got}, expected {expected}")]
    WrongEpoch {
        expected: EpochNumber,
        got: EpochNumber,
    },

    #[error("Validator {validator} is not the proposer of slot {slot}")]
    NotProposer { slot: Slot, validator: ValidatorId },

    #[error("Slot {slot} is outside epoch {epoch}")]
    SlotOutsideEpoch { slot: Slot, epoch: EpochNumber },
}

/// A published VRF evaluation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub validator: ValidatorId,
    pub epoch: EpochNumber,
    pub output: VrfOutput,
    pub proof: VrfProof,
}

/// VRF input for an epoch.
pub fn vrf_input(epoch: EpochNumber, seed: &Hash) -> Vec<u8> {
    let mut input = Vec::with_capacity(8 + 8 + 32);
    input.extend_from_slice(b"poc-vrf\0");
    input.extend_from_slice(&epoch.to_be_bytes());
    input.extend_from_slice(seed);
    input
}

/// Evaluate the local VRF for `epoch`.
pub fn evaluate_ticket(
    keys: &VrfKeyPair,
    validator: ValidatorId,
    epoch: EpochNumber,
    seed: &Hash,
) -> Ticket {
    let (output, proof) = keys.prove(&vrf_input(epoch, seed));
    Ticket {
        validator,
        epoch,
        output,
        proof,
    }
}

/// Check a ticket against the registry key and the epoch seed.
pub fn verify_ticket(
    registry: &ValidatorRegistry,
    ticket: &Ticket,
    seed: &Hash,
) -> Result<(), SelectionError> {
    let validator = registry
        .get(&ticket.validator)
        .ok_or(SelectionError::UnknownValidator(ticket.validator))?;
    validator
        .vrf_key
        .verify_output(&vrf_input(ticket.epoch, seed), &ticket.proof, &ticket.output)
        .map_err(|_| SelectionError::InvalidTicket {
            validator: ticket.validator,
        })
}

/// `output / score`; `U256::MAX` for a zero score.
pub fn sort_key(output: &VrfOutput, score: u64) -> U256 {
    if score == 0 {
        return U256::MAX;
    }
    U256::from_big_endian(output) / U256::from(score)
}

/// Slot-specific key: the output re-hashed with the slot number.
pub fn slot_sort_key(output: &VrfOutput, slot: Slot, score: u64) -> U256 {
    let rehashed = blake3_hash_many(&[output.as_slice(), &slot.to_be_bytes()]);
    sort_key(&rehashed, score)
}

/// Seed of `epoch` from the previous seed and the previous committee's outputs.
pub fn derive_epoch_seed<'a>(
    previous_seed: &Hash,
    outputs: impl IntoIterator<Item = &'a VrfOutput>,
    epoch: EpochNumber,
) -> Hash {
    let mut mix = [0u8; 32];
    for output in outputs {
        for (m, o) in mix.iter_mut().zip(output.iter()) {
            *m ^= o;
        }
    }
    let mut hasher = Keccak256::new();
    hasher.update(previous_seed);
    hasher.update(mix);
    hasher.update(epoch.to_be_bytes());
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&hasher.finalize());
    seed
}

/// Public stand-in for a VRF output, used when an epoch has no tickets.
pub fn fallback_output(seed: &Hash, epoch: EpochNumber, validator: &ValidatorId) -> VrfOutput {
    blake3_hash_many(&[
        b"poc-fallback".as_slice(),
        seed,
        &epoch.to_be_bytes(),
        validator.as_bytes(),
    ])
}

fn duty_key(seed: &Hash, validator: &ValidatorId) -> Hash {
    blake3_hash_many(&[b"poc-duty".as_slice(), seed, validator.as_bytes()])
}

/// A selected committee member.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitteeMember {
    pub validator: ValidatorId,
    pub output: VrfOutput,
    /// Score used as the divisor (1 for everyone under uniform weighting)
    pub weight: u64,
    pub sort_key: U256,
}

/// Sealed committee, attester and proposer table for one epoch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochAssignment {
    pub epoch: EpochNumber,
    pub seed: Hash,
    pub start_slot: Slot,
    pub length: u64,
    /// Committee drawn from public fallback outputs
    pub fallback: bool,
    committee: Vec<CommitteeMember>,
    /// Duty order: the committee, then every other Active validator
    attesters: Vec<ValidatorId>,
    positions: BTreeMap<ValidatorId, usize>,
    proposers: Vec<ValidatorId>,
}

impl EpochAssignment {
    /// Build the assignment from verified tickets.
    ///
    /// Tickets for other epochs and validators that are not Active are
    /// ignored. Fails only when the registry has no Active validator.
    pub fn build(
        registry: &ValidatorRegistry,
        tickets: &BTreeMap<ValidatorId, Ticket>,
        epoch: EpochNumber,
        seed: Hash,
        start_slot: Slot,
        length: u64,
        committee_size: usize,
    ) -> Result<Self, SelectionError> {
        let active: Vec<&Validator> = registry.active().collect();
        if active.is_empty() {
            return Err(SelectionError::NoEligibleValidators { epoch });
        }

        let mut eligible: Vec<(ValidatorId, VrfOutput, u64)> = tickets
            .values()
            .filter(|t| t.epoch == epoch)
            .filter_map(|t| {
                registry
                    .get(&t.validator)
                    .filter(|v| v.is_active())
                    .map(|v| (t.validator, t.output, v.score.total))
            })
            .collect();
        let fallback = eligible.is_empty();
        if fallback {
            eligible = active
                .iter()
                .map(|v| (v.id, fallback_output(&seed, epoch, &v.id), v.score.total))
                .collect();
        }

        let uniform = eligible.iter().all(|(_, _, score)| *score == 0);
        let mut candidates: Vec<CommitteeMember> = eligible
            .into_iter()
            .map(|(validator, output, score)| {
                let weight = if uniform { 1 } else { score };
                CommitteeMember {
                    validator,
                    output,
                    weight,
                    sort_key: sort_key(&output, weight),
                }
            })
            .collect();

        candidates.sort_by(|a, b| {
            a.sort_key
                .cmp(&b.sort_key)
                .then_with(|| a.validator.cmp(&b.validator))
        });
        candidates.truncate(committee_size.max(1));

        let mut attesters: Vec<ValidatorId> = candidates.iter().map(|m| m.validator).collect();
        let mut rest: Vec<(Hash, ValidatorId)> = active
            .iter()
            .filter(|v| !candidates.iter().any(|m| m.validator == v.id))
            .map(|v| (duty_key(&seed, &v.id), v.id))
            .collect();
        rest.sort();
        attesters.extend(rest.into_iter().map(|(_, id)| id));

        let positions = attesters
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, i))
            .collect();

        let proposers = (start_slot..start_slot.saturating_add(length))
            .map(|slot| {
                candidates
                    .iter()
                    .min_by(|a, b| {
                        slot_sort_key(&a.output, slot, a.weight)
                            .cmp(&slot_sort_key(&b.output, slot, b.weight))
                            .then_with(|| a.validator.cmp(&b.validator))
                    })
                    .map(|m| m.validator)
                    .unwrap_or_default()
            })
            .collect();

        Ok(Self {
            epoch,
            seed,
            start_slot,
            length,
            fallback,
            committee: candidates,
            attesters,
            positions,
            proposers,
        })
    }

    pub fn committee(&self) -> &[CommitteeMember] {
        &self.committee
    }

    pub fn committee_size(&self) -> usize {
        self.committee.len()
    }

    /// Committee members as a set.
    pub fn members(&self) -> BTreeSet<ValidatorId> {
        self.committee.iter().map(|m| m.validator).collect()
    }

    /// Every validator with an attestation duty, in duty order.
    pub fn attesters(&self) -> &[ValidatorId] {
        &self.attesters
    }

    pub fn attester_count(&self) -> usize {
        self.attesters.len()
    }

    /// Validators with an attestation duty, as a set.
    pub fn duties(&self) -> BTreeSet<ValidatorId> {
        self.positions.keys().copied().collect()
    }

    pub fn contains_slot(&self, slot: Slot) -> bool {
        slot >= self.start_slot && slot < self.start_slot.saturating_add(self.length)
    }

    /// Duty position of a validator (its bit in aggregates).
    pub fn position(&self, validator: &ValidatorId) -> Option<usize> {
        self.positions.get(validator).copied()
    }

    pub fn attester_at(&self, position: usize) -> Option<ValidatorId> {
        self.attesters.get(position).copied()
    }

    pub fn has_duty(&self, validator: &ValidatorId) -> bool {
        self.positions.contains_key(validator)
    }

    /// Committee members hold the first duty positions.
    pub fn is_committee_member(&self, validator: &ValidatorId) -> bool {
        self.position(validator)
            .is_some_and(|position| position < self.committee.len())
    }

    pub fn proposer_for_slot(&self, slot: Slot) -> Option<ValidatorId> {
        if !self.contains_slot(slot) {
            return None;
        }
        self.proposers.get((slot - self.start_slot) as usize).copied()
    }

    /// The one slot of this epoch at which `validator` attests.
    pub fn attestation_slot(&self, validator: &ValidatorId) -> Option<Slot> {
        let position = self.position(validator)? as u64;
        Some(self.start_slot + position % self.length.max(1))
    }

    /// Validators whose attestation duty falls on `slot`.
    pub fn attesters_at(&self, slot: Slot) -> Vec<ValidatorId> {
        if !self.contains_slot(slot) {
            return Vec::new();
        }
        let offset = (slot - self.start_slot) as usize;
        let stride = self.length.max(1) as usize;
        self.attesters
            .iter()
            .skip(offset)
            .step_by(stride)
            .copied()
            .collect()
    }

    pub fn verify_proposer(&self, slot: Slot, validator: &ValidatorId) -> Result<(), SelectionError> {
        match self.proposer_for_slot(slot) {
            None => Err(SelectionError::SlotOutsideEpoch {
                slot,
                epoch: self.epoch,
            }),
            Some(expected) if expected == *validator => Ok(()),
            Some(_) => Err(SelectionError::NotProposer {
                slot,
                validator: *validator,
            }),
        }
    }

    /// Outputs of the committee, in committee order.
    pub fn outputs(&self) -> impl Iterator<Item = &VrfOutput> {
        self.committee.iter().map(|m| &m.output)
    }
}
