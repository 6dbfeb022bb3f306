//! # Slashing & Accountability
//!
//! Evidence carries the two conflicting signed artifacts, so any node can
//! re-verify it from the offender's registered keys alone.
//!
//! ## Offenses
//!
//! 1. Double sign: two different blocks signed for the same slot
//! 2. Double vote: two different targets voted for the same target epoch
//! 3. Surround vote: one (source, target) interval strictly contains the other
//!
//! Slashing is applied at most once per validator; later evidence against a
//! Slashed validator changes nothing.

use crate::config::SlashingConfig;
use crate::domain::attestation::Attestation;
use crate::domain::messages::ProposalMessage;
use crate::domain::validator::{RegistryError, ValidatorId, ValidatorRegistry, ValidatorStatus};
use serde::{Deserialize, Serialize};
use shared_types::{apply_percent, EpochNumber, Slot, U256};
use std::collections::HashMap;
use thiserror::Error;

/// Reasons evidence fails to prove an offense
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EvidenceError {
    #[error("Evidence names unknown validator {0}")]
    UnknownValidator(ValidatorId),

    #[error("Artifacts come from different validators")]
    DifferentValidators,

    #[error("Artifacts do not conflict")]
    NotConflicting,

    #[error("Evidence artifact signature is invalid")]
    InvalidSignature,
}

/// Slashing application errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlashingError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Offense category
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OffenseKind {
    DoubleSign,
    DoubleVote,
    SurroundVote,
}

impl OffenseKind {
    pub fn penalty_percent(&self, config: &SlashingConfig) -> u8 {
        match self {
            Self::DoubleSign | Self::DoubleVote => config.double_sign_penalty_percent,
            Self::SurroundVote => config.surround_vote_penalty_percent,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DoubleSign => "double_sign",
            Self::DoubleVote => "double_vote",
            Self::SurroundVote => "surround_vote",
        }
    }
}

/// Proof of misbehavior: two conflicting artifacts from one validator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlashingEvidence {
    DoubleSign {
        a: ProposalMessage,
        b: ProposalMessage,
    },
    DoubleVote {
        a: Attestation,
        b: Attestation,
    },
    SurroundVote {
        a: Attestation,
        b: Attestation,
    },
}

impl SlashingEvidence {
    /// Validator named by the first artifact.
    pub fn offender(&self) -> ValidatorId {
        match self {
            Self::DoubleSign { a, .. } => a.proposer,
            Self::DoubleVote { a, .. } | Self::SurroundVote { a, .. } => a.validator,
        }
    }

    pub fn kind(&self) -> OffenseKind {
        match self {
            Self::DoubleSign { .. } => OffenseKind::DoubleSign,
            Self::DoubleVote { .. } => OffenseKind::DoubleVote,
            Self::SurroundVote { .. } => OffenseKind::SurroundVote,
        }
    }

    /// Slot of the first artifact.
    pub fn slot(&self) -> Slot {
        match self {
            Self::DoubleSign { a, .. } => a.slot,
            Self::DoubleVote { a, .. } | Self::SurroundVote { a, .. } => a.data.slot,
        }
    }

    /// Re-verify the offense and return the offender.
    pub fn verify(&self, registry: &ValidatorRegistry) -> Result<ValidatorId, EvidenceError> {
        match self {
            Self::DoubleSign { a, b } => {
                if a.proposer != b.proposer {
                    return Err(EvidenceError::DifferentValidators);
                }
                if a.slot != b.slot || a.block_hash == b.block_hash {
                    return Err(EvidenceError::NotConflicting);
                }
                let validator = registry
                    .get(&a.proposer)
                    .ok_or(EvidenceError::UnknownValidator(a.proposer))?;
                for proposal in [a, b] {
                    if !proposal.has_valid_hash() || proposal.verify(&validator.signing_key).is_err() {
                        return Err(EvidenceError::InvalidSignature);
                    }
                }
                Ok(a.proposer)
            }
            Self::DoubleVote { a, b } => {
                verify_vote_pair(a, b, registry, |x, y| x.data.is_double_vote(&y.data))
            }
            Self::SurroundVote { a, b } => verify_vote_pair(a, b, registry, |x, y| {
                x.data.surrounds(&y.data) || y.data.surrounds(&x.data)
            }),
        }
    }

    /// Short human-readable description for slashing records.
    pub fn describe(&self) -> String {
        match self {
            Self::DoubleSign { a, .. } => format!(
                "validator {} signed two blocks at slot {}",
                a.proposer, a.slot
            ),
            Self::DoubleVote { a, .. } => format!(
                "validator {} voted for two targets in epoch {}",
                a.validator, a.data.target.epoch
            ),
            Self::SurroundVote { a, b } => format!(
                "validator {} cast surrounding votes {}->{} and {}->{}",
                a.validator,
                a.data.source.epoch,
                a.data.target.epoch,
                b.data.source.epoch,
                b.data.target.epoch
            ),
        }
    }
}

fn verify_vote_pair(
    a: &Attestation,
    b: &Attestation,
    registry: &ValidatorRegistry,
    conflicting: impl Fn(&Attestation, &Attestation) -> bool,
) -> Result<ValidatorId, EvidenceError> {
    if a.validator != b.validator {
        return Err(EvidenceError::DifferentValidators);
    }
    if !conflicting(a, b) {
        return Err(EvidenceError::NotConflicting);
    }
    if !registry.contains(&a.validator) {
        return Err(EvidenceError::UnknownValidator(a.validator));
    }
    for vote in [a, b] {
        vote.verify(registry)
            .map_err(|_| EvidenceError::InvalidSignature)?;
    }
    Ok(a.validator)
}

/// Outcome of an applied slashing, persisted to storage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlashingRecord {
    pub offender: ValidatorId,
    pub kind: OffenseKind,
    pub epoch: EpochNumber,
    pub penalty: U256,
    pub reporter: Option<ValidatorId>,
    pub reporter_reward: U256,
    pub burned: U256,
    pub description: String,
}

/// Slash `offender`. Returns `None` if it was already Slashed.
///
/// The reporter share goes to `reporter` if it is a registered validator
/// other than the offender; everything else is burned.
pub fn apply_slashing(
    registry: &mut ValidatorRegistry,
    evidence: &SlashingEvidence,
    reporter: Option<ValidatorId>,
    config: &SlashingConfig,
    epoch: EpochNumber,
) -> Result<Option<SlashingRecord>, SlashingError> {
    let offender = evidence.offender();
    let kind = evidence.kind();
    let validator = registry
        .get(&offender)
        .ok_or(RegistryError::UnknownValidator(offender))?;
    if validator.status == ValidatorStatus::Slashed {
        return Ok(None);
    }

    let penalty = apply_percent(validator.stake, kind.penalty_percent(config));
    let taken = registry.debit(&offender, penalty)?;

    let reporter = reporter.filter(|r| *r != offender && registry.contains(r));
    let reporter_reward = match reporter {
        Some(r) => {
            let reward = apply_percent(taken, config.reporter_reward_percent);
            registry.credit(&r, reward)?;
            reward
        }
        None => U256::zero(),
    };
    let burned = taken - reporter_reward;
    registry.burn(burned);
    registry.transition(&offender, ValidatorStatus::Slashed)?;

    Ok(Some(SlashingRecord {
        offender,
        kind,
        epoch,
        penalty: taken,
        reporter,
        reporter_reward,
        burned,
        description: evidence.describe(),
    }))
}

/// Local record of observed proposals and votes, producing evidence when a
/// validator contradicts itself.
#[derive(Debug, Default)]
pub struct SlashingDetector {
    proposals: HashMap<(ValidatorId, Slot), ProposalMessage>,
    votes: HashMap<ValidatorId, Vec<Attestation>>,
}

impl SlashingDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a verified proposal. Returns evidence for a second, different
    /// block at the same slot.
    pub fn check_proposal(&mut self, proposal: &ProposalMessage) -> Option<SlashingEvidence> {
        match self.proposals.get(&(proposal.proposer, proposal.slot)) {
            Some(existing) if existing.block_hash != proposal.block_hash => {
                Some(SlashingEvidence::DoubleSign {
                    a: existing.clone(),
                    b: proposal.clone(),
                })
            }
            Some(_) => None,
            None => {
                self.proposals
                    .insert((proposal.proposer, proposal.slot), proposal.clone());
                None
            }
        }
    }

    /// Record a verified attestation. Conflicting votes are reported and
    /// not recorded.
    pub fn check_attestation(&mut self, attestation: &Attestation) -> Option<SlashingEvidence> {
        let history = self.votes.entry(attestation.validator).or_default();
        for previous in history.iter() {
            if previous.data == attestation.data {
                return None;
            }
            if previous.data.is_double_vote(&attestation.data) {
                return Some(SlashingEvidence::DoubleVote {
                    a: previous.clone(),
                    b: attestation.clone(),
                });
            }
            if previous.data.surrounds(&attestation.data) || attestation.data.surrounds(&previous.data) {
                return Some(SlashingEvidence::SurroundVote {
                    a: previous.clone(),
                    b: attestation.clone(),
                });
            }
        }
        history.push(attestation.clone());
        None
    }

    /// Forget proposals before `min_slot` and votes targeting epochs before
    /// `min_epoch`.
    pub fn prune(&mut self, min_slot: Slot, min_epoch: EpochNumber) {
        self.proposals.retain(|(_, slot), _| *slot >= min_slot);
        for history in self.votes.values_mut() {
            history.retain(|a| a.data.target.epoch >= min_epoch);
        }
        self.votes.retain(|_, history| !history.is_empty());
    }

    pub fn tracked_votes(&self) -> usize {
        self.votes.values().map(Vec::len).sum()
    }
}
