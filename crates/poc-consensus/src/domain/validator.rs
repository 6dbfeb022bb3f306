//! Validator registry
//!
//! The registry is a versioned snapshot: every mutation bumps `version`, and
//! each consensus step receives the snapshot it must read from. Iteration is
//! ordered by `ValidatorId`, so every node walks validators in the same order.
//!
//! Status transitions:
//!
//! ```text
//! Pending ──boundary──→ Active ──exit + delay──→ Exiting
//!                         │
//!                         ├──missed epochs──→ Inactive
//!                         │
//!   (any but Slashed) ────┴──evidence──→ Slashed   (terminal)
//! ```

use crate::domain::score::ContributionScore;
use serde::{Deserialize, Serialize};
use shared_crypto::{blake3_hash_many, BlsPublicKey, BlsSignature, Ed25519PublicKey, VrfPublicKey};
use shared_types::{short_hex, Address, EpochNumber, U256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

/// Validator identifier: the 20-byte address derived from the block-signing key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct ValidatorId(pub Address);

impl ValidatorId {
    pub fn new(bytes: Address) -> Self {
        Self(bytes)
    }

    /// Address of the holder of `signing_key`.
    pub fn from_signing_key(signing_key: &Ed25519PublicKey) -> Self {
        let digest = blake3_hash_many(&[b"poc-validator-address", signing_key.as_bytes()]);
        let mut address = [0u8; 20];
        address.copy_from_slice(&digest[12..]);
        Self(address)
    }

    pub fn as_bytes(&self) -> &Address {
        &self.0
    }
}

impl fmt::Display for ValidatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&short_hex(&self.0))
    }
}

impl fmt::Debug for ValidatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValidatorId({})", short_hex(&self.0))
    }
}

/// Validator lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValidatorStatus {
    /// Registered, waiting for the next epoch boundary
    Pending,
    /// Eligible for committees, counted in total active stake
    Active,
    /// Voluntary exit completed its unbonding delay
    Exiting,
    /// Punished for provable misbehavior; terminal
    Slashed,
    /// Missed too many consecutive attestation epochs; terminal
    Inactive,
}

impl ValidatorStatus {
    fn can_transition_to(self, next: ValidatorStatus) -> bool {
        use ValidatorStatus::*;
        matches!(
            (self, next),
            (Pending, Active)
                | (Active, Exiting)
                | (Active, Inactive)
                | (Pending, Slashed)
                | (Active, Slashed)
                | (Exiting, Slashed)
                | (Inactive, Slashed)
        )
    }
}

/// A registered validator
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub id: ValidatorId,
    /// Ed25519 block-signing key
    pub signing_key: Ed25519PublicKey,
    /// BLS attestation key
    pub attestation_key: BlsPublicKey,
    /// Public half of the VRF keypair
    pub vrf_key: VrfPublicKey,
    pub stake: U256,
    pub score: ContributionScore,
    pub status: ValidatorStatus,
    pub registered_epoch: EpochNumber,
    pub last_active_epoch: EpochNumber,
    pub exit_requested_epoch: Option<EpochNumber>,
    /// Consecutive committee epochs without an included attestation
    pub missed_epochs: u64,
}

impl Validator {
    /// A validator that is Active from genesis.
    pub fn genesis(
        signing_key: Ed25519PublicKey,
        attestation_key: BlsPublicKey,
        vrf_key: VrfPublicKey,
        stake: U256,
    ) -> Self {
        Self {
            id: ValidatorId::from_signing_key(&signing_key),
            signing_key,
            attestation_key,
            vrf_key,
            stake,
            score: ContributionScore::default(),
            status: ValidatorStatus::Active,
            registered_epoch: 0,
            last_active_epoch: 0,
            exit_requested_epoch: None,
            missed_epochs: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ValidatorStatus::Active
    }
}

/// Registration request for a new validator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub signing_key: Ed25519PublicKey,
    pub attestation_key: BlsPublicKey,
    pub vrf_key: VrfPublicKey,
    /// BLS proof of possession of `attestation_key`
    pub proof_of_possession: BlsSignature,
    pub stake: U256,
}

/// Registry errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Validator {0} already registered")]
    Duplicate(ValidatorId),

    #[error("Validator {0} not found")]
    UnknownValidator(ValidatorId),

    #[error("Stake {stake} below minimum {minimum}")]
    StakeBelowMinimum { stake: U256, minimum: U256 },

    #[error("Attestation key proof of possession is invalid")]
    InvalidProofOfPossession,

    #[error("Validator {id} cannot move from {from:?} to {to:?}")]
    IllegalTransition {
        id: ValidatorId,
        from: ValidatorStatus,
        to: ValidatorStatus,
    },

    #[error("Validator {0} already requested exit")]
    ExitAlreadyRequested(ValidatorId),
}

/// Versioned validator registry
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorRegistry {
    version: u64,
    validators: BTreeMap<ValidatorId, Validator>,
    /// Stake destroyed by slashing and inactivity leaks
    burned: U256,
    /// Stake above this carries no extra voting weight
    stake_cap: Option<U256>,
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the genesis registry.
    pub fn from_genesis(validators: Vec<Validator>) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for validator in validators {
            if registry.validators.contains_key(&validator.id) {
                return Err(RegistryError::Duplicate(validator.id));
            }
            registry.validators.insert(validator.id, validator);
        }
        Ok(registry)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn get(&self, id: &ValidatorId) -> Option<&Validator> {
        self.validators.get(id)
    }

    pub fn contains(&self, id: &ValidatorId) -> bool {
        self.validators.contains_key(id)
    }

    /// All validators in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Validator> {
        self.validators.values()
    }

    /// Active validators in id order.
    pub fn active(&self) -> impl Iterator<Item = &Validator> {
        self.validators.values().filter(|v| v.is_active())
    }

    /// Cap every validator's voting weight at `cap`.
    pub fn set_stake_cap(&mut self, cap: U256) {
        if self.stake_cap != Some(cap) {
            self.stake_cap = Some(cap);
            self.bump();
        }
    }

    pub fn stake_cap(&self) -> Option<U256> {
        self.stake_cap
    }

    /// `stake` clamped to the configured cap.
    pub fn effective_stake(&self, stake: U256) -> U256 {
        self.stake_cap.map_or(stake, |cap| stake.min(cap))
    }

    /// Stake that counts toward the 2/3 supermajority.
    pub fn total_active_stake(&self) -> U256 {
        self.active()
            .fold(U256::zero(), |acc, v| acc.saturating_add(self.effective_stake(v.stake)))
    }

    /// Voting weight of a validator; zero unless Active.
    pub fn voting_stake(&self, id: &ValidatorId) -> U256 {
        self.validators
            .get(id)
            .filter(|v| v.is_active())
            .map(|v| self.effective_stake(v.stake))
            .unwrap_or_default()
    }

    pub fn burned(&self) -> U256 {
        self.burned
    }

    /// Admit a new validator as Pending.
    pub fn register(
        &mut self,
        registration: Registration,
        minimum: U256,
        epoch: EpochNumber,
    ) -> Result<ValidatorId, RegistryError> {
        if registration.stake < minimum {
            return Err(RegistryError::StakeBelowMinimum {
                stake: registration.stake,
                minimum,
            });
        }
        if !registration
            .attestation_key
            .verify_possession(&registration.proof_of_possession)
        {
            return Err(RegistryError::InvalidProofOfPossession);
        }

        let id = ValidatorId::from_signing_key(&registration.signing_key);
        if self.validators.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }

        self.validators.insert(
            id,
            Validator {
                id,
                signing_key: registration.signing_key,
                attestation_key: registration.attestation_key,
                vrf_key: registration.vrf_key,
                stake: registration.stake,
                score: ContributionScore::default(),
                status: ValidatorStatus::Pending,
                registered_epoch: epoch,
                last_active_epoch: epoch,
                exit_requested_epoch: None,
                missed_epochs: 0,
            },
        );
        self.bump();
        Ok(id)
    }

    /// Move a validator to `next`, enforcing the lifecycle graph.
    pub fn transition(
        &mut self,
        id: &ValidatorId,
        next: ValidatorStatus,
    ) -> Result<(), RegistryError> {
        let validator = self
            .validators
            .get_mut(id)
            .ok_or(RegistryError::UnknownValidator(*id))?;
        if !validator.status.can_transition_to(next) {
            return Err(RegistryError::IllegalTransition {
                id: *id,
                from: validator.status,
                to: next,
            });
        }
        validator.status = next;
        self.bump();
        Ok(())
    }

    /// Activate every Pending validator registered before `epoch`.
    pub fn activate_pending(&mut self, epoch: EpochNumber) -> Vec<ValidatorId> {
        let ready: Vec<ValidatorId> = self
            .validators
            .values()
            .filter(|v| v.status == ValidatorStatus::Pending && v.registered_epoch < epoch)
            .map(|v| v.id)
            .collect();
        for id in &ready {
            if let Some(v) = self.validators.get_mut(id) {
                v.status = ValidatorStatus::Active;
                v.last_active_epoch = epoch;
            }
        }
        if !ready.is_empty() {
            self.bump();
        }
        ready
    }

    /// Record a voluntary exit request.
    pub fn request_exit(
        &mut self,
        id: &ValidatorId,
        epoch: EpochNumber,
    ) -> Result<(), RegistryError> {
        let validator = self
            .validators
            .get_mut(id)
            .ok_or(RegistryError::UnknownValidator(*id))?;
        if validator.status != ValidatorStatus::Active {
            return Err(RegistryError::IllegalTransition {
                id: *id,
                from: validator.status,
                to: ValidatorStatus::Exiting,
            });
        }
        if validator.exit_requested_epoch.is_some() {
            return Err(RegistryError::ExitAlreadyRequested(*id));
        }
        validator.exit_requested_epoch = Some(epoch);
        self.bump();
        Ok(())
    }

    /// Move Active validators whose exit request aged past `delay` to Exiting.
    pub fn process_exits(&mut self, epoch: EpochNumber, delay: u64) -> Vec<ValidatorId> {
        let ready: Vec<ValidatorId> = self
            .active()
            .filter(|v| {
                v.exit_requested_epoch
                    .is_some_and(|requested| epoch >= requested.saturating_add(delay))
            })
            .map(|v| v.id)
            .collect();
        for id in &ready {
            if let Some(v) = self.validators.get_mut(id) {
                v.status = ValidatorStatus::Exiting;
            }
        }
        if !ready.is_empty() {
            self.bump();
        }
        ready
    }

    /// Update missed-epoch counters for the validators that had attestation
    /// duties in `epoch`. Returns validators that just became Inactive.
    pub fn record_participation(
        &mut self,
        duties: &BTreeSet<ValidatorId>,
        participants: &BTreeSet<ValidatorId>,
        epoch: EpochNumber,
        max_missed_epochs: u64,
    ) -> Vec<ValidatorId> {
        let mut deactivated = Vec::new();
        for id in duties {
            let Some(v) = self.validators.get_mut(id) else {
                continue;
            };
            if !v.is_active() {
                continue;
            }
            if participants.contains(id) {
                v.missed_epochs = 0;
                v.last_active_epoch = epoch;
            } else {
                v.missed_epochs = v.missed_epochs.saturating_add(1);
                if v.missed_epochs >= max_missed_epochs {
                    v.status = ValidatorStatus::Inactive;
                    deactivated.push(*id);
                }
            }
        }
        self.bump();
        deactivated
    }

    pub fn set_score(&mut self, id: &ValidatorId, score: ContributionScore) {
        if let Some(v) = self.validators.get_mut(id) {
            if v.score != score {
                v.score = score;
                self.bump();
            }
        }
    }

    /// Remove up to `amount` from a validator's stake. Returns what was removed.
    pub fn debit(&mut self, id: &ValidatorId, amount: U256) -> Result<U256, RegistryError> {
        let validator = self
            .validators
            .get_mut(id)
            .ok_or(RegistryError::UnknownValidator(*id))?;
        let taken = amount.min(validator.stake);
        validator.stake -= taken;
        self.bump();
        Ok(taken)
    }

    pub fn credit(&mut self, id: &ValidatorId, amount: U256) -> Result<(), RegistryError> {
        let validator = self
            .validators
            .get_mut(id)
            .ok_or(RegistryError::UnknownValidator(*id))?;
        validator.stake = validator.stake.saturating_add(amount);
        self.bump();
        Ok(())
    }

    pub fn burn(&mut self, amount: U256) {
        self.burned = self.burned.saturating_add(amount);
        self.bump();
    }

    fn bump(&mut self) {
        self.version = self.version.wrapping_add(1);
    }
}
