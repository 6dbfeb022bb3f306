//! # Quadratic Inactivity Leak
//!
//! If more than a third of the stake goes offline, no link can reach 2/3 and
//! finality stalls. Once the finality lag exceeds `leak_threshold_epochs`,
//! every Active committee member that missed its attestation loses
//!
//! ```text
//! stake * leak_penalty_bps / 10000 + epochs_inactive^2
//! ```
//!
//! per epoch, until the online validators again hold a supermajority. The
//! drained stake is burned. The leak stops as soon as finality resumes.

use crate::domain::validator::{ValidatorId, ValidatorRegistry};
use shared_types::{apply_bps, EpochNumber, U256};
use std::collections::BTreeMap;

/// Per-validator leak counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InactivityScore {
    /// Consecutive missed epochs while the leak is active
    pub epochs_inactive: u64,
    pub total_penalty: U256,
}

/// Inactivity leak tracker.
#[derive(Clone, Debug, Default)]
pub struct InactivityLeakTracker {
    leak_threshold_epochs: u64,
    penalty_bps: u64,
    scores: BTreeMap<ValidatorId, InactivityScore>,
    finality_lag: u64,
    leak_start_epoch: Option<EpochNumber>,
}

impl InactivityLeakTracker {
    pub fn new(leak_threshold_epochs: u64, penalty_bps: u64) -> Self {
        Self {
            leak_threshold_epochs,
            penalty_bps,
            ..Default::default()
        }
    }

    /// Update finality lag and start or stop the leak.
    pub fn update_finality_lag(&mut self, epochs_since_finality: u64, current_epoch: EpochNumber) {
        self.finality_lag = epochs_since_finality;
        if epochs_since_finality > self.leak_threshold_epochs {
            if self.leak_start_epoch.is_none() {
                self.leak_start_epoch = Some(current_epoch);
            }
        } else {
            self.leak_start_epoch = None;
            self.scores.clear();
        }
    }

    pub fn is_leak_active(&self) -> bool {
        self.leak_start_epoch.is_some()
    }

    pub fn leak_start_epoch(&self) -> Option<EpochNumber> {
        self.leak_start_epoch
    }

    pub fn finality_lag(&self) -> u64 {
        self.finality_lag
    }

    /// Record whether a duty-bearing validator attested this epoch.
    pub fn record_participation(&mut self, validator: ValidatorId, participated: bool) {
        if !self.is_leak_active() {
            return;
        }
        let score = self.scores.entry(validator).or_default();
        if participated {
            score.epochs_inactive = 0;
        } else {
            score.epochs_inactive = score.epochs_inactive.saturating_add(1);
        }
    }

    pub fn calculate_penalty(&self, validator: &ValidatorId, stake: U256) -> U256 {
        if !self.is_leak_active() {
            return U256::zero();
        }
        let Some(score) = self.scores.get(validator) else {
            return U256::zero();
        };
        if score.epochs_inactive == 0 {
            return U256::zero();
        }
        let quadratic = U256::from(score.epochs_inactive).saturating_mul(U256::from(score.epochs_inactive));
        apply_bps(stake, self.penalty_bps).saturating_add(quadratic)
    }

    /// Debit and burn this epoch's penalties. Only Active validators leak.
    pub fn apply_penalties(&mut self, registry: &mut ValidatorRegistry) -> Vec<(ValidatorId, U256)> {
        if !self.is_leak_active() {
            return Vec::new();
        }
        let due: Vec<(ValidatorId, U256)> = self
            .scores
            .keys()
            .filter_map(|id| {
                let validator = registry.get(id).filter(|v| v.is_active())?;
                let penalty = self.calculate_penalty(id, validator.stake);
                (!penalty.is_zero()).then_some((*id, penalty))
            })
            .collect();

        let mut applied = Vec::with_capacity(due.len());
        for (id, penalty) in due {
            let Ok(taken) = registry.debit(&id, penalty) else {
                continue;
            };
            registry.burn(taken);
            if let Some(score) = self.scores.get_mut(&id) {
                score.total_penalty = score.total_penalty.saturating_add(taken);
            }
            applied.push((id, taken));
        }
        applied
    }

    pub fn get_score(&self, validator: &ValidatorId) -> Option<&InactivityScore> {
        self.scores.get(validator)
    }
}
