//! # Contribution Scorer
//!
//! Turns per-epoch activity tallies and stake into a deterministic score.
//!
//! ## Scheme
//!
//! All arithmetic is integer fixed-point with `SCORE_SCALE = 10^9`.
//!
//! 1. Activity points (attestation, production, relay) accumulate in a ledger,
//!    each saturating at a configured cap.
//! 2. Attestation is a per-epoch duty: every epoch without an included
//!    attestation multiplies the attestation points by `factor_bps / 10000`.
//!    Production and relay points decay by the same factor once for every
//!    full decay interval (in blocks) elapsed since the validator last
//!    produced or relayed. Stake never decays.
//! 3. Each component normalizes against its cap:
//!    `norm = min(x, cap) * SCALE / cap`. Stake uses `max_effective_stake`.
//! 4. `total = Σ weight_bps * norm / 10000`, so `total <= SCALE`.
//!
//! Normalizing against fixed caps, not against the network maximum, keeps a
//! validator's score independent of everyone else's activity, which makes the
//! score monotonic in the validator's own contributions.
//!
//! Recomputation is idempotent: applying an epoch at or below the ledger's
//! last applied epoch returns the ledger unchanged.

use crate::config::{ConsensusConfig, ContributionPoints, DecayConfig, ScoreWeights};
use crate::domain::validator::{ValidatorId, ValidatorRegistry};
use serde::{Deserialize, Serialize};
use shared_types::{EpochNumber, U256, BPS_DENOMINATOR};
use std::collections::BTreeMap;

/// Fixed-point scale of every score value.
pub const SCORE_SCALE: u64 = 1_000_000_000;

/// A validator's score, per component and weighted total.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributionScore {
    pub stake: u64,
    pub attestation: u64,
    pub production: u64,
    pub relay: u64,
    pub total: u64,
}

/// Activity observed for one validator during one epoch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorTally {
    pub attestation_points: u64,
    pub production_points: u64,
    pub relay_points: u64,
}

impl ValidatorTally {
    /// No qualifying event this epoch.
    pub fn is_empty(&self) -> bool {
        self.attestation_points == 0 && self.production_points == 0 && self.relay_points == 0
    }
}

/// Tallies for one epoch, keyed by validator.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochTallies {
    tallies: BTreeMap<ValidatorId, ValidatorTally>,
}

impl EpochTallies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit an included attestation.
    pub fn record_attestation(
        &mut self,
        validator: ValidatorId,
        timely: bool,
        correct_target: bool,
        points: &ContributionPoints,
    ) {
        let mut earned = points.attestation_base;
        if timely {
            earned = earned.saturating_add(points.timely_bonus);
        }
        if correct_target {
            earned = earned.saturating_add(points.correct_target_bonus);
        }
        let tally = self.tallies.entry(validator).or_default();
        tally.attestation_points = tally.attestation_points.saturating_add(earned);
    }

    /// Credit an accepted block.
    pub fn record_proposal(&mut self, validator: ValidatorId, points: &ContributionPoints) {
        let tally = self.tallies.entry(validator).or_default();
        tally.production_points = tally.production_points.saturating_add(points.block_produced);
    }

    /// Credit relay/discovery work reported by the network layer.
    pub fn record_relay(&mut self, validator: ValidatorId, count: u64, points: &ContributionPoints) {
        if count == 0 {
            return;
        }
        let tally = self.tallies.entry(validator).or_default();
        tally.relay_points = tally
            .relay_points
            .saturating_add(count.saturating_mul(points.relay));
    }

    pub fn get(&self, validator: &ValidatorId) -> ValidatorTally {
        self.tallies.get(validator).copied().unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ValidatorId, &ValidatorTally)> {
        self.tallies.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.tallies.is_empty()
    }
}

/// Accumulated activity for one validator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub attestation_points: u64,
    pub production_points: u64,
    pub relay_points: u64,
    /// Block from which the next production/relay decay interval is counted
    pub anchor_block: u64,
}

/// Scorer state carried from epoch to epoch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreLedger {
    last_epoch: Option<EpochNumber>,
    entries: BTreeMap<ValidatorId, LedgerEntry>,
    scores: BTreeMap<ValidatorId, ContributionScore>,
}

impl ScoreLedger {
    pub fn last_epoch(&self) -> Option<EpochNumber> {
        self.last_epoch
    }

    pub fn entry(&self, validator: &ValidatorId) -> Option<&LedgerEntry> {
        self.entries.get(validator)
    }

    pub fn scores(&self) -> &BTreeMap<ValidatorId, ContributionScore> {
        &self.scores
    }

    fn already_applied(&self, epoch: EpochNumber) -> bool {
        self.last_epoch.is_some_and(|last| last >= epoch)
    }
}

/// One epoch as recorded for replay.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedEpoch {
    pub boundary_block: u64,
    pub tallies: EpochTallies,
}

/// Scores for one epoch, keyed by validator.
pub type EpochScores = BTreeMap<ValidatorId, ContributionScore>;

/// Deterministic contribution scorer
#[derive(Clone, Debug)]
pub struct ContributionScorer {
    weights: ScoreWeights,
    points: ContributionPoints,
    decay: DecayConfig,
    max_effective_stake: U256,
}

impl ContributionScorer {
    pub fn new(config: &ConsensusConfig) -> Self {
        Self {
            weights: config.weights.clone(),
            points: config.points.clone(),
            decay: config.decay.clone(),
            max_effective_stake: config.max_effective_stake(),
        }
    }

    /// Fold one epoch's tallies into the ledger and score every registered
    /// validator. Re-applying an epoch already in the ledger is a no-op.
    pub fn recompute_epoch(
        &self,
        ledger: &ScoreLedger,
        registry: &ValidatorRegistry,
        tallies: &EpochTallies,
        epoch: EpochNumber,
        boundary_block: u64,
    ) -> (ScoreLedger, EpochScores) {
        if ledger.already_applied(epoch) {
            return (ledger.clone(), ledger.scores.clone());
        }

        let mut next = ScoreLedger {
            last_epoch: Some(epoch),
            entries: BTreeMap::new(),
            scores: BTreeMap::new(),
        };

        for validator in registry.iter() {
            let mut entry = ledger
                .entries
                .get(&validator.id)
                .copied()
                .unwrap_or(LedgerEntry {
                    anchor_block: boundary_block,
                    ..LedgerEntry::default()
                });

            let tally = tallies.get(&validator.id);
            if tally.attestation_points == 0 {
                entry.attestation_points = decay(entry.attestation_points, 1, self.decay.factor_bps);
            } else {
                entry.attestation_points = entry
                    .attestation_points
                    .saturating_add(tally.attestation_points)
                    .min(self.points.attestation_cap);
            }
            if tally.production_points == 0 && tally.relay_points == 0 {
                self.decay_entry(&mut entry, boundary_block);
            } else {
                entry.production_points = entry
                    .production_points
                    .saturating_add(tally.production_points)
                    .min(self.points.production_cap);
                entry.relay_points = entry
                    .relay_points
                    .saturating_add(tally.relay_points)
                    .min(self.points.relay_cap);
                entry.anchor_block = boundary_block;
            }

            let score = self.score(&entry, validator.stake);
            next.entries.insert(validator.id, entry);
            next.scores.insert(validator.id, score);
        }

        let scores = next.scores.clone();
        (next, scores)
    }

    /// Rebuild the ledger from recorded tallies, in epoch order.
    pub fn replay(
        &self,
        registry: &ValidatorRegistry,
        history: &BTreeMap<EpochNumber, RecordedEpoch>,
    ) -> (ScoreLedger, EpochScores) {
        let mut ledger = ScoreLedger::default();
        let mut scores = EpochScores::new();
        for (epoch, recorded) in history {
            let (next, next_scores) = self.recompute_epoch(
                &ledger,
                registry,
                &recorded.tallies,
                *epoch,
                recorded.boundary_block,
            );
            ledger = next;
            scores = next_scores;
        }
        (ledger, scores)
    }

    /// Score a ledger entry against a stake.
    pub fn score(&self, entry: &LedgerEntry, stake: U256) -> ContributionScore {
        let mut score = ContributionScore {
            stake: normalize_stake(stake, self.max_effective_stake),
            attestation: normalize(entry.attestation_points, self.points.attestation_cap),
            production: normalize(entry.production_points, self.points.production_cap),
            relay: normalize(entry.relay_points, self.points.relay_cap),
            total: 0,
        };
        score.total = weighted_total(&score, &self.weights);
        score
    }

    fn decay_entry(&self, entry: &mut LedgerEntry, boundary_block: u64) {
        let elapsed = boundary_block.saturating_sub(entry.anchor_block);
        let intervals = elapsed / self.decay.interval_blocks;
        if intervals == 0 {
            return;
        }
        entry.production_points = decay(entry.production_points, intervals, self.decay.factor_bps);
        entry.relay_points = decay(entry.relay_points, intervals, self.decay.factor_bps);
        entry.anchor_block = entry
            .anchor_block
            .saturating_add(intervals.saturating_mul(self.decay.interval_blocks));
    }
}

/// `min(value, cap) * SCALE / cap`; zero when `cap` is zero.
pub fn normalize(value: u64, cap: u64) -> u64 {
    if cap == 0 {
        return 0;
    }
    let clamped = value.min(cap) as u128;
    (clamped * SCORE_SCALE as u128 / cap as u128) as u64
}

/// Stake normalized against the effective-stake cap.
pub fn normalize_stake(stake: U256, cap: U256) -> u64 {
    if cap.is_zero() {
        return 0;
    }
    let clamped = stake.min(cap);
    // clamped <= cap, so the quotient is at most SCORE_SCALE
    (clamped.saturating_mul(U256::from(SCORE_SCALE)) / cap).low_u64()
}

/// Weighted sum of the normalized components.
pub fn weighted_total(score: &ContributionScore, weights: &ScoreWeights) -> u64 {
    let sum = score.stake as u128 * weights.stake_bps as u128
        + score.attestation as u128 * weights.attestation_bps as u128
        + score.production as u128 * weights.production_bps as u128
        + score.relay as u128 * weights.relay_bps as u128;
    (sum / BPS_DENOMINATOR as u128) as u64
}

/// Apply `intervals` rounds of `x = floor(x * factor_bps / 10000)`.
pub fn decay(points: u64, intervals: u64, factor_bps: u64) -> u64 {
    if factor_bps >= BPS_DENOMINATOR {
        return points;
    }
    let mut value = points;
    for _ in 0..intervals {
        if value == 0 {
            break;
        }
        value = (value as u128 * factor_bps as u128 / BPS_DENOMINATOR as u128) as u64;
    }
    value
}
