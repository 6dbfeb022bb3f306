//! Consensus configuration
//!
//! Every tunable of the consensus core lives here. Values load from JSON
//! (`from_json`), can be overridden from the environment
//! (`apply_env_overrides`), and must pass `validate()` before a service is
//! built from them.

use serde::{Deserialize, Serialize};
use shared_types::{U256, BPS_DENOMINATOR};
use std::env;
use thiserror::Error;

/// Smallest committee the selector will build.
pub const MIN_COMMITTEE_SIZE: usize = 21;

/// Largest committee the selector will build.
pub const MAX_COMMITTEE_SIZE: usize = 1000;

/// Configuration errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: &'static str, value: String },

    #[error("Score weights must sum to 10000 bps, got {0}")]
    WeightsNotNormalized(u64),

    #[error("Committee size {0} outside [21, 1000]")]
    CommitteeSizeOutOfRange(usize),

    #[error("{field} must be at most {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: u64,
        max: u64,
    },

    #[error("{0} must be non-zero")]
    Zero(&'static str),
}

/// Component weights of the contribution score, in basis points.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub stake_bps: u64,
    pub attestation_bps: u64,
    pub production_bps: u64,
    pub relay_bps: u64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            stake_bps: 4000,
            attestation_bps: 3000,
            production_bps: 2000,
            relay_bps: 1000,
        }
    }
}

impl ScoreWeights {
    pub fn total(&self) -> u64 {
        self.stake_bps
            .saturating_add(self.attestation_bps)
            .saturating_add(self.production_bps)
            .saturating_add(self.relay_bps)
    }
}

/// Contribution points and the caps each component saturates at.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContributionPoints {
    /// Points for an included attestation
    pub attestation_base: u64,
    /// Bonus when the attestation arrives within its slot
    pub timely_bonus: u64,
    /// Bonus when the target matches the local canonical checkpoint
    pub correct_target_bonus: u64,
    /// Points per accepted block
    pub block_produced: u64,
    /// Points per relayed message reported by the network layer
    pub relay: u64,
    /// Accumulated attestation points at which the component saturates
    pub attestation_cap: u64,
    /// Accumulated production points at which the component saturates
    pub production_cap: u64,
    /// Accumulated relay points at which the component saturates
    pub relay_cap: u64,
}

impl Default for ContributionPoints {
    fn default() -> Self {
        Self {
            attestation_base: 10,
            timely_bonus: 5,
            correct_target_bonus: 5,
            block_produced: 100,
            relay: 1,
            attestation_cap: 200,
            production_cap: 1000,
            relay_cap: 1000,
        }
    }
}

/// Decay applied to activity points during silence.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecayConfig {
    /// Multiplier per elapsed interval, in basis points
    pub factor_bps: u64,
    /// Interval length in blocks (slots)
    pub interval_blocks: u64,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            factor_bps: 9000,
            interval_blocks: 1000,
        }
    }
}

/// Penalty schedule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlashingConfig {
    pub double_sign_penalty_percent: u8,
    pub surround_vote_penalty_percent: u8,
    /// Share of the penalty paid to the reporter; the remainder is burned
    pub reporter_reward_percent: u8,
}

impl Default for SlashingConfig {
    fn default() -> Self {
        Self {
            double_sign_penalty_percent: 100,
            surround_vote_penalty_percent: 50,
            reporter_reward_percent: 10,
        }
    }
}

/// Committee bounds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitteeConfig {
    /// Target committee size K, capped by the eligible validator count
    pub size: usize,
}

impl Default for CommitteeConfig {
    fn default() -> Self {
        Self {
            size: MAX_COMMITTEE_SIZE,
        }
    }
}

/// Validator lifecycle and stake rules.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Minimum stake accepted at registration
    pub min_stake: u128,
    /// Stake above this does not raise the stake component
    pub max_effective_stake: u128,
    /// Epochs between an exit request and the Exiting status
    pub unbonding_delay_epochs: u64,
    /// Consecutive missed attestation epochs before a validator goes Inactive
    pub max_missed_epochs: u64,
    /// Finality lag (epochs) beyond which the inactivity leak runs
    pub leak_threshold_epochs: u64,
    /// Stake drained per epoch from non-participants during a leak
    pub leak_penalty_bps: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            min_stake: 1_000,
            max_effective_stake: 1_000_000,
            unbonding_delay_epochs: 2,
            max_missed_epochs: 8,
            leak_threshold_epochs: 4,
            leak_penalty_bps: 100,
        }
    }
}

/// Inbound queue and buffering limits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Bounded inbound frame queue; the newest frame is dropped when full
    pub inbound_capacity: usize,
    /// Slots an unresolved attestation waits for its blocks
    pub unresolved_timeout_slots: u64,
    /// Upper bound on buffered unresolved attestations
    pub max_unresolved: usize,
    /// Epochs of detector history, dedup keys and pool entries kept
    pub retention_epochs: u64,
    /// Signature failures before a peer is reported
    pub peer_failure_threshold: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            inbound_capacity: 4096,
            unresolved_timeout_slots: 32,
            max_unresolved: 8192,
            retention_epochs: 4,
            peer_failure_threshold: 5,
        }
    }
}

/// Consensus configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub slot_duration_secs: u64,
    pub epoch_length: u64,
    /// Seed of epoch 0
    pub genesis_seed: [u8; 32],
    pub committee: CommitteeConfig,
    pub weights: ScoreWeights,
    pub points: ContributionPoints,
    pub decay: DecayConfig,
    pub slashing: SlashingConfig,
    pub lifecycle: LifecycleConfig,
    pub queue: QueueConfig,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            slot_duration_secs: 6,
            epoch_length: 100,
            genesis_seed: [0u8; 32],
            committee: CommitteeConfig::default(),
            weights: ScoreWeights::default(),
            points: ContributionPoints::default(),
            decay: DecayConfig::default(),
            slashing: SlashingConfig::default(),
            lifecycle: LifecycleConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl ConsensusConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply overrides from the environment.
    ///
    /// # Environment Variables
    ///
    /// - `POC_SLOT_DURATION_SECS`
    /// - `POC_EPOCH_LENGTH`
    /// - `POC_COMMITTEE_SIZE`
    pub fn apply_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Some(v) = env_parse::<u64>("POC_SLOT_DURATION_SECS")? {
            self.slot_duration_secs = v;
        }
        if let Some(v) = env_parse::<u64>("POC_EPOCH_LENGTH")? {
            self.epoch_length = v;
        }
        if let Some(v) = env_parse::<usize>("POC_COMMITTEE_SIZE")? {
            self.committee.size = v;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slot_duration_secs == 0 {
            return Err(ConfigError::Zero("slot_duration_secs"));
        }
        if self.epoch_length == 0 {
            return Err(ConfigError::Zero("epoch_length"));
        }
        if self.decay.interval_blocks == 0 {
            return Err(ConfigError::Zero("decay.interval_blocks"));
        }
        if self.points.attestation_cap == 0 {
            return Err(ConfigError::Zero("points.attestation_cap"));
        }
        if self.points.production_cap == 0 {
            return Err(ConfigError::Zero("points.production_cap"));
        }
        if self.points.relay_cap == 0 {
            return Err(ConfigError::Zero("points.relay_cap"));
        }
        if self.lifecycle.max_effective_stake == 0 {
            return Err(ConfigError::Zero("lifecycle.max_effective_stake"));
        }
        if self.queue.inbound_capacity == 0 {
            return Err(ConfigError::Zero("queue.inbound_capacity"));
        }

        let total = self.weights.total();
        if total != BPS_DENOMINATOR {
            return Err(ConfigError::WeightsNotNormalized(total));
        }

        let size = self.committee.size;
        if !(MIN_COMMITTEE_SIZE..=MAX_COMMITTEE_SIZE).contains(&size) {
            return Err(ConfigError::CommitteeSizeOutOfRange(size));
        }

        check_at_most("decay.factor_bps", self.decay.factor_bps, BPS_DENOMINATOR)?;
        check_at_most(
            "lifecycle.leak_penalty_bps",
            self.lifecycle.leak_penalty_bps,
            BPS_DENOMINATOR,
        )?;
        check_at_most(
            "slashing.double_sign_penalty_percent",
            self.slashing.double_sign_penalty_percent.into(),
            100,
        )?;
        check_at_most(
            "slashing.surround_vote_penalty_percent",
            self.slashing.surround_vote_penalty_percent.into(),
            100,
        )?;
        check_at_most(
            "slashing.reporter_reward_percent",
            self.slashing.reporter_reward_percent.into(),
            100,
        )?;

        Ok(())
    }

    pub fn min_stake(&self) -> U256 {
        U256::from(self.lifecycle.min_stake)
    }

    pub fn max_effective_stake(&self) -> U256 {
        U256::from(self.lifecycle.max_effective_stake)
    }

    /// Retention window expressed in slots.
    pub fn retention_slots(&self) -> u64 {
        self.queue.retention_epochs.saturating_mul(self.epoch_length)
    }
}

fn check_at_most(field: &'static str, value: u64, max: u64) -> Result<(), ConfigError> {
    if value > max {
        return Err(ConfigError::OutOfRange { field, value, max });
    }
    Ok(())
}

fn env_parse<T: std::str::FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { key, value }),
        Err(_) => Ok(None),
    }
}
