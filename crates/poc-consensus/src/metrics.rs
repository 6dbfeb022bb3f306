//! # Consensus Metrics
//!
//! Prometheus metrics, enabled with the `metrics` feature:
//! ```toml
//! poc-consensus = { path = "...", features = ["metrics"] }
//! ```
//!
//! ## Metrics Exported
//!
//! - `poc_attestations_accepted_total` - Attestations included in the pool
//! - `poc_attestations_rejected_total` - Rejected attestations (by reason)
//! - `poc_messages_dropped_total` - Dropped inbound frames (by reason)
//! - `poc_checkpoints_justified_total` - Justified checkpoints
//! - `poc_checkpoints_finalized_total` - Finalized checkpoints
//! - `poc_validators_slashed_total` - Slashings applied (by offense)
//! - `poc_epochs_without_finality` - Current finality lag in epochs
//! - `poc_node_halted` - 1 once the node halts on an invariant violation

#[cfg(feature = "metrics")]
use lazy_static::lazy_static;

#[cfg(feature = "metrics")]
use prometheus::{
    register_gauge, register_int_counter, register_int_counter_vec, Gauge, IntCounter,
    IntCounterVec,
};

#[cfg(feature = "metrics")]
lazy_static! {
    pub static ref ATTESTATIONS_ACCEPTED: IntCounter = register_int_counter!(
        "poc_attestations_accepted_total",
        "Total number of attestations included in the pool"
    )
    .expect("Failed to create ATTESTATIONS_ACCEPTED metric");

    pub static ref ATTESTATIONS_REJECTED: IntCounterVec = register_int_counter_vec!(
        "poc_attestations_rejected_total",
        "Total number of attestations rejected",
        &["reason"]
    )
    .expect("Failed to create ATTESTATIONS_REJECTED metric");

    pub static ref MESSAGES_DROPPED: IntCounterVec = register_int_counter_vec!(
        "poc_messages_dropped_total",
        "Total number of inbound frames dropped",
        &["reason"]
    )
    .expect("Failed to create MESSAGES_DROPPED metric");

    pub static ref CHECKPOINTS_JUSTIFIED: IntCounter = register_int_counter!(
        "poc_checkpoints_justified_total",
        "Total number of checkpoints justified"
    )
    .expect("Failed to create CHECKPOINTS_JUSTIFIED metric");

    pub static ref CHECKPOINTS_FINALIZED: IntCounter = register_int_counter!(
        "poc_checkpoints_finalized_total",
        "Total number of checkpoints finalized"
    )
    .expect("Failed to create CHECKPOINTS_FINALIZED metric");

    pub static ref VALIDATORS_SLASHED: IntCounterVec = register_int_counter_vec!(
        "poc_validators_slashed_total",
        "Total number of slashings applied",
        &["offense"]
    )
    .expect("Failed to create VALIDATORS_SLASHED metric");

    pub static ref EPOCHS_WITHOUT_FINALITY: Gauge = register_gauge!(
        "poc_epochs_without_finality",
        "Number of epochs since the last finalized checkpoint"
    )
    .expect("Failed to create EPOCHS_WITHOUT_FINALITY metric");

    pub static ref NODE_HALTED: Gauge = register_gauge!(
        "poc_node_halted",
        "Whether the node halted on an invariant violation (0=no, 1=yes)"
    )
    .expect("Failed to create NODE_HALTED metric");
}

#[cfg(feature = "metrics")]
pub fn record_attestation_accepted() {
    ATTESTATIONS_ACCEPTED.inc();
}

#[cfg(feature = "metrics")]
pub fn record_attestation_rejected(reason: &str) {
    ATTESTATIONS_REJECTED.with_label_values(&[reason]).inc();
}

#[cfg(feature = "metrics")]
pub fn record_message_dropped(reason: &str) {
    MESSAGES_DROPPED.with_label_values(&[reason]).inc();
}

#[cfg(feature = "metrics")]
pub fn record_checkpoint_justified() {
    CHECKPOINTS_JUSTIFIED.inc();
}

#[cfg(feature = "metrics")]
pub fn record_checkpoint_finalized() {
    CHECKPOINTS_FINALIZED.inc();
}

#[cfg(feature = "metrics")]
pub fn record_validator_slashed(offense: &str) {
    VALIDATORS_SLASHED.with_label_values(&[offense]).inc();
}

#[cfg(feature = "metrics")]
pub fn set_epochs_without_finality(epochs: u64) {
    EPOCHS_WITHOUT_FINALITY.set(epochs as f64);
}

#[cfg(feature = "metrics")]
pub fn set_node_halted(halted: bool) {
    NODE_HALTED.set(if halted { 1.0 } else { 0.0 });
}

// =============================================================================
// NO-OP IMPLEMENTATIONS (when metrics feature disabled)
// =============================================================================

#[cfg(not(feature = "metrics"))]
pub fn record_attestation_accepted() {}

#[cfg(not(feature = "metrics"))]
pub fn record_attestation_rejected(_reason: &str) {}

#[cfg(not(feature = "metrics"))]
pub fn record_message_dropped(_reason: &str) {}

#[cfg(not(feature = "metrics"))]
pub fn record_checkpoint_justified() {}

#[cfg(not(feature = "metrics"))]
pub fn record_checkpoint_finalized() {}

#[cfg(not(feature = "metrics"))]
pub fn record_validator_slashed(_offense: &str) {}

#[cfg(not(feature = "metrics"))]
pub fn set_epochs_without_finality(_epochs: u64) {}

#[cfg(not(feature = "metrics"))]
pub fn set_node_halted(_halted: bool) {}
