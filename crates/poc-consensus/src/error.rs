//! Error types for the consensus core

use crate::config::ConfigError;
use crate::domain::aggregation::AggregationError;
use crate::domain::checkpoint::FinalityError;
use crate::domain::fork_choice::ForkChoiceError;
use crate::domain::selection::SelectionError;
use crate::domain::slashing::{EvidenceError, SlashingError};
use crate::domain::validator::RegistryError;
use shared_types::{CodecError, EpochNumber, Slot};
use thiserror::Error;

/// Consensus service errors
#[derive(Debug, Error)]
pub enum ConsensusError {
    /// Node refused input after a fatal invariant violation
    #[error("System halted awaiting intervention")]
    SystemHalted,

    /// An internal invariant no longer holds; the node halts
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Malformed message: {0}")]
    Malformed(#[from] CodecError),

    #[error("Invalid signature from validator {validator}")]
    InvalidSignature { validator: String },

    #[error("Unknown validator {validator}")]
    UnknownValidator { validator: String },

    #[error("Message for slot {slot} outside the accepted window (current slot {current})")]
    OutsideWindow { slot: Slot, current: Slot },

    #[error("No assignment for epoch {epoch}")]
    NoAssignment { epoch: EpochNumber },

    #[error("Unknown parent block {parent}")]
    UnknownParent { parent: String },

    #[error("Block hash does not commit to the proposal header")]
    BlockHashMismatch,

    #[error("Invalid block body: {0}")]
    InvalidBlockBody(String),

    #[error("Proposer {validator} is slashed")]
    ProposerSlashed { validator: String },

    #[error("Operation requires the local validator key")]
    NotLocalValidator,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Aggregation(#[from] AggregationError),

    #[error(transparent)]
    Finality(#[from] FinalityError),

    #[error(transparent)]
    ForkChoice(#[from] ForkChoiceError),

    #[error(transparent)]
    Evidence(#[from] EvidenceError),

    #[error(transparent)]
    Slashing(#[from] SlashingError),

    /// Outbound collaborator failure (network, storage, execution)
    #[error("{collaborator} error: {reason}")]
    Collaborator {
        collaborator: &'static str,
        reason: String,
    },
}

impl ConsensusError {
    /// Whether the runtime must stop after this error.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::SystemHalted | Self::InvariantViolation(_) => true,
            Self::Finality(e) => e.is_fatal(),
            _ => false,
        }
    }

    /// Whether the error is attributable to a bad signature from the sender.
    pub fn is_signature_failure(&self) -> bool {
        matches!(
            self,
            Self::InvalidSignature { .. }
                | Self::Selection(SelectionError::InvalidTicket { .. })
                | Self::Evidence(EvidenceError::InvalidSignature)
                | Self::Aggregation(AggregationError::InvalidSignature)
        )
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::SystemHalted => "halted",
            Self::InvariantViolation(_) => "invariant",
            Self::Malformed(_) => "malformed",
            Self::InvalidSignature { .. } => "invalid_signature",
            Self::UnknownValidator { .. } => "unknown_validator",
            Self::OutsideWindow { .. } => "outside_window",
            Self::NoAssignment { .. } => "no_assignment",
            Self::UnknownParent { .. } => "unknown_parent",
            Self::BlockHashMismatch => "block_hash_mismatch",
            Self::InvalidBlockBody(_) => "invalid_block_body",
            Self::ProposerSlashed { .. } => "proposer_slashed",
            Self::NotLocalValidator => "not_local_validator",
            Self::Config(_) => "config",
            Self::Registry(_) => "registry",
            Self::Selection(_) => "selection",
            Self::Aggregation(_) => "aggregation",
            Self::Finality(_) => "finality",
            Self::ForkChoice(_) => "fork_choice",
            Self::Evidence(_) => "evidence",
            Self::Slashing(_) => "slashing",
            Self::Collaborator { .. } => "collaborator",
        }
    }
}

/// Result type for consensus operations
pub type ConsensusResult<T> = Result<T, ConsensusError>;
