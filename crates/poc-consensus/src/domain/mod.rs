//! Domain module for the PoC consensus core
//!
//! ## Core Modules
//! - validator: Versioned validator registry and lifecycle
//! - score: Contribution scoring with decay
//! - selection: VRF tickets, committees and proposers
//! - attestation / aggregation: Votes and BLS aggregates
//! - checkpoint: Casper FFG checkpoint tree
//! - fork_choice: LMD-GHOST head selection
//! - slashing: Evidence, penalties and automatic detection
//! - epoch_state: Per-chain epoch transition over included blocks
//!
//! ## Supporting Modules
//! - epoch: Slot clock
//! - keys: Local validator key material
//! - messages: Wire messages
//! - inactivity: Quadratic stake drain for liveness

pub mod aggregation;
pub mod attestation;
pub mod checkpoint;
pub mod epoch;
pub mod epoch_state;
pub mod fork_choice;
pub mod inactivity;
pub mod keys;
pub mod messages;
pub mod score;
pub mod selection;
pub mod slashing;
pub mod validator;

// Core exports
pub use aggregation::{AggregationError, AttestationAggregate, AttestationPool, InsertOutcome};
pub use attestation::{verify_batch, Attestation, AttestationData, CheckpointRef, BATCH_THRESHOLD};
pub use checkpoint::{
    double_voter_stake, is_supermajority, Checkpoint, CheckpointState, CheckpointTree,
    FinalityError, LinkOutcome,
};
pub use epoch_state::{
    apply_block_operations, ClosedEpoch, EpochSegment, EpochState, IncludedVote, SegmentBlock,
};
pub use fork_choice::{BlockNode, ForkChoice, ForkChoiceError};
pub use score::{
    ContributionScore, ContributionScorer, EpochScores, EpochTallies, RecordedEpoch, ScoreLedger,
    SCORE_SCALE,
};
pub use selection::{
    derive_epoch_seed, evaluate_ticket, fallback_output, sort_key, verify_ticket, vrf_input, CommitteeMember,
    EpochAssignment, SelectionError, Ticket,
};
pub use slashing::{
    apply_slashing, EvidenceError, OffenseKind, SlashingDetector, SlashingError, SlashingEvidence,
    SlashingRecord,
};
pub use validator::{
    Registration, RegistryError, Validator, ValidatorId, ValidatorRegistry, ValidatorStatus,
};

// Supporting exports
pub use epoch::{SlotClock, SlotPhase};
pub use inactivity::{InactivityLeakTracker, InactivityScore};
pub use keys::ValidatorKeys;
pub use messages::{
    compute_block_hash, Block, BlockBody, EvidenceMessage, MessageKind, NetworkMessage, Operation,
    ProposalMessage, RelayReport, SignedExit,
};
