//! Driving Ports (API - Inbound)

use crate::domain::{
    Attestation, CheckpointRef, NetworkMessage, Registration, SlashingEvidence, ValidatorId,
    ValidatorRegistry,
};
use crate::error::ConsensusResult;
use async_trait::async_trait;
use shared_types::{Hash, NodeState, PeerId, Slot};

/// What happened to an inbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Applied to consensus state
    Accepted,
    /// Already seen
    Duplicate,
    /// Signature checked, waiting for a block it references or its parent
    Buffered,
    /// Valid but no longer useful (late ticket, full buffer)
    Ignored(&'static str),
    /// Caught its sender equivocating; evidence was applied
    Slashed(ValidatorId),
}

/// Local duties performed at a slot boundary.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SlotReport {
    pub slot: Slot,
    /// Epochs closed during this call
    pub epochs_closed: Vec<u64>,
    /// Block proposed by this node, if it was the slot's proposer
    pub proposed: Option<Hash>,
    pub tickets_published: usize,
}

/// Primary consensus API
///
/// All calls are serialized on the service's state lock; the runtime feeds
/// clock ticks and network frames through this trait.
#[async_trait]
pub trait ConsensusApi: Send + Sync {
    /// Advance to `slot`: refresh the head, report closed epochs, publish
    /// the next ticket and propose if due.
    async fn on_slot_start(&self, slot: Slot) -> ConsensusResult<SlotReport>;

    /// Sign and broadcast this node's attestation if it is due at `slot`.
    async fn on_attestation_due(&self, slot: Slot) -> ConsensusResult<bool>;

    /// Validate and apply a message received from `peer`.
    async fn handle_message(
        &self,
        message: NetworkMessage,
        peer: PeerId,
    ) -> ConsensusResult<MessageOutcome>;

    /// Validate and apply attestations received together, verifying their
    /// signatures in one batch. Results are aligned with the input.
    async fn handle_attestations(
        &self,
        batch: Vec<(Attestation, PeerId)>,
    ) -> Vec<ConsensusResult<MessageOutcome>>;

    /// Verify externally reported evidence and queue it for inclusion.
    ///
    /// The slashing applies once a block carries it. Returns `false` when
    /// the offender is already slashed or already has evidence queued.
    async fn submit_evidence(
        &self,
        evidence: SlashingEvidence,
        reporter: Option<ValidatorId>,
    ) -> ConsensusResult<bool>;

    /// Queue a registration; the validator is Pending once a block carries
    /// it and activates at the following epoch boundary.
    async fn register_validator(&self, registration: Registration) -> ConsensusResult<ValidatorId>;

    /// Sign and queue this node's voluntary exit.
    async fn request_exit(&self, validator: ValidatorId) -> ConsensusResult<()>;

    /// Credit relay work measured by the network layer; the next local
    /// block reports it.
    async fn record_relay(&self, validator: ValidatorId, messages: u64) -> ConsensusResult<()>;

    /// Fork-choice head.
    async fn head(&self) -> ConsensusResult<Hash>;

    async fn finalized_checkpoint(&self) -> CheckpointRef;

    async fn justified_checkpoint(&self) -> CheckpointRef;

    async fn node_state(&self) -> NodeState;

    /// Snapshot of the validator registry.
    async fn registry(&self) -> ValidatorRegistry;
}
