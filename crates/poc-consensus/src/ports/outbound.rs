//! Driven Ports (SPI - Outbound Dependencies)
//!
//! The consensus core never touches sockets, disks or the execution engine
//! directly. Everything it needs from the outside goes through these traits.

use crate::domain::{
    CheckpointRef, EpochScores, NetworkMessage, RecordedEpoch, SlashingRecord, ValidatorId,
    ValidatorStatus,
};
use crate::error::ConsensusResult;
use async_trait::async_trait;
use shared_types::{EpochNumber, Hash, PeerId, Slot, U256};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Correlation ID for tracking request/response pairs
pub type CorrelationId = Uuid;

/// Gossip transport for consensus messages.
#[async_trait]
pub trait NetworkGateway: Send + Sync {
    /// Send a message to every connected peer.
    async fn broadcast(&self, message: NetworkMessage) -> ConsensusResult<()>;

    /// Tell the peer manager that a peer keeps sending bad signatures.
    async fn report_peer(&self, peer: PeerId, report: PeerReport) -> ConsensusResult<()>;
}

/// Misbehavior report handed to the peer manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerReport {
    pub correlation_id: CorrelationId,
    /// Invalid signatures seen since the last report
    pub invalid_signatures: u32,
    pub last_error: String,
}

/// Durable storage for consensus outputs.
///
/// Finalized checkpoints are append-only: a store must reject an append at or
/// below the last finalized epoch.
#[async_trait]
pub trait ConsensusStore: Send + Sync {
    async fn append_finalized(&self, record: FinalizedCheckpointRecord) -> ConsensusResult<()>;

    /// Persist the outcome of an epoch boundary.
    async fn write_epoch_update(&self, update: EpochUpdate) -> ConsensusResult<()>;

    async fn record_slashing(&self, record: SlashingRecord) -> ConsensusResult<()>;
}

/// A newly finalized checkpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinalizedCheckpointRecord {
    pub correlation_id: CorrelationId,
    pub checkpoint: CheckpointRef,
    /// Stake that attested the finalizing link
    pub attested_stake: U256,
    pub total_active_stake: U256,
    /// Slot during which finality was observed locally
    pub observed_at_slot: Slot,
}

/// Scores and statuses after closing an epoch.
///
/// `recorded` carries the raw tallies so the ledger can be replayed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EpochUpdate {
    pub correlation_id: CorrelationId,
    pub epoch: EpochNumber,
    pub recorded: RecordedEpoch,
    pub scores: EpochScores,
    pub statuses: BTreeMap<ValidatorId, ValidatorStatus>,
    pub registry_version: u64,
}

/// Execution layer hook used when building a block.
#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    /// State root of the block built on `parent` at `slot`.
    async fn state_root(&self, parent: Hash, slot: Slot) -> ConsensusResult<Hash>;
}
