//! Ports module for the consensus core

pub mod inbound;
pub mod outbound;

pub use inbound::{ConsensusApi, MessageOutcome, SlotReport};
pub use outbound::{
    ConsensusStore, CorrelationId, EpochUpdate, ExecutionGateway, FinalizedCheckpointRecord,
    NetworkGateway, PeerReport,
};
