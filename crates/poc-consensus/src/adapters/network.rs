//! Network adapter that records outgoing traffic.
//!
//! The simulation harness drains the outbox and delivers each message to the
//! other nodes, which keeps multi-node tests deterministic.

use crate::domain::NetworkMessage;
use crate::error::ConsensusResult;
use crate::ports::outbound::{NetworkGateway, PeerReport};
use async_trait::async_trait;
use parking_lot::RwLock;
use shared_types::PeerId;
use tracing::debug;

#[derive(Default)]
pub struct RecordingNetwork {
    outbox: RwLock<Vec<NetworkMessage>>,
    reports: RwLock<Vec<(PeerId, PeerReport)>>,
}

impl RecordingNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every message broadcast since the last drain.
    pub fn drain(&self) -> Vec<NetworkMessage> {
        std::mem::take(&mut *self.outbox.write())
    }

    pub fn pending(&self) -> usize {
        self.outbox.read().len()
    }

    pub fn reports(&self) -> Vec<(PeerId, PeerReport)> {
        self.reports.read().clone()
    }
}

#[async_trait]
impl NetworkGateway for RecordingNetwork {
    async fn broadcast(&self, message: NetworkMessage) -> ConsensusResult<()> {
        debug!(kind = message.kind().as_str(), "broadcast");
        self.outbox.write().push(message);
        Ok(())
    }

    async fn report_peer(&self, peer: PeerId, report: PeerReport) -> ConsensusResult<()> {
        self.reports.write().push((peer, report));
        Ok(())
    }
}
