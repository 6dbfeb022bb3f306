//! Consensus Service - Core business logic
//!
//! # Architecture
//! - Single writer: every transition runs under one `RwLock` on
//!   [`ConsensusState`]; the lock is never held across an `await`
//! - Collaborator calls (gossip, storage, execution) happen after the lock is
//!   released, in the order the transition queued them
//! - A fatal invariant violation halts the node; every later call returns
//!   `SystemHalted`

use crate::config::ConsensusConfig;
use crate::domain::{
    Attestation, CheckpointRef, EvidenceMessage, NetworkMessage, Registration, SlashingEvidence,
    SlotClock, ValidatorId, ValidatorKeys, ValidatorRegistry,
};
use crate::error::ConsensusResult;
use crate::ports::inbound::{ConsensusApi, MessageOutcome, SlotReport};
use crate::ports::outbound::{ConsensusStore, ExecutionGateway, NetworkGateway};
use crate::state::{ConsensusState, Effect, Genesis};
use async_trait::async_trait;
use parking_lot::RwLock;
use shared_types::{EpochNumber, Hash, NodeState, PeerId, Slot};
use std::sync::Arc;
use tracing::warn;

/// Dependencies for ConsensusService
pub struct ConsensusDependencies<N, S, E> {
    pub network: Arc<N>,
    pub store: Arc<S>,
    pub execution: Arc<E>,
    pub config: ConsensusConfig,
    pub genesis: Genesis,
    /// Local validator keys; `None` for an observer node
    pub keys: Option<ValidatorKeys>,
}

/// Consensus Service
pub struct ConsensusService<N, S, E>
where
    N: NetworkGateway,
    S: ConsensusStore,
    E: ExecutionGateway,
{
    state: Arc<RwLock<ConsensusState>>,
    network: Arc<N>,
    store: Arc<S>,
    execution: Arc<E>,
    clock: SlotClock,
    local_id: Option<ValidatorId>,
}

impl<N, S, E> ConsensusService<N, S, E>
where
    N: NetworkGateway,
    S: ConsensusStore,
    E: ExecutionGateway,
{
    pub fn new(deps: ConsensusDependencies<N, S, E>) -> ConsensusResult<Self> {
        let local_id = deps.keys.as_ref().map(ValidatorKeys::id);
        let state = ConsensusState::new(deps.config, deps.genesis, deps.keys)?;
        let clock = state.clock();
        Ok(Self {
            state: Arc::new(RwLock::new(state)),
            network: deps.network,
            store: deps.store,
            execution: deps.execution,
            clock,
            local_id,
        })
    }

    pub fn clock(&self) -> SlotClock {
        self.clock
    }

    pub fn local_id(&self) -> Option<ValidatorId> {
        self.local_id
    }

    pub fn current_slot(&self) -> Slot {
        self.state.read().current_slot()
    }

    /// Committee of `epoch` on the head chain, in position order.
    pub fn committee(&self, epoch: EpochNumber) -> Option<Vec<ValidatorId>> {
        self.state
            .read()
            .assignment(epoch)
            .map(|a| a.committee().iter().map(|m| m.validator).collect())
    }

    pub fn proposer_for_slot(&self, slot: Slot) -> Option<ValidatorId> {
        let state = self.state.read();
        state
            .assignment(self.clock.epoch_of(slot))
            .and_then(|a| a.proposer_for_slot(slot))
    }

    /// Validators with an attestation duty in `epoch` on the head chain.
    pub fn attesters(&self, epoch: EpochNumber) -> Option<Vec<ValidatorId>> {
        self.state
            .read()
            .assignment(epoch)
            .map(|a| a.attesters().to_vec())
    }

    pub fn unresolved_attestations(&self) -> usize {
        self.state.read().unresolved_len()
    }

    /// Blocks waiting for an unknown parent.
    pub fn orphaned_blocks(&self) -> usize {
        self.state.read().orphan_len()
    }

    /// Run queued collaborator calls; returns the first storage failure.
    async fn execute(&self, effects: Vec<Effect>) -> ConsensusResult<()> {
        let mut first_error = None;
        for effect in effects {
            match effect {
                Effect::Broadcast(message) => {
                    let kind = message.kind();
                    if let Err(e) = self.network.broadcast(message).await {
                        warn!(kind = kind.as_str(), error = %e, "Broadcast failed");
                    }
                }
                Effect::ReportPeer(peer, report) => {
                    if let Err(e) = self.network.report_peer(peer, report).await {
                        warn!(peer = %peer, error = %e, "Peer report failed");
                    }
                }
                Effect::Finalized(record) => {
                    if let Err(e) = self.store.append_finalized(record).await {
                        poc_telemetry::log_event!(error, "consensus_store", "Failed to persist finalized checkpoint", error = %e);
                        first_error.get_or_insert(e);
                    }
                }
                Effect::EpochClosed(update) => {
                    if let Err(e) = self.store.write_epoch_update(update).await {
                        poc_telemetry::log_event!(error, "consensus_store", "Failed to persist epoch update", error = %e);
                        first_error.get_or_insert(e);
                    }
                }
                Effect::Slashed(record) => {
                    if let Err(e) = self.store.record_slashing(record).await {
                        poc_telemetry::log_event!(error, "consensus_store", "Failed to persist slashing record", error = %e);
                        first_error.get_or_insert(e);
                    }
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Execute `effects`, then report the transition's own result first.
    async fn finish<T>(&self, result: ConsensusResult<T>, effects: Vec<Effect>) -> ConsensusResult<T> {
        let executed = self.execute(effects).await;
        let value = result?;
        executed?;
        Ok(value)
    }
}

#[async_trait]
impl<N, S, E> ConsensusApi for ConsensusService<N, S, E>
where
    N: NetworkGateway + 'static,
    S: ConsensusStore + 'static,
    E: ExecutionGateway + 'static,
{
    async fn on_slot_start(&self, slot: Slot) -> ConsensusResult<SlotReport> {
        let mut effects = Vec::new();
        let started = {
            let mut state = self.state.write();
            let result = state.start_slot(slot, &mut effects);
            match state.guard(result) {
                Ok(report) => state.proposal_duty(slot).map(|duty| (report, duty)),
                Err(e) => Err(e),
            }
        };
        let (mut report, duty) = self.finish(started, std::mem::take(&mut effects)).await?;

        if let Some(parent) = duty {
            let state_root = self.execution.state_root(parent, slot).await?;
            let proposed = {
                let mut state = self.state.write();
                let result = state.propose(slot, parent, state_root, &mut effects);
                state.guard(result)
            };
            report.proposed = self.finish(proposed, effects).await?;
        }
        Ok(report)
    }

    async fn on_attestation_due(&self, slot: Slot) -> ConsensusResult<bool> {
        let mut effects = Vec::new();
        let result = {
            let mut state = self.state.write();
            let result = state.attest(slot, &mut effects);
            state.guard(result)
        };
        self.finish(result, effects).await
    }

    async fn handle_message(
        &self,
        message: NetworkMessage,
        peer: PeerId,
    ) -> ConsensusResult<MessageOutcome> {
        let mut effects = Vec::new();
        let result = self.state.write().handle_message(message, peer, &mut effects);
        self.finish(result, effects).await
    }

    async fn handle_attestations(
        &self,
        batch: Vec<(Attestation, PeerId)>,
    ) -> Vec<ConsensusResult<MessageOutcome>> {
        let mut effects = Vec::new();
        let results = self.state.write().handle_attestations(batch, &mut effects);
        if let Err(e) = self.execute(effects).await {
            warn!(error = %e, "Collaborator failure after attestation batch");
        }
        results
    }

    async fn submit_evidence(
        &self,
        evidence: SlashingEvidence,
        reporter: Option<ValidatorId>,
    ) -> ConsensusResult<bool> {
        let mut effects = Vec::new();
        let result = {
            let mut state = self.state.write();
            let result = state.queue_evidence(evidence.clone(), reporter);
            state.guard(result)
        };
        if matches!(result, Ok(true)) {
            effects.push(Effect::Broadcast(NetworkMessage::Evidence(EvidenceMessage {
                evidence,
                reporter,
            })));
        }
        self.finish(result, effects).await
    }

    async fn register_validator(&self, registration: Registration) -> ConsensusResult<ValidatorId> {
        let mut effects = Vec::new();
        let result = {
            let mut state = self.state.write();
            let result = state.register_validator(registration, &mut effects);
            state.guard(result)
        };
        self.finish(result, effects).await
    }

    async fn request_exit(&self, validator: ValidatorId) -> ConsensusResult<()> {
        let mut effects = Vec::new();
        let result = {
            let mut state = self.state.write();
            let result = state.request_exit(validator, &mut effects);
            state.guard(result)
        };
        self.finish(result, effects).await
    }

    async fn record_relay(&self, validator: ValidatorId, messages: u64) -> ConsensusResult<()> {
        self.state.write().record_relay(validator, messages)
    }

    async fn head(&self) -> ConsensusResult<Hash> {
        self.state.read().head()
    }

    async fn finalized_checkpoint(&self) -> CheckpointRef {
        self.state.read().finalized()
    }

    async fn justified_checkpoint(&self) -> CheckpointRef {
        self.state.read().justified()
    }

    async fn node_state(&self) -> NodeState {
        self.state.read().node_state()
    }

    async fn registry(&self) -> ValidatorRegistry {
        self.state.read().registry().clone()
    }
}
