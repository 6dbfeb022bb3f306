//! # In-memory multi-validator simulation
//!
//! Every node is a full [`ConsensusService`] with its own recording network,
//! store and execution adapter. The simulation drives all nodes slot by slot
//! and moves gossip between them in rounds:
//!
//! ```text
//! step(slot):
//!   on_slot_start on every online node   → deliver until quiet
//!   on_attestation_due on every node     → deliver until quiet
//! ```
//!
//! Delivery respects the online set and an optional partition, and can
//! shuffle messages (seeded), redeliver every round a second time, or drop
//! one message kind on its way to a given node.

use poc_consensus::domain::{CheckpointRef, MessageKind};
use poc_consensus::{
    Attestation, ConsensusApi, ConsensusConfig, ConsensusDependencies, ConsensusResult,
    ConsensusService, Genesis, HashChainExecution, InMemoryConsensusStore, MessageOutcome,
    NetworkMessage, RecordingNetwork, ValidatorId, ValidatorKeys, ValidatorRegistry,
};
use poc_telemetry::{init_telemetry, TelemetryConfig, TelemetryGuard};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use shared_types::{Hash, PeerId, Slot, U256};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, OnceLock};
use tracing::debug;

pub type SimService = ConsensusService<RecordingNetwork, InMemoryConsensusStore, HashChainExecution>;

/// Stake given to every genesis validator.
pub const GENESIS_STAKE: u64 = 1000;

static TELEMETRY: OnceLock<Option<TelemetryGuard>> = OnceLock::new();

/// Install logging once per test binary when `POC_LOG_LEVEL` is set.
pub fn init_logging() {
    TELEMETRY.get_or_init(|| {
        std::env::var("POC_LOG_LEVEL")
            .ok()
            .and_then(|_| init_telemetry(TelemetryConfig::for_node("simulation")).ok())
    });
}

/// Deterministic keys of simulated validator `index`.
pub fn validator_keys(index: usize) -> ValidatorKeys {
    let seed = [index as u8 + 1; 32];
    ValidatorKeys::from_seed(seed).expect("seeded keys")
}

pub fn validator_id(index: usize) -> ValidatorId {
    validator_keys(index).id()
}

pub fn peer_of(index: usize) -> PeerId {
    PeerId([index as u8 + 1; 32])
}

/// Config with a short epoch; at the default committee size every active
/// validator proposes.
pub fn sim_config(epoch_length: u64) -> ConsensusConfig {
    ConsensusConfig {
        slot_duration_secs: 1,
        epoch_length,
        genesis_seed: [42; 32],
        ..ConsensusConfig::default()
    }
}

pub struct SimNode {
    pub service: Arc<SimService>,
    pub network: Arc<RecordingNetwork>,
    pub store: Arc<InMemoryConsensusStore>,
    pub peer: PeerId,
    pub validator: ValidatorId,
}

/// Counts of delivery outcomes across all nodes.
#[derive(Clone, Debug, Default)]
pub struct DeliveryStats {
    pub accepted: usize,
    pub duplicate: usize,
    pub buffered: usize,
    pub ignored: usize,
    pub rejected: usize,
    /// Offenders caught while handling gossip, once per receiving node
    pub slashed: Vec<ValidatorId>,
}

impl DeliveryStats {
    fn record(&mut self, result: &ConsensusResult<MessageOutcome>) {
        match result {
            Ok(MessageOutcome::Accepted) => self.accepted += 1,
            Ok(MessageOutcome::Duplicate) => self.duplicate += 1,
            Ok(MessageOutcome::Buffered) => self.buffered += 1,
            Ok(MessageOutcome::Ignored(_)) => self.ignored += 1,
            Ok(MessageOutcome::Slashed(id)) => self.slashed.push(*id),
            Err(e) => {
                debug!(error = %e, "Delivery rejected");
                self.rejected += 1;
            }
        }
    }
}

pub struct Simulation {
    nodes: Vec<SimNode>,
    online: BTreeSet<usize>,
    /// Node index to partition group; `None` means fully connected
    partition: Option<BTreeMap<usize, usize>>,
    duplicate_delivery: bool,
    /// (receiver, kind) pairs that never arrive
    dropped: BTreeSet<(usize, MessageKind)>,
    shuffle: Option<StdRng>,
    /// Every gossiped message with its sender, once recording is enabled
    history: Option<Vec<(usize, NetworkMessage)>>,
    next_slot: Slot,
    /// Blocks proposed per slot, with the proposing node
    proposals: BTreeMap<Slot, Vec<(usize, Hash)>>,
    pub stats: DeliveryStats,
}

impl Simulation {
    /// `count` validators with [`GENESIS_STAKE`] each, one node per validator.
    pub fn new(count: usize, config: ConsensusConfig) -> Self {
        init_logging();
        let validators: Vec<_> = (0..count)
            .map(|i| validator_keys(i).genesis_validator(U256::from(GENESIS_STAKE)))
            .collect();

        let nodes = (0..count)
            .map(|i| {
                let genesis = Genesis::new(validators.clone(), &config.genesis_seed)
                    .expect("distinct genesis validators");
                let network = Arc::new(RecordingNetwork::new());
                let store = Arc::new(InMemoryConsensusStore::new());
                let service = ConsensusService::new(ConsensusDependencies {
                    network: network.clone(),
                    store: store.clone(),
                    execution: Arc::new(HashChainExecution),
                    config: config.clone(),
                    genesis,
                    keys: Some(validator_keys(i)),
                })
                .expect("valid simulation config");
                SimNode {
                    service: Arc::new(service),
                    network,
                    store,
                    peer: peer_of(i),
                    validator: validator_id(i),
                }
            })
            .collect();

        Self {
            nodes,
            online: (0..count).collect(),
            partition: None,
            duplicate_delivery: false,
            dropped: BTreeSet::new(),
            shuffle: None,
            history: None,
            next_slot: 0,
            proposals: BTreeMap::new(),
            stats: DeliveryStats::default(),
        }
    }

    pub fn nodes(&self) -> &[SimNode] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> &SimNode {
        &self.nodes[index]
    }

    pub fn online(&self) -> impl Iterator<Item = &SimNode> {
        self.online.iter().map(|&i| &self.nodes[i])
    }

    /// Next slot `step` will run.
    pub fn next_slot(&self) -> Slot {
        self.next_slot
    }

    pub fn set_online(&mut self, index: usize, online: bool) {
        if online {
            self.online.insert(index);
        } else {
            self.online.remove(&index);
        }
    }

    /// Split the nodes into groups that cannot hear each other.
    pub fn partition(&mut self, groups: &[&[usize]]) {
        let mut map = BTreeMap::new();
        for (group, members) in groups.iter().enumerate() {
            for &node in members.iter() {
                map.insert(node, group);
            }
        }
        self.partition = Some(map);
    }

    pub fn heal(&mut self) {
        self.partition = None;
    }

    /// Deliver every gossip round twice and start every slot twice.
    pub fn set_duplicate_delivery(&mut self, enabled: bool) {
        self.duplicate_delivery = enabled;
    }

    /// Never deliver messages of `kind` to node `to`.
    pub fn drop_incoming(&mut self, to: usize, kind: MessageKind) {
        self.dropped.insert((to, kind));
    }

    /// Shuffle message order within each round using `seed`.
    pub fn shuffle_delivery(&mut self, seed: u64) {
        self.shuffle = Some(StdRng::seed_from_u64(seed));
    }

    /// Keep a copy of all gossip from now on.
    pub fn record_history(&mut self) {
        self.history.get_or_insert_with(Vec::new);
    }

    pub fn history(&self) -> &[(usize, NetworkMessage)] {
        self.history.as_deref().unwrap_or(&[])
    }

    /// Proposers of `slot` across all nodes.
    pub fn proposals_at(&self, slot: Slot) -> &[(usize, Hash)] {
        self.proposals.get(&slot).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Run one slot on every online node.
    pub async fn step(&mut self) {
        let slot = self.next_slot;
        self.next_slot += 1;

        let online: Vec<usize> = self.online.iter().copied().collect();
        for &i in &online {
            let service = self.nodes[i].service.clone();
            let report = service.on_slot_start(slot).await.expect("slot start");
            if let Some(hash) = report.proposed {
                self.proposals.entry(slot).or_default().push((i, hash));
            }
            if self.duplicate_delivery {
                let again = service.on_slot_start(slot).await.expect("slot restart");
                assert_eq!(again.proposed, None, "slot {slot} proposed twice");
            }
        }
        self.deliver().await;

        for &i in &online {
            let service = self.nodes[i].service.clone();
            service.on_attestation_due(slot).await.expect("attestation duty");
            if self.duplicate_delivery {
                let again = service.on_attestation_due(slot).await.expect("attestation duty");
                assert!(!again, "slot {slot} attested twice");
            }
        }
        self.deliver().await;
    }

    /// Run slots until `last` has been stepped.
    pub async fn run_through(&mut self, last: Slot) {
        while self.next_slot <= last {
            self.step().await;
        }
    }

    /// Run until the start of `epoch` has been stepped.
    pub async fn run_to_epoch(&mut self, epoch: u64) {
        let epoch_length = self.nodes[0].service.clock().epoch_length();
        self.run_through(epoch * epoch_length).await;
    }

    /// Move queued gossip between nodes until every outbox is empty.
    pub async fn deliver(&mut self) {
        loop {
            let mut round = Vec::new();
            for (i, node) in self.nodes.iter().enumerate() {
                let outbox = node.network.drain();
                if self.online.contains(&i) {
                    round.extend(outbox.into_iter().map(|message| (i, message)));
                }
            }
            if round.is_empty() {
                return;
            }
            if let Some(rng) = self.shuffle.as_mut() {
                round.shuffle(rng);
            }
            if let Some(history) = self.history.as_mut() {
                history.extend(round.iter().cloned());
            }
            self.deliver_round(&round).await;
            if self.duplicate_delivery {
                self.deliver_round(&round).await;
            }
        }
    }

    async fn deliver_round(&mut self, round: &[(usize, NetworkMessage)]) {
        let receivers: Vec<usize> = self.online.iter().copied().collect();
        for &to in &receivers {
            let service = self.nodes[to].service.clone();
            let mut attestations: Vec<(Attestation, PeerId)> = Vec::new();
            for (from, message) in round {
                if *from == to
                    || !self.connected(*from, to)
                    || self.dropped.contains(&(to, message.kind()))
                {
                    continue;
                }
                let peer = self.nodes[*from].peer;
                match message {
                    NetworkMessage::Attestation(attestation) => {
                        attestations.push((attestation.clone(), peer))
                    }
                    other => {
                        let result = service.handle_message(other.clone(), peer).await;
                        self.stats.record(&result);
                    }
                }
            }
            if !attestations.is_empty() {
                for result in service.handle_attestations(attestations).await {
                    self.stats.record(&result);
                }
            }
        }
    }

    fn connected(&self, a: usize, b: usize) -> bool {
        match &self.partition {
            None => true,
            Some(groups) => groups.get(&a) == groups.get(&b),
        }
    }

    /// Hand a message straight to one node, bypassing gossip.
    pub async fn inject(
        &mut self,
        to: usize,
        message: NetworkMessage,
        peer: PeerId,
    ) -> ConsensusResult<MessageOutcome> {
        let result = self.nodes[to].service.handle_message(message, peer).await;
        self.stats.record(&result);
        result
    }

    pub async fn finalized(&self, index: usize) -> CheckpointRef {
        self.nodes[index].service.finalized_checkpoint().await
    }

    pub async fn justified(&self, index: usize) -> CheckpointRef {
        self.nodes[index].service.justified_checkpoint().await
    }

    pub async fn registry(&self, index: usize) -> ValidatorRegistry {
        self.nodes[index].service.registry().await
    }

    /// Finalized checkpoints persisted by node `index`, in order.
    pub fn finalized_history(&self, index: usize) -> Vec<CheckpointRef> {
        self.nodes[index]
            .store
            .finalized()
            .into_iter()
            .map(|record| record.checkpoint)
            .collect()
    }
}

/// Panic if two histories finalize different blocks for one epoch.
pub fn assert_no_conflicting_finality(a: &[CheckpointRef], b: &[CheckpointRef]) {
    let by_epoch: BTreeMap<u64, Hash> = a.iter().map(|c| (c.epoch, c.block_hash)).collect();
    for checkpoint in b {
        if let Some(hash) = by_epoch.get(&checkpoint.epoch) {
            assert_eq!(
                *hash, checkpoint.block_hash,
                "conflicting finalized checkpoints at epoch {}",
                checkpoint.epoch
            );
        }
    }
}
