//! Mutable consensus state and the transitions applied to it.
//!
//! Every method here is synchronous and runs under the service's write lock,
//! so consensus state has a single writer. Work that needs a collaborator
//! (gossip, storage) is queued as an [`Effect`] and executed by the service
//! after the lock is released.
//!
//! Committees, scores and validator statuses come from the [`EpochState`] of
//! the chain being looked at, derived from that chain's blocks alone. Gossip
//! only fills the pools a proposer draws its block body from, so a node that
//! missed a ticket or a vote still agrees with its peers once it holds the
//! same blocks.

use crate::config::ConsensusConfig;
use crate::domain::{
    apply_block_operations, evaluate_ticket, verify_batch, verify_ticket, AggregationError,
    Attestation, AttestationData, AttestationPool, Block, BlockBody, BlockNode, CheckpointRef,
    CheckpointTree, ContributionScorer, EpochAssignment, EpochState, EvidenceMessage,
    FinalityError, ForkChoice, InsertOutcome, MessageKind, NetworkMessage, Operation,
    Registration, RegistryError, RelayReport, SignedExit, SlashingDetector, SlashingEvidence,
    SlashingRecord, SlotClock, Ticket, Validator, ValidatorId, ValidatorKeys, ValidatorRegistry,
    ValidatorStatus,
};
use crate::domain::epoch_state::{EpochSegment, SegmentBlock};
use crate::error::{ConsensusError, ConsensusResult};
use crate::metrics;
use crate::ports::inbound::{MessageOutcome, SlotReport};
use crate::ports::outbound::{EpochUpdate, FinalizedCheckpointRecord, PeerReport};
use shared_crypto::blake3_hash_many;
use shared_types::{short_hex, EpochNumber, Hash, NodeState, PeerId, Slot, U256};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Upper bounds on one block body; together they stay well inside a frame.
const MAX_BODY_TICKETS: usize = 128;
const MAX_BODY_ATTESTATIONS: usize = 128;
const MAX_BODY_EVIDENCE: usize = 8;
const MAX_BODY_OPERATIONS: usize = 16;
const MAX_BODY_RELAY: usize = 128;

/// Collaborator call produced by a state transition.
#[derive(Clone, Debug)]
pub(crate) enum Effect {
    Broadcast(NetworkMessage),
    ReportPeer(PeerId, PeerReport),
    Finalized(FinalizedCheckpointRecord),
    EpochClosed(EpochUpdate),
    Slashed(SlashingRecord),
}

/// Chain parameters every node starts from.
#[derive(Clone, Debug)]
pub struct Genesis {
    pub registry: ValidatorRegistry,
    /// Hash of the slot-0 block
    pub block_hash: Hash,
}

impl Genesis {
    /// Genesis with the block hash derived from the epoch-0 seed.
    pub fn new(validators: Vec<Validator>, seed: &Hash) -> Result<Self, RegistryError> {
        Ok(Self {
            registry: ValidatorRegistry::from_genesis(validators)?,
            block_hash: blake3_hash_many(&[b"poc-genesis".as_slice(), seed]),
        })
    }
}

/// Whether a dedup key was seen, and with what content.
enum Seen {
    New,
    Same,
    Different,
}

/// Whether an attestation's checkpoints are known locally.
enum Resolution {
    Ready,
    Pending,
}

#[derive(Clone, Debug)]
struct Unresolved {
    attestation: Attestation,
    received_slot: Slot,
}

/// A chain's epoch state plus the registry changes its blocks in that epoch
/// made so far.
struct ChainView {
    state: Arc<EpochState>,
    registry: ValidatorRegistry,
    slashings: Vec<SlashingRecord>,
}

/// Check an operation against `registry` and apply it there.
fn apply_operation(
    registry: &mut ValidatorRegistry,
    operation: &Operation,
    min_stake: U256,
    epoch: EpochNumber,
) -> ConsensusResult<()> {
    match operation {
        Operation::Register(registration) => {
            registry.register(registration.clone(), min_stake, epoch)?;
        }
        Operation::Exit(exit) => {
            let validator = registry.get(&exit.validator).ok_or_else(|| {
                ConsensusError::UnknownValidator {
                    validator: exit.validator.to_string(),
                }
            })?;
            exit.verify(&validator.signing_key)
                .map_err(|_| ConsensusError::InvalidSignature {
                    validator: exit.validator.to_string(),
                })?;
            registry.request_exit(&exit.validator, epoch)?;
        }
    }
    Ok(())
}

fn invalid_body(reason: impl Into<String>) -> ConsensusError {
    ConsensusError::InvalidBlockBody(reason.into())
}

pub(crate) struct ConsensusState {
    config: ConsensusConfig,
    clock: SlotClock,
    scorer: ContributionScorer,
    local: Option<ValidatorKeys>,
    local_id: Option<ValidatorId>,
    node_state: NodeState,
    last_slot: Option<Slot>,
    current_slot: Slot,
    genesis: Hash,
    /// Every imported block except genesis
    blocks: HashMap<Hash, Block>,
    /// Epoch states by epoch and dependent root
    epoch_states: HashMap<(EpochNumber, Hash), Arc<EpochState>>,
    /// Epoch states along the head chain
    canonical: BTreeMap<EpochNumber, Arc<EpochState>>,
    /// Weighs fork-choice votes
    justified_state: Arc<EpochState>,
    /// Registry at the head, after its blocks in the current epoch
    registry: ValidatorRegistry,
    head: Hash,
    /// Finalized epoch and its dependent root; the block tree starts here
    anchor: (EpochNumber, Hash),
    fork_choice: ForkChoice,
    checkpoints: CheckpointTree,
    pool: AttestationPool,
    detector: SlashingDetector,
    tickets: BTreeMap<EpochNumber, BTreeMap<ValidatorId, Ticket>>,
    /// Tickets for the epoch after next, verified once its seed is known
    early_tickets: Vec<Ticket>,
    /// Votes awaiting inclusion, first per validator and target epoch
    votes: BTreeMap<(EpochNumber, ValidatorId), Attestation>,
    evidence: BTreeMap<ValidatorId, EvidenceMessage>,
    operations: BTreeMap<ValidatorId, Operation>,
    /// Relay work measured locally since this node last proposed
    relay: BTreeMap<ValidatorId, u64>,
    /// Blocks waiting for their parent, by parent hash
    orphans: HashMap<Hash, Vec<Block>>,
    /// Parents asked for; they are accepted outside the slot window
    requested: HashSet<Hash>,
    published_ticket: Option<EpochNumber>,
    last_reported: Option<EpochNumber>,
    reported_slashings: HashSet<ValidatorId>,
    /// Dedup keys and the digest of the first content seen under each
    seen: HashMap<(ValidatorId, MessageKind, u64), Hash>,
    unresolved: VecDeque<Unresolved>,
    peer_failures: HashMap<PeerId, u32>,
    last_proposed: Option<Slot>,
    last_attested: Option<Slot>,
}

impl ConsensusState {
    pub fn new(
        config: ConsensusConfig,
        genesis: Genesis,
        local: Option<ValidatorKeys>,
    ) -> ConsensusResult<Self> {
        config.validate()?;
        let clock = SlotClock::new(
            Duration::from_secs(config.slot_duration_secs),
            config.epoch_length,
        );
        let local_id = local.as_ref().map(ValidatorKeys::id);
        let genesis_state = Arc::new(EpochState::genesis(genesis.registry, &config)?);
        let mut epoch_states = HashMap::new();
        epoch_states.insert((0, genesis.block_hash), Arc::clone(&genesis_state));
        let mut canonical = BTreeMap::new();
        canonical.insert(0, Arc::clone(&genesis_state));

        Ok(Self {
            clock,
            scorer: ContributionScorer::new(&config),
            local,
            local_id,
            node_state: NodeState::Running,
            last_slot: None,
            current_slot: 0,
            genesis: genesis.block_hash,
            blocks: HashMap::new(),
            epoch_states,
            canonical,
            registry: genesis_state.registry.clone(),
            justified_state: genesis_state,
            head: genesis.block_hash,
            anchor: (0, genesis.block_hash),
            fork_choice: ForkChoice::new(genesis.block_hash),
            checkpoints: CheckpointTree::new(CheckpointRef::new(0, genesis.block_hash)),
            pool: AttestationPool::new(),
            detector: SlashingDetector::new(),
            tickets: BTreeMap::new(),
            early_tickets: Vec::new(),
            votes: BTreeMap::new(),
            evidence: BTreeMap::new(),
            operations: BTreeMap::new(),
            relay: BTreeMap::new(),
            orphans: HashMap::new(),
            requested: HashSet::new(),
            published_ticket: None,
            last_reported: None,
            reported_slashings: HashSet::new(),
            seen: HashMap::new(),
            unresolved: VecDeque::new(),
            peer_failures: HashMap::new(),
            last_proposed: None,
            last_attested: None,
            config,
        })
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn node_state(&self) -> NodeState {
        self.node_state
    }

    pub fn clock(&self) -> SlotClock {
        self.clock
    }

    pub fn current_slot(&self) -> Slot {
        self.current_slot
    }

    pub fn registry(&self) -> &ValidatorRegistry {
        &self.registry
    }

    /// Assignment of `epoch` on the head chain, while retained.
    pub fn assignment(&self, epoch: EpochNumber) -> Option<&EpochAssignment> {
        self.canonical.get(&epoch).map(|state| &state.assignment)
    }

    pub fn finalized(&self) -> CheckpointRef {
        self.checkpoints.latest_finalized()
    }

    pub fn justified(&self) -> CheckpointRef {
        self.checkpoints.latest_justified()
    }

    pub fn unresolved_len(&self) -> usize {
        self.unresolved.len()
    }

    pub fn orphan_len(&self) -> usize {
        self.orphans.values().map(Vec::len).sum()
    }

    /// LMD-GHOST head from the latest justified block, or the finalized one
    /// when the justified block is not known.
    pub fn head(&self) -> ConsensusResult<Hash> {
        let justified = self.checkpoints.latest_justified().block_hash;
        let root = if self.fork_choice.has_block(&justified) {
            justified
        } else {
            self.checkpoints.latest_finalized().block_hash
        };
        Ok(self
            .fork_choice
            .head(&root, &self.justified_state.registry)?)
    }

    pub fn ensure_running(&self) -> ConsensusResult<()> {
        match self.node_state {
            NodeState::Running => Ok(()),
            NodeState::HaltedAwaitingIntervention => Err(ConsensusError::SystemHalted),
        }
    }

    /// Halt on a fatal error. Returns the error unchanged.
    pub fn guard<T>(&mut self, result: ConsensusResult<T>) -> ConsensusResult<T> {
        if let Err(e) = &result {
            if e.is_fatal() && !matches!(e, ConsensusError::SystemHalted) {
                error!(error = %e, "Fatal invariant violation, halting for intervention");
                self.node_state = NodeState::HaltedAwaitingIntervention;
                metrics::set_node_halted(true);
            }
        }
        result
    }

    // =========================================================================
    // Epoch states
    // =========================================================================

    /// Last block before `epoch` on the chain ending at `tip`.
    fn dependent_root(&self, tip: &Hash, epoch: EpochNumber) -> Option<Hash> {
        if epoch == 0 {
            return Some(self.genesis);
        }
        self.fork_choice
            .ancestor_at_slot(tip, self.clock.epoch_start_slot(epoch) - 1)
    }

    /// Blocks at or after `from` on the chain ending at `tip`, oldest first.
    fn segment(&self, tip: &Hash, from: Slot) -> Vec<&Block> {
        let mut blocks = Vec::new();
        let mut cursor = self.blocks.get(tip);
        while let Some(block) = cursor {
            if block.slot() < from {
                break;
            }
            blocks.push(block);
            cursor = self.blocks.get(&block.parent());
        }
        blocks.reverse();
        blocks
    }

    /// State of `epoch` on the chain ending at `tip`, replaying the epochs
    /// in between from the nearest known state.
    fn epoch_state(&mut self, tip: &Hash, epoch: EpochNumber) -> ConsensusResult<Arc<EpochState>> {
        let mut roots = Vec::new();
        let mut current = epoch;
        let mut state = loop {
            let root = self
                .dependent_root(tip, current)
                .ok_or_else(|| ConsensusError::UnknownParent {
                    parent: short_hex(tip),
                })?;
            if let Some(state) = self.epoch_states.get(&(current, root)) {
                break Arc::clone(state);
            }
            // Below the anchor only the finalized chain is kept
            if current <= self.anchor.0 {
                return Err(ConsensusError::NoAssignment { epoch: current });
            }
            roots.push(root);
            current -= 1;
        };

        for root in roots.into_iter().rev() {
            let epoch = state.epoch;
            let start = self.clock.epoch_start_slot(epoch);
            let checkpoint = self
                .fork_choice
                .ancestor_at_slot(&root, start)
                .ok_or_else(|| ConsensusError::UnknownParent {
                    parent: short_hex(&root),
                })?;
            let next = {
                let segment = EpochSegment {
                    epoch,
                    checkpoint,
                    blocks: self
                        .segment(&root, start)
                        .into_iter()
                        .map(|block| SegmentBlock {
                            slot: block.slot(),
                            proposer: block.proposal.proposer,
                            body: &block.body,
                        })
                        .collect(),
                };
                state.advance(&segment, &self.config, &self.scorer)?
            };
            state = Arc::new(next);
            self.epoch_states
                .insert((state.epoch, root), Arc::clone(&state));
        }
        Ok(state)
    }

    /// Epoch state of `epoch` on the chain ending at `tip`, with the
    /// operations of that chain's `epoch` blocks applied.
    fn chain_view(&mut self, tip: &Hash, epoch: EpochNumber) -> ConsensusResult<ChainView> {
        let state = self.epoch_state(tip, epoch)?;
        let mut registry = state.registry.clone();
        let mut slashings = Vec::new();
        for block in self.segment(tip, self.clock.epoch_start_slot(epoch)) {
            slashings.extend(apply_block_operations(
                &mut registry,
                &block.body,
                epoch,
                &self.config,
            ));
        }
        Ok(ChainView {
            state,
            registry,
            slashings,
        })
    }

    /// Recompute the head and everything read from it.
    fn refresh_head(&mut self, effects: &mut Vec<Effect>) -> ConsensusResult<()> {
        let head = self.head()?;
        let head_slot = self.fork_choice.get_block(&head).map_or(0, |b| b.slot);
        let epoch = self.clock.epoch_of(self.current_slot.max(head_slot));
        let view = self.chain_view(&head, epoch)?;

        let from = epoch
            .saturating_sub(self.config.queue.retention_epochs)
            .max(self.anchor.0);
        for retained in from..epoch {
            let state = self.epoch_state(&head, retained)?;
            self.canonical.insert(retained, state);
        }
        self.canonical.insert(epoch, Arc::clone(&view.state));
        self.canonical.retain(|e, _| *e >= from && *e <= epoch);

        let mut records: Vec<SlashingRecord> = self
            .canonical
            .values()
            .flat_map(|state| state.slashings.iter().cloned())
            .collect();
        records.extend(view.slashings);
        for record in records {
            if !self.reported_slashings.insert(record.offender) {
                continue;
            }
            metrics::record_validator_slashed(record.kind.as_str());
            warn!(
                offender = %record.offender,
                offense = record.kind.as_str(),
                penalty = %record.penalty,
                burned = %record.burned,
                "Validator slashed"
            );
            effects.push(Effect::Slashed(record));
        }

        let registry = &view.registry;
        self.evidence.retain(|offender, _| {
            registry
                .get(offender)
                .is_some_and(|v| v.status != ValidatorStatus::Slashed)
        });
        self.operations.retain(|id, operation| match operation {
            Operation::Register(_) => !registry.contains(id),
            Operation::Exit(_) => registry
                .get(id)
                .is_some_and(|v| v.is_active() && v.exit_requested_epoch.is_none()),
        });

        if head != self.head {
            debug!(head = %short_hex(&head), slot = head_slot, "Head moved");
        }
        self.head = head;
        self.registry = view.registry;
        Ok(())
    }

    /// Emit an update for every head-chain epoch closed since the last one.
    fn report_closed_epochs(&mut self, effects: &mut Vec<Effect>) -> Vec<EpochNumber> {
        let mut reported = Vec::new();
        for state in self.canonical.values() {
            let Some(closed) = &state.closed else {
                continue;
            };
            if self.last_reported.is_some_and(|last| closed.epoch <= last) {
                continue;
            }
            self.last_reported = Some(closed.epoch);

            for id in &closed.deactivated {
                warn!(validator = %id, epoch = closed.epoch, "Validator marked inactive");
            }
            for (id, penalty) in &closed.penalties {
                debug!(validator = %id, penalty = %penalty, "Inactivity leak penalty");
            }
            info!(
                epoch = closed.epoch,
                supermajority = closed.supermajority,
                activated = state.activated.len(),
                exited = state.exited.len(),
                finalized = %self.checkpoints.latest_finalized(),
                "Epoch closed"
            );
            effects.push(Effect::EpochClosed(EpochUpdate {
                correlation_id: Uuid::new_v4(),
                epoch: closed.epoch,
                recorded: closed.recorded.clone(),
                scores: closed.scores.clone(),
                statuses: state.registry.iter().map(|v| (v.id, v.status)).collect(),
                registry_version: state.registry.version(),
            }));
            reported.push(closed.epoch);
        }
        reported
    }

    // =========================================================================
    // Slot boundary
    // =========================================================================

    /// Advance the clock to `slot`: refresh the head, report closed epochs,
    /// publish the next epoch's ticket.
    pub fn start_slot(
        &mut self,
        slot: Slot,
        effects: &mut Vec<Effect>,
    ) -> ConsensusResult<SlotReport> {
        self.ensure_running()?;
        let mut report = SlotReport {
            slot,
            ..SlotReport::default()
        };
        if self.last_slot.is_some_and(|last| slot <= last) {
            return Ok(report);
        }
        self.last_slot = Some(slot);
        self.current_slot = slot;
        self.expire_unresolved();

        let epoch = self.clock.epoch_of(slot);
        self.refresh_head(effects)?;
        self.admit_early_tickets(epoch + 1);
        report.epochs_closed = self.report_closed_epochs(effects);
        if self.publish_ticket(epoch + 1, effects) {
            report.tickets_published += 1;
        }
        self.prune(epoch)?;
        metrics::set_epochs_without_finality(
            epoch.saturating_sub(self.checkpoints.latest_finalized().epoch),
        );
        Ok(report)
    }

    fn publish_ticket(&mut self, epoch: EpochNumber, effects: &mut Vec<Effect>) -> bool {
        if self.published_ticket.is_some_and(|published| published >= epoch) {
            return false;
        }
        let (Some(keys), Some(id)) = (&self.local, self.local_id) else {
            return false;
        };
        let eligible = self
            .registry
            .get(&id)
            .is_some_and(|v| matches!(v.status, ValidatorStatus::Pending | ValidatorStatus::Active));
        let Some(seed) = self.canonical.get(&(epoch - 1)).map(|s| s.next_seed) else {
            return false;
        };
        if !eligible {
            return false;
        }

        let ticket = evaluate_ticket(&keys.vrf, id, epoch, &seed);
        self.published_ticket = Some(epoch);
        self.seen
            .insert((id, MessageKind::Ticket, epoch), ticket.output);
        self.tickets
            .entry(epoch)
            .or_default()
            .insert(id, ticket.clone());
        effects.push(Effect::Broadcast(NetworkMessage::Ticket(ticket)));
        true
    }

    fn admit_early_tickets(&mut self, epoch: EpochNumber) {
        let Some(seed) = self.canonical.get(&(epoch - 1)).map(|s| s.next_seed) else {
            return;
        };
        let (ready, later): (Vec<Ticket>, Vec<Ticket>) = std::mem::take(&mut self.early_tickets)
            .into_iter()
            .partition(|t| t.epoch == epoch);
        self.early_tickets = later;
        for ticket in ready {
            if let Err(e) = self.admit_ticket(ticket, &seed) {
                debug!(error = %e, "Dropping early ticket");
            }
        }
    }

    fn prune(&mut self, epoch: EpochNumber) -> ConsensusResult<()> {
        let min_epoch = epoch.saturating_sub(self.config.queue.retention_epochs);
        let min_slot = self.clock.epoch_start_slot(min_epoch);

        self.pool.prune(min_epoch);
        self.detector.prune(min_slot, min_epoch);
        self.seen.retain(|(_, kind, key), _| match kind {
            MessageKind::Ticket => *key >= min_epoch,
            _ => *key >= min_slot,
        });
        self.tickets = self.tickets.split_off(&(epoch + 1));
        self.early_tickets.retain(|t| t.epoch > epoch + 1);
        self.votes.retain(|(target, _), _| target.saturating_add(1) >= epoch);
        self.orphans.retain(|_, blocks| {
            blocks.retain(|b| b.slot() >= min_slot);
            !blocks.is_empty()
        });
        self.requested.retain(|hash| self.orphans.contains_key(hash));

        let finalized = self.checkpoints.latest_finalized();
        if finalized.epoch <= self.anchor.0 {
            return Ok(());
        }
        let Some(root) = self.dependent_root(&finalized.block_hash, finalized.epoch) else {
            return Ok(());
        };
        // Keeps the new anchor's state in the memo
        self.epoch_state(&finalized.block_hash, finalized.epoch)?;

        let checkpoints = self.checkpoints.prune();
        let blocks = self.fork_choice.prune(&root);
        self.blocks
            .retain(|hash, _| self.fork_choice.has_block(hash));
        self.epoch_states
            .retain(|(e, r), _| *e >= finalized.epoch && self.fork_choice.has_block(r));
        self.canonical.retain(|e, _| *e >= finalized.epoch);
        self.anchor = (finalized.epoch, root);
        if checkpoints > 0 || blocks > 0 {
            debug!(checkpoints, blocks, root = %finalized, "Pruned below finalized checkpoint");
        }
        Ok(())
    }

    // =========================================================================
    // Local duties
    // =========================================================================

    /// Parent to build on if this node proposes at `slot`.
    pub fn proposal_duty(&self, slot: Slot) -> ConsensusResult<Option<Hash>> {
        self.ensure_running()?;
        let Some(id) = self.local_id else {
            return Ok(None);
        };
        if slot == 0 || self.last_proposed.is_some_and(|s| s >= slot) {
            return Ok(None);
        }
        let Some(assignment) = self.assignment(self.clock.epoch_of(slot)) else {
            return Ok(None);
        };
        if assignment.proposer_for_slot(slot) != Some(id) {
            return Ok(None);
        }
        if self
            .registry
            .get(&id)
            .is_some_and(|v| v.status == ValidatorStatus::Slashed)
        {
            return Ok(None);
        }
        Ok(Some(self.head))
    }

    /// Build, sign and import the local block for `slot`.
    pub fn propose(
        &mut self,
        slot: Slot,
        parent: Hash,
        state_root: Hash,
        effects: &mut Vec<Effect>,
    ) -> ConsensusResult<Option<Hash>> {
        self.ensure_running()?;
        // Another call may have proposed while the lock was released
        if self.last_proposed.is_some_and(|s| s >= slot) || slot != self.current_slot {
            return Ok(None);
        }
        let Some(id) = self.local_id else {
            return Ok(None);
        };
        let view = self.chain_view(&parent, self.clock.epoch_of(slot))?;
        let body = self.build_body(&parent, slot, &view)?;
        let Some(keys) = &self.local else {
            return Ok(None);
        };
        let block = Block::sign(&keys.signing, id, slot, parent, state_root, body)?;
        self.last_proposed = Some(slot);

        let hash = block.hash();
        info!(
            slot,
            block = %short_hex(&hash),
            tickets = block.body.tickets.len(),
            attestations = block.body.attestations.len(),
            "Proposed block"
        );
        self.import_chain(block.clone(), effects)?;
        effects.push(Effect::Broadcast(NetworkMessage::Proposal(block)));
        Ok(Some(hash))
    }

    /// Tickets and votes already carried by the chain ending at `tip`,
    /// over `epoch` and the one before it.
    fn included(
        &self,
        tip: &Hash,
        epoch: EpochNumber,
    ) -> (HashSet<ValidatorId>, HashSet<(EpochNumber, ValidatorId)>) {
        let mut tickets = HashSet::new();
        let mut votes = HashSet::new();
        let epoch_start = self.clock.epoch_start_slot(epoch);
        let from = self.clock.epoch_start_slot(epoch.saturating_sub(1));
        for block in self.segment(tip, from) {
            if block.slot() >= epoch_start {
                tickets.extend(
                    block
                        .body
                        .tickets
                        .iter()
                        .filter(|t| t.epoch == epoch + 1)
                        .map(|t| t.validator),
                );
            }
            votes.extend(
                block
                    .body
                    .attestations
                    .iter()
                    .map(|a| (a.data.target.epoch, a.validator)),
            );
        }
        (tickets, votes)
    }

    /// Fill a body from the pools with what the parent chain still lacks.
    fn build_body(&mut self, parent: &Hash, slot: Slot, view: &ChainView) -> ConsensusResult<BlockBody> {
        let epoch = view.state.epoch;
        let (included_tickets, included_votes) = self.included(parent, epoch);

        let tickets = self
            .tickets
            .get(&(epoch + 1))
            .map(|pool| {
                pool.values()
                    .filter(|t| !included_tickets.contains(&t.validator))
                    .filter(|t| verify_ticket(&view.registry, t, &view.state.next_seed).is_ok())
                    .take(MAX_BODY_TICKETS)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let candidates: Vec<Attestation> = self
            .votes
            .iter()
            .filter(|((target, validator), a)| {
                *target >= 1
                    && *target <= epoch
                    && target.saturating_add(1) >= epoch
                    && a.data.slot < slot
                    && !included_votes.contains(&(*target, *validator))
            })
            .map(|(_, a)| a.clone())
            .collect();
        let mut attestations = Vec::new();
        for attestation in candidates {
            if attestations.len() >= MAX_BODY_ATTESTATIONS {
                break;
            }
            let target = attestation.data.target.epoch;
            let duties = if target == epoch {
                Arc::clone(&view.state)
            } else {
                self.epoch_state(parent, target)?
            };
            if duties.assignment.attestation_slot(&attestation.validator) == Some(attestation.data.slot) {
                attestations.push(attestation);
            }
        }

        let evidence = self
            .evidence
            .values()
            .filter(|m| {
                view.registry
                    .get(&m.evidence.offender())
                    .is_some_and(|v| v.status != ValidatorStatus::Slashed)
            })
            .filter(|m| m.evidence.verify(&view.registry).is_ok())
            .take(MAX_BODY_EVIDENCE)
            .cloned()
            .collect();

        let mut scratch = view.registry.clone();
        let min_stake = self.config.min_stake();
        let operations = self
            .operations
            .values()
            .filter(|op| apply_operation(&mut scratch, op, min_stake, epoch).is_ok())
            .take(MAX_BODY_OPERATIONS)
            .cloned()
            .collect();

        let relay = std::mem::take(&mut self.relay)
            .into_iter()
            .filter(|(validator, messages)| *messages > 0 && view.registry.contains(validator))
            .take(MAX_BODY_RELAY)
            .map(|(validator, messages)| RelayReport { validator, messages })
            .collect();

        Ok(BlockBody {
            tickets,
            attestations,
            evidence,
            operations,
            relay,
        })
    }

    /// Sign, apply and broadcast the local attestation if due at `slot`.
    pub fn attest(&mut self, slot: Slot, effects: &mut Vec<Effect>) -> ConsensusResult<bool> {
        self.ensure_running()?;
        let Some(id) = self.local_id else {
            return Ok(false);
        };
        let epoch = self.clock.epoch_of(slot);
        if epoch == 0 || self.last_attested.is_some_and(|s| s >= slot) {
            return Ok(false);
        }
        let due = self
            .assignment(epoch)
            .and_then(|a| a.attestation_slot(&id))
            == Some(slot);
        if !due || !self.registry.get(&id).is_some_and(Validator::is_active) {
            return Ok(false);
        }

        let Some(target_hash) = self
            .fork_choice
            .ancestor_at_slot(&self.head, self.clock.epoch_start_slot(epoch))
        else {
            return Ok(false);
        };
        let target = CheckpointRef::new(epoch, target_hash);
        let source = self.checkpoints.latest_justified();
        if source.epoch >= target.epoch {
            return Ok(false);
        }
        self.ensure_checkpoint(target)?;
        if !self.checkpoints.is_ancestor(&source, &target) {
            warn!(source = %source, target = %target, "Justified checkpoint is off the head chain");
            return Ok(false);
        }

        let Some(keys) = &self.local else {
            return Ok(false);
        };
        let attestation =
            Attestation::sign(id, AttestationData { slot, source, target }, &keys.attestation);
        self.last_attested = Some(slot);

        if self.detector.check_attestation(&attestation).is_some() {
            error!(slot, "Refusing to broadcast a conflicting attestation");
            return Ok(false);
        }
        self.seen.insert(
            (id, MessageKind::Attestation, slot),
            attestation.signing_root(),
        );
        self.include_attestation(attestation.clone(), effects)?;
        effects.push(Effect::Broadcast(NetworkMessage::Attestation(attestation)));
        Ok(true)
    }

    // =========================================================================
    // Inbound messages
    // =========================================================================

    pub fn handle_message(
        &mut self,
        message: NetworkMessage,
        peer: PeerId,
        effects: &mut Vec<Effect>,
    ) -> ConsensusResult<MessageOutcome> {
        self.ensure_running()?;
        let kind = message.kind();
        let result = match message {
            NetworkMessage::Proposal(block) => self.on_proposal(block, effects),
            NetworkMessage::Attestation(a) => self.on_attestation(a, effects),
            NetworkMessage::Evidence(e) => self.on_evidence(e),
            NetworkMessage::Ticket(t) => self.on_ticket(t),
            NetworkMessage::Operation(op) => self.on_operation(op),
            NetworkMessage::BlockRequest(hash) => Ok(self.on_block_request(&hash, effects)),
        };
        if let Err(e) = &result {
            self.note_rejection(kind, peer, e, effects);
        }
        self.guard(result)
    }

    /// Attestations received together, with one signature pass over all of
    /// them. Results are aligned with the input.
    pub fn handle_attestations(
        &mut self,
        batch: Vec<(Attestation, PeerId)>,
        effects: &mut Vec<Effect>,
    ) -> Vec<ConsensusResult<MessageOutcome>> {
        if self.ensure_running().is_err() {
            return batch
                .iter()
                .map(|_| Err(ConsensusError::SystemHalted))
                .collect();
        }

        let mut results: Vec<Option<ConsensusResult<MessageOutcome>>> = Vec::with_capacity(batch.len());
        let mut to_verify = Vec::new();
        let mut positions = Vec::new();
        for (i, (attestation, _)) in batch.iter().enumerate() {
            match self.precheck_attestation(attestation) {
                Ok(None) => {
                    results.push(None);
                    to_verify.push(attestation.clone());
                    positions.push(i);
                }
                Ok(Some(outcome)) => results.push(Some(Ok(outcome))),
                Err(e) => results.push(Some(Err(e))),
            }
        }

        let verified = verify_batch(&to_verify, &self.registry);
        for ((attestation, position), check) in to_verify.into_iter().zip(positions).zip(verified) {
            let result = match check {
                Ok(()) => self.accept_verified(attestation, effects),
                Err(e) => Err(e.into()),
            };
            results[position] = Some(result);
        }

        batch
            .into_iter()
            .zip(results)
            .map(|((_, peer), result)| {
                let result = result.unwrap_or_else(|| {
                    Err(ConsensusError::InvariantViolation(
                        "attestation batch result missing".into(),
                    ))
                });
                if let Err(e) = &result {
                    self.note_rejection(MessageKind::Attestation, peer, e, effects);
                }
                self.guard(result)
            })
            .collect()
    }

    fn note_rejection(
        &mut self,
        kind: MessageKind,
        peer: PeerId,
        error: &ConsensusError,
        effects: &mut Vec<Effect>,
    ) {
        if kind == MessageKind::Attestation {
            metrics::record_attestation_rejected(error.label());
        }
        if !error.is_signature_failure() {
            return;
        }
        metrics::record_message_dropped("invalid_signature");
        let count = self.peer_failures.entry(peer).or_insert(0);
        *count = count.saturating_add(1);
        if *count >= self.config.queue.peer_failure_threshold {
            let invalid_signatures = *count;
            self.peer_failures.remove(&peer);
            warn!(peer = %peer, invalid_signatures, "Reporting peer for invalid signatures");
            effects.push(Effect::ReportPeer(
                peer,
                PeerReport {
                    correlation_id: Uuid::new_v4(),
                    invalid_signatures,
                    last_error: error.to_string(),
                },
            ));
        }
    }

    fn seen(&self, key: &(ValidatorId, MessageKind, u64), digest: &Hash) -> Seen {
        match self.seen.get(key) {
            None => Seen::New,
            Some(existing) if existing == digest => Seen::Same,
            Some(_) => Seen::Different,
        }
    }

    fn check_window(&self, slot: Slot) -> ConsensusResult<()> {
        if slot < self.current_slot || slot > self.current_slot.saturating_add(1) {
            return Err(ConsensusError::OutsideWindow {
                slot,
                current: self.current_slot,
            });
        }
        Ok(())
    }

    fn on_proposal(&mut self, block: Block, effects: &mut Vec<Effect>) -> ConsensusResult<MessageOutcome> {
        if self.fork_choice.has_block(&block.hash()) {
            return Ok(MessageOutcome::Duplicate);
        }
        let slot = block.slot();
        if slot == 0 {
            return Err(ConsensusError::OutsideWindow {
                slot: 0,
                current: self.current_slot,
            });
        }
        if !self.requested.remove(&block.hash()) {
            self.check_window(slot)?;
        }
        if !block.is_consistent() {
            return Err(ConsensusError::BlockHashMismatch);
        }
        self.import_chain(block, effects)
    }

    /// Import `block`, then any buffered descendants it unblocks.
    fn import_chain(&mut self, block: Block, effects: &mut Vec<Effect>) -> ConsensusResult<MessageOutcome> {
        let hash = block.hash();
        let outcome = self.import(block, effects)?;
        if outcome != MessageOutcome::Accepted {
            return Ok(outcome);
        }
        let mut ready = vec![hash];
        while let Some(parent) = ready.pop() {
            for child in self.orphans.remove(&parent).unwrap_or_default() {
                let child_hash = child.hash();
                match self.import(child, effects) {
                    Ok(MessageOutcome::Accepted) => ready.push(child_hash),
                    Ok(_) => {}
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => debug!(block = %short_hex(&child_hash), error = %e, "Dropping buffered block"),
                }
            }
        }
        self.retry_unresolved(effects)?;
        self.refresh_head(effects)?;
        Ok(outcome)
    }

    fn import(&mut self, block: Block, effects: &mut Vec<Effect>) -> ConsensusResult<MessageOutcome> {
        let hash = block.hash();
        if self.fork_choice.has_block(&hash) {
            return Ok(MessageOutcome::Duplicate);
        }
        let parent = block.parent();
        if !self.fork_choice.has_block(&parent) {
            return self.buffer_orphan(block, effects);
        }

        let slot = block.slot();
        let proposer = block.proposal.proposer;
        let view = self.chain_view(&parent, self.clock.epoch_of(slot))?;
        let validator = view
            .registry
            .get(&proposer)
            .ok_or_else(|| ConsensusError::UnknownValidator {
                validator: proposer.to_string(),
            })?;
        block
            .proposal
            .verify(&validator.signing_key)
            .map_err(|_| ConsensusError::InvalidSignature {
                validator: proposer.to_string(),
            })?;
        if validator.status == ValidatorStatus::Slashed {
            return Err(ConsensusError::ProposerSlashed {
                validator: proposer.to_string(),
            });
        }
        view.state.assignment.verify_proposer(slot, &proposer)?;

        if let Some(evidence) = self.detector.check_proposal(&block.proposal) {
            return self.queue_detected(evidence, effects);
        }
        self.validate_body(&block, &view)?;

        self.fork_choice.add_block(BlockNode {
            hash,
            parent,
            slot,
            proposer: Some(proposer),
        })?;
        self.seen.insert((proposer, MessageKind::Proposal, slot), hash);
        let attestations = block.body.attestations.clone();
        self.blocks.insert(hash, block);
        debug!(
            slot,
            block = %short_hex(&hash),
            proposer = %proposer,
            attestations = attestations.len(),
            "Imported block"
        );

        for attestation in attestations {
            if let Err(e) = self.absorb(attestation, effects) {
                if e.is_fatal() {
                    return Err(e);
                }
                debug!(error = %e, "Skipping included attestation");
            }
        }
        Ok(MessageOutcome::Accepted)
    }

    /// Body rules: tickets for the next epoch, votes from duty holders of
    /// this or the previous epoch, verifiable evidence and operations.
    fn validate_body(&mut self, block: &Block, view: &ChainView) -> ConsensusResult<()> {
        let body = &block.body;
        let slot = block.slot();
        let epoch = view.state.epoch;
        if body.tickets.len() > MAX_BODY_TICKETS
            || body.attestations.len() > MAX_BODY_ATTESTATIONS
            || body.evidence.len() > MAX_BODY_EVIDENCE
            || body.operations.len() > MAX_BODY_OPERATIONS
            || body.relay.len() > MAX_BODY_RELAY
        {
            return Err(invalid_body("too many entries"));
        }

        for ticket in &body.tickets {
            if ticket.epoch != epoch + 1 {
                return Err(invalid_body(format!(
                    "ticket for epoch {} in epoch {epoch}",
                    ticket.epoch
                )));
            }
            verify_ticket(&view.registry, ticket, &view.state.next_seed)?;
        }

        for attestation in &body.attestations {
            let data = &attestation.data;
            let target = data.target.epoch;
            if target == 0 || target > epoch || target.saturating_add(1) < epoch {
                return Err(invalid_body(format!("vote for epoch {target} in epoch {epoch}")));
            }
            if data.source.epoch >= target || data.slot >= slot {
                return Err(invalid_body(format!("vote at slot {} in slot {slot}", data.slot)));
            }
            let duties = if target == epoch {
                Arc::clone(&view.state)
            } else {
                self.epoch_state(&block.parent(), target)?
            };
            match duties.assignment.attestation_slot(&attestation.validator) {
                None => return Err(AggregationError::NoDuty(attestation.validator).into()),
                Some(assigned) if assigned != data.slot => {
                    return Err(AggregationError::WrongSlot {
                        slot: data.slot,
                        assigned,
                    }
                    .into())
                }
                Some(_) => {}
            }
        }
        for check in verify_batch(&body.attestations, &view.registry) {
            check?;
        }

        for message in &body.evidence {
            message.evidence.verify(&view.registry)?;
        }
        let mut scratch = view.registry.clone();
        for operation in &body.operations {
            apply_operation(&mut scratch, operation, self.config.min_stake(), epoch)?;
        }
        if let Some(report) = body.relay.iter().find(|r| !view.registry.contains(&r.validator)) {
            return Err(RegistryError::UnknownValidator(report.validator).into());
        }
        Ok(())
    }

    fn buffer_orphan(&mut self, block: Block, effects: &mut Vec<Effect>) -> ConsensusResult<MessageOutcome> {
        let proposer = block.proposal.proposer;
        let validator = self
            .registry
            .get(&proposer)
            .ok_or_else(|| ConsensusError::UnknownValidator {
                validator: proposer.to_string(),
            })?;
        block
            .proposal
            .verify(&validator.signing_key)
            .map_err(|_| ConsensusError::InvalidSignature {
                validator: proposer.to_string(),
            })?;
        if self.orphan_len() >= self.config.queue.max_unresolved {
            metrics::record_message_dropped("orphans_full");
            return Ok(MessageOutcome::Ignored("orphan buffer full"));
        }

        let parent = block.parent();
        let siblings = self.orphans.entry(parent).or_default();
        if siblings.iter().any(|b| b.hash() == block.hash()) {
            return Ok(MessageOutcome::Duplicate);
        }
        siblings.push(block);
        if self.requested.insert(parent) {
            debug!(parent = %short_hex(&parent), "Requesting unknown parent block");
            effects.push(Effect::Broadcast(NetworkMessage::BlockRequest(parent)));
        }
        Ok(MessageOutcome::Buffered)
    }

    fn on_block_request(&self, hash: &Hash, effects: &mut Vec<Effect>) -> MessageOutcome {
        match self.blocks.get(hash) {
            Some(block) => {
                effects.push(Effect::Broadcast(NetworkMessage::Proposal(block.clone())));
                MessageOutcome::Accepted
            }
            None => MessageOutcome::Ignored("unknown block"),
        }
    }

    fn on_attestation(
        &mut self,
        attestation: Attestation,
        effects: &mut Vec<Effect>,
    ) -> ConsensusResult<MessageOutcome> {
        if let Some(outcome) = self.precheck_attestation(&attestation)? {
            return Ok(outcome);
        }
        attestation.verify(&self.registry)?;
        self.accept_verified(attestation, effects)
    }

    /// Dedup, window and link shape. `Some` short-circuits.
    fn precheck_attestation(
        &self,
        attestation: &Attestation,
    ) -> ConsensusResult<Option<MessageOutcome>> {
        let data = attestation.data;
        let key = (attestation.validator, MessageKind::Attestation, data.slot);
        if let Seen::Same = self.seen(&key, &data.signing_root()) {
            return Ok(Some(MessageOutcome::Duplicate));
        }

        let oldest = self
            .current_slot
            .saturating_sub(self.config.retention_slots());
        if data.slot > self.current_slot.saturating_add(1) || data.slot < oldest {
            return Err(ConsensusError::OutsideWindow {
                slot: data.slot,
                current: self.current_slot,
            });
        }

        let epoch = self.clock.epoch_of(data.slot);
        if data.target.epoch != epoch || data.source.epoch >= data.target.epoch {
            return Err(FinalityError::InvalidLink {
                from: data.source,
                to: data.target,
            }
            .into());
        }
        Ok(None)
    }

    /// Apply an attestation whose signature has been checked.
    fn accept_verified(
        &mut self,
        attestation: Attestation,
        effects: &mut Vec<Effect>,
    ) -> ConsensusResult<MessageOutcome> {
        let key = (
            attestation.validator,
            MessageKind::Attestation,
            attestation.data.slot,
        );
        let digest = attestation.signing_root();
        if let Seen::Same = self.seen(&key, &digest) {
            return Ok(MessageOutcome::Duplicate);
        }
        if let Some(evidence) = self.detector.check_attestation(&attestation) {
            return self.queue_detected(evidence, effects);
        }
        self.seen.entry(key).or_insert(digest);

        match self.resolve(&attestation.data)? {
            Resolution::Ready => self.include_attestation(attestation, effects),
            Resolution::Pending => Ok(self.buffer(attestation)),
        }
    }

    /// Feed a vote carried by an imported block to fork choice and finality.
    ///
    /// The block's validation already covered signature and duty.
    fn absorb(&mut self, attestation: Attestation, effects: &mut Vec<Effect>) -> ConsensusResult<()> {
        let key = (
            attestation.validator,
            MessageKind::Attestation,
            attestation.data.slot,
        );
        let digest = attestation.signing_root();
        if let Seen::Same = self.seen(&key, &digest) {
            return Ok(());
        }
        if let Some(evidence) = self.detector.check_attestation(&attestation) {
            self.queue_detected(evidence, effects)?;
            return Ok(());
        }
        self.seen.entry(key).or_insert(digest);
        match self.resolve(&attestation.data)? {
            Resolution::Ready => self.include_attestation(attestation, effects).map(|_| ()),
            Resolution::Pending => {
                self.buffer(attestation);
                Ok(())
            }
        }
    }

    /// Check that the attestation's checkpoints are known, creating the
    /// target checkpoint when its block is.
    fn resolve(&mut self, data: &AttestationData) -> ConsensusResult<Resolution> {
        let Some(target_block) = self.fork_choice.get_block(&data.target.block_hash) else {
            return Ok(Resolution::Pending);
        };
        if target_block.slot > self.clock.epoch_start_slot(data.target.epoch) {
            return Err(FinalityError::UnknownCheckpoint(data.target).into());
        }
        if !self.checkpoints.contains(&data.source) {
            if !self.fork_choice.has_block(&data.source.block_hash) {
                return Ok(Resolution::Pending);
            }
            self.ensure_checkpoint(data.source)?;
        }
        self.ensure_checkpoint(data.target)?;
        if !self.checkpoints.is_ancestor(&data.source, &data.target) {
            return Err(FinalityError::InvalidLink {
                from: data.source,
                to: data.target,
            }
            .into());
        }
        Ok(Resolution::Ready)
    }

    /// Insert `checkpoint` and any missing ancestors down to a known one.
    ///
    /// The parent of the epoch-`e` checkpoint on a chain is that chain's
    /// block at the start of epoch `e - 1`.
    fn ensure_checkpoint(&mut self, checkpoint: CheckpointRef) -> ConsensusResult<()> {
        let finalized_epoch = self.checkpoints.latest_finalized().epoch;
        let mut missing = Vec::new();
        let mut current = checkpoint;
        while !self.checkpoints.contains(&current) {
            if current.epoch <= finalized_epoch {
                return Err(FinalityError::UnknownParent(current).into());
            }
            missing.push(current);
            let parent_epoch = current.epoch - 1;
            let parent_hash = self
                .fork_choice
                .ancestor_at_slot(&current.block_hash, self.clock.epoch_start_slot(parent_epoch))
                .ok_or(FinalityError::UnknownParent(current))?;
            current = CheckpointRef::new(parent_epoch, parent_hash);
        }
        let mut parent = current;
        for id in missing.into_iter().rev() {
            self.checkpoints.insert(id, parent)?;
            parent = id;
        }
        Ok(())
    }

    /// Pool a resolved vote from a duty holder of the target's chain and
    /// re-count its link.
    fn include_attestation(
        &mut self,
        attestation: Attestation,
        effects: &mut Vec<Effect>,
    ) -> ConsensusResult<MessageOutcome> {
        let data = attestation.data;
        let state = self.epoch_state(&data.target.block_hash, data.target.epoch)?;
        match state.assignment.attestation_slot(&attestation.validator) {
            None => return Err(AggregationError::NoDuty(attestation.validator).into()),
            Some(assigned) if assigned != data.slot => {
                return Err(AggregationError::WrongSlot {
                    slot: data.slot,
                    assigned,
                }
                .into())
            }
            Some(_) => {}
        }
        if self.pool.insert(&attestation, &state.assignment)? == InsertOutcome::Duplicate {
            return Ok(MessageOutcome::Duplicate);
        }
        metrics::record_attestation_accepted();

        self.fork_choice
            .on_attestation(attestation.validator, data.slot, data.target.block_hash);
        self.votes
            .entry((data.target.epoch, attestation.validator))
            .or_insert(attestation);
        self.evaluate_link(data.source, data.target, effects)?;
        Ok(MessageOutcome::Accepted)
    }

    /// Re-count the stake behind `source → target` and apply the result.
    ///
    /// Both sides of the ratio come from the target chain's epoch state.
    fn evaluate_link(
        &mut self,
        source: CheckpointRef,
        target: CheckpointRef,
        effects: &mut Vec<Effect>,
    ) -> ConsensusResult<()> {
        let state = self.epoch_state(&target.block_hash, target.epoch)?;
        let total = state.registry.total_active_stake();
        let attested = self.pool.link_stake(&source, &target, &state.registry);
        let previous_finalized = self.checkpoints.latest_finalized();
        let outcome = self
            .checkpoints
            .process_link(&source, &target, attested, total)?;

        if let Some(finalized) = outcome.finalized {
            if finalized.epoch > previous_finalized.epoch {
                metrics::record_checkpoint_finalized();
                info!(checkpoint = %finalized, attested = %attested, total = %total, "Checkpoint finalized");
                effects.push(Effect::Finalized(FinalizedCheckpointRecord {
                    correlation_id: Uuid::new_v4(),
                    checkpoint: finalized,
                    attested_stake: attested,
                    total_active_stake: total,
                    observed_at_slot: self.current_slot,
                }));
            }
        }
        if let Some(justified) = outcome.justified {
            metrics::record_checkpoint_justified();
            info!(checkpoint = %justified, attested = %attested, total = %total, "Checkpoint justified");
            let latest = self.checkpoints.latest_justified();
            self.justified_state = self.epoch_state(&latest.block_hash, latest.epoch)?;
            // Votes from the new justified checkpoint may already be pooled
            for next in self.pool.targets_from(&justified) {
                self.evaluate_link(justified, next, effects)?;
            }
        }
        Ok(())
    }

    fn buffer(&mut self, attestation: Attestation) -> MessageOutcome {
        if self.unresolved.len() >= self.config.queue.max_unresolved {
            metrics::record_message_dropped("unresolved_full");
            return MessageOutcome::Ignored("unresolved buffer full");
        }
        self.unresolved.push_back(Unresolved {
            attestation,
            received_slot: self.current_slot,
        });
        MessageOutcome::Buffered
    }

    fn expire_unresolved(&mut self) {
        let timeout = self.config.queue.unresolved_timeout_slots;
        let current = self.current_slot;
        let before = self.unresolved.len();
        self.unresolved
            .retain(|u| u.received_slot.saturating_add(timeout) >= current);
        let expired = before - self.unresolved.len();
        if expired > 0 {
            debug!(expired, "Discarded unresolved attestations");
        }
    }

    fn retry_unresolved(&mut self, effects: &mut Vec<Effect>) -> ConsensusResult<()> {
        if self.unresolved.is_empty() {
            return Ok(());
        }
        for entry in std::mem::take(&mut self.unresolved) {
            let outcome = match self.resolve(&entry.attestation.data) {
                Ok(Resolution::Pending) => {
                    self.unresolved.push_back(entry);
                    continue;
                }
                Ok(Resolution::Ready) => self.include_attestation(entry.attestation, effects),
                Err(e) => Err(e),
            };
            if let Err(e) = outcome {
                if e.is_fatal() {
                    return Err(e);
                }
                debug!(error = %e, "Dropping unresolved attestation");
            }
        }
        Ok(())
    }

    fn on_ticket(&mut self, ticket: Ticket) -> ConsensusResult<MessageOutcome> {
        let key = (ticket.validator, MessageKind::Ticket, ticket.epoch);
        if let Seen::Same = self.seen(&key, &ticket.output) {
            return Ok(MessageOutcome::Duplicate);
        }
        let current = self.clock.epoch_of(self.current_slot);
        if ticket.epoch <= current {
            return Ok(MessageOutcome::Ignored("ticket for a sealed epoch"));
        }
        if ticket.epoch > current + 1 {
            if ticket.epoch > current + 2 || self.early_tickets.len() >= self.config.queue.max_unresolved {
                return Ok(MessageOutcome::Ignored("ticket too far ahead"));
            }
            self.early_tickets.push(ticket);
            return Ok(MessageOutcome::Buffered);
        }
        let seed = self
            .canonical
            .get(&current)
            .map(|state| state.next_seed)
            .ok_or(ConsensusError::NoAssignment { epoch: current })?;
        self.admit_ticket(ticket, &seed)
    }

    fn admit_ticket(&mut self, ticket: Ticket, seed: &Hash) -> ConsensusResult<MessageOutcome> {
        let key = (ticket.validator, MessageKind::Ticket, ticket.epoch);
        verify_ticket(&self.registry, &ticket, seed)?;
        if self.seen.insert(key, ticket.output).is_some() {
            return Ok(MessageOutcome::Duplicate);
        }
        self.tickets
            .entry(ticket.epoch)
            .or_default()
            .insert(ticket.validator, ticket);
        Ok(MessageOutcome::Accepted)
    }

    // =========================================================================
    // Evidence and registry operations
    // =========================================================================

    fn on_evidence(&mut self, message: EvidenceMessage) -> ConsensusResult<MessageOutcome> {
        if self.queue_evidence(message.evidence, message.reporter)? {
            Ok(MessageOutcome::Accepted)
        } else {
            Ok(MessageOutcome::Duplicate)
        }
    }

    /// Verify evidence against the head registry and queue it for the next
    /// local block. Returns whether it was new.
    pub fn queue_evidence(
        &mut self,
        evidence: SlashingEvidence,
        reporter: Option<ValidatorId>,
    ) -> ConsensusResult<bool> {
        self.ensure_running()?;
        let offender = evidence.verify(&self.registry)?;
        let slashed = self
            .registry
            .get(&offender)
            .is_some_and(|v| v.status == ValidatorStatus::Slashed);
        if slashed || self.evidence.contains_key(&offender) {
            return Ok(false);
        }
        info!(
            offender = %offender,
            offense = evidence.kind().as_str(),
            "Evidence queued for inclusion"
        );
        self.evidence
            .insert(offender, EvidenceMessage { evidence, reporter });
        Ok(true)
    }

    /// Queue locally detected evidence and gossip it.
    fn queue_detected(
        &mut self,
        evidence: SlashingEvidence,
        effects: &mut Vec<Effect>,
    ) -> ConsensusResult<MessageOutcome> {
        let offender = evidence.offender();
        if self.queue_evidence(evidence.clone(), None)? {
            warn!(offender = %offender, offense = evidence.kind().as_str(), "Equivocation detected");
            effects.push(Effect::Broadcast(NetworkMessage::Evidence(EvidenceMessage {
                evidence,
                reporter: None,
            })));
        }
        Ok(MessageOutcome::Slashed(offender))
    }

    fn on_operation(&mut self, operation: Operation) -> ConsensusResult<MessageOutcome> {
        if self.queue_operation(operation)? {
            Ok(MessageOutcome::Accepted)
        } else {
            Ok(MessageOutcome::Duplicate)
        }
    }

    /// Check an operation against the head registry and queue it for
    /// inclusion. Returns whether it was new.
    fn queue_operation(&mut self, operation: Operation) -> ConsensusResult<bool> {
        let id = operation.validator();
        if self.operations.contains_key(&id) {
            return Ok(false);
        }
        let epoch = self.clock.epoch_of(self.current_slot);
        let mut scratch = self.registry.clone();
        apply_operation(&mut scratch, &operation, self.config.min_stake(), epoch)?;
        self.operations.insert(id, operation);
        Ok(true)
    }

    /// Queue and gossip a registration; it takes effect once a block
    /// carries it.
    pub fn register_validator(
        &mut self,
        registration: Registration,
        effects: &mut Vec<Effect>,
    ) -> ConsensusResult<ValidatorId> {
        self.ensure_running()?;
        let operation = Operation::Register(registration);
        let id = operation.validator();
        if self.queue_operation(operation.clone())? {
            info!(validator = %id, "Registration queued for inclusion");
            effects.push(Effect::Broadcast(NetworkMessage::Operation(operation)));
        }
        Ok(id)
    }

    /// Sign, queue and gossip this node's exit.
    pub fn request_exit(
        &mut self,
        validator: ValidatorId,
        effects: &mut Vec<Effect>,
    ) -> ConsensusResult<()> {
        self.ensure_running()?;
        let (Some(keys), Some(id)) = (&self.local, self.local_id) else {
            return Err(ConsensusError::NotLocalValidator);
        };
        if validator != id {
            return Err(ConsensusError::NotLocalValidator);
        }
        let epoch = self.clock.epoch_of(self.current_slot);
        let operation = Operation::Exit(SignedExit::sign(&keys.signing, id, epoch));
        if self.queue_operation(operation.clone())? {
            info!(validator = %id, epoch, "Exit queued for inclusion");
            effects.push(Effect::Broadcast(NetworkMessage::Operation(operation)));
        }
        Ok(())
    }

    /// Credit relay work; carried in this node's next block.
    pub fn record_relay(&mut self, validator: ValidatorId, messages: u64) -> ConsensusResult<()> {
        self.ensure_running()?;
        if !self.registry.contains(&validator) {
            return Err(RegistryError::UnknownValidator(validator).into());
        }
        let count = self.relay.entry(validator).or_default();
        *count = count.saturating_add(messages);
        Ok(())
    }
}
