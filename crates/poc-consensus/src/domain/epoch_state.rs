//! # Chain-Anchored Epoch State
//!
//! What one chain has agreed on at the start of an epoch: the validator
//! registry, the score ledger, the inactivity tracker, the epoch's duty
//! assignment and the seed of the next epoch.
//!
//! The state of epoch `e + 1` is a pure function of the state of epoch `e`
//! and the blocks of epoch `e` on the same chain. Gossip only decides what
//! proposers put into blocks; two nodes holding the same blocks derive the
//! same committees, scores and statuses whatever else they did or did not
//! receive.
//!
//! `S(e) + blocks(e) → S(e + 1)`:
//!
//! 1. Apply the evidence, registrations and exits carried by `blocks(e)`
//! 2. Record the votes `blocks(e)` include, for epochs `e - 1` and `e`
//! 3. Close epoch `e - 1`: participation, inactivity leak, scores
//! 4. Activate pending validators and process exits for `e + 1`
//! 5. Build the `e + 1` assignment from the tickets `blocks(e)` include
//! 6. Derive the seed of `e + 2`
//!
//! Votes for epoch `c` can be included during `c` and `c + 1`, so epoch `c`
//! closes at the `c + 1 → c + 2` transition.

use crate::config::ConsensusConfig;
use crate::domain::attestation::AttestationData;
use crate::domain::checkpoint::is_supermajority;
use crate::domain::inactivity::InactivityLeakTracker;
use crate::domain::messages::{BlockBody, Operation};
use crate::domain::score::{ContributionScorer, EpochScores, EpochTallies, RecordedEpoch, ScoreLedger};
use crate::domain::selection::{derive_epoch_seed, EpochAssignment, SelectionError, Ticket};
use crate::domain::slashing::{apply_slashing, SlashingRecord};
use crate::domain::validator::{ValidatorId, ValidatorRegistry};
use shared_types::{EpochNumber, Hash, Slot, U256};
use std::collections::{BTreeMap, BTreeSet};

/// One block of an epoch segment.
#[derive(Clone, Copy, Debug)]
pub struct SegmentBlock<'a> {
    pub slot: Slot,
    pub proposer: ValidatorId,
    pub body: &'a BlockBody,
}

/// The blocks of one epoch on one chain, oldest first.
#[derive(Clone, Debug)]
pub struct EpochSegment<'a> {
    pub epoch: EpochNumber,
    /// The chain's checkpoint block for `epoch`
    pub checkpoint: Hash,
    pub blocks: Vec<SegmentBlock<'a>>,
}

/// A vote as the chain included it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IncludedVote {
    /// Included no later than one slot after its own slot
    pub timely: bool,
    /// Targets the including chain's checkpoint
    pub correct: bool,
}

/// An epoch whose votes may still be included.
#[derive(Clone, Debug, PartialEq, Eq)]
struct PendingEpoch {
    epoch: EpochNumber,
    checkpoint: Hash,
    duties: BTreeSet<ValidatorId>,
    votes: BTreeMap<ValidatorId, IncludedVote>,
    /// Production and relay credit earned by the epoch's blocks
    tallies: EpochTallies,
}

impl PendingEpoch {
    fn record_vote(&mut self, validator: ValidatorId, data: &AttestationData, inclusion_slot: Slot) {
        if !self.duties.contains(&validator) {
            return;
        }
        self.votes.entry(validator).or_insert(IncludedVote {
            timely: inclusion_slot <= data.slot.saturating_add(1),
            correct: data.target.block_hash == self.checkpoint,
        });
    }
}

/// Outcome of closing an epoch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClosedEpoch {
    pub epoch: EpochNumber,
    pub recorded: RecordedEpoch,
    pub scores: EpochScores,
    /// Duty holders whose included, correct votes carried 2/3 of active stake
    pub supermajority: bool,
    pub finality_lag: u64,
    /// Validators that crossed the missed-epoch limit
    pub deactivated: Vec<ValidatorId>,
    pub penalties: Vec<(ValidatorId, U256)>,
}

/// Consensus state of one chain at the start of `epoch`.
#[derive(Clone, Debug)]
pub struct EpochState {
    pub epoch: EpochNumber,
    pub registry: ValidatorRegistry,
    pub ledger: ScoreLedger,
    pub inactivity: InactivityLeakTracker,
    pub seed: Hash,
    /// Seed of `epoch + 1`; tickets for that epoch are evaluated over it
    pub next_seed: Hash,
    pub assignment: EpochAssignment,
    /// Epoch `epoch - 1`, closed during the next transition
    open: Option<PendingEpoch>,
    last_supermajority: EpochNumber,
    /// Epoch `epoch - 2`, closed by the transition into this state
    pub closed: Option<ClosedEpoch>,
    /// Slashings applied from the previous epoch's blocks
    pub slashings: Vec<SlashingRecord>,
    pub activated: Vec<ValidatorId>,
    pub exited: Vec<ValidatorId>,
}

/// Apply the registry changes one block carries.
///
/// Blocks are validated on import, so anything that no longer applies
/// (a second exit, evidence against an already Slashed validator) is
/// skipped.
pub fn apply_block_operations(
    registry: &mut ValidatorRegistry,
    body: &BlockBody,
    epoch: EpochNumber,
    config: &ConsensusConfig,
) -> Vec<SlashingRecord> {
    let mut records = Vec::new();
    for message in &body.evidence {
        if let Ok(Some(record)) = apply_slashing(
            registry,
            &message.evidence,
            message.reporter,
            &config.slashing,
            epoch,
        ) {
            records.push(record);
        }
    }
    for operation in &body.operations {
        let _ = match operation {
            Operation::Register(registration) => registry
                .register(registration.clone(), config.min_stake(), epoch)
                .map(|_| ()),
            Operation::Exit(exit) => registry.request_exit(&exit.validator, epoch),
        };
    }
    records
}

impl EpochState {
    /// State of epoch 0. Its committee comes from public fallback outputs.
    pub fn genesis(
        mut registry: ValidatorRegistry,
        config: &ConsensusConfig,
    ) -> Result<Self, SelectionError> {
        registry.set_stake_cap(config.max_effective_stake());
        let seed = config.genesis_seed;
        let assignment = EpochAssignment::build(
            &registry,
            &BTreeMap::new(),
            0,
            seed,
            0,
            config.epoch_length,
            config.committee.size,
        )?;
        let next_seed = derive_epoch_seed(&seed, assignment.outputs(), 1);
        Ok(Self {
            epoch: 0,
            inactivity: InactivityLeakTracker::new(
                config.lifecycle.leak_threshold_epochs,
                config.lifecycle.leak_penalty_bps,
            ),
            registry,
            ledger: ScoreLedger::default(),
            seed,
            next_seed,
            assignment,
            open: None,
            last_supermajority: 0,
            closed: None,
            slashings: Vec::new(),
            activated: Vec::new(),
            exited: Vec::new(),
        })
    }

    /// Epoch whose votes are still open for inclusion.
    pub fn open_epoch(&self) -> Option<EpochNumber> {
        self.open.as_ref().map(|p| p.epoch)
    }

    /// Last epoch whose included votes reached a supermajority.
    pub fn last_supermajority(&self) -> EpochNumber {
        self.last_supermajority
    }

    /// Transition to the next epoch over this epoch's blocks.
    ///
    /// Tickets must already be verified against `next_seed`; block import
    /// does that.
    pub fn advance(
        &self,
        segment: &EpochSegment<'_>,
        config: &ConsensusConfig,
        scorer: &ContributionScorer,
    ) -> Result<Self, SelectionError> {
        let epoch = self.epoch;
        let mut registry = self.registry.clone();
        let mut slashings = Vec::new();
        for block in &segment.blocks {
            slashings.extend(apply_block_operations(&mut registry, block.body, epoch, config));
        }

        let mut current = PendingEpoch {
            epoch,
            checkpoint: segment.checkpoint,
            duties: if epoch == 0 {
                BTreeSet::new()
            } else {
                self.assignment.duties()
            },
            votes: BTreeMap::new(),
            tallies: EpochTallies::new(),
        };
        let mut previous = self.open.clone();
        let mut tickets: BTreeMap<ValidatorId, Ticket> = BTreeMap::new();
        for block in &segment.blocks {
            current.tallies.record_proposal(block.proposer, &config.points);
            for report in &block.body.relay {
                current
                    .tallies
                    .record_relay(report.validator, report.messages, &config.points);
            }
            for attestation in &block.body.attestations {
                let data = &attestation.data;
                let pending = if data.target.epoch == epoch {
                    Some(&mut current)
                } else {
                    previous.as_mut().filter(|p| p.epoch == data.target.epoch)
                };
                if let Some(pending) = pending {
                    pending.record_vote(attestation.validator, data, block.slot);
                }
            }
            for ticket in block.body.tickets.iter().filter(|t| t.epoch == epoch + 1) {
                tickets
                    .entry(ticket.validator)
                    .or_insert_with(|| ticket.clone());
            }
        }

        let mut ledger = self.ledger.clone();
        let mut inactivity = self.inactivity.clone();
        let mut last_supermajority = self.last_supermajority;
        let closed = previous.map(|pending| {
            close_epoch(
                pending,
                &mut registry,
                &mut ledger,
                &mut inactivity,
                &mut last_supermajority,
                config,
                scorer,
            )
        });

        let next = epoch + 1;
        let activated = registry.activate_pending(next);
        let exited = registry.process_exits(next, config.lifecycle.unbonding_delay_epochs);

        let assignment = EpochAssignment::build(
            &registry,
            &tickets,
            next,
            self.next_seed,
            next.saturating_mul(config.epoch_length),
            config.epoch_length,
            config.committee.size,
        )?;
        let next_seed = derive_epoch_seed(&self.next_seed, assignment.outputs(), next + 1);

        Ok(Self {
            epoch: next,
            registry,
            ledger,
            inactivity,
            seed: self.next_seed,
            next_seed,
            assignment,
            open: Some(current),
            last_supermajority,
            closed,
            slashings,
            activated,
            exited,
        })
    }
}

fn close_epoch(
    pending: PendingEpoch,
    registry: &mut ValidatorRegistry,
    ledger: &mut ScoreLedger,
    inactivity: &mut InactivityLeakTracker,
    last_supermajority: &mut EpochNumber,
    config: &ConsensusConfig,
    scorer: &ContributionScorer,
) -> ClosedEpoch {
    let epoch = pending.epoch;
    let voters: BTreeSet<ValidatorId> = pending.votes.keys().copied().collect();
    let mut supermajority = false;
    let mut deactivated = Vec::new();
    let mut penalties = Vec::new();

    if !pending.duties.is_empty() {
        let total = registry.total_active_stake();
        let correct = pending
            .votes
            .iter()
            .filter(|(_, vote)| vote.correct)
            .fold(U256::zero(), |acc, (id, _)| {
                acc.saturating_add(registry.voting_stake(id))
            });
        supermajority = is_supermajority(correct, total);
        if supermajority {
            *last_supermajority = epoch;
        }

        deactivated = registry.record_participation(
            &pending.duties,
            &voters,
            epoch,
            config.lifecycle.max_missed_epochs,
        );
        inactivity.update_finality_lag(epoch.saturating_sub(*last_supermajority), epoch);
        for id in &pending.duties {
            inactivity.record_participation(*id, voters.contains(id));
        }
        penalties = inactivity.apply_penalties(registry);
    }

    let mut tallies = pending.tallies;
    for (id, vote) in &pending.votes {
        tallies.record_attestation(*id, vote.timely, vote.correct, &config.points);
    }
    let boundary_block = epoch.saturating_add(1).saturating_mul(config.epoch_length);
    let (next_ledger, scores) =
        scorer.recompute_epoch(ledger, registry, &tallies, epoch, boundary_block);
    *ledger = next_ledger;
    for (id, score) in &scores {
        registry.set_score(id, *score);
    }

    ClosedEpoch {
        epoch,
        recorded: RecordedEpoch {
            boundary_block,
            tallies,
        },
        scores,
        supermajority,
        finality_lag: epoch.saturating_sub(*last_supermajority),
        deactivated,
        penalties,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommitteeConfig;
    use crate::domain::attestation::{Attestation, CheckpointRef};
    use crate::domain::keys::ValidatorKeys;
    use crate::domain::messages::{EvidenceMessage, RelayReport, SignedExit};
    use crate::domain::selection::evaluate_ticket;
    use crate::domain::slashing::SlashingEvidence;
    use crate::domain::validator::tests::registry_with;
    use crate::domain::validator::ValidatorStatus;

    const L: u64 = 4;

    fn checkpoint(epoch: EpochNumber) -> Hash {
        [epoch as u8 + 1; 32]
    }

    /// One block per epoch at slot `e * L + 2`, carrying every ticket for
    /// the next epoch and the chosen votes for the previous one.
    struct Chain {
        config: ConsensusConfig,
        scorer: ContributionScorer,
        keys: Vec<ValidatorKeys>,
        state: EpochState,
        previous: Option<EpochState>,
    }

    impl Chain {
        fn new(count: usize) -> Self {
            let config = ConsensusConfig {
                epoch_length: L,
                committee: CommitteeConfig { size: 2 },
                ..ConsensusConfig::default()
            };
            let (registry, keys) = registry_with(&vec![1000u64; count]);
            Self {
                scorer: ContributionScorer::new(&config),
                state: EpochState::genesis(registry, &config).unwrap(),
                previous: None,
                config,
                keys,
            }
        }

        fn id(&self, index: usize) -> ValidatorId {
            self.keys[index].id()
        }

        fn vote(&self, index: usize, target: Hash) -> Option<Attestation> {
            let previous = self.previous.as_ref()?;
            let keys = &self.keys[index];
            let slot = previous.assignment.attestation_slot(&keys.id())?;
            Some(Attestation::sign(
                keys.id(),
                AttestationData {
                    slot,
                    source: CheckpointRef::new(0, checkpoint(0)),
                    target: CheckpointRef::new(previous.epoch, target),
                },
                &keys.attestation,
            ))
        }

        fn body(&self, voters: &[usize], wrong: &[usize]) -> BlockBody {
            let epoch = self.state.epoch;
            let mut body = BlockBody {
                tickets: self
                    .keys
                    .iter()
                    .map(|k| evaluate_ticket(&k.vrf, k.id(), epoch + 1, &self.state.next_seed))
                    .collect(),
                ..BlockBody::default()
            };
            if epoch > 0 {
                let previous = checkpoint(epoch - 1);
                body.attestations.extend(voters.iter().filter_map(|&i| self.vote(i, previous)));
                body.attestations.extend(wrong.iter().filter_map(|&i| self.vote(i, [0xAB; 32])));
            }
            body
        }

        fn advance_with(&mut self, body: &BlockBody) {
            let epoch = self.state.epoch;
            let segment = EpochSegment {
                epoch,
                checkpoint: checkpoint(epoch),
                blocks: vec![SegmentBlock {
                    slot: epoch * L + 2,
                    proposer: self.id(0),
                    body,
                }],
            };
            let next = self.state.advance(&segment, &self.config, &self.scorer).unwrap();
            self.previous = Some(std::mem::replace(&mut self.state, next));
        }

        fn advance(&mut self, voters: &[usize]) {
            let body = self.body(voters, &[]);
            self.advance_with(&body);
        }
    }

    #[test]
    fn test_genesis_committee_uses_public_outputs() {
        let chain = Chain::new(4);
        let state = &chain.state;
        assert!(state.assignment.fallback);
        assert_eq!(state.assignment.committee_size(), 2);
        assert_eq!(state.assignment.attester_count(), 4);
        assert_eq!(
            state.next_seed,
            derive_epoch_seed(&state.seed, state.assignment.outputs(), 1)
        );
        assert_eq!(state.registry.stake_cap(), Some(chain.config.max_effective_stake()));
    }

    #[test]
    fn test_assignment_follows_included_tickets_only() {
        let mut full = Chain::new(4);
        full.advance(&[]);
        assert!(!full.state.assignment.fallback);
        assert_eq!(full.state.assignment.committee_size(), 2);
        assert_eq!(full.state.assignment.attester_count(), 4);

        // Same blocks, same state
        let mut again = Chain::new(4);
        again.advance(&[]);
        assert_eq!(again.state.assignment, full.state.assignment);
        assert_eq!(again.state.next_seed, full.state.next_seed);

        // A chain that carried only two tickets draws only those two
        let mut partial = Chain::new(4);
        let mut body = partial.body(&[], &[]);
        body.tickets.truncate(2);
        partial.advance_with(&body);
        assert_eq!(
            partial.state.assignment.members(),
            BTreeSet::from([partial.id(0), partial.id(1)])
        );
        assert_eq!(partial.state.assignment.attester_count(), 4);
    }

    #[test]
    fn test_silent_validator_outside_committee_becomes_inactive() {
        let mut chain = Chain::new(4);
        let silent = chain.id(3);
        for _ in 0..9 {
            chain.advance(&[0, 1, 2]);
        }
        // Epochs 1..=7 closed: seven misses
        assert_eq!(chain.state.epoch, 9);
        assert_eq!(chain.state.registry.get(&silent).unwrap().missed_epochs, 7);
        assert!(chain.state.registry.get(&silent).unwrap().is_active());

        chain.advance(&[0, 1, 2]);
        let validator = chain.state.registry.get(&silent).unwrap();
        assert_eq!(validator.status, ValidatorStatus::Inactive);
        assert_eq!(validator.stake, U256::from(1000u64));
        let closed = chain.state.closed.as_ref().unwrap();
        assert_eq!(closed.epoch, 8);
        assert_eq!(closed.deactivated, vec![silent]);
        assert!(closed.supermajority);
        assert!(!chain.state.inactivity.is_leak_active());
        assert_eq!(chain.state.registry.total_active_stake(), U256::from(3000u64));
    }

    #[test]
    fn test_leak_drains_absent_stake_without_supermajority() {
        let mut chain = Chain::new(4);
        for _ in 0..6 {
            chain.advance(&[0, 1]);
        }
        assert!(!chain.state.inactivity.is_leak_active());

        // Closing epoch 5 with nothing since epoch 0 starts the leak
        chain.advance(&[0, 1]);
        let closed = chain.state.closed.as_ref().unwrap();
        assert_eq!(closed.epoch, 5);
        assert!(!closed.supermajority);
        assert_eq!(closed.finality_lag, 5);
        assert!(chain.state.inactivity.is_leak_active());
        assert_eq!(closed.penalties.len(), 2);

        let registry = &chain.state.registry;
        assert!(registry.get(&chain.id(3)).unwrap().stake < U256::from(1000u64));
        assert!(registry.get(&chain.id(2)).unwrap().stake < U256::from(1000u64));
        assert_eq!(registry.get(&chain.id(0)).unwrap().stake, U256::from(1000u64));
        assert!(registry.burned() > U256::zero());
    }

    #[test]
    fn test_vote_credit_depends_on_target() {
        let mut chain = Chain::new(4);
        chain.advance(&[]);
        chain.advance(&[]);
        let body = chain.body(&[0], &[1]);
        chain.advance_with(&body);

        let closed = chain.state.closed.as_ref().unwrap();
        assert_eq!(closed.epoch, 1);
        let points = &chain.config.points;
        let tallies = &closed.recorded.tallies;
        assert_eq!(
            tallies.get(&chain.id(0)).attestation_points,
            points.attestation_base + points.correct_target_bonus
        );
        assert_eq!(tallies.get(&chain.id(1)).attestation_points, points.attestation_base);
        assert_eq!(tallies.get(&chain.id(2)).attestation_points, 0);
        // One block per epoch, all by validator 0
        assert_eq!(tallies.get(&chain.id(0)).production_points, points.block_produced);
    }

    #[test]
    fn test_operations_and_evidence_apply_from_blocks() {
        let mut chain = Chain::new(4);
        let newcomer = ValidatorKeys::from_seed([77; 32]).unwrap();
        let offender = &chain.keys[2];
        let evidence = SlashingEvidence::DoubleVote {
            a: Attestation::sign(
                offender.id(),
                AttestationData {
                    slot: 1,
                    source: CheckpointRef::new(0, [0; 32]),
                    target: CheckpointRef::new(1, [1; 32]),
                },
                &offender.attestation,
            ),
            b: Attestation::sign(
                offender.id(),
                AttestationData {
                    slot: 1,
                    source: CheckpointRef::new(0, [0; 32]),
                    target: CheckpointRef::new(1, [2; 32]),
                },
                &offender.attestation,
            ),
        };
        let mut body = chain.body(&[], &[]);
        body.operations = vec![
            Operation::Register(newcomer.registration(U256::from(1000u64))),
            Operation::Exit(SignedExit::sign(&chain.keys[1].signing, chain.id(1), 0)),
        ];
        body.evidence = vec![EvidenceMessage {
            evidence,
            reporter: Some(chain.id(0)),
        }];
        body.relay = vec![RelayReport {
            validator: chain.id(3),
            messages: 4,
        }];
        chain.advance_with(&body);

        let registry = &chain.state.registry;
        assert_eq!(chain.state.activated, vec![newcomer.id()]);
        assert!(registry.get(&newcomer.id()).unwrap().is_active());
        assert_eq!(registry.get(&chain.id(1)).unwrap().exit_requested_epoch, Some(0));
        assert_eq!(registry.get(&chain.id(2)).unwrap().status, ValidatorStatus::Slashed);
        assert_eq!(chain.state.slashings.len(), 1);
        assert_eq!(chain.state.slashings[0].reporter, Some(chain.id(0)));
        // Newcomer had no ticket in the block but still attests
        assert!(chain.state.assignment.has_duty(&newcomer.id()));
        assert!(!chain.state.assignment.has_duty(&chain.id(2)));

        // Exit takes effect after the unbonding delay
        assert!(registry.get(&chain.id(1)).unwrap().is_active());
        chain.advance(&[]);
        assert_eq!(
            chain.state.registry.get(&chain.id(1)).unwrap().status,
            ValidatorStatus::Exiting
        );
        assert_eq!(chain.state.exited, vec![chain.id(1)]);
    }
}
