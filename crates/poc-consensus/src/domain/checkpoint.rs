//! Checkpoint tree and Casper FFG justification/finalization
//!
//! State progression: Pending → Justified → Finalized
//!
//! - A supermajority link `source → target` whose source is justified
//!   justifies the target.
//! - If `target.epoch == source.epoch + 1`, the source becomes Finalized.
//!
//! Checkpoints live in an arena keyed by [`CheckpointRef`]; parents are
//! references into the same arena.

use crate::domain::attestation::CheckpointRef;
use crate::domain::validator::{ValidatorId, ValidatorRegistry};
use serde::{Deserialize, Serialize};
use shared_types::U256;
use std::collections::{BTreeSet, HashMap, HashSet};
use thiserror::Error;

/// Finality errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FinalityError {
    #[error("Unknown checkpoint {0}")]
    UnknownCheckpoint(CheckpointRef),

    #[error("Parent checkpoint {0} is not known")]
    UnknownParent(CheckpointRef),

    #[error("Invalid link {from} -> {to}")]
    InvalidLink { from: CheckpointRef, to: CheckpointRef },

    #[error("Finalizing {new} conflicts with finalized {existing}")]
    ConflictingFinalization {
        existing: CheckpointRef,
        new: CheckpointRef,
    },
}

impl FinalityError {
    /// Safety has been broken; the node must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ConflictingFinalization { .. })
    }
}

/// Checkpoint finality state
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum CheckpointState {
    /// Awaiting a supermajority link
    #[default]
    Pending,
    /// Target of a supermajority link from a justified source
    Justified,
    /// Justified, and source of a supermajority link to its direct child epoch
    Finalized,
}

/// A checkpoint at an epoch boundary block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointRef,
    pub parent: Option<CheckpointRef>,
    pub state: CheckpointState,
    /// Largest link stake observed with this checkpoint as target
    pub attested_stake: U256,
}

impl Checkpoint {
    pub fn is_justified(&self) -> bool {
        self.state >= CheckpointState::Justified
    }

    pub fn is_finalized(&self) -> bool {
        self.state == CheckpointState::Finalized
    }
}

/// State changes caused by one link.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LinkOutcome {
    pub justified: Option<CheckpointRef>,
    pub finalized: Option<CheckpointRef>,
}

/// `attested ≥ 2/3 · total`, evaluated without rounding.
pub fn is_supermajority(attested: U256, total: U256) -> bool {
    if total.is_zero() {
        return false;
    }
    attested.full_mul(U256::from(3u8)) >= total.full_mul(U256::from(2u8))
}

/// Stake of validators that appear in both vote sets.
///
/// Counted at registered stake, whatever the validator's current status.
pub fn double_voter_stake(
    voters_a: &BTreeSet<ValidatorId>,
    voters_b: &BTreeSet<ValidatorId>,
    registry: &ValidatorRegistry,
) -> U256 {
    voters_a
        .intersection(voters_b)
        .filter_map(|id| registry.get(id))
        .fold(U256::zero(), |acc, v| acc.saturating_add(v.stake))
}

/// Arena of checkpoints rooted at genesis.
#[derive(Clone, Debug)]
pub struct CheckpointTree {
    checkpoints: HashMap<CheckpointRef, Checkpoint>,
    latest_justified: CheckpointRef,
    latest_finalized: CheckpointRef,
}

impl CheckpointTree {
    /// Tree holding only the genesis checkpoint, justified and finalized.
    pub fn new(genesis: CheckpointRef) -> Self {
        let mut checkpoints = HashMap::new();
        checkpoints.insert(
            genesis,
            Checkpoint {
                id: genesis,
                parent: None,
                state: CheckpointState::Finalized,
                attested_stake: U256::zero(),
            },
        );
        Self {
            checkpoints,
            latest_justified: genesis,
            latest_finalized: genesis,
        }
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    pub fn get(&self, id: &CheckpointRef) -> Option<&Checkpoint> {
        self.checkpoints.get(id)
    }

    pub fn contains(&self, id: &CheckpointRef) -> bool {
        self.checkpoints.contains_key(id)
    }

    /// Add a Pending checkpoint. Returns `false` if it was already known.
    pub fn insert(&mut self, id: CheckpointRef, parent: CheckpointRef) -> Result<bool, FinalityError> {
        if self.checkpoints.contains_key(&id) {
            return Ok(false);
        }
        if !self.checkpoints.contains_key(&parent) {
            return Err(FinalityError::UnknownParent(parent));
        }
        if parent.epoch >= id.epoch {
            return Err(FinalityError::InvalidLink {
                from: parent,
                to: id,
            });
        }
        self.checkpoints.insert(
            id,
            Checkpoint {
                id,
                parent: Some(parent),
                state: CheckpointState::Pending,
                attested_stake: U256::zero(),
            },
        );
        Ok(true)
    }

    /// `ancestor` is `descendant` or lies on its parent chain.
    pub fn is_ancestor(&self, ancestor: &CheckpointRef, descendant: &CheckpointRef) -> bool {
        let mut cursor = Some(*descendant);
        while let Some(id) = cursor {
            if id == *ancestor {
                return true;
            }
            if id.epoch <= ancestor.epoch {
                return false;
            }
            cursor = self.checkpoints.get(&id).and_then(|c| c.parent);
        }
        false
    }

    /// Neither checkpoint is an ancestor of the other.
    pub fn conflicting(&self, a: &CheckpointRef, b: &CheckpointRef) -> bool {
        !self.is_ancestor(a, b) && !self.is_ancestor(b, a)
    }

    pub fn latest_justified(&self) -> CheckpointRef {
        self.latest_justified
    }

    pub fn latest_finalized(&self) -> CheckpointRef {
        self.latest_finalized
    }

    /// Apply a link carrying `attested` out of `total` active stake.
    pub fn process_link(
        &mut self,
        source: &CheckpointRef,
        target: &CheckpointRef,
        attested: U256,
        total: U256,
    ) -> Result<LinkOutcome, FinalityError> {
        let source_cp = self
            .checkpoints
            .get(source)
            .ok_or(FinalityError::UnknownCheckpoint(*source))?;
        if !self.checkpoints.contains_key(target) {
            return Err(FinalityError::UnknownCheckpoint(*target));
        }
        if target.epoch <= source.epoch || !self.is_ancestor(source, target) {
            return Err(FinalityError::InvalidLink {
                from: *source,
                to: *target,
            });
        }

        let mut outcome = LinkOutcome::default();
        if !source_cp.is_justified() {
            return Ok(outcome);
        }
        let source_state = source_cp.state;

        if let Some(target_cp) = self.checkpoints.get_mut(target) {
            target_cp.attested_stake = target_cp.attested_stake.max(attested);
            if !is_supermajority(attested, total) {
                return Ok(outcome);
            }
            if target_cp.state == CheckpointState::Pending {
                target_cp.state = CheckpointState::Justified;
                outcome.justified = Some(*target);
            }
        }
        if target.epoch > self.latest_justified.epoch {
            self.latest_justified = *target;
        }

        if target.epoch == source.epoch + 1 && source_state == CheckpointState::Justified {
            if self.conflicting(&self.latest_finalized, source) {
                return Err(FinalityError::ConflictingFinalization {
                    existing: self.latest_finalized,
                    new: *source,
                });
            }
            if let Some(source_cp) = self.checkpoints.get_mut(source) {
                source_cp.state = CheckpointState::Finalized;
            }
            if source.epoch > self.latest_finalized.epoch {
                self.latest_finalized = *source;
            }
            outcome.finalized = Some(*source);
        }

        Ok(outcome)
    }

    /// Drop checkpoints that do not descend from the latest finalized one.
    pub fn prune(&mut self) -> usize {
        let root = self.latest_finalized;
        let keep: HashSet<CheckpointRef> = self
            .checkpoints
            .keys()
            .filter(|id| self.is_ancestor(&root, id))
            .copied()
            .collect();
        let before = self.checkpoints.len();
        self.checkpoints.retain(|id, _| keep.contains(id));
        if let Some(root_cp) = self.checkpoints.get_mut(&root) {
            root_cp.parent = None;
        }
        if !self.checkpoints.contains_key(&self.latest_justified) {
            self.latest_justified = root;
        }
        before - self.checkpoints.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::validator::tests::registry_with;

    fn test_hash(n: u8) -> [u8; 32] {
        let mut hash = [0u8; 32];
        hash[0] = n;
        hash
    }

    fn cp(epoch: u64, n: u8) -> CheckpointRef {
        CheckpointRef::new(epoch, test_hash(n))
    }

    fn stake(n: u64) -> U256 {
        U256::from(n)
    }

    #[test]
    fn test_checkpoint_state_ordering() {
        assert!(CheckpointState::Pending < CheckpointState::Justified);
        assert!(CheckpointState::Justified < CheckpointState::Finalized);
    }

    #[test]
    fn test_supermajority_threshold() {
        assert!(!is_supermajority(stake(66), stake(100)));
        assert!(is_supermajority(stake(67), stake(100)));
        assert!(is_supermajority(stake(2), stake(3)));
        assert!(!is_supermajority(stake(0), stake(0)));
        assert!(is_supermajority(U256::MAX, U256::MAX));
    }

    #[test]
    fn test_justify_then_finalize() {
        let genesis = cp(0, 0);
        let mut tree = CheckpointTree::new(genesis);
        tree.insert(cp(1, 1), genesis).unwrap();
        tree.insert(cp(2, 2), cp(1, 1)).unwrap();

        // Genesis is already finalized; linking from it only justifies.
        let outcome = tree
            .process_link(&genesis, &cp(1, 1), stake(3000), stake(4000))
            .unwrap();
        assert_eq!(outcome.justified, Some(cp(1, 1)));
        assert_eq!(outcome.finalized, None);
        assert_eq!(tree.latest_justified(), cp(1, 1));

        let outcome = tree
            .process_link(&cp(1, 1), &cp(2, 2), stake(3000), stake(4000))
            .unwrap();
        assert_eq!(outcome.justified, Some(cp(2, 2)));
        assert_eq!(outcome.finalized, Some(cp(1, 1)));
        assert_eq!(tree.latest_finalized(), cp(1, 1));
        assert!(tree.get(&cp(1, 1)).unwrap().is_finalized());

        // Reprocessing is a no-op.
        let again = tree
            .process_link(&cp(1, 1), &cp(2, 2), stake(3000), stake(4000))
            .unwrap();
        assert_eq!(again, LinkOutcome::default());
    }

    #[test]
    fn test_below_threshold_records_stake_only() {
        let genesis = cp(0, 0);
        let mut tree = CheckpointTree::new(genesis);
        tree.insert(cp(1, 1), genesis).unwrap();
        let outcome = tree
            .process_link(&genesis, &cp(1, 1), stake(2000), stake(4000))
            .unwrap();
        assert_eq!(outcome, LinkOutcome::default());
        let checkpoint = tree.get(&cp(1, 1)).unwrap();
        assert_eq!(checkpoint.state, CheckpointState::Pending);
        assert_eq!(checkpoint.attested_stake, stake(2000));
    }

    #[test]
    fn test_skip_link_justifies_without_finalizing() {
        let genesis = cp(0, 0);
        let mut tree = CheckpointTree::new(genesis);
        tree.insert(cp(1, 1), genesis).unwrap();
        tree.insert(cp(3, 3), cp(1, 1)).unwrap();
        tree.process_link(&genesis, &cp(1, 1), stake(3), stake(4)).unwrap();

        let outcome = tree.process_link(&cp(1, 1), &cp(3, 3), stake(3), stake(4)).unwrap();
        assert_eq!(outcome.justified, Some(cp(3, 3)));
        assert_eq!(outcome.finalized, None);
    }

    #[test]
    fn test_unjustified_source_has_no_effect() {
        let genesis = cp(0, 0);
        let mut tree = CheckpointTree::new(genesis);
        tree.insert(cp(1, 1), genesis).unwrap();
        tree.insert(cp(2, 2), cp(1, 1)).unwrap();
        let outcome = tree.process_link(&cp(1, 1), &cp(2, 2), stake(4), stake(4)).unwrap();
        assert_eq!(outcome, LinkOutcome::default());
    }

    #[test]
    fn test_link_must_follow_ancestry() {
        let genesis = cp(0, 0);
        let mut tree = CheckpointTree::new(genesis);
        tree.insert(cp(1, 1), genesis).unwrap();
        tree.insert(cp(1, 2), genesis).unwrap();
        tree.insert(cp(2, 3), cp(1, 2)).unwrap();
        assert!(matches!(
            tree.process_link(&cp(1, 1), &cp(2, 3), stake(4), stake(4)),
            Err(FinalityError::InvalidLink { .. })
        ));
        assert!(tree.conflicting(&cp(1, 1), &cp(2, 3)));
        assert!(!tree.conflicting(&genesis, &cp(2, 3)));
    }

    #[test]
    fn test_conflicting_finalization_is_fatal() {
        let genesis = cp(0, 0);
        let mut tree = CheckpointTree::new(genesis);
        // Two branches from genesis.
        tree.insert(cp(1, 1), genesis).unwrap();
        tree.insert(cp(2, 1), cp(1, 1)).unwrap();
        tree.insert(cp(1, 2), genesis).unwrap();
        tree.insert(cp(2, 2), cp(1, 2)).unwrap();

        tree.process_link(&genesis, &cp(1, 1), stake(4), stake(4)).unwrap();
        tree.process_link(&cp(1, 1), &cp(2, 1), stake(4), stake(4)).unwrap();
        assert_eq!(tree.latest_finalized(), cp(1, 1));

        tree.process_link(&genesis, &cp(1, 2), stake(4), stake(4)).unwrap();
        let err = tree
            .process_link(&cp(1, 2), &cp(2, 2), stake(4), stake(4))
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_insert_requires_known_parent() {
        let mut tree = CheckpointTree::new(cp(0, 0));
        assert_eq!(
            tree.insert(cp(2, 2), cp(1, 1)),
            Err(FinalityError::UnknownParent(cp(1, 1)))
        );
        assert_eq!(tree.insert(cp(0, 0), cp(0, 0)), Ok(false));
    }

    #[test]
    fn test_prune_keeps_finalized_subtree() {
        let genesis = cp(0, 0);
        let mut tree = CheckpointTree::new(genesis);
        tree.insert(cp(1, 1), genesis).unwrap();
        tree.insert(cp(1, 9), genesis).unwrap();
        tree.insert(cp(2, 2), cp(1, 1)).unwrap();
        tree.process_link(&genesis, &cp(1, 1), stake(4), stake(4)).unwrap();
        tree.process_link(&cp(1, 1), &cp(2, 2), stake(4), stake(4)).unwrap();

        assert_eq!(tree.prune(), 2);
        assert!(tree.contains(&cp(1, 1)));
        assert!(tree.contains(&cp(2, 2)));
        assert!(!tree.contains(&cp(1, 9)));
    }

    #[test]
    fn test_prune_drops_every_sibling_branch() {
        let genesis = cp(0, 0);
        let mut tree = CheckpointTree::new(genesis);
        tree.insert(cp(1, 1), genesis).unwrap();
        tree.insert(cp(2, 2), cp(1, 1)).unwrap();
        for n in 10..=250u8 {
            tree.insert(cp(1, n), genesis).unwrap();
            tree.insert(cp(2, n), cp(1, n)).unwrap();
        }
        tree.process_link(&genesis, &cp(1, 1), stake(4), stake(4)).unwrap();
        tree.process_link(&cp(1, 1), &cp(2, 2), stake(4), stake(4)).unwrap();

        assert_eq!(tree.prune(), 1 + 2 * 241);
        assert_eq!(tree.latest_finalized(), cp(1, 1));
        assert_eq!(tree.latest_justified(), cp(2, 2));
        assert!(tree.contains(&cp(2, 2)));
        assert!(!tree.contains(&cp(2, 10)));
        assert!(tree.get(&cp(1, 1)).unwrap().parent.is_none());
    }

    #[test]
    fn test_double_voter_stake() {
        let (registry, keys) = registry_with(&[1000, 2000, 3000]);
        let a: BTreeSet<_> = [keys[0].id(), keys[1].id()].into_iter().collect();
        let b: BTreeSet<_> = [keys[1].id(), keys[2].id()].into_iter().collect();
        assert_eq!(double_voter_stake(&a, &b, &registry), stake(2000));
    }
}
