//! # LMD-GHOST Fork Choice
//!
//! Latest Message Driven Greedy Heaviest Observed Subtree.
//!
//! 1. Keep every accepted block and each validator's latest vote.
//! 2. Weight of a block = active stake whose latest vote is that block or a
//!    descendant.
//! 3. From the finalized block, repeatedly step to the heaviest child.
//!    Ties go to the child with the higher slot, then the lower hash.

use crate::domain::validator::{ValidatorId, ValidatorRegistry};
use shared_types::{short_hex, Hash, Slot, U256};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Fork choice errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ForkChoiceError {
    #[error("Unknown block {0}")]
    UnknownBlock(String),

    #[error("Block slot {slot} is not after parent slot {parent_slot}")]
    SlotNotIncreasing { slot: Slot, parent_slot: Slot },
}

impl ForkChoiceError {
    fn unknown(hash: &Hash) -> Self {
        Self::UnknownBlock(short_hex(hash))
    }
}

/// A block as seen by fork choice.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockNode {
    pub hash: Hash,
    pub parent: Hash,
    pub slot: Slot,
    pub proposer: Option<ValidatorId>,
}

/// Fork choice store
#[derive(Debug)]
pub struct ForkChoice {
    blocks: HashMap<Hash, BlockNode>,
    children: HashMap<Hash, Vec<Hash>>,
    /// Latest vote from each validator: (slot, block)
    latest_votes: HashMap<ValidatorId, (Slot, Hash)>,
    genesis: Hash,
}

impl ForkChoice {
    pub fn new(genesis: Hash) -> Self {
        let mut blocks = HashMap::new();
        blocks.insert(
            genesis,
            BlockNode {
                hash: genesis,
                parent: genesis,
                slot: 0,
                proposer: None,
            },
        );
        Self {
            blocks,
            children: HashMap::new(),
            latest_votes: HashMap::new(),
            genesis,
        }
    }

    pub fn genesis(&self) -> Hash {
        self.genesis
    }

    pub fn has_block(&self, hash: &Hash) -> bool {
        self.blocks.contains_key(hash)
    }

    pub fn get_block(&self, hash: &Hash) -> Option<&BlockNode> {
        self.blocks.get(hash)
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Add a block whose parent is known. Returns `false` for a duplicate.
    pub fn add_block(&mut self, node: BlockNode) -> Result<bool, ForkChoiceError> {
        if self.blocks.contains_key(&node.hash) {
            return Ok(false);
        }
        let parent = self
            .blocks
            .get(&node.parent)
            .ok_or_else(|| ForkChoiceError::unknown(&node.parent))?;
        if node.slot <= parent.slot {
            return Err(ForkChoiceError::SlotNotIncreasing {
                slot: node.slot,
                parent_slot: parent.slot,
            });
        }
        self.children.entry(node.parent).or_default().push(node.hash);
        self.blocks.insert(node.hash, node);
        Ok(true)
    }

    /// Record a vote; older messages than the stored one are ignored.
    pub fn on_attestation(&mut self, validator: ValidatorId, slot: Slot, block: Hash) {
        let entry = self.latest_votes.entry(validator).or_insert((slot, block));
        if slot > entry.0 {
            *entry = (slot, block);
        }
    }

    pub fn latest_vote(&self, validator: &ValidatorId) -> Option<(Slot, Hash)> {
        self.latest_votes.get(validator).copied()
    }

    fn weights(&self, registry: &ValidatorRegistry) -> HashMap<Hash, U256> {
        let mut weights: HashMap<Hash, U256> = HashMap::new();
        for (validator, (_, target)) in &self.latest_votes {
            let stake = registry.voting_stake(validator);
            if stake.is_zero() {
                continue;
            }
            let mut current = *target;
            let mut visited = HashSet::new();
            while visited.insert(current) {
                let Some(node) = self.blocks.get(&current) else {
                    break;
                };
                let weight = weights.entry(current).or_default();
                *weight = weight.saturating_add(stake);
                if current == node.parent {
                    break;
                }
                current = node.parent;
            }
        }
        weights
    }

    /// Canonical head descending from `root`.
    pub fn head(&self, root: &Hash, registry: &ValidatorRegistry) -> Result<Hash, ForkChoiceError> {
        if !self.blocks.contains_key(root) {
            return Err(ForkChoiceError::unknown(root));
        }
        let weights = self.weights(registry);
        let mut current = *root;
        loop {
            let best = self.children.get(&current).and_then(|children| {
                children.iter().max_by(|a, b| {
                    let wa = weights.get(*a).copied().unwrap_or_default();
                    let wb = weights.get(*b).copied().unwrap_or_default();
                    let sa = self.blocks.get(*a).map(|n| n.slot).unwrap_or_default();
                    let sb = self.blocks.get(*b).map(|n| n.slot).unwrap_or_default();
                    wa.cmp(&wb).then(sa.cmp(&sb)).then_with(|| b.cmp(a))
                })
            });
            match best {
                Some(child) => current = *child,
                None => return Ok(current),
            }
        }
    }

    /// The last block at or before `slot` on the chain ending at `hash`.
    pub fn ancestor_at_slot(&self, hash: &Hash, slot: Slot) -> Option<Hash> {
        let mut current = self.blocks.get(hash)?;
        while current.slot > slot {
            if current.parent == current.hash {
                return None;
            }
            current = self.blocks.get(&current.parent)?;
        }
        Some(current.hash)
    }

    /// `ancestor` is `hash` or one of its ancestors.
    pub fn is_descendant(&self, ancestor: &Hash, hash: &Hash) -> bool {
        let Some(target_slot) = self.blocks.get(ancestor).map(|n| n.slot) else {
            return false;
        };
        self.ancestor_at_slot(hash, target_slot) == Some(*ancestor)
    }

    /// Keep only `root` and its descendants. `root` becomes the new base.
    pub fn prune(&mut self, root: &Hash) -> usize {
        if !self.blocks.contains_key(root) {
            return 0;
        }
        let mut keep = HashSet::new();
        let mut stack = vec![*root];
        while let Some(hash) = stack.pop() {
            if keep.insert(hash) {
                if let Some(children) = self.children.get(&hash) {
                    stack.extend(children.iter().copied());
                }
            }
        }
        let before = self.blocks.len();
        self.blocks.retain(|hash, _| keep.contains(hash));
        self.children.retain(|hash, _| keep.contains(hash));
        self.latest_votes.retain(|_, (_, block)| keep.contains(block));
        if let Some(node) = self.blocks.get_mut(root) {
            node.parent = node.hash;
        }
        before - self.blocks.len()
    }
}
