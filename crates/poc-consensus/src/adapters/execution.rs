//! Stand-in execution layer.

use crate::error::ConsensusResult;
use crate::ports::outbound::ExecutionGateway;
use async_trait::async_trait;
use shared_crypto::blake3_hash_many;
use shared_types::{Hash, Slot};

/// Derives the state root from the parent hash and slot, so every node that
/// builds on the same parent agrees on it.
#[derive(Clone, Copy, Debug, Default)]
pub struct HashChainExecution;

#[async_trait]
impl ExecutionGateway for HashChainExecution {
    async fn state_root(&self, parent: Hash, slot: Slot) -> ConsensusResult<Hash> {
        Ok(blake3_hash_many(&[b"poc-state".as_slice(), &parent, &slot.to_be_bytes()]))
    }
}
