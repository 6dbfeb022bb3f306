//! In-memory consensus store.

use crate::domain::{CheckpointRef, SlashingRecord};
use crate::error::{ConsensusError, ConsensusResult};
use crate::ports::outbound::{ConsensusStore, EpochUpdate, FinalizedCheckpointRecord};
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::info;

/// Keeps every record in memory. Finalized checkpoints are append-only.
#[derive(Default)]
pub struct InMemoryConsensusStore {
    finalized: RwLock<Vec<FinalizedCheckpointRecord>>,
    epochs: RwLock<Vec<EpochUpdate>>,
    slashings: RwLock<Vec<SlashingRecord>>,
}

impl InMemoryConsensusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finalized(&self) -> Vec<FinalizedCheckpointRecord> {
        self.finalized.read().clone()
    }

    pub fn last_finalized(&self) -> Option<CheckpointRef> {
        self.finalized.read().last().map(|r| r.checkpoint)
    }

    pub fn epoch_updates(&self) -> Vec<EpochUpdate> {
        self.epochs.read().clone()
    }

    pub fn slashings(&self) -> Vec<SlashingRecord> {
        self.slashings.read().clone()
    }
}

#[async_trait]
impl ConsensusStore for InMemoryConsensusStore {
    async fn append_finalized(&self, record: FinalizedCheckpointRecord) -> ConsensusResult<()> {
        let mut finalized = self.finalized.write();
        if let Some(last) = finalized.last() {
            if record.checkpoint.epoch <= last.checkpoint.epoch {
                return Err(ConsensusError::Collaborator {
                    collaborator: "store",
                    reason: format!(
                        "finalized checkpoint {} does not extend {}",
                        record.checkpoint, last.checkpoint
                    ),
                });
            }
        }
        info!(checkpoint = %record.checkpoint, "Persisted finalized checkpoint");
        finalized.push(record);
        Ok(())
    }

    async fn write_epoch_update(&self, update: EpochUpdate) -> ConsensusResult<()> {
        self.epochs.write().push(update);
        Ok(())
    }

    async fn record_slashing(&self, record: SlashingRecord) -> ConsensusResult<()> {
        self.slashings.write().push(record);
        Ok(())
    }
}
