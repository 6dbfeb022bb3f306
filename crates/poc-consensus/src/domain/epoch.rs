//! Slot and epoch arithmetic.
//!
//! Slot 0 holds genesis. Epoch `e` spans slots `[e * L, (e + 1) * L)`. Block
//! heights used by the scorer's decay are measured in slots, so empty slots
//! still advance decay.

use shared_types::{EpochNumber, Slot};
use std::time::Duration;

/// Phase inside a slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SlotPhase {
    /// First third: proposals are made and gossiped
    Propose,
    /// From one third of the slot: attestation duties run
    Attest,
}

/// Wall-clock to slot mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotClock {
    slot_duration: Duration,
    epoch_length: u64,
}

impl SlotClock {
    pub fn new(slot_duration: Duration, epoch_length: u64) -> Self {
        Self {
            slot_duration,
            epoch_length: epoch_length.max(1),
        }
    }

    pub fn slot_duration(&self) -> Duration {
        self.slot_duration
    }

    pub fn epoch_length(&self) -> u64 {
        self.epoch_length
    }

    /// Slot containing the instant `since_genesis` after genesis.
    pub fn slot_at(&self, since_genesis: Duration) -> Slot {
        let nanos = self.slot_duration.as_nanos().max(1);
        (since_genesis.as_nanos() / nanos) as Slot
    }

    /// Slot and phase at `since_genesis`.
    pub fn position(&self, since_genesis: Duration) -> (Slot, SlotPhase) {
        let slot = self.slot_at(since_genesis);
        let into_slot = since_genesis.saturating_sub(self.slot_start(slot));
        let phase = if into_slot >= self.attestation_offset() {
            SlotPhase::Attest
        } else {
            SlotPhase::Propose
        };
        (slot, phase)
    }

    /// Offset from genesis at which `slot` begins.
    pub fn slot_start(&self, slot: Slot) -> Duration {
        self.slot_duration.saturating_mul(slot.min(u32::MAX as u64) as u32)
    }

    /// Offset at which proposals for `slot` stop being accepted.
    pub fn slot_deadline(&self, slot: Slot) -> Duration {
        self.slot_start(slot.saturating_add(1))
    }

    /// Offset into a slot at which attestation duties run.
    pub fn attestation_offset(&self) -> Duration {
        self.slot_duration / 3
    }

    pub fn epoch_of(&self, slot: Slot) -> EpochNumber {
        slot / self.epoch_length
    }

    pub fn epoch_start_slot(&self, epoch: EpochNumber) -> Slot {
        epoch.saturating_mul(self.epoch_length)
    }

    pub fn is_epoch_start(&self, slot: Slot) -> bool {
        slot % self.epoch_length == 0
    }

    /// Block height at which epoch `epoch` closes (start of the next epoch).
    pub fn boundary_block(&self, epoch: EpochNumber) -> u64 {
        self.epoch_start_slot(epoch.saturating_add(1))
    }
}
