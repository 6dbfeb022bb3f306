//! Node event loop.
//!
//! One consumer drains a merged stream of clock ticks and inbound network
//! frames and drives the [`ConsensusApi`]. Ticks arrive three times per slot
//! so both slot phases are observed. Frames are read in small batches; the
//! attestations of a batch are verified together.

use crate::domain::{NetworkMessage, SlotClock, SlotPhase};
use crate::error::{ConsensusError, ConsensusResult};
use crate::metrics;
use crate::ports::inbound::ConsensusApi;
use shared_types::{PeerId, Slot};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::{IntervalStream, ReceiverStream};
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn, Instrument};

/// Frames read from the queue before a batch is processed.
const MAX_FRAME_BATCH: usize = 256;

/// Longest wait for a batch to fill.
const FRAME_BATCH_WINDOW: Duration = Duration::from_millis(20);

/// Raw message received from a peer.
#[derive(Clone, Debug)]
pub struct InboundFrame {
    pub peer: PeerId,
    pub bytes: Vec<u8>,
}

/// Producer side of the bounded inbound queue.
#[derive(Clone, Debug)]
pub struct InboundSender {
    tx: mpsc::Sender<InboundFrame>,
}

impl InboundSender {
    /// Enqueue a frame. When the queue is full the new frame is dropped and
    /// `false` is returned.
    pub fn try_push(&self, frame: InboundFrame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                metrics::record_message_dropped("queue_full");
                warn!(peer = %frame.peer, "Inbound queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Bounded inbound queue.
pub fn inbound_channel(capacity: usize) -> (InboundSender, mpsc::Receiver<InboundFrame>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (InboundSender { tx }, rx)
}

enum Event {
    Tick,
    Frames(Vec<InboundFrame>),
}

/// Drives a consensus API from the slot clock and the inbound queue.
pub struct ConsensusRuntime<A: ConsensusApi> {
    driver: Driver<A>,
    inbound: mpsc::Receiver<InboundFrame>,
    shutdown: watch::Receiver<bool>,
}

impl<A: ConsensusApi> ConsensusRuntime<A> {
    pub fn new(
        api: Arc<A>,
        clock: SlotClock,
        genesis_time: Instant,
        inbound: mpsc::Receiver<InboundFrame>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            driver: Driver {
                api,
                clock,
                genesis_time,
                started_slot: None,
                attested_slot: None,
            },
            inbound,
            shutdown,
        }
    }

    /// Run until shutdown is signalled, the queue closes, or a fatal error.
    pub async fn run(self) -> ConsensusResult<()> {
        let span = poc_telemetry::subsystem_span!(
            "consensus_runtime",
            epoch_length = self.driver.clock.epoch_length()
        );
        self.event_loop().instrument(span).await
    }

    async fn event_loop(self) -> ConsensusResult<()> {
        let Self {
            mut driver,
            inbound,
            mut shutdown,
        } = self;
        let clock = driver.clock;

        let period = (clock.slot_duration() / 3).max(Duration::from_millis(1));
        let mut interval = tokio::time::interval_at(driver.genesis_time, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let ticks = IntervalStream::new(interval).map(|_| Event::Tick);
        let frames = ReceiverStream::new(inbound)
            .chunks_timeout(MAX_FRAME_BATCH, FRAME_BATCH_WINDOW)
            .map(Event::Frames);
        let events = ticks.merge(frames);
        tokio::pin!(events);

        info!(
            slot_duration_ms = clock.slot_duration().as_millis() as u64,
            epoch_length = clock.epoch_length(),
            "Consensus runtime started"
        );
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received");
                        return Ok(());
                    }
                }
                event = events.next() => match event {
                    Some(Event::Tick) => driver.on_tick().await?,
                    Some(Event::Frames(frames)) => driver.on_frames(frames).await?,
                    None => {
                        info!("Event stream closed");
                        return Ok(());
                    }
                },
            }
        }
    }
}

struct Driver<A: ConsensusApi> {
    api: Arc<A>,
    clock: SlotClock,
    genesis_time: Instant,
    started_slot: Option<Slot>,
    attested_slot: Option<Slot>,
}

impl<A: ConsensusApi> Driver<A> {
    async fn on_tick(&mut self) -> ConsensusResult<()> {
        let elapsed = Instant::now().saturating_duration_since(self.genesis_time);
        let (slot, phase) = self.clock.position(elapsed);

        if self.started_slot.map_or(true, |s| s < slot) {
            self.started_slot = Some(slot);
            match self.api.on_slot_start(slot).await {
                Ok(report) => debug!(
                    slot,
                    proposed = report.proposed.is_some(),
                    epochs_closed = report.epochs_closed.len(),
                    "Slot started"
                ),
                Err(e) => check(e)?,
            }
        }
        if phase == SlotPhase::Attest && self.attested_slot.map_or(true, |s| s < slot) {
            self.attested_slot = Some(slot);
            if let Err(e) = self.api.on_attestation_due(slot).await {
                check(e)?;
            }
        }
        Ok(())
    }

    async fn on_frames(&mut self, frames: Vec<InboundFrame>) -> ConsensusResult<()> {
        let mut attestations = Vec::new();
        for frame in frames {
            let message = match NetworkMessage::decode(&frame.bytes) {
                Ok(message) => message,
                Err(e) => {
                    metrics::record_message_dropped("malformed");
                    warn!(peer = %frame.peer, error = %e, "Dropping malformed frame");
                    continue;
                }
            };
            match message {
                NetworkMessage::Attestation(attestation) => {
                    attestations.push((attestation, frame.peer))
                }
                other => {
                    let kind = other.kind();
                    match self.api.handle_message(other, frame.peer).await {
                        Ok(outcome) => debug!(kind = kind.as_str(), ?outcome, "Message handled"),
                        Err(e) => {
                            debug!(kind = kind.as_str(), peer = %frame.peer, error = %e, "Message rejected");
                            check(e)?;
                        }
                    }
                }
            }
        }
        if !attestations.is_empty() {
            for result in self.api.handle_attestations(attestations).await {
                if let Err(e) = result {
                    check(e)?;
                }
            }
        }
        Ok(())
    }
}

/// Propagate fatal errors; everything else was already logged and dropped.
fn check(e: ConsensusError) -> ConsensusResult<()> {
    if e.is_fatal() {
        error!(error = %e, "Consensus halted, stopping runtime");
        return Err(e);
    }
    Ok(())
}
