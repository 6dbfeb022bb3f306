//! # poc-consensus
//!
//! Proof-of-Contribution consensus core.
//!
//! ## Architecture
//!
//! Validators earn a contribution score from stake, block production,
//! attestations and relay work. Each epoch a committee is drawn by VRF
//! ticket, weighted by that score, and proposes the epoch's blocks. Every
//! active validator casts one BLS-signed attestation per epoch; Casper FFG
//! style checkpoint links justify and finalize epoch boundary blocks, and an
//! LMD-GHOST fork choice picks the head beneath the latest justified
//! checkpoint.
//!
//! Blocks carry the tickets, votes, evidence and registry operations that
//! drive the next epoch, so committees and scores follow from the chain
//! rather than from whatever gossip a node happened to receive.
//!
//! ```text
//! ticks ─┐                         ┌─→ NetworkGateway   (gossip, peer reports)
//!        ├─→ ConsensusRuntime ─→ ConsensusService ─┼─→ ConsensusStore   (finality, scores, slashings)
//! frames ┘                         └─→ ExecutionGateway (state roots)
//! ```
//!
//! ### Single writer
//!
//! Every transition runs under one lock on the consensus state. Collaborators
//! are called after the lock is released. A broken internal invariant halts
//! the node; it then refuses all input until restarted.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use poc_consensus::{ConsensusDependencies, ConsensusService, Genesis};
//!
//! let service = ConsensusService::new(ConsensusDependencies {
//!     network,
//!     store,
//!     execution,
//!     config,
//!     genesis: Genesis::new(validators, &config.genesis_seed)?,
//!     keys: Some(keys),
//! })?;
//!
//! let report = service.on_slot_start(slot).await?;
//! ```

pub mod adapters;
pub mod config;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod ports;
pub mod runtime;
pub mod service;
mod state;

// Re-export main types
pub use adapters::{HashChainExecution, InMemoryConsensusStore, RecordingNetwork};
pub use config::{ConfigError, ConsensusConfig};
pub use domain::{
    Attestation, Block, BlockBody, CheckpointRef, NetworkMessage, Operation, ProposalMessage,
    SlashingEvidence, SlashingRecord, SlotClock, ValidatorId, ValidatorKeys, ValidatorRegistry,
    ValidatorStatus,
};
pub use error::{ConsensusError, ConsensusResult};
pub use ports::{
    ConsensusApi, ConsensusStore, ExecutionGateway, MessageOutcome, NetworkGateway, SlotReport,
};
pub use runtime::{inbound_channel, ConsensusRuntime, InboundFrame, InboundSender};
pub use service::{ConsensusDependencies, ConsensusService};
pub use state::Genesis;
