//! # Adapters Layer (Hexagonal Architecture)
//!
//! In-process implementations of the outbound ports, used by the test
//! harness and by single-process deployments.

mod execution;
mod network;
mod store;

pub use execution::HashChainExecution;
pub use network::RecordingNetwork;
pub use store::InMemoryConsensusStore;
