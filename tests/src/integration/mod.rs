//! # Integration Tests
//!
//! Network-level properties checked on the in-memory simulation.

pub mod determinism;
pub mod idempotence;
pub mod liveness;
pub mod safety;
pub mod scenarios;
pub mod slashing;
