//! # PoC-Chain Test Suite
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! ├── harness.rs        # In-memory multi-validator simulation
//! └── integration/      # Whole-network properties and scenarios
//!     ├── safety.rs
//!     ├── liveness.rs
//!     ├── determinism.rs
//!     ├── idempotence.rs
//!     ├── slashing.rs
//!     └── scenarios.rs
//!
//! benches/              # Criterion benchmarks for the hot paths
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! # All tests
//! cargo test -p poc-tests
//!
//! # By category
//! cargo test -p poc-tests integration::safety
//! cargo test -p poc-tests integration::scenarios
//!
//! # With logs
//! POC_LOG_LEVEL=poc_consensus=debug cargo test -p poc-tests -- --nocapture
//!
//! # Benchmarks
//! cargo bench -p poc-tests
//! ```

pub mod harness;
pub mod integration;
