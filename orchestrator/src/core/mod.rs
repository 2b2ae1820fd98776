//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod dedup;
pub mod fingerprint;
pub mod metrics;
pub mod priority;
pub mod schedule;
pub mod similarity;
pub mod types;
