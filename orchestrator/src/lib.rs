//! Self-improving task orchestrator.
//!
//! Given an objective, the orchestrator generates tasks, orders them by their
//! declared dependencies, executes them one at a time, and feeds successful
//! results back into task generation until nothing actionable remains. The
//! crate keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (task model, fingerprints,
//!   dependency resolution, topological ordering, metrics). No I/O.
//! - **[`llm`]**: The single model-invocation boundary ([`llm::Generator`]),
//!   its error taxonomy, retry policy and response validation.
//! - **[`cache`]** and **[`context`]**: Shared services that deduplicate
//!   expensive calls and retrieve similar history.
//! - **[`operators`]**: Creation, prioritization, execution and optional
//!   objective-evaluation units behind a common [`operators::Operator`] trait.
//! - **[`io`]**: Side-effecting helpers (config, snapshots, child processes).
//!
//! [`manager::TaskManager`] drives the loop.

pub mod cache;
pub mod context;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod llm;
pub mod logging;
pub mod manager;
pub mod operators;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
