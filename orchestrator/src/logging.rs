//! Development-time tracing for debugging the orchestrator.
//!
//! Diagnostics go to stderr via `RUST_LOG` and are never persisted. Run
//! artifacts (`task_history.json` and friends) are written by
//! [`crate::io::snapshot`] regardless of the filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `warn` if unset.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=orchestrator=debug orchestrator run --objective "build a login page"
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
