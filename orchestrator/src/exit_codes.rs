//! Stable exit codes for orchestrator CLI commands.

/// Command succeeded; for `run`, the queue was exhausted or the objective was met.
pub const OK: i32 = 0;
/// Invalid config, missing snapshot, misconfigured operators or other errors.
pub const INVALID: i32 = 1;
/// `orchestrator run` stopped on a stalled queue.
pub const STALLED: i32 = 3;
/// `orchestrator run` reached `--max-iterations`.
pub const ITERATION_BUDGET: i32 = 4;
/// `orchestrator run` was cancelled.
pub const CANCELLED: i32 = 5;
