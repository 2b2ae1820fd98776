//! Self-improving task orchestrator CLI.
//!
//! Keeps its config, cache and run snapshots under `.orchestrator/` in the
//! current directory. Model calls go through an external command configured
//! in `.orchestrator/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use orchestrator::exit_codes;
use orchestrator::io::config::{
    CONFIG_FILE, ORCHESTRATOR_DIR, OrchestratorConfig, load_config, resolve_path, write_config,
};
use orchestrator::io::snapshot::{JsonSnapshotStore, SnapshotStore};
use orchestrator::llm::command::CommandGenerator;
use orchestrator::logging;
use orchestrator::manager::{RunOutcome, RunStop, StopSignal, TaskManager};
use tracing::warn;

#[derive(Parser)]
#[command(
    name = "orchestrator",
    version,
    about = "Generate, prioritize and execute tasks toward an objective"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.orchestrator/config.toml` with defaults if missing.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Run the task loop toward an objective.
    Run {
        /// What the run should accomplish.
        #[arg(long)]
        objective: String,
        /// Override `max_iterations` from the config.
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Continue from the last snapshot instead of starting fresh.
        #[arg(long)]
        resume: bool,
    },
    /// Print aggregate metrics from the last snapshot as JSON.
    Metrics,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let base = PathBuf::from(ORCHESTRATOR_DIR);
    match cli.command {
        Command::Init { force } => cmd_init(&base, force),
        Command::Run {
            objective,
            max_iterations,
            resume,
        } => cmd_run(&base, &objective, max_iterations, resume),
        Command::Metrics => cmd_metrics(&base),
    }
}

fn cmd_init(base: &Path, force: bool) -> Result<i32> {
    fs::create_dir_all(base).with_context(|| format!("create {}", base.display()))?;
    let config_path = base.join(CONFIG_FILE);
    if force || !config_path.exists() {
        write_config(&config_path, &OrchestratorConfig::default())?;
        println!("wrote {}", config_path.display());
    } else {
        println!("{} already exists", config_path.display());
    }
    Ok(exit_codes::OK)
}

fn cmd_run(base: &Path, objective: &str, max_iterations: Option<u32>, resume: bool) -> Result<i32> {
    if objective.trim().is_empty() {
        return Err(anyhow!("--objective must not be empty"));
    }
    let config = load_config(&base.join(CONFIG_FILE))?;
    let max_iterations = max_iterations.unwrap_or(config.max_iterations);

    let workdir = std::env::current_dir().context("resolve current directory")?;
    let generator = CommandGenerator::new(
        config.generator.command.clone(),
        Duration::from_secs(config.generator.timeout_secs),
        config.generator.output_limit_bytes,
    )
    .with_workdir(workdir);
    let mut manager = TaskManager::from_config(&config, Arc::new(generator), base)?;

    if resume {
        let store = snapshot_store(base, &config);
        match store.load()? {
            Some(snapshot) => manager.resume(snapshot)?,
            None => eprintln!(
                "no snapshot in {}, starting fresh",
                store.dir().display()
            ),
        }
    }

    install_stop_handler(manager.stop_signal());
    let outcome = manager.run(objective, max_iterations)?;
    print_outcome(&outcome);
    Ok(exit_code(&outcome.stop))
}

/// Ctrl-C finishes the task in flight, saves the snapshot and exits with `CANCELLED`.
fn install_stop_handler(signal: StopSignal) {
    let result = ctrlc::set_handler(move || {
        if !signal.is_raised() {
            eprintln!("interrupt received, stopping after the current task");
        }
        signal.raise();
    });
    if let Err(err) = result {
        warn!(err = %err, "failed to install interrupt handler");
    }
}

fn cmd_metrics(base: &Path) -> Result<i32> {
    let config = load_config(&base.join(CONFIG_FILE))?;
    let store = snapshot_store(base, &config);
    let snapshot = store.load()?.ok_or_else(|| {
        anyhow!(
            "no snapshot in {} (run `orchestrator run` first)",
            store.dir().display()
        )
    })?;
    let mut payload =
        serde_json::to_string_pretty(&snapshot.metrics).context("serialize metrics")?;
    payload.push('\n');
    print!("{payload}");
    Ok(exit_codes::OK)
}

fn snapshot_store(base: &Path, config: &OrchestratorConfig) -> JsonSnapshotStore {
    JsonSnapshotStore::new(resolve_path(base, &config.persistence.dir))
}

fn print_outcome(outcome: &RunOutcome) {
    for entry in &outcome.history {
        println!(
            "[{}] {} ({})",
            entry.result.status.as_str(),
            entry.task.name,
            entry.operator
        );
    }
    match &outcome.stop {
        RunStop::Exhausted => println!("done: no tasks remain"),
        RunStop::Stalled(err) => {
            println!("stopped: {err}");
            for blocked in &err.blocked {
                println!(
                    "  {} waits on: {}",
                    blocked.name,
                    blocked.unresolved.join(", ")
                );
            }
        }
        RunStop::IterationBudget { max_iterations } => {
            println!("stopped: reached max iterations ({max_iterations})");
        }
        RunStop::Cancelled => println!("stopped: cancelled"),
        RunStop::ObjectiveAchieved { analysis } => {
            println!("done: objective achieved");
            if !analysis.trim().is_empty() {
                println!("  {}", analysis.trim());
            }
        }
    }
}

fn exit_code(stop: &RunStop) -> i32 {
    match stop {
        RunStop::Exhausted | RunStop::ObjectiveAchieved { .. } => exit_codes::OK,
        RunStop::Stalled(_) => exit_codes::STALLED,
        RunStop::IterationBudget { .. } => exit_codes::ITERATION_BUDGET,
        RunStop::Cancelled => exit_codes::CANCELLED,
    }
}
