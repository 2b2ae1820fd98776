//! Orchestrator configuration stored under `.orchestrator/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::context::ContextConfig;
use crate::io::write_atomic;
use crate::llm::retry::RetryPolicy;
use crate::operators::DEFAULT_PROMPT_BUDGET_BYTES;

/// Directory holding config, cache and snapshots, relative to the workspace.
pub const ORCHESTRATOR_DIR: &str = ".orchestrator";
pub const CONFIG_FILE: &str = "config.toml";

/// Orchestrator configuration (TOML).
///
/// Meant to be edited by hand. Missing fields fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Iterations a single `run` may take before stopping with an iteration budget outcome.
    pub max_iterations: u32,
    /// Most recent history entries shown to operators.
    pub history_window: usize,
    /// Similar past entries retrieved per operator call.
    pub similar_k: usize,
    /// Upper bound on rendered prompt size.
    pub prompt_budget_bytes: usize,
    /// Ask the model after each successful iteration whether the objective is met.
    pub evaluate_completion: bool,
    pub retry: RetryPolicy,
    pub cache: CacheConfig,
    pub context: ContextConfig,
    pub generator: GeneratorConfig,
    pub persistence: PersistenceConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            history_window: 5,
            similar_k: 3,
            prompt_budget_bytes: DEFAULT_PROMPT_BUDGET_BYTES,
            evaluate_completion: false,
            retry: RetryPolicy::default(),
            cache: CacheConfig::default(),
            context: ContextConfig::default(),
            generator: GeneratorConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

/// `[generator]`: the external command answering model calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Program and arguments. Receives `{"prompt", "response_schema"}` on stdin.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    /// Stdout beyond this many bytes fails the call.
    pub output_limit_bytes: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            command: vec!["llm-generate".to_string()],
            timeout_secs: 5 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

/// `[persistence]`: where run snapshots are written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Snapshot directory, relative to `.orchestrator/` unless absolute.
    pub dir: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("state"),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("prompt_budget_bytes must be > 0"));
        }
        if self.generator.command.is_empty() || self.generator.command[0].trim().is_empty() {
            return Err(anyhow!("generator.command must be a non-empty array"));
        }
        if self.generator.timeout_secs == 0 {
            return Err(anyhow!("generator.timeout_secs must be > 0"));
        }
        if self.generator.output_limit_bytes == 0 {
            return Err(anyhow!("generator.output_limit_bytes must be > 0"));
        }
        if self.persistence.dir.as_os_str().is_empty() {
            return Err(anyhow!("persistence.dir must not be empty"));
        }
        self.retry.validate()?;
        self.cache.validate()?;
        self.context.validate()?;
        Ok(())
    }
}

/// Resolve `path` against `base` unless it is already absolute.
pub fn resolve_path(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OrchestratorConfig::default()`.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    if !path.exists() {
        let cfg = OrchestratorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: OrchestratorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &OrchestratorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BackendConfig;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, OrchestratorConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(CONFIG_FILE);
        let mut cfg = OrchestratorConfig::default();
        cfg.cache.backend = BackendConfig::Remote {
            base_url: "http://cache.internal:8080".to_string(),
            prefix: "orch/".to_string(),
            timeout_secs: 3,
        };
        cfg.context.min_score = 0.25;
        cfg.evaluate_completion = true;
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(CONFIG_FILE);
        fs::write(
            &path,
            "max_iterations = 3\n\n[generator]\ncommand = [\"sh\", \"gen.sh\"]\n\n[cache.backend]\nkind = \"memory\"\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_iterations, 3);
        assert_eq!(cfg.generator.command, vec!["sh", "gen.sh"]);
        assert_eq!(cfg.generator.timeout_secs, 300);
        assert_eq!(cfg.cache.backend, BackendConfig::Memory);
        assert_eq!(cfg.retry, RetryPolicy::default());
    }

    #[test]
    fn rejects_invalid_values() {
        let mut cfg = OrchestratorConfig::default();
        cfg.generator.command.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = OrchestratorConfig::default();
        cfg.retry.max_attempts = 0;
        assert!(cfg.validate().is_err());
    }
}
