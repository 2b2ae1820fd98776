//! Persisted run artifacts: `task_history.json`, `current_tasks.json` and
//! `performance_metrics.json`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::core::metrics::PerformanceMetrics;
use crate::core::types::{HistoryEntry, Task};
use crate::io::write_atomic;

pub const HISTORY_FILE: &str = "task_history.json";
pub const TASKS_FILE: &str = "current_tasks.json";
pub const METRICS_FILE: &str = "performance_metrics.json";

/// Queue and history restored from disk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSnapshot {
    pub history: Vec<HistoryEntry>,
    pub pending: Vec<Task>,
    pub metrics: PerformanceMetrics,
}

/// Where the manager persists its state after each iteration.
pub trait SnapshotStore: Send + Sync {
    fn save(
        &self,
        history: &[HistoryEntry],
        pending: &[Task],
        metrics: &PerformanceMetrics,
    ) -> Result<()>;

    /// `None` when nothing has been saved yet.
    fn load(&self) -> Result<Option<RunSnapshot>>;
}

/// Pretty-printed JSON files in one directory, each replaced atomically.
#[derive(Debug, Clone)]
pub struct JsonSnapshotStore {
    dir: PathBuf,
}

impl JsonSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write_json<T: Serialize + ?Sized>(&self, file: &str, value: &T) -> Result<()> {
        let path = self.dir.join(file);
        let mut buf =
            serde_json::to_string_pretty(value).with_context(|| format!("serialize {file}"))?;
        buf.push('\n');
        write_atomic(&path, buf.as_bytes())
    }

    fn read_json<T: DeserializeOwned>(&self, file: &str) -> Result<Option<T>> {
        let path = self.dir.join(file);
        if !path.exists() {
            return Ok(None);
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        let value =
            serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
        Ok(Some(value))
    }
}

impl SnapshotStore for JsonSnapshotStore {
    fn save(
        &self,
        history: &[HistoryEntry],
        pending: &[Task],
        metrics: &PerformanceMetrics,
    ) -> Result<()> {
        debug!(
            dir = %self.dir.display(),
            history = history.len(),
            pending = pending.len(),
            "writing snapshot"
        );
        self.write_json(HISTORY_FILE, history)?;
        self.write_json(TASKS_FILE, pending)?;
        self.write_json(METRICS_FILE, metrics)?;
        Ok(())
    }

    fn load(&self) -> Result<Option<RunSnapshot>> {
        let Some(history) = self.read_json::<Vec<HistoryEntry>>(HISTORY_FILE)? else {
            return Ok(None);
        };
        let pending = self
            .read_json::<Vec<Task>>(TASKS_FILE)?
            .unwrap_or_default();
        let metrics = match self.read_json::<PerformanceMetrics>(METRICS_FILE)? {
            Some(metrics) => metrics,
            None => PerformanceMetrics::from_history(&history, pending.len()),
        };
        debug!(history = history.len(), pending = pending.len(), "snapshot loaded");
        Ok(Some(RunSnapshot {
            history,
            pending,
            metrics,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TaskResult;
    use crate::test_support::{task, task_with_deps};

    #[test]
    fn save_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = JsonSnapshotStore::new(temp.path().join("state"));
        let history = vec![HistoryEntry::new(
            task("t1", "design schema"),
            TaskResult::success("users table"),
            "execution",
        )];
        let pending = vec![task_with_deps("t2", "implement endpoint", &["design schema"])];
        let metrics = PerformanceMetrics::from_history(&history, pending.len());

        store.save(&history, &pending, &metrics).expect("save");
        let loaded = store.load().expect("load").expect("snapshot");
        assert_eq!(loaded.history, history);
        assert_eq!(loaded.pending, pending);
        assert_eq!(loaded.metrics, metrics);
    }

    #[test]
    fn empty_dir_has_no_snapshot() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = JsonSnapshotStore::new(temp.path());
        assert!(store.load().expect("load").is_none());
    }

    #[test]
    fn history_file_uses_documented_field_names() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = JsonSnapshotStore::new(temp.path());
        let history = vec![HistoryEntry::new(
            task("t1", "design schema"),
            TaskResult::success("ok"),
            "execution",
        )];
        store
            .save(&history, &[], &PerformanceMetrics::from_history(&history, 0))
            .expect("save");

        let raw: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(temp.path().join(HISTORY_FILE)).expect("read"),
        )
        .expect("parse");
        let entry = &raw[0];
        assert_eq!(entry["operator"], "execution");
        assert_eq!(entry["task"]["id"], "t1");
        assert_eq!(entry["result"]["status"], "success");
        assert!(entry["result"]["metrics"]["quality_score"].is_number());
    }
}
