//! The orchestration loop: prioritize, dispatch one task, record, re-create.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::cache::Cache;
use crate::context::ContextManager;
use crate::core::dedup::{DuplicateTaskError, KnownTasks};
use crate::core::metrics::PerformanceMetrics;
use crate::core::schedule::{ResolvedSet, Selection, StalledQueueError, select_next};
use crate::core::types::{
    HistoryEntry, Task, TaskDraft, TaskKind, TaskMetadata, TaskResult, new_task_id,
};
use crate::io::config::{OrchestratorConfig, resolve_path};
use crate::io::snapshot::{JsonSnapshotStore, RunSnapshot, SnapshotStore};
use crate::llm::Generator;
use crate::operators::{ContextBundle, Operator, OperatorKind, OperatorRegistry, OperatorServices};

/// Name of the creation-type task that seeds every fresh run.
pub const INITIAL_TASK_NAME: &str = "Plan objective";

/// Cooperative cancellation flag, checked between iterations.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Reason why [`TaskManager::run`] stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStop {
    /// The queue is empty.
    Exhausted,
    /// Tasks remain but every one waits on a dependency that has not succeeded.
    Stalled(StalledQueueError),
    /// The run dispatched `max_iterations` tasks.
    IterationBudget { max_iterations: u32 },
    /// The stop signal was raised.
    Cancelled,
    /// The evaluation operator judged the objective met.
    ObjectiveAchieved { analysis: String },
}

/// Summary of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    /// Complete history, including entries restored by [`TaskManager::resume`].
    pub history: Vec<HistoryEntry>,
    pub iterations: u32,
    pub stop: RunStop,
}

/// Owns the queue and history and drives operators over them.
pub struct TaskManager {
    registry: OperatorRegistry,
    context: Arc<ContextManager>,
    snapshots: Option<Box<dyn SnapshotStore>>,
    objective: String,
    queue: Vec<Task>,
    history: Vec<HistoryEntry>,
    known: KnownTasks,
    resolved: ResolvedSet,
    history_window: usize,
    similar_k: usize,
    stop: StopSignal,
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("registry", &self.registry)
            .field("pending", &self.queue.len())
            .field("history", &self.history.len())
            .finish_non_exhaustive()
    }
}

impl TaskManager {
    pub fn new(registry: OperatorRegistry, context: Arc<ContextManager>) -> Self {
        Self {
            registry,
            context,
            snapshots: None,
            objective: String::new(),
            queue: Vec::new(),
            history: Vec::new(),
            known: KnownTasks::default(),
            resolved: ResolvedSet::default(),
            history_window: 5,
            similar_k: 3,
            stop: StopSignal::default(),
        }
    }

    /// Wire the standard operators, cache, context and snapshot store from config.
    ///
    /// Relative paths in `config` resolve against `base_dir`.
    pub fn from_config(
        config: &OrchestratorConfig,
        generator: Arc<dyn Generator>,
        base_dir: &Path,
    ) -> Result<Self> {
        config.validate()?;
        let cache = Cache::from_config(&config.cache, base_dir).context("build cache")?;
        let services = OperatorServices::new(generator, cache.clone())?
            .with_retry(config.retry.clone())
            .with_prompt_budget(config.prompt_budget_bytes)?;
        let registry = if config.evaluate_completion {
            OperatorRegistry::with_evaluation(&services)?
        } else {
            OperatorRegistry::standard(&services)?
        };
        let context = Arc::new(
            ContextManager::from_config(&config.context, Some(cache)).context("build embedder")?,
        );
        let store = JsonSnapshotStore::new(resolve_path(base_dir, &config.persistence.dir));

        Ok(Self::new(registry, context)
            .with_snapshots(Box::new(store))
            .with_history_window(config.history_window)
            .with_similar_k(config.similar_k))
    }

    pub fn with_snapshots(mut self, store: Box<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(store);
        self
    }

    pub fn with_history_window(mut self, window: usize) -> Self {
        self.history_window = window;
        self
    }

    pub fn with_similar_k(mut self, k: usize) -> Self {
        self.similar_k = k;
        self
    }

    /// Register `operator`, replacing the current operator of its kind.
    pub fn add_operator(&mut self, operator: Box<dyn Operator>) {
        self.registry.register(operator);
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn pending(&self) -> &[Task] {
        &self.queue
    }

    pub fn metrics(&self) -> PerformanceMetrics {
        PerformanceMetrics::from_history(&self.history, self.queue.len())
    }

    /// Seed the queue with the creation-type task that plans `objective`.
    pub fn create_initial_task(&mut self, objective: &str) -> Result<Task> {
        self.objective = objective.trim().to_string();
        let task = Task {
            id: new_task_id(),
            name: INITIAL_TASK_NAME.to_string(),
            description: self.objective.clone(),
            priority: 0,
            dependencies: Vec::new(),
            metadata: TaskMetadata {
                task_type: TaskKind::Creation,
                ..TaskMetadata::default()
            },
        };
        self.enqueue(task.clone())?;
        Ok(task)
    }

    /// Append `task` unless a task with the same name and dependencies was already seen.
    pub fn enqueue(&mut self, task: Task) -> Result<(), DuplicateTaskError> {
        self.known.admit(&task)?;
        self.queue.push(task);
        Ok(())
    }

    /// Restore queue and history from a snapshot and re-index the context corpus.
    pub fn resume(&mut self, snapshot: RunSnapshot) -> Result<()> {
        self.context
            .rebuild(&snapshot.history)
            .context("re-index restored history")?;
        self.known = KnownTasks::from_tasks(
            snapshot
                .pending
                .iter()
                .chain(snapshot.history.iter().map(|e| &e.task)),
        );
        self.resolved = ResolvedSet::from_history(&snapshot.history);
        if self.objective.is_empty()
            && let Some(plan) = snapshot
                .history
                .iter()
                .map(|e| &e.task)
                .chain(snapshot.pending.iter())
                .find(|t| t.is_creation())
        {
            self.objective = plan.description.clone();
        }
        info!(
            history = snapshot.history.len(),
            pending = snapshot.pending.len(),
            "resumed run"
        );
        self.history = snapshot.history;
        self.queue = snapshot.pending;
        Ok(())
    }

    /// Run until the queue is exhausted, stalls, hits `max_iterations`, is
    /// cancelled, or the evaluation operator (when registered) reports the
    /// objective met.
    ///
    /// Every stop reason is a normal outcome; `Err` means a required operator
    /// is missing.
    #[instrument(skip_all, fields(max_iterations = max_iterations))]
    pub fn run(&mut self, objective: &str, max_iterations: u32) -> Result<RunOutcome> {
        for kind in [
            OperatorKind::Creation,
            OperatorKind::Prioritization,
            OperatorKind::Execution,
        ] {
            self.registry.require(kind)?;
        }

        if self.queue.is_empty() && self.history.is_empty() {
            self.create_initial_task(objective)?;
        } else {
            self.objective = objective.trim().to_string();
        }

        let mut iterations = 0u32;
        let stop = loop {
            if self.stop.is_raised() {
                break RunStop::Cancelled;
            }
            if self.queue.is_empty() {
                break RunStop::Exhausted;
            }
            if iterations >= max_iterations {
                break RunStop::IterationBudget { max_iterations };
            }

            self.prioritize();
            let idx = match select_next(&self.queue, &self.resolved) {
                Selection::Dispatch(idx) => idx,
                Selection::Stalled(err) => {
                    warn!(blocked = err.blocked.len(), "queue stalled");
                    break RunStop::Stalled(err);
                }
                Selection::Empty => break RunStop::Exhausted,
            };

            let task = self.queue.remove(idx);
            self.dispatch(task)?;
            iterations += 1;
            self.persist();

            if let Some(analysis) = self.objective_achieved() {
                break RunStop::ObjectiveAchieved { analysis };
            }
        };

        info!(iterations, history = self.history.len(), stop = ?stop, "run stopped");
        Ok(RunOutcome {
            history: self.history.clone(),
            iterations,
            stop,
        })
    }

    /// Apply fresh priorities to the whole queue. Failures keep the previous order.
    fn prioritize(&mut self) {
        let anchor = self.queue[0].clone();
        let bundle = self.bundle(&anchor, None, false);
        let assignments = match self
            .registry
            .require(OperatorKind::Prioritization)
            .and_then(|op| op.run(&anchor, &bundle))
            .and_then(|result| result.into_priorities())
        {
            Ok(assignments) => assignments,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "prioritization failed, keeping previous priorities");
                return;
            }
        };
        for assignment in assignments {
            if let Some(task) = self.queue.iter_mut().find(|t| t.id == assignment.task_id) {
                task.priority = assignment.priority;
                task.metadata.prioritization_reason = Some(assignment.rationale);
            }
        }
    }

    /// Ask the evaluation operator, if any, whether the objective is met.
    /// Only asked after a successful entry; errors count as "not yet".
    fn objective_achieved(&self) -> Option<String> {
        let op = self.registry.get(OperatorKind::Evaluation)?;
        let last = self.history.last().filter(|e| e.result.is_success())?;
        let bundle = ContextBundle {
            objective: self.objective.clone(),
            recent_history: self.history.clone(),
            pending: self.queue.clone(),
            completed: self.history.iter().map(|e| e.task.clone()).collect(),
            resolved: self.resolved.clone(),
            ..ContextBundle::default()
        };
        match op.run(&last.task, &bundle).and_then(|r| r.into_evaluation()) {
            Ok(evaluation) if evaluation.achieved => {
                info!(analysis = %evaluation.analysis, "objective achieved");
                Some(evaluation.analysis)
            }
            Ok(_) => None,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "evaluation operator errored");
                None
            }
        }
    }

    #[instrument(skip_all, fields(task_id = %task.id, task = %task.name))]
    fn dispatch(&mut self, task: Task) -> Result<()> {
        if task.is_creation() {
            let (drafts, operator) = self.create(&task, None)?;
            let result = match drafts {
                Ok(drafts) => {
                    let created = self.admit_drafts(drafts);
                    TaskResult::success(if created.is_empty() {
                        "created no new tasks".to_string()
                    } else {
                        format!("created {} task(s): {}", created.len(), created.join(", "))
                    })
                }
                Err(err) => TaskResult::failure(format!("{err:#}")),
            };
            self.record(HistoryEntry::new(task, result, operator));
            return Ok(());
        }

        let bundle = self.bundle(&task, None, true);
        let (result, operator) = {
            let op = self.registry.require(OperatorKind::Execution)?;
            let result = match op.run(&task, &bundle).and_then(|r| r.into_execution()) {
                Ok(result) => result,
                Err(err) => {
                    warn!(err = %format!("{err:#}"), "execution operator errored");
                    TaskResult::failure(format!("execution error: {err:#}"))
                }
            };
            (result, op.name().to_string())
        };
        let succeeded = result.is_success();
        self.record(HistoryEntry::new(task.clone(), result.clone(), operator));

        if succeeded && let (Ok(drafts), _) = self.create(&task, Some(result))? {
            self.admit_drafts(drafts);
        }
        Ok(())
    }

    /// Run the creation operator for `task`.
    ///
    /// The outer `Err` is a missing operator; the inner one is the operator's
    /// own failure, which callers either record or treat as no proposals.
    fn create(
        &self,
        task: &Task,
        result: Option<TaskResult>,
    ) -> Result<(Result<Vec<TaskDraft>>, String)> {
        let bundle = self.bundle(task, result, true);
        let op = self.registry.require(OperatorKind::Creation)?;
        let drafts = op.run(task, &bundle).and_then(|r| r.into_new_tasks());
        if let Err(err) = &drafts {
            warn!(err = %format!("{err:#}"), "creation operator errored");
        }
        Ok((drafts, op.name().to_string()))
    }

    /// Enqueue drafts under fresh ids; duplicates are dropped. Returns accepted names.
    fn admit_drafts(&mut self, drafts: Vec<TaskDraft>) -> Vec<String> {
        let mut accepted = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let task = Task::from_draft(new_task_id(), draft);
            let name = task.name.clone();
            match self.enqueue(task) {
                Ok(()) => accepted.push(name),
                Err(err) => debug!(err = %err, "suppressed duplicate task"),
            }
        }
        accepted
    }

    fn record(&mut self, entry: HistoryEntry) {
        if entry.result.is_success() {
            self.resolved.insert(&entry.task);
        }
        if let Err(err) = self.context.add(entry.clone()) {
            warn!(err = %format!("{err:#}"), "failed to index history entry");
        }
        info!(
            task = %entry.task.name,
            status = entry.result.status.as_str(),
            operator = %entry.operator,
            "recorded result"
        );
        self.history.push(entry);
    }

    fn bundle(&self, task: &Task, last_result: Option<TaskResult>, with_similar: bool) -> ContextBundle {
        let start = self.history.len().saturating_sub(self.history_window);
        let similar = if with_similar {
            self.similar_to(task)
        } else {
            Vec::new()
        };
        ContextBundle {
            objective: self.objective.clone(),
            recent_history: self.history[start..].to_vec(),
            similar,
            pending: self.queue.clone(),
            completed: self.history.iter().map(|e| e.task.clone()).collect(),
            resolved: self.resolved.clone(),
            last_result,
        }
    }

    /// Top-K similar history entries, excluding the task's own entries.
    fn similar_to(&self, task: &Task) -> Vec<HistoryEntry> {
        if self.similar_k == 0 {
            return Vec::new();
        }
        let query = format!("{}\n{}", task.name, task.description);
        match self.context.query(&query, self.similar_k + 1) {
            Ok(entries) => entries
                .into_iter()
                .filter(|e| e.task.id != task.id)
                .take(self.similar_k)
                .collect(),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "context query failed");
                Vec::new()
            }
        }
    }

    fn persist(&self) {
        let Some(store) = &self.snapshots else {
            return;
        };
        if let Err(err) = store.save(&self.history, &self.queue, &self.metrics()) {
            warn!(err = %format!("{err:#}"), "failed to write snapshot");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedGenerator, scripted_manager, task, task_with_deps};
    use serde_json::json;

    #[test]
    fn enqueue_rejects_same_name_and_dependencies() {
        let generator = Arc::new(ScriptedGenerator::new());
        let mut manager = scripted_manager(generator);
        manager
            .enqueue(task_with_deps("a", "implement endpoint", &["design schema"]))
            .expect("first");
        let err = manager
            .enqueue(task_with_deps("b", "Implement endpoint", &["design schema"]))
            .unwrap_err();
        assert_eq!(err.name, "Implement endpoint");
        assert_eq!(manager.pending().len(), 1);
    }

    #[test]
    fn raised_signal_cancels_before_dispatch() {
        let generator = Arc::new(ScriptedGenerator::new());
        let mut manager = scripted_manager(generator.clone());
        manager.stop_signal().raise();
        let outcome = manager.run("build a login page", 10).expect("run");
        assert_eq!(outcome.stop, RunStop::Cancelled);
        assert!(outcome.history.is_empty());
        assert_eq!(manager.pending()[0].name, INITIAL_TASK_NAME);
        assert_eq!(generator.total_calls(), 0);
    }

    #[test]
    fn creation_task_records_created_names() {
        let generator = Arc::new(ScriptedGenerator::new());
        generator.push(
            "creation_output",
            crate::test_support::creation_output(&[("design schema", &[])]),
        );
        generator.fallback("creation_output", json!({"tasks": []}));
        let mut manager = scripted_manager(generator);
        let outcome = manager.run("build a login page", 1).expect("run");

        assert_eq!(outcome.stop, RunStop::IterationBudget { max_iterations: 1 });
        let entry = &outcome.history[0];
        assert_eq!(entry.operator, "creation");
        assert!(entry.result.is_success());
        assert_eq!(entry.result.output, "created 1 task(s): design schema");
        assert_eq!(manager.pending()[0].name, "design schema");
    }

    #[test]
    fn failed_planning_is_recorded_as_failure() {
        let generator = Arc::new(ScriptedGenerator::new());
        generator.push_err(
            "creation_output",
            crate::llm::InvocationError::Transport("model down".into()),
        );
        let mut manager = scripted_manager(generator);
        let outcome = manager.run("build a login page", 10).expect("run");

        assert_eq!(outcome.stop, RunStop::Exhausted);
        assert_eq!(outcome.history.len(), 1);
        let entry = &outcome.history[0];
        assert_eq!(entry.task.name, INITIAL_TASK_NAME);
        assert!(!entry.result.is_success());
        assert!(entry.result.output.contains("model down"));
        assert_eq!(manager.metrics().success_rate, 0.0);
    }

    #[test]
    fn missing_operator_is_an_error() {
        let context = Arc::new(ContextManager::new(Arc::new(
            crate::context::HashingEmbedder::new(32),
        )));
        let mut manager = TaskManager::new(OperatorRegistry::new(), context);
        let err = manager.run("anything", 3).unwrap_err();
        assert!(err.to_string().contains("no creation operator registered"));
    }

    #[test]
    fn resume_restores_objective_and_known_tasks() {
        let generator = Arc::new(ScriptedGenerator::new());
        let mut manager = scripted_manager(generator);
        let mut plan = task("p", INITIAL_TASK_NAME);
        plan.description = "build a login page".to_string();
        plan.metadata.task_type = TaskKind::Creation;
        let snapshot = RunSnapshot {
            history: vec![HistoryEntry::new(plan, TaskResult::success("created"), "creation")],
            pending: vec![task("d", "design schema")],
            metrics: PerformanceMetrics::default(),
        };
        manager.resume(snapshot).expect("resume");

        assert_eq!(manager.objective, "build a login page");
        assert!(manager.enqueue(task("d2", "design schema")).is_err());
        assert_eq!(manager.metrics().total_tasks, 1);
        assert_eq!(manager.metrics().pending_tasks, 1);
    }
}
