//! Task model shared by every component.
//!
//! These types are the persisted schema (`task_history.json`,
//! `current_tasks.json`), so field names must stay stable.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::core::dedup::normalize_name;

/// How the manager dispatches a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Expands the objective into new tasks (dispatched to the creation operator).
    Creation,
    /// Regular unit of work (dispatched to the execution operator).
    #[default]
    Execution,
}

/// Scheduling hints attached to a task. Never required for correctness.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    #[serde(default)]
    pub task_type: TaskKind,
    /// Estimated duration in minutes, as proposed by the creation operator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_minutes: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_resources: Vec<String>,
    /// Last rationale recorded by the prioritization operator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prioritization_reason: Option<String>,
    /// Forward-compatible fields the orchestrator does not interpret.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A unit of work with declared dependencies and a priority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Dispatch ordinal; lower values run first.
    #[serde(default)]
    pub priority: u32,
    /// Names or ids of tasks that must succeed before this one may run.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub metadata: TaskMetadata,
}

impl Task {
    /// Materialize a draft under a freshly assigned id.
    pub fn from_draft(id: String, draft: TaskDraft) -> Self {
        let mut dependencies = Vec::with_capacity(draft.dependencies.len());
        for dep in draft.dependencies {
            let dep = dep.trim().to_string();
            if !dep.is_empty() && !dependencies.contains(&dep) {
                dependencies.push(dep);
            }
        }
        Self {
            id,
            name: draft.name.trim().to_string(),
            description: draft.description.trim().to_string(),
            priority: 0,
            dependencies,
            metadata: draft.metadata,
        }
    }

    pub fn is_creation(&self) -> bool {
        self.metadata.task_type == TaskKind::Creation
    }

    /// True if `reference` names this task by id or by (normalized) name.
    pub fn is_referenced_by(&self, reference: &str) -> bool {
        let reference = reference.trim();
        self.id == reference || normalize_name(&self.name) == normalize_name(reference)
    }
}

/// Generate a task id that is never reused.
pub fn new_task_id() -> String {
    format!("task-{}", Uuid::new_v4())
}

/// A task proposed by the creation operator, before an id is assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDraft {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub metadata: TaskMetadata,
}

impl TaskDraft {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            dependencies: Vec::new(),
            metadata: TaskMetadata::default(),
        }
    }

    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }
}

/// Outcome classification of an execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Success,
    Failure,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Success => "success",
            TaskStatus::Failure => "failure",
            TaskStatus::Skipped => "skipped",
        }
    }
}

/// Coarse resource class reported alongside a result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceUsage {
    Low,
    Medium,
    High,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultMetrics {
    #[serde(default)]
    pub execution_time_secs: f64,
    #[serde(default)]
    pub resource_usage: ResourceUsage,
    /// Quality in `[0, 1]`.
    #[serde(default)]
    pub quality_score: f64,
}

/// Suggested follow-up action, consumed by the creation operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextStep {
    pub action: String,
    #[serde(default)]
    pub reason: String,
}

/// Outcome of one execution attempt. Never mutated once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub status: TaskStatus,
    pub output: String,
    #[serde(default)]
    pub metrics: ResultMetrics,
    #[serde(default)]
    pub next_steps: Vec<NextStep>,
}

impl TaskResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Success,
            output: output.into(),
            metrics: ResultMetrics::default(),
            next_steps: Vec::new(),
        }
    }

    pub fn failure(output: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failure,
            output: output.into(),
            metrics: ResultMetrics::default(),
            next_steps: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }

    /// Clamp model-reported values into their documented ranges.
    pub fn normalized(mut self) -> Self {
        let score = self.metrics.quality_score;
        self.metrics.quality_score = if score.is_finite() {
            score.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if !self.metrics.execution_time_secs.is_finite() || self.metrics.execution_time_secs < 0.0
        {
            self.metrics.execution_time_secs = 0.0;
        }
        self
    }
}

/// Append-only audit record: which operator produced which result for which task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub task: Task,
    pub result: TaskResult,
    pub operator: String,
}

impl HistoryEntry {
    pub fn new(task: Task, result: TaskResult, operator: impl Into<String>) -> Self {
        Self {
            task,
            result,
            operator: operator.into(),
        }
    }

    /// Text used for embedding and retrieval.
    pub fn document_text(&self) -> String {
        format!(
            "{}\n{}\n{}",
            self.task.name, self.task.description, self.result.output
        )
    }
}
