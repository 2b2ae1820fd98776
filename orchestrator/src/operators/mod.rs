//! The three task operators and the registry the manager dispatches through.
//!
//! Every operator implements [`Operator::run`] over a task and a
//! [`ContextBundle`]. Model access, caching and prompt rendering come from a
//! shared [`OperatorServices`] so operators hold no global state.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use serde_json::Value;

use crate::cache::Cache;
use crate::core::schedule::ResolvedSet;
use crate::core::types::{HistoryEntry, Task, TaskDraft, TaskResult};
use crate::llm::retry::RetryPolicy;
use crate::llm::{Generator, InvocationError};

pub mod creation;
pub mod evaluation;
pub mod execution;
pub mod prioritization;
pub mod prompt;

pub use creation::{CreationFailed, CreationOperator};
pub use evaluation::{EvaluationOperator, ObjectiveEvaluation};
pub use execution::ExecutionOperator;
pub use prioritization::PrioritizationOperator;
pub use prompt::{PromptEngine, PromptTemplate};

/// Default prompt size limit in bytes.
pub const DEFAULT_PROMPT_BUDGET_BYTES: usize = 24_000;

/// Which stage of the loop an operator serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatorKind {
    Creation,
    Prioritization,
    Execution,
    /// Optional objective-completion check after each iteration.
    Evaluation,
}

impl OperatorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperatorKind::Creation => "creation",
            OperatorKind::Prioritization => "prioritization",
            OperatorKind::Execution => "execution",
            OperatorKind::Evaluation => "evaluation",
        }
    }
}

impl fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority the prioritization operator assigns to one pending task.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorityAssignment {
    pub task_id: String,
    pub priority: u32,
    pub rationale: String,
}

/// What an operator produced.
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorResult {
    NewTasks(Vec<TaskDraft>),
    Execution(TaskResult),
    Priorities(Vec<PriorityAssignment>),
    Evaluation(ObjectiveEvaluation),
}

impl OperatorResult {
    fn variant(&self) -> &'static str {
        match self {
            OperatorResult::NewTasks(_) => "new tasks",
            OperatorResult::Execution(_) => "an execution result",
            OperatorResult::Priorities(_) => "priorities",
            OperatorResult::Evaluation(_) => "an evaluation",
        }
    }

    pub fn into_new_tasks(self) -> Result<Vec<TaskDraft>> {
        match self {
            OperatorResult::NewTasks(drafts) => Ok(drafts),
            other => Err(anyhow!("expected new tasks, operator returned {}", other.variant())),
        }
    }

    pub fn into_execution(self) -> Result<TaskResult> {
        match self {
            OperatorResult::Execution(result) => Ok(result),
            other => Err(anyhow!(
                "expected an execution result, operator returned {}",
                other.variant()
            )),
        }
    }

    pub fn into_priorities(self) -> Result<Vec<PriorityAssignment>> {
        match self {
            OperatorResult::Priorities(priorities) => Ok(priorities),
            other => Err(anyhow!("expected priorities, operator returned {}", other.variant())),
        }
    }

    pub fn into_evaluation(self) -> Result<ObjectiveEvaluation> {
        match self {
            OperatorResult::Evaluation(evaluation) => Ok(evaluation),
            other => Err(anyhow!("expected an evaluation, operator returned {}", other.variant())),
        }
    }
}

/// Everything an operator may look at besides the task itself.
#[derive(Debug, Clone, Default)]
pub struct ContextBundle {
    pub objective: String,
    /// Last `history_window` entries, oldest first.
    pub recent_history: Vec<HistoryEntry>,
    /// Entries most similar to the task, most similar first.
    pub similar: Vec<HistoryEntry>,
    /// The full pending queue.
    pub pending: Vec<Task>,
    /// Every task already dispatched, whatever its outcome.
    pub completed: Vec<Task>,
    pub resolved: ResolvedSet,
    /// Result of the task passed to `run`, when it has already executed.
    pub last_result: Option<TaskResult>,
}

/// A unit of the task loop.
pub trait Operator: Send + Sync {
    fn kind(&self) -> OperatorKind;

    /// Name recorded in history entries.
    fn name(&self) -> &str {
        self.kind().as_str()
    }

    fn run(&self, task: &Task, context: &ContextBundle) -> Result<OperatorResult>;
}

/// Shared model access for operators: generator, retry policy, cache and prompts.
#[derive(Clone)]
pub struct OperatorServices {
    pub generator: Arc<dyn Generator>,
    pub retry: RetryPolicy,
    pub cache: Cache,
    pub prompts: Arc<PromptEngine>,
}

impl fmt::Debug for OperatorServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorServices")
            .field("retry", &self.retry)
            .field("cache", &self.cache)
            .field("prompts", &self.prompts)
            .finish_non_exhaustive()
    }
}

impl OperatorServices {
    pub fn new(generator: Arc<dyn Generator>, cache: Cache) -> Result<Self> {
        Ok(Self {
            generator,
            retry: RetryPolicy::default(),
            cache,
            prompts: Arc::new(PromptEngine::new(DEFAULT_PROMPT_BUDGET_BYTES)?),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_prompt_budget(mut self, budget_bytes: usize) -> Result<Self> {
        self.prompts = Arc::new(PromptEngine::new(budget_bytes)?);
        Ok(self)
    }

    /// One model call under the retry policy.
    pub fn invoke(&self, prompt: &str, schema: &Value) -> Result<Value, InvocationError> {
        self.retry.invoke(self.generator.as_ref(), prompt, schema)
    }
}

/// Parse an embedded response schema.
pub(crate) fn load_schema(name: &str, raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("parse {name} response schema"))
}

/// Ordered set of operators, at most one per kind.
#[derive(Default)]
pub struct OperatorRegistry {
    operators: Vec<Box<dyn Operator>>,
}

impl fmt::Debug for OperatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.operators.iter().map(|op| op.name()))
            .finish()
    }
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creation, prioritization and execution operators over `services`.
    pub fn standard(services: &OperatorServices) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Box::new(CreationOperator::new(services.clone())?));
        registry.register(Box::new(PrioritizationOperator::new(services.clone())?));
        registry.register(Box::new(ExecutionOperator::new(services.clone())?));
        Ok(registry)
    }

    /// [`standard`](Self::standard) plus the objective-completion check.
    pub fn with_evaluation(services: &OperatorServices) -> Result<Self> {
        let mut registry = Self::standard(services)?;
        registry.register(Box::new(EvaluationOperator::new(services.clone())?));
        Ok(registry)
    }

    /// Add `operator`, replacing any registered operator of the same kind in place.
    pub fn register(&mut self, operator: Box<dyn Operator>) {
        let kind = operator.kind();
        match self.operators.iter().position(|op| op.kind() == kind) {
            Some(idx) => self.operators[idx] = operator,
            None => self.operators.push(operator),
        }
    }

    pub fn get(&self, kind: OperatorKind) -> Option<&dyn Operator> {
        self.operators
            .iter()
            .find(|op| op.kind() == kind)
            .map(|op| &**op)
    }

    /// Like [`get`](Self::get), but a missing operator is a configuration error.
    pub fn require(&self, kind: OperatorKind) -> Result<&dyn Operator> {
        self.get(kind)
            .ok_or_else(|| anyhow!("no {kind} operator registered"))
    }

    pub fn kinds(&self) -> Vec<OperatorKind> {
        self.operators.iter().map(|op| op.kind()).collect()
    }
}
