//! Test-only helpers: deterministic tasks and a scripted generator.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{Value, json};

use crate::cache::Cache;
use crate::context::{ContextManager, HashingEmbedder};
use crate::core::types::{Task, TaskMetadata};
use crate::llm::retry::RetryPolicy;
use crate::llm::schema::schema_title;
use crate::llm::{Generator, InvocationError};
use crate::manager::TaskManager;
use crate::operators::{OperatorRegistry, OperatorServices};

/// Execution-type task whose description mirrors its name.
pub fn task(id: &str, name: &str) -> Task {
    Task {
        id: id.to_string(),
        name: name.to_string(),
        description: format!("{name} description"),
        priority: 0,
        dependencies: Vec::new(),
        metadata: TaskMetadata::default(),
    }
}

/// Like [`task`], with declared dependencies.
pub fn task_with_deps(id: &str, name: &str, deps: &[&str]) -> Task {
    Task {
        dependencies: deps.iter().map(|d| d.to_string()).collect(),
        ..task(id, name)
    }
}

/// `execution_output` document for a successful run.
pub fn execution_success(output: &str) -> Value {
    json!({
        "status": "success",
        "output": output,
        "metrics": {"execution_time_secs": 1.0, "resource_usage": "low", "quality_score": 0.8},
        "next_steps": []
    })
}

/// `creation_output` document; each entry is `(name, dependencies)`.
pub fn creation_output(tasks: &[(&str, &[&str])]) -> Value {
    let tasks: Vec<Value> = tasks
        .iter()
        .map(|(name, deps)| {
            json!({
                "name": name,
                "description": format!("{name} description"),
                "dependencies": deps,
            })
        })
        .collect();
    json!({ "tasks": tasks })
}

#[derive(Default)]
struct Script {
    queued: HashMap<String, VecDeque<Result<Value, InvocationError>>>,
    fallback: HashMap<String, Value>,
    prompts: HashMap<String, Vec<String>>,
}

/// Generator that answers from per-schema queues keyed by the schema `title`.
///
/// Queued responses are consumed in order; once a queue is empty the fallback
/// for that title is returned, if any, otherwise a transport error.
#[derive(Default)]
pub struct ScriptedGenerator {
    script: Mutex<Script>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, title: &str, response: Value) {
        self.script()
            .queued
            .entry(title.to_string())
            .or_default()
            .push_back(Ok(response));
    }

    pub fn push_err(&self, title: &str, err: InvocationError) {
        self.script()
            .queued
            .entry(title.to_string())
            .or_default()
            .push_back(Err(err));
    }

    /// Response returned for `title` whenever its queue is empty.
    pub fn fallback(&self, title: &str, response: Value) {
        self.script().fallback.insert(title.to_string(), response);
    }

    pub fn calls(&self, title: &str) -> usize {
        self.script().prompts.get(title).map_or(0, Vec::len)
    }

    pub fn total_calls(&self) -> usize {
        self.script().prompts.values().map(Vec::len).sum()
    }

    /// Prompts received for `title`, in call order.
    pub fn prompts(&self, title: &str) -> Vec<String> {
        self.script().prompts.get(title).cloned().unwrap_or_default()
    }
}

impl Generator for ScriptedGenerator {
    fn generate(&self, prompt: &str, schema: &Value) -> Result<Value, InvocationError> {
        let title = schema_title(schema).unwrap_or("untitled").to_string();
        let mut script = self.script();
        script
            .prompts
            .entry(title.clone())
            .or_default()
            .push(prompt.to_string());
        if let Some(response) = script.queued.get_mut(&title).and_then(VecDeque::pop_front) {
            return response;
        }
        script
            .fallback
            .get(&title)
            .cloned()
            .ok_or_else(|| InvocationError::Transport(format!("no scripted response for {title}")))
    }
}

/// Manager with the standard operators over `generator`, an in-memory cache
/// and single-attempt retries.
pub fn scripted_manager(generator: Arc<ScriptedGenerator>) -> TaskManager {
    build_manager(generator, OperatorRegistry::standard)
}

/// Like [`scripted_manager`], plus the objective-completion check.
pub fn evaluating_manager(generator: Arc<ScriptedGenerator>) -> TaskManager {
    build_manager(generator, OperatorRegistry::with_evaluation)
}

fn build_manager(
    generator: Arc<ScriptedGenerator>,
    registry: fn(&OperatorServices) -> anyhow::Result<OperatorRegistry>,
) -> TaskManager {
    let cache = Cache::in_memory();
    let services = OperatorServices::new(generator, cache.clone())
        .expect("services")
        .with_retry(RetryPolicy::immediate(1));
    let registry = registry(&services).expect("registry");
    let context = ContextManager::new(Arc::new(HashingEmbedder::new(64))).with_cache(cache);
    TaskManager::new(registry, Arc::new(context))
}
