//! Turns the objective plus what just happened into new task drafts.

use std::collections::HashSet;

use anyhow::Result;
use minijinja::context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::prompt::{EntrySummary, PromptTemplate};
use super::{ContextBundle, Operator, OperatorKind, OperatorResult, OperatorServices, load_schema};
use crate::core::dedup::normalize_name;
use crate::core::fingerprint::Fingerprint;
use crate::core::types::{HistoryEntry, Task, TaskDraft, TaskKind, TaskMetadata};

const SCHEMA: &str = include_str!("schemas/creation_output.json");

/// One proposed task as the model returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DraftWire {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    estimated_minutes: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    required_resources: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CreationOutput {
    tasks: Vec<DraftWire>,
}

impl DraftWire {
    fn into_draft(self) -> TaskDraft {
        TaskDraft {
            name: self.name,
            description: self.description,
            dependencies: self.dependencies,
            metadata: TaskMetadata {
                task_type: TaskKind::Execution,
                estimated_minutes: self.estimated_minutes.filter(|m| m.is_finite() && *m >= 0.0),
                required_resources: self.required_resources,
                ..TaskMetadata::default()
            },
        }
    }
}

/// The model gave no usable proposal after retries.
///
/// The loop treats this as "nothing to add" after an execution, and as a
/// failed result when the task being dispatched is itself a planning task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("task creation failed: {0}")]
pub struct CreationFailed(pub String);

pub struct CreationOperator {
    services: OperatorServices,
    schema: Value,
}

impl CreationOperator {
    pub fn new(services: OperatorServices) -> Result<Self> {
        Ok(Self {
            services,
            schema: load_schema("creation", SCHEMA)?,
        })
    }

    fn fingerprint(&self, task: &Task, ctx: &ContextBundle) -> String {
        let mut fp = Fingerprint::new(OperatorKind::Creation.as_str())
            .field("objective", &ctx.objective)
            .field("task.name", &task.name)
            .field("task.description", &task.description)
            .list("task.dependencies", &task.dependencies);
        if let Some(result) = &ctx.last_result {
            fp = fp
                .field("result.status", result.status.as_str())
                .field("result.output", &result.output)
                .list(
                    "result.next_steps",
                    result.next_steps.iter().map(|s| format!("{}\u{1f}{}", s.action, s.reason)),
                );
        }
        fp.list("history", ctx.recent_history.iter().map(entry_key))
            .list("similar", ctx.similar.iter().map(entry_key))
            .list("known", known_names(ctx))
            .finish()
    }

    fn generate(&self, task: &Task, ctx: &ContextBundle) -> Result<Vec<DraftWire>, CreationFailed> {
        let prompt = self.services.prompts.render(
            PromptTemplate::Creation,
            context! {
                objective => ctx.objective.trim(),
                source => context! {
                    name => &task.name,
                    description => &task.description,
                },
                result => ctx.last_result.as_ref().map(|r| context! {
                    status => r.status.as_str(),
                    output => r.output.trim(),
                    next_steps => &r.next_steps,
                }),
                known => known_names(ctx),
                history => EntrySummary::from_entries(&ctx.recent_history),
                similar => EntrySummary::from_entries(&ctx.similar),
            },
        )
        .map_err(|err| CreationFailed(format!("render prompt: {err:#}")))?;

        let value = self.services.invoke(&prompt, &self.schema).map_err(|err| {
            warn!(err = %err, kind = err.kind(), "task creation failed");
            CreationFailed(err.to_string())
        })?;
        let output = serde_json::from_value::<CreationOutput>(value).map_err(|err| {
            warn!(err = %err, "creation output did not match the expected shape");
            CreationFailed(format!("unexpected output shape: {err}"))
        })?;
        Ok(output.tasks)
    }
}

impl Operator for CreationOperator {
    fn kind(&self) -> OperatorKind {
        OperatorKind::Creation
    }

    #[instrument(skip_all, fields(task_id = %task.id))]
    fn run(&self, task: &Task, ctx: &ContextBundle) -> Result<OperatorResult> {
        let fingerprint = self.fingerprint(task, ctx);
        let proposed = match self.services.cache.lookup::<Vec<DraftWire>>(&fingerprint) {
            Some(cached) => {
                debug!(fingerprint = %fingerprint, count = cached.len(), "creation cache hit");
                cached
            }
            None => {
                let proposed = self.generate(task, ctx)?;
                self.services.cache.store(&fingerprint, &proposed, None);
                proposed
            }
        };

        let proposed_count = proposed.len();
        let drafts = filter_drafts(
            proposed.into_iter().map(DraftWire::into_draft).collect(),
            ctx.pending.iter().chain(&ctx.completed).chain(std::iter::once(task)),
        );
        info!(proposed = proposed_count, accepted = drafts.len(), "created tasks");
        Ok(OperatorResult::NewTasks(drafts))
    }
}

/// Drop drafts that repeat a known name and dependencies that point nowhere.
///
/// A dependency survives only if it names a known task (by id or name) or a
/// draft accepted earlier in the same batch, and is not the draft itself.
pub fn filter_drafts<'a, I>(drafts: Vec<TaskDraft>, known: I) -> Vec<TaskDraft>
where
    I: IntoIterator<Item = &'a Task>,
{
    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut seen_names: HashSet<String> = HashSet::new();
    for task in known {
        seen_ids.insert(task.id.clone());
        seen_names.insert(normalize_name(&task.name));
    }

    let mut accepted = Vec::with_capacity(drafts.len());
    for mut draft in drafts {
        let name = normalize_name(&draft.name);
        if name.is_empty() {
            debug!("dropping unnamed draft");
            continue;
        }
        if seen_names.contains(&name) {
            debug!(name = %draft.name, "dropping draft that repeats a known task");
            continue;
        }

        let mut kept: Vec<String> = Vec::with_capacity(draft.dependencies.len());
        for dep in draft.dependencies.drain(..) {
            let dep = dep.trim().to_string();
            let dep_name = normalize_name(&dep);
            if dep_name == name {
                debug!(name = %draft.name, "dropping self-dependency");
                continue;
            }
            if !(seen_ids.contains(&dep) || seen_names.contains(&dep_name)) {
                debug!(name = %draft.name, dependency = %dep, "dropping unknown dependency");
                continue;
            }
            if !kept.iter().any(|k| normalize_name(k) == dep_name || *k == dep) {
                kept.push(dep);
            }
        }
        draft.dependencies = kept;
        draft.metadata.task_type = TaskKind::Execution;

        seen_names.insert(name);
        accepted.push(draft);
    }
    accepted
}

fn known_names(ctx: &ContextBundle) -> Vec<String> {
    let mut names: Vec<String> = ctx
        .completed
        .iter()
        .chain(&ctx.pending)
        .map(|t| t.name.clone())
        .collect();
    names.sort();
    names.dedup();
    names
}

fn entry_key(entry: &HistoryEntry) -> String {
    format!(
        "{}\u{1f}{}\u{1f}{}",
        entry.task.name,
        entry.result.status.as_str(),
        entry.result.output
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::core::types::{NextStep, TaskResult};
    use crate::llm::InvocationError;
    use crate::llm::retry::RetryPolicy;
    use crate::test_support::{ScriptedGenerator, task};
    use serde_json::json;
    use std::sync::Arc;

    fn operator(generator: Arc<ScriptedGenerator>) -> CreationOperator {
        let services = OperatorServices::new(generator, Cache::in_memory())
            .expect("services")
            .with_retry(RetryPolicy::immediate(2));
        CreationOperator::new(services).expect("operator")
    }

    fn bundle() -> ContextBundle {
        ContextBundle {
            objective: "build a login page".to_string(),
            ..ContextBundle::default()
        }
    }

    #[test]
    fn filter_keeps_earlier_batch_dependencies_only() {
        let drafts = vec![
            TaskDraft::new("design schema", "tables").depends_on("ghost"),
            TaskDraft::new("implement endpoint", "POST /login")
                .depends_on("Design Schema")
                .depends_on("write tests"),
            TaskDraft::new("write tests", "cover login"),
        ];
        let accepted = filter_drafts(drafts, std::iter::empty());
        assert_eq!(accepted.len(), 3);
        assert!(accepted[0].dependencies.is_empty());
        assert_eq!(accepted[1].dependencies, vec!["Design Schema".to_string()]);
    }

    #[test]
    fn filter_drops_known_names_and_self_dependencies() {
        let known = [task("t1", "design schema")];
        let drafts = vec![
            TaskDraft::new("Design Schema", "again"),
            TaskDraft::new("style page", "css")
                .depends_on("style page")
                .depends_on("t1"),
            TaskDraft::new("style  page", "dup in batch"),
        ];
        let accepted = filter_drafts(drafts, known.iter());
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].name, "style page");
        assert_eq!(accepted[0].dependencies, vec!["t1".to_string()]);
    }

    #[test]
    fn run_parses_and_caches_model_output() {
        let generator = Arc::new(ScriptedGenerator::new());
        generator.push(
            "creation_output",
            json!({"tasks": [
                {"name": "design schema", "description": "users table", "estimated_minutes": 30},
                {"name": "implement endpoint", "description": "POST /login", "dependencies": ["design schema"]}
            ]}),
        );
        let op = operator(generator.clone());
        let source = task("root", "Plan objective");

        let first = op.run(&source, &bundle()).expect("run").into_new_tasks().expect("drafts");
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].metadata.estimated_minutes, Some(30.0));
        assert_eq!(first[1].dependencies, vec!["design schema".to_string()]);

        let second = op.run(&source, &bundle()).expect("run").into_new_tasks().expect("drafts");
        assert_eq!(first, second);
        assert_eq!(generator.calls("creation_output"), 1);
    }

    #[test]
    fn prompt_carries_result_and_next_steps() {
        let generator = Arc::new(ScriptedGenerator::new());
        generator.push("creation_output", json!({"tasks": []}));
        let op = operator(generator.clone());
        let mut result = TaskResult::success("endpoint live");
        result.next_steps.push(NextStep {
            action: "add rate limiting".to_string(),
            reason: "brute force".to_string(),
        });
        let mut ctx = bundle();
        ctx.last_result = Some(result);
        ctx.completed.push(task("t1", "implement endpoint"));

        let drafts = op
            .run(&task("t1", "implement endpoint"), &ctx)
            .expect("run")
            .into_new_tasks()
            .expect("drafts");
        assert!(drafts.is_empty());

        let prompt = &generator.prompts("creation_output")[0];
        assert!(prompt.contains("build a login page"));
        assert!(prompt.contains("endpoint live"));
        assert!(prompt.contains("add rate limiting (brute force)"));
        assert!(prompt.contains("### Known Tasks"));
    }

    #[test]
    fn generation_failure_is_reported_and_not_cached() {
        let generator = Arc::new(ScriptedGenerator::new());
        generator.push_err("creation_output", InvocationError::Transport("down".into()));
        generator.push_err("creation_output", InvocationError::Transport("down".into()));
        generator.push("creation_output", json!({"tasks": [{"name": "design schema", "description": "tables"}]}));
        let op = operator(generator.clone());
        let source = task("root", "Plan objective");

        let err = op.run(&source, &bundle()).unwrap_err();
        let failed = err.downcast_ref::<CreationFailed>().expect("typed error");
        assert!(failed.0.contains("down"));
        assert_eq!(generator.calls("creation_output"), 2);

        let drafts = op
            .run(&source, &bundle())
            .expect("run")
            .into_new_tasks()
            .expect("drafts");
        assert_eq!(drafts.len(), 1);
    }

    #[test]
    fn invalid_output_is_reported() {
        let generator = Arc::new(ScriptedGenerator::new());
        generator.push("creation_output", json!({"tasks": [{"description": "no name"}]}));
        let op = operator(generator);
        let err = op.run(&task("root", "Plan objective"), &bundle()).unwrap_err();
        assert!(err.downcast_ref::<CreationFailed>().is_some());
    }
}
