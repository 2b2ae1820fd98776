//! Executes one task through the model and reports a [`TaskResult`].

use std::time::Instant;

use anyhow::Result;
use minijinja::context;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::prompt::{EntrySummary, PromptTemplate};
use super::{ContextBundle, Operator, OperatorKind, OperatorResult, OperatorServices, load_schema};
use crate::core::fingerprint::Fingerprint;
use crate::core::types::{Task, TaskResult};

const SCHEMA: &str = include_str!("schemas/execution_output.json");

/// Outcome of one model call. Only answered calls are cached.
enum Attempt {
    Answered(TaskResult),
    Failed(TaskResult),
}

pub struct ExecutionOperator {
    services: OperatorServices,
    schema: Value,
}

impl ExecutionOperator {
    pub fn new(services: OperatorServices) -> Result<Self> {
        Ok(Self {
            services,
            schema: load_schema("execution", SCHEMA)?,
        })
    }

    /// The task's content plus every part of the context the prompt renders.
    /// The id is left out so a re-created task with identical content hits
    /// the cache.
    fn fingerprint(&self, task: &Task, ctx: &ContextBundle) -> String {
        Fingerprint::new(OperatorKind::Execution.as_str())
            .field("objective", &ctx.objective)
            .field("name", &task.name)
            .field("description", &task.description)
            .list("dependencies", &task.dependencies)
            .list(
                "similar",
                ctx.similar.iter().map(|e| {
                    format!(
                        "{}\u{1f}{}\u{1f}{}",
                        e.task.name,
                        e.result.status.as_str(),
                        e.result.output
                    )
                }),
            )
            .list(
                "history",
                ctx.recent_history
                    .iter()
                    .map(|e| format!("{}\u{1f}{}", e.task.name, e.result.status.as_str())),
            )
            .finish()
    }

    fn execute(&self, task: &Task, ctx: &ContextBundle) -> Result<Attempt> {
        let prompt = self.services.prompts.render(
            PromptTemplate::Execution,
            context! {
                objective => ctx.objective.trim(),
                task => context! {
                    name => &task.name,
                    description => &task.description,
                    dependencies => &task.dependencies,
                },
                similar => EntrySummary::from_entries(&ctx.similar),
                history => EntrySummary::from_entries(&ctx.recent_history),
            },
        )?;

        let started = Instant::now();
        let outcome = self.services.invoke(&prompt, &self.schema);
        let elapsed = started.elapsed().as_secs_f64();

        let failed = |output: String| {
            let mut result = TaskResult::failure(output);
            result.metrics.execution_time_secs = elapsed;
            Attempt::Failed(result)
        };

        let value = match outcome {
            Ok(value) => value,
            Err(err) => {
                warn!(err = %err, kind = err.kind(), "execution failed after retries");
                return Ok(failed(format!("execution failed: {err}")));
            }
        };

        let reported_time = value
            .pointer("/metrics/execution_time_secs")
            .is_some_and(|v| !v.is_null());
        match serde_json::from_value::<TaskResult>(value) {
            Ok(mut result) => {
                if !reported_time {
                    result.metrics.execution_time_secs = elapsed;
                }
                Ok(Attempt::Answered(result.normalized()))
            }
            Err(err) => {
                warn!(err = %err, "execution output did not match the expected shape");
                Ok(failed(format!("unreadable execution output: {err}")))
            }
        }
    }
}

impl Operator for ExecutionOperator {
    fn kind(&self) -> OperatorKind {
        OperatorKind::Execution
    }

    #[instrument(skip_all, fields(task_id = %task.id, task = %task.name))]
    fn run(&self, task: &Task, ctx: &ContextBundle) -> Result<OperatorResult> {
        let fingerprint = self.fingerprint(task, ctx);
        if let Some(cached) = self.services.cache.lookup::<TaskResult>(&fingerprint) {
            debug!(fingerprint = %fingerprint, "execution cache hit");
            return Ok(OperatorResult::Execution(cached));
        }

        let result = match self.execute(task, ctx)? {
            Attempt::Answered(result) => {
                self.services.cache.store(&fingerprint, &result, None);
                result
            }
            Attempt::Failed(result) => result,
        };
        info!(status = result.status.as_str(), "executed task");
        Ok(OperatorResult::Execution(result))
    }
}
