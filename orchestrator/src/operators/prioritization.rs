//! Assigns every pending task a dispatch priority.
//!
//! The model only scores tasks; dependency order is enforced by
//! [`topological_order`], so a bad or missing score can reorder ready tasks
//! but never put a dependent ahead of its dependency.

use std::collections::HashMap;

use anyhow::Result;
use minijinja::context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::prompt::PromptTemplate;
use super::{
    ContextBundle, Operator, OperatorKind, OperatorResult, OperatorServices, PriorityAssignment,
    load_schema,
};
use crate::core::fingerprint::Fingerprint;
use crate::core::priority::{RankedTask, topological_order};
use crate::core::types::Task;

const SCHEMA: &str = include_str!("schemas/prioritization_output.json");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TaskScore {
    task_id: String,
    score: f64,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Clone, Deserialize)]
struct PrioritizationOutput {
    scores: Vec<TaskScore>,
}

pub struct PrioritizationOperator {
    services: OperatorServices,
    schema: Value,
}

impl PrioritizationOperator {
    pub fn new(services: OperatorServices) -> Result<Self> {
        Ok(Self {
            services,
            schema: load_schema("prioritization", SCHEMA)?,
        })
    }

    fn fingerprint(&self, ctx: &ContextBundle) -> String {
        Fingerprint::new(OperatorKind::Prioritization.as_str())
            .field("objective", &ctx.objective)
            .list("pending", ctx.pending.iter().map(task_key))
            .list("resolved", ctx.resolved.sorted())
            .finish()
    }

    /// Model scores for the pending set; empty when scoring is unavailable.
    fn scores(&self, ctx: &ContextBundle) -> Result<Vec<TaskScore>> {
        let fingerprint = self.fingerprint(ctx);
        if let Some(cached) = self.services.cache.lookup::<Vec<TaskScore>>(&fingerprint) {
            debug!(fingerprint = %fingerprint, "prioritization cache hit");
            return Ok(cached);
        }

        let prompt = self.services.prompts.render(
            PromptTemplate::Prioritization,
            context! {
                objective => ctx.objective.trim(),
                pending => ctx.pending.iter().map(|t| context! {
                    id => &t.id,
                    name => &t.name,
                    description => &t.description,
                    dependencies => &t.dependencies,
                }).collect::<Vec<_>>(),
                resolved => resolved_names(ctx),
            },
        )?;

        let value = match self.services.invoke(&prompt, &self.schema) {
            Ok(value) => value,
            Err(err) => {
                warn!(
                    err = %err,
                    kind = err.kind(),
                    "scoring failed, falling back to dependency order with insertion tie-break"
                );
                return Ok(Vec::new());
            }
        };
        match serde_json::from_value::<PrioritizationOutput>(value) {
            Ok(output) => {
                self.services.cache.store(&fingerprint, &output.scores, None);
                Ok(output.scores)
            }
            Err(err) => {
                warn!(err = %err, "prioritization output did not match the expected shape");
                Ok(Vec::new())
            }
        }
    }
}

impl Operator for PrioritizationOperator {
    fn kind(&self) -> OperatorKind {
        OperatorKind::Prioritization
    }

    #[instrument(skip_all, fields(pending = ctx.pending.len()))]
    fn run(&self, _task: &Task, ctx: &ContextBundle) -> Result<OperatorResult> {
        // A single candidate needs no scoring call.
        let scores = if ctx.pending.len() > 1 {
            self.scores(ctx)?
        } else {
            Vec::new()
        };

        let mut score_map: HashMap<String, f64> = HashMap::new();
        let mut reasons: HashMap<String, String> = HashMap::new();
        for score in scores {
            if !ctx.pending.iter().any(|t| t.id == score.task_id) {
                debug!(task_id = %score.task_id, "ignoring score for unknown task");
                continue;
            }
            score_map.insert(score.task_id.clone(), score.score);
            if !score.reason.trim().is_empty() {
                reasons.insert(score.task_id, score.reason.trim().to_string());
            }
        }

        let order = topological_order(&ctx.pending, &ctx.resolved, &score_map);
        let assignments: Vec<PriorityAssignment> = order
            .into_iter()
            .map(|ranked| {
                let rationale = rationale(&ranked, reasons.remove(&ranked.task_id));
                PriorityAssignment {
                    task_id: ranked.task_id,
                    priority: ranked.priority,
                    rationale,
                }
            })
            .collect();
        info!(
            scored = score_map.len(),
            assigned = assignments.len(),
            "prioritized pending tasks"
        );
        Ok(OperatorResult::Priorities(assignments))
    }
}

fn rationale(ranked: &RankedTask, reason: Option<String>) -> String {
    if ranked.in_cycle {
        return "blocked: dependency cycle among pending tasks".to_string();
    }
    match (ranked.score, reason) {
        (Some(score), Some(reason)) => format!("score {score:.2}, level {}: {reason}", ranked.level),
        (Some(score), None) => format!("score {score:.2}, level {}", ranked.level),
        (None, _) => format!("unscored, level {}, insertion order", ranked.level),
    }
}

fn task_key(task: &Task) -> String {
    format!(
        "{}\u{1f}{}\u{1f}{}\u{1f}{}",
        task.id,
        task.name,
        task.description,
        task.dependencies.join("\u{1e}")
    )
}

/// Names of the completed tasks that reached `success`, for prompts.
fn resolved_names(ctx: &ContextBundle) -> Vec<String> {
    ctx.completed
        .iter()
        .filter(|t| ctx.resolved.is_resolved(&t.id))
        .map(|t| t.name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::core::schedule::ResolvedSet;
    use crate::llm::InvocationError;
    use crate::llm::retry::RetryPolicy;
    use crate::test_support::{ScriptedGenerator, task, task_with_deps};
    use serde_json::json;
    use std::sync::Arc;

    fn operator(generator: Arc<ScriptedGenerator>) -> PrioritizationOperator {
        let services = OperatorServices::new(generator, Cache::in_memory())
            .expect("services")
            .with_retry(RetryPolicy::immediate(1));
        PrioritizationOperator::new(services).expect("operator")
    }

    fn bundle(pending: Vec<Task>) -> ContextBundle {
        ContextBundle {
            objective: "build a login page".to_string(),
            pending,
            resolved: ResolvedSet::default(),
            ..ContextBundle::default()
        }
    }

    fn priorities(op: &PrioritizationOperator, ctx: &ContextBundle) -> Vec<(String, u32)> {
        op.run(&task("root", "root"), ctx)
            .expect("run")
            .into_priorities()
            .expect("priorities")
            .into_iter()
            .map(|a| (a.task_id, a.priority))
            .collect()
    }

    #[test]
    fn scores_reorder_ready_tasks_but_not_dependencies() {
        let generator = Arc::new(ScriptedGenerator::new());
        generator.push(
            "prioritization_output",
            json!({"scores": [
                {"task_id": "impl", "score": 9.0, "reason": "user facing"},
                {"task_id": "docs", "score": 5.0},
                {"task_id": "schema", "score": 1.0}
            ]}),
        );
        let op = operator(generator);
        let ctx = bundle(vec![
            task("schema", "design schema"),
            task_with_deps("impl", "implement endpoint", &["design schema"]),
            task("docs", "write docs"),
        ]);

        assert_eq!(
            priorities(&op, &ctx),
            vec![
                ("docs".to_string(), 0),
                ("schema".to_string(), 1),
                ("impl".to_string(), 2)
            ]
        );
    }

    #[test]
    fn unchanged_pending_set_is_scored_once() {
        let generator = Arc::new(ScriptedGenerator::new());
        generator.push(
            "prioritization_output",
            json!({"scores": [{"task_id": "b", "score": 2.0}, {"task_id": "a", "score": 1.0}]}),
        );
        let op = operator(generator.clone());
        let ctx = bundle(vec![task("a", "a"), task("b", "b")]);

        let first = priorities(&op, &ctx);
        let second = priorities(&op, &ctx);
        assert_eq!(first, second);
        assert_eq!(first[0].0, "b");
        assert_eq!(generator.calls("prioritization_output"), 1);
    }

    #[test]
    fn scoring_failure_falls_back_to_dependency_and_insertion_order() {
        let generator = Arc::new(ScriptedGenerator::new());
        generator.push_err(
            "prioritization_output",
            InvocationError::Timeout(std::time::Duration::from_secs(1)),
        );
        let op = operator(generator);
        let ctx = bundle(vec![
            task_with_deps("c", "c", &["a"]),
            task("a", "a"),
            task("b", "b"),
        ]);
        assert_eq!(
            priorities(&op, &ctx),
            vec![("a".to_string(), 0), ("c".to_string(), 1), ("b".to_string(), 2)]
        );
    }

    #[test]
    fn single_task_skips_the_model() {
        let generator = Arc::new(ScriptedGenerator::new());
        let op = operator(generator.clone());
        let ctx = bundle(vec![task("only", "only")]);
        assert_eq!(priorities(&op, &ctx), vec![("only".to_string(), 0)]);
        assert_eq!(generator.total_calls(), 0);
    }

    #[test]
    fn cycle_members_get_a_blocking_rationale() {
        let generator = Arc::new(ScriptedGenerator::new());
        generator.push("prioritization_output", json!({"scores": []}));
        let op = operator(generator);
        let ctx = bundle(vec![
            task_with_deps("a", "a", &["b"]),
            task_with_deps("b", "b", &["a"]),
        ]);
        let assignments = op
            .run(&task("root", "root"), &ctx)
            .expect("run")
            .into_priorities()
            .expect("priorities");
        assert!(assignments.iter().all(|a| a.rationale.starts_with("blocked")));
    }
}
