//! Judges whether the objective is already met by the recorded work.
//!
//! Optional: the loop only asks when an evaluation operator is registered,
//! and a failed or unreadable verdict counts as "not yet".

use anyhow::Result;
use minijinja::context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::prompt::{EntrySummary, PromptTemplate};
use super::{ContextBundle, Operator, OperatorKind, OperatorResult, OperatorServices, load_schema};
use crate::core::fingerprint::Fingerprint;
use crate::core::metrics::PerformanceMetrics;
use crate::core::types::Task;

const SCHEMA: &str = include_str!("schemas/evaluation_output.json");

/// Verdict on the objective after the latest iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveEvaluation {
    pub achieved: bool,
    #[serde(default)]
    pub completion_rate: f64,
    #[serde(default)]
    pub analysis: String,
}

impl ObjectiveEvaluation {
    fn not_yet(analysis: impl Into<String>) -> Self {
        Self {
            achieved: false,
            completion_rate: 0.0,
            analysis: analysis.into(),
        }
    }
}

pub struct EvaluationOperator {
    services: OperatorServices,
    schema: Value,
}

impl EvaluationOperator {
    pub fn new(services: OperatorServices) -> Result<Self> {
        Ok(Self {
            services,
            schema: load_schema("evaluation", SCHEMA)?,
        })
    }

    fn fingerprint(&self, ctx: &ContextBundle) -> String {
        Fingerprint::new(OperatorKind::Evaluation.as_str())
            .field("objective", &ctx.objective)
            .list(
                "history",
                ctx.recent_history.iter().map(|e| {
                    format!(
                        "{}\u{1f}{}\u{1f}{}",
                        e.task.name,
                        e.result.status.as_str(),
                        e.result.output
                    )
                }),
            )
            .field("pending", &ctx.pending.len().to_string())
            .finish()
    }

    fn evaluate(&self, ctx: &ContextBundle) -> Result<Option<ObjectiveEvaluation>> {
        let metrics = PerformanceMetrics::from_history(&ctx.recent_history, ctx.pending.len());
        let prompt = self.services.prompts.render(
            PromptTemplate::Evaluation,
            context! {
                objective => ctx.objective.trim(),
                metrics => &metrics,
                history => EntrySummary::from_entries(&ctx.recent_history),
            },
        )?;

        let value = match self.services.invoke(&prompt, &self.schema) {
            Ok(value) => value,
            Err(err) => {
                warn!(err = %err, kind = err.kind(), "objective evaluation failed");
                return Ok(None);
            }
        };
        match serde_json::from_value::<ObjectiveEvaluation>(value) {
            Ok(mut evaluation) => {
                evaluation.completion_rate = evaluation.completion_rate.clamp(0.0, 1.0);
                Ok(Some(evaluation))
            }
            Err(err) => {
                warn!(err = %err, "evaluation output did not match the expected shape");
                Ok(None)
            }
        }
    }
}

impl Operator for EvaluationOperator {
    fn kind(&self) -> OperatorKind {
        OperatorKind::Evaluation
    }

    /// `ctx.recent_history` is expected to hold the whole run history.
    #[instrument(skip_all, fields(history = ctx.recent_history.len()))]
    fn run(&self, _task: &Task, ctx: &ContextBundle) -> Result<OperatorResult> {
        let fingerprint = self.fingerprint(ctx);
        if let Some(cached) = self.services.cache.lookup::<ObjectiveEvaluation>(&fingerprint) {
            debug!(fingerprint = %fingerprint, "evaluation cache hit");
            return Ok(OperatorResult::Evaluation(cached));
        }

        let evaluation = match self.evaluate(ctx)? {
            Some(evaluation) => {
                self.services.cache.store(&fingerprint, &evaluation, None);
                evaluation
            }
            None => ObjectiveEvaluation::not_yet("evaluation unavailable"),
        };
        info!(
            achieved = evaluation.achieved,
            completion_rate = evaluation.completion_rate,
            "evaluated objective"
        );
        Ok(OperatorResult::Evaluation(evaluation))
    }
}
