//! Model-invocation boundary.
//!
//! Every language-model call in the crate goes through [`Generator::generate`],
//! wrapped by a [`retry::RetryPolicy`]. Operators never talk to a transport
//! directly, so tests swap in scripted generators without spawning anything.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

pub mod command;
pub mod retry;
pub mod schema;

/// Why a `generate` call failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvocationError {
    /// Network or process failure reaching the model.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The backend asked us to slow down.
    #[error("rate limited: {0}")]
    RateLimited(String),
    /// The call did not finish within its time budget.
    #[error("invocation timed out after {0:?}")]
    Timeout(Duration),
    /// The model answered, but not in the requested structure.
    #[error("response failed schema validation: {0}")]
    SchemaValidation(String),
}

impl InvocationError {
    /// Transient errors are retried with backoff.
    pub fn is_transient(&self) -> bool {
        !matches!(self, InvocationError::SchemaValidation(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InvocationError::Transport(_) => "transport",
            InvocationError::RateLimited(_) => "rate_limited",
            InvocationError::Timeout(_) => "timeout",
            InvocationError::SchemaValidation(_) => "schema_validation",
        }
    }
}

/// Capability to turn a prompt into a structured value matching `schema`.
pub trait Generator: Send + Sync {
    fn generate(&self, prompt: &str, schema: &Value) -> Result<Value, InvocationError>;
}

impl<F> Generator for F
where
    F: Fn(&str, &Value) -> Result<Value, InvocationError> + Send + Sync,
{
    fn generate(&self, prompt: &str, schema: &Value) -> Result<Value, InvocationError> {
        self(prompt, schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn only_schema_errors_are_non_transient() {
        assert!(InvocationError::Transport("x".into()).is_transient());
        assert!(InvocationError::RateLimited("x".into()).is_transient());
        assert!(InvocationError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!InvocationError::SchemaValidation("x".into()).is_transient());
    }

    #[test]
    fn closures_are_generators() {
        let generator = |prompt: &str, _schema: &Value| -> Result<Value, InvocationError> {
            Ok(json!({ "echo": prompt }))
        };
        let value = generator.generate("hi", &json!({})).expect("generate");
        assert_eq!(value["echo"], "hi");
    }
}
