//! Retry policy applied around every `generate` call.

use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::schema::{schema_title, validate_response};
use super::{Generator, InvocationError};

/// Bounded exponential backoff for transient failures plus corrective
/// re-prompting for schema failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts allowed for transient failures (transport, rate limit, timeout).
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each subsequent retry.
    pub base_delay_ms: u64,
    /// Upper bound for a single backoff delay.
    pub max_delay_ms: u64,
    /// Extra attempts with a corrective prompt after a schema validation failure.
    pub schema_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            schema_retries: 1,
        }
    }
}

impl RetryPolicy {
    /// Policy without delays, for tests and dry runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
            schema_retries: 1,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts must be > 0"));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(anyhow!("retry.max_delay_ms must be >= retry.base_delay_ms"));
        }
        Ok(())
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = 1u64 << retry.min(30);
        let delay = self.base_delay_ms.saturating_mul(exp).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Call `generator`, validate the response against `schema`, and retry per policy.
    #[instrument(skip_all, fields(schema = schema_title(schema).unwrap_or("untitled")))]
    pub fn invoke(
        &self,
        generator: &dyn Generator,
        prompt: &str,
        schema: &Value,
    ) -> Result<Value, InvocationError> {
        let mut transient_failures = 0u32;
        let mut schema_failures = 0u32;
        let mut current_prompt = prompt.to_string();

        loop {
            let outcome = generator
                .generate(&current_prompt, schema)
                .and_then(|value| validate_response(&value, schema).map(|()| value));

            let err = match outcome {
                Ok(value) => {
                    debug!(transient_failures, schema_failures, "generate succeeded");
                    return Ok(value);
                }
                Err(err) => err,
            };

            if err.is_transient() {
                transient_failures += 1;
                if transient_failures >= self.max_attempts.max(1) {
                    warn!(kind = err.kind(), attempts = transient_failures, "giving up after transient failures");
                    return Err(err);
                }
                let delay = self.delay_for(transient_failures - 1);
                warn!(
                    kind = err.kind(),
                    attempt = transient_failures,
                    delay_ms = delay.as_millis() as u64,
                    "transient invocation failure, backing off"
                );
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                continue;
            }

            schema_failures += 1;
            if schema_failures > self.schema_retries {
                warn!(error = %err, "response still invalid after corrective prompt");
                return Err(err);
            }
            warn!(error = %err, "response failed validation, retrying with corrective prompt");
            current_prompt = corrective_prompt(prompt, &err);
        }
    }
}

fn corrective_prompt(prompt: &str, err: &InvocationError) -> String {
    format!(
        "{prompt}\n\n## Correction\n\nYour previous answer was rejected: {err}.\n\
         Reply with a single JSON document that satisfies the response schema exactly.\n"
    )
}
