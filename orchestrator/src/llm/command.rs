//! Process-backed generator.
//!
//! The configured command receives `{"prompt", "response_schema"}` as JSON on
//! stdin and must print a JSON document on stdout (a fenced code block is
//! accepted). Exit code 75 (`EX_TEMPFAIL`) signals rate limiting.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use super::schema::{extract_json, schema_title};
use super::{Generator, InvocationError};
use crate::io::process::run_command_with_timeout;

/// Exit code a generator command uses to ask for backoff.
pub const RATE_LIMITED_EXIT_CODE: i32 = 75;

const STDERR_TAIL_BYTES: usize = 2_000;

/// Generator that spawns an external command per call.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    /// Program followed by its arguments.
    pub command: Vec<String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    pub workdir: Option<PathBuf>,
}

impl CommandGenerator {
    pub fn new(command: Vec<String>, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            command,
            timeout,
            output_limit_bytes,
            workdir: None,
        }
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }
}

impl Generator for CommandGenerator {
    #[instrument(skip_all, fields(
        program = self.command.first().map(String::as_str).unwrap_or(""),
        schema = schema_title(schema).unwrap_or("untitled"),
    ))]
    fn generate(&self, prompt: &str, schema: &Value) -> Result<Value, InvocationError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| InvocationError::Transport("generator command is empty".into()))?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }

        let request = json!({ "prompt": prompt, "response_schema": schema });
        let stdin = serde_json::to_vec(&request)
            .map_err(|err| InvocationError::Transport(format!("encode request: {err}")))?;

        let output =
            run_command_with_timeout(cmd, Some(&stdin), self.timeout, self.output_limit_bytes)
                .map_err(|err| InvocationError::Transport(format!("{err:#}")))?;

        if output.timed_out {
            return Err(InvocationError::Timeout(self.timeout));
        }
        if !output.status.success() {
            let stderr = output.stderr_tail(STDERR_TAIL_BYTES);
            warn!(exit_code = ?output.status.code(), "generator command failed");
            return Err(match output.status.code() {
                Some(RATE_LIMITED_EXIT_CODE) => InvocationError::RateLimited(stderr),
                code => InvocationError::Transport(format!("exit status {code:?}: {stderr}")),
            });
        }
        if output.stdout_truncated > 0 {
            return Err(InvocationError::Transport(format!(
                "generator output exceeded {} bytes",
                self.output_limit_bytes
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let value = extract_json(&stdout).ok_or_else(|| {
            InvocationError::SchemaValidation("generator output contained no JSON document".into())
        })?;
        debug!(bytes = output.stdout.len(), "generator returned JSON");
        Ok(value)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(script: &str) -> CommandGenerator {
        CommandGenerator::new(
            vec!["sh".into(), "-c".into(), script.into()],
            Duration::from_secs(5),
            64 * 1024,
        )
    }

    #[test]
    fn parses_stdout_json() {
        let generator = shell(r#"cat >/dev/null; printf '{"status":"success"}'"#);
        let value = generator.generate("hi", &json!({})).expect("generate");
        assert_eq!(value, json!({"status": "success"}));
    }

    #[test]
    fn forwards_prompt_on_stdin() {
        let generator = shell("cat");
        let value = generator
            .generate("design schema", &json!({"title": "t"}))
            .expect("echo");
        assert_eq!(value["prompt"], "design schema");
        assert_eq!(value["response_schema"]["title"], "t");
    }

    #[test]
    fn exit_75_is_rate_limited() {
        let generator = shell("cat >/dev/null; echo 'quota' >&2; exit 75");
        let err = generator.generate("hi", &json!({})).unwrap_err();
        assert_eq!(err, InvocationError::RateLimited("quota".into()));
    }

    #[test]
    fn other_failures_are_transport() {
        let generator = shell("cat >/dev/null; exit 2");
        let err = generator.generate("hi", &json!({})).unwrap_err();
        assert!(matches!(err, InvocationError::Transport(_)));
    }

    #[test]
    fn non_json_output_is_schema_failure() {
        let generator = shell("cat >/dev/null; echo 'sorry, no'");
        let err = generator.generate("hi", &json!({})).unwrap_err();
        assert!(matches!(err, InvocationError::SchemaValidation(_)));
    }

    #[test]
    fn slow_command_times_out() {
        let mut generator = shell("exec sleep 5");
        generator.timeout = Duration::from_millis(100);
        let err = generator.generate("hi", &json!({})).unwrap_err();
        assert!(matches!(err, InvocationError::Timeout(_)));
    }
}
