//! Response validation and JSON extraction for model output.

use std::sync::LazyLock;

use jsonschema::Draft;
use regex::Regex;
use serde_json::Value;

use super::InvocationError;

/// Validate a model response against a JSON Schema (Draft 2020-12).
pub fn validate_response(instance: &Value, schema: &Value) -> Result<(), InvocationError> {
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(schema)
        .map_err(|err| InvocationError::SchemaValidation(format!("invalid schema: {err}")))?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(InvocationError::SchemaValidation(messages.join("; ")));
    }
    Ok(())
}

/// The `title` of a response schema, used to identify which operator asked.
pub fn schema_title(schema: &Value) -> Option<&str> {
    schema.get("title").and_then(Value::as_str)
}

/// Pull the first JSON document out of free-form model text.
///
/// Prefers a fenced code block; otherwise takes the widest `{...}` or `[...]`
/// span. Returns `None` if nothing parses.
pub fn extract_json(text: &str) -> Option<Value> {
    static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?s)```(?:json)?\s*\n(.*?)```").expect("fence regex should be valid")
    });

    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    if let Some(caps) = FENCE_RE.captures(trimmed)
        && let Some(body) = caps.get(1)
        && let Ok(value) = serde_json::from_str::<Value>(body.as_str().trim())
    {
        return Some(value);
    }

    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close))
            && start < end
            && let Ok(value) = serde_json::from_str::<Value>(&trimmed[start..=end])
        {
            return Some(value);
        }
    }
    None
}
