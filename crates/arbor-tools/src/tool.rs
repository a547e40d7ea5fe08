// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::{json, Value};

/// The raw result of executing a tool handler.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub success: bool,
    /// Result payload on success, human-readable message on failure.
    pub payload: Value,
    /// Stable machine-readable code on failure (e.g. `INVALID_ARG`).
    pub error_code: Option<String>,
}

impl ToolOutcome {
    pub fn ok(payload: Value) -> Self {
        Self { success: true, payload, error_code: None }
    }

    pub fn fail(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            success: false,
            payload: Value::String(message.into()),
            error_code: Some(code.into()),
        }
    }

    /// Wrap into the envelope returned to the provider as tool-result
    /// content: `{tool_success, result | error, error_code?}`.
    pub fn into_envelope(self) -> String {
        let v = if self.success {
            json!({ "tool_success": true, "result": self.payload })
        } else {
            json!({
                "tool_success": false,
                "error": self.payload,
                "error_code": self.error_code.unwrap_or_else(|| "ERROR".into()),
            })
        };
        v.to_string()
    }
}

/// Envelope a successful result payload.
pub fn wrap_success(payload: Value) -> String {
    ToolOutcome::ok(payload).into_envelope()
}

/// Envelope a failure message with its code.
pub fn wrap_failure(message: impl Into<String>, code: impl Into<String>) -> String {
    ToolOutcome::fail(message, code).into_envelope()
}

/// A tool executable on a worker thread.
///
/// Handlers take parsed JSON arguments and return a [`ToolOutcome`]; they
/// must not touch any UI or agent state; integration happens on the main
/// thread after the worker completes.
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the arguments object.
    fn input_schema(&self) -> Value;
    fn execute(&self, args: &Value) -> ToolOutcome;
}

/// Fetch a required string argument or fail with `INVALID_ARG`.
pub(crate) fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolOutcome> {
    match args.get(key).and_then(Value::as_str) {
        Some(s) if !s.is_empty() => Ok(s),
        _ => Err(ToolOutcome::fail(
            format!("Missing required parameter: {key}"),
            "INVALID_ARG",
        )),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_envelope_shape() {
        let s = wrap_success(json!({ "child_uuid": "abc" }));
        let v: Value = serde_json::from_str(&s).unwrap();
        assert_eq!(v["tool_success"], true);
        assert_eq!(v["result"]["child_uuid"], "abc");
        assert!(v.get("error").is_none());
    }

    #[test]
    fn failure_envelope_shape() {
        let s = wrap_failure("Missing required parameter: uuid", "INVALID_ARG");
        let v: Value = serde_json::from_str(&s).unwrap();
        assert_eq!(v["tool_success"], false);
        assert_eq!(v["error"], "Missing required parameter: uuid");
        assert_eq!(v["error_code"], "INVALID_ARG");
    }

    #[test]
    fn failure_without_code_defaults_to_generic() {
        let outcome = ToolOutcome {
            success: false,
            payload: Value::String("boom".into()),
            error_code: None,
        };
        let v: Value = serde_json::from_str(&outcome.into_envelope()).unwrap();
        assert_eq!(v["error_code"], "ERROR");
    }

    #[test]
    fn required_str_rejects_missing_and_empty() {
        let args = json!({ "present": "x", "empty": "" });
        assert!(required_str(&args, "present").is_ok());
        assert!(required_str(&args, "empty").is_err());
        let err = required_str(&args, "absent").unwrap_err();
        assert_eq!(err.error_code.as_deref(), Some("INVALID_ARG"));
    }
}
