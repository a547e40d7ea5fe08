// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::process::Command;

use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{required_str, Tool, ToolOutcome};

/// Built-in tool that runs a shell command on the worker thread.
///
/// stdout and stderr are captured together so interleaved diagnostics stay
/// readable; output beyond `output_limit` bytes is truncated with a marker.
pub struct BashTool {
    pub output_limit: usize,
}

impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return combined stdout/stderr plus the \
         exit code. Output is capped; prefer non-interactive commands that \
         do not require a TTY."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    fn execute(&self, args: &Value) -> ToolOutcome {
        let command = match required_str(args, "command") {
            Ok(c) => c,
            Err(outcome) => return outcome,
        };

        debug!(command, "bash tool");

        let output = match Command::new("sh").arg("-c").arg(command).output() {
            Ok(o) => o,
            Err(e) => {
                return ToolOutcome::fail(format!("Failed to run command: {e}"), "IO");
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        if combined.len() > self.output_limit {
            // Truncate on a char boundary.
            let mut cut = self.output_limit;
            while !combined.is_char_boundary(cut) {
                cut -= 1;
            }
            combined.truncate(cut);
            combined.push_str("\n[output truncated]");
        }

        ToolOutcome::ok(json!({
            "output": combined,
            "exit_code": output.status.code().unwrap_or(-1),
        }))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
