// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::{json, Value};
use tracing::debug;
use walkdir::WalkDir;

use crate::tool::{required_str, Tool, ToolOutcome};

const MAX_MATCHES: usize = 100;

/// Built-in regex search over files under a directory.
///
/// Binary files (non-UTF-8) are skipped; `.git/` and `target/` are excluded.
pub struct GrepTool;

impl Tool for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Search file contents with a regular expression. Returns up to 100 \
         matches as path:line:text. Use glob to discover files first when \
         the search space is large."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Regular expression to search for"
                },
                "path": {
                    "type": "string",
                    "description": "File or directory to search in (default: current directory)"
                }
            },
            "required": ["pattern"],
            "additionalProperties": false
        })
    }

    fn execute(&self, args: &Value) -> ToolOutcome {
        let pattern = match required_str(args, "pattern") {
            Ok(p) => p,
            Err(outcome) => return outcome,
        };
        let root = args.get("path").and_then(Value::as_str).unwrap_or(".");

        debug!(pattern, root, "grep tool");

        let re = match regex::Regex::new(pattern) {
            Ok(re) => re,
            Err(e) => return ToolOutcome::fail(format!("Invalid pattern: {e}"), "PARSE"),
        };

        let mut matches = Vec::new();
        'outer: for entry in WalkDir::new(root)
            .into_iter()
            .filter_entry(|e| {
                let name = e.file_name().to_string_lossy();
                name != ".git" && name != "target"
            })
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
        {
            let Ok(content) = std::fs::read_to_string(entry.path()) else {
                continue;
            };
            for (lineno, line) in content.lines().enumerate() {
                if re.is_match(line) {
                    matches.push(format!(
                        "{}:{}:{}",
                        entry.path().display(),
                        lineno + 1,
                        line
                    ));
                    if matches.len() >= MAX_MATCHES {
                        break 'outer;
                    }
                }
            }
        }

        ToolOutcome::ok(json!({ "matches": matches }))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
