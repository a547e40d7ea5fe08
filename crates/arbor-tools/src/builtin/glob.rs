// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::{json, Value};
use tracing::debug;
use walkdir::WalkDir;

use crate::tool::{required_str, Tool, ToolOutcome};

const MAX_RESULTS: usize = 200;

/// Built-in tool for recursive file search using glob patterns.
///
/// Matches the pattern against the path relative to the search root.
/// `.git/` and `target/` are excluded automatically.
pub struct GlobTool;

impl Tool for GlobTool {
    fn name(&self) -> &str {
        "glob"
    }

    fn description(&self) -> &str {
        "Find files matching a glob pattern, e.g. '*.rs' or 'src/**/*.toml'. \
         Excludes .git/ and target/ automatically; returns at most 200 paths."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Glob pattern matched against relative paths"
                },
                "path": {
                    "type": "string",
                    "description": "Root directory to search from (default: current directory)"
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

        debug!(pattern, root, "glob tool");

        let re = match glob_to_regex(pattern) {
            Ok(re) => re,
            Err(e) => return ToolOutcome::fail(format!("Invalid pattern: {e}"), "INVALID_ARG"),
        };

        let mut matches = Vec::new();
        for entry in WalkDir::new(root)
            .into_iter()
            .filter_entry(|e| {
                let name = e.file_name().to_string_lossy();
                name != ".git" && name != "target"
            })
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
        {
            let rel = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .to_string();
            // A bare filename pattern matches at any depth.
            let candidate = if pattern.contains('/') {
                rel.clone()
            } else {
                entry.file_name().to_string_lossy().to_string()
            };
            if re.is_match(&candidate) {
                matches.push(rel);
                if matches.len() >= MAX_RESULTS {
                    break;
                }
            }
        }
        matches.sort();

        ToolOutcome::ok(json!({ "matches": matches }))
    }
}

/// Translate a glob pattern into an anchored regex.
///
/// `**` crosses directory separators, `*` and `?` do not; `[...]` classes
/// pass through.
pub(crate) fn glob_to_regex(pattern: &str) -> Result<regex::Regex, regex::Error> {
    let mut re = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // Swallow a following '/' so "**/" also matches zero dirs.
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        re.push_str("(?:.*/)?");
                    } else {
                        re.push_str(".*");
                    }
                } else {
                    re.push_str("[^/]*");
                }
            }
            '?' => re.push_str("[^/]"),
            '[' => re.push('['),
            ']' => re.push(']'),
            '.' | '+' | '(' | ')' | '{' | '}' | '^' | '$' | '|' | '\\' => {
                re.push('\\');
                re.push(c);
            }
            other => re.push(other),
        }
    }
    re.push('$');
    regex::Regex::new(&re)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
