// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{required_str, Tool, ToolOutcome};

pub struct FileReadTool;

impl Tool for FileReadTool {
    fn name(&self) -> &str {
        "file_read"
    }

    fn description(&self) -> &str {
        "Read a UTF-8 text file and return its contents."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path of the file to read" }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    fn execute(&self, args: &Value) -> ToolOutcome {
        let path = match required_str(args, "path") {
            Ok(p) => p,
            Err(outcome) => return outcome,
        };
        debug!(path, "file_read tool");
        match std::fs::read_to_string(path) {
            Ok(content) => ToolOutcome::ok(json!({ "content": content })),
            Err(e) => ToolOutcome::fail(format!("Failed to read {path}: {e}"), "IO"),
        }
    }
}

pub struct FileWriteTool;

impl Tool for FileWriteTool {
    fn name(&self) -> &str {
        "file_write"
    }

    fn description(&self) -> &str {
        "Write content to a file, replacing it if it exists. Parent \
         directories are created as needed."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path of the file to write" },
                "content": { "type": "string", "description": "Full file content" }
            },
            "required": ["path", "content"],
            "additionalProperties": false
        })
    }

    fn execute(&self, args: &Value) -> ToolOutcome {
        let path = match required_str(args, "path") {
            Ok(p) => p,
            Err(outcome) => return outcome,
        };
        let content = match args.get("content").and_then(Value::as_str) {
            Some(c) => c,
            None => {
                return ToolOutcome::fail("Missing required parameter: content", "INVALID_ARG")
            }
        };
        debug!(path, bytes = content.len(), "file_write tool");

        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    return ToolOutcome::fail(
                        format!("Failed to create {}: {e}", parent.display()),
                        "IO",
                    );
                }
            }
        }
        match std::fs::write(path, content) {
            Ok(()) => ToolOutcome::ok(json!({ "bytes_written": content.len() })),
            Err(e) => ToolOutcome::fail(format!("Failed to write {path}: {e}"), "IO"),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");
        let path_str = path.to_str().unwrap();

        let wrote = FileWriteTool.execute(&json!({ "path": path_str, "content": "hello" }));
        assert!(wrote.success);
        assert_eq!(wrote.payload["bytes_written"], 5);

        let read = FileReadTool.execute(&json!({ "path": path_str }));
        assert!(read.success);
        assert_eq!(read.payload["content"], "hello");
    }

    #[test]
    fn write_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/c.txt");
        let out =
            FileWriteTool.execute(&json!({ "path": path.to_str().unwrap(), "content": "x" }));
        assert!(out.success);
        assert!(path.exists());
    }

    #[test]
    fn read_missing_file_is_io_error() {
        let out = FileReadTool.execute(&json!({ "path": "/nonexistent/definitely/missing" }));
        assert!(!out.success);
        assert_eq!(out.error_code.as_deref(), Some("IO"));
    }

    #[test]
    fn content_is_required_for_write() {
        let out = FileWriteTool.execute(&json!({ "path": "/tmp/x" }));
        assert!(!out.success);
        assert_eq!(out.error_code.as_deref(), Some("INVALID_ARG"));
    }

    #[test]
    fn empty_content_is_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.txt");
        let out =
            FileWriteTool.execute(&json!({ "path": path.to_str().unwrap(), "content": "" }));
        assert!(out.success);
        assert_eq!(out.payload["bytes_written"], 0);
    }
}
