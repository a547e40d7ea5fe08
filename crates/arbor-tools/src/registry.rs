// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::tool::Tool;

/// A tool schema offered to the model, kept here so the tools crate stays
/// independent from the model crate.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Agent-control tools whose handlers live with the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalTool {
    Fork,
    Kill,
    Wait,
    Send,
}

/// How a registered tool is dispatched.
#[derive(Clone)]
pub enum ToolEntry {
    /// Executed directly on the worker thread.
    Handler(Arc<dyn Tool>),
    /// Dispatched by the coordinator through the deferred-completion path.
    Internal(InternalTool),
}

/// Central registry of all tools visible to the model.
pub struct ToolRegistry {
    entries: HashMap<String, (ToolSchema, ToolEntry)>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    /// Registry with every built-in registered: the plain tools plus the
    /// fork/kill/wait declarations.
    pub fn with_builtins(bash_output_limit: usize) -> Self {
        use crate::builtin;
        let mut reg = Self::new();
        reg.register(builtin::bash::BashTool { output_limit: bash_output_limit });
        reg.register(builtin::fs::FileReadTool);
        reg.register(builtin::fs::FileWriteTool);
        reg.register(builtin::glob::GlobTool);
        reg.register(builtin::grep::GrepTool);
        reg.register_internal_tools();
        reg
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let schema = ToolSchema {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            input_schema: tool.input_schema(),
        };
        self.entries
            .insert(schema.name.clone(), (schema, ToolEntry::Handler(Arc::new(tool))));
    }

    /// Declare the agent-control tools.  Their schemas come from the
    /// coordinator's contract: fork spawns a child, kill marks an agent
    /// dead, wait blocks on inter-agent mail.
    fn register_internal_tools(&mut self) {
        self.entries.insert(
            "fork".into(),
            (
                ToolSchema {
                    name: "fork".into(),
                    description: "Spawn a child agent that works on a task independently. \
                                  The child starts fresh with only the given prompt and \
                                  reports back via mail. Returns the child's uuid."
                        .into(),
                    input_schema: json!({
                        "type": "object",
                        "properties": {
                            "name": { "type": "string", "description": "Short name for the child agent" },
                            "prompt": { "type": "string", "description": "Task prompt the child starts with" }
                        },
                        "required": ["name", "prompt"],
                        "additionalProperties": false
                    }),
                },
                ToolEntry::Internal(InternalTool::Fork),
            ),
        );
        self.entries.insert(
            "kill".into(),
            (
                ToolSchema {
                    name: "kill".into(),
                    description: "Terminate another agent by uuid. The root agent and your \
                                  own ancestors cannot be killed."
                        .into(),
                    input_schema: json!({
                        "type": "object",
                        "properties": {
                            "uuid": { "type": "string", "description": "UUID of the agent to terminate" }
                        },
                        "required": ["uuid"],
                        "additionalProperties": false
                    }),
                },
                ToolEntry::Internal(InternalTool::Kill),
            ),
        );
        self.entries.insert(
            "wait".into(),
            (
                ToolSchema {
                    name: "wait".into(),
                    description: "Wait for mail from other agents. Without from_agents, \
                                  blocks until the next message arrives or the timeout \
                                  expires. With from_agents, returns a status snapshot per \
                                  listed agent without blocking past the timeout."
                        .into(),
                    input_schema: json!({
                        "type": "object",
                        "properties": {
                            "timeout": { "type": "integer", "description": "Seconds to wait; 0 polls once" },
                            "from_agents": {
                                "type": "array",
                                "items": { "type": "string" },
                                "description": "Agent UUIDs to snapshot (fan-in mode)"
                            }
                        },
                        "required": ["timeout"],
                        "additionalProperties": false
                    }),
                },
                ToolEntry::Internal(InternalTool::Wait),
            ),
        );
        self.entries.insert(
            "send".into(),
            (
                ToolSchema {
                    name: "send".into(),
                    description: "Send a mail message to another agent. The recipient \
                                  receives it through its wait tool."
                        .into(),
                    input_schema: json!({
                        "type": "object",
                        "properties": {
                            "to": { "type": "string", "description": "Recipient agent UUID" },
                            "body": { "type": "string", "description": "Message body" }
                        },
                        "required": ["to", "body"],
                        "additionalProperties": false
                    }),
                },
                ToolEntry::Internal(InternalTool::Send),
            ),
        );
    }

    pub fn get(&self, name: &str) -> Option<&(ToolSchema, ToolEntry)> {
        self.entries.get(name)
    }

    /// Schemas sorted by name, optionally filtered by an agent's toolset.
    pub fn schemas(&self, filter: Option<&[String]>) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .entries
            .values()
            .filter(|(schema, _)| match filter {
                Some(allowed) => allowed.iter().any(|a| a == &schema.name),
                None => true,
            })
            .map(|(schema, _)| schema.clone())
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
