// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Handlers for the agent-control tools (`fork`, `kill`, `wait`, `send`).
//!
//! These run on the tool worker thread with a dedicated store handle plus a
//! read-only view of the live tree captured at spawn time.  Mutation of the
//! live tree happens later, on the main thread, when the coordinator
//! consumes the [`ToolCompletion`] payload.

use std::sync::atomic::AtomicBool;

use serde_json::{json, Value};
use tracing::debug;

use arbor_model::ThinkingLevel;
use arbor_store::{AgentRow, AgentStatus, Store};
use arbor_tools::{wrap_failure, wrap_success};

use crate::ident::generate_uuid;
use crate::wait::{fan_in, next_message, AgentPeek, WaitResult};

/// Everything the coordinator needs to instantiate the forked child on the
/// main thread.  Built by the worker; ownership transfers at on-complete.
#[derive(Debug, Clone)]
pub struct ChildSpec {
    pub uuid: String,
    pub name: String,
    pub parent_uuid: String,
    pub provider: String,
    pub model: String,
    pub thinking_level: ThinkingLevel,
    pub fork_message_id: Option<i64>,
    pub prompt: String,
}

/// What a finished worker hands back to the main thread.
#[derive(Debug)]
pub struct ToolCompletion {
    /// Envelope returned to the provider as the tool-result content.
    pub envelope: String,
    pub detail: CompletionDetail,
}

#[derive(Debug)]
pub enum CompletionDetail {
    /// Nothing to integrate beyond the tool result itself.
    Plain,
    /// Fork succeeded; the child joins the live tree at on-complete.
    ForkChild(ChildSpec),
    /// Kill succeeded; the target leaves the live array at on-complete.
    Killed { uuid: String },
    /// Wait finished; rendered into the caller's scrollback.
    Wait(WaitResult),
}

impl ToolCompletion {
    pub fn plain(envelope: String) -> Self {
        Self { envelope, detail: CompletionDetail::Plain }
    }

    /// Whether the envelope reports success.
    pub fn succeeded(&self) -> bool {
        serde_json::from_str::<Value>(&self.envelope)
            .map(|v| v["tool_success"] == json!(true))
            .unwrap_or(false)
    }
}

/// Caller identity and inherited configuration, captured at spawn time.
#[derive(Debug, Clone)]
pub struct CallerSnapshot {
    pub uuid: String,
    pub provider: String,
    pub model: String,
    pub thinking_level: ThinkingLevel,
}

/// Minimal view of one live agent for kill protection checks.
#[derive(Debug, Clone)]
pub struct TreePeek {
    pub uuid: String,
    pub parent_uuid: Option<String>,
}

// ─── fork ────────────────────────────────────────────────────────────────────

/// Tool-initiated fork: the child starts fresh with only the supplied
/// prompt.  The parent's conversation is not copied: a bare assistant turn
/// would lack the thinking blocks some providers require on replay.
pub fn fork_handler(
    store: &Store,
    session_id: i64,
    caller: &CallerSnapshot,
    args: &Value,
) -> ToolCompletion {
    let Some(name) = args.get("name").and_then(Value::as_str).filter(|s| !s.is_empty()) else {
        return ToolCompletion::plain(wrap_failure(
            "Missing required parameter: name",
            "INVALID_ARG",
        ));
    };
    let Some(prompt) = args.get("prompt").and_then(Value::as_str).filter(|s| !s.is_empty())
    else {
        return ToolCompletion::plain(wrap_failure(
            "Missing required parameter: prompt",
            "INVALID_ARG",
        ));
    };

    let fork_message_id = match store.last_message_id(&caller.uuid) {
        Ok(id) => id,
        Err(e) => {
            return ToolCompletion::plain(wrap_failure(
                format!("Failed to get fork message id: {e}"),
                "DB_ERROR",
            ));
        }
    };

    let child_uuid = generate_uuid();
    debug!(parent = %caller.uuid, child = %child_uuid, "fork handler");

    let row = AgentRow {
        uuid: child_uuid.clone(),
        session_id,
        parent_uuid: Some(caller.uuid.clone()),
        name: Some(name.to_string()),
        status: AgentStatus::Running,
        provider: caller.provider.clone(),
        model: caller.model.clone(),
        thinking_level: caller.thinking_level.as_str().to_string(),
        fork_message_id,
        created_at: chrono::Utc::now().to_rfc3339(),
        ended_at: None,
    };
    if let Err(e) = store.insert_agent(&row) {
        return ToolCompletion::plain(wrap_failure(
            format!("Failed to insert child agent: {e}"),
            "DB_ERROR",
        ));
    }

    // Fork events: the parent side records the relationship; the child side
    // doubles as a clear marker so restore never walks the parent's prefix.
    let parent_payload = json!({
        "role": "parent",
        "child_uuid": child_uuid,
        "fork_message_id": fork_message_id,
    });
    let child_payload = json!({ "role": "child" });
    let _ = store.insert_message(
        session_id,
        &caller.uuid,
        "fork",
        None,
        Some(&parent_payload.to_string()),
    );
    let _ = store.insert_message(
        session_id,
        &child_uuid,
        "fork",
        None,
        Some(&child_payload.to_string()),
    );

    let envelope = wrap_success(json!({ "child_uuid": child_uuid, "child_name": name }));
    ToolCompletion {
        envelope,
        detail: CompletionDetail::ForkChild(ChildSpec {
            uuid: child_uuid,
            name: name.to_string(),
            parent_uuid: caller.uuid.clone(),
            provider: caller.provider.clone(),
            model: caller.model.clone(),
            thinking_level: caller.thinking_level,
            fork_message_id,
            prompt: prompt.to_string(),
        }),
    }
}

// ─── kill ────────────────────────────────────────────────────────────────────

/// Resolve a kill target against the live tree and apply the protections:
/// the root is untouchable, and so is any (transitive) ancestor of the
/// caller.  Descendants of the target stay live.
pub fn kill_handler(
    store: &Store,
    caller_uuid: &str,
    tree: &[TreePeek],
    args: &Value,
) -> ToolCompletion {
    let Some(prefix) = args.get("uuid").and_then(Value::as_str).filter(|s| !s.is_empty()) else {
        return ToolCompletion::plain(wrap_failure(
            "Missing required parameter: uuid",
            "INVALID_ARG",
        ));
    };

    // Exact match wins over prefix match.
    let target = tree
        .iter()
        .find(|p| p.uuid == prefix)
        .or_else(|| {
            let mut matches = tree.iter().filter(|p| p.uuid.starts_with(prefix));
            match (matches.next(), matches.next()) {
                (Some(one), None) => Some(one),
                _ => None,
            }
        });

    let Some(target) = target else {
        return ToolCompletion::plain(wrap_failure(
            format!("Agent {prefix} is not running"),
            "ALREADY_DEAD",
        ));
    };

    if target.parent_uuid.is_none() {
        return ToolCompletion::plain(wrap_failure(
            "Cannot kill the root agent",
            "CANNOT_KILL_ROOT",
        ));
    }

    // Walk the caller's ancestor chain; killing an ancestor would orphan
    // the caller mid-execution.
    let mut cursor = tree
        .iter()
        .find(|p| p.uuid == caller_uuid)
        .and_then(|p| p.parent_uuid.clone());
    while let Some(ancestor) = cursor {
        if ancestor == target.uuid {
            return ToolCompletion::plain(wrap_failure(
                "Cannot kill an ancestor agent",
                "CANNOT_KILL_PARENT",
            ));
        }
        cursor = tree
            .iter()
            .find(|p| p.uuid == ancestor)
            .and_then(|p| p.parent_uuid.clone());
    }

    debug!(target = %target.uuid, "kill handler");
    if let Err(e) = store.mark_agent_dead(&target.uuid) {
        return ToolCompletion::plain(wrap_failure(
            format!("Failed to mark agent dead: {e}"),
            "DB_ERROR",
        ));
    }

    let envelope = wrap_success(json!({ "killed": [target.uuid] }));
    ToolCompletion {
        envelope,
        detail: CompletionDetail::Killed { uuid: target.uuid.clone() },
    }
}

// ─── wait ────────────────────────────────────────────────────────────────────

pub fn wait_handler(
    store: &Store,
    session_id: i64,
    caller_uuid: &str,
    peeks: &[AgentPeek],
    args: &Value,
    interrupt: &AtomicBool,
) -> ToolCompletion {
    let Some(timeout) = args.get("timeout").and_then(Value::as_i64) else {
        return ToolCompletion::plain(wrap_failure(
            "Missing required parameter: timeout",
            "INVALID_ARG",
        ));
    };

    let targets: Option<Vec<String>> = match args.get("from_agents") {
        Some(Value::Array(items)) => {
            let mut uuids = Vec::with_capacity(items.len());
            for item in items {
                match item.as_str() {
                    Some(s) => uuids.push(s.to_string()),
                    None => {
                        return ToolCompletion::plain(wrap_failure(
                            "from_agents must contain strings",
                            "INVALID_ARG",
                        ));
                    }
                }
            }
            Some(uuids)
        }
        _ => None,
    };

    let result = match &targets {
        Some(uuids) if !uuids.is_empty() => {
            fan_in(store, session_id, caller_uuid, timeout, uuids, peeks, interrupt)
        }
        _ => next_message(store, session_id, caller_uuid, timeout, interrupt),
    };

    let envelope = wrap_success(wait_result_json(&result));
    ToolCompletion { envelope, detail: CompletionDetail::Wait(result) }
}

/// JSON shape returned to the model for a wait outcome.
pub fn wait_result_json(result: &WaitResult) -> Value {
    if result.is_fanin {
        let entries: Vec<Value> = result
            .entries
            .iter()
            .map(|e| {
                let mut obj = json!({
                    "agent_uuid": e.agent_uuid,
                    "agent_name": e.agent_name,
                    "status": e.status,
                });
                if let Some(msg) = &e.message {
                    obj["message"] = json!(msg);
                }
                obj
            })
            .collect();
        json!({ "results": entries })
    } else {
        match (&result.from_uuid, &result.message) {
            (Some(from), Some(body)) => json!({ "from": from, "message": body }),
            _ => json!({ "status": "timeout" }),
        }
    }
}

// ─── send ────────────────────────────────────────────────────────────────────

pub fn send_handler(
    store: &Store,
    session_id: i64,
    caller_uuid: &str,
    args: &Value,
) -> ToolCompletion {
    let Some(to) = args.get("to").and_then(Value::as_str).filter(|s| !s.is_empty()) else {
        return ToolCompletion::plain(wrap_failure(
            "Missing required parameter: to",
            "INVALID_ARG",
        ));
    };
    let Some(body) = args.get("body").and_then(Value::as_str) else {
        return ToolCompletion::plain(wrap_failure(
            "Missing required parameter: body",
            "INVALID_ARG",
        ));
    };

    match store.insert_mail(session_id, caller_uuid, to, body) {
        Ok(id) => ToolCompletion::plain(wrap_success(json!({ "mail_id": id, "to": to }))),
        Err(e) => ToolCompletion::plain(wrap_failure(
            format!("Failed to deliver mail: {e}"),
            "DB_ERROR",
        )),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
