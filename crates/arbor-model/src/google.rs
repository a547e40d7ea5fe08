// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Google Gemini driver for the native Generative Language API.
//!
//! Uses `streamGenerateContent?alt=sse`.  Supports text, tool calls with
//! thought signatures, and thinking deltas via `thought` parts.
//!
//! Gemini matches function responses to calls by function *name*, not by
//! the opaque call id, so serialization carries a call-id → name map.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    message::{ContentBlock, Message, Role, ThinkingLevel},
    provider::EventStream,
    sse::SseParser,
    FinishReason, Request, StreamEvent, Usage,
};

pub struct GoogleProvider {
    api_key: Option<String>,
    base_url: String,
    client: reqwest::Client,
}

impl GoogleProvider {
    pub fn new(api_key: Option<String>, base_url: Option<String>) -> Self {
        Self {
            api_key,
            base_url: base_url
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com".into()),
            client: reqwest::Client::new(),
        }
    }
}

fn thinking_budget(level: ThinkingLevel) -> Option<u32> {
    match level {
        ThinkingLevel::None => None,
        ThinkingLevel::Low => Some(2048),
        ThinkingLevel::Medium => Some(8192),
        ThinkingLevel::High => Some(16384),
    }
}

#[async_trait]
impl crate::Provider for GoogleProvider {
    fn name(&self) -> &str {
        "google"
    }

    async fn complete(&self, req: Request) -> anyhow::Result<EventStream> {
        let key = self.api_key.as_deref().context("GOOGLE_API_KEY not set")?;

        let body = build_request_body(&req);
        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.base_url.trim_end_matches('/'),
            req.model,
        );

        debug!(model = %req.model, "sending google request");

        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", key)
            .json(&body)
            .send()
            .await
            .context("Google request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("Google error {status}: {text}");
        }

        let ctx = Arc::new(Mutex::new(StreamCtx::default()));
        let parse_ctx = Arc::clone(&ctx);
        let byte_stream = resp.bytes_stream();

        let event_stream = byte_stream
            .scan(SseParser::new(), move |parser, chunk| {
                let events: Vec<StreamEvent> = match chunk {
                    Ok(bytes) => {
                        let text = String::from_utf8_lossy(&bytes).to_string();
                        let mut ctx = parse_ctx.lock().unwrap();
                        parser
                            .push(&text)
                            .into_iter()
                            .flat_map(|frame| {
                                serde_json::from_str::<Value>(&frame.data)
                                    .map(|v| parse_chunk(&mut ctx, &v))
                                    .unwrap_or_default()
                            })
                            .collect()
                    }
                    Err(e) => {
                        let mut ctx = parse_ctx.lock().unwrap();
                        ctx.terminal_sent = true;
                        vec![StreamEvent::Error { message: e.to_string(), retryable: true }]
                    }
                };
                futures::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter)
            // Gemini signals the end via finishReason; HTTP close is the
            // fallback terminal.
            .chain(futures::stream::once(async move {
                let mut ctx = ctx.lock().unwrap();
                if ctx.terminal_sent {
                    Vec::new()
                } else {
                    ctx.terminal_sent = true;
                    vec![StreamEvent::Done { finish_reason: ctx.finish, usage: ctx.usage }]
                }
            })
            .flat_map(futures::stream::iter));

        Ok(Box::pin(event_stream))
    }
}

// ─── Request serialization ───────────────────────────────────────────────────

fn build_request_body(req: &Request) -> Value {
    // Map tool_call_id → function name for functionResponse parts.
    let mut tc_name_map: HashMap<String, String> = HashMap::new();
    for m in &req.messages {
        for b in &m.blocks {
            if let ContentBlock::ToolCall { id, name, .. } = b {
                tc_name_map.insert(id.clone(), name.clone());
            }
        }
    }

    let contents: Vec<Value> = req
        .messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::Assistant => "model",
                Role::User | Role::Tool => "user",
            };
            json!({ "role": role, "parts": message_to_parts(m, &tc_name_map) })
        })
        .collect();

    let mut generation_config = json!({
        "maxOutputTokens": req.max_completion_tokens,
        "temperature": req.temperature,
    });
    if let Some(budget) = thinking_budget(req.thinking_level) {
        generation_config["thinkingConfig"] = json!({ "thinkingBudget": budget });
    }

    let mut body = json!({
        "contents": contents,
        "generationConfig": generation_config,
    });
    if let Some(system) = &req.system_prompt {
        if !system.is_empty() {
            body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }
    }
    if !req.tools.is_empty() {
        let declarations: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.input_schema,
                })
            })
            .collect();
        body["tools"] = json!([{ "functionDeclarations": declarations }]);
    }
    body
}

/// Convert one neutral message into Gemini `parts`.
pub(crate) fn message_to_parts(m: &Message, tc_name_map: &HashMap<String, String>) -> Vec<Value> {
    let mut parts = Vec::new();
    for block in &m.blocks {
        match block {
            ContentBlock::Text { text } => parts.push(json!({ "text": text })),
            ContentBlock::Thinking { text, .. } => {
                if !text.is_empty() {
                    parts.push(json!({ "text": text, "thought": true }));
                }
            }
            // Redacted reasoning has no Gemini representation.
            ContentBlock::RedactedThinking { .. } => {}
            ContentBlock::ToolCall { name, arguments, thought_signature, .. } => {
                let args: Value = serde_json::from_str(arguments).unwrap_or(json!({}));
                let mut part = json!({
                    "functionCall": { "name": name, "args": args }
                });
                if let Some(sig) = thought_signature {
                    part["thoughtSignature"] = json!(sig);
                }
                parts.push(part);
            }
            ContentBlock::ToolResult { tool_call_id, content, .. } => {
                let fn_name = tc_name_map
                    .get(tool_call_id)
                    .map(|s| s.as_str())
                    .unwrap_or(tool_call_id);
                parts.push(json!({
                    "functionResponse": {
                        "name": fn_name,
                        "response": { "output": content },
                    }
                }));
            }
        }
    }
    if parts.is_empty() {
        parts.push(json!({ "text": "" }));
    }
    parts
}

// ─── SSE parsing ─────────────────────────────────────────────────────────────

#[derive(Debug)]
pub(crate) struct StreamCtx {
    started: bool,
    usage: Usage,
    finish: FinishReason,
    saw_tool_call: bool,
    next_tool_index: u32,
    terminal_sent: bool,
}

impl Default for StreamCtx {
    fn default() -> Self {
        Self {
            started: false,
            usage: Usage::default(),
            finish: FinishReason::Stop,
            saw_tool_call: false,
            next_tool_index: 0,
            terminal_sent: false,
        }
    }
}

pub(crate) fn parse_chunk(ctx: &mut StreamCtx, v: &Value) -> Vec<StreamEvent> {
    let mut out = Vec::new();

    if !ctx.started {
        ctx.started = true;
        let model = v["modelVersion"].as_str().unwrap_or("").to_string();
        out.push(StreamEvent::Start { model });
    }

    if let Some(meta) = v.get("usageMetadata") {
        ctx.usage.input_tokens = meta["promptTokenCount"].as_u64().unwrap_or(0) as u32;
        ctx.usage.output_tokens = meta["candidatesTokenCount"].as_u64().unwrap_or(0) as u32;
        if let Some(n) = meta["thoughtsTokenCount"].as_u64() {
            ctx.usage.thinking_tokens = Some(n as u32);
        }
        if let Some(n) = meta["totalTokenCount"].as_u64() {
            ctx.usage.total_tokens = Some(n as u32);
        }
        out.push(StreamEvent::Usage(ctx.usage));
    }

    let candidate = &v["candidates"][0];
    if let Some(parts) = candidate["content"]["parts"].as_array() {
        for part in parts {
            if part.get("thought").and_then(Value::as_bool) == Some(true) {
                let text = part["text"].as_str().unwrap_or("").to_string();
                if !text.is_empty() {
                    out.push(StreamEvent::ThinkingDelta { text, index: 0 });
                }
                continue;
            }
            if let Some(fc) = part.get("functionCall") {
                // Gemini delivers whole calls; synthesize the start/delta/done
                // triple so downstream accumulation is uniform.
                let name = fc["name"].as_str().unwrap_or("").to_string();
                let args = serde_json::to_string(&fc["args"]).unwrap_or_else(|_| "{}".into());
                let index = ctx.next_tool_index;
                ctx.next_tool_index += 1;
                ctx.saw_tool_call = true;
                ctx.finish = FinishReason::ToolCalls;
                out.push(StreamEvent::ToolCallStart {
                    index,
                    id: name.clone(),
                    name,
                });
                out.push(StreamEvent::ToolCallDelta { index, arguments_fragment: args });
                if let Some(sig) = part["thoughtSignature"].as_str() {
                    out.push(StreamEvent::ToolCallThoughtSignature {
                        signature: sig.to_string(),
                    });
                }
                out.push(StreamEvent::ToolCallDone { index });
                continue;
            }
            if let Some(text) = part["text"].as_str() {
                if !text.is_empty() {
                    out.push(StreamEvent::TextDelta { text: text.to_string(), index: 0 });
                }
            }
        }
    }

    if let Some(reason) = candidate["finishReason"].as_str() {
        if !ctx.saw_tool_call {
            ctx.finish = match reason {
                "STOP" => FinishReason::Stop,
                "MAX_TOKENS" => FinishReason::Length,
                "SAFETY" | "PROHIBITED_CONTENT" => FinishReason::ContentFilter,
                _ => FinishReason::Other,
            };
        }
        ctx.terminal_sent = true;
        out.push(StreamEvent::Done { finish_reason: ctx.finish, usage: ctx.usage });
    }

    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Serialization ─────────────────────────────────────────────────────────

    #[test]
    fn assistant_role_maps_to_model() {
        let req = Request::new("gemini-3-pro", &[Message::assistant("hi")]);
        let body = build_request_body(&req);
        assert_eq!(body["contents"][0]["role"], "model");
    }

    #[test]
    fn function_response_uses_function_name_not_call_id() {
        let messages = vec![
            Message::tool_call("call_opaque_123", "file_read", "{}"),
            Message::tool_result("call_opaque_123", "contents", false),
        ];
        let req = Request::new("gemini-3-pro", &messages);
        let body = build_request_body(&req);
        let parts = &body["contents"][1]["parts"];
        assert_eq!(parts[0]["functionResponse"]["name"], "file_read");
    }

    #[test]
    fn function_response_falls_back_to_call_id_when_unmapped() {
        let parts = message_to_parts(
            &Message::tool_result("unmapped", "x", false),
            &HashMap::new(),
        );
        assert_eq!(parts[0]["functionResponse"]["name"], "unmapped");
    }

    #[test]
    fn tool_call_thought_signature_serialized_on_part() {
        let m = Message::tool_call_with_thinking(
            None, None, None, "id1", "bash", r#"{"command":"ls"}"#, Some("tsig_1"),
        );
        let parts = message_to_parts(&m, &HashMap::new());
        assert_eq!(parts[0]["thoughtSignature"], "tsig_1");
        assert_eq!(parts[0]["functionCall"]["args"]["command"], "ls");
    }

    #[test]
    fn empty_thinking_dropped_from_parts() {
        let m = Message::tool_call_with_thinking(Some(""), None, None, "i", "f", "{}", None);
        let parts = message_to_parts(&m, &HashMap::new());
        assert_eq!(parts.len(), 1);
        assert!(parts[0].get("functionCall").is_some());
    }

    #[test]
    fn thinking_budget_in_generation_config() {
        let mut req = Request::new("gemini-3-pro", &[Message::user("q")]);
        req.thinking_level = ThinkingLevel::Low;
        let body = build_request_body(&req);
        assert_eq!(
            body["generationConfig"]["thinkingConfig"]["thinkingBudget"],
            2048
        );
    }

    // ── Chunk parsing ─────────────────────────────────────────────────────────

    #[test]
    fn text_part_parsed_as_delta() {
        let mut ctx = StreamCtx::default();
        let events = parse_chunk(
            &mut ctx,
            &json!({ "candidates": [{ "content": { "parts": [{ "text": "hello" }] } }] }),
        );
        // First chunk also emits Start.
        assert!(matches!(&events[0], StreamEvent::Start { .. }));
        assert!(matches!(&events[1], StreamEvent::TextDelta { text, .. } if text == "hello"));
    }

    #[test]
    fn thought_part_parsed_as_thinking_delta() {
        let mut ctx = StreamCtx::default();
        ctx.started = true;
        let events = parse_chunk(
            &mut ctx,
            &json!({
                "candidates": [{ "content": { "parts": [{ "text": "mull", "thought": true }] } }]
            }),
        );
        assert!(matches!(&events[0], StreamEvent::ThinkingDelta { text, .. } if text == "mull"));
    }

    #[test]
    fn function_call_synthesizes_full_lifecycle() {
        let mut ctx = StreamCtx::default();
        ctx.started = true;
        let events = parse_chunk(
            &mut ctx,
            &json!({
                "candidates": [{
                    "content": {
                        "parts": [{
                            "functionCall": { "name": "bash", "args": { "command": "ls" } },
                            "thoughtSignature": "sig9"
                        }]
                    }
                }]
            }),
        );
        assert!(matches!(&events[0], StreamEvent::ToolCallStart { id, name, .. }
            if id == "bash" && name == "bash"));
        assert!(matches!(&events[1], StreamEvent::ToolCallDelta { arguments_fragment, .. }
            if arguments_fragment.contains("\"command\"")));
        assert!(matches!(&events[2], StreamEvent::ToolCallThoughtSignature { signature }
            if signature == "sig9"));
        assert!(matches!(&events[3], StreamEvent::ToolCallDone { .. }));
        assert_eq!(ctx.finish, FinishReason::ToolCalls);
    }

    #[test]
    fn finish_reason_stop_emits_done() {
        let mut ctx = StreamCtx::default();
        ctx.started = true;
        let events = parse_chunk(
            &mut ctx,
            &json!({ "candidates": [{ "finishReason": "STOP" }] }),
        );
        assert!(matches!(&events[0], StreamEvent::Done { finish_reason: FinishReason::Stop, .. }));
        assert!(ctx.terminal_sent);
    }

    #[test]
    fn finish_reason_does_not_override_tool_calls() {
        let mut ctx = StreamCtx::default();
        ctx.started = true;
        parse_chunk(
            &mut ctx,
            &json!({
                "candidates": [{
                    "content": { "parts": [{ "functionCall": { "name": "f", "args": {} } }] }
                }]
            }),
        );
        let events = parse_chunk(
            &mut ctx,
            &json!({ "candidates": [{ "finishReason": "STOP" }] }),
        );
        assert!(matches!(
            events.last().unwrap(),
            StreamEvent::Done { finish_reason: FinishReason::ToolCalls, .. }
        ));
    }

    #[test]
    fn usage_metadata_parsed() {
        let mut ctx = StreamCtx::default();
        ctx.started = true;
        let events = parse_chunk(
            &mut ctx,
            &json!({
                "usageMetadata": {
                    "promptTokenCount": 30,
                    "candidatesTokenCount": 12,
                    "thoughtsTokenCount": 4,
                    "totalTokenCount": 46
                }
            }),
        );
        assert!(matches!(&events[0], StreamEvent::Usage(u)
            if u.input_tokens == 30 && u.output_tokens == 12
                && u.thinking_tokens == Some(4) && u.total_tokens == Some(46)));
    }
}
