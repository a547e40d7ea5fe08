// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Anthropic Messages API driver.
//!
//! Serializes the neutral request into the `/v1/messages` wire format and
//! parses the SSE stream (`message_start` .. `message_stop`) into neutral
//! events.  Thinking blocks round-trip verbatim, including signatures.

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

pub struct AnthropicProvider {
    api_key: Option<String>,
    base_url: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(api_key: Option<String>, base_url: Option<String>) -> Self {
        Self {
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".into()),
            client: reqwest::Client::new(),
        }
    }
}

/// Thinking budget in tokens for each level.
fn thinking_budget(level: ThinkingLevel) -> Option<u32> {
    match level {
        ThinkingLevel::None => None,
        ThinkingLevel::Low => Some(2048),
        ThinkingLevel::Medium => Some(8192),
        ThinkingLevel::High => Some(16384),
    }
}

#[async_trait]
impl crate::Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, req: Request) -> anyhow::Result<EventStream> {
        let key = self
            .api_key
            .as_deref()
            .context("ANTHROPIC_API_KEY not set")?;

        let body = build_request_body(&req);
        debug!(model = %req.model, messages = req.messages.len(), "sending anthropic request");

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .context("Anthropic request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("Anthropic error {status}: {text}");
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
                                    .map(|v| parse_event(&mut ctx, &v))
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
            // The HTTP body may close without a message_stop (proxy cutoffs);
            // guarantee exactly one terminal event either way.
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
    let messages: Vec<Value> = req.messages.iter().map(message_to_wire).collect();

    let tools: Vec<Value> = req
        .tools
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "input_schema": t.input_schema,
            })
        })
        .collect();

    let mut body = json!({
        "model": req.model,
        "messages": messages,
        "max_tokens": req.max_completion_tokens,
        "temperature": req.temperature,
        "stream": req.stream,
    });
    if let Some(system) = &req.system_prompt {
        if !system.is_empty() {
            body["system"] = json!(system);
        }
    }
    if !tools.is_empty() {
        body["tools"] = json!(tools);
    }
    if let Some(budget) = thinking_budget(req.thinking_level) {
        body["thinking"] = json!({ "type": "enabled", "budget_tokens": budget });
        // The API rejects temperature together with extended thinking.
        if let Some(obj) = body.as_object_mut() {
            obj.remove("temperature");
        }
    }
    body
}

/// Convert one neutral message into the Anthropic wire format.
///
/// A message with a single text block serializes as `content: "<text>"`;
/// any other shape becomes an array of typed content objects.  The internal
/// `tool` role is emitted as `user`; Anthropic has no distinct tool role.
pub(crate) fn message_to_wire(m: &Message) -> Value {
    let role = match m.role {
        Role::User | Role::Tool => "user",
        Role::Assistant => "assistant",
    };

    if let Some(text) = m.as_text() {
        return json!({ "role": role, "content": text });
    }

    let content: Vec<Value> = m
        .blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(json!({ "type": "text", "text": text })),
            ContentBlock::Thinking { text, signature } => {
                // Empty thinking is dropped on serialization.
                if text.is_empty() {
                    return None;
                }
                let mut block = json!({ "type": "thinking", "thinking": text });
                if let Some(sig) = signature {
                    block["signature"] = json!(sig);
                }
                Some(block)
            }
            ContentBlock::RedactedThinking { data } => {
                Some(json!({ "type": "redacted_thinking", "data": data }))
            }
            ContentBlock::ToolCall { id, name, arguments, .. } => Some(json!({
                "type": "tool_use",
                "id": id,
                "name": name,
                "input": serde_json::from_str::<Value>(arguments).unwrap_or(json!({})),
            })),
            ContentBlock::ToolResult { tool_call_id, content, is_error } => {
                let mut block = json!({
                    "type": "tool_result",
                    "tool_use_id": tool_call_id,
                    "content": content,
                });
                if *is_error {
                    block["is_error"] = json!(true);
                }
                Some(block)
            }
        })
        .collect();

    json!({ "role": role, "content": content })
}

// ─── SSE parsing ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
enum BlockKind {
    Text,
    Thinking,
    ToolUse,
    Other,
}

#[derive(Debug)]
pub(crate) struct StreamCtx {
    started: bool,
    usage: Usage,
    finish: FinishReason,
    block_kinds: HashMap<u32, BlockKind>,
    terminal_sent: bool,
}

impl Default for StreamCtx {
    fn default() -> Self {
        Self {
            started: false,
            usage: Usage::default(),
            finish: FinishReason::Stop,
            block_kinds: HashMap::new(),
            terminal_sent: false,
        }
    }
}

pub(crate) fn parse_event(ctx: &mut StreamCtx, v: &Value) -> Vec<StreamEvent> {
    let mut out = Vec::new();
    match v["type"].as_str().unwrap_or("") {
        "message_start" => {
            if !ctx.started {
                ctx.started = true;
                let model = v["message"]["model"].as_str().unwrap_or("").to_string();
                out.push(StreamEvent::Start { model });
            }
            if let Some(usage) = v["message"].get("usage") {
                ctx.usage.input_tokens = usage["input_tokens"].as_u64().unwrap_or(0) as u32;
                out.push(StreamEvent::Usage(ctx.usage));
            }
        }
        "content_block_start" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            let block = &v["content_block"];
            match block["type"].as_str().unwrap_or("") {
                "tool_use" => {
                    ctx.block_kinds.insert(index, BlockKind::ToolUse);
                    out.push(StreamEvent::ToolCallStart {
                        index,
                        id: block["id"].as_str().unwrap_or("").to_string(),
                        name: block["name"].as_str().unwrap_or("").to_string(),
                    });
                }
                "thinking" => {
                    ctx.block_kinds.insert(index, BlockKind::Thinking);
                }
                "redacted_thinking" => {
                    ctx.block_kinds.insert(index, BlockKind::Other);
                    let data = block["data"].as_str().unwrap_or("").to_string();
                    if !data.is_empty() {
                        out.push(StreamEvent::RedactedThinking { data });
                    }
                }
                _ => {
                    ctx.block_kinds.insert(index, BlockKind::Text);
                }
            }
        }
        "content_block_delta" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            let delta = &v["delta"];
            match delta["type"].as_str().unwrap_or("") {
                "text_delta" => {
                    let text = delta["text"].as_str().unwrap_or("").to_string();
                    if !text.is_empty() {
                        out.push(StreamEvent::TextDelta { text, index });
                    }
                }
                "thinking_delta" => {
                    let text = delta["thinking"].as_str().unwrap_or("").to_string();
                    if !text.is_empty() {
                        out.push(StreamEvent::ThinkingDelta { text, index });
                    }
                }
                "input_json_delta" => {
                    let fragment = delta["partial_json"].as_str().unwrap_or("").to_string();
                    out.push(StreamEvent::ToolCallDelta { index, arguments_fragment: fragment });
                }
                // Signature blob closing a thinking block; preserved so the
                // block validates on the next request.  Never rendered.
                "signature_delta" => {
                    let sig = delta["signature"].as_str().unwrap_or("").to_string();
                    if !sig.is_empty() {
                        out.push(StreamEvent::ThinkingSignature { signature: sig });
                    }
                }
                _ => {}
            }
        }
        "content_block_stop" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            if ctx.block_kinds.get(&index) == Some(&BlockKind::ToolUse) {
                out.push(StreamEvent::ToolCallDone { index });
            }
        }
        "message_delta" => {
            match v["delta"]["stop_reason"].as_str() {
                Some("tool_use") => ctx.finish = FinishReason::ToolCalls,
                Some("max_tokens") => ctx.finish = FinishReason::Length,
                Some("end_turn") | Some("stop_sequence") => ctx.finish = FinishReason::Stop,
                Some("refusal") => ctx.finish = FinishReason::ContentFilter,
                Some(_) => ctx.finish = FinishReason::Other,
                None => {}
            }
            if let Some(usage) = v.get("usage") {
                ctx.usage.output_tokens = usage["output_tokens"].as_u64().unwrap_or(0) as u32;
                out.push(StreamEvent::Usage(ctx.usage));
            }
        }
        "message_stop" => {
            ctx.terminal_sent = true;
            out.push(StreamEvent::Done { finish_reason: ctx.finish, usage: ctx.usage });
        }
        "error" => {
            let err = &v["error"];
            let message = err["message"].as_str().unwrap_or("stream error").to_string();
            let retryable = err["type"].as_str() == Some("overloaded_error");
            ctx.terminal_sent = true;
            out.push(StreamEvent::Error { message, retryable });
        }
        // ping and unknown events are ignored for forward compatibility.
        _ => {}
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(ctx: &mut StreamCtx, v: Value) -> Vec<StreamEvent> {
        parse_event(ctx, &v)
    }

    // ── Serialization ─────────────────────────────────────────────────────────

    #[test]
    fn single_text_block_collapses_to_string_content() {
        let wire = message_to_wire(&Message::user("hello"));
        assert_eq!(wire["role"], "user");
        assert_eq!(wire["content"], "hello");
    }

    #[test]
    fn tool_role_maps_to_user_role() {
        let wire = message_to_wire(&Message::tool_result("tc_1", "output", false));
        assert_eq!(wire["role"], "user");
        let block = &wire["content"][0];
        assert_eq!(block["type"], "tool_result");
        assert_eq!(block["tool_use_id"], "tc_1");
        assert!(block.get("is_error").is_none());
    }

    #[test]
    fn tool_result_error_flag_serialized_when_set() {
        let wire = message_to_wire(&Message::tool_result("tc_1", "boom", true));
        assert_eq!(wire["content"][0]["is_error"], true);
    }

    #[test]
    fn tool_call_arguments_embedded_as_object() {
        let wire = message_to_wire(&Message::tool_call("tc", "bash", r#"{"command":"ls"}"#));
        let block = &wire["content"][0];
        assert_eq!(block["type"], "tool_use");
        assert_eq!(block["input"]["command"], "ls");
    }

    #[test]
    fn malformed_arguments_fall_back_to_empty_object() {
        let wire = message_to_wire(&Message::tool_call("tc", "bash", "{broken"));
        assert_eq!(wire["content"][0]["input"], json!({}));
    }

    #[test]
    fn empty_thinking_block_dropped_on_serialization() {
        let m = Message::tool_call_with_thinking(Some(""), None, None, "tc", "f", "{}", None);
        let wire = message_to_wire(&m);
        let content = wire["content"].as_array().unwrap();
        assert_eq!(content.len(), 1);
        assert_eq!(content[0]["type"], "tool_use");
    }

    #[test]
    fn thinking_signature_preserved_on_serialization() {
        let m = Message::tool_call_with_thinking(
            Some("deep thought"),
            Some("sig_1"),
            None,
            "tc",
            "f",
            "{}",
            None,
        );
        let wire = message_to_wire(&m);
        let thinking = &wire["content"][0];
        assert_eq!(thinking["type"], "thinking");
        assert_eq!(thinking["thinking"], "deep thought");
        assert_eq!(thinking["signature"], "sig_1");
    }

    #[test]
    fn redacted_thinking_serialized_verbatim() {
        let m = Message::tool_call_with_thinking(None, None, Some("blob"), "tc", "f", "{}", None);
        let wire = message_to_wire(&m);
        assert_eq!(wire["content"][0]["type"], "redacted_thinking");
        assert_eq!(wire["content"][0]["data"], "blob");
    }

    #[test]
    fn thinking_level_adds_budget_and_drops_temperature() {
        let mut req = Request::new("claude-sonnet-4-5", &[Message::user("q")]);
        req.thinking_level = ThinkingLevel::Medium;
        let body = build_request_body(&req);
        assert_eq!(body["thinking"]["budget_tokens"], 8192);
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn thinking_none_omits_section() {
        let req = Request::new("claude-sonnet-4-5", &[Message::user("q")]);
        let body = build_request_body(&req);
        assert!(body.get("thinking").is_none());
        assert!(body.get("temperature").is_some());
    }

    #[test]
    fn system_prompt_serialized_top_level() {
        let mut req = Request::new("m", &[Message::user("q")]);
        req.system_prompt = Some("be brief".into());
        let body = build_request_body(&req);
        assert_eq!(body["system"], "be brief");
    }

    // ── SSE parsing ───────────────────────────────────────────────────────────

    #[test]
    fn message_start_emits_start_and_usage() {
        let mut ctx = StreamCtx::default();
        let events = parse_one(
            &mut ctx,
            json!({
                "type": "message_start",
                "message": { "model": "claude-sonnet-4-5", "usage": { "input_tokens": 42 } }
            }),
        );
        assert!(matches!(&events[0], StreamEvent::Start { model } if model == "claude-sonnet-4-5"));
        assert!(matches!(&events[1], StreamEvent::Usage(u) if u.input_tokens == 42));
    }

    #[test]
    fn tool_use_block_lifecycle() {
        let mut ctx = StreamCtx::default();
        let start = parse_one(
            &mut ctx,
            json!({
                "type": "content_block_start",
                "index": 1,
                "content_block": { "type": "tool_use", "id": "toolu_01", "name": "bash" }
            }),
        );
        assert!(matches!(&start[0], StreamEvent::ToolCallStart { index: 1, id, name }
            if id == "toolu_01" && name == "bash"));

        let delta = parse_one(
            &mut ctx,
            json!({
                "type": "content_block_delta",
                "index": 1,
                "delta": { "type": "input_json_delta", "partial_json": "{\"command\":" }
            }),
        );
        assert!(matches!(&delta[0], StreamEvent::ToolCallDelta { index: 1, arguments_fragment }
            if arguments_fragment == "{\"command\":"));

        let stop = parse_one(&mut ctx, json!({ "type": "content_block_stop", "index": 1 }));
        assert!(matches!(&stop[0], StreamEvent::ToolCallDone { index: 1 }));
    }

    #[test]
    fn text_block_stop_emits_nothing() {
        let mut ctx = StreamCtx::default();
        parse_one(
            &mut ctx,
            json!({
                "type": "content_block_start",
                "index": 0,
                "content_block": { "type": "text" }
            }),
        );
        let stop = parse_one(&mut ctx, json!({ "type": "content_block_stop", "index": 0 }));
        assert!(stop.is_empty());
    }

    #[test]
    fn thinking_and_signature_deltas() {
        let mut ctx = StreamCtx::default();
        let thinking = parse_one(
            &mut ctx,
            json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": { "type": "thinking_delta", "thinking": "hmm" }
            }),
        );
        assert!(matches!(&thinking[0], StreamEvent::ThinkingDelta { text, .. } if text == "hmm"));

        let sig = parse_one(
            &mut ctx,
            json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": { "type": "signature_delta", "signature": "EqRk" }
            }),
        );
        assert!(matches!(&sig[0], StreamEvent::ThinkingSignature { signature } if signature == "EqRk"));
    }

    #[test]
    fn empty_thinking_delta_emits_nothing() {
        let mut ctx = StreamCtx::default();
        let events = parse_one(
            &mut ctx,
            json!({
                "type": "content_block_delta",
                "delta": { "type": "thinking_delta", "thinking": "" }
            }),
        );
        assert!(events.is_empty());
    }

    #[test]
    fn stop_reason_tool_use_maps_to_tool_calls_finish() {
        let mut ctx = StreamCtx::default();
        parse_one(
            &mut ctx,
            json!({
                "type": "message_delta",
                "delta": { "stop_reason": "tool_use" },
                "usage": { "output_tokens": 7 }
            }),
        );
        let done = parse_one(&mut ctx, json!({ "type": "message_stop" }));
        assert!(matches!(&done[0], StreamEvent::Done { finish_reason: FinishReason::ToolCalls, usage }
            if usage.output_tokens == 7));
    }

    #[test]
    fn max_tokens_maps_to_length_finish() {
        let mut ctx = StreamCtx::default();
        parse_one(
            &mut ctx,
            json!({ "type": "message_delta", "delta": { "stop_reason": "max_tokens" } }),
        );
        let done = parse_one(&mut ctx, json!({ "type": "message_stop" }));
        assert!(matches!(&done[0], StreamEvent::Done { finish_reason: FinishReason::Length, .. }));
    }

    #[test]
    fn overloaded_error_is_retryable() {
        let mut ctx = StreamCtx::default();
        let events = parse_one(
            &mut ctx,
            json!({
                "type": "error",
                "error": { "type": "overloaded_error", "message": "try later" }
            }),
        );
        assert!(matches!(&events[0], StreamEvent::Error { retryable: true, message }
            if message == "try later"));
    }

    #[test]
    fn unknown_event_types_ignored() {
        let mut ctx = StreamCtx::default();
        assert!(parse_one(&mut ctx, json!({ "type": "ping" })).is_empty());
        assert!(parse_one(&mut ctx, json!({ "type": "some_future_event" })).is_empty());
    }
}
