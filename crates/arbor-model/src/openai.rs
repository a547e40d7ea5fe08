// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! OpenAI Responses API driver.
//!
//! Serializes the neutral request into `/v1/responses` input items and maps
//! the named SSE events back to neutral events.  At most one tool call is in
//! progress at a time; a new `output_item.added` function call implicitly
//! closes the prior one with a synthetic `ToolCallDone`.

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

pub struct OpenAiProvider {
    api_key: Option<String>,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(api_key: Option<String>, base_url: Option<String>) -> Self {
        Self {
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com".into()),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl crate::Provider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, req: Request) -> anyhow::Result<EventStream> {
        let key = self.api_key.as_deref().context("OPENAI_API_KEY not set")?;

        let body = build_request_body(&req);
        debug!(model = %req.model, messages = req.messages.len(), "sending openai request");

        let resp = self
            .client
            .post(format!("{}/v1/responses", self.base_url))
            .bearer_auth(key)
            .json(&body)
            .send()
            .await
            .context("OpenAI request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("OpenAI error {status}: {text}");
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
                                let name = frame.event.unwrap_or_default();
                                serde_json::from_str::<Value>(&frame.data)
                                    .map(|v| parse_event(&mut ctx, &name, &v))
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
            // Completion is driven by HTTP close, not by response.completed.
            .chain(futures::stream::once(async move {
                let mut ctx = ctx.lock().unwrap();
                if ctx.terminal_sent {
                    Vec::new()
                } else {
                    ctx.terminal_sent = true;
                    let mut out = Vec::new();
                    if ctx.in_tool_call {
                        out.push(StreamEvent::ToolCallDone { index: ctx.tool_call_index });
                    }
                    out.push(StreamEvent::Done { finish_reason: ctx.finish, usage: ctx.usage });
                    out
                }
            })
            .flat_map(futures::stream::iter));

        Ok(Box::pin(event_stream))
    }
}

// ─── Request serialization ───────────────────────────────────────────────────

fn build_request_body(req: &Request) -> Value {
    let mut input: Vec<Value> = Vec::new();
    for m in &req.messages {
        input.extend(message_to_items(m));
    }

    let tools: Vec<Value> = req
        .tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "name": t.name,
                "description": t.description,
                "parameters": t.input_schema,
            })
        })
        .collect();

    let mut body = json!({
        "model": req.model,
        "input": input,
        "stream": req.stream,
        "max_output_tokens": req.max_completion_tokens,
        "temperature": req.temperature,
    });
    if let Some(system) = &req.system_prompt {
        if !system.is_empty() {
            body["instructions"] = json!(system);
        }
    }
    if !tools.is_empty() {
        body["tools"] = json!(tools);
    }
    if req.thinking_level != ThinkingLevel::None {
        body["reasoning"] = json!({ "effort": req.thinking_level.as_str() });
        // Reasoning models reject sampling parameters.
        if let Some(obj) = body.as_object_mut() {
            obj.remove("temperature");
        }
    }
    body
}

/// Convert one neutral message into Responses API input items.
///
/// A single-text message serializes as string content; richer shapes become
/// typed content arrays (`input_text` for user turns, `output_text` for
/// assistant turns).  Tool calls and results become their own top-level
/// items.  Thinking blocks are server-held on this API and are dropped.
pub(crate) fn message_to_items(m: &Message) -> Vec<Value> {
    let mut items = Vec::new();

    if let Some(text) = m.as_text() {
        return vec![json!({ "role": role_str(m.role), "content": text })];
    }

    let mut text_parts: Vec<Value> = Vec::new();
    for block in &m.blocks {
        match block {
            ContentBlock::Text { text } => {
                let part_type = match m.role {
                    Role::Assistant => "output_text",
                    _ => "input_text",
                };
                text_parts.push(json!({ "type": part_type, "text": text }));
            }
            ContentBlock::ToolCall { id, name, arguments, .. } => {
                items.push(json!({
                    "type": "function_call",
                    "call_id": id,
                    "name": name,
                    "arguments": arguments,
                }));
            }
            ContentBlock::ToolResult { tool_call_id, content, .. } => {
                items.push(json!({
                    "type": "function_call_output",
                    "call_id": tool_call_id,
                    "output": content,
                }));
            }
            // Reasoning state is held server-side by this API.
            ContentBlock::Thinking { .. } | ContentBlock::RedactedThinking { .. } => {}
        }
    }

    if !text_parts.is_empty() {
        items.insert(0, json!({ "role": role_str(m.role), "content": text_parts }));
    }
    items
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::User | Role::Tool => "user",
        Role::Assistant => "assistant",
    }
}

// ─── SSE parsing ─────────────────────────────────────────────────────────────

#[derive(Debug)]
pub(crate) struct StreamCtx {
    started: bool,
    in_tool_call: bool,
    tool_call_index: u32,
    usage: Usage,
    finish: FinishReason,
    terminal_sent: bool,
}

impl Default for StreamCtx {
    fn default() -> Self {
        Self {
            started: false,
            in_tool_call: false,
            tool_call_index: 0,
            usage: Usage::default(),
            finish: FinishReason::Stop,
            terminal_sent: false,
        }
    }
}

pub(crate) fn parse_event(ctx: &mut StreamCtx, event_name: &str, v: &Value) -> Vec<StreamEvent> {
    let mut out = Vec::new();
    match event_name {
        "response.created" => {
            if !ctx.started {
                ctx.started = true;
                let model = v["response"]["model"].as_str().unwrap_or("").to_string();
                out.push(StreamEvent::Start { model });
            }
        }
        "response.output_text.delta" => {
            let text = v["delta"].as_str().unwrap_or("").to_string();
            if !text.is_empty() {
                out.push(StreamEvent::TextDelta {
                    text,
                    index: v["output_index"].as_u64().unwrap_or(0) as u32,
                });
            }
        }
        "response.reasoning_summary_text.delta" => {
            let text = v["delta"].as_str().unwrap_or("").to_string();
            if !text.is_empty() {
                out.push(StreamEvent::ThinkingDelta {
                    text,
                    index: v["output_index"].as_u64().unwrap_or(0) as u32,
                });
            }
        }
        "response.output_item.added" => {
            let item = &v["item"];
            if item["type"].as_str() == Some("function_call") {
                // At most one tool call in progress: implicitly close the prior.
                if ctx.in_tool_call {
                    out.push(StreamEvent::ToolCallDone { index: ctx.tool_call_index });
                }
                let index = v["output_index"].as_u64().unwrap_or(0) as u32;
                ctx.in_tool_call = true;
                ctx.tool_call_index = index;
                ctx.finish = FinishReason::ToolCalls;
                out.push(StreamEvent::ToolCallStart {
                    index,
                    id: item["call_id"].as_str().unwrap_or("").to_string(),
                    name: item["name"].as_str().unwrap_or("").to_string(),
                });
            }
        }
        "response.function_call_arguments.delta" => {
            let fragment = v["delta"].as_str().unwrap_or("").to_string();
            out.push(StreamEvent::ToolCallDelta {
                index: v["output_index"].as_u64().unwrap_or(0) as u32,
                arguments_fragment: fragment,
            });
        }
        // Arguments already accumulated via delta events.
        "response.function_call_arguments.done" => {}
        "response.output_item.done" => {
            if ctx.in_tool_call && v["item"]["type"].as_str() == Some("function_call") {
                ctx.in_tool_call = false;
                out.push(StreamEvent::ToolCallDone { index: ctx.tool_call_index });
            }
        }
        // Completion is driven by HTTP close; only usage is read here.
        "response.completed" => {
            if let Some(usage) = v["response"].get("usage") {
                parse_usage(usage, &mut ctx.usage);
                out.push(StreamEvent::Usage(ctx.usage));
            }
            if v["response"]["incomplete_details"]["reason"].as_str()
                == Some("max_output_tokens")
            {
                ctx.finish = FinishReason::Length;
            }
        }
        "error" => {
            let message = v["message"]
                .as_str()
                .or_else(|| v["error"]["message"].as_str())
                .unwrap_or("stream error")
                .to_string();
            ctx.terminal_sent = true;
            out.push(StreamEvent::Error { message, retryable: false });
        }
        // Unrecognized event names are ignored for forward compatibility.
        _ => {}
    }
    out
}

/// Read `input_tokens`, `output_tokens`, `total_tokens` (computed if absent)
/// and nested `output_tokens_details.reasoning_tokens`.
pub(crate) fn parse_usage(usage: &Value, out: &mut Usage) {
    if let Some(n) = usage["input_tokens"].as_u64() {
        out.input_tokens = n as u32;
    }
    if let Some(n) = usage["output_tokens"].as_u64() {
        out.output_tokens = n as u32;
    }
    match usage["total_tokens"].as_u64() {
        Some(n) => out.total_tokens = Some(n as u32),
        None => {
            if out.input_tokens > 0 || out.output_tokens > 0 {
                out.total_tokens = Some(out.input_tokens + out.output_tokens);
            }
        }
    }
    if let Some(n) = usage["output_tokens_details"]["reasoning_tokens"].as_u64() {
        out.thinking_tokens = Some(n as u32);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
