// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

use crate::message::{ContentBlock, Message, Role};

// ─── Neutral stream events ───────────────────────────────────────────────────

/// Why the provider stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    ContentFilter,
    Other,
}

/// Token usage reported by the provider for one turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub thinking_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

impl Usage {
    /// Total, computing `input + output` when the provider omitted it.
    pub fn total(&self) -> u32 {
        self.total_tokens
            .unwrap_or(self.input_tokens + self.output_tokens)
    }
}

/// A single event parsed from a provider stream.
///
/// Every stream delivers exactly one terminal event: `Done` or `Error`,
/// never both, never neither.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Emitted once before any delta.
    Start { model: String },
    TextDelta { text: String, index: u32 },
    ThinkingDelta { text: String, index: u32 },
    /// Opaque thinking signature attached to the current thinking block.
    ThinkingSignature { signature: String },
    /// Opaque blob standing in for withheld reasoning.
    RedactedThinking { data: String },
    ToolCallStart { index: u32, id: String, name: String },
    ToolCallDelta { index: u32, arguments_fragment: String },
    /// Signature attached to the in-progress tool call (Gemini thought
    /// signatures ride on the functionCall part).
    ToolCallThoughtSignature { signature: String },
    ToolCallDone { index: u32 },
    Usage(Usage),
    Done { finish_reason: FinishReason, usage: Usage },
    Error { message: String, retryable: bool },
}

// ─── Accumulator ─────────────────────────────────────────────────────────────

/// The tool call a finished stream asked for.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingToolCall {
    pub id: String,
    pub name: String,
    /// Accumulated JSON arguments; `{}` when the provider sent none.
    pub arguments: String,
    pub thought_signature: Option<String>,
}

/// Folds a stream of neutral events into an assistant message.
///
/// One accumulator lives per in-flight request.  On `Done` the collected
/// text / thinking / tool-call state is finalized into a [`Message`] whose
/// block order (thinking, redacted thinking, text, tool call) matches what
/// providers expect on the next request.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    pub model: String,
    text: String,
    thinking: String,
    thinking_signature: Option<String>,
    redacted: Option<String>,
    tool_call: Option<PendingToolCall>,
    tool_arguments: String,
    pub usage: Usage,
    pub finish_reason: Option<FinishReason>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event.  Terminal events set `finish_reason`; the caller
    /// decides what to do with the finished accumulator.
    pub fn apply(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::Start { model } => self.model = model.clone(),
            StreamEvent::TextDelta { text, .. } => self.text.push_str(text),
            StreamEvent::ThinkingDelta { text, .. } => self.thinking.push_str(text),
            StreamEvent::ThinkingSignature { signature } => {
                self.thinking_signature = Some(signature.clone());
            }
            StreamEvent::RedactedThinking { data } => self.redacted = Some(data.clone()),
            StreamEvent::ToolCallStart { id, name, .. } => {
                self.tool_call = Some(PendingToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: String::new(),
                    thought_signature: None,
                });
                self.tool_arguments.clear();
            }
            StreamEvent::ToolCallDelta { arguments_fragment, .. } => {
                self.tool_arguments.push_str(arguments_fragment);
            }
            StreamEvent::ToolCallThoughtSignature { signature } => {
                if let Some(tc) = &mut self.tool_call {
                    tc.thought_signature = Some(signature.clone());
                }
            }
            StreamEvent::ToolCallDone { .. } => {
                if let Some(tc) = &mut self.tool_call {
                    tc.arguments = if self.tool_arguments.is_empty() {
                        "{}".to_string()
                    } else {
                        self.tool_arguments.clone()
                    };
                }
            }
            StreamEvent::Usage(usage) => self.usage = *usage,
            StreamEvent::Done { finish_reason, usage } => {
                self.finish_reason = Some(*finish_reason);
                if usage.total() > 0 {
                    self.usage = *usage;
                }
                // Close a tool call whose ToolCallDone never arrived.
                if let Some(tc) = &mut self.tool_call {
                    if tc.arguments.is_empty() {
                        tc.arguments = if self.tool_arguments.is_empty() {
                            "{}".to_string()
                        } else {
                            self.tool_arguments.clone()
                        };
                    }
                }
            }
            StreamEvent::Error { .. } => {}
        }
    }

    pub fn visible_text(&self) -> &str {
        &self.text
    }

    pub fn pending_tool_call(&self) -> Option<&PendingToolCall> {
        self.tool_call.as_ref()
    }

    /// Finalize into an assistant message, or `None` when the stream
    /// produced no content at all.
    pub fn into_message(self) -> Option<Message> {
        let mut blocks = Vec::new();
        if !self.thinking.is_empty() {
            blocks.push(ContentBlock::Thinking {
                text: self.thinking,
                signature: self.thinking_signature,
            });
        }
        if let Some(data) = self.redacted {
            blocks.push(ContentBlock::RedactedThinking { data });
        }
        if !self.text.is_empty() {
            blocks.push(ContentBlock::Text { text: self.text });
        }
        if let Some(tc) = self.tool_call {
            blocks.push(ContentBlock::ToolCall {
                id: tc.id,
                name: tc.name,
                arguments: if tc.arguments.is_empty() { "{}".into() } else { tc.arguments },
                thought_signature: tc.thought_signature,
            });
        }
        if blocks.is_empty() {
            return None;
        }
        Some(Message { role: Role::Assistant, blocks, provider_metadata: None })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
