// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

// ─── Content blocks ──────────────────────────────────────────────────────────

/// A single content block within a message.
///
/// Thinking blocks carry the provider's private reasoning and must round-trip
/// verbatim (including the opaque signature) so follow-up requests validate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    /// Opaque blob returned when the provider refuses to disclose thinking.
    RedactedThinking {
        data: String,
    },
    ToolCall {
        id: String,
        name: String,
        /// JSON-encoded argument object; `{}` when absent.
        arguments: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thought_signature: Option<String>,
    },
    ToolResult {
        tool_call_id: String,
        content: String,
        is_error: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

// ─── Message ─────────────────────────────────────────────────────────────────

/// A single message in an agent's conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub blocks: Vec<ContentBlock>,
    /// Opaque provider-specific payload carried across turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_metadata: Option<String>,
}

impl Message {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            blocks: vec![ContentBlock::Text { text: text.into() }],
            provider_metadata: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text(Role::Assistant, text)
    }

    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            blocks: vec![ContentBlock::ToolCall {
                id: id.into(),
                name: name.into(),
                arguments: arguments.into(),
                thought_signature: None,
            }],
            provider_metadata: None,
        }
    }

    /// Assistant message carrying thinking blocks ahead of a tool call.
    ///
    /// Block order matters to providers: thinking, then redacted thinking,
    /// then the tool call itself.
    #[allow(clippy::too_many_arguments)]
    pub fn tool_call_with_thinking(
        thinking_text: Option<&str>,
        thinking_sig: Option<&str>,
        redacted_data: Option<&str>,
        tool_id: &str,
        tool_name: &str,
        tool_args: &str,
        tool_thought_sig: Option<&str>,
    ) -> Self {
        let mut blocks = Vec::new();
        if let Some(text) = thinking_text {
            blocks.push(ContentBlock::Thinking {
                text: text.to_string(),
                signature: thinking_sig.map(str::to_string),
            });
        }
        if let Some(data) = redacted_data {
            blocks.push(ContentBlock::RedactedThinking { data: data.to_string() });
        }
        blocks.push(ContentBlock::ToolCall {
            id: tool_id.to_string(),
            name: tool_name.to_string(),
            arguments: tool_args.to_string(),
            thought_signature: tool_thought_sig.map(str::to_string),
        });
        Self { role: Role::Assistant, blocks, provider_metadata: None }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self {
            role: Role::Tool,
            blocks: vec![ContentBlock::ToolResult {
                tool_call_id: tool_call_id.into(),
                content: content.into(),
                is_error,
            }],
            provider_metadata: None,
        }
    }

    /// Return the plain text when the message has exactly one text block.
    pub fn as_text(&self) -> Option<&str> {
        match self.blocks.as_slice() {
            [ContentBlock::Text { text }] => Some(text),
            _ => None,
        }
    }

    /// Concatenation of all text blocks, used for scrollback rendering.
    pub fn visible_text(&self) -> String {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// First tool call in the message, if any.
    pub fn first_tool_call(&self) -> Option<(&str, &str, &str)> {
        self.blocks.iter().find_map(|b| match b {
            ContentBlock::ToolCall { id, name, arguments, .. } => {
                Some((id.as_str(), name.as_str(), arguments.as_str()))
            }
            _ => None,
        })
    }
}

// ─── Database round-trip ─────────────────────────────────────────────────────

/// Flat message row as stored, decoupled from the store crate.
///
/// `kind` is one of `user | assistant | tool | system | clear | fork`.
/// `content` holds visible text; `data_json` holds the full block array for
/// kinds that need it.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub kind: String,
    pub content: Option<String>,
    pub data_json: Option<String>,
}

impl Message {
    /// Convert to a persistable record.
    ///
    /// Single-text messages store only `content`; anything richer also
    /// stores the block array in `data_json` so thinking and tool blocks
    /// survive the round-trip bit for bit.
    pub fn to_record(&self) -> MessageRecord {
        let kind = self.role.as_str().to_string();
        match self.as_text() {
            Some(text) => MessageRecord {
                kind,
                content: Some(text.to_string()),
                data_json: None,
            },
            None => MessageRecord {
                kind,
                content: Some(self.visible_text()),
                data_json: serde_json::to_string(&self.blocks).ok(),
            },
        }
    }

    /// Convert a persisted record back to an in-memory message.
    ///
    /// Returns `Ok(None)` for `system` kind; system text is propagated to
    /// the request's `system_prompt`, never placed in the conversation.
    /// `clear` and `fork` kinds are history boundaries handled by the
    /// restore walk and are also not conversation messages.
    pub fn from_record(record: &MessageRecord) -> anyhow::Result<Option<Message>> {
        let role = match record.kind.as_str() {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            "tool" => Role::Tool,
            "system" | "clear" | "fork" => return Ok(None),
            other => anyhow::bail!("unknown message kind: {other}"),
        };

        let blocks = match &record.data_json {
            Some(json) => serde_json::from_str::<Vec<ContentBlock>>(json)
                .map_err(|e| anyhow::anyhow!("malformed message data_json: {e}"))?,
            None => vec![ContentBlock::Text {
                text: record.content.clone().unwrap_or_default(),
            }],
        };

        Ok(Some(Message { role, blocks, provider_metadata: None }))
    }
}

// ─── Thinking level ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    #[default]
    None,
    Low,
    Medium,
    High,
}

impl ThinkingLevel {
    /// Lenient parse: unknown strings coerce to `None`.
    pub fn parse(s: &str) -> Self {
        match s {
            "low" => Self::Low,
            "medium" => Self::Medium,
            "high" => Self::High,
            _ => Self::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
