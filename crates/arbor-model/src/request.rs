// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde_json::Value;

use crate::message::{Message, ThinkingLevel};

/// A tool schema offered to the model.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object.
    pub input_schema: Value,
}

/// A completion request in neutral form.
///
/// Messages are deep copies of the agent's history, never aliases, so the
/// request can outlive agent mutation (rewind, clear) without hazard.
#[derive(Debug, Clone)]
pub struct Request {
    pub model: String,
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
    pub temperature: f32,
    pub max_completion_tokens: u32,
    pub thinking_level: ThinkingLevel,
    pub stream: bool,
}

impl Request {
    pub fn new(model: impl Into<String>, messages: &[Message]) -> Self {
        Self {
            model: model.into(),
            system_prompt: None,
            messages: messages.to_vec(),
            tools: Vec::new(),
            temperature: 0.2,
            max_completion_tokens: 8192,
            thinking_level: ThinkingLevel::None,
            stream: true,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_deep_copies_messages() {
        let history = vec![Message::user("hi")];
        let req = Request::new("gpt-5", &history);
        assert_eq!(req.messages, history);
        // The request owns its copy; dropping the source is fine.
        drop(history);
        assert_eq!(req.messages[0].as_text(), Some("hi"));
    }

    #[test]
    fn request_defaults_to_streaming() {
        let req = Request::new("m", &[]);
        assert!(req.stream);
        assert_eq!(req.thinking_level, ThinkingLevel::None);
    }
}
