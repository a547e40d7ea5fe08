// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use unicode_width::UnicodeWidthChar;

use arbor_model::{ContentBlock, Message, Role};

/// Rendered textual history for one agent, distinct from the
/// provider-visible message sequence.
///
/// Streaming text arrives in arbitrary fragments; complete lines are
/// committed as they form and the trailing partial line is kept in a
/// buffer so the renderer can show it in place.
#[derive(Debug, Default, Clone)]
pub struct Scrollback {
    lines: Vec<String>,
    stream_buffer: String,
}

impl Scrollback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// The partial line still being streamed, if any.
    pub fn stream_buffer(&self) -> &str {
        &self.stream_buffer
    }

    pub fn append_line(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    /// One-line user-visible failure, severity-prefixed.
    pub fn append_error(&mut self, message: &str) {
        self.lines.push(format!("Error: {message}"));
    }

    pub fn append_warning(&mut self, message: &str) {
        self.lines.push(format!("Warning: {message}"));
    }

    /// Append streamed text, committing each completed line.
    pub fn append_stream_text(&mut self, text: &str) {
        for c in text.chars() {
            if c == '\n' {
                self.lines.push(std::mem::take(&mut self.stream_buffer));
            } else {
                self.stream_buffer.push(c);
            }
        }
    }

    /// Commit any trailing partial line (end of a streamed response).
    pub fn flush_stream(&mut self) {
        if !self.stream_buffer.is_empty() {
            self.lines.push(std::mem::take(&mut self.stream_buffer));
        }
    }

    /// Drop any streamed-but-uncommitted text (interrupt or stream error).
    pub fn discard_stream(&mut self) {
        self.stream_buffer.clear();
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.stream_buffer.clear();
    }

    /// Render one message the same way the live paths do, so a rebuilt
    /// scrollback is indistinguishable from one that grew naturally.
    pub fn render_message(&mut self, msg: &Message) {
        match msg.role {
            Role::User => {
                for line in msg.visible_text().lines() {
                    self.lines.push(format!("> {line}"));
                }
            }
            Role::Assistant => {
                for block in &msg.blocks {
                    match block {
                        ContentBlock::Text { text } => {
                            for line in text.lines() {
                                self.lines.push(line.to_string());
                            }
                        }
                        ContentBlock::ToolCall { name, .. } => {
                            self.lines.push(format!("[tool] {name}"));
                        }
                        // Private reasoning is never rendered.
                        ContentBlock::Thinking { .. }
                        | ContentBlock::RedactedThinking { .. }
                        | ContentBlock::ToolResult { .. } => {}
                    }
                }
            }
            Role::Tool => {
                if let Some(ContentBlock::ToolResult { is_error, .. }) = msg.blocks.first() {
                    if *is_error {
                        self.lines.push("[tool failed]".to_string());
                    }
                }
            }
        }
    }

    /// Rebuild the whole scrollback from a retained message sequence
    /// (rewind path).
    pub fn rebuild_from_messages(&mut self, messages: &[Message]) {
        self.clear();
        for msg in messages {
            self.render_message(msg);
        }
    }

    /// Total physical lines when wrapped to `width` columns.
    ///
    /// Width is clamped to at least 1, and every character counts at least
    /// one column, so a width-1 terminal yields one physical line per
    /// character and the computation always terminates.
    pub fn physical_height(&self, width: usize) -> usize {
        self.lines
            .iter()
            .map(|l| physical_lines(l, width))
            .sum::<usize>()
            + if self.stream_buffer.is_empty() {
                0
            } else {
                physical_lines(&self.stream_buffer, width)
            }
    }
}

/// Physical lines occupied by one logical line at the given width.
pub fn physical_lines(line: &str, width: usize) -> usize {
    let width = width.max(1);
    let mut rows = 1usize;
    let mut col = 0usize;
    for c in line.chars() {
        let w = UnicodeWidthChar::width(c).unwrap_or(0).max(1).min(width);
        if col + w > width {
            rows += 1;
            col = w;
        } else {
            col += w;
        }
    }
    rows
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
