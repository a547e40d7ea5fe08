// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Minimal SSE line framing shared by the provider drivers.
//!
//! SSE lines can be split across TCP chunks, so the parser carries a
//! remainder buffer forward.  Only complete lines (terminated by `\n`) are
//! consumed; anything left over is prepended to the next chunk.

/// One `data:` payload with the `event:` name that preceded it, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE parser.  Feed raw chunks; collect complete frames.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    current_event: Option<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk of bytes and return every frame completed by it.
    pub fn push(&mut self, chunk: &str) -> Vec<SseFrame> {
        self.buffer.push_str(chunk);
        let mut frames = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer[..pos].trim_end_matches('\r').to_string();
            self.buffer.drain(..=pos);

            if line.is_empty() {
                // Blank line terminates the current event.
                self.current_event = None;
            } else if let Some(name) = line.strip_prefix("event:") {
                self.current_event = Some(name.trim().to_string());
            } else if let Some(data) = line.strip_prefix("data:") {
                frames.push(SseFrame {
                    event: self.current_event.clone(),
                    data: data.trim().to_string(),
                });
            }
            // Comments (":...") and unknown fields are ignored.
        }

        frames
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
