// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Command history persisted as JSON Lines.
//!
//! Each line is `{"cmd": "<command>", "ts": "<iso-8601>"}`.  Writes go
//! through a temp file + rename so a crash never leaves a half-written
//! history.  Malformed lines are skipped with a warning.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde_json::{json, Value};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub cmd: String,
    pub ts: String,
}

#[derive(Debug)]
pub struct History {
    entries: Vec<HistoryEntry>,
    capacity: usize,
    path: PathBuf,
}

impl History {
    /// Load history from `<dir>/history`, keeping only the most recent
    /// `capacity` entries in original order.  A missing file is an empty
    /// history.
    pub fn load(dir: &Path, capacity: usize) -> Self {
        let path = dir.join("history");
        let mut entries = Vec::new();
        if let Ok(text) = std::fs::read_to_string(&path) {
            for (lineno, line) in text.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(line) {
                    Ok(v) => match (v["cmd"].as_str(), v["ts"].as_str()) {
                        (Some(cmd), Some(ts)) => entries.push(HistoryEntry {
                            cmd: cmd.to_string(),
                            ts: ts.to_string(),
                        }),
                        _ => warn!(line = lineno + 1, "history entry missing fields; skipped"),
                    },
                    Err(e) => warn!(line = lineno + 1, "malformed history line skipped: {e}"),
                }
            }
        }
        if entries.len() > capacity {
            entries.drain(..entries.len() - capacity);
        }
        Self { entries, capacity, path }
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    /// Append a command and persist the whole file atomically.
    pub fn append(&mut self, cmd: &str) -> anyhow::Result<()> {
        self.entries.push(HistoryEntry {
            cmd: cmd.to_string(),
            ts: chrono::Utc::now().to_rfc3339(),
        });
        if self.entries.len() > self.capacity {
            let excess = self.entries.len() - self.capacity;
            self.entries.drain(..excess);
        }
        self.save()
    }

    /// Write all entries via temp file + rename.
    pub fn save(&self) -> anyhow::Result<()> {
        let dir = self
            .path
            .parent()
            .context("history path has no parent directory")?;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating {}", dir.display()))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("creating temp file in {}", dir.display()))?;
        for entry in &self.entries {
            let line = json!({ "cmd": entry.cmd, "ts": entry.ts });
            writeln!(tmp, "{line}").context("writing history entry")?;
        }
        tmp.persist(&self.path)
            .with_context(|| format!("renaming into {}", self.path.display()))?;
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_reload_round_trips_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut history = History::load(dir.path(), 100);
        history.append("/agents").unwrap();
        history.append("hello there").unwrap();
        history.append("/fork").unwrap();

        let reloaded = History::load(dir.path(), 100);
        let cmds: Vec<&str> = reloaded.entries().iter().map(|e| e.cmd.as_str()).collect();
        assert_eq!(cmds, vec!["/agents", "hello there", "/fork"]);
    }

    #[test]
    fn reload_under_capacity_keeps_most_recent() {
        let dir = tempfile::tempdir().unwrap();
        let mut history = History::load(dir.path(), 100);
        for i in 0..10 {
            history.append(&format!("cmd {i}")).unwrap();
        }
        let reloaded = History::load(dir.path(), 4);
        let cmds: Vec<&str> = reloaded.entries().iter().map(|e| e.cmd.as_str()).collect();
        assert_eq!(cmds, vec!["cmd 6", "cmd 7", "cmd 8", "cmd 9"]);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history");
        std::fs::write(
            &path,
            "{\"cmd\":\"good\",\"ts\":\"2026-01-01T00:00:00Z\"}\n{not json\n{\"ts\":\"x\"}\n",
        )
        .unwrap();
        let history = History::load(dir.path(), 100);
        assert_eq!(history.entries().len(), 1);
        assert_eq!(history.entries()[0].cmd, "good");
    }

    #[test]
    fn missing_file_is_empty_history() {
        let dir = tempfile::tempdir().unwrap();
        let history = History::load(dir.path(), 100);
        assert!(history.entries().is_empty());
    }

    #[test]
    fn multi_line_commands_survive_json_escaping() {
        let dir = tempfile::tempdir().unwrap();
        let mut history = History::load(dir.path(), 100);
        history.append("line one\nline two").unwrap();
        let reloaded = History::load(dir.path(), 100);
        assert_eq!(reloaded.entries()[0].cmd, "line one\nline two");
    }

    #[test]
    fn append_beyond_capacity_trims_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let mut history = History::load(dir.path(), 3);
        for i in 0..5 {
            history.append(&format!("c{i}")).unwrap();
        }
        let cmds: Vec<&str> = history.entries().iter().map(|e| e.cmd.as_str()).collect();
        assert_eq!(cmds, vec!["c2", "c3", "c4"]);
    }
}
