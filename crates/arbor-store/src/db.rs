// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use rusqlite::Connection;

use crate::error::Result;

/// Initialise the schema.
///
/// Safe to call on every startup; uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sessions (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS agents (
            uuid            TEXT PRIMARY KEY,
            session_id      INTEGER NOT NULL,
            parent_uuid     TEXT,
            name            TEXT,
            status          TEXT NOT NULL DEFAULT 'running',
            provider        TEXT NOT NULL,
            model           TEXT NOT NULL,
            thinking_level  TEXT NOT NULL,
            fork_message_id INTEGER,
            created_at      TEXT NOT NULL,
            ended_at        TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_agents_parent ON agents(parent_uuid);
        CREATE INDEX IF NOT EXISTS idx_agents_status ON agents(status);
        CREATE TABLE IF NOT EXISTS messages (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id INTEGER NOT NULL,
            agent_uuid TEXT NOT NULL,
            kind       TEXT NOT NULL,
            content    TEXT,
            data_json  TEXT,
            timestamp  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_agent ON messages(agent_uuid);
        CREATE TABLE IF NOT EXISTS mail (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id INTEGER NOT NULL,
            from_uuid  TEXT NOT NULL,
            to_uuid    TEXT NOT NULL,
            body       TEXT NOT NULL,
            timestamp  TEXT NOT NULL,
            read       INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_mail_to ON mail(to_uuid);
        CREATE TABLE IF NOT EXISTS marks (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id    INTEGER NOT NULL,
            agent_uuid    TEXT NOT NULL,
            label         TEXT,
            message_index INTEGER NOT NULL,
            created_at    TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_marks_agent ON marks(agent_uuid);",
    )?;
    Ok(())
}
