// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::db::init_db;
use crate::error::{Result, StoreError};
use crate::types::{AgentRow, AgentStatus, MailRow, MarkRow, MessageRow};

/// One SQLite handle.  Never shared across threads; workers call
/// [`Store::reopen`] for their own handle to the same database file.
pub struct Store {
    conn: Connection,
    path: Option<PathBuf>,
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        // WAL lets the worker handles read while the main handle writes.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        init_db(&conn)?;
        Ok(Self { conn, path: Some(path.as_ref().to_path_buf()) })
    }

    /// In-memory store for tests that need only a single handle.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_db(&conn)?;
        Ok(Self { conn, path: None })
    }

    /// Open a fresh handle to the same database, for a worker thread.
    pub fn reopen(&self) -> Result<Self> {
        match &self.path {
            Some(path) => Self::open(path),
            None => Err(StoreError::NoPath),
        }
    }

    // ── Transactions ──────────────────────────────────────────────────────────

    pub fn begin(&self) -> Result<()> {
        self.conn.execute_batch("BEGIN")?;
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    pub fn rollback(&self) -> Result<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    // ── Sessions ──────────────────────────────────────────────────────────────

    pub fn create_session(&self) -> Result<i64> {
        self.conn
            .execute("INSERT INTO sessions (created_at) VALUES (?1)", params![now()])?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Most recent session id, if any.
    pub fn latest_session(&self) -> Result<Option<i64>> {
        Ok(self
            .conn
            .query_row("SELECT id FROM sessions ORDER BY id DESC LIMIT 1", [], |r| r.get(0))
            .optional()?)
    }

    // ── Agents ────────────────────────────────────────────────────────────────

    pub fn insert_agent(&self, agent: &AgentRow) -> Result<()> {
        debug!(uuid = %agent.uuid, parent = ?agent.parent_uuid, "insert agent");
        self.conn.execute(
            "INSERT INTO agents
             (uuid, session_id, parent_uuid, name, status, provider, model,
              thinking_level, fork_message_id, created_at, ended_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                agent.uuid,
                agent.session_id,
                agent.parent_uuid,
                agent.name,
                agent.status.as_str(),
                agent.provider,
                agent.model,
                agent.thinking_level,
                agent.fork_message_id,
                agent.created_at,
                agent.ended_at,
            ],
        )?;
        Ok(())
    }

    pub fn mark_agent_dead(&self, uuid: &str) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE agents SET status = 'dead', ended_at = ?1 WHERE uuid = ?2",
            params![now(), uuid],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("agent {uuid}")));
        }
        Ok(())
    }

    pub fn update_agent_config(
        &self,
        uuid: &str,
        provider: &str,
        model: &str,
        thinking_level: &str,
    ) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE agents SET provider = ?1, model = ?2, thinking_level = ?3 WHERE uuid = ?4",
            params![provider, model, thinking_level, uuid],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("agent {uuid}")));
        }
        Ok(())
    }

    pub fn agent(&self, uuid: &str) -> Result<Option<AgentRow>> {
        Ok(self
            .conn
            .query_row(
                "SELECT uuid, session_id, parent_uuid, name, status, provider, model,
                        thinking_level, fork_message_id, created_at, ended_at
                 FROM agents WHERE uuid = ?1",
                params![uuid],
                row_to_agent,
            )
            .optional()?)
    }

    /// Live agents for a session, in creation order.
    pub fn live_agents(&self, session_id: i64) -> Result<Vec<AgentRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT uuid, session_id, parent_uuid, name, status, provider, model,
                    thinking_level, fork_message_id, created_at, ended_at
             FROM agents
             WHERE session_id = ?1 AND status = 'running'
             ORDER BY created_at, uuid",
        )?;
        let rows = stmt.query_map(params![session_id], row_to_agent)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ── Messages ──────────────────────────────────────────────────────────────

    pub fn insert_message(
        &self,
        session_id: i64,
        agent_uuid: &str,
        kind: &str,
        content: Option<&str>,
        data_json: Option<&str>,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO messages (session_id, agent_uuid, kind, content, data_json, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![session_id, agent_uuid, kind, content, data_json, now()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Id of the agent's most recent message, or `None` when it has none.
    /// Used as the fork point.
    pub fn last_message_id(&self, agent_uuid: &str) -> Result<Option<i64>> {
        Ok(self
            .conn
            .query_row(
                "SELECT MAX(id) FROM messages WHERE agent_uuid = ?1",
                params![agent_uuid],
                |r| r.get::<_, Option<i64>>(0),
            )
            .optional()?
            .flatten())
    }

    /// All message rows for an agent in insertion order.
    ///
    /// The caller applies the restore walk: a `clear` row (or the child side
    /// of a `fork` event) drops everything before it.
    pub fn messages_for_agent(&self, session_id: i64, agent_uuid: &str) -> Result<Vec<MessageRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, session_id, agent_uuid, kind, content, data_json, timestamp
             FROM messages
             WHERE session_id = ?1 AND agent_uuid = ?2
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![session_id, agent_uuid], row_to_message)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ── Mail ──────────────────────────────────────────────────────────────────

    pub fn insert_mail(
        &self,
        session_id: i64,
        from_uuid: &str,
        to_uuid: &str,
        body: &str,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO mail (session_id, from_uuid, to_uuid, body, timestamp, read)
             VALUES (?1, ?2, ?3, ?4, ?5, 0)",
            params![session_id, from_uuid, to_uuid, body, now()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Oldest unread mail addressed to `to_uuid`, marked read atomically.
    pub fn take_next_unread(&self, session_id: i64, to_uuid: &str) -> Result<Option<MailRow>> {
        self.take_unread_where(session_id, to_uuid, None)
    }

    /// Oldest unread mail to `to_uuid` from a specific sender, marked read.
    pub fn take_unread_from(
        &self,
        session_id: i64,
        to_uuid: &str,
        from_uuid: &str,
    ) -> Result<Option<MailRow>> {
        self.take_unread_where(session_id, to_uuid, Some(from_uuid))
    }

    fn take_unread_where(
        &self,
        session_id: i64,
        to_uuid: &str,
        from_uuid: Option<&str>,
    ) -> Result<Option<MailRow>> {
        let mail = match from_uuid {
            Some(from) => self
                .conn
                .query_row(
                    "SELECT id, session_id, from_uuid, to_uuid, body, timestamp, read
                     FROM mail
                     WHERE session_id = ?1 AND to_uuid = ?2 AND from_uuid = ?3 AND read = 0
                     ORDER BY id LIMIT 1",
                    params![session_id, to_uuid, from],
                    row_to_mail,
                )
                .optional()?,
            None => self
                .conn
                .query_row(
                    "SELECT id, session_id, from_uuid, to_uuid, body, timestamp, read
                     FROM mail
                     WHERE session_id = ?1 AND to_uuid = ?2 AND read = 0
                     ORDER BY id LIMIT 1",
                    params![session_id, to_uuid],
                    row_to_mail,
                )
                .optional()?,
        };
        if let Some(m) = &mail {
            self.conn
                .execute("UPDATE mail SET read = 1 WHERE id = ?1", params![m.id])?;
        }
        Ok(mail)
    }

    // ── Marks ─────────────────────────────────────────────────────────────────

    pub fn insert_mark(
        &self,
        session_id: i64,
        agent_uuid: &str,
        label: Option<&str>,
        message_index: i64,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO marks (session_id, agent_uuid, label, message_index, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![session_id, agent_uuid, label, message_index, now()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn marks_for_agent(&self, agent_uuid: &str) -> Result<Vec<MarkRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, agent_uuid, label, message_index
             FROM marks WHERE agent_uuid = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![agent_uuid], |row| {
            Ok(MarkRow {
                id: row.get(0)?,
                agent_uuid: row.get(1)?,
                label: row.get(2)?,
                message_index: row.get(3)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Remove marks strictly after `message_index` (rewind semantics: the
    /// target mark itself is preserved for reuse).
    pub fn delete_marks_after(&self, agent_uuid: &str, message_index: i64) -> Result<usize> {
        Ok(self.conn.execute(
            "DELETE FROM marks WHERE agent_uuid = ?1 AND message_index > ?2",
            params![agent_uuid, message_index],
        )?)
    }

    pub fn delete_marks_for_agent(&self, agent_uuid: &str) -> Result<usize> {
        Ok(self
            .conn
            .execute("DELETE FROM marks WHERE agent_uuid = ?1", params![agent_uuid])?)
    }
}

// ─── Row mappers ─────────────────────────────────────────────────────────────

fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentRow> {
    let status: String = row.get(4)?;
    Ok(AgentRow {
        uuid: row.get(0)?,
        session_id: row.get(1)?,
        parent_uuid: row.get(2)?,
        name: row.get(3)?,
        status: AgentStatus::parse(&status),
        provider: row.get(5)?,
        model: row.get(6)?,
        thinking_level: row.get(7)?,
        fork_message_id: row.get(8)?,
        created_at: row.get(9)?,
        ended_at: row.get(10)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        session_id: row.get(1)?,
        agent_uuid: row.get(2)?,
        kind: row.get(3)?,
        content: row.get(4)?,
        data_json: row.get(5)?,
        timestamp: row.get(6)?,
    })
}

fn row_to_mail(row: &rusqlite::Row<'_>) -> rusqlite::Result<MailRow> {
    let read: i64 = row.get(6)?;
    Ok(MailRow {
        id: row.get(0)?,
        session_id: row.get(1)?,
        from_uuid: row.get(2)?,
        to_uuid: row.get(3)?,
        body: row.get(4)?,
        timestamp: row.get(5)?,
        read: read != 0,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
