// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Blocking wait on inter-agent mail, run on a worker thread.
//!
//! Both modes poll at a fixed granularity and return early when the
//! caller's interrupt flag is set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arbor_store::Store;

use crate::state::StateCell;

/// Poll granularity; the interrupt flag is observed at least this often.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Live-agent view captured on the main thread when the worker is spawned.
/// The shared state cells keep `running`/`idle` snapshots honest while the
/// wait is in flight.
#[derive(Debug, Clone)]
pub struct AgentPeek {
    pub uuid: String,
    pub name: Option<String>,
    pub state: Arc<StateCell>,
}

/// One fan-in snapshot entry.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitEntry {
    pub agent_uuid: String,
    pub agent_name: String,
    /// `received | running | idle | dead`.
    pub status: String,
    pub message: Option<String>,
}

/// Outcome of a wait, rendered by the on-complete callback.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WaitResult {
    pub is_fanin: bool,
    /// Next-message mode: sender of the received mail.
    pub from_uuid: Option<String>,
    /// Next-message mode: body, or `None` on timeout.
    pub message: Option<String>,
    pub entries: Vec<WaitEntry>,
    pub interrupted: bool,
}

/// Block until any unread mail addressed to `my_uuid` arrives, the timeout
/// expires, or the interrupt flag is set.
pub fn next_message(
    store: &Store,
    session_id: i64,
    my_uuid: &str,
    timeout_secs: i64,
    interrupt: &AtomicBool,
) -> WaitResult {
    let deadline = Instant::now() + Duration::from_secs(timeout_secs.max(0) as u64);
    let mut result = WaitResult::default();

    loop {
        if let Ok(Some(mail)) = store.take_next_unread(session_id, my_uuid) {
            result.from_uuid = Some(mail.from_uuid);
            result.message = Some(mail.body);
            return result;
        }
        if interrupt.load(Ordering::Acquire) {
            result.interrupted = true;
            return result;
        }
        if Instant::now() >= deadline {
            return result;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Fan-in mode: poll each target until all have reported or the timeout
/// expires, then return one snapshot entry per target.
pub fn fan_in(
    store: &Store,
    session_id: i64,
    my_uuid: &str,
    timeout_secs: i64,
    targets: &[String],
    peeks: &[AgentPeek],
    interrupt: &AtomicBool,
) -> WaitResult {
    let deadline = Instant::now() + Duration::from_secs(timeout_secs.max(0) as u64);
    let mut received: Vec<Option<String>> = vec![None; targets.len()];
    let mut interrupted = false;

    loop {
        for (i, target) in targets.iter().enumerate() {
            if received[i].is_none() {
                if let Ok(Some(mail)) = store.take_unread_from(session_id, my_uuid, target) {
                    received[i] = Some(mail.body);
                }
            }
        }
        if received.iter().all(Option::is_some) {
            break;
        }
        if interrupt.load(Ordering::Acquire) {
            interrupted = true;
            break;
        }
        if Instant::now() >= deadline {
            break;
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    let entries = targets
        .iter()
        .zip(received)
        .map(|(target, body)| {
            let peek = peeks.iter().find(|p| &p.uuid == target);
            let agent_name = peek
                .and_then(|p| p.name.clone())
                .unwrap_or_default();
            let status = if body.is_some() {
                "received".to_string()
            } else {
                target_status(store, target, peek)
            };
            WaitEntry {
                agent_uuid: target.clone(),
                agent_name,
                status,
                message: body,
            }
        })
        .collect();

    WaitResult {
        is_fanin: true,
        from_uuid: None,
        message: None,
        entries,
        interrupted,
    }
}

/// Status of a target that has not mailed us: dead (per the store), or
/// running/idle from its live state cell.
fn target_status(store: &Store, uuid: &str, peek: Option<&AgentPeek>) -> String {
    match store.agent(uuid) {
        Ok(Some(row)) if row.status == arbor_store::AgentStatus::Dead => "dead".into(),
        Ok(None) | Err(_) => "dead".into(),
        Ok(Some(_)) => match peek {
            Some(p) if p.state.get().is_busy() => "running".into(),
            _ => "idle".into(),
        },
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AgentState;
    use arbor_store::{AgentRow, AgentStatus};

    fn store_with_session() -> (Store, i64) {
        let store = Store::open_in_memory().unwrap();
        let sid = store.create_session().unwrap();
        (store, sid)
    }

    fn insert_agent(store: &Store, sid: i64, uuid: &str, status: AgentStatus) {
        store
            .insert_agent(&AgentRow {
                uuid: uuid.into(),
                session_id: sid,
                parent_uuid: None,
                name: Some(format!("agent-{uuid}")),
                status: AgentStatus::Running,
                provider: "openai".into(),
                model: "gpt-5".into(),
                thinking_level: "none".into(),
                fork_message_id: None,
                created_at: chrono::Utc::now().to_rfc3339(),
                ended_at: None,
            })
            .unwrap();
        if status == AgentStatus::Dead {
            store.mark_agent_dead(uuid).unwrap();
        }
    }

    #[test]
    fn next_message_returns_pending_mail_immediately() {
        let (store, sid) = store_with_session();
        store.insert_mail(sid, "sender", "me", "hello there").unwrap();
        let interrupt = AtomicBool::new(false);
        let result = next_message(&store, sid, "me", 0, &interrupt);
        assert_eq!(result.from_uuid.as_deref(), Some("sender"));
        assert_eq!(result.message.as_deref(), Some("hello there"));
    }

    #[test]
    fn next_message_timeout_yields_empty_result() {
        let (store, sid) = store_with_session();
        let interrupt = AtomicBool::new(false);
        let result = next_message(&store, sid, "me", 0, &interrupt);
        assert!(result.from_uuid.is_none());
        assert!(result.message.is_none());
        assert!(!result.interrupted);
    }

    #[test]
    fn next_message_returns_early_on_interrupt() {
        let (store, sid) = store_with_session();
        let interrupt = AtomicBool::new(true);
        let start = Instant::now();
        let result = next_message(&store, sid, "me", 60, &interrupt);
        assert!(result.interrupted);
        // Must return within one polling period, not the 60 s timeout.
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn fan_in_reports_received_with_body() {
        let (store, sid) = store_with_session();
        insert_agent(&store, sid, "bb", AgentStatus::Running);
        store.insert_mail(sid, "bb", "aa", "done").unwrap();
        let interrupt = AtomicBool::new(false);
        let result = fan_in(&store, sid, "aa", 0, &["bb".into()], &[], &interrupt);
        assert!(result.is_fanin);
        assert_eq!(result.entries.len(), 1);
        assert_eq!(result.entries[0].status, "received");
        assert_eq!(result.entries[0].message.as_deref(), Some("done"));
    }

    #[test]
    fn fan_in_reports_dead_for_killed_target() {
        let (store, sid) = store_with_session();
        insert_agent(&store, sid, "dd", AgentStatus::Dead);
        let interrupt = AtomicBool::new(false);
        let result = fan_in(&store, sid, "aa", 0, &["dd".into()], &[], &interrupt);
        assert_eq!(result.entries[0].status, "dead");
        assert!(result.entries[0].message.is_none());
    }

    #[test]
    fn fan_in_reports_unknown_target_as_dead() {
        let (store, sid) = store_with_session();
        let interrupt = AtomicBool::new(false);
        let result = fan_in(&store, sid, "aa", 0, &["ghost".into()], &[], &interrupt);
        assert_eq!(result.entries[0].status, "dead");
    }

    #[test]
    fn fan_in_distinguishes_running_and_idle() {
        let (store, sid) = store_with_session();
        insert_agent(&store, sid, "busy", AgentStatus::Running);
        insert_agent(&store, sid, "lazy", AgentStatus::Running);

        let busy_state = Arc::new(StateCell::default());
        busy_state.set(AgentState::Streaming);
        let peeks = vec![
            AgentPeek { uuid: "busy".into(), name: Some("b".into()), state: busy_state },
            AgentPeek {
                uuid: "lazy".into(),
                name: Some("l".into()),
                state: Arc::new(StateCell::default()),
            },
        ];
        let interrupt = AtomicBool::new(false);
        let result = fan_in(
            &store,
            sid,
            "aa",
            0,
            &["busy".into(), "lazy".into()],
            &peeks,
            &interrupt,
        );
        assert_eq!(result.entries[0].status, "running");
        assert_eq!(result.entries[1].status, "idle");
    }

    #[test]
    fn fan_in_preserves_target_order() {
        let (store, sid) = store_with_session();
        insert_agent(&store, sid, "x", AgentStatus::Running);
        insert_agent(&store, sid, "y", AgentStatus::Running);
        store.insert_mail(sid, "y", "me", "from y").unwrap();
        let interrupt = AtomicBool::new(false);
        let result = fan_in(
            &store,
            sid,
            "me",
            0,
            &["x".into(), "y".into()],
            &[],
            &interrupt,
        );
        assert_eq!(result.entries[0].agent_uuid, "x");
        assert_eq!(result.entries[1].agent_uuid, "y");
        assert_eq!(result.entries[1].status, "received");
    }
}
