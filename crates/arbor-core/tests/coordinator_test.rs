// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! End-to-end coordinator scenarios: fork inheritance, tool loop bounds,
//! kill protections, wait fan-in, interrupt latency and navigation.

use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::mpsc;

use arbor_config::Config;
use arbor_core::{Agent, AgentState, Coordinator, UiEvent};
use arbor_model::{
    FinishReason, Message, StreamAccumulator, StreamEvent, ThinkingLevel, Usage,
};
use arbor_store::Store;
use arbor_tools::{Tool, ToolOutcome};

struct NoopTool;

impl Tool for NoopTool {
    fn name(&self) -> &str {
        "noop"
    }
    fn description(&self) -> &str {
        "does nothing, quickly"
    }
    fn input_schema(&self) -> serde_json::Value {
        json!({ "type": "object" })
    }
    fn execute(&self, _args: &serde_json::Value) -> ToolOutcome {
        ToolOutcome::ok(json!({ "ok": true }))
    }
}

fn coordinator_with_tempdir() -> (Coordinator, mpsc::UnboundedReceiver<UiEvent>, tempfile::TempDir)
{
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("arbor.db")).unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    let coordinator = Coordinator::new(Config::default(), store, tx).unwrap();
    (coordinator, rx, dir)
}

/// Add a live child agent directly (navigation tests don't need the full
/// fork path).
fn push_child(coordinator: &mut Coordinator, uuid: &str, parent: &str) {
    let mut child = Agent::new(
        uuid.to_string(),
        Some(parent.to_string()),
        "openai".into(),
        "gpt-5".into(),
        ThinkingLevel::None,
    );
    // Distinct creation times so sibling ordering is deterministic.
    child.created_at = chrono::Utc::now() + chrono::Duration::milliseconds(uuid.len() as i64);
    coordinator.agents.push(child);
}

fn send_stream(coordinator: &mut Coordinator, uuid: &str, events: Vec<StreamEvent>) {
    let generation = coordinator.agent(uuid).unwrap().stream_gen;
    for event in events {
        coordinator.handle_ui_event(UiEvent::Stream {
            agent_uuid: uuid.to_string(),
            generation,
            event,
        });
    }
}

/// Drive the coordinator's tick until the agent leaves EXECUTING_TOOL.
async fn wait_for_tool(coordinator: &mut Coordinator, uuid: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        coordinator.tick();
        let state = coordinator.agent(uuid).map(|a| a.state.get());
        if state != Some(AgentState::ExecutingTool) {
            return;
        }
        assert!(Instant::now() < deadline, "tool execution did not complete");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ── Scenario: fork preserves history ─────────────────────────────────────────

#[tokio::test]
async fn fork_preserves_history_and_clear_is_isolated() {
    let (mut coordinator, _rx, _dir) = coordinator_with_tempdir();
    let root = coordinator.current_uuid.clone();
    {
        let agent = coordinator.current_mut().unwrap();
        agent.add_message(Message::user("hi"));
        agent.add_message(Message::assistant("hello"));
    }

    coordinator.cmd_fork(None, None).await;
    let child = coordinator.current_uuid.clone();
    assert_ne!(child, root, "fork switches to the new child");

    let child_messages = coordinator.agent(&child).unwrap().messages.clone();
    let root_messages = coordinator.agent(&root).unwrap().messages.clone();
    assert_eq!(child_messages.len(), 2);
    assert_eq!(child_messages, root_messages);

    // Clearing the child leaves the parent untouched.
    coordinator.cmd_clear();
    assert!(coordinator.agent(&child).unwrap().messages.is_empty());
    assert_eq!(coordinator.agent(&root).unwrap().messages.len(), 2);
}

#[tokio::test]
async fn fork_with_model_override_configures_child() {
    let (mut coordinator, _rx, _dir) = coordinator_with_tempdir();
    coordinator
        .cmd_fork(Some("anthropic/claude-sonnet-4-5/high"), None)
        .await;
    let child = coordinator.current().unwrap();
    assert_eq!(child.provider, "anthropic");
    assert_eq!(child.model, "claude-sonnet-4-5");
    assert_eq!(child.thinking_level, ThinkingLevel::High);
}

// ── Scenario: tool loop bound ────────────────────────────────────────────────

#[tokio::test]
async fn tool_loop_stops_after_max_tool_turns() {
    let (mut coordinator, _rx, _dir) = coordinator_with_tempdir();
    coordinator.config.agent.max_tool_turns = Some(3);
    coordinator.registry.register(NoopTool);
    let uuid = coordinator.current_uuid.clone();

    // Prime the first turn as if a request was in flight.
    {
        let agent = coordinator.current_mut().unwrap();
        agent.tool_iteration_count = 0;
        agent.accumulator = Some(StreamAccumulator::new());
        agent.state.set(AgentState::WaitingForLlm);
    }

    // The assistant answers with a tool call on every turn.
    for round in 0..3u32 {
        send_stream(
            &mut coordinator,
            &uuid,
            vec![
                StreamEvent::ToolCallStart {
                    index: 0,
                    id: format!("tc_{round}"),
                    name: "noop".into(),
                },
                StreamEvent::ToolCallDone { index: 0 },
                StreamEvent::Done {
                    finish_reason: FinishReason::ToolCalls,
                    usage: Usage::default(),
                },
            ],
        );
        wait_for_tool(&mut coordinator, &uuid).await;
        assert_eq!(
            coordinator.agent(&uuid).unwrap().tool_iteration_count,
            round + 1
        );
    }

    // After the third execution the loop exits to IDLE with a notice.
    let agent = coordinator.agent(&uuid).unwrap();
    assert_eq!(agent.state.get(), AgentState::Idle);
    assert_eq!(agent.tool_iteration_count, 3);
    assert!(agent
        .scrollback
        .lines()
        .iter()
        .any(|l| l.contains("Tool loop limit reached")));
}

#[tokio::test]
async fn zero_max_tool_turns_disables_execution() {
    let (mut coordinator, _rx, _dir) = coordinator_with_tempdir();
    coordinator.config.agent.max_tool_turns = Some(0);
    coordinator.registry.register(NoopTool);
    let uuid = coordinator.current_uuid.clone();
    {
        let agent = coordinator.current_mut().unwrap();
        agent.accumulator = Some(StreamAccumulator::new());
        agent.state.set(AgentState::WaitingForLlm);
    }
    send_stream(
        &mut coordinator,
        &uuid,
        vec![
            StreamEvent::ToolCallStart { index: 0, id: "tc".into(), name: "noop".into() },
            StreamEvent::ToolCallDone { index: 0 },
            StreamEvent::Done {
                finish_reason: FinishReason::ToolCalls,
                usage: Usage::default(),
            },
        ],
    );
    let agent = coordinator.agent(&uuid).unwrap();
    assert_eq!(agent.state.get(), AgentState::Idle);
    assert_eq!(agent.tool_iteration_count, 0);
    // A synthetic error result keeps the tool-call/result pairing intact.
    assert!(matches!(
        agent.messages.last().unwrap().blocks.first().unwrap(),
        arbor_model::ContentBlock::ToolResult { is_error: true, .. }
    ));
}

// ── Scenario: kill protections ───────────────────────────────────────────────

#[tokio::test]
async fn kill_root_is_blocked_and_root_stays_live() {
    let (mut coordinator, _rx, _dir) = coordinator_with_tempdir();
    let root = coordinator.current_uuid.clone();
    coordinator.cmd_kill(&root.clone());
    assert!(coordinator.agent(&root).is_some(), "root remains live");
    assert!(coordinator
        .current()
        .unwrap()
        .scrollback
        .lines()
        .iter()
        .any(|l| l.contains("Cannot kill the root agent")));
}

#[tokio::test]
async fn kill_switches_current_to_parent() {
    let (mut coordinator, _rx, _dir) = coordinator_with_tempdir();
    let root = coordinator.current_uuid.clone();
    coordinator.cmd_fork(None, None).await;
    let child = coordinator.current_uuid.clone();

    // Kill the child from the root's perspective.
    coordinator.switch_agent(&root);
    coordinator.cmd_kill(&child);
    assert!(coordinator.agent(&child).is_none());
    assert_eq!(coordinator.current_uuid, root);
}

// ── Scenario: wait fan-in ────────────────────────────────────────────────────

#[tokio::test]
async fn wait_fanin_reports_received_mail() {
    let (mut coordinator, _rx, _dir) = coordinator_with_tempdir();
    let a = coordinator.current_uuid.clone();
    push_child(&mut coordinator, "bbbbbbbbbbbbbbbbbbbbbb", &a.clone());
    coordinator
        .store
        .insert_mail(coordinator.session_id, "bbbbbbbbbbbbbbbbbbbbbb", &a, "done")
        .unwrap();

    coordinator.cmd_wait(0, vec!["bbbbbbbbbbbbbbbbbbbbbb".into()]);
    wait_for_tool(&mut coordinator, &a.clone()).await;

    let agent = coordinator.agent(&a).unwrap();
    let lines = agent.scrollback.lines().join("\n");
    assert!(lines.contains("Fan-in results:"), "got: {lines}");
    assert!(lines.contains("bbbbbbbbbbbbbbbbbbbbbb: received - done"), "got: {lines}");
    assert_eq!(agent.state.get(), AgentState::Idle);
}

// ── Scenario: interrupt mid-stream ───────────────────────────────────────────

#[tokio::test]
async fn interrupt_mid_stream_returns_to_idle_without_new_message() {
    let (mut coordinator, _rx, _dir) = coordinator_with_tempdir();
    let uuid = coordinator.current_uuid.clone();
    let before = coordinator.agent(&uuid).unwrap().messages.len();
    {
        let agent = coordinator.current_mut().unwrap();
        agent.accumulator = Some(StreamAccumulator::new());
        agent.state.set(AgentState::WaitingForLlm);
    }
    send_stream(
        &mut coordinator,
        &uuid,
        vec![StreamEvent::TextDelta { text: "partial answ".into(), index: 0 }],
    );
    assert_eq!(coordinator.agent(&uuid).unwrap().state.get(), AgentState::Streaming);

    let start = Instant::now();
    coordinator.interrupt_current();
    assert!(start.elapsed() < Duration::from_millis(200));

    let agent = coordinator.agent(&uuid).unwrap();
    assert_eq!(agent.state.get(), AgentState::Idle);
    assert_eq!(agent.messages.len(), before, "no partial message appended");
    assert!(!agent.interrupt_pending(), "idle transition clears the flag");

    // A straggling Done for the old generation is dropped.
    coordinator.handle_ui_event(UiEvent::Stream {
        agent_uuid: uuid.clone(),
        generation: coordinator.agent(&uuid).unwrap().stream_gen - 1,
        event: StreamEvent::Done {
            finish_reason: FinishReason::Stop,
            usage: Usage::default(),
        },
    });
    assert_eq!(coordinator.agent(&uuid).unwrap().messages.len(), before);
}

// ── Stream errors discard partial output ─────────────────────────────────────

#[tokio::test]
async fn stream_error_discards_partial_response() {
    let (mut coordinator, _rx, _dir) = coordinator_with_tempdir();
    let uuid = coordinator.current_uuid.clone();
    {
        let agent = coordinator.current_mut().unwrap();
        agent.accumulator = Some(StreamAccumulator::new());
        agent.state.set(AgentState::WaitingForLlm);
    }
    send_stream(
        &mut coordinator,
        &uuid,
        vec![
            StreamEvent::TextDelta { text: "half an ans".into(), index: 0 },
            StreamEvent::Error { message: "connection reset".into(), retryable: true },
        ],
    );
    let agent = coordinator.agent(&uuid).unwrap();
    assert_eq!(agent.state.get(), AgentState::Idle);
    assert!(agent.messages.is_empty());
    assert!(agent
        .scrollback
        .lines()
        .iter()
        .any(|l| l == "Error: connection reset"));
}

// ── Navigation ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn sibling_ring_wraps() {
    let (mut coordinator, _rx, _dir) = coordinator_with_tempdir();
    let root = coordinator.current_uuid.clone();
    push_child(&mut coordinator, "child_a_aaaaaaaaaaaaaa", &root);
    push_child(&mut coordinator, "child_b_bbbbbbbbbbbbbb", &root);
    push_child(&mut coordinator, "child_c_cccccccccccccc", &root);

    coordinator.switch_agent("child_a_aaaaaaaaaaaaaa");
    coordinator.nav_next_sibling();
    assert_eq!(coordinator.current_uuid, "child_b_bbbbbbbbbbbbbb");
    coordinator.nav_next_sibling();
    assert_eq!(coordinator.current_uuid, "child_c_cccccccccccccc");
    coordinator.nav_next_sibling();
    assert_eq!(coordinator.current_uuid, "child_a_aaaaaaaaaaaaaa", "ring wraps");
    coordinator.nav_prev_sibling();
    assert_eq!(coordinator.current_uuid, "child_c_cccccccccccccc");
}

#[tokio::test]
async fn root_without_siblings_does_not_move() {
    let (mut coordinator, _rx, _dir) = coordinator_with_tempdir();
    let root = coordinator.current_uuid.clone();
    coordinator.nav_next_sibling();
    coordinator.nav_prev_sibling();
    coordinator.nav_parent();
    assert_eq!(coordinator.current_uuid, root);
}

#[tokio::test]
async fn nav_child_selects_newest() {
    let (mut coordinator, _rx, _dir) = coordinator_with_tempdir();
    let root = coordinator.current_uuid.clone();
    push_child(&mut coordinator, "old_child_aaaaaaaaaaaa", &root);
    push_child(&mut coordinator, "new_child_bbbbbbbbbbbbb", &root);
    // The second child has a later created_at (longer uuid in push_child).
    coordinator.nav_child();
    assert_eq!(coordinator.current_uuid, "new_child_bbbbbbbbbbbbb");
    coordinator.nav_parent();
    assert_eq!(coordinator.current_uuid, root);
}

#[tokio::test]
async fn uuid_prefix_resolution_exact_beats_prefix() {
    let (mut coordinator, _rx, _dir) = coordinator_with_tempdir();
    let root = coordinator.current_uuid.clone();
    push_child(&mut coordinator, "abc", &root);
    push_child(&mut coordinator, "abcdef", &root);

    // Exact match wins even though "abc" also prefixes "abcdef".
    assert_eq!(coordinator.find_agent("abc").unwrap().uuid, "abc");
    // Ambiguous prefix resolves to none.
    assert!(coordinator.find_agent("ab").is_none());
    assert!(coordinator.uuid_ambiguous("ab"));
    // Unique prefix resolves.
    assert_eq!(coordinator.find_agent("abcd").unwrap().uuid, "abcdef");
    assert!(!coordinator.uuid_ambiguous("abcd"));
}

// ── Marks ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn mark_rewind_preserves_marks_at_or_before_target() {
    let (mut coordinator, _rx, _dir) = coordinator_with_tempdir();
    let uuid = coordinator.current_uuid.clone();
    for i in 0..2 {
        coordinator
            .current_mut()
            .unwrap()
            .add_message(Message::user(format!("m{i}")));
    }
    coordinator.cmd_mark(Some("A"));
    for i in 2..5 {
        coordinator
            .current_mut()
            .unwrap()
            .add_message(Message::user(format!("m{i}")));
    }
    coordinator.cmd_mark(Some("B"));
    for i in 5..8 {
        coordinator
            .current_mut()
            .unwrap()
            .add_message(Message::user(format!("m{i}")));
    }
    coordinator.cmd_mark(Some("C"));
    for i in 8..10 {
        coordinator
            .current_mut()
            .unwrap()
            .add_message(Message::user(format!("m{i}")));
    }
    assert_eq!(coordinator.current().unwrap().messages.len(), 10);

    coordinator.cmd_rewind(Some("B"));
    let agent = coordinator.agent(&uuid).unwrap();
    assert_eq!(agent.messages.len(), 5);
    let labels: Vec<_> = agent
        .marks
        .iter()
        .map(|m| m.label.clone().unwrap())
        .collect();
    assert_eq!(labels, vec!["A", "B"]);

    // The target mark survives for a second rewind.
    coordinator.cmd_rewind(Some("B"));
    assert_eq!(coordinator.agent(&uuid).unwrap().messages.len(), 5);
}

// ── Session restore ──────────────────────────────────────────────────────────

#[tokio::test]
async fn resume_restores_live_agents_and_bounded_history() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("arbor.db");
    let root_uuid;
    {
        let store = Store::open(&path).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut coordinator = Coordinator::new(Config::default(), store, tx).unwrap();
        root_uuid = coordinator.current_uuid.clone();
        let sid = coordinator.session_id;
        coordinator
            .store
            .insert_message(sid, &root_uuid, "user", Some("dropped"), None)
            .unwrap();
        coordinator
            .store
            .insert_message(sid, &root_uuid, "clear", None, None)
            .unwrap();
        coordinator
            .store
            .insert_message(sid, &root_uuid, "system", Some("be terse"), None)
            .unwrap();
        coordinator
            .store
            .insert_message(sid, &root_uuid, "user", Some("kept"), None)
            .unwrap();
        coordinator
            .store
            .insert_message(sid, &root_uuid, "assistant", Some("reply"), None)
            .unwrap();
    }

    let store = Store::open(&path).unwrap();
    let (tx, _rx) = mpsc::unbounded_channel();
    let coordinator = Coordinator::resume(Config::default(), store, tx).unwrap();
    assert_eq!(coordinator.current_uuid, root_uuid);
    let agent = coordinator.current().unwrap();
    // The clear boundary dropped the first user message; system text was
    // projected out of the conversation.
    assert_eq!(agent.messages.len(), 2);
    assert_eq!(agent.messages[0].as_text(), Some("kept"));
    assert_eq!(agent.system_prompt.as_deref(), Some("be terse"));
    assert_eq!(agent.scrollback.lines(), ["> kept", "reply"]);
}
