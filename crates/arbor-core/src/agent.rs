// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use arbor_model::{FinishReason, Message, PendingToolCall, StreamAccumulator, ThinkingLevel};

use crate::input::InputBuffer;
use crate::scrollback::Scrollback;
use crate::state::{AgentState, StateCell};

/// A bookmark into the agent's message sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Mark {
    pub label: Option<String>,
    pub message_index: usize,
}

/// Opaque payload produced by a tool worker and consumed by the agent's
/// on-complete callback on the main thread.
pub type DeferredData = Box<dyn Any + Send>;

/// Deferred completion run on the main thread after a tool worker finishes.
/// Receives the coordinator and the owning agent's uuid; the payload is
/// taken from the agent's deferred slot.
pub type OnComplete = Box<dyn FnOnce(&mut crate::coordinator::Coordinator, &str) + Send>;

/// One conversational participant: identity, provider config, history and
/// runtime state.  Owned exclusively by the coordinator; worker threads see
/// only the shared atomics and the deferred slot.
pub struct Agent {
    // Identity
    pub uuid: String,
    pub name: Option<String>,
    pub parent_uuid: Option<String>,

    // Configuration
    pub provider: String,
    pub model: String,
    pub thinking_level: ThinkingLevel,
    pub system_prompt: Option<String>,

    // History
    pub messages: Vec<Message>,
    pub fork_message_id: Option<i64>,
    pub pinned_paths: Vec<String>,
    pub toolset_filter: Option<Vec<String>>,
    pub marks: Vec<Mark>,
    pub created_at: DateTime<Utc>,

    // Runtime
    pub state: Arc<StateCell>,
    pub interrupt_requested: Arc<AtomicBool>,
    pub tool_iteration_count: u32,
    pub accumulator: Option<StreamAccumulator>,
    pub pending_tool_call: Option<PendingToolCall>,
    pub last_finish_reason: Option<FinishReason>,
    /// Incremented per request; stale stream events are dropped by
    /// generation mismatch after an interrupt.
    pub stream_gen: u64,
    /// Prompt queued by fork to be submitted on the next tick.
    pub pending_prompt: Option<String>,

    // Display state
    pub scrollback: Scrollback,
    pub input: InputBuffer,
    pub viewport_offset: usize,

    // Worker handshake
    pub tool_thread: Option<std::thread::JoinHandle<()>>,
    pub tool_running: bool,
    pub tool_done: Arc<AtomicBool>,
    pub tool_deferred: Arc<Mutex<Option<DeferredData>>>,
    pub pending_on_complete: Option<OnComplete>,
}

impl Agent {
    pub fn new(
        uuid: String,
        parent_uuid: Option<String>,
        provider: String,
        model: String,
        thinking_level: ThinkingLevel,
    ) -> Self {
        Self {
            uuid,
            name: None,
            parent_uuid,
            provider,
            model,
            thinking_level,
            system_prompt: None,
            messages: Vec::new(),
            fork_message_id: None,
            pinned_paths: Vec::new(),
            toolset_filter: None,
            marks: Vec::new(),
            created_at: Utc::now(),
            state: Arc::new(StateCell::default()),
            interrupt_requested: Arc::new(AtomicBool::new(false)),
            tool_iteration_count: 0,
            accumulator: None,
            pending_tool_call: None,
            last_finish_reason: None,
            stream_gen: 0,
            pending_prompt: None,
            scrollback: Scrollback::new(),
            input: InputBuffer::new(),
            viewport_offset: 0,
            tool_thread: None,
            tool_running: false,
            tool_done: Arc::new(AtomicBool::new(false)),
            tool_deferred: Arc::new(Mutex::new(None)),
            pending_on_complete: None,
        }
    }

    // ── Messages ──────────────────────────────────────────────────────────────

    pub fn add_message(&mut self, msg: Message) {
        self.messages.push(msg);
    }

    pub fn clear_messages(&mut self) {
        self.messages.clear();
    }

    /// Deep-copy every message from `src` into this agent, replacing any
    /// existing history.  No block type is dropped; the copies share no
    /// memory with the source.
    pub fn clone_messages_from(&mut self, src: &Agent) {
        self.messages = src.messages.clone();
    }

    // ── Interrupt ─────────────────────────────────────────────────────────────

    /// Request cancellation of the in-flight stream or tool.  Idempotent.
    pub fn request_interrupt(&self) {
        self.interrupt_requested.store(true, Ordering::Release);
    }

    pub fn interrupt_pending(&self) -> bool {
        self.interrupt_requested.load(Ordering::Acquire)
    }

    /// Transitioning back to IDLE clears the flag.
    pub fn go_idle(&mut self) {
        self.state.set(AgentState::Idle);
        self.interrupt_requested.store(false, Ordering::Release);
    }

    pub fn has_running_tool(&self) -> bool {
        self.tool_running
    }

    /// Take the worker's deferred payload, if it produced one.
    pub fn take_deferred(&mut self) -> Option<DeferredData> {
        self.tool_deferred.lock().unwrap().take()
    }

    // ── Marks ─────────────────────────────────────────────────────────────────

    /// Find a mark by label, or the most recent mark when `label` is None.
    pub fn find_mark(&self, label: Option<&str>) -> Option<Mark> {
        match label {
            Some(l) => self
                .marks
                .iter()
                .rev()
                .find(|m| m.label.as_deref() == Some(l))
                .cloned(),
            None => self.marks.last().cloned(),
        }
    }

    /// Rewind to a mark: truncate the message sequence to the mark's index,
    /// remove marks strictly after it (the target survives for reuse), and
    /// rebuild the scrollback from the retained messages.
    pub fn rewind_to_mark(&mut self, mark: &Mark) {
        self.messages.truncate(mark.message_index);
        self.marks.retain(|m| m.message_index <= mark.message_index);
        let retained = self.messages.clone();
        self.scrollback.rebuild_from_messages(&retained);
        self.viewport_offset = 0;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(uuid: &str) -> Agent {
        Agent::new(
            uuid.into(),
            None,
            "openai".into(),
            "gpt-5".into(),
            ThinkingLevel::None,
        )
    }

    #[test]
    fn add_and_clear_messages() {
        let mut a = agent("a1");
        a.add_message(Message::user("hi"));
        a.add_message(Message::assistant("hello"));
        assert_eq!(a.messages.len(), 2);
        a.clear_messages();
        assert!(a.messages.is_empty());
    }

    #[test]
    fn clone_messages_is_deep_and_complete() {
        let mut parent = agent("p");
        parent.add_message(Message::user("hi"));
        parent.add_message(Message::tool_call_with_thinking(
            Some("think"),
            Some("sig"),
            Some("blob"),
            "tc",
            "bash",
            r#"{"command":"ls"}"#,
            Some("tsig"),
        ));
        parent.add_message(Message::tool_result("tc", "out", true));

        let mut child = agent("c");
        child.clone_messages_from(&parent);
        assert_eq!(child.messages, parent.messages);

        // Child mutation leaves the parent untouched.
        child.clear_messages();
        assert_eq!(parent.messages.len(), 3);
    }

    #[test]
    fn interrupt_is_idempotent_and_cleared_on_idle() {
        let mut a = agent("a1");
        a.request_interrupt();
        a.request_interrupt();
        assert!(a.interrupt_pending());
        a.go_idle();
        assert!(!a.interrupt_pending());
        assert_eq!(a.state.get(), AgentState::Idle);
    }

    // ── Marks ─────────────────────────────────────────────────────────────────

    fn with_ten_messages_and_marks() -> Agent {
        let mut a = agent("m");
        for i in 0..10 {
            a.add_message(Message::user(format!("msg {i}")));
        }
        a.marks = vec![
            Mark { label: Some("A".into()), message_index: 2 },
            Mark { label: Some("B".into()), message_index: 5 },
            Mark { label: Some("C".into()), message_index: 8 },
        ];
        a
    }

    #[test]
    fn rewind_truncates_and_removes_later_marks() {
        let mut a = with_ten_messages_and_marks();
        let mark = a.find_mark(Some("B")).unwrap();
        a.rewind_to_mark(&mark);
        assert_eq!(a.messages.len(), 5);
        let labels: Vec<_> = a.marks.iter().map(|m| m.label.clone().unwrap()).collect();
        assert_eq!(labels, vec!["A", "B"]);
    }

    #[test]
    fn rewind_target_mark_is_reusable() {
        let mut a = with_ten_messages_and_marks();
        let mark = a.find_mark(Some("B")).unwrap();
        a.rewind_to_mark(&mark);
        // A second rewind to the same mark still works.
        let again = a.find_mark(Some("B")).unwrap();
        a.rewind_to_mark(&again);
        assert_eq!(a.messages.len(), 5);
    }

    #[test]
    fn find_mark_without_label_returns_most_recent() {
        let a = with_ten_messages_and_marks();
        assert_eq!(a.find_mark(None).unwrap().label.as_deref(), Some("C"));
    }

    #[test]
    fn find_mark_unknown_label_is_none() {
        let a = with_ten_messages_and_marks();
        assert!(a.find_mark(Some("Z")).is_none());
    }

    #[test]
    fn rewind_rebuilds_scrollback_from_retained_messages() {
        let mut a = agent("r");
        a.add_message(Message::user("keep"));
        a.add_message(Message::assistant("drop"));
        a.marks = vec![Mark { label: None, message_index: 1 }];
        let mark = a.find_mark(None).unwrap();
        a.rewind_to_mark(&mark);
        assert_eq!(a.scrollback.lines(), ["> keep"]);
    }
}
