// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The coordinator owns the live agent tree and the main-loop side of every
//! cross-thread handshake: stream pumps post events into the UI channel,
//! tool workers complete through the deferred slot, and all integration
//! happens here, on the main thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use arbor_config::Config;
use arbor_model::{
    provider_for, FinishReason, Message, MessageRecord, Request, StreamAccumulator, StreamEvent,
    ThinkingLevel, ToolSpec,
};
use arbor_store::{AgentRow, AgentStatus, Store};
use arbor_tools::{wrap_failure, InternalTool, ToolEntry, ToolRegistry};

use crate::agent::{Agent, Mark};
use crate::events::UiEvent;
use crate::ident::generate_uuid;
use crate::internal::{
    fork_handler, kill_handler, send_handler, wait_handler, CallerSnapshot, CompletionDetail,
    ToolCompletion, TreePeek,
};
use crate::state::AgentState;
use crate::wait::AgentPeek;

/// Navigation indicators for the separator line, refreshed after every
/// switch, fork and kill.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct NavContext {
    pub parent_uuid: Option<String>,
    pub prev_sibling: Option<String>,
    pub next_sibling: Option<String>,
    pub child_count: usize,
}

pub struct Coordinator {
    pub config: Config,
    pub store: Store,
    pub session_id: i64,
    pub registry: ToolRegistry,
    /// Live agents only; dead agents exist solely in the store.
    pub agents: Vec<Agent>,
    pub current_uuid: String,
    pub nav: NavContext,
    /// At most one fork is visible to the store at a time.
    pub fork_pending: Arc<AtomicBool>,
    /// Routes raw stream events to tracing when enabled (`/debug on`).
    pub debug_stream: bool,
    pub quit: bool,
    ui_tx: mpsc::UnboundedSender<UiEvent>,
}

impl Coordinator {
    /// Fresh session with a single root agent.
    pub fn new(
        config: Config,
        store: Store,
        ui_tx: mpsc::UnboundedSender<UiEvent>,
    ) -> anyhow::Result<Self> {
        let session_id = store.create_session()?;
        let mut coordinator = Self {
            registry: ToolRegistry::with_builtins(config.tools.bash_output_limit),
            config,
            store,
            session_id,
            agents: Vec::new(),
            current_uuid: String::new(),
            nav: NavContext::default(),
            fork_pending: Arc::new(AtomicBool::new(false)),
            debug_stream: false,
            quit: false,
            ui_tx,
        };
        coordinator.create_root()?;
        Ok(coordinator)
    }

    /// Resume the most recent session, or start fresh when none exists.
    pub fn resume(
        config: Config,
        store: Store,
        ui_tx: mpsc::UnboundedSender<UiEvent>,
    ) -> anyhow::Result<Self> {
        let Some(session_id) = store.latest_session()? else {
            return Self::new(config, store, ui_tx);
        };
        let rows = store.live_agents(session_id)?;
        if rows.is_empty() {
            return Self::new(config, store, ui_tx);
        }

        let mut coordinator = Self {
            registry: ToolRegistry::with_builtins(config.tools.bash_output_limit),
            config,
            store,
            session_id,
            agents: Vec::new(),
            current_uuid: String::new(),
            nav: NavContext::default(),
            fork_pending: Arc::new(AtomicBool::new(false)),
            debug_stream: false,
            quit: false,
            ui_tx,
        };
        for row in rows {
            let agent = coordinator.load_agent(&row)?;
            coordinator.agents.push(agent);
        }
        // Prefer the root as current; fall back to the first live agent.
        coordinator.current_uuid = coordinator
            .agents
            .iter()
            .find(|a| a.parent_uuid.is_none())
            .or_else(|| coordinator.agents.first())
            .map(|a| a.uuid.clone())
            .unwrap_or_default();
        coordinator.update_nav_context();
        Ok(coordinator)
    }

    fn create_root(&mut self) -> anyhow::Result<()> {
        let uuid = generate_uuid();
        let agent = Agent::new(
            uuid.clone(),
            None,
            self.config.agent.provider.clone(),
            self.config.agent.model.clone(),
            ThinkingLevel::parse(&self.config.agent.thinking),
        );
        self.store.insert_agent(&AgentRow {
            uuid: uuid.clone(),
            session_id: self.session_id,
            parent_uuid: None,
            name: None,
            status: AgentStatus::Running,
            provider: agent.provider.clone(),
            model: agent.model.clone(),
            thinking_level: agent.thinking_level.as_str().to_string(),
            fork_message_id: None,
            created_at: agent.created_at.to_rfc3339(),
            ended_at: None,
        })?;
        self.agents.push(agent);
        self.current_uuid = uuid;
        self.update_nav_context();
        Ok(())
    }

    /// Rebuild one live agent from its persisted rows: config, bounded
    /// history (clear and child-fork boundaries), marks, scrollback.
    fn load_agent(&self, row: &AgentRow) -> anyhow::Result<Agent> {
        let mut agent = Agent::new(
            row.uuid.clone(),
            row.parent_uuid.clone(),
            row.provider.clone(),
            row.model.clone(),
            ThinkingLevel::parse(&row.thinking_level),
        );
        agent.name = row.name.clone();
        agent.fork_message_id = row.fork_message_id;
        if let Ok(t) = chrono::DateTime::parse_from_rfc3339(&row.created_at) {
            agent.created_at = t.with_timezone(&chrono::Utc);
        }

        for m in self.store.messages_for_agent(self.session_id, &row.uuid)? {
            match m.kind.as_str() {
                "system" => agent.system_prompt = m.content.clone(),
                "clear" => agent.clear_messages(),
                "fork" => {
                    let is_child = m
                        .data_json
                        .as_deref()
                        .and_then(|d| serde_json::from_str::<Value>(d).ok())
                        .map(|v| v["role"] == json!("child"))
                        .unwrap_or(false);
                    if is_child {
                        agent.clear_messages();
                    }
                }
                _ => {
                    let record = MessageRecord {
                        kind: m.kind.clone(),
                        content: m.content.clone(),
                        data_json: m.data_json.clone(),
                    };
                    match Message::from_record(&record) {
                        Ok(Some(msg)) => agent.add_message(msg),
                        Ok(None) => {}
                        Err(e) => warn!(agent = %row.uuid, "skipping malformed message: {e}"),
                    }
                }
            }
        }
        for mark in self.store.marks_for_agent(&row.uuid)? {
            agent.marks.push(Mark {
                label: mark.label,
                message_index: mark.message_index as usize,
            });
        }
        let history = agent.messages.clone();
        agent.scrollback.rebuild_from_messages(&history);
        Ok(agent)
    }

    // ── Lookup ────────────────────────────────────────────────────────────────

    fn agent_index(&self, uuid: &str) -> Option<usize> {
        self.agents.iter().position(|a| a.uuid == uuid)
    }

    pub fn agent(&self, uuid: &str) -> Option<&Agent> {
        self.agents.iter().find(|a| a.uuid == uuid)
    }

    pub fn agent_mut(&mut self, uuid: &str) -> Option<&mut Agent> {
        self.agents.iter_mut().find(|a| a.uuid == uuid)
    }

    pub fn current(&self) -> Option<&Agent> {
        self.agent(&self.current_uuid.clone())
    }

    pub fn current_mut(&mut self) -> Option<&mut Agent> {
        let uuid = self.current_uuid.clone();
        self.agent_mut(&uuid)
    }

    /// The unique live agent whose UUID starts with `prefix`.
    /// An exact match wins over prefix matches; ambiguity yields `None`.
    pub fn find_agent(&self, prefix: &str) -> Option<&Agent> {
        if let Some(exact) = self.agents.iter().find(|a| a.uuid == prefix) {
            return Some(exact);
        }
        let mut matches = self.agents.iter().filter(|a| a.uuid.starts_with(prefix));
        match (matches.next(), matches.next()) {
            (Some(one), None) => Some(one),
            _ => None,
        }
    }

    /// True iff two or more live agents share the prefix.
    pub fn uuid_ambiguous(&self, prefix: &str) -> bool {
        self.agents
            .iter()
            .filter(|a| a.uuid.starts_with(prefix))
            .count()
            >= 2
    }

    // ── Navigation ────────────────────────────────────────────────────────────

    pub fn switch_agent(&mut self, uuid: &str) {
        if uuid == self.current_uuid || self.agent_index(uuid).is_none() {
            return;
        }
        // Input buffer and viewport offset are per-agent fields, so they
        // restore implicitly with the switch.
        self.current_uuid = uuid.to_string();
        self.update_nav_context();
    }

    fn sibling_uuids(&self) -> Vec<String> {
        let Some(current) = self.current() else { return Vec::new() };
        let parent = current.parent_uuid.clone();
        self.agents
            .iter()
            .filter(|a| a.parent_uuid == parent)
            .map(|a| a.uuid.clone())
            .collect()
    }

    pub fn nav_prev_sibling(&mut self) {
        let siblings = self.sibling_uuids();
        if siblings.len() <= 1 {
            return;
        }
        let idx = siblings
            .iter()
            .position(|u| u == &self.current_uuid)
            .unwrap_or(0);
        let prev = if idx == 0 { siblings.len() - 1 } else { idx - 1 };
        self.switch_agent(&siblings[prev].clone());
    }

    pub fn nav_next_sibling(&mut self) {
        let siblings = self.sibling_uuids();
        if siblings.len() <= 1 {
            return;
        }
        let idx = siblings
            .iter()
            .position(|u| u == &self.current_uuid)
            .unwrap_or(0);
        let next = (idx + 1) % siblings.len();
        self.switch_agent(&siblings[next].clone());
    }

    pub fn nav_parent(&mut self) {
        let Some(parent) = self.current().and_then(|a| a.parent_uuid.clone()) else {
            return;
        };
        // Dead agents leave the live array, so a killed parent is a no-op.
        if self.agent_index(&parent).is_some() {
            self.switch_agent(&parent);
        }
    }

    /// Switch to the live child with the greatest `created_at`; ties break
    /// to the first encountered in array order.
    pub fn nav_child(&mut self) {
        let current = self.current_uuid.clone();
        let mut newest: Option<(&Agent, chrono::DateTime<chrono::Utc>)> = None;
        for a in &self.agents {
            if a.parent_uuid.as_deref() == Some(current.as_str()) {
                match &newest {
                    Some((_, t)) if a.created_at <= *t => {}
                    _ => newest = Some((a, a.created_at)),
                }
            }
        }
        if let Some((child, _)) = newest {
            let uuid = child.uuid.clone();
            self.switch_agent(&uuid);
        }
    }

    /// Recompute the separator indicators for the current agent.
    pub fn update_nav_context(&mut self) {
        let Some(current) = self.current() else {
            self.nav = NavContext::default();
            return;
        };
        let parent_uuid = current.parent_uuid.clone();
        let current_uuid = current.uuid.clone();
        let current_created = current.created_at;

        let mut prev: Option<(&Agent, chrono::DateTime<chrono::Utc>)> = None;
        let mut next: Option<(&Agent, chrono::DateTime<chrono::Utc>)> = None;
        let mut child_count = 0usize;

        for a in &self.agents {
            if a.uuid == current_uuid {
                continue;
            }
            if a.parent_uuid.as_deref() == Some(current_uuid.as_str()) {
                child_count += 1;
            }
            if a.parent_uuid != parent_uuid {
                continue;
            }
            if a.created_at < current_created {
                // Keep the most recent earlier sibling.
                match &prev {
                    Some((_, t)) if a.created_at <= *t => {}
                    _ => prev = Some((a, a.created_at)),
                }
            } else {
                // Keep the earliest later sibling.
                match &next {
                    Some((_, t)) if a.created_at >= *t => {}
                    _ => next = Some((a, a.created_at)),
                }
            }
        }

        self.nav = NavContext {
            parent_uuid,
            prev_sibling: prev.map(|(a, _)| a.uuid.clone()),
            next_sibling: next.map(|(a, _)| a.uuid.clone()),
            child_count,
        };
    }

    // ── Submit / request ──────────────────────────────────────────────────────

    /// Enqueue user input on the current agent and start the request.
    pub fn submit(&mut self, text: &str) {
        let uuid = self.current_uuid.clone();
        self.submit_on(&uuid, text);
    }

    pub fn submit_on(&mut self, uuid: &str, text: &str) {
        let Some(idx) = self.agent_index(uuid) else { return };
        if self.agents[idx].state.get().is_busy() {
            self.agents[idx]
                .scrollback
                .append_warning("Agent is busy; interrupt it first (Ctrl-C)");
            return;
        }
        {
            let agent = &mut self.agents[idx];
            agent.tool_iteration_count = 0;
            for line in text.lines() {
                agent.scrollback.append_line(format!("> {line}"));
            }
            agent.add_message(Message::user(text));
        }
        self.persist_message(uuid, &Message::user(text));
        self.start_request(uuid);
    }

    fn persist_message(&self, agent_uuid: &str, msg: &Message) {
        let record = msg.to_record();
        if let Err(e) = self.store.insert_message(
            self.session_id,
            agent_uuid,
            &record.kind,
            record.content.as_deref(),
            record.data_json.as_deref(),
        ) {
            warn!(agent = %agent_uuid, "failed to persist message: {e}");
        }
    }

    /// Build the request from the agent's state and spawn the stream pump.
    pub fn start_request(&mut self, uuid: &str) {
        let Some(idx) = self.agent_index(uuid) else { return };

        let (request, provider_name) = {
            let agent = &self.agents[idx];
            let tools: Vec<ToolSpec> = self
                .registry
                .schemas(agent.toolset_filter.as_deref())
                .into_iter()
                .map(|s| ToolSpec {
                    name: s.name,
                    description: s.description,
                    input_schema: s.input_schema,
                })
                .collect();
            let mut req = Request::new(agent.model.clone(), &agent.messages);
            req.system_prompt = agent.system_prompt.clone();
            req.tools = tools;
            req.temperature = self.config.agent.temperature;
            req.max_completion_tokens = self.config.agent.max_completion_tokens;
            req.thinking_level = agent.thinking_level;
            (req, agent.provider.clone())
        };

        let provider = match provider_for(
            &provider_name,
            &self.config.api_key_env(&provider_name),
            self.config.base_url(&provider_name),
        ) {
            Ok(p) => p,
            Err(e) => {
                let agent = &mut self.agents[idx];
                agent.scrollback.append_error(&e.to_string());
                agent.go_idle();
                return;
            }
        };

        let agent = &mut self.agents[idx];
        agent.stream_gen += 1;
        agent.accumulator = Some(StreamAccumulator::new());
        agent.state.set(AgentState::WaitingForLlm);

        let generation = agent.stream_gen;
        let interrupt = Arc::clone(&agent.interrupt_requested);
        let tx = self.ui_tx.clone();
        let agent_uuid = uuid.to_string();

        let pump = async move {
            use futures::StreamExt;
            match provider.complete(request).await {
                Ok(mut stream) => {
                    while let Some(event) = stream.next().await {
                        // Cancellation is observed at chunk boundaries.
                        if interrupt.load(Ordering::Acquire) {
                            break;
                        }
                        let terminal = matches!(
                            event,
                            StreamEvent::Done { .. } | StreamEvent::Error { .. }
                        );
                        let _ = tx.send(UiEvent::Stream {
                            agent_uuid: agent_uuid.clone(),
                            generation,
                            event,
                        });
                        if terminal {
                            break;
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.send(UiEvent::Stream {
                        agent_uuid,
                        generation,
                        event: StreamEvent::Error { message: e.to_string(), retryable: false },
                    });
                }
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(pump);
            }
            Err(_) => {
                let _ = self.ui_tx.send(UiEvent::Stream {
                    agent_uuid: uuid.to_string(),
                    generation,
                    event: StreamEvent::Error {
                        message: "no async runtime available".into(),
                        retryable: false,
                    },
                });
            }
        }
    }

    // ── Stream events ─────────────────────────────────────────────────────────

    pub fn handle_ui_event(&mut self, event: UiEvent) {
        match event {
            UiEvent::Stream { agent_uuid, generation, event } => {
                self.handle_stream_event(&agent_uuid, generation, event);
            }
        }
    }

    fn handle_stream_event(&mut self, uuid: &str, generation: u64, event: StreamEvent) {
        let Some(idx) = self.agent_index(uuid) else { return };
        if self.agents[idx].stream_gen != generation {
            // Raced past an interrupt or a newer request.
            return;
        }
        if self.debug_stream {
            debug!(agent = %uuid, ?event, "stream event");
        }
        if self.agents[idx].accumulator.is_none() {
            return;
        }

        match event {
            StreamEvent::Done { finish_reason, usage } => {
                if let Some(acc) = self.agents[idx].accumulator.as_mut() {
                    acc.apply(&StreamEvent::Done { finish_reason, usage });
                }
                self.finalize_turn(uuid, finish_reason);
            }
            StreamEvent::Error { message, .. } => {
                // Discard any partial response; a half-accumulated turn
                // would poison the next provider call.
                let agent = &mut self.agents[idx];
                agent.accumulator = None;
                agent.scrollback.discard_stream();
                agent.scrollback.append_error(&message);
                agent.go_idle();
            }
            other => {
                let agent = &mut self.agents[idx];
                let is_delta = matches!(
                    other,
                    StreamEvent::TextDelta { .. }
                        | StreamEvent::ThinkingDelta { .. }
                        | StreamEvent::ToolCallStart { .. }
                );
                if is_delta && agent.state.get() == AgentState::WaitingForLlm {
                    agent.state.set(AgentState::Streaming);
                }
                if let StreamEvent::TextDelta { text, .. } = &other {
                    agent.scrollback.append_stream_text(text);
                }
                if let Some(acc) = agent.accumulator.as_mut() {
                    acc.apply(&other);
                }
            }
        }
    }

    fn finalize_turn(&mut self, uuid: &str, finish: FinishReason) {
        let Some(idx) = self.agent_index(uuid) else { return };

        let (message, pending) = {
            let agent = &mut self.agents[idx];
            let Some(acc) = agent.accumulator.take() else {
                agent.go_idle();
                return;
            };
            agent.scrollback.flush_stream();
            agent.last_finish_reason = Some(finish);
            let pending = acc.pending_tool_call().cloned();
            debug!(agent = %uuid, ?finish, tokens = acc.usage.total(), "turn complete");
            (acc.into_message(), pending)
        };

        if let Some(msg) = &message {
            self.agents[idx].add_message(msg.clone());
            self.persist_message(uuid, msg);
        }

        if finish == FinishReason::ToolCalls {
            if let Some(tc) = pending {
                if self.tool_loop_allowed(idx) {
                    self.agents[idx].pending_tool_call = Some(tc);
                    self.start_tool_execution(uuid);
                    return;
                }
                // Keep history coherent: the provider expects a result for
                // every emitted tool call.
                let result = Message::tool_result(
                    tc.id.as_str(),
                    wrap_failure("Tool loop disabled or limit reached", "TOOL_LIMIT"),
                    true,
                );
                self.agents[idx].add_message(result.clone());
                self.persist_message(uuid, &result);
                self.agents[idx]
                    .scrollback
                    .append_warning("Tool loop limit reached; returning to idle");
            }
        }
        self.agents[idx].go_idle();
    }

    /// The loop continues only while `tool_iteration_count < max_tool_turns`.
    /// Absent means unlimited; non-positive disables the loop.
    fn tool_loop_allowed(&self, idx: usize) -> bool {
        match self.config.agent.max_tool_turns {
            None => true,
            Some(max) if max <= 0 => false,
            Some(max) => (self.agents[idx].tool_iteration_count as i64) < max,
        }
    }

    // ── Tool execution ────────────────────────────────────────────────────────

    /// Spawn the worker thread for the agent's pending tool call.
    fn start_tool_execution(&mut self, uuid: &str) {
        let Some(idx) = self.agent_index(uuid) else { return };
        let Some(tc) = self.agents[idx].pending_tool_call.clone() else { return };
        let args: Value = serde_json::from_str(&tc.arguments).unwrap_or_else(|_| json!({}));

        self.agents[idx].state.set(AgentState::ExecutingTool);
        self.agents[idx]
            .scrollback
            .append_line(format!("[tool] {}", tc.name));

        let mut release_fork_guard = false;
        let entry = self.registry.get(&tc.name).map(|(_, e)| e.clone());
        let job: Box<dyn FnOnce() -> ToolCompletion + Send> = match entry {
            None => {
                let name = tc.name.clone();
                Box::new(move || {
                    ToolCompletion::plain(wrap_failure(
                        format!("Unknown tool: {name}"),
                        "UNKNOWN_TOOL",
                    ))
                })
            }
            Some(ToolEntry::Handler(tool)) => {
                Box::new(move || ToolCompletion::plain(tool.execute(&args).into_envelope()))
            }
            Some(ToolEntry::Internal(kind)) => {
                match self.internal_job(idx, kind, args, &mut release_fork_guard) {
                    Ok(job) => job,
                    Err(envelope) => Box::new(move || ToolCompletion::plain(envelope)),
                }
            }
        };

        let on_complete: crate::agent::OnComplete = Box::new(move |coordinator, agent_uuid| {
            if release_fork_guard {
                coordinator.fork_pending.store(false, Ordering::Release);
            }
            coordinator.integrate_tool_result(agent_uuid);
        });
        self.agents[idx].pending_on_complete = Some(on_complete);
        self.spawn_worker(idx, job);
    }

    /// Build the worker closure for an internal tool, capturing a dedicated
    /// store handle and a read-only view of the live tree.
    fn internal_job(
        &mut self,
        idx: usize,
        kind: InternalTool,
        args: Value,
        release_fork_guard: &mut bool,
    ) -> Result<Box<dyn FnOnce() -> ToolCompletion + Send>, String> {
        let store = self
            .store
            .reopen()
            .map_err(|e| wrap_failure(format!("Store unavailable: {e}"), "DB_ERROR"))?;
        let session_id = self.session_id;
        let caller_uuid = self.agents[idx].uuid.clone();

        match kind {
            InternalTool::Fork => {
                if self.fork_pending.swap(true, Ordering::AcqRel) {
                    return Err(wrap_failure("Fork already in progress", "FORK_PENDING"));
                }
                *release_fork_guard = true;
                let caller = CallerSnapshot {
                    uuid: caller_uuid,
                    provider: self.agents[idx].provider.clone(),
                    model: self.agents[idx].model.clone(),
                    thinking_level: self.agents[idx].thinking_level,
                };
                Ok(Box::new(move || fork_handler(&store, session_id, &caller, &args)))
            }
            InternalTool::Kill => {
                let tree: Vec<TreePeek> = self
                    .agents
                    .iter()
                    .map(|a| TreePeek {
                        uuid: a.uuid.clone(),
                        parent_uuid: a.parent_uuid.clone(),
                    })
                    .collect();
                Ok(Box::new(move || kill_handler(&store, &caller_uuid, &tree, &args)))
            }
            InternalTool::Wait => {
                let peeks: Vec<AgentPeek> = self
                    .agents
                    .iter()
                    .map(|a| AgentPeek {
                        uuid: a.uuid.clone(),
                        name: a.name.clone(),
                        state: Arc::clone(&a.state),
                    })
                    .collect();
                let interrupt = Arc::clone(&self.agents[idx].interrupt_requested);
                Ok(Box::new(move || {
                    wait_handler(&store, session_id, &caller_uuid, &peeks, &args, &interrupt)
                }))
            }
            InternalTool::Send => {
                Ok(Box::new(move || send_handler(&store, session_id, &caller_uuid, &args)))
            }
        }
    }

    fn spawn_worker(&mut self, idx: usize, job: Box<dyn FnOnce() -> ToolCompletion + Send>) {
        let agent = &mut self.agents[idx];
        agent.tool_done.store(false, Ordering::Release);
        agent.tool_running = true;
        let done = Arc::clone(&agent.tool_done);
        let slot = Arc::clone(&agent.tool_deferred);
        agent.tool_thread = Some(std::thread::spawn(move || {
            let completion = job();
            // The worker only stores its result; rendering and tree
            // mutation happen on the main thread.
            *slot.lock().unwrap() = Some(Box::new(completion));
            done.store(true, Ordering::Release);
        }));
    }

    /// Main-loop scheduling tick: join finished workers, run deferred
    /// completions, and start prompts queued on freshly forked children.
    pub fn tick(&mut self) {
        let ready: Vec<String> = self
            .agents
            .iter()
            .filter(|a| a.tool_running && a.tool_done.load(Ordering::Acquire))
            .map(|a| a.uuid.clone())
            .collect();
        for uuid in ready {
            let Some(idx) = self.agent_index(&uuid) else { continue };
            let on_complete = {
                let agent = &mut self.agents[idx];
                if let Some(handle) = agent.tool_thread.take() {
                    let _ = handle.join();
                }
                agent.tool_running = false;
                agent.tool_done.store(false, Ordering::Release);
                agent.pending_on_complete.take()
            };
            if let Some(f) = on_complete {
                f(self, &uuid);
            }
        }

        let pending: Vec<(String, String)> = self
            .agents
            .iter_mut()
            .filter(|a| {
                a.pending_prompt.is_some()
                    && a.state.get() == AgentState::Idle
                    && !a.tool_running
            })
            .map(|a| (a.uuid.clone(), a.pending_prompt.take().unwrap_or_default()))
            .collect();
        for (uuid, prompt) in pending {
            self.submit_on(&uuid, &prompt);
        }
    }

    /// Consume the worker's payload: integrate tree changes, render the
    /// outcome, append the tool-result message, and decide whether the tool
    /// loop continues.
    fn integrate_tool_result(&mut self, uuid: &str) {
        let Some(idx) = self.agent_index(uuid) else { return };
        let completion = match self.agents[idx]
            .take_deferred()
            .and_then(|b| b.downcast::<ToolCompletion>().ok())
        {
            Some(c) => *c,
            None => {
                self.agents[idx].go_idle();
                return;
            }
        };
        let success = completion.succeeded();

        match completion.detail {
            CompletionDetail::Plain => {}
            CompletionDetail::ForkChild(spec) => {
                // Ownership of the child transfers to the coordinator here.
                let mut child = Agent::new(
                    spec.uuid.clone(),
                    Some(spec.parent_uuid.clone()),
                    spec.provider,
                    spec.model,
                    spec.thinking_level,
                );
                child.name = Some(spec.name.clone());
                child.fork_message_id = spec.fork_message_id;
                child.pending_prompt = Some(spec.prompt);
                self.agents.push(child);
                if let Some(a) = self.agent_mut(uuid) {
                    a.scrollback
                        .append_line(format!("Forked {} ({})", spec.name, spec.uuid));
                }
                self.update_nav_context();
            }
            CompletionDetail::Killed { uuid: dead } => {
                self.remove_agent(&dead);
                if let Some(a) = self.agent_mut(uuid) {
                    a.scrollback.append_line(format!("Killed {dead}"));
                }
            }
            CompletionDetail::Wait(result) => {
                if let Some(a) = self.agent_mut(uuid) {
                    render_wait_result(&mut a.scrollback, &result);
                }
            }
        }

        // The caller may have been removed (self-directed kill).
        let Some(idx) = self.agent_index(uuid) else { return };

        if let Some(tc) = self.agents[idx].pending_tool_call.take() {
            let result =
                Message::tool_result(tc.id.as_str(), completion.envelope.as_str(), !success);
            self.agents[idx].add_message(result.clone());
            self.persist_message(uuid, &result);
            self.agents[idx].tool_iteration_count += 1;

            if self.agents[idx].interrupt_pending() {
                self.agents[idx].scrollback.append_warning("Interrupted");
                self.agents[idx].go_idle();
            } else if self.tool_loop_allowed(idx) {
                self.agents[idx].state.set(AgentState::WaitingForLlm);
                self.start_request(uuid);
            } else {
                self.agents[idx]
                    .scrollback
                    .append_warning("Tool loop limit reached; returning to idle");
                self.agents[idx].go_idle();
            }
        } else {
            // REPL-initiated worker (e.g. /wait): nothing goes back to the
            // provider.
            self.agents[idx].go_idle();
        }
    }

    /// Remove a dead agent from the live array and reselect `current` if it
    /// was the one removed: parent if live, else root, else first live.
    fn remove_agent(&mut self, uuid: &str) {
        let removed_parent = self
            .agent(uuid)
            .and_then(|a| a.parent_uuid.clone());
        let was_current = self.current_uuid == uuid;
        self.agents.retain(|a| a.uuid != uuid);

        if was_current {
            let next = removed_parent
                .filter(|p| self.agent_index(p).is_some())
                .or_else(|| {
                    self.agents
                        .iter()
                        .find(|a| a.parent_uuid.is_none())
                        .map(|a| a.uuid.clone())
                })
                .or_else(|| self.agents.first().map(|a| a.uuid.clone()));
            if let Some(next) = next {
                self.current_uuid = next;
            } else {
                self.current_uuid.clear();
            }
        }
        self.update_nav_context();
    }

    // ── Interrupt ─────────────────────────────────────────────────────────────

    /// User cancel (Ctrl-C): streams abort immediately on the main thread;
    /// tool workers observe the flag and finish through the normal
    /// completion path.
    pub fn interrupt_current(&mut self) {
        let Some(agent) = self.current_mut() else { return };
        match agent.state.get() {
            AgentState::WaitingForLlm | AgentState::Streaming => {
                agent.request_interrupt();
                // Invalidate in-flight events so nothing lands after this.
                agent.stream_gen += 1;
                agent.accumulator = None;
                agent.scrollback.discard_stream();
                agent.scrollback.append_warning("Interrupted");
                agent.go_idle();
            }
            AgentState::ExecutingTool => {
                agent.request_interrupt();
            }
            AgentState::Idle => {}
        }
    }
}

/// Render a wait outcome into the caller's scrollback.
fn render_wait_result(scrollback: &mut crate::scrollback::Scrollback, result: &crate::wait::WaitResult) {
    if result.is_fanin {
        scrollback.append_line("Fan-in results:");
        for entry in &result.entries {
            let mut line = format!("  {}: {}", entry.agent_uuid, entry.status);
            if let Some(msg) = &entry.message {
                line.push_str(" - ");
                line.push_str(msg);
            }
            scrollback.append_line(line);
        }
    } else {
        match (&result.from_uuid, &result.message) {
            (Some(from), Some(body)) => {
                scrollback.append_line(format!("From: {from}"));
                scrollback.append_line(body.clone());
            }
            _ => scrollback.append_line("No messages"),
        }
    }
}

// ─── Commands (slash-command surface) ────────────────────────────────────────

impl Coordinator {
    /// `/fork [--model spec] [prompt…]`: interactive fork. The child deep
    /// copies the parent's conversation and scrollback.
    pub async fn cmd_fork(&mut self, model_spec: Option<&str>, prompt: Option<&str>) {
        // Sync barrier: a running tool owns the parent's deferred slot.
        if self.current().map_or(false, Agent::has_running_tool) {
            if let Some(a) = self.current_mut() {
                a.scrollback.append_line("Waiting for tools to complete...");
            }
            while self.current().map_or(false, Agent::has_running_tool) {
                self.tick();
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        }

        if self.fork_pending.swap(true, Ordering::AcqRel) {
            if let Some(a) = self.current_mut() {
                a.scrollback.append_warning("Fork already in progress");
            }
            return;
        }

        let outcome = self.fork_transaction(model_spec);
        self.fork_pending.store(false, Ordering::Release);

        match outcome {
            Ok(child_uuid) => {
                self.switch_agent(&child_uuid.clone());
                if let Some(a) = self.current_mut() {
                    a.scrollback.append_line(format!("Forked agent {child_uuid}"));
                }
                if let Some(prompt) = prompt.filter(|p| !p.trim().is_empty()) {
                    self.submit(prompt);
                }
            }
            Err(e) => {
                if let Some(a) = self.current_mut() {
                    a.scrollback.append_error(&e.to_string());
                }
            }
        }
    }

    /// The store-transactional part of an interactive fork.  On any failure
    /// the transaction rolls back and no live state has changed.
    fn fork_transaction(&mut self, model_spec: Option<&str>) -> anyhow::Result<String> {
        let parent_uuid = self.current_uuid.clone();
        let parent_idx = self
            .agent_index(&parent_uuid)
            .ok_or_else(|| anyhow::anyhow!("no current agent"))?;

        self.store.begin()?;
        let result: anyhow::Result<String> = (|| {
            let fork_message_id = self.store.last_message_id(&parent_uuid)?;

            let parent = &self.agents[parent_idx];
            let mut child = Agent::new(
                generate_uuid(),
                Some(parent_uuid.clone()),
                parent.provider.clone(),
                parent.model.clone(),
                parent.thinking_level,
            );
            if let Some(spec) = model_spec {
                let (provider, model, thinking) = parse_model_spec(spec)?;
                child.provider = provider;
                child.model = model;
                child.thinking_level = thinking;
            }
            child.fork_message_id = fork_message_id;
            child.system_prompt = parent.system_prompt.clone();
            child.clone_messages_from(parent);
            child.scrollback = parent.scrollback.clone();
            child.pinned_paths = parent.pinned_paths.clone();
            child.toolset_filter = parent.toolset_filter.clone();

            self.store.insert_agent(&AgentRow {
                uuid: child.uuid.clone(),
                session_id: self.session_id,
                parent_uuid: Some(parent_uuid.clone()),
                name: None,
                status: AgentStatus::Running,
                provider: child.provider.clone(),
                model: child.model.clone(),
                thinking_level: child.thinking_level.as_str().to_string(),
                fork_message_id,
                created_at: child.created_at.to_rfc3339(),
                ended_at: None,
            })?;

            let parent_payload = json!({
                "role": "parent",
                "child_uuid": child.uuid,
                "fork_message_id": fork_message_id,
            });
            self.store.insert_message(
                self.session_id,
                &parent_uuid,
                "fork",
                None,
                Some(&parent_payload.to_string()),
            )?;
            let child_payload = json!({
                "role": "child",
                "pinned_paths": child.pinned_paths,
                "toolset_filter": child.toolset_filter,
            });
            self.store.insert_message(
                self.session_id,
                &child.uuid,
                "fork",
                None,
                Some(&child_payload.to_string()),
            )?;

            let child_uuid = child.uuid.clone();
            self.agents.push(child);
            Ok(child_uuid)
        })();

        match result {
            Ok(uuid) => {
                self.store.commit()?;
                Ok(uuid)
            }
            Err(e) => {
                let _ = self.store.rollback();
                Err(e)
            }
        }
    }

    /// `/kill <uuid-prefix>`.
    pub fn cmd_kill(&mut self, prefix: &str) {
        if self.uuid_ambiguous(prefix) && self.agents.iter().all(|a| a.uuid != prefix) {
            if let Some(a) = self.current_mut() {
                a.scrollback
                    .append_error(&format!("Ambiguous UUID prefix: {prefix}"));
            }
            return;
        }
        let tree: Vec<TreePeek> = self
            .agents
            .iter()
            .map(|a| TreePeek { uuid: a.uuid.clone(), parent_uuid: a.parent_uuid.clone() })
            .collect();
        let caller = self.current_uuid.clone();
        let completion = kill_handler(&self.store, &caller, &tree, &json!({ "uuid": prefix }));
        if completion.succeeded() {
            if let CompletionDetail::Killed { uuid: dead } = completion.detail {
                self.remove_agent(&dead);
                if let Some(a) = self.current_mut() {
                    a.scrollback.append_line(format!("Killed {dead}"));
                }
            }
        } else {
            let message = serde_json::from_str::<Value>(&completion.envelope)
                .ok()
                .and_then(|v| v["error"].as_str().map(str::to_string))
                .unwrap_or_else(|| "kill failed".into());
            if let Some(a) = self.current_mut() {
                a.scrollback.append_error(&message);
            }
        }
    }

    /// `/wait <timeout> [uuid…]`: run the wait on a worker thread so the
    /// event loop keeps servicing other agents.
    pub fn cmd_wait(&mut self, timeout: i64, targets: Vec<String>) {
        let uuid = self.current_uuid.clone();
        let Some(idx) = self.agent_index(&uuid) else { return };
        if self.agents[idx].state.get().is_busy() {
            self.agents[idx].scrollback.append_warning("Agent is busy");
            return;
        }

        let mut args = json!({ "timeout": timeout });
        if !targets.is_empty() {
            args["from_agents"] = json!(targets);
        }
        let mut release_guard = false;
        let job = match self.internal_job(idx, InternalTool::Wait, args, &mut release_guard) {
            Ok(job) => job,
            Err(envelope) => Box::new(move || ToolCompletion::plain(envelope))
                as Box<dyn FnOnce() -> ToolCompletion + Send>,
        };
        // Entering EXECUTING_TOOL from IDLE: REPL-initiated wait has no
        // pending tool call, so integration ends at idle.
        self.agents[idx].state.set(AgentState::ExecutingTool);
        self.agents[idx].pending_on_complete = Some(Box::new(|coordinator, agent_uuid| {
            coordinator.integrate_tool_result(agent_uuid);
        }));
        self.spawn_worker(idx, job);
    }

    /// `/mark [label]`.
    pub fn cmd_mark(&mut self, label: Option<&str>) {
        let uuid = self.current_uuid.clone();
        let Some(agent) = self.agent_mut(&uuid) else { return };
        let index = agent.messages.len();
        agent.marks.push(Mark {
            label: label.map(str::to_string),
            message_index: index,
        });
        let line = match label {
            Some(l) => format!("Mark '{l}' created at message {index}"),
            None => format!("Mark created at message {index}"),
        };
        agent.scrollback.append_line(line);
        if let Err(e) = self.store.insert_mark(self.session_id, &uuid, label, index as i64) {
            warn!("failed to persist mark: {e}");
        }
    }

    /// `/rewind [label]`: rewind to the labelled mark, or the most recent.
    pub fn cmd_rewind(&mut self, label: Option<&str>) {
        let uuid = self.current_uuid.clone();
        let Some(agent) = self.agent_mut(&uuid) else { return };
        let Some(mark) = agent.find_mark(label) else {
            agent.scrollback.append_error(match label {
                Some(l) => format!("No mark named '{l}'"),
                None => "No marks set".to_string(),
            }
            .as_str());
            return;
        };
        agent.rewind_to_mark(&mark);
        agent
            .scrollback
            .append_line(format!("Rewound to message {}", mark.message_index));
        if let Err(e) = self
            .store
            .delete_marks_after(&uuid, mark.message_index as i64)
        {
            warn!("failed to prune marks: {e}");
        }
    }

    /// `/clear`: reset messages, scrollback and marks; persist the clear
    /// boundary so restore honors it.
    pub fn cmd_clear(&mut self) {
        let uuid = self.current_uuid.clone();
        let Some(agent) = self.agent_mut(&uuid) else { return };
        agent.clear_messages();
        agent.scrollback.clear();
        agent.marks.clear();
        agent.accumulator = None;
        agent.pending_tool_call = None;
        agent.viewport_offset = 0;
        if let Err(e) = self.store.insert_message(self.session_id, &uuid, "clear", None, None) {
            warn!("failed to persist clear event: {e}");
        }
        let _ = self.store.delete_marks_for_agent(&uuid);
    }

    /// `/model <provider/model[/thinking]>`.
    pub fn cmd_model(&mut self, spec: &str) {
        let parsed = parse_model_spec(spec);
        let uuid = self.current_uuid.clone();
        match parsed {
            Ok((provider, model, thinking)) => {
                if let Some(agent) = self.agent_mut(&uuid) {
                    agent.provider = provider.clone();
                    agent.model = model.clone();
                    agent.thinking_level = thinking;
                    agent.scrollback.append_line(format!(
                        "Model set to {provider}/{model}/{}",
                        thinking.as_str()
                    ));
                }
                if let Err(e) =
                    self.store
                        .update_agent_config(&uuid, &provider, &model, thinking.as_str())
                {
                    warn!("failed to persist model change: {e}");
                }
            }
            Err(e) => {
                if let Some(agent) = self.agent_mut(&uuid) {
                    agent.scrollback.append_error(&e.to_string());
                }
            }
        }
    }

    /// `/agents`: list live agents into the current scrollback.
    pub fn cmd_agents(&mut self) {
        let lines: Vec<String> = self
            .agents
            .iter()
            .map(|a| {
                let marker = if a.uuid == self.current_uuid { "*" } else { " " };
                let name = a.name.as_deref().unwrap_or("-");
                format!(
                    "{marker} {}  {:12} {:9} parent={}",
                    a.uuid,
                    name,
                    a.state.get().label(),
                    a.parent_uuid.as_deref().unwrap_or("-"),
                )
            })
            .collect();
        if let Some(agent) = self.current_mut() {
            agent.scrollback.append_line(format!("Agents ({}):", lines.len()));
            for line in lines {
                agent.scrollback.append_line(line);
            }
        }
    }

    /// `/debug on|off`.
    pub fn cmd_debug(&mut self, enabled: bool) {
        self.debug_stream = enabled;
        if let Some(agent) = self.current_mut() {
            agent.scrollback.append_line(format!(
                "Stream debug {}",
                if enabled { "enabled" } else { "disabled" }
            ));
        }
    }
}

/// Parse `provider/model[/thinking]`.  Unknown thinking levels coerce to
/// `none`, matching the lenient config behavior.
pub fn parse_model_spec(spec: &str) -> anyhow::Result<(String, String, ThinkingLevel)> {
    let parts: Vec<&str> = spec.split('/').collect();
    match parts.as_slice() {
        [provider, model] if !provider.is_empty() && !model.is_empty() => {
            Ok((provider.to_string(), model.to_string(), ThinkingLevel::None))
        }
        [provider, model, thinking] if !provider.is_empty() && !model.is_empty() => Ok((
            provider.to_string(),
            model.to_string(),
            ThinkingLevel::parse(thinking),
        )),
        _ => anyhow::bail!("Invalid model spec '{spec}' (expected provider/model[/thinking])"),
    }
}
