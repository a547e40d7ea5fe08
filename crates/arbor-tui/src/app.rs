// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Top-level application state and event loop.
//!
//! One `select!` multiplexes terminal input, provider stream events, the
//! control socket and a 100 ms tick.  The tick drives the spinner and the
//! coordinator's worker-completion scheduling; everything that touches an
//! agent's scrollback, input buffer or message array runs here, on the main
//! task.

use std::time::Duration;

use anyhow::Result;
use crossterm::event::{Event, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use futures::StreamExt;
use ratatui::layout::{Constraint, Layout};
use ratatui::style::{Color, Style};
use ratatui::text::Line;
use ratatui::widgets::Paragraph;
use ratatui::{DefaultTerminal, Frame};
use tokio::sync::mpsc;
use tracing::warn;

use arbor_core::{Coordinator, UiEvent};

use crate::commands::{self, parse_fork_args, ParsedLine};
use crate::control::ControlSocket;
use crate::history::History;

const SPINNER: [char; 4] = ['|', '/', '-', '\\'];
const SCROLL_PAGE: usize = 10;

/// One resolved iteration of the main multiplex.
enum LoopEvent {
    Term(Event),
    Ui(UiEvent),
    Control(u8),
    Tick,
    Nothing,
    Shutdown,
}

pub struct App {
    coordinator: Coordinator,
    ui_rx: mpsc::UnboundedReceiver<UiEvent>,
    history: History,
    control: Option<ControlSocket>,
    history_cursor: Option<usize>,
    spinner_frame: usize,
}

impl App {
    pub fn new(
        coordinator: Coordinator,
        ui_rx: mpsc::UnboundedReceiver<UiEvent>,
        history: History,
        control: Option<ControlSocket>,
    ) -> Self {
        Self {
            coordinator,
            ui_rx,
            history,
            control,
            history_cursor: None,
            spinner_frame: 0,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut terminal = ratatui::init();
        let result = self.event_loop(&mut terminal).await;
        ratatui::restore();
        result
    }

    async fn event_loop(&mut self, terminal: &mut DefaultTerminal) -> Result<()> {
        let mut term_events = EventStream::new();
        let mut tick = tokio::time::interval(Duration::from_millis(100));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            terminal.draw(|frame| draw(frame, &self.coordinator, self.spinner_frame))?;

            // Resolve the multiplex into a value first; the handlers below
            // need exclusive access to the app state.
            let loop_event = tokio::select! {
                maybe_event = term_events.next() => match maybe_event {
                    Some(Ok(event)) => LoopEvent::Term(event),
                    Some(Err(e)) => {
                        warn!("terminal event error: {e}");
                        LoopEvent::Nothing
                    }
                    None => LoopEvent::Shutdown,
                },
                Some(ui_event) = self.ui_rx.recv() => LoopEvent::Ui(ui_event),
                Some(byte) = recv_control(&mut self.control) => LoopEvent::Control(byte),
                _ = tick.tick() => LoopEvent::Tick,
            };

            match loop_event {
                LoopEvent::Term(event) => self.handle_term_event(event).await,
                LoopEvent::Ui(ui_event) => {
                    self.coordinator.handle_ui_event(ui_event);
                    // Drain whatever else arrived this tick so streaming
                    // text renders in batches, not one delta per frame.
                    while let Ok(event) = self.ui_rx.try_recv() {
                        self.coordinator.handle_ui_event(event);
                    }
                }
                LoopEvent::Control(byte) => self.handle_control_byte(byte).await,
                LoopEvent::Tick => {
                    self.spinner_frame = self.spinner_frame.wrapping_add(1);
                    self.coordinator.tick();
                }
                LoopEvent::Nothing => {}
                LoopEvent::Shutdown => break,
            }

            if self.coordinator.quit {
                break;
            }
        }
        Ok(())
    }

    async fn handle_term_event(&mut self, event: Event) {
        match event {
            Event::Key(key) if key.kind != KeyEventKind::Release => {
                self.handle_key(key).await;
            }
            // Resize is handled implicitly: the next draw lays out against
            // the new terminal size.
            _ => {}
        }
    }

    async fn handle_key(&mut self, key: KeyEvent) {
        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
        let alt = key.modifiers.contains(KeyModifiers::ALT);

        // Agent-tree navigation on Alt+arrows.
        if alt {
            match key.code {
                KeyCode::Up => self.coordinator.nav_prev_sibling(),
                KeyCode::Down => self.coordinator.nav_next_sibling(),
                KeyCode::Left => self.coordinator.nav_parent(),
                KeyCode::Right => self.coordinator.nav_child(),
                _ => {}
            }
            return;
        }

        match key.code {
            KeyCode::Char('c') if ctrl => {
                let busy = self
                    .coordinator
                    .current()
                    .map(|a| a.state.get().is_busy())
                    .unwrap_or(false);
                if busy {
                    self.coordinator.interrupt_current();
                } else {
                    self.coordinator.quit = true;
                }
            }
            KeyCode::Char('d') if ctrl => {
                let empty = self
                    .coordinator
                    .current()
                    .map(|a| a.input.is_empty())
                    .unwrap_or(true);
                if empty {
                    self.coordinator.quit = true;
                }
            }
            KeyCode::Char('u') if ctrl => {
                if let Some(agent) = self.coordinator.current_mut() {
                    agent.input.clear();
                }
            }
            KeyCode::Char('k') if ctrl => {
                if let Some(agent) = self.coordinator.current_mut() {
                    agent.input.kill_to_end();
                }
            }
            KeyCode::Enter => self.submit_line().await,
            KeyCode::Up => self.history_prev(),
            KeyCode::Down => self.history_next(),
            KeyCode::PageUp => {
                if let Some(agent) = self.coordinator.current_mut() {
                    agent.viewport_offset = agent.viewport_offset.saturating_add(SCROLL_PAGE);
                }
            }
            KeyCode::PageDown => {
                if let Some(agent) = self.coordinator.current_mut() {
                    agent.viewport_offset = agent.viewport_offset.saturating_sub(SCROLL_PAGE);
                }
            }
            KeyCode::Left => {
                if let Some(agent) = self.coordinator.current_mut() {
                    agent.input.move_left();
                }
            }
            KeyCode::Right => {
                if let Some(agent) = self.coordinator.current_mut() {
                    agent.input.move_right();
                }
            }
            KeyCode::Home => {
                if let Some(agent) = self.coordinator.current_mut() {
                    agent.input.move_home();
                }
            }
            KeyCode::End => {
                if let Some(agent) = self.coordinator.current_mut() {
                    agent.input.move_end();
                }
            }
            KeyCode::Backspace => {
                if let Some(agent) = self.coordinator.current_mut() {
                    agent.input.backspace();
                }
            }
            KeyCode::Delete => {
                if let Some(agent) = self.coordinator.current_mut() {
                    agent.input.delete();
                }
            }
            KeyCode::Char(c) => {
                self.history_cursor = None;
                if let Some(agent) = self.coordinator.current_mut() {
                    agent.input.insert(c);
                }
            }
            _ => {}
        }
    }

    /// Control-socket bytes follow the same paths as TTY input.
    async fn handle_control_byte(&mut self, byte: u8) {
        match byte {
            b'\n' | b'\r' => self.submit_line().await,
            0x03 => {
                let busy = self
                    .coordinator
                    .current()
                    .map(|a| a.state.get().is_busy())
                    .unwrap_or(false);
                if busy {
                    self.coordinator.interrupt_current();
                } else {
                    self.coordinator.quit = true;
                }
            }
            0x7f | 0x08 => {
                if let Some(agent) = self.coordinator.current_mut() {
                    agent.input.backspace();
                }
            }
            b if (0x20..0x7f).contains(&b) => {
                if let Some(agent) = self.coordinator.current_mut() {
                    agent.input.insert(b as char);
                }
            }
            _ => {}
        }
    }

    async fn submit_line(&mut self) {
        let Some(agent) = self.coordinator.current_mut() else { return };
        let line = agent.input.take();
        self.history_cursor = None;
        if line.trim().is_empty() {
            return;
        }
        if let Err(e) = self.history.append(&line) {
            warn!("failed to persist history: {e}");
        }
        match commands::parse(&line) {
            ParsedLine::Empty => {}
            ParsedLine::Text(text) => self.coordinator.submit(&text),
            ParsedLine::Command { name, args } => self.dispatch(&name, args).await,
        }
    }

    async fn dispatch(&mut self, name: &str, args: Vec<String>) {
        match name {
            "fork" => match parse_fork_args(&args) {
                Ok(fork) => {
                    self.coordinator
                        .cmd_fork(fork.model_spec.as_deref(), fork.prompt.as_deref())
                        .await;
                }
                Err(e) => self.command_error(&e),
            },
            "kill" => match args.first() {
                Some(prefix) => self.coordinator.cmd_kill(prefix),
                None => self.command_error("Usage: /kill UUID-PREFIX"),
            },
            "wait" => {
                let Some(timeout) = args.first().and_then(|t| t.parse::<i64>().ok()) else {
                    self.command_error("Usage: /wait TIMEOUT [UUID1 UUID2 ...]");
                    return;
                };
                if timeout < 0 {
                    self.command_error("Invalid timeout value");
                    return;
                }
                self.coordinator.cmd_wait(timeout, args[1..].to_vec());
            }
            "mark" => self.coordinator.cmd_mark(args.first().map(String::as_str)),
            "rewind" => self.coordinator.cmd_rewind(args.first().map(String::as_str)),
            "clear" => self.coordinator.cmd_clear(),
            "model" => match args.first() {
                Some(spec) => self.coordinator.cmd_model(spec),
                None => self.command_error("Usage: /model PROVIDER/MODEL[/THINKING]"),
            },
            "debug" => match args.first().map(String::as_str) {
                Some("on") => self.coordinator.cmd_debug(true),
                Some("off") => self.coordinator.cmd_debug(false),
                _ => self.command_error("Usage: /debug on|off"),
            },
            "agents" => self.coordinator.cmd_agents(),
            "help" => self.show_help(),
            "quit" | "exit" => self.coordinator.quit = true,
            other => self.command_error(&format!("Unknown command: /{other}")),
        }
    }

    fn command_error(&mut self, message: &str) {
        if let Some(agent) = self.coordinator.current_mut() {
            agent.scrollback.append_error(message);
        }
    }

    fn show_help(&mut self) {
        let lines = [
            "/fork [--model PROVIDER/MODEL[/THINKING]] [prompt...]  fork current agent",
            "/kill UUID-PREFIX                                      kill an agent",
            "/wait TIMEOUT [UUID...]                                wait for mail",
            "/mark [label]    /rewind [label]                       checkpoint / rewind",
            "/clear           /model SPEC       /agents             housekeeping",
            "/debug on|off    /quit                                 diagnostics / exit",
        ];
        if let Some(agent) = self.coordinator.current_mut() {
            for line in lines {
                agent.scrollback.append_line(line);
            }
        }
    }

    // ── History navigation ────────────────────────────────────────────────────

    fn history_prev(&mut self) {
        let len = self.history.entries().len();
        if len == 0 {
            return;
        }
        let next = match self.history_cursor {
            None => len - 1,
            Some(0) => 0,
            Some(i) => i - 1,
        };
        self.history_cursor = Some(next);
        let cmd = self.history.entries()[next].cmd.clone();
        if let Some(agent) = self.coordinator.current_mut() {
            agent.input.clear();
            agent.input.insert_str(&cmd);
        }
    }

    fn history_next(&mut self) {
        let len = self.history.entries().len();
        let Some(cursor) = self.history_cursor else { return };
        if cursor + 1 >= len {
            self.history_cursor = None;
            if let Some(agent) = self.coordinator.current_mut() {
                agent.input.clear();
            }
            return;
        }
        self.history_cursor = Some(cursor + 1);
        let cmd = self.history.entries()[cursor + 1].cmd.clone();
        if let Some(agent) = self.coordinator.current_mut() {
            agent.input.clear();
            agent.input.insert_str(&cmd);
        }
    }
}

async fn recv_control(control: &mut Option<ControlSocket>) -> Option<u8> {
    match control {
        Some(socket) => socket.rx.recv().await,
        None => std::future::pending().await,
    }
}

// ─── Drawing ─────────────────────────────────────────────────────────────────

fn draw(frame: &mut Frame, coordinator: &Coordinator, spinner_frame: usize) {
    let [scroll_area, sep_area, input_area] = Layout::vertical([
        Constraint::Min(1),
        Constraint::Length(1),
        Constraint::Length(1),
    ])
    .areas(frame.area());

    let Some(agent) = coordinator.current() else { return };

    // Scrollback: bottom-anchored; offset 0 shows the newest lines.  The
    // separator and input rows are fixed layout rows, so they stay visible
    // regardless of document height.
    let mut lines: Vec<&str> = agent.scrollback.lines().iter().map(String::as_str).collect();
    let stream_buffer = agent.scrollback.stream_buffer();
    if !stream_buffer.is_empty() {
        lines.push(stream_buffer);
    }
    let (start, end) = visible_range(lines.len(), scroll_area.height as usize, agent.viewport_offset);
    let text: Vec<Line> = lines[start..end].iter().map(|l| Line::raw(*l)).collect();
    frame.render_widget(Paragraph::new(text), scroll_area);

    // Separator with navigation indicators.
    let state = agent.state.get();
    let spinner = if state.is_busy() {
        SPINNER[spinner_frame % SPINNER.len()]
    } else {
        '─'
    };
    let nav = &coordinator.nav;
    let short = &agent.uuid[..agent.uuid.len().min(8)];
    let name = agent.name.as_deref().unwrap_or("");
    let mut separator = format!("─{spinner}─ {short} {name} [{}]", state.label());
    if nav.parent_uuid.is_some() {
        separator.push_str(" ^parent");
    }
    if nav.prev_sibling.is_some() {
        separator.push_str(" <prev");
    }
    if nav.next_sibling.is_some() {
        separator.push_str(" next>");
    }
    if nav.child_count > 0 {
        separator.push_str(&format!(" children:{}", nav.child_count));
    }
    separator.push(' ');
    while separator.chars().count() < sep_area.width as usize {
        separator.push('─');
    }
    frame.render_widget(
        Paragraph::new(separator).style(Style::default().fg(Color::DarkGray)),
        sep_area,
    );

    // Input line with hardware cursor at the edit position.
    let input_text = format!("> {}", agent.input.text());
    frame.render_widget(Paragraph::new(input_text), input_area);
    frame.set_cursor_position((
        input_area.x + 2 + agent.input.cursor() as u16,
        input_area.y,
    ));
}

/// Bottom-anchored window: `offset` counts lines scrolled up from the end.
fn visible_range(total: usize, rows: usize, offset: usize) -> (usize, usize) {
    let offset = offset.min(total.saturating_sub(rows));
    let end = total - offset;
    let start = end.saturating_sub(rows);
    (start, end)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
