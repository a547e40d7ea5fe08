// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::atomic::{AtomicU8, Ordering};

/// Per-agent lifecycle state.
///
/// Transitions happen on the main thread; worker threads only observe via
/// the atomic cell.  Killing an agent removes it from the live set rather
/// than entering a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AgentState {
    Idle = 0,
    WaitingForLlm = 1,
    Streaming = 2,
    ExecutingTool = 3,
}

impl AgentState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::WaitingForLlm,
            2 => Self::Streaming,
            3 => Self::ExecutingTool,
            _ => Self::Idle,
        }
    }

    pub fn is_busy(&self) -> bool {
        *self != Self::Idle
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::WaitingForLlm => "waiting",
            Self::Streaming => "streaming",
            Self::ExecutingTool => "tool",
        }
    }
}

/// Atomic cell holding an [`AgentState`].
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: AgentState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> AgentState {
        AgentState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: AgentState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new(AgentState::Idle)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
