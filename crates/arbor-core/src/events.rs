// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use arbor_model::StreamEvent;

/// Events delivered to the main loop from background tasks.
///
/// Provider pump tasks post stream events here; the main loop drains the
/// channel every tick and applies them to the owning agent.  Events carry
/// the stream generation so anything raced past an interrupt is dropped.
#[derive(Debug)]
pub enum UiEvent {
    Stream {
        agent_uuid: String,
        generation: u64,
        event: StreamEvent,
    },
}
