// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Agent lifecycle, navigation tree, tool loop and the cross-thread
//! handshakes that keep the terminal responsive while agents stream and
//! execute tools in the background.

pub mod agent;
pub mod coordinator;
pub mod events;
pub mod ident;
pub mod input;
pub mod internal;
pub mod scrollback;
pub mod state;
pub mod wait;

pub use agent::{Agent, Mark};
pub use coordinator::{parse_model_spec, Coordinator, NavContext};
pub use events::UiEvent;
pub use ident::generate_uuid;
pub use input::InputBuffer;
pub use scrollback::Scrollback;
pub use state::{AgentState, StateCell};
pub use wait::{WaitEntry, WaitResult};
