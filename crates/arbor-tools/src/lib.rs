// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tool declarations and JSON-in/JSON-out execution.
//!
//! Plain tools (`bash`, file I/O, `glob`, `grep`) run directly on the
//! caller's worker thread.  The agent-control tools (`fork`, `kill`,
//! `wait`) are declared here so the model sees their schemas, but their
//! handlers live with the coordinator that owns the agent tree.

pub mod builtin;
pub mod registry;
pub mod tool;

pub use registry::{InternalTool, ToolEntry, ToolRegistry, ToolSchema};
pub use tool::{wrap_failure, wrap_success, Tool, ToolOutcome};
