// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Interactive terminal multi-agent conversation engine.
#[derive(Debug, Parser)]
#[command(name = "arbor", version, about)]
pub struct Cli {
    /// Explicit config file (merged on top of the standard search paths).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Database path.  Defaults to `.arbor/arbor.db` in the working
    /// directory.
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Resume the most recent session instead of starting a new one.
    #[arg(short, long)]
    pub resume: bool,

    /// Do not bind the keystroke-injection control socket.
    #[arg(long)]
    pub no_control_socket: bool,

    /// Verbose logging (written to $ARBOR_LOG_FILE; the TUI never logs to
    /// stderr).
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Print the merged configuration and exit.
    ShowConfig,
}
