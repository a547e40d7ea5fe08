// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::filter::EnvFilter;

use arbor_core::Coordinator;
use arbor_store::Store;
use arbor_tui::{control::ControlSocket, history::History, App};
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = arbor_config::load(cli.config.as_deref())?;

    if let Some(Commands::ShowConfig) = &cli.command {
        println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
        return Ok(());
    }

    let state_dir = PathBuf::from(".arbor");
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("creating {}", state_dir.display()))?;

    let db_path = cli.db.clone().unwrap_or_else(|| state_dir.join("arbor.db"));
    let store = Store::open(&db_path)
        .with_context(|| format!("opening store at {}", db_path.display()))?;

    let (ui_tx, ui_rx) = mpsc::unbounded_channel();
    let coordinator = if cli.resume {
        Coordinator::resume(config.clone(), store, ui_tx)?
    } else {
        Coordinator::new(config.clone(), store, ui_tx)?
    };

    let history = History::load(&state_dir, config.history.capacity);
    let control = if cli.no_control_socket {
        None
    } else {
        match ControlSocket::bind(&state_dir) {
            Ok(socket) => Some(socket),
            Err(e) => {
                tracing::warn!("control socket unavailable: {e}");
                None
            }
        }
    };

    App::new(coordinator, ui_rx, history, control).run().await
}

/// Logging goes to `$ARBOR_LOG_FILE` when set; otherwise it is suppressed
/// entirely, since stderr writes would corrupt the full-screen display.
fn init_logging(verbose: bool) {
    let Ok(path) = std::env::var("ARBOR_LOG_FILE") else { return };
    let Ok(file) = std::fs::OpenOptions::new().create(true).append(true).open(&path) else {
        return;
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Arc::new(file))
        .with_ansi(false)
        .init();
}
