// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Local control socket for injecting keystrokes.
//!
//! Bytes received on the Unix-domain socket are treated identically to TTY
//! input, which lets tests and automation drive the full input path without
//! a terminal.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::io::AsyncReadExt;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Listener handle; the socket file is removed on drop.
pub struct ControlSocket {
    path: PathBuf,
    pub rx: mpsc::UnboundedReceiver<u8>,
}

impl ControlSocket {
    /// Bind `<dir>/control.sock` and spawn the accept loop.  Every byte
    /// read from any client is forwarded in order.
    pub fn bind(dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join("control.sock");
        // A stale socket from a previous run would make bind fail.
        let _ = std::fs::remove_file(&path);
        let listener =
            UnixListener::bind(&path).with_context(|| format!("binding {}", path.display()))?;
        debug!(path = %path.display(), "control socket listening");

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((mut stream, _)) => {
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            let mut buf = [0u8; 256];
                            loop {
                                match stream.read(&mut buf).await {
                                    Ok(0) | Err(_) => break,
                                    Ok(n) => {
                                        for &b in &buf[..n] {
                                            if tx.send(b).is_err() {
                                                return;
                                            }
                                        }
                                    }
                                }
                            }
                        });
                    }
                    Err(e) => {
                        warn!("control socket accept failed: {e}");
                        break;
                    }
                }
            }
        });

        Ok(Self { path, rx })
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
