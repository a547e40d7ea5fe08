// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A SQLite operation failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Caller contract violation.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// The store was opened in memory and cannot hand out worker handles.
    #[error("in-memory store cannot be reopened")]
    NoPath,
}

pub type Result<T> = std::result::Result<T, StoreError>;
