// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

/// Generate a 22-character URL-safe base64 agent id.
///
/// 16 random bytes encode to exactly 22 characters without padding.
pub fn generate_uuid() -> String {
    let bytes = uuid::Uuid::new_v4();
    URL_SAFE_NO_PAD.encode(bytes.as_bytes())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
