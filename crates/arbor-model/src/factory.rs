// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use anyhow::bail;

use crate::{
    anthropic::AnthropicProvider, google::GoogleProvider, openai::OpenAiProvider, Provider,
};

/// Instantiate a provider by id.
///
/// The API key is read lazily from `api_key_env` at construction; a missing
/// key only fails at request time so offline navigation keeps working.
pub fn provider_for(
    provider: &str,
    api_key_env: &str,
    base_url: Option<String>,
) -> anyhow::Result<Arc<dyn Provider>> {
    let api_key = std::env::var(api_key_env).ok().filter(|k| !k.is_empty());
    match provider {
        "openai" => Ok(Arc::new(OpenAiProvider::new(api_key, base_url))),
        "anthropic" => Ok(Arc::new(AnthropicProvider::new(api_key, base_url))),
        "google" => Ok(Arc::new(GoogleProvider::new(api_key, base_url))),
        other => bail!("unknown provider: {other}"),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_providers_resolve() {
        for name in ["openai", "anthropic", "google"] {
            let p = provider_for(name, "ARBOR_TEST_UNSET_KEY", None).unwrap();
            assert_eq!(p.name(), name);
        }
    }

    #[test]
    fn unknown_provider_is_an_error() {
        assert!(provider_for("cohere", "X", None).is_err());
    }
}
