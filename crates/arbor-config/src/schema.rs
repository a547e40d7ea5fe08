// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper that returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `false`, so fields
/// that should be enabled unless explicitly disabled need a named function.
fn default_true() -> bool {
    true
}

fn default_history_capacity() -> usize {
    1000
}

fn default_bash_output_limit() -> usize {
    20_000
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_completion_tokens() -> u32 {
    8192
}

fn default_provider() -> String {
    "openai".into()
}

fn default_model() -> String {
    "gpt-5".into()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentDefaults,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    /// Named provider configurations keyed by provider id
    /// ("openai" | "anthropic" | "google").
    #[serde(default)]
    pub providers: std::collections::HashMap<String, ProviderConfig>,
}

/// Defaults applied to every newly created agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefaults {
    /// Provider id used for the root agent and for forks without an
    /// explicit override.  Overridable via `ARBOR_DEFAULT_PROVIDER`.
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Model name forwarded to the provider API.
    #[serde(default = "default_model")]
    pub model: String,
    /// Thinking level: "none" | "low" | "medium" | "high".
    /// Unknown values are treated as "none".
    #[serde(default)]
    pub thinking: String,
    /// Maximum tool-loop iterations per user submit.
    /// `None` means unlimited; zero or negative disables the loop.
    #[serde(default)]
    pub max_tool_turns: Option<i64>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_completion_tokens")]
    pub max_completion_tokens: u32,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            model: "gpt-5".into(),
            thinking: "none".into(),
            max_tool_turns: Some(25),
            temperature: default_temperature(),
            max_completion_tokens: default_max_completion_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Environment variable that holds the API key (read at request time).
    pub api_key_env: Option<String>,
    /// Base URL override.  Useful for local proxies.
    pub base_url: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self { api_key_env: None, base_url: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Whether built-in filesystem/shell tools are offered to the model.
    #[serde(default = "default_true")]
    pub builtins_enabled: bool,
    /// Byte ceiling for combined stdout + stderr captured from `bash`.
    #[serde(default = "default_bash_output_limit")]
    pub bash_output_limit: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            builtins_enabled: true,
            bash_output_limit: default_bash_output_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Maximum entries kept in the command-history file; older entries are
    /// dropped on load.
    #[serde(default = "default_history_capacity")]
    pub capacity: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { capacity: default_history_capacity() }
    }
}

impl Config {
    /// Resolve the API key environment variable name for a provider.
    ///
    /// Config may override per provider; otherwise the conventional
    /// `OPENAI_API_KEY` / `ANTHROPIC_API_KEY` / `GOOGLE_API_KEY` is used.
    pub fn api_key_env(&self, provider: &str) -> String {
        if let Some(p) = self.providers.get(provider) {
            if let Some(env) = &p.api_key_env {
                return env.clone();
            }
        }
        match provider {
            "openai" => "OPENAI_API_KEY".into(),
            "anthropic" => "ANTHROPIC_API_KEY".into(),
            "google" => "GOOGLE_API_KEY".into(),
            other => format!("{}_API_KEY", other.to_uppercase()),
        }
    }

    /// Base URL override for a provider, if configured.
    pub fn base_url(&self, provider: &str) -> Option<String> {
        self.providers.get(provider).and_then(|p| p.base_url.clone())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
