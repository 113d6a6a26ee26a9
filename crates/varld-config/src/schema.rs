// Copyright (c) 2024-2026 The varld contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    /// Default provider used for world-level chat operations (auto-naming,
    /// summaries) and as the fallback when an agent names no provider.
    #[serde(default)]
    pub chat: ProviderConfig,
    #[serde(default)]
    pub world: WorldDefaults,
    #[serde(default)]
    pub tools: ToolsConfig,
    /// Named provider configurations.
    ///
    /// Define custom endpoints, local models, or additional accounts here and
    /// reference them by name in an agent's `provider` field.
    ///
    /// ```yaml
    /// providers:
    ///   local_ollama:
    ///     provider: ollama
    ///     model: llama3.2
    ///   work_anthropic:
    ///     provider: anthropic
    ///     api_key_env: WORK_ANTHROPIC_KEY
    ///     model: claude-sonnet-4-5
    /// ```
    #[serde(default)]
    pub providers: std::collections::HashMap<String, ProviderConfig>,
}

// ─── Storage ─────────────────────────────────────────────────────────────────

/// Which storage back-end persists worlds, agents, and chats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// JSON files under `storage.data_path` (the default).
    #[default]
    File,
    /// Volatile in-process storage; used by the test harness.
    Memory,
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageBackend::File => write!(f, "file"),
            StorageBackend::Memory => write!(f, "memory"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Root directory of the world tree.  Overridden at load time by the
    /// `AGENT_WORLD_DATA_PATH` environment variable.
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,
}

fn default_data_path() -> PathBuf {
    PathBuf::from("./data/worlds")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::File,
            data_path: default_data_path(),
        }
    }
}

// ─── World defaults ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldDefaults {
    /// Maximum consecutive agent turns before a world idles until the next
    /// human message.  Copied into each new world's config; worlds may
    /// override it individually.
    #[serde(default = "default_turn_limit")]
    pub turn_limit: u32,
    /// How many recent memory entries an agent includes in its prompt.
    #[serde(default = "default_memory_window")]
    pub memory_window: usize,
}

fn default_turn_limit() -> u32 {
    5
}
fn default_memory_window() -> usize {
    10
}

impl Default for WorldDefaults {
    fn default() -> Self {
        Self {
            turn_limit: default_turn_limit(),
            memory_window: default_memory_window(),
        }
    }
}

// ─── Providers ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider identifier: "openai" | "anthropic" | "azure" | "ollama" |
    /// "google" | "xai" | "openrouter" | "mock"
    pub provider: String,
    /// Model name forwarded to the provider API
    pub model: String,
    /// Environment variable that holds the API key (read at runtime)
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files
    pub api_key: Option<String>,
    /// Base URL override.  Useful for local proxies or gateways.
    /// For most hosted providers the correct default is auto-selected.
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0)
    pub temperature: Option<f32>,

    // ── Azure OpenAI ─────────────────────────────────────────────────────────
    /// Azure resource name (the subdomain of `.openai.azure.com`).
    /// Required when provider = "azure" and base_url is not set.
    pub azure_resource: Option<String>,
    /// Azure deployment name.  Defaults to `model` when not set.
    pub azure_deployment: Option<String>,
    /// Azure REST API version string, e.g. `"2024-02-01"`.
    pub azure_api_version: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            model: "gpt-4o".into(),
            // api_key_env is intentionally None here.  Key resolution falls
            // through to the driver registry, which knows the canonical
            // env-var name for each provider (OPENAI_API_KEY,
            // ANTHROPIC_API_KEY, etc.).  Hard-coding it here would shadow the
            // registry lookup whenever the provider is overridden per agent.
            api_key_env: None,
            api_key: None,
            base_url: None,
            max_tokens: Some(4096),
            temperature: Some(0.2),
            azure_resource: None,
            azure_deployment: None,
            azure_api_version: None,
        }
    }
}

impl ProviderConfig {
    /// Derive an agent-specific config from this one: provider/model swapped
    /// in, sampling knobs overridden where the agent sets them.
    pub fn for_agent(
        &self,
        provider: &str,
        model: &str,
        temperature: Option<f32>,
        max_tokens: Option<u32>,
    ) -> ProviderConfig {
        let mut cfg = self.clone();
        if cfg.provider != provider {
            // Endpoint and key overrides belong to the original provider;
            // do not leak them across a provider switch.
            cfg = ProviderConfig {
                provider: provider.to_string(),
                model: model.to_string(),
                ..ProviderConfig::default()
            };
        }
        cfg.provider = provider.to_string();
        cfg.model = model.to_string();
        if temperature.is_some() {
            cfg.temperature = temperature;
        }
        if max_tokens.is_some() {
            cfg.max_tokens = max_tokens;
        }
        cfg
    }
}

// ─── Tools ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Timeout in seconds for a single tool call
    #[serde(default = "default_tool_timeout")]
    pub timeout_secs: u64,
    /// Default working directory for shell-style tools.  `None` means the
    /// process working directory.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

fn default_tool_timeout() -> u64 {
    30
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_tool_timeout(),
            working_dir: None,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
