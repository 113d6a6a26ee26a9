// Copyright (c) 2024-2026 The varld contributors
//
// SPDX-License-Identifier: Apache-2.0
pub mod registry;
pub(crate) mod openai_compat;
mod anthropic;
mod google;
mod mock;
mod provider;
mod types;

pub use anthropic::AnthropicProvider;
pub use google::GoogleProvider;
pub use mock::{MockProvider, ScriptedMockProvider};
pub use provider::{ModelProvider, ResponseStream};
pub use registry::{get_driver, list_drivers, DriverMeta};
pub use types::*;

use anyhow::bail;
use openai_compat::{AuthStyle, OpenAICompatProvider};
use varld_config::ProviderConfig;

/// Construct a boxed [`ModelProvider`] from configuration.
///
/// Selects the driver implementation based on `cfg.provider`.  The provider
/// set is closed; an unknown id is a configuration error, not a fallback.
pub fn from_config(cfg: &ProviderConfig) -> anyhow::Result<Box<dyn ModelProvider>> {
    // key() returns a fresh Option<String> on each call so that each match arm
    // can take ownership without cross-arm borrow issues.
    let key = || resolve_api_key(cfg);

    // Helper that reads `base_url` from config or falls back to a static default.
    let base_url =
        |default: &str| -> String { cfg.base_url.clone().unwrap_or_else(|| default.into()) };

    match cfg.provider.as_str() {
        "openai" => Ok(Box::new(OpenAICompatProvider::new(
            "openai",
            cfg.model.clone(),
            key(),
            &base_url("https://api.openai.com/v1"),
            cfg.max_tokens,
            cfg.temperature,
            vec![],
            AuthStyle::Bearer,
        ))),
        "anthropic" => Ok(Box::new(AnthropicProvider::new(
            cfg.model.clone(),
            key(),
            cfg.base_url.clone(),
            cfg.max_tokens,
            cfg.temperature,
        ))),
        "google" => Ok(Box::new(GoogleProvider::new(
            cfg.model.clone(),
            key(),
            cfg.base_url.clone(),
            cfg.max_tokens,
            cfg.temperature,
        ))),

        // ── Azure OpenAI (OpenAI-compat with special URL + api-key header) ────
        "azure" => {
            let chat_url = if let Some(b) = &cfg.base_url {
                let api_ver = cfg.azure_api_version.as_deref().unwrap_or("2024-02-01");
                format!(
                    "{}/chat/completions?api-version={}",
                    b.trim_end_matches('/'),
                    api_ver
                )
            } else {
                let resource = match cfg.azure_resource.as_deref() {
                    Some(r) => r,
                    None => bail!("azure provider requires azure_resource or base_url in config"),
                };
                let deployment = cfg.azure_deployment.as_deref().unwrap_or(&cfg.model);
                let api_ver = cfg.azure_api_version.as_deref().unwrap_or("2024-02-01");
                format!(
                    "https://{resource}.openai.azure.com/openai/deployments/{deployment}/chat/completions?api-version={api_ver}"
                )
            };
            Ok(Box::new(OpenAICompatProvider::with_full_chat_url(
                "azure",
                cfg.model.clone(),
                key(),
                chat_url,
                cfg.max_tokens,
                cfg.temperature,
                vec![],
                AuthStyle::ApiKeyHeader,
            )))
        }

        "xai" => Ok(Box::new(OpenAICompatProvider::new(
            "xai",
            cfg.model.clone(),
            key(),
            &base_url("https://api.x.ai/v1"),
            cfg.max_tokens,
            cfg.temperature,
            vec![],
            AuthStyle::Bearer,
        ))),
        "openrouter" => Ok(Box::new(OpenAICompatProvider::new(
            "openrouter",
            cfg.model.clone(),
            key(),
            &base_url("https://openrouter.ai/api/v1"),
            cfg.max_tokens,
            cfg.temperature,
            vec![
                ("HTTP-Referer".into(), "https://github.com/varld/varld".into()),
                ("X-Title".into(), "varld".into()),
            ],
            AuthStyle::Bearer,
        ))),
        "ollama" => Ok(Box::new(OpenAICompatProvider::new(
            "ollama",
            cfg.model.clone(),
            key(),
            &base_url("http://localhost:11434/v1"),
            cfg.max_tokens,
            cfg.temperature,
            vec![],
            AuthStyle::None,
        ))),

        "mock" => Ok(Box::new(MockProvider)),

        other => {
            let known: Vec<&str> = registry::known_driver_ids().collect();
            bail!(
                "unknown provider '{other}'; recognised providers: {}",
                known.join(", ")
            )
        }
    }
}

/// Resolve the API key: explicit config value, then configured env var, then
/// the registry's default env var for the provider.
fn resolve_api_key(cfg: &ProviderConfig) -> Option<String> {
    if let Some(k) = &cfg.api_key {
        return Some(k.clone());
    }
    if let Some(env) = &cfg.api_key_env {
        return std::env::var(env).ok();
    }
    if let Some(meta) = registry::get_driver(&cfg.provider) {
        if let Some(env_var) = meta.default_api_key_env {
            return std::env::var(env_var).ok();
        }
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
