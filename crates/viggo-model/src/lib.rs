// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod catalog;
pub mod retry;
pub(crate) mod openai_compat;
mod google;
mod mock;
mod provider;
mod types;

pub use catalog::ModelCatalogEntry;
pub use google::GoogleProvider;
pub use mock::{MockProvider, ScriptedMockProvider};
pub use provider::{ModelProvider, ResponseStream};
pub use types::*;

use anyhow::bail;
use openai_compat::OpenAICompatProvider;
use viggo_config::ModelConfig;

/// Construct a boxed [`ModelProvider`] from configuration.
///
/// Selects the driver implementation based on `cfg.provider`.  When
/// `max_tokens` is not set in config, the model's `max_output_tokens` is
/// resolved from the static catalog; if the model is unknown a safe default
/// of 4096 is used.
pub fn from_config(cfg: &ModelConfig) -> anyhow::Result<Box<dyn ModelProvider>> {
    // key() returns a fresh Option<String> on each call so that each match
    // arm can take ownership without cross-arm borrow issues.
    let key = || resolve_api_key(cfg);
    let resolved_max_tokens = cfg
        .max_tokens
        .or_else(|| catalog::lookup(&cfg.provider, &cfg.name).map(|e| e.max_output_tokens));

    let base_url = |default: &str| -> String {
        cfg.base_url.clone().unwrap_or_else(|| default.into())
    };

    match cfg.provider.as_str() {
        "xai" => Ok(Box::new(OpenAICompatProvider::new(
            "xai",
            cfg.name.clone(),
            key(),
            &base_url("https://api.x.ai/v1"),
            resolved_max_tokens,
            cfg.temperature,
            cfg.driver_options.clone(),
        ))),
        "openai" => Ok(Box::new(OpenAICompatProvider::new(
            "openai",
            cfg.name.clone(),
            key(),
            &base_url("https://api.openai.com/v1"),
            resolved_max_tokens,
            cfg.temperature,
            cfg.driver_options.clone(),
        ))),
        "google" => Ok(Box::new(GoogleProvider::new(
            cfg.name.clone(),
            key(),
            cfg.base_url.clone(),
            resolved_max_tokens,
            cfg.temperature,
        ))),
        // Local inference servers: no key required, tools elided.
        "ollama" => Ok(Box::new(OpenAICompatProvider::new(
            "ollama",
            cfg.name.clone(),
            key(),
            &base_url("http://localhost:11434/v1"),
            resolved_max_tokens,
            cfg.temperature,
            cfg.driver_options.clone(),
        ))),
        "lmstudio" => Ok(Box::new(OpenAICompatProvider::new(
            "lmstudio",
            cfg.name.clone(),
            key(),
            &base_url("http://localhost:1234/v1"),
            resolved_max_tokens,
            cfg.temperature,
            cfg.driver_options.clone(),
        ))),
        "mock" => Ok(Box::new(MockProvider)),
        other => bail!("unknown model provider: {other}"),
    }
}

/// Canonical API-key environment variable for each provider.
fn default_api_key_env(provider: &str) -> Option<&'static str> {
    match provider {
        "xai" => Some("XAI_API_KEY"),
        "openai" => Some("OPENAI_API_KEY"),
        "google" => Some("GEMINI_API_KEY"),
        _ => None,
    }
}

/// Resolve the API key: explicit config value, then the configured env
/// variable, then the provider's canonical env variable.
fn resolve_api_key(cfg: &ModelConfig) -> Option<String> {
    if let Some(k) = &cfg.api_key {
        return Some(k.clone());
    }
    if let Some(env) = &cfg.api_key_env {
        if let Ok(v) = std::env::var(env) {
            return Some(v);
        }
    }
    default_api_key_env(&cfg.provider).and_then(|env| std::env::var(env).ok())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
