// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Ordered list of config file locations searched from lowest to highest priority.
/// Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. System-wide default
    paths.push(PathBuf::from("/etc/viggo/config.yaml"));
    paths.push(PathBuf::from("/etc/viggo/config.yml"));

    // 2. XDG / home
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/viggo/config.yaml"));
        paths.push(home.join(".config/viggo/config.yml"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("viggo/config.yaml"));
        paths.push(cfg.join("viggo/config.yml"));
    }

    // 3. Workspace-local
    paths.push(PathBuf::from(".viggo/config.yaml"));
    paths.push(PathBuf::from(".viggo/config.yml"));
    paths.push(PathBuf::from(".viggo.yaml"));
    paths.push(PathBuf::from(".viggo.yml"));

    paths
}

/// Load configuration by merging all discovered YAML files, then applying
/// environment overrides.  The `extra` argument may provide an explicit path.
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_yaml::Value = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        let text =
            std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
        merge_yaml(&mut merged, layer);
    }

    let mut config: Config = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty())
    {
        Config::default()
    } else {
        serde_yaml::from_value(merged).unwrap_or_default()
    };

    apply_env_overrides(&mut config, &std::env::vars().collect::<Vec<_>>());
    Ok(config)
}

/// Apply environment-variable overrides on top of the merged file config.
///
/// Env always beats file values.  The variable list is the complete set of
/// runtime knobs:
///
/// - `VIGGO_MODEL`              — model name (optionally `provider/model`)
/// - `VIGGO_BASE_URL`           — API base URL
/// - `VIGGO_API_KEY`            — explicit API key
/// - `VIGGO_CONTEXT_WINDOW`     — context window override in tokens
/// - `VIGGO_COST_LIMIT`         — session cost ceiling in USD
/// - `VIGGO_AUTONOMY`           — "1"/"true" enables autonomy mode
/// - `VIGGO_ALLOW_OUTSIDE_WORKSPACE` — "1"/"true" lets write tools leave the workspace
/// - `VIGGO_SANDBOX_BACKEND`    — force a sandbox backend
///
/// Takes the variable list as a slice so tests can drive it without mutating
/// the process environment.
pub fn apply_env_overrides(config: &mut Config, vars: &[(String, String)]) {
    let get = |key: &str| vars.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str());
    let truthy = |v: &str| matches!(v, "1" | "true" | "yes" | "on");

    if let Some(model) = get("VIGGO_MODEL") {
        // "provider/model" selects the provider too; a bare name keeps the
        // configured provider.
        if let Some((provider, name)) = model.split_once('/') {
            config.model.provider = provider.to_string();
            config.model.name = name.to_string();
        } else {
            config.model.name = model.to_string();
        }
    }
    if let Some(url) = get("VIGGO_BASE_URL") {
        config.model.base_url = Some(url.to_string());
    }
    if let Some(key) = get("VIGGO_API_KEY") {
        config.model.api_key = Some(key.to_string());
    }
    if let Some(cw) = get("VIGGO_CONTEXT_WINDOW") {
        if let Ok(n) = cw.parse::<usize>() {
            config.agent.context_window_override = Some(n);
        }
    }
    if let Some(limit) = get("VIGGO_COST_LIMIT") {
        if let Ok(v) = limit.parse::<f64>() {
            config.agent.session_cost_limit = v;
        }
    }
    if let Some(v) = get("VIGGO_AUTONOMY") {
        config.agent.autonomy = truthy(v);
    }
    if let Some(v) = get("VIGGO_ALLOW_OUTSIDE_WORKSPACE") {
        config.sandbox.allow_outside_workspace = truthy(v);
    }
    if let Some(b) = get("VIGGO_SANDBOX_BACKEND") {
        config.sandbox.backend = Some(b.to_string());
    }
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
