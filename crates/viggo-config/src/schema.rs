// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    /// Named provider configurations.
    ///
    /// Define custom endpoints or additional accounts here and reference
    /// them by name:
    ///
    /// ```yaml
    /// providers:
    ///   my_ollama:
    ///     provider: openai        # uses the OpenAI-compatible wire format
    ///     base_url: http://localhost:11434/v1
    ///     name: llama3.2
    /// ```
    #[serde(default)]
    pub providers: std::collections::HashMap<String, ModelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier: "openai" | "xai" | "google" | "ollama" |
    /// "lmstudio" | "mock"
    pub provider: String,
    /// Model name forwarded to the provider API
    pub name: String,
    /// Environment variable that holds the API key (read at runtime)
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files
    pub api_key: Option<String>,
    /// Base URL override.  Useful for local proxies and local servers.
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0)
    pub temperature: Option<f32>,
    /// Free-form provider-specific options forwarded as-is to the driver.
    #[serde(default)]
    pub driver_options: serde_json::Value,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "xai".into(),
            name: "grok-3".into(),
            // api_key_env stays None so key resolution falls through to the
            // driver's canonical env-var name (XAI_API_KEY, GEMINI_API_KEY…).
            api_key_env: None,
            api_key: None,
            base_url: None,
            max_tokens: Some(4096),
            temperature: Some(0.2),
            driver_options: serde_json::Value::Null,
        }
    }
}

fn default_max_tool_rounds() -> u32 {
    30
}
fn default_max_history() -> usize {
    50
}
fn default_session_cost_limit() -> f64 {
    10.0
}
fn default_autonomy_ceiling() -> f64 {
    100.0
}
fn default_tool_result_char_cap() -> usize {
    20_000
}
fn default_tool_result_compact_threshold() -> usize {
    70_000
}
fn default_compaction_ratio() -> f32 {
    0.3
}
fn default_recent_keep_count() -> usize {
    6
}
fn default_response_reserve_tokens() -> usize {
    4096
}
fn default_selector_max_tools() -> usize {
    15
}
fn default_selector_confidence_floor() -> f32 {
    0.35
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum number of autonomous tool-call rounds per turn.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
    /// Maximum non-system messages retained in history after a turn.
    /// Oldest messages beyond this bound are dropped.
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    /// Session cost ceiling in USD.  Checked before and after each tool
    /// round; a session that reaches the ceiling stops issuing provider
    /// calls.
    #[serde(default = "default_session_cost_limit")]
    pub session_cost_limit: f64,
    /// Ceiling used instead of `session_cost_limit` when `autonomy` is on.
    /// Large but never infinite.
    #[serde(default = "default_autonomy_ceiling")]
    pub autonomy_ceiling: f64,
    /// Autonomy mode: raises the cost ceiling to `autonomy_ceiling`.
    #[serde(default)]
    pub autonomy: bool,
    /// Character cap for a single tool result entering the session.
    /// Larger results are head/tail-truncated; the full payload is
    /// persisted to the durable result store.
    #[serde(default = "default_tool_result_char_cap")]
    pub tool_result_char_cap: usize,
    /// Cumulative character threshold above which the oldest tool results
    /// in context are replaced by restore stubs before the next provider
    /// call.
    #[serde(default = "default_tool_result_compact_threshold")]
    pub tool_result_compact_threshold: usize,
    /// Target size of a folded summary relative to the original span.
    #[serde(default = "default_compaction_ratio")]
    pub compaction_ratio: f32,
    /// Number of recent non-system messages preserved verbatim when the
    /// context manager folds the middle of the history.
    #[serde(default = "default_recent_keep_count")]
    pub recent_keep_count: usize,
    /// Tokens reserved for the model response when fitting the window.
    #[serde(default = "default_response_reserve_tokens")]
    pub response_reserve_tokens: usize,
    /// Context window override; takes precedence over the catalog value.
    #[serde(default)]
    pub context_window_override: Option<usize>,
    /// Maximum number of tool descriptors exposed per turn.
    #[serde(default = "default_selector_max_tools")]
    pub selector_max_tools: usize,
    /// Selector confidence below which a discovery hint is injected.
    #[serde(default = "default_selector_confidence_floor")]
    pub selector_confidence_floor: f32,
    /// System prompt override; leave None to use the built-in prompt.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: default_max_tool_rounds(),
            max_history: default_max_history(),
            session_cost_limit: default_session_cost_limit(),
            autonomy_ceiling: default_autonomy_ceiling(),
            autonomy: false,
            tool_result_char_cap: default_tool_result_char_cap(),
            tool_result_compact_threshold: default_tool_result_compact_threshold(),
            compaction_ratio: default_compaction_ratio(),
            recent_keep_count: default_recent_keep_count(),
            response_reserve_tokens: default_response_reserve_tokens(),
            context_window_override: None,
            selector_max_tools: default_selector_max_tools(),
            selector_confidence_floor: default_selector_confidence_floor(),
            system_prompt: None,
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    120
}
fn default_max_parallel_readonly() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Timeout in seconds for a single tool call, enforced by the lane queue.
    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,
    /// Maximum read-only tool calls running concurrently within one lane.
    #[serde(default = "default_max_parallel_readonly")]
    pub max_parallel_readonly: usize,
    /// Automatically approve shell commands matching these glob patterns
    pub auto_approve_patterns: Vec<String>,
    /// Block shell commands matching these glob patterns
    pub deny_patterns: Vec<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_tool_timeout_secs(),
            max_parallel_readonly: default_max_parallel_readonly(),
            auto_approve_patterns: vec![
                "cat *".into(),
                "ls *".into(),
                "find *".into(),
                "rg *".into(),
                "grep *".into(),
            ],
            deny_patterns: vec!["rm -rf /*".into(), "dd if=*".into()],
        }
    }
}

/// Resource limits applied to sandboxed subprocesses.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceLimits {
    /// Maximum resident memory in bytes (0 = unlimited).
    #[serde(default)]
    pub max_memory: u64,
    /// Maximum CPU seconds (0 = unlimited).
    #[serde(default)]
    pub max_cpu_time: u64,
    /// Maximum number of processes/threads (0 = unlimited).
    #[serde(default)]
    pub max_processes: u64,
    /// Maximum size of any created file in bytes (0 = unlimited).
    #[serde(default)]
    pub max_file_size: u64,
}

fn default_sandbox_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Paths mounted/allowed read-only inside the sandbox.
    #[serde(default)]
    pub read_only_paths: Vec<PathBuf>,
    /// Paths mounted/allowed read-write inside the sandbox.
    #[serde(default)]
    pub read_write_paths: Vec<PathBuf>,
    /// Working directory for the subprocess; implicitly read-write.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    /// When false the subprocess network namespace is isolated (or the
    /// platform equivalent applied).
    #[serde(default)]
    pub allow_network: bool,
    /// When false, fork/exec is denied by the security policy.
    #[serde(default = "crate::schema::default_true")]
    pub allow_subprocess: bool,
    /// Outbound domain allowlist, consulted by higher-level tool code when
    /// network access is on.  Not enforced by kernel filters.
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    /// Command binary names that bypass the sandbox entirely.
    #[serde(default)]
    pub excluded_commands: Vec<String>,
    /// Fall back to unsandboxed execution when no backend is available.
    #[serde(default = "crate::schema::default_true")]
    pub allow_unsandboxed: bool,
    /// Force a specific backend: "landlock" | "bubblewrap" | "seatbelt" |
    /// "container" | "none".  Empty = auto-detect.
    #[serde(default)]
    pub backend: Option<String>,
    /// Allow file-writing tools to resolve paths outside the workspace.
    #[serde(default)]
    pub allow_outside_workspace: bool,
    /// Inner execution timeout in seconds, enforced by the sandbox itself
    /// (the lane queue enforces the outer 120 s default).
    #[serde(default = "default_sandbox_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub limits: ResourceLimits,
}

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `false`, so fields
/// that should be on unless explicitly disabled need a named function.
pub(crate) fn default_true() -> bool {
    true
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            read_only_paths: Vec::new(),
            read_write_paths: Vec::new(),
            work_dir: None,
            allow_network: false,
            allow_subprocess: true,
            allowed_domains: Vec::new(),
            excluded_commands: Vec::new(),
            allow_unsandboxed: true,
            backend: None,
            allow_outside_workspace: false,
            timeout_secs: default_sandbox_timeout_secs(),
            limits: ResourceLimits::default(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Defaults ─────────────────────────────────────────────────────────────

    #[test]
    fn config_default_provider_is_xai() {
        let c = Config::default();
        assert_eq!(c.model.provider, "xai");
        assert_eq!(c.model.name, "grok-3");
    }

    #[test]
    fn config_default_api_key_env_is_none() {
        // Must stay None so key resolution falls through to the driver's
        // canonical env-var name.
        let c = Config::default();
        assert!(c.model.api_key_env.is_none());
        assert!(c.model.api_key.is_none());
    }

    #[test]
    fn config_default_max_tool_rounds_positive() {
        let c = Config::default();
        assert!(c.agent.max_tool_rounds > 0);
    }

    #[test]
    fn config_default_cost_limit_below_autonomy_ceiling() {
        let c = Config::default();
        assert!(c.agent.session_cost_limit < c.agent.autonomy_ceiling);
        assert!(!c.agent.autonomy);
    }

    #[test]
    fn config_default_tool_caps() {
        let c = Config::default();
        assert_eq!(c.agent.tool_result_char_cap, 20_000);
        assert_eq!(c.agent.tool_result_compact_threshold, 70_000);
    }

    #[test]
    fn config_default_lane_settings() {
        let c = Config::default();
        assert_eq!(c.tools.timeout_secs, 120);
        assert_eq!(c.tools.max_parallel_readonly, 4);
    }

    #[test]
    fn sandbox_defaults_deny_network_allow_fork() {
        let s = SandboxConfig::default();
        assert!(!s.allow_network);
        assert!(s.allow_subprocess);
        assert!(s.allow_unsandboxed);
        assert_eq!(s.timeout_secs, 60);
    }

    #[test]
    fn config_default_tools_has_deny_patterns() {
        let c = Config::default();
        assert!(!c.tools.deny_patterns.is_empty());
    }

    // ── YAML round-trip ───────────────────────────────────────────────────────

    #[test]
    fn config_deserialises_from_yaml() {
        let yaml = "model:\n  provider: google\n  name: gemini-2.0-flash\n  max_tokens: 8192\n";
        let c: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(c.model.provider, "google");
        assert_eq!(c.model.name, "gemini-2.0-flash");
        assert_eq!(c.model.max_tokens, Some(8192));
    }

    #[test]
    fn config_partial_yaml_fills_in_defaults() {
        let yaml = "agent:\n  max_tool_rounds: 5\n";
        let c: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(c.agent.max_tool_rounds, 5);
        assert_eq!(c.agent.max_history, AgentConfig::default().max_history);
        assert_eq!(c.model.provider, "xai");
    }

    #[test]
    fn sandbox_yaml_round_trip() {
        let yaml = "sandbox:\n  allow_network: true\n  read_only_paths: [/usr, /etc]\n  \
                    excluded_commands: [git]\n  limits:\n    max_memory: 1048576\n";
        let c: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(c.sandbox.allow_network);
        assert_eq!(c.sandbox.read_only_paths.len(), 2);
        assert_eq!(c.sandbox.excluded_commands, vec!["git".to_string()]);
        assert_eq!(c.sandbox.limits.max_memory, 1_048_576);
        let back = serde_yaml::to_string(&c).unwrap();
        let again: Config = serde_yaml::from_str(&back).unwrap();
        assert_eq!(again.sandbox.limits, c.sandbox.limits);
    }

    #[test]
    fn providers_map_deserialised_from_yaml() {
        let yaml = r#"
providers:
  my_ollama:
    provider: ollama
    base_url: http://localhost:11434/v1
    name: llama3.2
"#;
        let c: Config = serde_yaml::from_str(yaml).unwrap();
        let p = c.providers.get("my_ollama").unwrap();
        assert_eq!(p.provider, "ollama");
        assert_eq!(p.base_url.as_deref(), Some("http://localhost:11434/v1"));
    }
}
