// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// Used for config fields that should be enabled unless the user explicitly
/// sets them to `false`.  `#[serde(default)]` on a `bool` always falls back
/// to `bool::default()` (i.e. `false`), so a named function is required.
fn default_true() -> bool {
    true
}

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
    #[serde(default)]
    pub permission: PermissionConfig,
    #[serde(default)]
    pub event_log: EventLogConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Fields populated from `CRUSH_*` environment variables rather than
    /// config files. Not intended to be set from YAML directly, though
    /// nothing prevents it for local testing.
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Named provider configurations.
    ///
    /// Define custom endpoints, local models, or additional accounts here and
    /// reference them by name from the session's `model` field.
    ///
    /// ```yaml
    /// providers:
    ///   my_ollama:
    ///     provider: openai        # uses the OpenAI-compatible wire format
    ///     base_url: http://localhost:11434/v1
    ///     name: llama3.2          # default model for this provider
    ///   work_anthropic:
    ///     provider: anthropic
    ///     api_key_env: WORK_ANTHROPIC_KEY
    ///     name: claude-opus-4-5
    /// ```
    #[serde(default)]
    pub providers: std::collections::HashMap<String, ModelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier, e.g. "anthropic" | "openai" | "google" | "mock".
    pub provider: String,
    /// Model name forwarded to the provider API
    pub name: String,
    /// Environment variable that holds the API key (read at runtime)
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files
    pub api_key: Option<String>,
    /// Base URL override.  Useful for local proxies or self-hosted gateways.
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0)
    pub temperature: Option<f32>,

    // ── Prompt caching ────────────────────────────────────────────────────────
    /// Attach an explicit cache-control marker to the system message.
    ///
    /// Anthropic-style providers add a cache breakpoint to the system block so
    /// the prefix up to and including it is cached; other providers cache
    /// automatically and ignore this flag.
    #[serde(default = "default_true")]
    pub cache_system_prompt: bool,

    /// Use the extended (1-hour) cache TTL instead of the default 5-minute
    /// window. Applies to the system prompt and to tool definitions. Only
    /// meaningful for providers with explicit cache-control headers.
    #[serde(default)]
    pub extended_cache_time: bool,

    /// Cache tool definitions — stable across requests within a session, so
    /// caching them saves their cost on every subsequent turn.
    #[serde(default = "default_true")]
    pub cache_tools: bool,

    /// Cache conversation history up to the last message so prior turns are
    /// read from cache at a fraction of the base token cost.
    #[serde(default = "default_true")]
    pub cache_conversation: bool,

    // ── Provider-specific extras ──────────────────────────────────────────────
    /// Free-form provider-specific options forwarded as-is to the driver.
    #[serde(default)]
    pub driver_options: serde_json::Value,

    // ── Mock provider ─────────────────────────────────────────────────────────
    /// Path to YAML mock-responses file (used when provider = "mock").
    pub mock_responses_file: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".into(),
            name: "claude-opus-4-5".into(),
            // api_key_env is intentionally None here. The provider registry
            // already knows the canonical env-var name per provider; hard
            // coding it would shadow that lookup on a per-session override.
            api_key_env: None,
            api_key: None,
            base_url: None,
            max_tokens: Some(4096),
            temperature: Some(0.2),
            cache_system_prompt: true,
            extended_cache_time: false,
            cache_tools: true,
            cache_conversation: true,
            driver_options: serde_json::Value::Null,
            mock_responses_file: None,
        }
    }
}

fn default_max_tool_rounds() -> u32 {
    200
}
fn default_compaction_threshold() -> f32 {
    0.85
}

/// Strategy used when compacting a session's context.
///
/// `Structured` (default) instructs the model to produce a typed Markdown
/// checkpoint with fixed sections (Active Task, Key Decisions, Files &
/// Artifacts, Constraints, Pending Items, Session Narrative). `Narrative`
/// uses free-form summarisation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompactionStrategy {
    #[default]
    Structured,
    Narrative,
}

impl std::fmt::Display for CompactionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactionStrategy::Structured => write!(f, "structured"),
            CompactionStrategy::Narrative => write!(f, "narrative"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum number of autonomous tool-call rounds before a generation is
    /// force-finished with `max_rounds_exceeded`.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
    /// Token fraction of the model's usable input budget at which proactive
    /// compaction triggers (0.0–1.0).
    #[serde(default = "default_compaction_threshold")]
    pub compaction_threshold: f32,
    /// Number of recent non-system messages preserved verbatim during
    /// compaction; older messages beyond this tail are summarised.
    #[serde(default = "default_compaction_keep_recent")]
    pub compaction_keep_recent: usize,
    /// Compaction checkpoint format.
    #[serde(default)]
    pub compaction_strategy: CompactionStrategy,
    /// Maximum tokens allowed for a single tool result before deterministic,
    /// content-aware truncation is applied.
    #[serde(default = "default_tool_result_token_cap")]
    pub tool_result_token_cap: usize,
    /// Fraction of the context window reserved for tool schemas and
    /// measurement error in the token approximation.
    #[serde(default = "default_compaction_overhead_reserve")]
    pub compaction_overhead_reserve: f32,
    /// System prompt override; leave None to use the built-in prompt.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

fn default_compaction_keep_recent() -> usize {
    6
}
fn default_tool_result_token_cap() -> usize {
    4000
}
fn default_compaction_overhead_reserve() -> f32 {
    0.10
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: 200,
            compaction_threshold: 0.85,
            compaction_keep_recent: default_compaction_keep_recent(),
            compaction_strategy: CompactionStrategy::Structured,
            tool_result_token_cap: default_tool_result_token_cap(),
            compaction_overhead_reserve: default_compaction_overhead_reserve(),
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Glob patterns for terminal commands auto-approved without prompting.
    pub auto_approve_patterns: Vec<String>,
    /// Glob patterns for terminal commands always rejected, even if requested.
    pub deny_patterns: Vec<String>,
    /// Timeout in seconds for a single tool call.
    pub timeout_secs: u64,
    /// Linter configuration used by the read_lints tool.
    #[serde(default)]
    pub lints: LintsConfig,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            auto_approve_patterns: vec![
                "cat *".into(),
                "ls *".into(),
                "find *".into(),
                "rg *".into(),
                "grep *".into(),
            ],
            deny_patterns: vec!["rm -rf /*".into(), "dd if=*".into()],
            timeout_secs: 30,
            lints: LintsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LintsConfig {
    /// Override the lint command for Rust projects
    pub rust_command: Option<String>,
    /// Override the lint command for TypeScript/JS projects
    pub typescript_command: Option<String>,
    /// Override the lint command for Python projects
    pub python_command: Option<String>,
}

/// Connection settings for the remote sandbox the runtime's tools execute
/// against. The core process never touches the user's filesystem directly;
/// every Execute/ReadFile/WriteFile/.../GetLSPDiagnostics call is an RPC to
/// this service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Base URL of the sandbox HTTP service, e.g. `http://sandbox:7100`.
    pub base_url: String,
    /// Timeout in seconds for read/write/edit/list/grep/glob calls.
    #[serde(default = "SandboxConfig::default_io_timeout_secs")]
    pub io_timeout_secs: u64,
    /// Timeout in seconds for command execution.
    #[serde(default = "SandboxConfig::default_execute_timeout_secs")]
    pub execute_timeout_secs: u64,
    /// Timeout in seconds for LSP diagnostics requests.
    #[serde(default = "SandboxConfig::default_diagnostics_timeout_secs")]
    pub diagnostics_timeout_secs: u64,
}

impl SandboxConfig {
    fn default_io_timeout_secs() -> u64 {
        30
    }
    fn default_execute_timeout_secs() -> u64 {
        300
    }
    fn default_diagnostics_timeout_secs() -> u64 {
        10
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:7100".into(),
            io_timeout_secs: Self::default_io_timeout_secs(),
            execute_timeout_secs: Self::default_execute_timeout_secs(),
            diagnostics_timeout_secs: Self::default_diagnostics_timeout_secs(),
        }
    }
}

/// Tuning for the permission arbiter that gates tool calls outside the
/// auto-approve policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionConfig {
    /// Seconds to wait for a user decision before treating the request as
    /// timed out and denying the underlying tool call.
    #[serde(default = "PermissionConfig::default_timeout_secs")]
    pub timeout_secs: u64,
}

impl PermissionConfig {
    fn default_timeout_secs() -> u64 {
        300
    }
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: Self::default_timeout_secs(),
        }
    }
}

/// Retention policy for the durable per-session event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogConfig {
    /// Path to the SQLite database file backing the event log.
    pub database_path: Option<String>,
    /// Drop events older than this many days. 0 disables age-based trimming.
    #[serde(default = "EventLogConfig::default_max_age_days")]
    pub max_age_days: u64,
    /// Per-session cap on retained events; oldest are trimmed first once
    /// exceeded. 0 disables count-based trimming.
    #[serde(default = "EventLogConfig::default_max_events_per_session")]
    pub max_events_per_session: u64,
}

impl EventLogConfig {
    fn default_max_age_days() -> u64 {
        30
    }
    fn default_max_events_per_session() -> u64 {
        50_000
    }
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            max_age_days: Self::default_max_age_days(),
            max_events_per_session: Self::default_max_events_per_session(),
        }
    }
}

/// WebSocket connection gateway settings (C9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Address the gateway's HTTP/WebSocket listener binds to.
    #[serde(default = "GatewayConfig::default_bind_addr")]
    pub bind_addr: String,
    /// Issuer expected in incoming JWTs.
    #[serde(default = "GatewayConfig::default_jwt_issuer")]
    pub jwt_issuer: String,
    /// Environment variable holding the HMAC secret used to verify JWTs.
    #[serde(default = "GatewayConfig::default_jwt_secret_env")]
    pub jwt_secret_env: String,
    /// Bounded outbound queue size per connection before the connection is
    /// dropped for lagging too far behind its subscribed event stream.
    #[serde(default = "GatewayConfig::default_outbound_queue_len")]
    pub outbound_queue_len: usize,
}

impl GatewayConfig {
    fn default_bind_addr() -> String {
        "0.0.0.0:8080".into()
    }
    fn default_jwt_issuer() -> String {
        "crush".into()
    }
    fn default_jwt_secret_env() -> String {
        "CRUSH_JWT_SECRET".into()
    }
    fn default_outbound_queue_len() -> usize {
        256
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: Self::default_bind_addr(),
            jwt_issuer: Self::default_jwt_issuer(),
            jwt_secret_env: Self::default_jwt_secret_env(),
            outbound_queue_len: Self::default_outbound_queue_len(),
        }
    }
}

/// Values sourced from `CRUSH_*` environment variables rather than YAML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// `CRUSH_CWD` — working directory the sandbox resolves relative paths
    /// against for this process's sessions.
    pub working_dir: Option<std::path::PathBuf>,
    /// `CRUSH_DATA_DIR` — directory for the event log database and other
    /// durable state.
    pub data_dir: Option<std::path::PathBuf>,
    /// `CRUSH_DEBUG` — enables verbose tracing output.
    #[serde(default)]
    pub debug: bool,
    /// `CRUSH_PROFILE` — enables per-component timing spans in the trace
    /// output.
    #[serde(default)]
    pub profile: bool,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Defaults ─────────────────────────────────────────────────────────────

    #[test]
    fn config_default_model_provider_is_anthropic() {
        let c = Config::default();
        assert_eq!(c.model.provider, "anthropic");
    }

    #[test]
    fn config_default_api_key_env_is_none() {
        // api_key_env must be None in the default config so that resolution
        // falls through to the driver registry rather than shadowing a
        // per-session provider override.
        let c = Config::default();
        assert!(c.model.api_key_env.is_none());
    }

    #[test]
    fn config_default_max_tool_rounds_positive() {
        let c = Config::default();
        assert!(c.agent.max_tool_rounds > 0);
    }

    #[test]
    fn config_default_compaction_threshold_in_range() {
        let c = Config::default();
        assert!(c.agent.compaction_threshold > 0.0);
        assert!(c.agent.compaction_threshold < 1.0);
    }

    #[test]
    fn config_default_compaction_keep_recent_is_six() {
        let c = Config::default();
        assert_eq!(c.agent.compaction_keep_recent, 6);
    }

    #[test]
    fn config_compaction_keep_recent_yaml_round_trip() {
        let yaml_str = "agent:\n  compaction_keep_recent: 10\n";
        let c: Config = serde_yaml::from_str(yaml_str).unwrap();
        assert_eq!(c.agent.compaction_keep_recent, 10);
        let back_yaml = serde_yaml::to_string(&c).unwrap();
        let back: Config = serde_yaml::from_str(&back_yaml).unwrap();
        assert_eq!(back.agent.compaction_keep_recent, 10);
    }

    #[test]
    fn config_compaction_keep_recent_defaults_when_absent_from_yaml() {
        let yaml_str = "agent:\n  max_tool_rounds: 30\n  compaction_threshold: 0.9\n";
        let c: Config = serde_yaml::from_str(yaml_str).unwrap();
        assert_eq!(
            c.agent.compaction_keep_recent, 6,
            "serde default must fill in missing field"
        );
    }

    #[test]
    fn config_default_no_system_prompt_override() {
        let c = Config::default();
        assert!(c.agent.system_prompt.is_none());
    }

    #[test]
    fn config_default_tools_has_auto_approve_patterns() {
        let c = Config::default();
        assert!(!c.tools.auto_approve_patterns.is_empty());
    }

    #[test]
    fn config_default_sandbox_base_url_is_loopback() {
        let c = Config::default();
        assert!(c.sandbox.base_url.contains("127.0.0.1"));
    }

    #[test]
    fn config_default_permission_timeout_is_five_minutes() {
        let c = Config::default();
        assert_eq!(c.permission.timeout_secs, 300);
    }

    #[test]
    fn config_default_event_log_trims_after_thirty_days() {
        let c = Config::default();
        assert_eq!(c.event_log.max_age_days, 30);
    }

    #[test]
    fn config_default_gateway_jwt_issuer_is_crush() {
        let c = Config::default();
        assert_eq!(c.gateway.jwt_issuer, "crush");
    }

    #[test]
    fn config_default_runtime_fields_are_unset() {
        let c = Config::default();
        assert!(c.runtime.data_dir.is_none());
        assert!(c.runtime.working_dir.is_none());
        assert!(!c.runtime.debug);
        assert!(!c.runtime.profile);
    }

    // ── Prompt caching defaults ───────────────────────────────────────────────

    #[test]
    fn config_default_caching_enabled_except_extended_ttl() {
        let c = Config::default();
        assert!(c.model.cache_system_prompt);
        assert!(c.model.cache_tools);
        assert!(c.model.cache_conversation);
        assert!(!c.model.extended_cache_time);
    }

    #[test]
    fn config_cache_flags_can_be_disabled_via_yaml() {
        let yaml_str = "model:\n  provider: anthropic\n  name: claude-sonnet-4-5\n  \
                        cache_system_prompt: false\n  cache_tools: false\n  \
                        cache_conversation: false\n";
        let c: Config = serde_yaml::from_str(yaml_str).unwrap();
        assert!(!c.model.cache_system_prompt);
        assert!(!c.model.cache_tools);
        assert!(!c.model.cache_conversation);
    }

    #[test]
    fn config_extended_cache_time_can_be_enabled_via_yaml() {
        let yaml_str = "model:\n  provider: anthropic\n  name: claude-sonnet-4-5\n  \
                        extended_cache_time: true\n";
        let c: Config = serde_yaml::from_str(yaml_str).unwrap();
        assert!(c.model.extended_cache_time);
    }

    // ── YAML round-trip ───────────────────────────────────────────────────────

    #[test]
    fn config_serialises_to_valid_yaml() {
        let c = Config::default();
        let yaml_str = serde_yaml::to_string(&c).unwrap();
        assert!(yaml_str.contains("provider"));
        assert!(yaml_str.contains("anthropic"));
    }

    #[test]
    fn config_deserialises_from_yaml() {
        let yaml_str =
            "model:\n  provider: anthropic\n  name: claude-opus-4-5\n  max_tokens: 8192\n";
        let c: Config = serde_yaml::from_str(yaml_str).unwrap();
        assert_eq!(c.model.provider, "anthropic");
        assert_eq!(c.model.name, "claude-opus-4-5");
        assert_eq!(c.model.max_tokens, Some(8192));
    }

    #[test]
    fn config_partial_yaml_fills_in_defaults() {
        let yaml_str = "model:\n  name: claude-haiku\n  provider: anthropic\n";
        let c: Config = serde_yaml::from_str(yaml_str).unwrap();
        assert_eq!(c.model.name, "claude-haiku");
        assert_eq!(
            c.agent.max_tool_rounds,
            AgentConfig::default().max_tool_rounds
        );
    }

    // ── providers map ─────────────────────────────────────────────────────────

    #[test]
    fn config_default_providers_is_empty() {
        let c = Config::default();
        assert!(c.providers.is_empty(), "providers must be empty by default");
    }

    #[test]
    fn config_providers_deserialised_from_yaml() {
        let yaml = r#"
providers:
  my_ollama:
    provider: openai
    base_url: http://localhost:11434/v1
    name: llama3.2
"#;
        let c: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(c.providers.len(), 1);
        let p = c.providers.get("my_ollama").unwrap();
        assert_eq!(p.provider, "openai");
        assert_eq!(p.base_url.as_deref(), Some("http://localhost:11434/v1"));
        assert_eq!(p.name, "llama3.2");
    }

    #[test]
    fn config_providers_round_trip_yaml() {
        let yaml = r#"
providers:
  local:
    provider: openai
    base_url: http://127.0.0.1:8080/v1
    name: phi-3
"#;
        let c: Config = serde_yaml::from_str(yaml).unwrap();
        let serialised = serde_yaml::to_string(&c).unwrap();
        let back: Config = serde_yaml::from_str(&serialised).unwrap();
        let p = back.providers.get("local").unwrap();
        assert_eq!(p.name, "phi-3");
        assert_eq!(p.base_url.as_deref(), Some("http://127.0.0.1:8080/v1"));
    }

    #[test]
    fn config_providers_absent_in_yaml_uses_empty_default() {
        let yaml = "model:\n  provider: anthropic\n  name: claude-opus-4-5\n";
        let c: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(c.providers.is_empty());
    }
}
