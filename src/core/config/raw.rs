//! Raw TOML deserialization types.
//!
//! These structs mirror the TOML file shape and use `serde` defaults.
//! The `load` module converts them into the public `types` structs.

use std::collections::HashMap;

use serde::Deserialize;

// ── Top-level ────────────────────────────────────────────────────────────────

/// Raw TOML shape, before resolution.
#[derive(Deserialize)]
pub(super) struct RawConfig {
    pub runtime: RawRuntime,
    #[serde(default)]
    pub bus: RawBus,
    #[serde(default)]
    pub dispatch: RawDispatch,
    #[serde(default)]
    pub agents: RawAgents,
    #[serde(default)]
    pub health: RawHealth,
}

impl RawConfig {
    /// Shape used when no config file exists at all.
    pub fn fallback() -> Self {
        Self {
            runtime: RawRuntime {
                name: "agentic".into(),
                work_dir: "~/.agentic".into(),
                identity_dir: None,
                log_level: "info".into(),
                log_file: None,
                dispatcher_id: default_dispatcher_id(),
            },
            bus: RawBus::default(),
            dispatch: RawDispatch::default(),
            agents: RawAgents::default(),
            health: RawHealth::default(),
        }
    }
}

#[derive(Deserialize)]
pub(super) struct RawRuntime {
    pub name: String,
    pub work_dir: String,
    #[serde(default)]
    pub identity_dir: Option<String>,
    pub log_level: String,
    #[serde(default)]
    pub log_file: Option<String>,
    #[serde(default = "default_dispatcher_id")]
    pub dispatcher_id: String,
}

// ── Bus ──────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct RawBus {
    #[serde(default = "default_channel_prefix")]
    pub channel_prefix: String,
    #[serde(default = "default_bus_buffer")]
    pub buffer: usize,
    #[serde(default = "default_publish_attempts")]
    pub publish_attempts: u32,
    #[serde(default = "default_publish_backoff_ms")]
    pub publish_backoff_ms: u64,
}

impl Default for RawBus {
    fn default() -> Self {
        Self {
            channel_prefix: default_channel_prefix(),
            buffer: default_bus_buffer(),
            publish_attempts: default_publish_attempts(),
            publish_backoff_ms: default_publish_backoff_ms(),
        }
    }
}

// ── Dispatch ─────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct RawDispatch {
    #[serde(default = "default_timeout_seconds")]
    pub default_timeout_seconds: f64,
}

impl Default for RawDispatch {
    fn default() -> Self {
        Self { default_timeout_seconds: default_timeout_seconds() }
    }
}

// ── Agents ───────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct RawAgents {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    #[serde(default = "default_rate_limit_requests")]
    pub rate_limit_requests: u32,
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,
    /// `[agents.<name>]` tables for built-in agents.
    #[serde(flatten)]
    pub entries: HashMap<String, RawAgentEntry>,
}

impl Default for RawAgents {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            grace_period_secs: default_grace_period_secs(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            rate_limit_requests: default_rate_limit_requests(),
            rate_limit_window_secs: default_rate_limit_window_secs(),
            entries: HashMap::new(),
        }
    }
}

#[derive(Deserialize)]
pub(super) struct RawAgentEntry {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub id: Option<String>,
}

// ── Health ───────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct RawHealth {
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_degraded_multiplier")]
    pub degraded_multiplier: u32,
    #[serde(default = "default_stopped_multiplier")]
    pub stopped_multiplier: u32,
    #[serde(default)]
    pub min_agents: usize,
}

impl Default for RawHealth {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            degraded_multiplier: default_degraded_multiplier(),
            stopped_multiplier: default_stopped_multiplier(),
            min_agents: 0,
        }
    }
}

// ── Defaults ─────────────────────────────────────────────────────────────────

pub(super) fn default_true() -> bool {
    true
}

pub(super) fn default_dispatcher_id() -> String {
    "api-server".to_string()
}

pub(super) fn default_channel_prefix() -> String {
    "agentic".to_string()
}

pub(super) fn default_bus_buffer() -> usize {
    256
}

pub(super) fn default_publish_attempts() -> u32 {
    3
}

pub(super) fn default_publish_backoff_ms() -> u64 {
    200
}

pub(super) fn default_timeout_seconds() -> f64 {
    30.0
}

pub(super) fn default_heartbeat_interval_secs() -> u64 {
    30
}

pub(super) fn default_grace_period_secs() -> u64 {
    10
}

pub(super) fn default_max_concurrent_tasks() -> usize {
    32
}

pub(super) fn default_rate_limit_requests() -> u32 {
    100
}

pub(super) fn default_rate_limit_window_secs() -> u64 {
    60
}

pub(super) fn default_sweep_interval_secs() -> u64 {
    10
}

pub(super) fn default_degraded_multiplier() -> u32 {
    3
}

pub(super) fn default_stopped_multiplier() -> u32 {
    10
}

/// Agent id used for a built-in agent when its table gives none.
pub(super) fn default_builtin_agent_id(name: &str) -> String {
    format!("api-{name}-001")
}
