//! Public configuration types.
//!
//! These are the resolved, ready-to-use structs that components consume.
//! Raw TOML deserialization types live in `raw.rs`.

use std::path::PathBuf;
use std::time::Duration;

// ── Bus ──────────────────────────────────────────────────────────────────────

/// Message bus client configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Prefix for every channel name (`{prefix}:agent:{id}`, `{prefix}:broadcast`).
    pub channel_prefix: String,
    /// Per-channel buffer of the in-process broker. Slow subscribers lose
    /// frames beyond this depth.
    pub buffer: usize,
    /// Total publish attempts before a publish surfaces `BusUnavailable`.
    pub publish_attempts: u32,
    /// Delay before the second attempt; doubles after each failure.
    pub publish_backoff: Duration,
}

// ── Dispatch ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Timeout applied by callers that do not pass their own.
    pub default_timeout_seconds: f64,
}

// ── Agents ───────────────────────────────────────────────────────────────────

/// A built-in agent enabled through `[agents.<name>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltinAgentConfig {
    /// Plugin name: `"calculator"` or `"echo"`.
    pub name: String,
    /// Agent id the runtime registers under.
    pub agent_id: String,
}

/// Settings shared by every agent runtime in this process.
#[derive(Debug, Clone)]
pub struct AgentsConfig {
    pub heartbeat_interval: Duration,
    /// How long a stopping runtime waits for in-flight handlers.
    pub grace_period: Duration,
    /// `0` disables the limit.
    pub max_concurrent_tasks: usize,
    /// Requests accepted per sender within `rate_limit_window`; `0` disables.
    pub rate_limit_requests: u32,
    pub rate_limit_window: Duration,
    /// Enabled built-in agents, sorted by name.
    pub builtin: Vec<BuiltinAgentConfig>,
}

// ── Health ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub sweep_interval: Duration,
    /// Heartbeat intervals without contact before an agent is `degraded`.
    pub degraded_multiplier: u32,
    /// Heartbeat intervals without contact before an agent is `stopped`.
    pub stopped_multiplier: u32,
    /// Non-stopped agents required for a `healthy` status.
    pub min_agents: usize,
}

// ── Top-level ────────────────────────────────────────────────────────────────

/// Fully resolved process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub name: String,
    pub work_dir: PathBuf,
    /// Explicit identity directory; discovered under `work_dir` when `None`.
    pub identity_dir: Option<PathBuf>,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    /// Sender id the dispatcher publishes under and listens for replies on.
    pub dispatcher_id: String,
    /// Read from `AGENTIC_BUS_PASSWORD`, never from TOML.
    pub bus_password: Option<String>,
    pub bus: BusConfig,
    pub dispatch: DispatchConfig,
    pub agents: AgentsConfig,
    pub health: HealthConfig,
}
