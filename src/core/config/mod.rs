//! Process configuration.
//!
//! Reads `config/default.toml` relative to the current working directory,
//! then applies `AGENTIC_WORK_DIR`, `AGENTIC_LOG_LEVEL` and
//! `AGENTIC_BUS_PASSWORD`.
//!
//! # Module layout
//!
//! - **types**: resolved structs consumed by the bus, dispatcher, agent
//!   runtimes and health aggregator (`Config`, `BusConfig`, …).
//! - **raw**: TOML deserialization types with serde defaults; private.
//! - **load**: `load`, `load_from`, `expand_home`, base-chain merging.

mod load;
mod raw;
mod types;

pub use load::{expand_home, load, load_from};
pub use types::*;

#[cfg(test)]
impl Config {
    /// Fast-ticking config for unit tests. Nothing touches the user's home.
    pub fn test_default(work_dir: &std::path::Path) -> Self {
        use std::time::Duration;

        Self {
            name: "test".into(),
            work_dir: work_dir.to_path_buf(),
            identity_dir: None,
            log_level: "info".into(),
            log_file: None,
            dispatcher_id: raw::default_dispatcher_id(),
            bus_password: None,
            bus: BusConfig {
                channel_prefix: raw::default_channel_prefix(),
                buffer: 64,
                publish_attempts: 3,
                publish_backoff: Duration::from_millis(10),
            },
            dispatch: DispatchConfig { default_timeout_seconds: 5.0 },
            agents: AgentsConfig {
                heartbeat_interval: Duration::from_secs(1),
                grace_period: Duration::from_secs(1),
                max_concurrent_tasks: 8,
                rate_limit_requests: 0,
                rate_limit_window: Duration::from_secs(60),
                builtin: Vec::new(),
            },
            health: HealthConfig {
                sweep_interval: Duration::from_secs(1),
                degraded_multiplier: 3,
                stopped_multiplier: 10,
                min_agents: 0,
            },
        }
    }
}
