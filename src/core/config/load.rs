//! Configuration loading with env-var overrides.
//!
//! Reads TOML files, follows `[meta] base = "..."` inheritance chains, and
//! applies `AGENTIC_WORK_DIR`, `AGENTIC_LOG_LEVEL` and `AGENTIC_BUS_PASSWORD`.

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::AppError;

use super::raw::{self, RawConfig};
use super::types::*;

/// Deep-merge two TOML values. Tables merge key by key; any other value in
/// the overlay replaces the base value wholesale.
fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut merged), toml::Value::Table(overlay_tbl)) => {
            for (key, value) in overlay_tbl {
                let value = match merged.remove(&key) {
                    Some(base_value) => merge_toml(base_value, value),
                    None => value,
                };
                merged.insert(key, value);
            }
            toml::Value::Table(merged)
        }
        (_, overlay) => overlay,
    }
}

/// Read `path`, resolve its `[meta] base` chain, and return the merged value.
/// `visited` holds canonical paths already on the chain.
fn load_raw_merged(path: &Path, visited: &mut HashSet<PathBuf>) -> Result<toml::Value, AppError> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !visited.insert(canonical) {
        return Err(AppError::Config(format!(
            "circular base reference detected at: {}",
            path.display()
        )));
    }

    let text = fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;
    let value: toml::Value = toml::from_str(&text)
        .map_err(|e| AppError::Config(format!("parse error in {}: {e}", path.display())))?;

    let base = value
        .get("meta")
        .and_then(|m| m.get("base"))
        .and_then(|b| b.as_str())
        .map(|b| {
            if Path::new(b).is_absolute() {
                PathBuf::from(b)
            } else {
                path.parent().unwrap_or(Path::new(".")).join(b)
            }
        });

    match base {
        Some(base_path) => {
            let base_value = load_raw_merged(&base_path, visited)?;
            Ok(merge_toml(base_value, value))
        }
        None => Ok(value),
    }
}

/// Load config from the given path, or `config/default.toml`, then apply
/// env-var overrides. Without a path and without `config/default.toml` the
/// built-in defaults are used.
pub fn load(config_path: Option<&str>) -> Result<Config, AppError> {
    let work_dir_override = env::var("AGENTIC_WORK_DIR").ok();
    let log_level_override = env::var("AGENTIC_LOG_LEVEL").ok();

    let default_path = Path::new("config/default.toml");
    let path = match config_path {
        Some(p) => Some(Path::new(p)),
        None if default_path.exists() => Some(default_path),
        None => None,
    };

    let mut config = match path {
        Some(path) => load_from(
            path,
            work_dir_override.as_deref(),
            log_level_override.as_deref(),
        )?,
        None => resolve(
            RawConfig::fallback(),
            work_dir_override.as_deref(),
            log_level_override.as_deref(),
        )?,
    };
    config.bus_password = env::var("AGENTIC_BUS_PASSWORD").ok().filter(|p| !p.is_empty());
    Ok(config)
}

/// Load an explicit file with optional overrides. Tests pass overrides here
/// instead of mutating the process environment.
pub fn load_from(
    path: &Path,
    work_dir_override: Option<&str>,
    log_level_override: Option<&str>,
) -> Result<Config, AppError> {
    let merged = load_raw_merged(path, &mut HashSet::new())?;
    let parsed: RawConfig = Deserialize::deserialize(merged).map_err(|e: toml::de::Error| {
        AppError::Config(format!("config error in {}: {e}", path.display()))
    })?;
    resolve(parsed, work_dir_override, log_level_override)
}

fn resolve(
    parsed: RawConfig,
    work_dir_override: Option<&str>,
    log_level_override: Option<&str>,
) -> Result<Config, AppError> {
    let r = parsed.runtime;

    let work_dir = expand_home(work_dir_override.unwrap_or(&r.work_dir));
    let log_level = log_level_override.unwrap_or(&r.log_level).to_string();
    let relative_to_work_dir = |p: String| {
        let p = expand_home(&p);
        if p.is_absolute() { p } else { work_dir.join(p) }
    };
    let identity_dir = r.identity_dir.map(&relative_to_work_dir);
    let log_file = r.log_file.map(&relative_to_work_dir);

    if r.dispatcher_id.trim().is_empty() {
        return Err(AppError::Config("runtime.dispatcher_id must not be empty".into()));
    }
    if parsed.bus.publish_attempts == 0 {
        return Err(AppError::Config("bus.publish_attempts must be at least 1".into()));
    }
    if parsed.bus.buffer == 0 {
        return Err(AppError::Config("bus.buffer must be at least 1".into()));
    }
    let timeout = parsed.dispatch.default_timeout_seconds;
    if !(timeout.is_finite() && timeout > 0.0) {
        return Err(AppError::Config(format!(
            "dispatch.default_timeout_seconds must be positive, got {timeout}"
        )));
    }
    if parsed.agents.heartbeat_interval_secs == 0 {
        return Err(AppError::Config("agents.heartbeat_interval_secs must be at least 1".into()));
    }
    if parsed.health.sweep_interval_secs == 0 {
        return Err(AppError::Config("health.sweep_interval_secs must be at least 1".into()));
    }
    let (degraded, stopped) = (parsed.health.degraded_multiplier, parsed.health.stopped_multiplier);
    if degraded == 0 || stopped <= degraded {
        return Err(AppError::Config(format!(
            "health multipliers must satisfy 0 < degraded ({degraded}) < stopped ({stopped})"
        )));
    }

    let mut builtin: Vec<BuiltinAgentConfig> = parsed
        .agents
        .entries
        .into_iter()
        .filter(|(_, entry)| entry.enabled)
        .map(|(name, entry)| BuiltinAgentConfig {
            agent_id: entry
                .id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| raw::default_builtin_agent_id(&name)),
            name,
        })
        .collect();
    builtin.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(Config {
        name: r.name,
        work_dir,
        identity_dir,
        log_level,
        log_file,
        dispatcher_id: r.dispatcher_id,
        bus_password: None,
        bus: BusConfig {
            channel_prefix: parsed.bus.channel_prefix,
            buffer: parsed.bus.buffer,
            publish_attempts: parsed.bus.publish_attempts,
            publish_backoff: Duration::from_millis(parsed.bus.publish_backoff_ms),
        },
        dispatch: DispatchConfig { default_timeout_seconds: timeout },
        agents: AgentsConfig {
            heartbeat_interval: Duration::from_secs(parsed.agents.heartbeat_interval_secs),
            grace_period: Duration::from_secs(parsed.agents.grace_period_secs),
            max_concurrent_tasks: parsed.agents.max_concurrent_tasks,
            rate_limit_requests: parsed.agents.rate_limit_requests,
            rate_limit_window: Duration::from_secs(parsed.agents.rate_limit_window_secs),
            builtin,
        },
        health: HealthConfig {
            sweep_interval: Duration::from_secs(parsed.health.sweep_interval_secs),
            degraded_multiplier: degraded,
            stopped_multiplier: stopped,
            min_agents: parsed.health.min_agents,
        },
    })
}

/// Expand a leading `~` to the user's home directory.
/// Absolute or relative paths without `~` are returned unchanged.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(home) = dirs::home_dir() {
        if path == "~" {
            return home;
        }
        if let Some(rest) = path.strip_prefix("~/") {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
