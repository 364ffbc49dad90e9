//! Process-wide tracing subscriber.
//!
//! Call [`init`] once at startup, after the effective level is known.
//! Library code only emits `tracing` events; installing a subscriber is the
//! binary's job.

use std::path::Path;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use crate::error::AppError;

/// Install the subscriber for this process.
///
/// With `prefer_level` set (a CLI `-v` flag was given) `level` wins and
/// `RUST_LOG` is only a fallback for an invalid level. Otherwise `RUST_LOG`
/// wins and `level` is the fallback. Output goes to stderr, or appends to
/// `log_file` without ANSI colours.
pub fn init(level: &str, prefer_level: bool, log_file: Option<&Path>) -> Result<(), AppError> {
    let filter = if prefer_level {
        EnvFilter::try_new(level).or_else(|level_err| {
            EnvFilter::try_from_default_env().map_err(|env_err| {
                AppError::Logger(format!(
                    "invalid log level '{level}': {level_err}; RUST_LOG parse failed: {env_err}"
                ))
            })
        })?
    } else {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(level))
            .map_err(|e| AppError::Logger(format!("invalid log level '{level}': {e}")))?
    };

    let (writer, ansi) = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    AppError::Logger(format!("failed to create '{}': {e}", parent.display()))
                })?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    AppError::Logger(format!("failed to open log file '{}': {e}", path.display()))
                })?;
            (BoxMakeWriter::new(file), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi)
        .try_init()
        .map_err(|e| AppError::Logger(format!("failed to set subscriber: {e}")))?;

    Ok(())
}

/// Validate a level name such as `"debug"` from config or the environment.
pub fn parse_level(level: &str) -> Result<LevelFilter, AppError> {
    if level.is_empty() {
        return Err(AppError::Logger("log level must not be empty".into()));
    }
    level
        .parse::<LevelFilter>()
        .map_err(|_| AppError::Logger(format!("unrecognised log level: '{level}'")))
}

/// Map a count of `-v` flags onto a level string.
pub fn level_for_verbosity(count: u8) -> &'static str {
    match count {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_levels_accepted() {
        for level in ["error", "warn", "info", "debug", "trace", "off"] {
            assert!(parse_level(level).is_ok(), "{level} rejected");
        }
    }

    #[test]
    fn garbage_levels_rejected() {
        for level in ["", "loud", "debug,agentic=trace"] {
            assert!(parse_level(level).is_err(), "{level:?} accepted");
        }
    }

    #[test]
    fn verbosity_tiers() {
        assert_eq!(level_for_verbosity(1), "info");
        assert_eq!(level_for_verbosity(2), "debug");
        assert_eq!(level_for_verbosity(9), "trace");
        for n in 0..4 {
            assert!(parse_level(level_for_verbosity(n)).is_ok());
        }
    }

    #[test]
    fn log_file_parent_is_created() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("logs").join("agentic.log");
        // Only one subscriber per process; a second install is reported, not fatal.
        match init("debug", true, Some(&path)) {
            Ok(()) | Err(AppError::Logger(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
        assert!(path.exists());
    }
}
