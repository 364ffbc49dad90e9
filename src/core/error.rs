//! Application-wide error types.
//!
//! Module-level errors ([`BusError`], [`DispatchError`], [`RegistryError`],
//! [`EnvelopeError`]) live next to the code that raises them and convert into
//! [`AppError`] at the application boundary. Every error maps onto one of the
//! five [`ErrorKind`] buckets, which the binary turns into a process exit code.

use serde::Serialize;
use thiserror::Error;

use crate::bus::BusError;
use crate::bus::envelope::EnvelopeError;
use crate::dispatch::DispatchError;
use crate::registry::RegistryError;

// ── ErrorKind ────────────────────────────────────────────────────────────────

/// Coarse failure classification shared by the whole crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Anything not covered below, including invalid caller input.
    General,
    /// Configuration could not be loaded or resolved.
    Config,
    /// The message bus is down or refused the connection.
    TransportUnavailable,
    /// The addressed agent is unknown, stopped or not listening.
    Unreachable,
    /// The agent received the task but failed or never answered.
    AgentOperationFailed,
}

impl ErrorKind {
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::General => 1,
            ErrorKind::Config => 2,
            ErrorKind::TransportUnavailable => 3,
            ErrorKind::Unreachable => 4,
            ErrorKind::AgentOperationFailed => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::General => "general",
            ErrorKind::Config => "config",
            ErrorKind::TransportUnavailable => "transport_unavailable",
            ErrorKind::Unreachable => "unreachable",
            ErrorKind::AgentOperationFailed => "agent_operation_failed",
        }
    }
}

// ── AppError ─────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("identity error: {0}")]
    Identity(String),

    #[error("logger error: {0}")]
    Logger(String),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("{0}")]
    Dispatch(#[from] DispatchError),

    #[error("agent error: {0}")]
    Agent(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Config(_) => ErrorKind::Config,
            AppError::Bus(e) => e.kind(),
            AppError::Registry(e) => e.kind(),
            AppError::Envelope(e) => e.kind(),
            AppError::Dispatch(e) => e.kind(),
            AppError::Agent(_) => ErrorKind::AgentOperationFailed,
            AppError::Identity(_) | AppError::Logger(_) | AppError::Io(_) => ErrorKind::General,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn config_error_display() {
        let e = AppError::Config("missing field".into());
        assert!(e.to_string().contains("missing field"));
        assert_eq!(e.kind(), ErrorKind::Config);
    }

    #[test]
    fn identity_error_display() {
        let e = AppError::Identity("key not found".into());
        assert!(e.to_string().contains("key not found"));
    }

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let e: AppError = io_err.into();
        assert!(e.to_string().contains("io error"));
        assert_eq!(e.kind(), ErrorKind::General);
        let _: &dyn Error = &e;
    }

    #[test]
    fn exit_codes_are_distinct() {
        let kinds = [
            ErrorKind::General,
            ErrorKind::Config,
            ErrorKind::TransportUnavailable,
            ErrorKind::Unreachable,
            ErrorKind::AgentOperationFailed,
        ];
        let mut codes: Vec<i32> = kinds.iter().map(|k| k.exit_code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn bus_error_keeps_transport_kind() {
        let e: AppError = BusError::Unavailable("connection refused".into()).into();
        assert_eq!(e.kind(), ErrorKind::TransportUnavailable);
        assert_eq!(e.kind().as_str(), "transport_unavailable");
    }
}
