//! agentic: agent-to-agent task dispatch and response correlation.
//!
//! Callers hand a task to the [`dispatch::TaskDispatcher`]; it publishes a
//! `TASK_REQUEST` envelope on the recipient's bus channel and resolves the
//! caller's waiter when the matching `TASK_RESPONSE`/`TASK_ERROR` comes back,
//! or the timeout passes. Agents run inside [`agents::AgentRuntime`], register
//! in the [`registry::AgentRegistry`] and stay visible through heartbeats.
//! [`supervisor::Supervisor`] wires all of it together.

mod core;
pub mod bootstrap;

pub use self::core::{config, error};
pub use bootstrap::{identity, logger};

pub mod agents;
pub mod bus;
pub mod dispatch;
pub mod registry;
pub mod supervisor;
