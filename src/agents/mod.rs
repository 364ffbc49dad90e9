//! Agents: the receiving side of task dispatch.
//!
//! An agent is described by an [`AgentSpec`]: an id, a display name and a
//! table of task types, each with a [`Capability`] (advertised in
//! heartbeats) and a [`TaskHandler`]. [`runtime::AgentRuntime`] runs the
//! spec: it consumes `TASK_REQUEST` envelopes from the agent's channel,
//! invokes the matching handler and publishes the reply.
//!
//! Built-in agents are compiled in behind Cargo features:
//!
//! | feature | agent | task types |
//! |---|---|---|
//! | `plugin-calculator` | [`calculator`] | `add`, `subtract`, `multiply`, `divide` |
//! | `plugin-echo` | [`echo`] | `echo`, `uppercase`, `reverse` |

pub mod rate_limit;
pub mod runtime;

#[cfg(feature = "plugin-calculator")]
pub mod calculator;
#[cfg(feature = "plugin-echo")]
pub mod echo;

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::bus::Payload;
use crate::registry::Capability;

pub use runtime::{AgentHandle, AgentRuntime, RuntimeState};

// ── Handler contract ─────────────────────────────────────────────────────────

/// What a handler knows about the request it is serving.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub agent_id: String,
    /// Sender of the request; the reply goes back to it.
    pub requester_id: String,
    /// The request's `message_id`.
    pub correlation_id: String,
    pub task_type: String,
}

/// A handler failure, sent back as the `TASK_ERROR` payload
/// `{"error": message, "kind": kind, "details": …}`.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct TaskError {
    pub kind: String,
    pub message: String,
    pub details: Option<Value>,
}

impl TaskError {
    pub const EXECUTION_FAILED: &'static str = "execution_failed";
    pub const HANDLER_PANIC: &'static str = "handler_panic";
    pub const UNKNOWN_TASK_TYPE: &'static str = "unknown_task_type";
    pub const RATE_LIMITED: &'static str = "rate_limited";
    pub const INVALID_PARAMS: &'static str = "invalid_params";

    /// Failure of kind `execution_failed`.
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_kind(Self::EXECUTION_FAILED, message)
    }

    pub fn with_kind(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self { kind: kind.into(), message: message.into(), details: None }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::with_kind(Self::INVALID_PARAMS, message)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn to_payload(&self) -> Payload {
        let mut payload = Payload::new();
        payload.insert("error".into(), Value::String(self.message.clone()));
        payload.insert("kind".into(), Value::String(self.kind.clone()));
        if let Some(details) = &self.details {
            payload.insert("details".into(), details.clone());
        }
        payload
    }
}

/// Future returned by [`TaskHandler::handle`].
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Payload, TaskError>> + Send + 'static>>;

/// Work behind one task type.
///
/// Handlers run concurrently on the runtime's task set; a panic inside the
/// returned future is caught and reported as a `handler_panic` error.
pub trait TaskHandler: Send + Sync {
    fn handle(&self, ctx: TaskContext, payload: Payload) -> HandlerFuture;
}

struct FnHandler<F>(F);

impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext, Payload) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Payload, TaskError>> + Send + 'static,
{
    fn handle(&self, ctx: TaskContext, payload: Payload) -> HandlerFuture {
        Box::pin((self.0)(ctx, payload))
    }
}

/// Wrap an async closure as a [`TaskHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(TaskContext, Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload, TaskError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

// ── AgentSpec ────────────────────────────────────────────────────────────────

/// Everything needed to run an agent.
#[derive(Clone)]
pub struct AgentSpec {
    pub agent_id: String,
    pub display_name: String,
    handlers: BTreeMap<String, (Capability, Arc<dyn TaskHandler>)>,
}

impl AgentSpec {
    pub fn new(agent_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self { agent_id: agent_id.into(), display_name: display_name.into(), handlers: BTreeMap::new() }
    }

    /// Handle `capability.name` with `handler`. A repeated name replaces the
    /// earlier entry.
    pub fn capability(mut self, capability: Capability, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.insert(capability.name.clone(), (capability, handler));
        self
    }

    /// Advertised capabilities, ordered by name.
    pub fn capabilities(&self) -> Vec<Capability> {
        self.handlers.values().map(|(cap, _)| cap.clone()).collect()
    }

    pub fn handler(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).map(|(_, h)| h.clone())
    }
}

impl std::fmt::Debug for AgentSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSpec")
            .field("agent_id", &self.agent_id)
            .field("display_name", &self.display_name)
            .field("task_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Spec for the built-in agent plugin `name`, if it was compiled in.
pub fn builtin(name: &str, agent_id: &str) -> Option<AgentSpec> {
    match name {
        #[cfg(feature = "plugin-calculator")]
        "calculator" => Some(calculator::spec(agent_id)),
        #[cfg(feature = "plugin-echo")]
        "echo" => Some(echo::spec(agent_id)),
        _ => {
            let _ = agent_id;
            None
        }
    }
}
