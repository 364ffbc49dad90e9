//! Agent registry: who exists, what they can do, and whether they are alive.
//!
//! The table is copy-on-write: readers clone an `Arc` of the current map
//! under a momentary read lock, writers are serialized by a separate mutex
//! and swap in a rebuilt map. A sweep in progress never holds up
//! [`AgentRegistry::get`] or [`AgentRegistry::list_active`].
//!
//! Liveness is derived from heartbeat age:
//!
//! ```text
//! age > degraded_multiplier × heartbeat_interval  → degraded
//! age > stopped_multiplier  × heartbeat_interval  → stopped
//! ```
//!
//! Only [`AgentRegistry::sweep`] applies those thresholds; it is driven by
//! the health aggregator's timer.

pub mod presence;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::bus::envelope::{Envelope, EnvelopeError};
use crate::config::{AgentsConfig, HealthConfig};
use crate::error::ErrorKind;

// ── Records ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Starting,
    Active,
    Degraded,
    Stopped,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Starting => "starting",
            AgentStatus::Active => "active",
            AgentStatus::Degraded => "degraded",
            AgentStatus::Stopped => "stopped",
        }
    }

    /// Anything but `stopped`.
    pub fn is_live(self) -> bool {
        self != AgentStatus::Stopped
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a record is `stopped`. Only a record stopped for going quiet comes
/// back on its own; the others wait for a fresh registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// `deregister` was called.
    Deregistered,
    /// The agent broadcast a `stopped` heartbeat.
    Announced,
    /// The sweep found its heartbeat overdue.
    Overdue,
}

/// A task type an agent accepts, with a JSON schema for its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object")]
    pub parameters: Value,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl Capability {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self { name: name.into(), description: description.into(), parameters: empty_object() }
    }

    pub fn with_parameters(mut self, schema: Value) -> Self {
        self.parameters = schema;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub display_name: String,
    /// Unique by name, sorted by name.
    pub capabilities: Vec<Capability>,
    pub status: AgentStatus,
    pub last_heartbeat_at: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    /// Hex ed25519 key; envelopes from this agent must carry a valid signature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// Set while `status` is `stopped`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
}

impl AgentRecord {
    pub fn new(agent_id: impl Into<String>, display_name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            agent_id: agent_id.into(),
            display_name: display_name.into(),
            capabilities: Vec::new(),
            status: AgentStatus::Starting,
            last_heartbeat_at: now,
            registered_at: now,
            public_key: None,
            stop_reason: None,
        }
    }

    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        let mut caps: Vec<Capability> = capabilities.into_iter().collect();
        caps.sort_by(|a, b| a.name.cmp(&b.name));
        caps.dedup_by(|a, b| a.name == b.name);
        self.capabilities = caps;
        self
    }

    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_public_key(mut self, public_key: Option<String>) -> Self {
        self.public_key = public_key;
        self
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c.name == name)
    }
}

// ── Errors & events ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Heartbeat or deregistration for an id that was never registered.
    #[error("unknown agent '{0}'")]
    UnknownAgent(String),

    #[error("agent '{0}' not found")]
    NotFound(String),

    /// Heartbeat for an agent that was deregistered or announced its stop.
    #[error("agent '{0}' is stopped until it registers again")]
    Stopped(String),
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Unreachable
    }
}

/// Status change applied by a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub agent_id: String,
    pub from: AgentStatus,
    pub to: AgentStatus,
}

/// Broadcast to anyone tracking agent availability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Registered(String),
    /// Deregistered, swept to `stopped`, or removed.
    Unavailable(String),
}

// ── Liveness thresholds ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Liveness {
    pub heartbeat_interval: Duration,
    pub degraded_multiplier: u32,
    pub stopped_multiplier: u32,
}

impl Liveness {
    pub fn from_config(agents: &AgentsConfig, health: &HealthConfig) -> Self {
        Self {
            heartbeat_interval: agents.heartbeat_interval,
            degraded_multiplier: health.degraded_multiplier,
            stopped_multiplier: health.stopped_multiplier,
        }
    }

    fn threshold(&self, multiplier: u32) -> TimeDelta {
        TimeDelta::from_std(self.heartbeat_interval.saturating_mul(multiplier))
            .unwrap_or(TimeDelta::MAX)
    }

    /// Status implied by a heartbeat `age`, or `None` if the current one stands.
    fn evaluate(&self, current: AgentStatus, age: TimeDelta) -> Option<AgentStatus> {
        if age > self.threshold(self.stopped_multiplier) {
            Some(AgentStatus::Stopped)
        } else if age > self.threshold(self.degraded_multiplier)
            && matches!(current, AgentStatus::Starting | AgentStatus::Active)
        {
            Some(AgentStatus::Degraded)
        } else {
            None
        }
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            degraded_multiplier: 3,
            stopped_multiplier: 10,
        }
    }
}

// ── AgentRegistry ────────────────────────────────────────────────────────────

type Table = HashMap<String, AgentRecord>;

struct Inner {
    table: RwLock<Arc<Table>>,
    writer: Mutex<()>,
    liveness: Liveness,
    events: broadcast::Sender<RegistryEvent>,
}

/// Shared agent table. Clone freely.
#[derive(Clone)]
pub struct AgentRegistry {
    inner: Arc<Inner>,
}

impl AgentRegistry {
    pub fn new(liveness: Liveness) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                table: RwLock::new(Arc::new(Table::new())),
                writer: Mutex::new(()),
                liveness,
                events,
            }),
        }
    }

    pub fn liveness(&self) -> Liveness {
        self.inner.liveness
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.events.subscribe()
    }

    fn snapshot(&self) -> Arc<Table> {
        self.inner.table.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Run `f` on a private copy of the table and publish the result if `f`
    /// reports a change.
    fn update<R>(&self, f: impl FnOnce(&mut Table) -> (bool, R)) -> R {
        let _writer = self.inner.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = (*self.snapshot()).clone();
        let (changed, result) = f(&mut next);
        if changed {
            *self.inner.table.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
        }
        result
    }

    fn emit(&self, event: RegistryEvent) {
        // No listeners is fine.
        let _ = self.inner.events.send(event);
    }

    /// Insert or replace a record. Re-registering keeps the original
    /// `registered_at`.
    pub fn register(&self, mut record: AgentRecord) {
        let agent_id = record.agent_id.clone();
        let replaced = self.update(|table| {
            let previous = table.get(&agent_id);
            if let Some(prev) = previous {
                record.registered_at = prev.registered_at;
            }
            let replaced = previous.is_some();
            table.insert(agent_id.clone(), record);
            (true, replaced)
        });
        info!(agent_id = %agent_id, replaced, "agent registered");
        self.emit(RegistryEvent::Registered(agent_id));
    }

    /// Record a heartbeat. Restores `active` unless the agent is still
    /// starting. A record stopped by the sweep comes back; one that was
    /// deregistered or announced its stop stays stopped until re-registered.
    pub fn heartbeat(&self, agent_id: &str, at: DateTime<Utc>) -> Result<(), RegistryError> {
        let revived = self.update(|table| match table.get_mut(agent_id) {
            Some(record)
                if record.status == AgentStatus::Stopped
                    && record.stop_reason != Some(StopReason::Overdue) =>
            {
                (false, Err(RegistryError::Stopped(agent_id.to_string())))
            }
            Some(record) => {
                record.last_heartbeat_at = record.last_heartbeat_at.max(at);
                let revived = matches!(record.status, AgentStatus::Degraded | AgentStatus::Stopped);
                if record.status != AgentStatus::Starting {
                    record.status = AgentStatus::Active;
                }
                record.stop_reason = None;
                (true, Ok(revived))
            }
            None => (false, Err(RegistryError::UnknownAgent(agent_id.to_string()))),
        })?;
        if revived {
            info!(agent_id, "agent active again");
            self.emit(RegistryEvent::Registered(agent_id.to_string()));
        } else {
            debug!(agent_id, "heartbeat");
        }
        Ok(())
    }

    /// Set the status directly, e.g. `starting` → `active` once an agent's
    /// runtime is listening. Setting `stopped` counts as a deregistration.
    pub fn set_status(&self, agent_id: &str, status: AgentStatus) -> Result<(), RegistryError> {
        if status == AgentStatus::Stopped {
            return self.stop(agent_id, StopReason::Deregistered, None);
        }
        self.update(|table| match table.get_mut(agent_id) {
            Some(record) => {
                record.status = status;
                record.stop_reason = None;
                (true, Ok(()))
            }
            None => (false, Err(RegistryError::UnknownAgent(agent_id.to_string()))),
        })
    }

    /// Mark an agent `stopped`. Dispatches to it fail until it is registered
    /// again; its heartbeats no longer revive it.
    pub fn deregister(&self, agent_id: &str) -> Result<(), RegistryError> {
        self.stop(agent_id, StopReason::Deregistered, None)?;
        info!(agent_id, "agent deregistered");
        Ok(())
    }

    /// Apply an agent's own `stopped` heartbeat sent at `at`. An earlier
    /// deregistration keeps its reason.
    pub fn announce_stopped(&self, agent_id: &str, at: DateTime<Utc>) -> Result<(), RegistryError> {
        self.stop(agent_id, StopReason::Announced, Some(at))
    }

    fn stop(&self, agent_id: &str, reason: StopReason, at: Option<DateTime<Utc>>) -> Result<(), RegistryError> {
        self.update(|table| match table.get_mut(agent_id) {
            Some(record) => {
                if let Some(at) = at {
                    record.last_heartbeat_at = record.last_heartbeat_at.max(at);
                }
                let keep = record.status == AgentStatus::Stopped
                    && record.stop_reason == Some(StopReason::Deregistered);
                if !keep {
                    record.stop_reason = Some(reason);
                }
                record.status = AgentStatus::Stopped;
                (true, Ok(()))
            }
            None => (false, Err(RegistryError::UnknownAgent(agent_id.to_string()))),
        })?;
        self.emit(RegistryEvent::Unavailable(agent_id.to_string()));
        Ok(())
    }

    /// Drop the record entirely (operator delete).
    pub fn remove(&self, agent_id: &str) -> Result<AgentRecord, RegistryError> {
        let removed = self.update(|table| match table.remove(agent_id) {
            Some(record) => (true, Ok(record)),
            None => (false, Err(RegistryError::NotFound(agent_id.to_string()))),
        })?;
        info!(agent_id, "agent removed");
        self.emit(RegistryEvent::Unavailable(agent_id.to_string()));
        Ok(removed)
    }

    pub fn get(&self, agent_id: &str) -> Result<AgentRecord, RegistryError> {
        self.snapshot()
            .get(agent_id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(agent_id.to_string()))
    }

    /// Agents that are starting, active or degraded, ordered by id.
    pub fn list_active(&self) -> Vec<AgentRecord> {
        let mut records: Vec<AgentRecord> =
            self.snapshot().values().filter(|r| r.status.is_live()).cloned().collect();
        records.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        records
    }

    /// Every record including stopped ones, ordered by id.
    pub fn list_all(&self) -> Vec<AgentRecord> {
        let mut records: Vec<AgentRecord> = self.snapshot().values().cloned().collect();
        records.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        records
    }

    /// Apply the liveness thresholds as of `now`.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<Transition> {
        let liveness = self.inner.liveness;
        let transitions = self.update(|table| {
            let mut transitions = Vec::new();
            for record in table.values_mut().filter(|r| r.status.is_live()) {
                let age = now.signed_duration_since(record.last_heartbeat_at);
                if let Some(to) = liveness.evaluate(record.status, age) {
                    transitions.push(Transition {
                        agent_id: record.agent_id.clone(),
                        from: record.status,
                        to,
                    });
                    record.status = to;
                    if to == AgentStatus::Stopped {
                        record.stop_reason = Some(StopReason::Overdue);
                    }
                }
            }
            transitions.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
            (!transitions.is_empty(), transitions)
        });

        for t in &transitions {
            warn!(agent_id = %t.agent_id, from = %t.from, to = %t.to, "agent heartbeat overdue");
            if t.to == AgentStatus::Stopped {
                self.emit(RegistryEvent::Unavailable(t.agent_id.clone()));
            }
        }
        transitions
    }

    /// Check the signature of an envelope whose sender advertised a key.
    /// Senders without a registered key are accepted as-is.
    pub fn verify_envelope(&self, envelope: &Envelope) -> Result<(), EnvelopeError> {
        match self.snapshot().get(envelope.sender_id()).and_then(|r| r.public_key.as_deref()) {
            Some(key) => envelope.verify(key),
            None => Ok(()),
        }
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new(Liveness::default())
    }
}
