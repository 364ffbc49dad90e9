//! Presence: keeping the registry in step with heartbeats seen on the bus.
//!
//! Agents broadcast a [`HeartbeatPayload`] every heartbeat interval. The
//! listener turns those into registry writes: a first heartbeat registers
//! the agent, later ones refresh it, and a `stopped` heartbeat marks it
//! stopped. Once a record carries a public key, heartbeats for that id must
//! be signed with it.

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{Envelope, MessageType, Payload, Subscription};

use super::{AgentRecord, AgentRegistry, AgentStatus, Capability, RegistryError, StopReason};

/// Body of a `HEARTBEAT` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub display_name: String,
    pub status: AgentStatus,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// Handlers running when the heartbeat was sent.
    #[serde(default)]
    pub active_tasks: usize,
}

impl HeartbeatPayload {
    pub fn to_payload(&self) -> Payload {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => Payload::new(),
        }
    }

    pub fn from_payload(payload: &Payload) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::Value::Object(payload.clone()))
    }
}

/// Apply one heartbeat envelope to `registry`. Anything that is not a
/// well-formed heartbeat is ignored with a log line.
pub fn apply_heartbeat(registry: &AgentRegistry, envelope: &Envelope) {
    if envelope.message_type() != MessageType::Heartbeat {
        return;
    }
    let agent_id = envelope.sender_id();
    let beat = match HeartbeatPayload::from_payload(envelope.payload()) {
        Ok(beat) => beat,
        Err(e) => {
            warn!(agent_id, error = %e, "ignoring malformed heartbeat");
            return;
        }
    };

    // A heartbeat must be signed by the key it advertises.
    if let Some(key) = beat.public_key.as_deref() {
        if let Err(e) = envelope.verify(key) {
            warn!(agent_id, error = %e, "ignoring heartbeat with bad signature");
            return;
        }
    }

    let existing = registry.get(agent_id).ok();

    // Once a key is on record only that key speaks for the agent. A stopped
    // agent may come back under a new key, but not without one.
    if let Some(record) = &existing {
        if let Some(key) = record.public_key.as_deref() {
            let rotating = record.status == AgentStatus::Stopped && beat.status != AgentStatus::Stopped;
            let trusted = if rotating { beat.public_key.is_some() } else { envelope.verify(key).is_ok() };
            if !trusted {
                warn!(agent_id, status = %beat.status, "ignoring heartbeat not signed by the registered key");
                return;
            }
        }
    }

    if beat.status == AgentStatus::Stopped {
        match registry.announce_stopped(agent_id, envelope.timestamp()) {
            Ok(()) => info!(agent_id, "agent announced shutdown"),
            Err(RegistryError::UnknownAgent(_)) => debug!(agent_id, "stop from unknown agent"),
            Err(e) => warn!(agent_id, error = %e, "deregister failed"),
        }
        return;
    }

    if let Some(record) = existing.as_ref().filter(|r| r.status == AgentStatus::Stopped) {
        // Deregistration holds until the agent is registered again.
        if record.stop_reason == Some(StopReason::Deregistered) {
            debug!(agent_id, "ignoring heartbeat from deregistered agent");
            return;
        }
        // A heartbeat sent before the agent stopped can arrive after it did.
        if envelope.timestamp() <= record.last_heartbeat_at {
            debug!(agent_id, "ignoring stale heartbeat from stopped agent");
            return;
        }
    }

    let refreshed_in_place = existing.is_some_and(|existing| {
        (existing.status == beat.status || existing.status == AgentStatus::Degraded)
            && existing.public_key == beat.public_key
            && existing.display_name == beat.display_name
            && existing.capabilities.len() == beat.capabilities.len()
    });

    if refreshed_in_place {
        if let Err(e) = registry.heartbeat(agent_id, envelope.timestamp()) {
            warn!(agent_id, error = %e, "heartbeat rejected");
        }
    } else {
        let mut record = AgentRecord::new(agent_id, beat.display_name, envelope.timestamp())
            .with_capabilities(beat.capabilities)
            .with_public_key(beat.public_key)
            .with_status(beat.status);
        record.last_heartbeat_at = envelope.timestamp();
        registry.register(record);
    }
}

/// Run a presence listener on a broadcast subscription until it ends.
pub fn spawn_listener(registry: AgentRegistry, mut subscription: Subscription) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!(channel = %subscription.channel(), "presence listener started");
        while let Some(envelope) = subscription.recv().await {
            apply_heartbeat(&registry, &envelope);
        }
        debug!("presence listener stopped");
    })
}
