//! Health aggregator: combines agent liveness with bus reachability.
//!
//! Reads are cheap: [`HealthAggregator::snapshot`] takes a registry snapshot
//! and runs one bus probe. The aggregator also owns the periodic sweep that
//! ages agents into `degraded`/`stopped`; nothing else applies the liveness
//! thresholds.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{BusClient, Payload};
use crate::registry::{AgentRegistry, AgentStatus};

// ── HealthStatus ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Bus reachable, fewer live agents than required.
    Degraded,
    /// Bus unreachable.
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

// ── HealthSnapshot ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct AgentHealth {
    pub agent_id: String,
    pub display_name: String,
    pub status: AgentStatus,
    pub last_heartbeat_at: DateTime<Utc>,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub active_agents: usize,
    pub bus_reachable: bool,
    pub agents: Vec<AgentHealth>,
}

impl HealthSnapshot {
    /// External `{"status": ..., "active_agents": N}` shape.
    pub fn payload(&self) -> Payload {
        let mut payload = Payload::new();
        payload.insert("status".into(), Value::String(self.status.as_str().into()));
        payload.insert("active_agents".into(), json!(self.active_agents));
        payload
    }
}

// ── HealthAggregator ─────────────────────────────────────────────────────────

/// Read-only view over the registry and bus. Clone freely.
#[derive(Clone)]
pub struct HealthAggregator {
    registry: AgentRegistry,
    bus: BusClient,
    min_agents: usize,
}

impl HealthAggregator {
    pub fn new(registry: AgentRegistry, bus: BusClient, min_agents: usize) -> Self {
        Self { registry, bus, min_agents }
    }

    pub async fn snapshot(&self) -> HealthSnapshot {
        let bus_reachable = match self.bus.probe().await {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "bus probe failed");
                false
            }
        };
        let agents: Vec<AgentHealth> = self
            .registry
            .list_active()
            .into_iter()
            .map(|r| AgentHealth {
                capabilities: r.capabilities.iter().map(|c| c.name.clone()).collect(),
                agent_id: r.agent_id,
                display_name: r.display_name,
                status: r.status,
                last_heartbeat_at: r.last_heartbeat_at,
            })
            .collect();
        let active_agents = agents.len();

        let status = if !bus_reachable {
            HealthStatus::Unhealthy
        } else if active_agents < self.min_agents {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        HealthSnapshot { status, active_agents, bus_reachable, agents }
    }

    pub async fn payload(&self) -> Payload {
        self.snapshot().await.payload()
    }

    /// Sweep the registry every `interval` until `shutdown` fires.
    pub fn spawn_sweeper(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let registry = self.registry.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = interval.as_millis() as u64, "registry sweeper started");
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let transitions = registry.sweep(Utc::now());
                        if !transitions.is_empty() {
                            warn!(count = transitions.len(), "sweep changed agent status");
                        }
                    }
                }
            }
            debug!("registry sweeper stopped");
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryTransport;
    use crate::config::BusConfig;
    use crate::registry::{AgentRecord, Capability, Liveness};
    use chrono::TimeDelta;
    use std::sync::Arc;

    async fn setup(min_agents: usize) -> (Arc<MemoryTransport>, AgentRegistry, HealthAggregator) {
        let transport = Arc::new(MemoryTransport::new(8));
        let config = BusConfig {
            channel_prefix: "agentic".into(),
            buffer: 8,
            publish_attempts: 1,
            publish_backoff: Duration::from_millis(1),
        };
        let bus = BusClient::connect(transport.clone(), &config, None, CancellationToken::new())
            .await
            .unwrap();
        let registry = AgentRegistry::default();
        let health = HealthAggregator::new(registry.clone(), bus, min_agents);
        (transport, registry, health)
    }

    fn active(id: &str) -> AgentRecord {
        AgentRecord::new(id, id, Utc::now())
            .with_status(AgentStatus::Active)
            .with_capabilities([Capability::new("echo", "")])
    }

    #[tokio::test]
    async fn healthy_with_no_agents_by_default() {
        let (_t, _reg, health) = setup(0).await;
        let payload = health.payload().await;
        assert_eq!(Value::Object(payload), json!({"status": "healthy", "active_agents": 0}));
    }

    #[tokio::test]
    async fn counts_live_agents_only() {
        let (_t, reg, health) = setup(0).await;
        for id in ["a", "b", "c", "d"] {
            reg.register(active(id));
        }
        reg.deregister("d").unwrap();

        let snap = health.snapshot().await;
        assert_eq!(snap.status, HealthStatus::Healthy);
        assert_eq!(snap.active_agents, 3);
        assert_eq!(snap.agents[0].capabilities, ["echo"]);
        assert_eq!(Value::Object(snap.payload()), json!({"status": "healthy", "active_agents": 3}));
    }

    #[tokio::test]
    async fn below_minimum_is_degraded() {
        let (_t, reg, health) = setup(2).await;
        reg.register(active("a"));
        assert_eq!(health.snapshot().await.status, HealthStatus::Degraded);
        reg.register(active("b"));
        assert_eq!(health.snapshot().await.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn unreachable_bus_is_unhealthy() {
        let (transport, reg, health) = setup(0).await;
        reg.register(active("a"));
        transport.disconnect();
        let snap = health.snapshot().await;
        assert_eq!(snap.status, HealthStatus::Unhealthy);
        assert!(!snap.bus_reachable);
        assert_eq!(snap.active_agents, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_ages_silent_agents() {
        let transport = Arc::new(MemoryTransport::new(8));
        let config = BusConfig {
            channel_prefix: "agentic".into(),
            buffer: 8,
            publish_attempts: 1,
            publish_backoff: Duration::from_millis(1),
        };
        let bus = BusClient::connect(transport, &config, None, CancellationToken::new())
            .await
            .unwrap();
        let registry = AgentRegistry::new(Liveness {
            heartbeat_interval: Duration::from_secs(1),
            degraded_multiplier: 3,
            stopped_multiplier: 10,
        });
        let mut stale = active("stale");
        stale.last_heartbeat_at = Utc::now() - TimeDelta::seconds(60);
        registry.register(stale);
        registry.register(active("fresh"));

        let shutdown = CancellationToken::new();
        let health = HealthAggregator::new(registry.clone(), bus, 0);
        let sweeper = health.spawn_sweeper(Duration::from_millis(100), shutdown.clone());
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(registry.get("stale").unwrap().status, AgentStatus::Stopped);
        assert_eq!(registry.get("fresh").unwrap().status, AgentStatus::Active);
        assert_eq!(health.snapshot().await.active_agents, 1);

        shutdown.cancel();
        sweeper.await.unwrap();
    }
}
