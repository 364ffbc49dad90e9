//! Supervisor: the process-wide context object.
//!
//! Owns the transport, bus client, agent registry, task dispatcher, health
//! aggregator and the shared shutdown token, plus the background tasks that
//! keep them running:
//!
//! - dispatcher reply listener
//! - presence listener (heartbeats on the broadcast channel → registry)
//! - registry sweeper (liveness thresholds)
//! - one runtime per locally hosted agent
//!
//! Nothing here is global; build one with [`Supervisor::init`] and tear it
//! down with [`Supervisor::shutdown`].

pub mod health;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agents::{self, AgentHandle, AgentRuntime, AgentSpec};
use crate::bus::{BusClient, MemoryTransport, Origin, Payload};
use crate::config::{AgentsConfig, Config};
use crate::dispatch::{DispatchError, DispatchStats, TaskDispatcher, TaskOutcome};
use crate::error::AppError;
use crate::identity::Identity;
use crate::registry::{AgentRecord, AgentRegistry, Liveness, RegistryError, presence};

use health::{HealthAggregator, HealthSnapshot};

pub struct Supervisor {
    transport: Arc<MemoryTransport>,
    bus: BusClient,
    registry: AgentRegistry,
    dispatcher: TaskDispatcher,
    health: HealthAggregator,
    agent_settings: AgentsConfig,
    agents: Vec<AgentHandle>,
    background: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl Supervisor {
    /// Start the core with an ephemeral dispatcher identity.
    pub async fn init(config: &Config) -> Result<Self, AppError> {
        Self::init_with_identity(config, Identity::ephemeral()).await
    }

    /// Start the core; the dispatcher signs its requests with `identity`.
    pub async fn init_with_identity(config: &Config, identity: Identity) -> Result<Self, AppError> {
        let shutdown = CancellationToken::new();

        let mut transport = MemoryTransport::new(config.bus.buffer);
        if let Some(password) = &config.bus_password {
            transport = transport.with_password(password.clone());
        }
        let transport = Arc::new(transport);
        let bus = BusClient::connect(
            transport.clone(),
            &config.bus,
            config.bus_password.as_deref(),
            shutdown.clone(),
        )
        .await?;

        let registry = AgentRegistry::new(Liveness::from_config(&config.agents, &config.health));

        let origin = Origin::new(config.dispatcher_id.clone())?.with_identity(identity);
        let (dispatcher, listener) = TaskDispatcher::start(
            bus.clone(),
            registry.clone(),
            origin,
            config.dispatch.default_timeout_seconds,
        )
        .await?;

        let presence = presence::spawn_listener(
            registry.clone(),
            bus.subscribe(&bus.channels().broadcast()).await?,
        );

        let health = HealthAggregator::new(registry.clone(), bus.clone(), config.health.min_agents);
        let sweeper = health.spawn_sweeper(config.health.sweep_interval, shutdown.clone());

        info!(
            dispatcher_id = %config.dispatcher_id,
            channel_prefix = %config.bus.channel_prefix,
            default_timeout_seconds = config.dispatch.default_timeout_seconds,
            "supervisor ready"
        );

        Ok(Self {
            transport,
            bus,
            registry,
            dispatcher,
            health,
            agent_settings: config.agents.clone(),
            agents: Vec::new(),
            background: vec![listener, presence, sweeper],
            shutdown,
        })
    }

    // ── Agents ───────────────────────────────────────────────────────────────

    /// Run `spec` in this process. Returns once the agent is registered and
    /// listening.
    pub async fn spawn_agent(&mut self, spec: AgentSpec) -> Result<String, AppError> {
        if self.agents.iter().any(|h| h.agent_id() == spec.agent_id) {
            return Err(AppError::Agent(format!("agent '{}' is already running", spec.agent_id)));
        }
        let handle = AgentRuntime::spawn(
            spec,
            self.bus.clone(),
            self.registry.clone(),
            &self.agent_settings,
            &self.shutdown,
        )
        .await?;
        let agent_id = handle.agent_id().to_string();
        self.agents.push(handle);
        Ok(agent_id)
    }

    /// Spawn every built-in agent enabled in `[agents.*]`.
    pub async fn spawn_builtin_agents(&mut self) -> Result<Vec<String>, AppError> {
        let mut started = Vec::new();
        for entry in self.agent_settings.builtin.clone() {
            match agents::builtin(&entry.name, &entry.agent_id) {
                Some(spec) => started.push(self.spawn_agent(spec).await?),
                None => warn!(agent = %entry.name, "agent plugin not compiled in; skipping"),
            }
        }
        Ok(started)
    }

    /// Stop one locally hosted agent and wait for it to deregister.
    pub async fn stop_agent(&mut self, agent_id: &str) -> Result<(), AppError> {
        let idx = self
            .agents
            .iter()
            .position(|h| h.agent_id() == agent_id)
            .ok_or_else(|| RegistryError::NotFound(agent_id.to_string()))?;
        self.agents.swap_remove(idx).stop().await;
        Ok(())
    }

    pub fn local_agents(&self) -> &[AgentHandle] {
        &self.agents
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    /// Dispatch a task; `None` uses the configured default timeout.
    pub async fn send_task(
        &self,
        recipient_id: &str,
        task_type: &str,
        payload: Payload,
        timeout_seconds: Option<f64>,
    ) -> Result<TaskOutcome, DispatchError> {
        let timeout = timeout_seconds.unwrap_or_else(|| self.dispatcher.default_timeout_seconds());
        self.dispatcher.send_task(recipient_id, task_type, payload, timeout).await
    }

    pub fn list_active_agents(&self) -> Vec<AgentRecord> {
        self.registry.list_active()
    }

    pub fn get_agent(&self, agent_id: &str) -> Result<AgentRecord, RegistryError> {
        self.registry.get(agent_id)
    }

    pub async fn health_snapshot(&self) -> HealthSnapshot {
        self.health.snapshot().await
    }

    pub fn dispatch_stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    pub fn dispatcher(&self) -> &TaskDispatcher {
        &self.dispatcher
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn bus(&self) -> &BusClient {
        &self.bus
    }

    pub fn transport(&self) -> &Arc<MemoryTransport> {
        &self.transport
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    // ── Teardown ─────────────────────────────────────────────────────────────

    /// Stop local agents gracefully, then every background task.
    pub async fn shutdown(mut self) {
        info!(agents = self.agents.len(), "supervisor shutting down");
        let stops: Vec<_> = self.agents.drain(..).map(|h| tokio::spawn(h.stop())).collect();
        for stop in stops {
            let _ = stop.await;
        }
        self.shutdown.cancel();
        for task in self.background.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "background task failed");
            }
        }
        info!("supervisor stopped");
    }
}
