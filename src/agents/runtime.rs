//! Agent runtime: one event loop per agent.
//!
//! ```text
//!            ┌── stop token ──────────────► Stopping ─► Stopped
//! loop  ─────┼── heartbeat tick ──────────► publish HEARTBEAT (Active ⇄ Degraded)
//!            ├── handler finished ────────► reap
//!            ├── broadcast channel ───────► peer heartbeats → registry
//!            └── permit + own channel ────► TASK_REQUEST → handler → reply
//! ```
//!
//! The request branch only pulls from the agent channel once a concurrency
//! permit is free, so a saturated agent applies backpressure while it keeps
//! heartbeating. Handlers run on a [`JoinSet`]; errors and panics become
//! `TASK_ERROR` replies and never reach the loop.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{BusClient, Envelope, MessageType, Origin, Payload, Subscription};
use crate::config::AgentsConfig;
use crate::error::AppError;
use crate::identity::Identity;
use crate::registry::presence::{self, HeartbeatPayload};
use crate::registry::{AgentRecord, AgentRegistry, AgentStatus, RegistryError};

use super::rate_limit::RateLimiter;
use super::{AgentSpec, TaskContext, TaskError};

// ── State ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Starting,
    Active,
    /// Heartbeats are not getting out; requests are still served.
    Degraded,
    Stopping,
    Stopped,
}

impl RuntimeState {
    pub fn as_str(self) -> &'static str {
        match self {
            RuntimeState::Starting => "starting",
            RuntimeState::Active => "active",
            RuntimeState::Degraded => "degraded",
            RuntimeState::Stopping => "stopping",
            RuntimeState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── AgentHandle ──────────────────────────────────────────────────────────────

/// Owner's handle to a running agent.
pub struct AgentHandle {
    agent_id: String,
    public_key: String,
    state: watch::Receiver<RuntimeState>,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl AgentHandle {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Hex ed25519 key the agent signs its envelopes with.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn state(&self) -> RuntimeState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<RuntimeState> {
        self.state.clone()
    }

    /// Ask the runtime to stop without waiting for it.
    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    /// Stop gracefully and wait until the runtime has deregistered.
    pub async fn stop(self) {
        self.stop.cancel();
        if let Err(e) = self.task.await {
            warn!(agent_id = %self.agent_id, error = %e, "agent runtime task failed");
        }
    }
}

// ── AgentRuntime ─────────────────────────────────────────────────────────────

pub struct AgentRuntime {
    spec: Arc<AgentSpec>,
    origin: Arc<Origin>,
    public_key: String,
    bus: BusClient,
    registry: AgentRegistry,
    heartbeat_interval: Duration,
    grace_period: Duration,
    permits: Option<Arc<Semaphore>>,
    limiter: Option<RateLimiter>,
    state: watch::Sender<RuntimeState>,
    inflight: JoinSet<()>,
}

impl AgentRuntime {
    /// Start `spec` as a live agent.
    ///
    /// Returns once the agent is subscribed to its channel and the broadcast
    /// channel, registered, and has sent its first heartbeat. The runtime
    /// stops when the handle asks it to or `shutdown` fires.
    pub async fn spawn(
        spec: AgentSpec,
        bus: BusClient,
        registry: AgentRegistry,
        settings: &AgentsConfig,
        shutdown: &CancellationToken,
    ) -> Result<AgentHandle, AppError> {
        let identity = Identity::ephemeral();
        let public_key = identity.public_key_hex();
        let origin = Origin::new(spec.agent_id.clone())?.with_identity(identity);
        let (state_tx, state_rx) = watch::channel(RuntimeState::Starting);

        let inbox = bus.subscribe(&bus.channels().agent(&spec.agent_id)).await?;
        let broadcast = bus.subscribe(&bus.channels().broadcast()).await?;

        let mut runtime = Self {
            spec: Arc::new(spec),
            origin: Arc::new(origin),
            public_key: public_key.clone(),
            bus,
            registry,
            heartbeat_interval: settings.heartbeat_interval,
            grace_period: settings.grace_period,
            permits: (settings.max_concurrent_tasks > 0)
                .then(|| Arc::new(Semaphore::new(settings.max_concurrent_tasks))),
            limiter: RateLimiter::new(settings.rate_limit_requests, settings.rate_limit_window),
            state: state_tx,
            inflight: JoinSet::new(),
        };

        runtime.registry.register(runtime.record(Utc::now()));
        runtime.heartbeat().await;

        let agent_id = runtime.spec.agent_id.clone();
        info!(
            agent_id = %agent_id,
            task_types = runtime.spec.capabilities().len(),
            max_concurrent = settings.max_concurrent_tasks,
            "agent started"
        );

        let stop = shutdown.child_token();
        let task = tokio::spawn(runtime.run(inbox, broadcast, stop.clone()));
        Ok(AgentHandle { agent_id, public_key, state: state_rx, stop, task })
    }

    fn agent_id(&self) -> &str {
        &self.spec.agent_id
    }

    fn record(&self, now: DateTime<Utc>) -> AgentRecord {
        AgentRecord::new(self.agent_id(), self.spec.display_name.as_str(), now)
            .with_capabilities(self.spec.capabilities())
            .with_public_key(Some(self.public_key.clone()))
    }

    /// Move between live states; `Stopping`/`Stopped` are only entered on shutdown.
    fn set_live_state(&self, next: RuntimeState) {
        self.state.send_if_modified(|current| {
            let live = matches!(current, RuntimeState::Starting | RuntimeState::Active | RuntimeState::Degraded);
            if live && *current != next {
                info!(agent_id = %self.spec.agent_id, from = %current, to = %next, "agent state changed");
                *current = next;
                true
            } else {
                false
            }
        });
    }

    async fn run(mut self, mut inbox: Subscription, mut broadcast: Subscription, stop: CancellationToken) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.heartbeat_interval, self.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let permits = self.permits.clone();

        'serve: loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    // Publish retries can run long while the bus is down.
                    tokio::select! {
                        biased;
                        _ = stop.cancelled() => break 'serve,
                        _ = self.heartbeat() => {}
                    }
                    if let Some(limiter) = self.limiter.as_mut() {
                        limiter.prune(Instant::now());
                    }
                }
                Some(joined) = self.inflight.join_next(), if !self.inflight.is_empty() => {
                    if let Err(e) = joined {
                        warn!(agent_id = %self.spec.agent_id, error = %e, "handler task failed");
                    }
                }
                envelope = broadcast.recv() => match envelope {
                    Some(envelope) => self.on_broadcast(&envelope),
                    None => break,
                },
                next = next_request(permits.as_ref(), &mut inbox) => match next {
                    Some((envelope, permit)) => self.on_request(envelope, permit),
                    None => break,
                },
            }
        }

        self.shutdown(inbox, broadcast).await;
    }

    // ── Heartbeats ───────────────────────────────────────────────────────────

    async fn heartbeat(&mut self) {
        let next = if self.publish_heartbeat(AgentStatus::Active).await {
            RuntimeState::Active
        } else {
            RuntimeState::Degraded
        };
        self.set_live_state(next);
    }

    /// Broadcast a heartbeat; `true` if the bus accepted it.
    async fn publish_heartbeat(&self, status: AgentStatus) -> bool {
        let beat = HeartbeatPayload {
            display_name: self.spec.display_name.clone(),
            status,
            capabilities: self.spec.capabilities(),
            public_key: Some(self.public_key.clone()),
            active_tasks: self.inflight.len(),
        };
        let envelope = match self.origin.heartbeat(beat.to_payload()) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(agent_id = %self.spec.agent_id, error = %e, "could not build heartbeat");
                return false;
            }
        };
        match self.bus.send(&envelope).await {
            Ok(_) => {
                if status != AgentStatus::Stopped {
                    self.refresh_registry(envelope.timestamp());
                }
                true
            }
            Err(e) => {
                warn!(agent_id = %self.spec.agent_id, error = %e, "heartbeat publish failed");
                false
            }
        }
    }

    fn refresh_registry(&self, at: DateTime<Utc>) {
        let agent_id = self.agent_id();
        match self.registry.get(agent_id) {
            Ok(record) => {
                if record.status == AgentStatus::Starting {
                    let _ = self.registry.set_status(agent_id, AgentStatus::Active);
                }
                // A deregistered record stays stopped until it is registered again.
                match self.registry.heartbeat(agent_id, at) {
                    Ok(()) => {}
                    Err(RegistryError::Stopped(_)) => debug!(agent_id, "deregistered; heartbeat not recorded"),
                    Err(e) => debug!(agent_id, error = %e, "registry heartbeat failed"),
                }
            }
            // Removed by an operator while running; put it back.
            Err(_) => self.registry.register(self.record(at).with_status(AgentStatus::Active)),
        }
    }

    fn on_broadcast(&self, envelope: &Envelope) {
        if envelope.sender_id() != self.agent_id() {
            presence::apply_heartbeat(&self.registry, envelope);
        }
    }

    // ── Requests ─────────────────────────────────────────────────────────────

    fn on_request(&mut self, request: Envelope, permit: Option<OwnedSemaphorePermit>) {
        if request.message_type() != MessageType::TaskRequest {
            debug!(agent_id = %self.spec.agent_id, message_type = %request.message_type(), "ignoring non-request");
            return;
        }
        if request.is_expired(Utc::now()) {
            debug!(agent_id = %self.spec.agent_id, message_id = %request.message_id(), "dropping expired request");
            return;
        }
        if let Err(e) = self.registry.verify_envelope(&request) {
            warn!(agent_id = %self.spec.agent_id, error = %e, "dropping request with bad signature");
            return;
        }

        let task_type = request.task_type().unwrap_or_default().to_string();
        let requester_id = request.sender_id().to_string();

        if let Some(limiter) = self.limiter.as_mut() {
            if !limiter.check(&requester_id, Instant::now()) {
                warn!(agent_id = %self.spec.agent_id, requester_id = %requester_id, "rate limit exceeded");
                let err = TaskError::with_kind(
                    TaskError::RATE_LIMITED,
                    format!("Rate limit exceeded for '{requester_id}'"),
                );
                self.spawn_reply(request, Err(err), permit);
                return;
            }
        }

        let Some(handler) = self.spec.handler(&task_type) else {
            debug!(agent_id = %self.spec.agent_id, task_type = %task_type, "unsupported task type");
            let err = TaskError::with_kind(
                TaskError::UNKNOWN_TASK_TYPE,
                format!("Capability '{task_type}' not supported"),
            );
            self.spawn_reply(request, Err(err), permit);
            return;
        };

        debug!(
            agent_id = %self.spec.agent_id,
            requester_id = %requester_id,
            task_type = %task_type,
            message_id = %request.message_id(),
            "handling task"
        );
        let ctx = TaskContext {
            agent_id: self.spec.agent_id.clone(),
            requester_id,
            correlation_id: request.message_id().to_string(),
            task_type,
        };
        let origin = self.origin.clone();
        let bus = self.bus.clone();
        self.inflight.spawn(async move {
            let _permit = permit;
            let payload = request.payload().clone();
            // The handler is called inside the guarded future so a panic
            // while building its future is caught too.
            let result = AssertUnwindSafe(async move { handler.handle(ctx, payload).await })
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(TaskError::with_kind(TaskError::HANDLER_PANIC, panic_message(panic.as_ref())))
                });
            send_reply(&origin, &bus, &request, result).await;
        });
    }

    fn spawn_reply(
        &mut self,
        request: Envelope,
        result: Result<Payload, TaskError>,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        let origin = self.origin.clone();
        let bus = self.bus.clone();
        self.inflight.spawn(async move {
            let _permit = permit;
            send_reply(&origin, &bus, &request, result).await;
        });
    }

    // ── Shutdown ─────────────────────────────────────────────────────────────

    async fn shutdown(mut self, inbox: Subscription, broadcast: Subscription) {
        self.state.send_replace(RuntimeState::Stopping);
        inbox.unsubscribe();
        broadcast.unsubscribe();
        drop((inbox, broadcast));

        if !self.inflight.is_empty() {
            info!(agent_id = %self.spec.agent_id, in_flight = self.inflight.len(), "draining in-flight tasks");
            let inflight = &mut self.inflight;
            let drained = tokio::time::timeout(self.grace_period, async {
                while inflight.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(
                    agent_id = %self.spec.agent_id,
                    aborted = self.inflight.len(),
                    "grace period elapsed; aborting handlers"
                );
                self.inflight.shutdown().await;
            }
        }

        if let Err(e) = self.registry.deregister(&self.spec.agent_id) {
            debug!(agent_id = %self.spec.agent_id, error = %e, "deregister on stop");
        }
        if tokio::time::timeout(self.grace_period, self.publish_heartbeat(AgentStatus::Stopped))
            .await
            .is_err()
        {
            warn!(agent_id = %self.spec.agent_id, "gave up announcing shutdown");
        }
        self.state.send_replace(RuntimeState::Stopped);
        info!(agent_id = %self.spec.agent_id, "agent stopped");
    }
}

/// Wait for a concurrency permit, then for the next envelope on `inbox`.
/// Cancel-safe: a permit taken before cancellation is simply released.
async fn next_request(
    permits: Option<&Arc<Semaphore>>,
    inbox: &mut Subscription,
) -> Option<(Envelope, Option<OwnedSemaphorePermit>)> {
    let permit = match permits {
        Some(semaphore) => Some(semaphore.clone().acquire_owned().await.ok()?),
        None => None,
    };
    let envelope = inbox.recv().await?;
    Some((envelope, permit))
}

async fn send_reply(origin: &Origin, bus: &BusClient, request: &Envelope, result: Result<Payload, TaskError>) {
    let reply = match result {
        Ok(payload) => origin.response(request, payload),
        Err(e) => {
            info!(
                agent_id = %origin.sender_id(),
                correlation_id = %request.message_id(),
                kind = %e.kind,
                error = %e.message,
                "task failed"
            );
            origin.error(request, e.to_payload())
        }
    };
    let reply = match reply {
        Ok(reply) => reply,
        Err(e) => {
            warn!(agent_id = %origin.sender_id(), error = %e, "could not build reply");
            return;
        }
    };
    match bus.send(&reply).await {
        Ok(0) => debug!(
            agent_id = %origin.sender_id(),
            recipient_id = %reply.recipient_id(),
            "reply had no listener"
        ),
        Ok(_) => {}
        Err(e) => warn!(agent_id = %origin.sender_id(), error = %e, "reply publish failed"),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::handler_fn;
    use crate::bus::MemoryTransport;
    use crate::config::Config;
    use crate::dispatch::{TaskDispatcher, TaskOutcome};
    use crate::registry::Capability;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        transport: Arc<MemoryTransport>,
        bus: BusClient,
        registry: AgentRegistry,
        dispatcher: TaskDispatcher,
        settings: AgentsConfig,
        shutdown: CancellationToken,
    }

    async fn fixture() -> Fixture {
        fixture_with(|_| {}).await
    }

    async fn fixture_with(tune: impl FnOnce(&mut Config)) -> Fixture {
        let mut config = Config::test_default(std::path::Path::new("."));
        tune(&mut config);
        let transport = Arc::new(MemoryTransport::new(config.bus.buffer));
        let shutdown = CancellationToken::new();
        let bus = BusClient::connect(transport.clone(), &config.bus, None, shutdown.clone())
            .await
            .unwrap();
        let registry = AgentRegistry::default();
        let (dispatcher, _) =
            TaskDispatcher::start(bus.clone(), registry.clone(), Origin::new("api-server").unwrap(), 5.0)
                .await
                .unwrap();
        Fixture { transport, bus, registry, dispatcher, settings: config.agents, shutdown }
    }

    fn obj(v: serde_json::Value) -> Payload {
        v.as_object().cloned().unwrap()
    }

    fn test_spec() -> AgentSpec {
        AgentSpec::new("worker", "Worker")
            .capability(
                Capability::new("ping", "reply pong"),
                handler_fn(|ctx, _p| async move { Ok(obj(json!({"pong": ctx.requester_id}))) }),
            )
            .capability(
                Capability::new("fail", "always fails"),
                handler_fn(|_c, _p| async { Err(TaskError::new("nope")) }),
            )
            .capability(
                Capability::new("panic", "always panics"),
                handler_fn(|_c, p: Payload| async move {
                    if p.is_empty() {
                        panic!("kaboom");
                    }
                    Ok(p)
                }),
            )
    }

    impl Fixture {
        async fn spawn(&self, spec: AgentSpec) -> AgentHandle {
            AgentRuntime::spawn(spec, self.bus.clone(), self.registry.clone(), &self.settings, &self.shutdown)
                .await
                .unwrap()
        }

        async fn failure_kind(&self, task: &str) -> String {
            match self.dispatcher.send_task("worker", task, Payload::new(), 5.0).await.unwrap() {
                TaskOutcome::Failed(f) => f.kind().unwrap_or_default().to_string(),
                other => panic!("expected failure, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn spawn_registers_and_goes_active() {
        let fx = fixture().await;
        let handle = fx.spawn(test_spec()).await;
        assert_eq!(handle.state(), RuntimeState::Active);

        let record = fx.registry.get("worker").unwrap();
        assert_eq!(record.status, AgentStatus::Active);
        assert!(record.has_capability("ping"));
        assert_eq!(record.public_key.as_deref(), Some(handle.public_key()));
        assert_eq!(fx.transport.subscriber_count("agentic:agent:worker"), 1);
    }

    #[tokio::test]
    async fn serves_requests_and_reports_failures() {
        let fx = fixture().await;
        let _handle = fx.spawn(test_spec()).await;

        let out = fx.dispatcher.call("worker", "ping", Payload::new(), 5.0).await.unwrap();
        assert_eq!(out, obj(json!({"pong": "api-server"})));

        assert_eq!(fx.failure_kind("fail").await, "execution_failed");
        assert_eq!(fx.failure_kind("missing").await, "unknown_task_type");
    }

    #[tokio::test]
    async fn handler_panic_is_contained() {
        let fx = fixture().await;
        let handle = fx.spawn(test_spec()).await;

        assert_eq!(fx.failure_kind("panic").await, "handler_panic");
        // Still serving afterwards.
        assert!(fx.dispatcher.call("worker", "ping", Payload::new(), 5.0).await.is_ok());
        assert_eq!(handle.state(), RuntimeState::Active);
    }

    #[tokio::test]
    async fn unknown_task_message_names_capability() {
        let fx = fixture().await;
        let _handle = fx.spawn(test_spec()).await;
        let TaskOutcome::Failed(f) =
            fx.dispatcher.send_task("worker", "fly", Payload::new(), 5.0).await.unwrap()
        else {
            panic!("expected failure");
        };
        assert_eq!(f.message(), "Capability 'fly' not supported");
    }

    #[tokio::test]
    async fn concurrency_limit_bounds_running_handlers() {
        let mut fx = fixture().await;
        fx.settings.max_concurrent_tasks = 2;
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (running.clone(), peak.clone());
        let spec = AgentSpec::new("worker", "Worker").capability(
            Capability::new("slow", ""),
            handler_fn(move |_c, _p| {
                let (running, peak) = (r.clone(), p.clone());
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(Payload::new())
                }
            }),
        );
        let _handle = fx.spawn(spec).await;

        let calls: Vec<_> = (0..6)
            .map(|_| {
                let d = fx.dispatcher.clone();
                tokio::spawn(async move { d.call("worker", "slow", Payload::new(), 5.0).await })
            })
            .collect();
        for call in calls {
            call.await.unwrap().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rate_limit_rejects_excess() {
        let mut fx = fixture().await;
        fx.settings.rate_limit_requests = 2;
        let _handle = fx.spawn(test_spec()).await;

        for _ in 0..2 {
            assert!(fx.dispatcher.call("worker", "ping", Payload::new(), 5.0).await.is_ok());
        }
        assert_eq!(fx.failure_kind("ping").await, "rate_limited");
    }

    #[tokio::test]
    async fn expired_request_is_dropped() {
        let fx = fixture().await;
        let _handle = fx.spawn(test_spec()).await;
        let mut replies = fx.bus.subscribe(&fx.bus.channels().agent("tester")).await.unwrap();
        let tester = Origin::new("tester").unwrap();

        let stale = tester.request("worker", "ping", Payload::new(), Some(0.001)).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        fx.bus.send(&stale).await.unwrap();
        let fresh = tester.request("worker", "ping", Payload::new(), None).unwrap();
        fx.bus.send(&fresh).await.unwrap();

        let reply = replies.recv().await.unwrap();
        assert_eq!(reply.correlation_id(), Some(fresh.message_id()));
    }

    #[tokio::test]
    async fn stop_deregisters_and_broadcasts() {
        let fx = fixture().await;
        let handle = fx.spawn(test_spec()).await;
        let mut broadcast = fx.bus.subscribe(&fx.bus.channels().broadcast()).await.unwrap();
        let watch = handle.watch_state();

        handle.stop().await;
        assert_eq!(*watch.borrow(), RuntimeState::Stopped);
        assert_eq!(fx.registry.get("worker").unwrap().status, AgentStatus::Stopped);

        let beat = broadcast.recv().await.unwrap();
        assert_eq!(beat.sender_id(), "worker");
        assert_eq!(beat.payload()["status"], json!("stopped"));
    }

    #[tokio::test(start_paused = true)]
    async fn grace_period_bounds_shutdown() {
        let fx = fixture().await;
        let spec = AgentSpec::new("worker", "Worker").capability(
            Capability::new("hang", ""),
            handler_fn(|_c, _p| async {
                std::future::pending::<()>().await;
                Ok(Payload::new())
            }),
        );
        let handle = fx.spawn(spec).await;
        let dispatcher = fx.dispatcher.clone();
        let call = tokio::spawn(async move { dispatcher.send_task("worker", "hang", Payload::new(), 60.0).await });
        while fx.dispatcher.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        let started = Instant::now();
        handle.stop().await;
        assert!(started.elapsed() >= fx.settings.grace_period);
        assert!(started.elapsed() < fx.settings.grace_period + Duration::from_secs(2));

        // The caller learns the agent went away.
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, crate::dispatch::DispatchError::AgentUnavailable { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_failure_degrades_then_recovers() {
        let fx = fixture().await;
        let handle = fx.spawn(test_spec()).await;
        let mut watch = handle.watch_state();

        fx.transport.disconnect();
        tokio::time::timeout(Duration::from_secs(30), watch.wait_for(|s| *s == RuntimeState::Degraded))
            .await
            .expect("never degraded")
            .unwrap();

        fx.transport.reconnect();
        tokio::time::timeout(Duration::from_secs(30), watch.wait_for(|s| *s == RuntimeState::Active))
            .await
            .expect("never recovered")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_does_not_wait_out_heartbeat_retries() {
        let fx = fixture_with(|config| {
            config.bus.publish_attempts = 10;
            config.bus.publish_backoff = Duration::from_secs(1);
        })
        .await;
        let handle = fx.spawn(test_spec()).await;

        fx.transport.disconnect();
        // The first tick is now stuck retrying its publish.
        tokio::time::sleep(fx.settings.heartbeat_interval + Duration::from_millis(500)).await;

        let started = Instant::now();
        handle.stop().await;
        let elapsed = started.elapsed();
        assert!(elapsed <= fx.settings.grace_period + Duration::from_millis(100), "{elapsed:?}");
        assert_eq!(fx.registry.get("worker").unwrap().status, AgentStatus::Stopped);
        fx.transport.reconnect();
    }

    #[tokio::test(start_paused = true)]
    async fn deregistration_outlasts_own_heartbeats() {
        let fx = fixture().await;
        let handle = fx.spawn(test_spec()).await;

        fx.registry.deregister("worker").unwrap();
        tokio::time::sleep(fx.settings.heartbeat_interval * 3).await;

        assert_eq!(handle.state(), RuntimeState::Active);
        assert_eq!(fx.registry.get("worker").unwrap().status, AgentStatus::Stopped);
        let err = fx.dispatcher.send_task("worker", "ping", Payload::new(), 5.0).await.unwrap_err();
        assert!(matches!(err, crate::dispatch::DispatchError::AgentUnavailable { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn peer_heartbeats_reach_registry() {
        let fx = fixture().await;
        let _handle = fx.spawn(test_spec()).await;

        let peer = Origin::new("peer").unwrap();
        let beat = HeartbeatPayload {
            display_name: "Peer".into(),
            status: AgentStatus::Active,
            capabilities: vec![],
            public_key: None,
            active_tasks: 0,
        };
        fx.bus.send(&peer.heartbeat(beat.to_payload()).unwrap()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while fx.registry.get("peer").is_err() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("peer never registered");
    }
}
