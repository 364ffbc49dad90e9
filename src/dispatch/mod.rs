//! Task dispatcher: send a task to an agent and wait for the correlated reply.
//!
//! ```text
//! caller ── send_task ──► validate ► registry check ► waiter ► publish
//!                                                             │
//!   ◄── TaskOutcome ◄── waiter resolved ◄── reply listener ◄──┘ (own channel)
//! ```
//!
//! The dispatcher listens on its own agent channel
//! (`{prefix}:agent:{dispatcher_id}`) for `TASK_RESPONSE` / `TASK_ERROR`
//! envelopes and on registry events for agents that become unavailable.
//! Exactly one resolution reaches each caller; see [`waiters`] for how.

mod waiters;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bus::{BusClient, BusError, Envelope, MessageType, Origin, Payload, Subscription};
use crate::error::ErrorKind;
use crate::registry::{AgentRegistry, AgentStatus, RegistryEvent};

use waiters::{Claim, Resolution, WaiterGuard, WaiterTable};

// ── Outcomes & errors ────────────────────────────────────────────────────────

/// An agent's `TASK_ERROR` reply, payload kept verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    pub agent_id: String,
    pub task_type: String,
    pub correlation_id: String,
    pub payload: Payload,
}

impl TaskFailure {
    /// Machine-readable failure kind set by the agent runtime
    /// (`unknown_task_type`, `execution_failed`, …).
    pub fn kind(&self) -> Option<&str> {
        self.payload.get("kind").and_then(Value::as_str)
    }

    pub fn message(&self) -> &str {
        self.payload.get("error").and_then(Value::as_str).unwrap_or("task failed")
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent '{}' failed task '{}': {}", self.agent_id, self.task_type, self.message())
    }
}

/// How a dispatched task ended once it reached the agent.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Success(Payload),
    Failed(TaskFailure),
    TimedOut { correlation_id: String, timeout_seconds: f64 },
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success(_))
    }

    /// Fold failures and timeouts into [`DispatchError`].
    pub fn into_result(self) -> Result<Payload, DispatchError> {
        match self {
            TaskOutcome::Success(payload) => Ok(payload),
            TaskOutcome::Failed(failure) => Err(DispatchError::TaskExecution(failure)),
            TaskOutcome::TimedOut { correlation_id, timeout_seconds } => {
                Err(DispatchError::TaskTimeout { correlation_id, timeout_seconds, reply_received: false })
            }
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DispatchError {
    /// Bad input; nothing was published.
    #[error("invalid task: {0}")]
    Validation(String),

    #[error("unknown agent '{0}'")]
    UnknownAgent(String),

    #[error("agent '{agent_id}' unavailable: {reason}")]
    AgentUnavailable { agent_id: String, reason: String },

    #[error("bus unavailable: {0}")]
    BusUnavailable(String),

    /// No reply within the timeout. `reply_received` is always `false`
    /// here; an agent that answered with an error yields `TaskExecution`.
    #[error("task {correlation_id} timed out after {timeout_seconds}s")]
    TaskTimeout { correlation_id: String, timeout_seconds: f64, reply_received: bool },

    #[error("{0}")]
    TaskExecution(TaskFailure),
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::Validation(_) => ErrorKind::General,
            DispatchError::UnknownAgent(_) | DispatchError::AgentUnavailable { .. } => {
                ErrorKind::Unreachable
            }
            DispatchError::BusUnavailable(_) => ErrorKind::TransportUnavailable,
            DispatchError::TaskTimeout { .. } | DispatchError::TaskExecution(_) => {
                ErrorKind::AgentOperationFailed
            }
        }
    }

    fn unavailable(agent_id: &str, reason: impl Into<String>) -> Self {
        DispatchError::AgentUnavailable { agent_id: agent_id.to_string(), reason: reason.into() }
    }
}

impl From<BusError> for DispatchError {
    fn from(e: BusError) -> Self {
        match e {
            BusError::Unavailable(reason) => DispatchError::BusUnavailable(reason),
            BusError::Auth => DispatchError::BusUnavailable("authentication failed".into()),
        }
    }
}

// ── Stats ────────────────────────────────────────────────────────────────────

/// Counters since the dispatcher started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub sent: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub duplicate_replies: u64,
    pub unsolicited_replies: u64,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    duplicate_replies: AtomicU64,
    unsolicited_replies: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

// ── TaskDispatcher ───────────────────────────────────────────────────────────

struct Inner {
    origin: Origin,
    bus: BusClient,
    registry: AgentRegistry,
    waiters: WaiterTable,
    counters: Counters,
    default_timeout_seconds: f64,
}

/// Clone freely; all clones share one waiter table and reply listener.
#[derive(Clone)]
pub struct TaskDispatcher {
    inner: Arc<Inner>,
}

impl TaskDispatcher {
    /// Subscribe to the dispatcher's reply channel and start the listener.
    /// The listener runs until the bus client's shutdown token fires.
    pub async fn start(
        bus: BusClient,
        registry: AgentRegistry,
        origin: Origin,
        default_timeout_seconds: f64,
    ) -> Result<(Self, JoinHandle<()>), BusError> {
        let replies = bus.subscribe(&bus.channels().agent(origin.sender_id())).await?;
        let events = registry.subscribe_events();
        info!(dispatcher_id = %origin.sender_id(), channel = %replies.channel(), "dispatcher listening");

        let inner = Arc::new(Inner {
            origin,
            bus,
            registry,
            waiters: WaiterTable::default(),
            counters: Counters::default(),
            default_timeout_seconds,
        });
        let listener = tokio::spawn(listen(inner.clone(), replies, events));
        Ok((Self { inner }, listener))
    }

    pub fn dispatcher_id(&self) -> &str {
        self.inner.origin.sender_id()
    }

    pub fn default_timeout_seconds(&self) -> f64 {
        self.inner.default_timeout_seconds
    }

    /// Send `task_type` with `payload` to `recipient_id` and wait up to
    /// `timeout_seconds` for the reply.
    ///
    /// `Err` means the task never reached a decision point with the agent
    /// (bad input, unknown or unavailable agent, bus down). Once the request
    /// is out, the agent's answer or silence comes back as a [`TaskOutcome`].
    pub async fn send_task(
        &self,
        recipient_id: &str,
        task_type: &str,
        payload: Payload,
        timeout_seconds: f64,
    ) -> Result<TaskOutcome, DispatchError> {
        let timeout = validate(recipient_id, task_type, timeout_seconds)?;

        let record = self
            .inner
            .registry
            .get(recipient_id)
            .map_err(|_| DispatchError::UnknownAgent(recipient_id.to_string()))?;
        if record.status == AgentStatus::Stopped {
            return Err(DispatchError::unavailable(recipient_id, "agent is stopped"));
        }

        let request = self
            .inner
            .origin
            .request(recipient_id, task_type, payload, Some(timeout_seconds))
            .map_err(|e| DispatchError::Validation(e.to_string()))?;
        let correlation_id = request.message_id().to_string();

        let waiters = &self.inner.waiters;
        let mut rx = waiters.insert(&correlation_id, recipient_id);
        let _guard = WaiterGuard::new(waiters, &correlation_id);

        bump(&self.inner.counters.sent);
        let receivers = self.inner.bus.send(&request).await?;
        if receivers == 0 {
            return Err(DispatchError::unavailable(recipient_id, "no subscriber on its channel"));
        }
        info!(
            correlation_id = %correlation_id,
            recipient_id,
            task_type,
            timeout_seconds,
            "task dispatched"
        );

        let resolution = match tokio::time::timeout_at(Instant::now() + timeout, &mut rx).await {
            Ok(Ok(resolution)) => resolution,
            Ok(Err(_)) => return Err(DispatchError::BusUnavailable("dispatcher stopped".into())),
            Err(_) if waiters.abandon(&correlation_id) => {
                bump(&self.inner.counters.timed_out);
                warn!(correlation_id = %correlation_id, recipient_id, task_type, "task timed out");
                return Ok(TaskOutcome::TimedOut { correlation_id, timeout_seconds });
            }
            // A reply claimed the waiter as the deadline passed; it is already in the slot.
            Err(_) => rx
                .await
                .map_err(|_| DispatchError::BusUnavailable("dispatcher stopped".into()))?,
        };

        match resolution {
            Resolution::Reply(reply) if reply.message_type() == MessageType::TaskResponse => {
                bump(&self.inner.counters.succeeded);
                debug!(correlation_id = %correlation_id, recipient_id, "task succeeded");
                Ok(TaskOutcome::Success(reply.into_payload()))
            }
            Resolution::Reply(reply) => {
                bump(&self.inner.counters.failed);
                let failure = TaskFailure {
                    agent_id: recipient_id.to_string(),
                    task_type: task_type.to_string(),
                    correlation_id,
                    payload: reply.into_payload(),
                };
                info!(
                    correlation_id = %failure.correlation_id,
                    recipient_id,
                    kind = failure.kind().unwrap_or("unspecified"),
                    error = %failure.message(),
                    "task failed"
                );
                Ok(TaskOutcome::Failed(failure))
            }
            Resolution::Unavailable(reason) => Err(DispatchError::unavailable(recipient_id, reason)),
        }
    }

    /// [`send_task`](Self::send_task) with failures and timeouts folded into
    /// the error.
    pub async fn call(
        &self,
        recipient_id: &str,
        task_type: &str,
        payload: Payload,
        timeout_seconds: f64,
    ) -> Result<Payload, DispatchError> {
        self.send_task(recipient_id, task_type, payload, timeout_seconds)
            .await?
            .into_result()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.waiters.len()
    }

    pub fn is_pending(&self, correlation_id: &str) -> bool {
        self.inner.waiters.contains(correlation_id)
    }

    pub fn stats(&self) -> DispatchStats {
        let c = &self.inner.counters;
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        DispatchStats {
            sent: load(&c.sent),
            succeeded: load(&c.succeeded),
            failed: load(&c.failed),
            timed_out: load(&c.timed_out),
            duplicate_replies: load(&c.duplicate_replies),
            unsolicited_replies: load(&c.unsolicited_replies),
        }
    }
}

fn validate(recipient_id: &str, task_type: &str, timeout_seconds: f64) -> Result<Duration, DispatchError> {
    if recipient_id.trim().is_empty() {
        return Err(DispatchError::Validation("recipient_id must not be empty".into()));
    }
    if task_type.trim().is_empty() {
        return Err(DispatchError::Validation("task_type must not be empty".into()));
    }
    if !(timeout_seconds.is_finite() && timeout_seconds > 0.0) {
        return Err(DispatchError::Validation(format!(
            "timeout_seconds must be positive, got {timeout_seconds}"
        )));
    }
    Duration::try_from_secs_f64(timeout_seconds)
        .map_err(|e| DispatchError::Validation(format!("timeout_seconds out of range: {e}")))
}

// ── Reply listener ───────────────────────────────────────────────────────────

async fn listen(
    inner: Arc<Inner>,
    mut replies: Subscription,
    mut events: tokio::sync::broadcast::Receiver<RegistryEvent>,
) {
    loop {
        tokio::select! {
            envelope = replies.recv() => match envelope {
                Some(envelope) => inner.on_reply(envelope),
                None => break,
            },
            event = events.recv() => match event {
                Ok(RegistryEvent::Unavailable(agent_id)) => {
                    let failed = inner.waiters.fail_recipient(&agent_id, "agent stopped");
                    if failed > 0 {
                        warn!(agent_id = %agent_id, failed, "failed pending tasks of stopped agent");
                    }
                }
                Ok(RegistryEvent::Registered(_)) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "dispatcher missed registry events");
                }
                Err(RecvError::Closed) => {
                    events = inner.registry.subscribe_events();
                }
            },
        }
    }

    let dropped = inner.waiters.close_all();
    info!(dispatcher_id = %inner.origin.sender_id(), dropped, "dispatcher stopped");
}

impl Inner {
    fn on_reply(&self, envelope: Envelope) {
        let message_type = envelope.message_type();
        if !message_type.is_reply() {
            debug!(%message_type, sender_id = %envelope.sender_id(), "ignoring non-reply on dispatcher channel");
            return;
        }
        if envelope.is_expired(Utc::now()) {
            debug!(message_id = %envelope.message_id(), "discarding expired reply");
            return;
        }
        if let Err(e) = self.registry.verify_envelope(&envelope) {
            warn!(sender_id = %envelope.sender_id(), error = %e, "discarding reply with bad signature");
            return;
        }

        let Some(correlation_id) = envelope.correlation_id().map(str::to_string) else {
            return;
        };
        let sender_id = envelope.sender_id().to_string();

        match self.waiters.resolve(&correlation_id, &sender_id, envelope) {
            Claim::Resolved => debug!(correlation_id = %correlation_id, %message_type, "reply matched"),
            Claim::Duplicate => {
                bump(&self.counters.duplicate_replies);
                warn!(correlation_id = %correlation_id, sender_id = %sender_id, "duplicate reply discarded");
            }
            Claim::Late => debug!(correlation_id = %correlation_id, "late reply discarded"),
            Claim::WrongSender => {
                bump(&self.counters.unsolicited_replies);
                warn!(correlation_id = %correlation_id, sender_id = %sender_id, "reply from unexpected sender discarded");
            }
            Claim::Unknown => {
                bump(&self.counters.unsolicited_replies);
                warn!(correlation_id = %correlation_id, sender_id = %sender_id, "unsolicited reply discarded");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryTransport;
    use crate::config::BusConfig;
    use crate::registry::{AgentRecord, Liveness};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        transport: Arc<MemoryTransport>,
        bus: BusClient,
        registry: AgentRegistry,
        dispatcher: TaskDispatcher,
        shutdown: CancellationToken,
    }

    async fn fixture() -> Fixture {
        let transport = Arc::new(MemoryTransport::new(64));
        let shutdown = CancellationToken::new();
        let config = BusConfig {
            channel_prefix: "agentic".into(),
            buffer: 64,
            publish_attempts: 2,
            publish_backoff: Duration::from_millis(5),
        };
        let bus = BusClient::connect(transport.clone(), &config, None, shutdown.clone())
            .await
            .unwrap();
        let registry = AgentRegistry::new(Liveness::default());
        let (dispatcher, _listener) = TaskDispatcher::start(
            bus.clone(),
            registry.clone(),
            Origin::new("api-server").unwrap(),
            30.0,
        )
        .await
        .unwrap();
        Fixture { transport, bus, registry, dispatcher, shutdown }
    }

    fn payload(v: Value) -> Payload {
        v.as_object().cloned().unwrap()
    }

    impl Fixture {
        /// Register `agent_id` and return a raw subscription on its channel.
        async fn fake_agent(&self, agent_id: &str) -> Subscription {
            self.registry
                .register(AgentRecord::new(agent_id, agent_id, Utc::now()).with_status(AgentStatus::Active));
            self.bus.subscribe(&self.bus.channels().agent(agent_id)).await.unwrap()
        }
    }

    #[tokio::test]
    async fn validation_happens_before_any_publish() {
        let fx = fixture().await;
        fx.fake_agent("a").await;
        for timeout in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let err = fx.dispatcher.send_task("a", "echo", Payload::new(), timeout).await.unwrap_err();
            assert!(matches!(err, DispatchError::Validation(_)), "timeout {timeout}");
        }
        let err = fx.dispatcher.send_task("a", "", Payload::new(), 1.0).await.unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
        assert_eq!(fx.transport.publish_count(), 0);
        assert_eq!(fx.dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn unknown_agent_fails_fast() {
        let fx = fixture().await;
        let err = fx.dispatcher.send_task("ghost", "echo", Payload::new(), 30.0).await.unwrap_err();
        assert_eq!(err, DispatchError::UnknownAgent("ghost".into()));
        assert_eq!(err.kind(), ErrorKind::Unreachable);
        assert_eq!(fx.transport.publish_count(), 0);
    }

    #[tokio::test]
    async fn stopped_agent_is_unavailable() {
        let fx = fixture().await;
        fx.fake_agent("a").await;
        fx.registry.deregister("a").unwrap();
        let err = fx.dispatcher.send_task("a", "echo", Payload::new(), 1.0).await.unwrap_err();
        assert!(matches!(err, DispatchError::AgentUnavailable { .. }));
    }

    #[tokio::test]
    async fn registered_but_not_listening_is_unavailable() {
        let fx = fixture().await;
        fx.registry.register(AgentRecord::new("deaf", "deaf", Utc::now()));
        let err = fx.dispatcher.send_task("deaf", "echo", Payload::new(), 1.0).await.unwrap_err();
        assert!(matches!(err, DispatchError::AgentUnavailable { .. }));
        assert_eq!(fx.dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn response_resolves_with_payload() {
        let fx = fixture().await;
        let mut inbox = fx.fake_agent("a").await;
        let agent = Origin::new("a").unwrap();
        let bus = fx.bus.clone();
        tokio::spawn(async move {
            let req = inbox.recv().await.unwrap();
            assert_eq!(req.payload()["message"], json!("hi"));
            let reply = agent.response(&req, payload(json!({"result": "hi"}))).unwrap();
            bus.send(&reply).await.unwrap();
        });

        let outcome = fx
            .dispatcher
            .send_task("a", "echo", payload(json!({"message": "hi"})), 5.0)
            .await
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Success(payload(json!({"result": "hi"}))));
        assert_eq!(fx.dispatcher.pending_count(), 0);
        assert_eq!(fx.dispatcher.stats().succeeded, 1);
    }

    #[tokio::test]
    async fn error_reply_is_a_failed_outcome() {
        let fx = fixture().await;
        let mut inbox = fx.fake_agent("a").await;
        let agent = Origin::new("a").unwrap();
        let bus = fx.bus.clone();
        tokio::spawn(async move {
            let req = inbox.recv().await.unwrap();
            let reply = agent
                .error(&req, payload(json!({"error": "boom", "kind": "execution_failed"})))
                .unwrap();
            bus.send(&reply).await.unwrap();
        });

        let err = fx.dispatcher.call("a", "explode", Payload::new(), 5.0).await.unwrap_err();
        let DispatchError::TaskExecution(failure) = err else {
            panic!("expected TaskExecution, got {err:?}");
        };
        assert_eq!(failure.kind(), Some("execution_failed"));
        assert_eq!(failure.message(), "boom");
        assert_eq!(failure.task_type, "explode");
    }

    #[tokio::test(start_paused = true)]
    async fn silence_times_out_and_releases_waiter() {
        let fx = fixture().await;
        let _inbox = fx.fake_agent("a").await;
        let outcome = fx.dispatcher.send_task("a", "echo", Payload::new(), 1.0).await.unwrap();
        let TaskOutcome::TimedOut { timeout_seconds, .. } = &outcome else {
            panic!("expected timeout, got {outcome:?}");
        };
        assert_eq!(*timeout_seconds, 1.0);
        assert_eq!(fx.dispatcher.pending_count(), 0);
        assert_eq!(fx.dispatcher.stats().timed_out, 1);

        let err = outcome.into_result().unwrap_err();
        assert!(matches!(err, DispatchError::TaskTimeout { reply_received: false, .. }));
        assert_eq!(err.kind(), ErrorKind::AgentOperationFailed);
    }

    #[tokio::test]
    async fn duplicate_reply_is_counted_not_delivered() {
        let fx = fixture().await;
        let mut inbox = fx.fake_agent("a").await;
        let agent = Origin::new("a").unwrap();
        let bus = fx.bus.clone();
        tokio::spawn(async move {
            let req = inbox.recv().await.unwrap();
            for n in 0..2 {
                let reply = agent.response(&req, payload(json!({"n": n}))).unwrap();
                bus.send(&reply).await.unwrap();
            }
        });

        let outcome = fx.dispatcher.send_task("a", "echo", Payload::new(), 5.0).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Success(payload(json!({"n": 0}))));

        tokio::time::timeout(Duration::from_secs(5), async {
            while fx.dispatcher.stats().duplicate_replies == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("duplicate never observed");
        assert_eq!(fx.dispatcher.stats().succeeded, 1);
    }

    #[tokio::test]
    async fn unsolicited_reply_is_discarded() {
        let fx = fixture().await;
        let stranger = Origin::new("stranger").unwrap();
        let fake_request = Origin::new("api-server").unwrap().request("stranger", "x", Payload::new(), None).unwrap();
        fx.bus.send(&stranger.response(&fake_request, Payload::new()).unwrap()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while fx.dispatcher.stats().unsolicited_replies == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("unsolicited reply never observed");
        assert_eq!(fx.dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn cancelled_caller_releases_waiter() {
        let fx = fixture().await;
        let mut inbox = fx.fake_agent("a").await;
        let dispatcher = fx.dispatcher.clone();
        let call = tokio::spawn(async move {
            dispatcher.send_task("a", "echo", Payload::new(), 60.0).await
        });

        let req = inbox.recv().await.unwrap();
        assert!(fx.dispatcher.is_pending(req.message_id()));
        call.abort();
        let _ = call.await;
        assert!(!fx.dispatcher.is_pending(req.message_id()));

        // A reply arriving afterwards is dropped quietly.
        let reply = Origin::new("a").unwrap().response(&req, Payload::new()).unwrap();
        fx.bus.send(&reply).await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(fx.dispatcher.stats().unsolicited_replies, 0);
    }

    #[tokio::test]
    async fn agent_stopping_fails_in_flight_tasks() {
        let fx = fixture().await;
        let mut inbox = fx.fake_agent("a").await;
        let registry = fx.registry.clone();
        tokio::spawn(async move {
            let _req = inbox.recv().await.unwrap();
            registry.deregister("a").unwrap();
        });

        let err = fx.dispatcher.send_task("a", "echo", Payload::new(), 30.0).await.unwrap_err();
        assert!(matches!(err, DispatchError::AgentUnavailable { ref agent_id, .. } if agent_id == "a"));
        assert_eq!(fx.dispatcher.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn bus_outage_surfaces_bus_unavailable() {
        let fx = fixture().await;
        fx.fake_agent("a").await;
        fx.transport.disconnect();
        let err = fx.dispatcher.send_task("a", "echo", Payload::new(), 1.0).await.unwrap_err();
        assert!(matches!(err, DispatchError::BusUnavailable(_)));
        assert_eq!(err.kind(), ErrorKind::TransportUnavailable);
        assert_eq!(fx.dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_releases_waiters() {
        let fx = fixture().await;
        let _inbox = fx.fake_agent("a").await;
        let dispatcher = fx.dispatcher.clone();
        let call = tokio::spawn(async move {
            dispatcher.send_task("a", "echo", Payload::new(), 60.0).await
        });
        while fx.dispatcher.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        fx.shutdown.cancel();
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, DispatchError::BusUnavailable(_)));
    }
}
