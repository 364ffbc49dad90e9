//! End-to-end dispatch scenarios against the built-in agents.
//!
//! Run with:
//!   cargo test --test test_dispatch

use std::fs;
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tempfile::TempDir;

use agentic::agents::{AgentSpec, TaskError, handler_fn};
use agentic::bus::{Origin, Payload};
use agentic::config::{self, Config};
use agentic::dispatch::{DispatchError, TaskOutcome};
use agentic::error::ErrorKind;
use agentic::registry::Capability;
use agentic::supervisor::Supervisor;

// ── helpers ──────────────────────────────────────────────────────────────────

fn test_config() -> (TempDir, Config) {
    let tmp = TempDir::new().expect("tempdir");
    let path = tmp.path().join("agentic.toml");
    fs::write(
        &path,
        r#"
[runtime]
name = "agentic-test"
work_dir = "."
log_level = "debug"

[bus]
publish_attempts = 2
publish_backoff_ms = 10

[dispatch]
default_timeout_seconds = 5.0

[agents]
heartbeat_interval_secs = 1
grace_period_secs = 1
max_concurrent_tasks = 16
rate_limit_requests = 0

[agents.calculator]
[agents.echo]

[health]
sweep_interval_secs = 1
"#,
    )
    .expect("write config");
    let config = config::load_from(&path, Some(tmp.path().to_str().unwrap()), None).expect("load config");
    (tmp, config)
}

async fn supervisor_with_builtins() -> (TempDir, Supervisor) {
    let (tmp, config) = test_config();
    let mut sup = Supervisor::init(&config).await.expect("init");
    let started = sup.spawn_builtin_agents().await.expect("builtins");
    assert_eq!(started, ["api-calculator-001", "api-echo-001"]);
    (tmp, sup)
}

fn obj(v: Value) -> Payload {
    v.as_object().cloned().expect("object")
}

// ── scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn calculator_multiplies() {
    let (_tmp, sup) = supervisor_with_builtins().await;
    let outcome = sup
        .send_task("api-calculator-001", "multiply", obj(json!({"a": 6, "b": 7})), Some(5.0))
        .await
        .unwrap();
    let TaskOutcome::Success(result) = outcome else {
        panic!("expected success, got {outcome:?}");
    };
    assert_eq!(
        Value::Object(result),
        json!({"result": 42.0, "operation": "multiply", "inputs": {"a": 6.0, "b": 7.0}})
    );
    sup.shutdown().await;
}

#[tokio::test]
async fn payload_round_trips_through_echo() {
    let (_tmp, sup) = supervisor_with_builtins().await;
    let text = "ünïcödé · \"quoted\" · 🚀";
    let out = sup
        .dispatcher()
        .call("api-echo-001", "reverse", obj(json!({"message": text})), 5.0)
        .await
        .unwrap();
    assert_eq!(out["original"], json!(text));
    assert_eq!(out["result"], json!(text.chars().rev().collect::<String>()));
    sup.shutdown().await;
}

#[tokio::test]
async fn division_by_zero_is_a_task_error() {
    let (_tmp, sup) = supervisor_with_builtins().await;
    let err = sup
        .dispatcher()
        .call("api-calculator-001", "divide", obj(json!({"a": 1, "b": 0})), 5.0)
        .await
        .unwrap_err();
    let DispatchError::TaskExecution(failure) = &err else {
        panic!("expected TaskExecution, got {err:?}");
    };
    assert_eq!(failure.message(), "Division by zero is not allowed");
    assert_eq!(err.kind(), ErrorKind::AgentOperationFailed);
    sup.shutdown().await;
}

#[tokio::test]
async fn unknown_task_type_fails_fast() {
    let (_tmp, sup) = supervisor_with_builtins().await;
    let started = Instant::now();
    let err = sup
        .dispatcher()
        .call("api-echo-001", "translate", Payload::new(), 30.0)
        .await
        .unwrap_err();
    let DispatchError::TaskExecution(failure) = err else {
        panic!("expected TaskExecution, got {err:?}");
    };
    assert_eq!(failure.kind(), Some("unknown_task_type"));
    assert!(started.elapsed() < Duration::from_secs(5));
    sup.shutdown().await;
}

#[tokio::test]
async fn non_positive_timeout_publishes_nothing() {
    let (_tmp, sup) = supervisor_with_builtins().await;
    let before = sup.transport().publish_count();
    for timeout in [0.0, -3.0] {
        let err = sup
            .send_task("api-echo-001", "echo", Payload::new(), Some(timeout))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
        assert_eq!(err.kind(), ErrorKind::General);
    }
    assert_eq!(sup.transport().publish_count(), before);
    assert_eq!(sup.dispatcher().pending_count(), 0);
    sup.shutdown().await;
}

#[tokio::test]
async fn unknown_recipient_does_not_wait() {
    let (_tmp, sup) = supervisor_with_builtins().await;
    let started = Instant::now();
    let err = sup
        .send_task("api-nobody-001", "echo", Payload::new(), Some(30.0))
        .await
        .unwrap_err();
    assert_eq!(err, DispatchError::UnknownAgent("api-nobody-001".into()));
    assert!(started.elapsed() < Duration::from_secs(1));
    sup.shutdown().await;
}

#[tokio::test]
async fn silent_agent_times_out_in_about_a_second() {
    let (_tmp, mut sup) = supervisor_with_builtins().await;
    sup.spawn_agent(AgentSpec::new("sleepy", "Sleepy").capability(
        Capability::new("nap", ""),
        handler_fn(|_c, _p| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Payload::new())
        }),
    ))
    .await
    .unwrap();

    let started = Instant::now();
    let outcome = sup.send_task("sleepy", "nap", Payload::new(), Some(1.0)).await.unwrap();
    let elapsed = started.elapsed();
    assert!(matches!(outcome, TaskOutcome::TimedOut { .. }), "got {outcome:?}");
    assert!(elapsed >= Duration::from_millis(950) && elapsed < Duration::from_secs(3), "{elapsed:?}");
    assert_eq!(sup.dispatcher().pending_count(), 0);
    sup.shutdown().await;
}

#[tokio::test]
async fn duplicate_replies_resolve_once() {
    let (_tmp, sup) = supervisor_with_builtins().await;
    // A hand-rolled agent that answers every request twice.
    let bus = sup.bus().clone();
    sup.registry().register(
        agentic::registry::AgentRecord::new("twice", "Twice", chrono::Utc::now())
            .with_status(agentic::registry::AgentStatus::Active),
    );
    let mut inbox = bus.subscribe(&bus.channels().agent("twice")).await.unwrap();
    tokio::spawn(async move {
        let me = Origin::new("twice").unwrap();
        while let Some(req) = inbox.recv().await {
            for n in 0..2 {
                let reply = me.response(&req, obj(json!({"n": n}))).unwrap();
                bus.send(&reply).await.unwrap();
            }
        }
    });

    let out = sup.dispatcher().call("twice", "anything", Payload::new(), 5.0).await.unwrap();
    assert_eq!(out, obj(json!({"n": 0})));

    tokio::time::timeout(Duration::from_secs(5), async {
        while sup.dispatch_stats().duplicate_replies < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("duplicate reply never counted");
    let stats = sup.dispatch_stats();
    assert_eq!(stats.duplicate_replies, 1);
    assert_eq!(stats.succeeded, 1);
    assert_eq!(sup.dispatcher().pending_count(), 0);
    sup.shutdown().await;
}

#[tokio::test]
async fn concurrent_sends_resolve_independently() {
    let (_tmp, mut sup) = supervisor_with_builtins().await;
    // Each agent replies after a delay that reverses the send order.
    const N: u64 = 5;
    for i in 0..N {
        let delay = Duration::from_millis((N - i) * 40);
        sup.spawn_agent(AgentSpec::new(format!("worker-{i}"), "Worker").capability(
            Capability::new("id", ""),
            handler_fn(move |ctx, _p| async move {
                tokio::time::sleep(delay).await;
                Ok(obj(json!({"agent": ctx.agent_id})))
            }),
        ))
        .await
        .unwrap();
    }

    let calls: Vec<_> = (0..N)
        .map(|i| {
            let dispatcher = sup.dispatcher().clone();
            tokio::spawn(async move {
                dispatcher.call(&format!("worker-{i}"), "id", Payload::new(), 5.0).await
            })
        })
        .collect();
    for (i, call) in calls.into_iter().enumerate() {
        let out = call.await.unwrap().unwrap();
        assert_eq!(out["agent"], json!(format!("worker-{i}")));
    }
    assert_eq!(sup.dispatcher().pending_count(), 0);
    sup.shutdown().await;
}

#[tokio::test]
async fn agent_stopping_mid_flight_is_unavailable() {
    let (_tmp, mut sup) = supervisor_with_builtins().await;
    sup.spawn_agent(AgentSpec::new("flaky", "Flaky").capability(
        Capability::new("hang", ""),
        handler_fn(|_c, _p| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err::<Payload, _>(TaskError::new("unreachable"))
        }),
    ))
    .await
    .unwrap();

    let dispatcher = sup.dispatcher().clone();
    let call = tokio::spawn(async move { dispatcher.send_task("flaky", "hang", Payload::new(), 30.0).await });
    while sup.dispatcher().pending_count() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    sup.stop_agent("flaky").await.unwrap();
    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, DispatchError::AgentUnavailable { ref agent_id, .. } if agent_id == "flaky"), "{err:?}");
    assert_eq!(err.kind(), ErrorKind::Unreachable);
    assert_eq!(sup.dispatcher().pending_count(), 0);
    sup.shutdown().await;
}

#[tokio::test]
async fn health_reflects_agents_and_bus() {
    let (_tmp, sup) = supervisor_with_builtins().await;
    assert_eq!(
        Value::Object(sup.health_snapshot().await.payload()),
        json!({"status": "healthy", "active_agents": 2})
    );

    let ids: Vec<String> = sup.list_active_agents().into_iter().map(|r| r.agent_id).collect();
    assert_eq!(ids, ["api-calculator-001", "api-echo-001"]);

    sup.transport().disconnect();
    assert_eq!(sup.health_snapshot().await.payload()["status"], json!("unhealthy"));
    sup.transport().reconnect();
    sup.shutdown().await;
}

#[tokio::test]
async fn bus_outage_surfaces_transport_error() {
    let (_tmp, sup) = supervisor_with_builtins().await;
    sup.transport().disconnect();
    let err = sup
        .send_task("api-echo-001", "echo", Payload::new(), Some(2.0))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::BusUnavailable(_)), "{err:?}");
    assert_eq!(err.kind(), ErrorKind::TransportUnavailable);
    assert_eq!(sup.dispatcher().pending_count(), 0);
    sup.transport().reconnect();
    sup.shutdown().await;
}
