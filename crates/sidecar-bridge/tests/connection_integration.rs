#![allow(clippy::unwrap_used, clippy::panic)] // Integration tests use unwrap for brevity

//! End-to-end tests of a [`Connection`] against the scripted `stub-peer`.
//!
//! The stub exits with status 3 if it sees any non-init line before it has
//! acknowledged init, so every test that reaches a second command also
//! proves the handshake gate held.

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use sidecar_bridge::{
    BridgeError, Connection, ConnectionStatus, Converter, Event, EventData, EventMode, ExitReason,
    RawEvent, SpawnError,
};
use sidecar_core::{BridgeConfig, KeyChanges, MemoryStore, Payload, Store, StoreError, VersionPolicy};
use tokio::sync::mpsc;

const STUB: &str = env!("CARGO_BIN_EXE_stub-peer");

fn config(scenario: &str) -> BridgeConfig {
    let mut config = BridgeConfig::new(STUB, [scenario]);
    config.init_timeout_ms = 5_000;
    config.command_timeout_ms = Some(5_000);
    config.terminate_timeout_ms = 1_000;
    config
}

fn payload(value: serde_json::Value) -> Payload {
    Payload::from_wire(value)
}

fn start_with(
    config: BridgeConfig,
    store: Arc<dyn Store>,
) -> (Connection, mpsc::UnboundedReceiver<RawEvent>) {
    let (tx, rx) = mpsc::unbounded_channel::<RawEvent>();
    let conn = Connection::start_raw(config, store, tx).unwrap();
    (conn, rx)
}

fn start(scenario: &str) -> (Connection, mpsc::UnboundedReceiver<RawEvent>) {
    start_with(config(scenario), Arc::new(MemoryStore::new()))
}

async fn ready(scenario: &str) -> (Connection, mpsc::UnboundedReceiver<RawEvent>) {
    let (conn, rx) = start(scenario);
    conn.wait_ready().await.unwrap();
    (conn, rx)
}

struct BrokenStore;

impl Store for BrokenStore {
    fn load_creds(&self) -> Result<Option<Payload>, StoreError> {
        Err(StoreError::Unavailable("keyring locked".into()))
    }
    fn save_creds(&self, _: Payload) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("keyring locked".into()))
    }
    fn get(
        &self,
        _: &str,
        _: &[String],
    ) -> Result<std::collections::BTreeMap<String, Payload>, StoreError> {
        Err(StoreError::Unavailable("keyring locked".into()))
    }
    fn set(&self, _: KeyChanges) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("keyring locked".into()))
    }
}

// =========================================================================
// Handshake
// =========================================================================

#[tokio::test]
async fn test_ready_then_echo() {
    let (conn, _events) = start("echo");
    let started = Instant::now();
    conn.wait_ready().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(conn.status(), ConnectionStatus::Ready);

    let reply = conn.call("echo", payload(json!({"n": 1}))).await.unwrap();
    assert_eq!(reply, payload(json!({"n": 1})));

    assert_eq!(conn.shutdown().await, ExitReason::Shutdown);
}

#[tokio::test]
async fn test_init_rejection_terminates_with_peer_error() {
    let (conn, _events) = start("init-fail");
    let reason = conn.wait_ready().await.unwrap_err();
    assert_eq!(reason, ExitReason::InitFailed(Payload::from("init_failed")));
    assert!(reason.to_string().contains("init_failed"));

    assert_eq!(conn.closed().await, reason);
    assert_eq!(conn.status(), ConnectionStatus::Terminated(reason.clone()));

    let late = conn.call("echo", Payload::Null).await;
    assert_eq!(late, Err(BridgeError::Closed(reason)));
}

#[tokio::test]
async fn test_commands_before_ready_are_refused() {
    let (conn, _events) = start("slow-init");

    let early = conn.call("echo", payload(json!({"n": 0}))).await;
    assert_eq!(early, Err(BridgeError::NotInitialized));

    conn.wait_ready().await.unwrap();
    // The stub would have exited with status 3 had the early command
    // reached it.
    let reply = conn.call("echo", payload(json!({"n": 1}))).await.unwrap();
    assert_eq!(reply, payload(json!({"n": 1})));
    conn.shutdown().await;
}

#[tokio::test]
async fn test_init_timeout() {
    let mut config = config("silent-init");
    config.init_timeout_ms = 200;
    let (conn, _events) = start_with(config, Arc::new(MemoryStore::new()));

    let started = Instant::now();
    let reason = conn.wait_ready().await.unwrap_err();
    assert_eq!(
        reason,
        ExitReason::InitTimeout {
            timeout: Duration::from_millis(200)
        }
    );
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_bad_version_during_init() {
    let (conn, _events) = start("bad-version");
    let reason = conn.wait_ready().await.unwrap_err();
    assert_eq!(
        reason,
        ExitReason::UnsupportedVersion {
            found: "2".into()
        }
    );
}

#[tokio::test]
async fn test_spawn_failure_is_reported() {
    let config = BridgeConfig::new("/nonexistent/stub-peer", Vec::<String>::new());
    let (tx, _rx) = mpsc::unbounded_channel::<RawEvent>();
    let err = Connection::start_raw(config, Arc::new(MemoryStore::new()), tx).unwrap_err();
    assert!(matches!(err, SpawnError::SpawnFailed { .. }));
}

struct PanickingStore;

impl Store for PanickingStore {
    fn load_creds(&self) -> Result<Option<Payload>, StoreError> {
        panic!("keyring driver crashed");
    }
    fn save_creds(&self, _: Payload) -> Result<(), StoreError> {
        panic!("keyring driver crashed");
    }
    fn get(
        &self,
        _: &str,
        _: &[String],
    ) -> Result<std::collections::BTreeMap<String, Payload>, StoreError> {
        panic!("keyring driver crashed");
    }
    fn set(&self, _: KeyChanges) -> Result<(), StoreError> {
        panic!("keyring driver crashed");
    }
}

// =========================================================================
// Reverse requests
// =========================================================================

#[tokio::test]
async fn test_auth_requests_during_handshake() {
    let store = Arc::new(MemoryStore::new());
    let (conn, _events) = start_with(config("auth"), store.clone());
    conn.wait_ready().await.unwrap();

    let creds = store.creds().unwrap();
    assert_eq!(creds.get("noise"), Some(&Payload::Bytes(vec![1, 2, 3])));
    assert_eq!(store.key("pre-key", "1"), Some(Payload::Bytes(vec![0, 1])));
    assert!(store.key("pre-key", "2").is_none());

    let reply = conn.call("echo", payload(json!({"after": "auth"}))).await.unwrap();
    assert_eq!(reply, payload(json!({"after": "auth"})));
    conn.shutdown().await;
}

#[tokio::test]
async fn test_existing_creds_are_not_overwritten() {
    let existing = payload(json!({"noise": {"__b64": "CQk="}}));
    let store = Arc::new(MemoryStore::with_creds(existing.clone()));
    let (conn, _events) = start_with(config("auth"), store.clone());
    conn.wait_ready().await.unwrap();

    assert_eq!(store.creds(), Some(existing));
    conn.shutdown().await;
}

#[tokio::test]
async fn test_store_failure_surfaces_in_init_error() {
    let (conn, _events) = start_with(config("auth"), Arc::new(BrokenStore));
    let reason = conn.wait_ready().await.unwrap_err();
    let ExitReason::InitFailed(error) = &reason else {
        panic!("expected InitFailed, got {reason:?}");
    };
    assert_eq!(error.get("code").and_then(Payload::as_str), Some("store_error"));
    assert!(reason.to_string().contains("keyring locked"));
}

#[tokio::test]
async fn test_panicking_store_is_answered_not_fatal() {
    let (conn, _events) = start_with(config("auth"), Arc::new(PanickingStore));
    let reason = conn.wait_ready().await.unwrap_err();
    let ExitReason::InitFailed(error) = &reason else {
        panic!("expected InitFailed, got {reason:?}");
    };
    assert_eq!(error.get("code").and_then(Payload::as_str), Some("store_error"));
    assert!(reason.to_string().contains("keyring driver crashed"));

    // The actor survived to tear down in order.
    assert_eq!(conn.closed().await, reason);
    let err = conn.call("echo", Payload::Null).await.unwrap_err();
    assert!(matches!(err, BridgeError::Closed(ExitReason::InitFailed(_))));
}

// =========================================================================
// Correlation
// =========================================================================

#[tokio::test]
async fn test_concurrent_echoes_are_not_crossed() {
    let (conn, _events) = ready("echo").await;

    let one = conn.send("echo", payload(json!({"n": 1})), None);
    let two = conn.send("echo", payload(json!({"n": 2})), None);
    let (one, two) = tokio::join!(one.into_future(), two.into_future());
    assert_eq!(one.unwrap(), payload(json!({"n": 1})));
    assert_eq!(two.unwrap(), payload(json!({"n": 2})));
    conn.shutdown().await;
}

#[tokio::test]
async fn test_many_concurrent_callers() {
    let (conn, _events) = ready("echo").await;

    let tasks: Vec<_> = (0..50u64)
        .map(|n| {
            let conn = conn.clone();
            tokio::spawn(async move { (n, conn.call("echo", payload(json!({"n": n}))).await) })
        })
        .collect();
    for task in tasks {
        let (n, reply) = task.await.unwrap();
        assert_eq!(reply.unwrap(), payload(json!({"n": n})));
    }
    conn.shutdown().await;
}

#[tokio::test]
async fn test_deadline_resolves_with_timeout() {
    let (conn, _events) = ready("echo").await;

    let started = Instant::now();
    let result = conn
        .call_with_timeout("ignore", Payload::Null, Some(Duration::from_millis(200)))
        .await;
    let elapsed = started.elapsed();
    assert_eq!(
        result,
        Err(BridgeError::Timeout {
            cmd: "ignore".into(),
            timeout: Duration::from_millis(200)
        })
    );
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");

    // The connection is unaffected.
    let reply = conn.call("echo", Payload::from("still here")).await.unwrap();
    assert_eq!(reply, Payload::from("still here"));
    conn.shutdown().await;
}

#[tokio::test]
async fn test_command_error_is_returned_verbatim() {
    let (conn, _events) = ready("echo").await;

    let err = conn.call("fail", payload(json!({"code": "boom"}))).await;
    assert_eq!(err, Err(BridgeError::Command(payload(json!({"code": "boom"})))));

    let Err(BridgeError::Command(error)) = conn.call("no_such_command", Payload::Null).await else {
        panic!("expected a command error");
    };
    assert_eq!(error.get("code").and_then(Payload::as_str), Some("unknown_command"));
    conn.shutdown().await;
}

#[tokio::test]
async fn test_malformed_line_between_responses_is_skipped() {
    let (conn, _events) = ready("echo").await;

    let first = conn.send("hold", Payload::Null, None);
    let second = conn.send("hold", Payload::Null, None);
    let (first, second) = tokio::join!(first.into_future(), second.into_future());
    let first = first.unwrap();
    let second = second.unwrap();
    assert!(first.get("held").and_then(Payload::as_str).is_some());
    assert!(second.get("held").and_then(Payload::as_str).is_some());
    assert_ne!(first, second);

    assert_eq!(conn.status(), ConnectionStatus::Ready);
    let reply = conn.call("echo", payload(json!({"n": 3}))).await.unwrap();
    assert_eq!(reply, payload(json!({"n": 3})));
    conn.shutdown().await;
}

#[tokio::test]
async fn test_response_split_across_writes() {
    let (conn, _events) = ready("echo").await;
    let reply = conn.call("partial", Payload::Null).await.unwrap();
    assert_eq!(reply, payload(json!({"partial": true})));
    conn.shutdown().await;
}

#[tokio::test]
async fn test_binary_payloads_round_trip() {
    let (conn, _events) = ready("echo").await;

    let mut args = std::collections::BTreeMap::new();
    args.insert("raw".to_string(), Payload::Bytes(vec![0, 159, 255]));
    let reply = conn.call("blob", Payload::Object(args)).await.unwrap();

    let echoed = reply.get("echo").and_then(|e| e.get("raw")).unwrap();
    assert_eq!(echoed.as_bytes(), Some(&[0u8, 159, 255][..]));
    assert_eq!(reply.get("fixed"), Some(&Payload::Bytes(vec![0, 1, 2, 255])));
    conn.shutdown().await;
}

// =========================================================================
// Events
// =========================================================================

#[tokio::test]
async fn test_events_arrive_in_order() {
    let (conn, mut events) = ready("echo").await;

    let reply = conn
        .call("emit", payload(json!({"count": 100, "name": "tick"})))
        .await
        .unwrap();
    assert_eq!(reply.get("count").and_then(Payload::as_u64), Some(100));

    for expected in 0..100u64 {
        let event = events.try_recv().unwrap();
        assert_eq!(event.name, "tick");
        let EventData::Raw(data) = event.data else {
            panic!("raw mode delivered a typed event");
        };
        assert_eq!(data.get("n").and_then(Payload::as_u64), Some(expected));
    }
    assert!(events.try_recv().is_err());
    conn.shutdown().await;
}

#[derive(Debug, PartialEq)]
struct Tick(u64);

struct TickConverter;

impl Converter for TickConverter {
    type Output = Tick;

    fn convert(&self, name: &str, data: Payload) -> Result<Tick, Payload> {
        match (name, data.get("n").and_then(Payload::as_u64)) {
            ("tick", Some(n)) => Ok(Tick(n)),
            _ => Err(data),
        }
    }
}

#[tokio::test]
async fn test_typed_events_fall_back_to_raw() {
    let (tx, mut events) = mpsc::unbounded_channel::<Event<Tick>>();
    let conn = Connection::start(
        config("echo"),
        Arc::new(MemoryStore::new()),
        EventMode::Typed(TickConverter),
        tx,
    )
    .unwrap();
    conn.wait_ready().await.unwrap();

    conn.call("emit", payload(json!({"count": 2, "name": "tick"})))
        .await
        .unwrap();
    conn.call("emit", payload(json!({"count": 1, "name": "presence"})))
        .await
        .unwrap();

    assert_eq!(events.try_recv().unwrap().data, EventData::Typed(Tick(0)));
    assert_eq!(events.try_recv().unwrap().data, EventData::Typed(Tick(1)));
    let unknown = events.try_recv().unwrap();
    assert_eq!(unknown.name, "presence");
    assert_eq!(unknown.data, EventData::Raw(payload(json!({"n": 0}))));
    conn.shutdown().await;
}

#[tokio::test]
async fn test_unversioned_event_follows_policy() {
    let (conn, mut events) = ready("echo").await;
    conn.call("legacy_event", Payload::Null).await.unwrap();
    assert_eq!(events.try_recv().unwrap().name, "legacy");
    conn.shutdown().await;

    let mut strict = config("echo");
    strict.version_policy = VersionPolicy::Strict;
    let (conn, _events) = start_with(strict, Arc::new(MemoryStore::new()));
    conn.wait_ready().await.unwrap();
    let result = conn.call("legacy_event", Payload::Null).await;
    let expected = ExitReason::UnsupportedVersion {
        found: "missing".into(),
    };
    assert_eq!(result, Err(BridgeError::Closed(expected.clone())));
    assert_eq!(conn.closed().await, expected);
}

// =========================================================================
// Termination
// =========================================================================

#[tokio::test]
async fn test_unsupported_version_response_terminates() {
    let (conn, _events) = ready("echo").await;
    let result = conn.call("bad_version", Payload::Null).await;
    let expected = ExitReason::UnsupportedVersion { found: "2".into() };
    assert_eq!(result, Err(BridgeError::Closed(expected.clone())));
    assert_eq!(conn.closed().await, expected);
}

#[tokio::test]
async fn test_exit_code_is_preserved() {
    let (conn, _events) = ready("echo").await;
    let result = conn.call("exit", payload(json!({"code": 7}))).await;
    let expected = ExitReason::ProcessExited { code: Some(7) };
    assert_eq!(result, Err(BridgeError::Closed(expected.clone())));
    assert_eq!(conn.closed().await, expected);
}

#[tokio::test]
async fn test_shutdown_fails_pending_commands() {
    let (conn, _events) = ready("echo").await;

    let pending = conn.send("ignore", Payload::Null, None);
    // Let the command reach the connection task before shutting down.
    conn.call("echo", Payload::Null).await.unwrap();

    assert_eq!(conn.shutdown().await, ExitReason::Shutdown);
    assert_eq!(pending.await, Err(BridgeError::Closed(ExitReason::Shutdown)));
    assert_eq!(
        conn.call("echo", Payload::Null).await,
        Err(BridgeError::Closed(ExitReason::Shutdown))
    );
}

#[tokio::test]
async fn test_oversized_line_is_fatal() {
    let mut config = config("echo");
    config.max_line_bytes = 1024;
    let (conn, _events) = start_with(config, Arc::new(MemoryStore::new()));
    conn.wait_ready().await.unwrap();

    let result = conn.call("flood", payload(json!({"bytes": 4096}))).await;
    let expected = ExitReason::LineTooLong { limit: 1024 };
    assert_eq!(result, Err(BridgeError::Closed(expected.clone())));
    assert_eq!(conn.closed().await, expected);
}
