use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use occupant::audit::MemoryAuditSink;
use occupant::engine::{Engine, now_ms};
use occupant::gateway;
use occupant::model::*;
use occupant::notify::NotifyHub;

// ── Test infrastructure ──────────────────────────────────────

struct TestServer {
    addr: SocketAddr,
    engine: Arc<Engine>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

async fn start_test_server(max_connections: usize) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("occupant_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(
        Engine::new(
            dir.join("occupant.wal"),
            Arc::new(NotifyHub::new()),
            Arc::new(MemoryAuditSink::new()),
        )
        .unwrap(),
    );

    let cancel = CancellationToken::new();
    let task = tokio::spawn(gateway::serve(
        listener,
        engine.clone(),
        max_connections,
        Duration::from_secs(1),
        cancel.clone(),
    ));

    TestServer {
        addr,
        engine,
        cancel,
        task,
    }
}

type Client = Framed<TcpStream, LinesCodec>;

async fn connect(addr: SocketAddr) -> Client {
    let socket = TcpStream::connect(addr).await.unwrap();
    Framed::new(socket, LinesCodec::new())
}

/// Read one line with timeout and parse it.
async fn recv(client: &mut Client) -> Option<Value> {
    let line = tokio::time::timeout(Duration::from_secs(2), client.next())
        .await
        .ok()??
        .ok()?;
    Some(serde_json::from_str(&line).unwrap())
}

async fn request(client: &mut Client, body: Value) -> Value {
    client.send(body.to_string()).await.unwrap();
    recv(client).await.expect("no response")
}

async fn inactive_resource(engine: &Engine, device_id: &str) -> ResourceInfo {
    engine
        .create_resource(NewResource {
            device_id: device_id.into(),
            name: format!("Locker {device_id}"),
            kind: "locker".into(),
            status: None,
            timeout_minutes: 30,
            locked_for_admin: false,
        })
        .await
        .unwrap()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn first_connection_handshake_activates_resource() {
    let server = start_test_server(16).await;
    let res = inactive_resource(&server.engine, "locker-1").await;
    let mut client = connect(server.addr).await;

    let resp = request(
        &mut client,
        json!({"op": "report_status", "resource_id": "locker-1", "status": "livre",
               "timestamp": now_ms(), "first_connection": true}),
    )
    .await;
    assert_eq!(resp["ok"], true, "{resp}");
    assert_eq!(resp["previous"], "INACTIVE");
    assert_eq!(resp["status"], "FREE");
    assert_eq!(resp["auto_activated"], true);

    let resp = request(&mut client, json!({"op": "get_status", "resource_id": "locker-1"})).await;
    assert_eq!(resp["ok"], true);
    assert_eq!(resp["status"], "FREE");
    assert_eq!(resp["occupant"], Value::Null);

    let info = server.engine.get_resource(res.id).await.unwrap();
    assert_eq!(info.status, ResourceStatus::Free);
}

#[tokio::test]
async fn bad_requests_get_errors_and_keep_the_connection() {
    let server = start_test_server(16).await;
    inactive_resource(&server.engine, "locker-1").await;
    let mut client = connect(server.addr).await;

    let resp = request(&mut client, json!({"op": "launch_rockets"})).await;
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["kind"], "invalid_argument");

    client.send("{not json".to_string()).await.unwrap();
    let resp = recv(&mut client).await.unwrap();
    assert_eq!(resp["kind"], "invalid_argument");

    let resp = request(
        &mut client,
        json!({"op": "report_status", "resource_id": "locker-1", "status": "on fire", "timestamp": 1}),
    )
    .await;
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["kind"], "invalid_argument");

    let resp = request(&mut client, json!({"op": "get_status", "resource_id": "ghost"})).await;
    assert_eq!(resp["kind"], "not_found");

    // Still usable
    let resp = request(&mut client, json!({"op": "get_status", "resource_id": "locker-1"})).await;
    assert_eq!(resp["ok"], true);
    assert_eq!(resp["status"], "INACTIVE");
}

#[tokio::test]
async fn over_long_line_is_rejected_not_fatal() {
    let server = start_test_server(16).await;
    inactive_resource(&server.engine, "locker-1").await;
    let mut client = connect(server.addr).await;

    let huge = "x".repeat(occupant::limits::MAX_FRAME_LEN + 10);
    client.send(huge).await.unwrap();
    let resp = recv(&mut client).await.unwrap();
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["kind"], "invalid_argument");

    let resp = request(&mut client, json!({"op": "get_status", "resource_id": "locker-1"})).await;
    assert_eq!(resp["ok"], true);
}

#[tokio::test]
async fn subscriber_receives_commands_and_auto_release_frees() {
    let server = start_test_server(16).await;
    let engine = server.engine.clone();
    let res = inactive_resource(&engine, "locker-1").await;
    let user = Ulid::new();
    engine.register_user(user, "alice", Role::User).await.unwrap();
    let mut device = connect(server.addr).await;

    let resp = request(
        &mut device,
        json!({"op": "report_status", "resource_id": "locker-1", "status": "FREE",
               "timestamp": now_ms(), "first_connection": true}),
    )
    .await;
    assert_eq!(resp["ok"], true);
    let resp = request(&mut device, json!({"op": "subscribe", "resource_id": "locker-1"})).await;
    assert_eq!(resp["ok"], true);
    assert_eq!(resp["subscribed"], "locker-1");

    let now = now_ms();
    let reservation = engine
        .create_reservation(res.id, user, now, now + 3_600_000)
        .await
        .unwrap();

    let pushed = recv(&mut device).await.expect("no command pushed");
    assert_eq!(pushed["command"], "RESERVE");
    assert_eq!(pushed["resource_id"], "locker-1");
    assert_eq!(pushed["reservation_id"], reservation.id.to_string());

    let resp = request(&mut device, json!({"op": "get_status", "resource_id": "locker-1"})).await;
    assert_eq!(resp["status"], "RESERVED");
    assert_eq!(resp["occupant"]["username"], "alice");

    let resp = request(
        &mut device,
        json!({"op": "auto_release", "resource_id": "locker-1", "reason": "door opened", "timestamp": now_ms()}),
    )
    .await;
    assert_eq!(resp["ok"], true, "{resp}");
    assert_eq!(resp["closed"], json!([reservation.id.to_string()]));

    // Retried notification is a no-op, not an error
    let resp = request(
        &mut device,
        json!({"op": "auto_release", "resource_id": "locker-1", "timestamp": now_ms()}),
    )
    .await;
    assert_eq!(resp["ok"], true);
    assert_eq!(resp["closed"], json!([]));

    assert_eq!(
        engine.get_resource(res.id).await.unwrap().status,
        ResourceStatus::Free
    );
    assert!(engine.list_active_for_user(user).await.unwrap().is_empty());
}

#[tokio::test]
async fn subscribe_to_unknown_device_fails() {
    let server = start_test_server(16).await;
    let mut client = connect(server.addr).await;
    let resp = request(&mut client, json!({"op": "subscribe", "resource_id": "ghost"})).await;
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["kind"], "not_found");
}

#[tokio::test]
async fn connections_over_the_limit_are_dropped() {
    let server = start_test_server(1).await;
    inactive_resource(&server.engine, "locker-1").await;

    let mut first = connect(server.addr).await;
    let resp = request(&mut first, json!({"op": "get_status", "resource_id": "locker-1"})).await;
    assert_eq!(resp["ok"], true);

    let mut second = connect(server.addr).await;
    let _ = second
        .send(json!({"op": "get_status", "resource_id": "locker-1"}).to_string())
        .await;
    assert!(recv(&mut second).await.is_none());

    // The first connection is unaffected
    let resp = request(&mut first, json!({"op": "get_status", "resource_id": "locker-1"})).await;
    assert_eq!(resp["ok"], true);
}

#[tokio::test]
async fn cancel_stops_server_and_closes_connections() {
    let server = start_test_server(4).await;
    let mut client = connect(server.addr).await;
    let resp = request(&mut client, json!({"op": "get_status", "resource_id": "ghost"})).await;
    assert_eq!(resp["ok"], false);

    server.cancel.cancel();
    tokio::time::timeout(Duration::from_secs(3), server.task)
        .await
        .expect("server did not stop")
        .unwrap();
    assert!(recv(&mut client).await.is_none());
}
