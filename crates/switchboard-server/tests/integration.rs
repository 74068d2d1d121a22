//! End-to-end tests against a real server with real WebSocket clients.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::{Value, json};
use tokio::time::{Instant, sleep, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use switchboard_auth::CredentialValidator;
use switchboard_server::config::ServerConfig;
use switchboard_server::metrics::detached_handle;
use switchboard_server::sync::{SyncOrigin, parse_sync_id};
use switchboard_server::{Collaborators, ConnectionManager, InMemoryDirectory, SwitchboardServer};
use switchboard_settings::{RateLimitSettings, RateRule};

const TIMEOUT: Duration = Duration::from_secs(5);
const SECRET: &[u8] = b"integration-test-secret";

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

// ── Harness ──

struct TestServer {
    url: String,
    server: SwitchboardServer,
    directory: Arc<InMemoryDirectory>,
}

impl TestServer {
    fn manager(&self) -> &Arc<ConnectionManager> {
        self.server.manager()
    }
}

fn test_config() -> ServerConfig {
    ServerConfig {
        heartbeat_interval: Duration::from_secs(30),
        heartbeat_timeout: Duration::from_secs(60),
        auth_timeout: Duration::from_secs(5),
        eviction_flush: Duration::from_millis(50),
        grace_period: Duration::from_millis(300),
        close_flush: Duration::from_millis(300),
        rate_limits: RateLimitSettings {
            typing: RateRule::new(5, 60_000),
            ..RateLimitSettings::default()
        },
        ..ServerConfig::default()
    }
}

async fn boot(config: ServerConfig) -> TestServer {
    let directory = Arc::new(InMemoryDirectory::new());
    let manager = ConnectionManager::new(
        config,
        CredentialValidator::new(SECRET, Algorithm::HS256),
        Collaborators::from_directory(directory.clone()),
    );
    let server = SwitchboardServer::new(Arc::new(manager), detached_handle());
    let (addr, _handle) = server.listen().await.unwrap();
    TestServer {
        url: format!("ws://{addr}/ws"),
        server,
        directory,
    }
}

fn mint(claims: &HashMap<&str, Value>) -> String {
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(SECRET),
    )
    .unwrap()
}

fn token(email: &str) -> String {
    mint(&HashMap::from([
        ("sub", json!(email)),
        ("email", json!(email)),
        ("exp", json!(Utc::now().timestamp() + 600)),
    ]))
}

fn expired_token(email: &str) -> String {
    mint(&HashMap::from([
        ("sub", json!(email)),
        ("exp", json!(Utc::now().timestamp() - 3_600)),
    ]))
}

async fn connect(url: &str) -> WsStream {
    let (ws, _) = timeout(TIMEOUT, connect_async(url))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    ws
}

async fn connect_with_token(url: &str, token: &str) -> WsStream {
    connect(&format!("{url}?token={token}")).await
}

async fn connect_with_header(url: &str, token: &str) -> WsStream {
    let mut request = url.into_client_request().unwrap();
    let _ = request
        .headers_mut()
        .insert("authorization", format!("Bearer {token}").parse().unwrap());
    let (ws, _) = timeout(TIMEOUT, connect_async(request))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    ws
}

async fn send(ws: &mut WsStream, frame: Value) {
    ws.send(Message::text(frame.to_string())).await.unwrap();
}

/// Next text frame, skipping control frames.
async fn read_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream closed")
            .expect("ws error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Close(frame) => panic!("unexpected close: {frame:?}"),
            _ => {}
        }
    }
}

async fn read_until(ws: &mut WsStream, event_type: &str) -> Value {
    loop {
        let msg = read_json(ws).await;
        if msg["type"] == event_type {
            return msg;
        }
    }
}

/// Every text frame up to the close frame, and the close frame's code and
/// reason (`None` if the stream ended without one).
async fn read_to_close(ws: &mut WsStream) -> (Vec<Value>, Option<(u16, String)>) {
    let mut frames = Vec::new();
    loop {
        let next = timeout(TIMEOUT, ws.next()).await.expect("timeout waiting for close");
        match next {
            Some(Ok(Message::Text(text))) => frames.push(serde_json::from_str(text.as_str()).unwrap()),
            Some(Ok(Message::Close(frame))) => {
                let close = frame.map(|f| (u16::from(f.code), f.reason.as_str().to_owned()));
                return (frames, close);
            }
            Some(Ok(_)) => {}
            Some(Err(_)) | None => return (frames, None),
        }
    }
}

fn count(frames: &[Value], event_type: &str) -> usize {
    frames.iter().filter(|f| f["type"] == event_type).count()
}

fn error_count(frames: &[Value], code: &str) -> usize {
    frames
        .iter()
        .filter(|f| f["type"] == "error" && f["data"]["error"] == code)
        .count()
}

/// Poll `check` until it holds.
async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(10)).await;
    }
}

async fn join(ws: &mut WsStream, conversation: &str) {
    send(ws, json!({"type": "join-conversation", "data": {"conversationId": conversation}})).await;
    let ack = read_until(ws, "conversation-joined").await;
    assert_eq!(ack["data"]["conversationId"], conversation);
}

// ── Handshake ──

#[tokio::test]
async fn handshake_token_authenticates_and_syncs() {
    let ts = boot(test_config()).await;
    let mut ws = connect_with_token(&ts.url, &token("u1@example.com")).await;

    let established = read_json(&mut ws).await;
    assert_eq!(established["type"], "connection-established");
    assert!(established["data"]["connectionId"].as_str().unwrap().starts_with("conn_"));
    assert!(established["timestamp"].is_string());

    let authenticated = read_json(&mut ws).await;
    assert_eq!(authenticated["type"], "authenticated");
    assert_eq!(authenticated["data"]["email"], "u1@example.com");

    let synced = read_json(&mut ws).await;
    assert_eq!(synced["type"], "state-synced");
    let sync_id = synced["data"]["syncId"].as_str().unwrap();
    assert_matches!(parse_sync_id(sync_id), Some((SyncOrigin::Initial, _)));
    assert_eq!(synced["data"]["onlineUsers"], json!(["u1@example.com"]));
}

#[tokio::test]
async fn authorization_header_is_equivalent() {
    let ts = boot(test_config()).await;
    let mut ws = connect_with_header(&ts.url, &token("u1@example.com")).await;
    let authenticated = read_until(&mut ws, "authenticated").await;
    assert_eq!(authenticated["data"]["userId"], "u1@example.com");
    assert_eq!(ts.manager().registry().session_count(), 1);
}

#[tokio::test]
async fn in_band_authenticate_payload() {
    let ts = boot(test_config()).await;
    let mut ws = connect(&ts.url).await;
    let _ = read_until(&mut ws, "connection-established").await;
    send(&mut ws, json!({"type": "authenticate", "data": {"token": token("u1@example.com")}})).await;
    let authenticated = read_until(&mut ws, "authenticated").await;
    assert_eq!(authenticated["data"]["userId"], "u1@example.com");
}

#[tokio::test]
async fn expired_credential_is_rejected_and_closed() {
    let ts = boot(test_config()).await;
    let mut ws = connect_with_token(&ts.url, &expired_token("u1@example.com")).await;

    let (frames, close) = read_to_close(&mut ws).await;
    let reject = frames.iter().find(|f| f["type"] == "connect-error").unwrap();
    assert_eq!(reject["data"]["error"], "EXPIRED_CREDENTIAL");
    assert_eq!(reject["data"]["category"], "AUTHENTICATION_FAILED");
    assert_eq!(count(&frames, "authenticated"), 0);
    assert_eq!(close, Some((4401, "EXPIRED_CREDENTIAL".to_owned())));

    eventually("release", || ts.manager().registry().connection_count() == 0).await;
    assert_eq!(ts.manager().registry().session_count(), 0);
}

#[tokio::test]
async fn malformed_credential_is_rejected() {
    let ts = boot(test_config()).await;
    let mut ws = connect_with_header(&ts.url, "not-a-token").await;
    let (frames, close) = read_to_close(&mut ws).await;
    let reject = frames.iter().find(|f| f["type"] == "connect-error").unwrap();
    assert_eq!(reject["data"]["error"], "MALFORMED_CREDENTIAL");
    assert_eq!(close.unwrap().0, 4401);
}

#[tokio::test]
async fn silent_unauthenticated_connection_hits_deadline() {
    let ts = boot(ServerConfig {
        auth_timeout: Duration::from_millis(150),
        ..test_config()
    })
    .await;
    let mut ws = connect(&ts.url).await;
    let (frames, close) = read_to_close(&mut ws).await;
    let reject = frames.iter().find(|f| f["type"] == "connect-error").unwrap();
    assert_eq!(reject["data"]["error"], "AUTHENTICATION_REQUIRED");
    assert_eq!(reject["data"]["category"], "AUTHENTICATION_REQUIRED");
    assert_eq!(close, Some((4401, "AUTHENTICATION_REQUIRED".to_owned())));
    eventually("release", || ts.manager().registry().connection_count() == 0).await;
}

// ── Registry size under load ──

#[tokio::test]
async fn concurrent_identities_tracked_then_released() {
    let ts = boot(test_config()).await;
    const N: usize = 40;

    let mut clients = Vec::new();
    for i in 0..N {
        let mut ws = connect_with_token(&ts.url, &token(&format!("user{i}@example.com"))).await;
        let _ = read_until(&mut ws, "authenticated").await;
        clients.push(ws);
    }
    assert_eq!(ts.manager().registry().connection_count(), N);
    assert_eq!(ts.manager().registry().session_count(), N);
    assert_eq!(ts.manager().stats().connections.by_role["agent"], N);

    for mut ws in clients {
        ws.close(None).await.unwrap();
    }
    eventually("all released", || ts.manager().registry().connection_count() == 0).await;
    assert_eq!(ts.manager().registry().session_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connect_disconnect_churn_leaves_no_residue() {
    let ts = boot(test_config()).await;

    let mut tasks = Vec::new();
    for i in 0..150 {
        let url = ts.url.clone();
        tasks.push(tokio::spawn(async move {
            let mut ws = connect_with_token(&url, &token(&format!("churn{i}@example.com"))).await;
            let _ = read_until(&mut ws, "authenticated").await;
            send(&mut ws, json!({"type": "join-conversation", "data": {"conversationId": format!("room{}", i % 10)}})).await;
            let _ = read_until(&mut ws, "conversation-joined").await;
            ws.close(None).await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let registry = ts.manager().registry();
    eventually("churn drained", || registry.connection_count() == 0).await;
    assert_eq!(registry.session_count(), 0);
    assert_eq!(registry.room_count(), 0);
    assert_eq!(registry.accepted_total(), 150);
    let stats = ts.manager().stats();
    assert_eq!(stats.memory.rate_buckets, 0);
    assert_eq!(stats.memory.listener_handles, 0);
}

// ── One live connection per identity ──

#[tokio::test]
async fn reconnect_supersedes_previous_connection() {
    let ts = boot(test_config()).await;
    let mut first = connect_with_token(&ts.url, &token("u1@example.com")).await;
    let _ = read_until(&mut first, "state-synced").await;
    join(&mut first, "c1").await;

    let mut second = connect_with_token(&ts.url, &token("u1@example.com")).await;
    let _ = read_until(&mut second, "authenticated").await;

    let (frames, close) = read_to_close(&mut first).await;
    let notice = frames.iter().find(|f| f["type"] == "sync-required").unwrap();
    assert_eq!(notice["data"]["reason"], "new_session_detected");
    assert_eq!(close, Some((4409, "SESSION_SUPERSEDED".to_owned())));

    let registry = ts.manager().registry();
    eventually("first released", || registry.connection_count() == 1).await;
    assert_eq!(registry.session_count(), 1);
    assert_eq!(registry.room_count(), 0);

    // the replacement is fully functional
    join(&mut second, "c1").await;
}

// ── Rate limiting ──

#[tokio::test]
async fn rapid_typing_is_limited_but_connection_survives() {
    let ts = boot(test_config()).await;
    let mut ws = connect_with_token(&ts.url, &token("u1@example.com")).await;
    let _ = read_until(&mut ws, "state-synced").await;
    assert_eq!(ts.manager().registry().connection_count(), 1);

    join(&mut ws, "c1").await;
    for _ in 0..10 {
        send(&mut ws, json!({"type": "typing", "data": {"conversationId": "c1"}})).await;
    }
    send(&mut ws, json!({"type": "sync-state", "data": {"syncId": "after-typing"}})).await;

    let mut frames = Vec::new();
    loop {
        let frame = read_json(&mut ws).await;
        let done = frame["type"] == "state-synced";
        frames.push(frame);
        if done {
            break;
        }
    }
    assert!(error_count(&frames, "RATE_LIMIT_EXCEEDED") >= 1);
    let limited = frames
        .iter()
        .find(|f| f["data"]["error"] == "RATE_LIMIT_EXCEEDED")
        .unwrap();
    assert_eq!(limited["data"]["eventType"], "typing");
    assert_eq!(frames.last().unwrap()["data"]["syncId"], "after-typing");

    ws.close(None).await.unwrap();
    eventually("release", || ts.manager().registry().connection_count() == 0).await;
}

#[tokio::test]
async fn typing_at_threshold_is_never_limited() {
    let ts = boot(test_config()).await;
    let mut ws = connect_with_token(&ts.url, &token("u1@example.com")).await;
    let _ = read_until(&mut ws, "state-synced").await;

    for _ in 0..5 {
        send(&mut ws, json!({"type": "typing", "data": {"conversationId": "c1"}})).await;
    }
    send(&mut ws, json!({"type": "sync-state", "data": {"syncId": "s"}})).await;

    let mut frames = Vec::new();
    loop {
        let frame = read_json(&mut ws).await;
        let done = frame["type"] == "state-synced";
        frames.push(frame);
        if done {
            break;
        }
    }
    assert_eq!(error_count(&frames, "RATE_LIMIT_EXCEEDED"), 0);
}

// ── Fan-out ──

#[tokio::test]
async fn typing_fans_out_to_other_members() {
    let ts = boot(test_config()).await;
    let mut a = connect_with_token(&ts.url, &token("a@example.com")).await;
    let mut b = connect_with_token(&ts.url, &token("b@example.com")).await;
    let _ = read_until(&mut a, "state-synced").await;
    let _ = read_until(&mut b, "state-synced").await;
    join(&mut a, "c1").await;
    join(&mut b, "c1").await;

    send(&mut a, json!({"type": "typing", "data": {"conversationId": "c1"}})).await;
    let typing = read_until(&mut b, "typing").await;
    assert_eq!(typing["data"]["conversationId"], "c1");
    assert_eq!(typing["data"]["userEmail"], "a@example.com");
}

#[tokio::test]
async fn one_senders_messages_arrive_in_order() {
    let ts = boot(test_config()).await;
    let mut a = connect_with_token(&ts.url, &token("a@example.com")).await;
    let mut b = connect_with_token(&ts.url, &token("b@example.com")).await;
    let _ = read_until(&mut a, "state-synced").await;
    let _ = read_until(&mut b, "state-synced").await;
    join(&mut a, "c1").await;
    join(&mut b, "c1").await;

    for seq in 0..10 {
        send(
            &mut a,
            json!({"type": "new-message", "data": {"conversationId": "c1", "content": "hi", "seq": seq}}),
        )
        .await;
    }
    let mut seqs = Vec::new();
    while seqs.len() < 10 {
        let msg = read_until(&mut b, "new-message").await;
        assert_eq!(msg["data"]["senderEmail"], "a@example.com");
        seqs.push(msg["data"]["seq"].as_i64().unwrap());
    }
    assert_eq!(seqs, (0..10).collect::<Vec<_>>());
    assert_eq!(ts.directory.accepted_messages().len(), 10);
}

#[tokio::test]
async fn unauthenticated_events_are_refused_and_never_broadcast() {
    let ts = boot(test_config()).await;
    let mut member = connect_with_token(&ts.url, &token("member@example.com")).await;
    let mut speaker = connect_with_token(&ts.url, &token("speaker@example.com")).await;
    let _ = read_until(&mut member, "state-synced").await;
    let _ = read_until(&mut speaker, "state-synced").await;
    join(&mut member, "c1").await;
    join(&mut speaker, "c1").await;

    let mut anon = connect(&ts.url).await;
    let _ = read_until(&mut anon, "connection-established").await;
    send(&mut anon, json!({"type": "typing", "data": {"conversationId": "c1"}})).await;
    send(
        &mut anon,
        json!({"type": "new-message", "data": {"conversationId": "c1", "content": "spam"}}),
    )
    .await;
    let first = read_json(&mut anon).await;
    let second = read_json(&mut anon).await;
    for (frame, event) in [(&first, "typing"), (&second, "new-message")] {
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["data"]["error"], "AUTHENTICATION_REQUIRED");
        assert_eq!(frame["data"]["eventType"], event);
    }

    // the next thing the member sees is the authenticated speaker's event
    send(&mut speaker, json!({"type": "typing", "data": {"conversationId": "c1"}})).await;
    let next = read_json(&mut member).await;
    assert_eq!(next["type"], "typing");
    assert_eq!(next["data"]["userEmail"], "speaker@example.com");
    assert!(ts.directory.accepted_messages().is_empty());
}

// ── State sync ──

#[tokio::test]
async fn sync_echoes_or_generates_correlation_id() {
    let ts = boot(test_config()).await;
    ts.directory.set_unread("u1@example.com", "c1", 7);
    let mut ws = connect_with_token(&ts.url, &token("u1@example.com")).await;
    let _ = read_until(&mut ws, "state-synced").await;

    send(&mut ws, json!({"type": "sync-state", "data": {"syncId": "X"}})).await;
    let echoed = read_until(&mut ws, "state-synced").await;
    assert_eq!(echoed["data"]["syncId"], "X");
    assert_eq!(echoed["data"]["unreadCounts"]["c1"], 7);
    assert!(echoed["data"]["serverTime"].is_string());

    send(&mut ws, json!({"type": "sync-state"})).await;
    let generated = read_until(&mut ws, "state-synced").await;
    let sync_id = generated["data"]["syncId"].as_str().unwrap();
    assert_matches!(parse_sync_id(sync_id), Some((SyncOrigin::Requested, _)));
}

// ── Drain ──

#[tokio::test]
async fn drain_notifies_each_connection_once_and_empties_registry() {
    let ts = boot(test_config()).await;
    let mut clients = Vec::new();
    for i in 0..3 {
        let mut ws = connect_with_token(&ts.url, &token(&format!("d{i}@example.com"))).await;
        let _ = read_until(&mut ws, "state-synced").await;
        clients.push(ws);
    }

    let manager = ts.manager().clone();
    let drain = tokio::spawn(async move { manager.drain("maintenance").await });

    for ws in &mut clients {
        let (frames, close) = read_to_close(ws).await;
        assert_eq!(count(&frames, "server-shutdown"), 1);
        let notice = frames.iter().find(|f| f["type"] == "server-shutdown").unwrap();
        assert_eq!(notice["data"]["reason"], "maintenance");
        assert!(notice["data"]["message"].is_string());
        assert!(notice["data"]["timestamp"].is_string());
        assert_eq!(close, Some((1001, "SERVER_SHUTTING_DOWN".to_owned())));
    }

    let report = drain.await.unwrap().unwrap();
    assert_eq!(report.notified, 3);
    assert_eq!(ts.manager().registry().connection_count(), 0);
    assert_eq!(ts.manager().registry().session_count(), 0);

    assert!(ts.manager().drain("again").await.is_none());
}

#[tokio::test]
async fn upgrades_refused_while_draining() {
    let ts = boot(ServerConfig {
        grace_period: Duration::from_secs(2),
        ..test_config()
    })
    .await;
    let mut holder = connect_with_token(&ts.url, &token("holder@example.com")).await;
    let _ = read_until(&mut holder, "state-synced").await;

    let manager = ts.manager().clone();
    let drain = tokio::spawn(async move { manager.drain("deploy").await });
    let _ = read_until(&mut holder, "server-shutdown").await;

    let err = connect_async(ts.url.as_str()).await.unwrap_err();
    assert_matches!(err, WsError::Http(resp) if resp.status() == 503);

    holder.close(None).await.unwrap();
    let report = drain.await.unwrap().unwrap();
    assert_eq!(report.closed, 0);
}

#[tokio::test]
async fn connection_limit_refuses_upgrade() {
    let ts = boot(ServerConfig {
        max_connections: 1,
        ..test_config()
    })
    .await;
    let mut first = connect(&ts.url).await;
    let _ = read_until(&mut first, "connection-established").await;

    let err = connect_async(ts.url.as_str()).await.unwrap_err();
    assert_matches!(err, WsError::Http(resp) if resp.status() == 503);
}

// ── Liveness ──

#[tokio::test]
async fn silent_client_times_out() {
    let ts = boot(ServerConfig {
        heartbeat_interval: Duration::from_millis(50),
        heartbeat_timeout: Duration::from_millis(150),
        ..test_config()
    })
    .await;
    let mut ws = connect_with_token(&ts.url, &token("quiet@example.com")).await;

    // not reading means no pong goes back
    let registry = ts.manager().registry();
    eventually("tracked", || registry.connection_count() == 1).await;
    eventually("heartbeat close", || {
        registry
            .connections_snapshot()
            .iter()
            .any(|conn| conn.is_closing())
    })
    .await;
    // the server holds the transport open until our close reply
    assert_eq!(registry.connection_count(), 1);
    let (_, close) = read_to_close(&mut ws).await;
    assert_eq!(close, Some((4408, "HEARTBEAT_TIMEOUT".to_owned())));
    eventually("released", || registry.connection_count() == 0).await;
}

#[tokio::test]
async fn unanswered_close_is_released_after_flush_window() {
    let ts = boot(ServerConfig {
        heartbeat_interval: Duration::from_millis(50),
        heartbeat_timeout: Duration::from_millis(150),
        close_flush: Duration::from_millis(100),
        ..test_config()
    })
    .await;
    let _ws = connect_with_token(&ts.url, &token("mute@example.com")).await;

    // the client never reads, so it never answers the close frame
    let registry = ts.manager().registry();
    eventually("tracked", || registry.connection_count() == 1).await;
    eventually("released", || registry.connection_count() == 0).await;
}
