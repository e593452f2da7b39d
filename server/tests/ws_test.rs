//! Integration tests for WebSocket fan-out, presence, history and heartbeat.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use chatroom_server::chat::log::SqliteMessageLog;
use chatroom_server::config::PresenceConfig;
use chatroom_server::identity::InMemoryProfiles;
use chatroom_server::ws::protocol::{self, Envelope, NotificationEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

struct TestServer {
    addr: SocketAddr,
    _tmp_dir: tempfile::TempDir,
}

impl TestServer {
    fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

/// Helper: start the server on a random port with alice, bob and carol registered.
async fn start_test_server(presence: PresenceConfig) -> TestServer {
    let tmp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data_dir = tmp_dir.path().to_str().unwrap().to_string();
    let db = chatroom_server::db::init_db(&data_dir).expect("Failed to init DB");

    let state = chatroom_server::state::AppState::new(
        presence,
        Arc::new(InMemoryProfiles::with_users(["alice", "bob", "carol"])),
        Arc::new(SqliteMessageLog::new(db)),
    );

    let app = chatroom_server::routes::build_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestServer {
        addr,
        _tmp_dir: tmp_dir,
    }
}

async fn connect(server: &TestServer) -> (WsWrite, WsRead) {
    let (ws, _) = tokio_tungstenite::connect_async(server.ws_url())
        .await
        .expect("Failed to connect WebSocket");
    ws.split()
}

async fn send_json(write: &mut WsWrite, value: Value) {
    write
        .send(Message::Text(value.to_string().into()))
        .await
        .expect("Failed to send frame");
}

/// Next chat, file or error envelope, skipping heartbeats and presence notices.
async fn next_message(read: &mut WsRead, wait: Duration) -> Option<(String, Envelope)> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let frame = tokio::time::timeout_at(deadline, read.next()).await.ok()??;
        match frame {
            Ok(Message::Text(text)) => {
                let envelope = protocol::decode(text.as_str()).expect("Server sent invalid envelope");
                match envelope {
                    Envelope::Heartbeat { .. } | Envelope::Notification(_) => continue,
                    other => return Some((text.as_str().to_string(), other)),
                }
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

async fn presence(server: &TestServer) -> Value {
    reqwest::get(server.http_url("/api/presence"))
        .await
        .expect("Presence request failed")
        .json()
        .await
        .expect("Presence response is JSON")
}

/// Poll the presence endpoint until `username` is bound.
async fn wait_until_online(server: &TestServer, username: &str) {
    for _ in 0..50 {
        let snapshot = presence(server).await;
        let online = snapshot["online"].as_array().cloned().unwrap_or_default();
        if online.iter().any(|name| name == username) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{} never came online", username);
}

/// Bind `username` to a connection by sending a message to an offline target.
async fn identify(server: &TestServer, write: &mut WsWrite, username: &str) {
    send_json(
        write,
        json!({"type": "chat", "username": username, "target": "nobody", "content": "hello?"}),
    )
    .await;
    wait_until_online(server, username).await;
}

const SHORT: Duration = Duration::from_millis(300);
const LONG: Duration = Duration::from_secs(3);

#[tokio::test]
async fn test_health_endpoint() {
    let server = start_test_server(PresenceConfig::default()).await;
    let body = reqwest::get(server.http_url("/health"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "ok");
}

#[tokio::test]
async fn test_broadcast_reaches_everyone_except_sender() {
    let server = start_test_server(PresenceConfig::default()).await;
    let (mut alice_w, mut alice_r) = connect(&server).await;
    let (mut bob_w, mut bob_r) = connect(&server).await;
    let (mut carol_w, mut carol_r) = connect(&server).await;
    identify(&server, &mut alice_w, "alice").await;
    identify(&server, &mut bob_w, "bob").await;
    identify(&server, &mut carol_w, "carol").await;

    let frame = json!({"type": "chat", "username": "alice", "target": "all", "content": "hi room"});
    send_json(&mut alice_w, frame.clone()).await;

    for read in [&mut bob_r, &mut carol_r] {
        let (text, envelope) = next_message(read, LONG).await.expect("Expected chat");
        assert_eq!(serde_json::from_str::<Value>(&text).unwrap(), frame);
        match envelope {
            Envelope::Chat(chat) => {
                assert_eq!(chat.username, "alice");
                assert_eq!(chat.content, "hi room");
            }
            other => panic!("Expected chat, got: {:?}", other),
        }
    }
    assert!(next_message(&mut alice_r, SHORT).await.is_none(), "Sender must not get an echo");
}

#[tokio::test]
async fn test_unicast_reaches_only_target() {
    let server = start_test_server(PresenceConfig::default()).await;
    let (mut alice_w, _alice_r) = connect(&server).await;
    let (mut bob_w, mut bob_r) = connect(&server).await;
    let (mut carol_w, mut carol_r) = connect(&server).await;
    identify(&server, &mut alice_w, "alice").await;
    identify(&server, &mut bob_w, "bob").await;
    identify(&server, &mut carol_w, "carol").await;

    send_json(
        &mut alice_w,
        json!({"type": "file", "username": "alice", "target": "bob", "fileId": "f-1", "fileName": "notes.pdf", "fileSize": 2048}),
    )
    .await;

    let (_, envelope) = next_message(&mut bob_r, LONG).await.expect("Expected file");
    match envelope {
        Envelope::File(file) => {
            assert_eq!(file.file_id, "f-1");
            assert_eq!(file.file_name, "notes.pdf");
            assert_eq!(file.file_size, Some(2048));
        }
        other => panic!("Expected file, got: {:?}", other),
    }
    assert!(next_message(&mut carol_r, SHORT).await.is_none());
}

#[tokio::test]
async fn test_malformed_frame_gets_single_error() {
    let server = start_test_server(PresenceConfig::default()).await;
    let (mut alice_w, mut alice_r) = connect(&server).await;
    let (mut bob_w, mut bob_r) = connect(&server).await;
    identify(&server, &mut alice_w, "alice").await;
    identify(&server, &mut bob_w, "bob").await;

    alice_w
        .send(Message::Text("{not json".into()))
        .await
        .unwrap();

    let (_, envelope) = next_message(&mut alice_r, LONG).await.expect("Expected error");
    assert!(matches!(envelope, Envelope::Error { .. }));
    assert!(next_message(&mut alice_r, SHORT).await.is_none(), "Exactly one error");
    assert!(next_message(&mut bob_r, SHORT).await.is_none());

    // The connection stays usable
    send_json(&mut alice_w, json!({"type": "chat", "username": "alice", "content": "still here"})).await;
    let (_, envelope) = next_message(&mut bob_r, LONG).await.expect("Expected chat");
    assert!(matches!(envelope, Envelope::Chat(chat) if chat.content == "still here"));
}

#[tokio::test]
async fn test_unknown_user_rejected() {
    let server = start_test_server(PresenceConfig::default()).await;
    let (mut mallory_w, mut mallory_r) = connect(&server).await;

    send_json(&mut mallory_w, json!({"type": "chat", "username": "mallory", "content": "hi"})).await;

    match next_message(&mut mallory_r, LONG).await {
        Some((_, Envelope::Error { message })) => assert!(message.starts_with("unknown user")),
        other => panic!("Expected error, got: {:?}", other),
    }
    let snapshot = presence(&server).await;
    assert_eq!(snapshot["online"], json!([]));
    assert_eq!(snapshot["connections"], 1);
}

#[tokio::test]
async fn test_presence_join_and_leave() {
    let server = start_test_server(PresenceConfig::default()).await;
    let (mut alice_w, alice_r) = connect(&server).await;
    let (mut bob_w, mut bob_r) = connect(&server).await;
    identify(&server, &mut bob_w, "bob").await;
    identify(&server, &mut alice_w, "alice").await;

    // Bob hears about alice joining
    let mut saw_join = false;
    let deadline = tokio::time::Instant::now() + LONG;
    while let Ok(Some(Ok(Message::Text(text)))) = tokio::time::timeout_at(deadline, bob_r.next()).await {
        if let Ok(Envelope::Notification(n)) = protocol::decode(text.as_str()) {
            if n.event == NotificationEvent::Join && n.username.as_deref() == Some("alice") {
                assert_eq!(n.online, Some(2));
                saw_join = true;
                break;
            }
        }
    }
    assert!(saw_join, "Expected join notification for alice");

    let snapshot = presence(&server).await;
    assert_eq!(snapshot["online"], json!(["alice", "bob"]));
    assert_eq!(snapshot["connections"], 2);

    // Alice leaves
    let mut alice = alice_w.reunite(alice_r).unwrap();
    alice.close(None).await.unwrap();

    let mut saw_leave = false;
    let deadline = tokio::time::Instant::now() + LONG;
    while let Ok(Some(Ok(Message::Text(text)))) = tokio::time::timeout_at(deadline, bob_r.next()).await {
        if let Ok(Envelope::Notification(n)) = protocol::decode(text.as_str()) {
            if n.event == NotificationEvent::Leave && n.username.as_deref() == Some("alice") {
                saw_leave = true;
                break;
            }
        }
    }
    assert!(saw_leave, "Expected leave notification for alice");
    assert_eq!(presence(&server).await["online"], json!(["bob"]));
}

#[tokio::test]
async fn test_recent_messages_history() {
    let server = start_test_server(PresenceConfig::default()).await;
    let (mut alice_w, _alice_r) = connect(&server).await;
    let (mut bob_w, _bob_r) = connect(&server).await;
    identify(&server, &mut alice_w, "alice").await;
    identify(&server, &mut bob_w, "bob").await;

    send_json(&mut alice_w, json!({"type": "chat", "username": "alice", "content": "first"})).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    send_json(&mut bob_w, json!({"type": "chat", "username": "bob", "content": "second"})).await;

    let url = server.http_url("/api/messages/recent?limit=1");
    let mut newest = Value::Null;
    for _ in 0..50 {
        let page: Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
        if page[0]["content"] == "second" {
            newest = page;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(newest.as_array().map(|a| a.len()), Some(1));
    assert_eq!(newest[0]["sender"], "bob");
    assert_eq!(newest[0]["kind"], "text");

    // identify() messages plus the two chats
    let all: Value = reqwest::get(server.http_url("/api/messages/recent"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(all.as_array().map(|a| a.len()), Some(4));
}

fn fast_heartbeat() -> PresenceConfig {
    PresenceConfig {
        probe_interval_secs: 1,
        liveness_timeout_secs: 3,
        ..PresenceConfig::default()
    }
}

#[tokio::test]
async fn test_server_sends_heartbeat_probe() {
    let server = start_test_server(fast_heartbeat()).await;
    let (_write, mut read) = connect(&server).await;

    let deadline = tokio::time::Instant::now() + LONG;
    let mut timestamp = None;
    while let Ok(Some(Ok(frame))) = tokio::time::timeout_at(deadline, read.next()).await {
        if let Message::Text(text) = frame {
            if let Ok(Envelope::Heartbeat { timestamp: ts }) = protocol::decode(text.as_str()) {
                timestamp = ts;
                break;
            }
        }
    }
    assert!(timestamp.is_some_and(|ts| ts > 0), "Expected heartbeat with timestamp");
}

#[tokio::test]
async fn test_responsive_client_stays_connected() {
    let server = start_test_server(fast_heartbeat()).await;
    let (mut write, mut read) = connect(&server).await;
    identify(&server, &mut write, "alice").await;

    // Keep reading so tungstenite answers the server's pings
    let reader = tokio::spawn(async move { while read.next().await.is_some() {} });
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(presence(&server).await["online"], json!(["alice"]));
    reader.abort();
}

#[tokio::test]
async fn test_silent_client_is_evicted() {
    let server = start_test_server(fast_heartbeat()).await;
    // Never polled: no pongs, no frames
    let (mut write, _read) = connect(&server).await;
    identify(&server, &mut write, "bob").await;

    tokio::time::sleep(Duration::from_secs(6)).await;

    let snapshot = presence(&server).await;
    assert_eq!(snapshot["online"], json!([]));
    assert_eq!(snapshot["connections"], 0);
}
