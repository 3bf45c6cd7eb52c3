//! End-to-end tests of the observer channel: coordinator + hub + axum
//! router driven through a real WebSocket client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use encore_common::Session;
use encore_player::api::{self, AppContext};
use encore_player::backend::mock::MockBackend;
use encore_player::coordinator::{CoordinatorOptions, SessionCoordinator};
use encore_player::hub::StateBroadcaster;
use encore_player::persistence::SessionPersistence;
use encore_player::reattach::HandleStore;
use encore_player::retry::RetryPolicy;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_app(token: Option<String>) -> (SocketAddr, TempDir) {
    let backend = Arc::new(MockBackend::new());
    let dir = tempfile::tempdir().unwrap();
    let hub = StateBroadcaster::new(32);
    let snapshot = Arc::new(RwLock::new(Session::default()));

    let (coordinator, command_tx) = SessionCoordinator::new(CoordinatorOptions {
        initial: Session::default(),
        backend,
        persistence: SessionPersistence::new(
            dir.path().join("session.json"),
            Duration::from_millis(50),
        ),
        hub: hub.clone(),
        snapshot: snapshot.clone(),
        handles: HandleStore::new(dir.path().join("background.json")),
        retry: RetryPolicy::new(3, Duration::from_millis(1)),
        pause_suppression: Duration::from_millis(200),
        detach_on_exit: false,
    });
    tokio::spawn(coordinator.run());

    let ctx = AppContext {
        command_tx,
        hub,
        snapshot,
        token,
    };
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, api::router(ctx)).await.unwrap();
    });
    (addr, dir)
}

async fn connect(addr: SocketAddr, query: &str) -> WsStream {
    let (ws, _) = connect_async(format!("ws://{addr}/ws{query}"))
        .await
        .expect("websocket connect");
    ws
}

/// Next text frame as JSON; skips pings.
async fn next_json(ws: &mut WsStream) -> Value {
    loop {
        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("socket error");
        if let WsMessage::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Read state updates until one satisfies the predicate.
async fn next_state_where(ws: &mut WsStream, pred: impl Fn(&Value) -> bool) -> Value {
    for _ in 0..32 {
        let msg = next_json(ws).await;
        if msg["type"] == "state-update" && pred(&msg["state"]) {
            return msg;
        }
    }
    panic!("expected state update never arrived");
}

#[tokio::test]
async fn auth_then_full_snapshot_before_any_delta() {
    let (addr, _dir) = spawn_app(Some("secret".into())).await;
    let mut ws = connect(addr, "?token=secret").await;

    let first = next_json(&mut ws).await;
    assert_eq!(first["type"], "auth");
    assert_eq!(first["success"], true);

    // The full snapshot arrives even though no transition happened yet.
    let second = next_json(&mut ws).await;
    assert_eq!(second["type"], "state-update");
    assert_eq!(second["state"]["volume"], 100);
    assert_eq!(second["state"]["isPlaying"], false);
}

#[tokio::test]
async fn invalid_token_is_denied_with_policy_close() {
    let (addr, _dir) = spawn_app(Some("secret".into())).await;
    let mut ws = connect(addr, "?token=wrong").await;

    let denial = next_json(&mut ws).await;
    assert_eq!(denial["type"], "auth");
    assert_eq!(denial["success"], false);

    let frame = timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("timed out waiting for close")
        .expect("stream ended")
        .expect("socket error");
    match frame {
        WsMessage::Close(Some(close)) => assert_eq!(u16::from(close.code), 1008),
        other => panic!("expected a close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn commands_round_trip_into_broadcast_state() {
    let (addr, _dir) = spawn_app(None).await;
    let mut ws = connect(addr, "").await;

    next_json(&mut ws).await; // auth
    next_json(&mut ws).await; // snapshot

    let command = json!({
        "type": "command",
        "action": { "type": "SET_VOLUME", "payload": 150 },
    });
    ws.send(WsMessage::Text(command.to_string())).await.unwrap();

    // Out-of-range volume is clamped, not rejected.
    next_state_where(&mut ws, |state| state["volume"] == 100).await;

    let command = json!({
        "type": "command",
        "action": { "type": "VOLUME_DOWN" },
    });
    ws.send(WsMessage::Text(command.to_string())).await.unwrap();
    next_state_where(&mut ws, |state| state["volume"] == 90).await;
}

#[tokio::test]
async fn all_observers_see_the_same_transitions() {
    let (addr, _dir) = spawn_app(None).await;
    let mut a = connect(addr, "").await;
    let mut b = connect(addr, "").await;
    for ws in [&mut a, &mut b] {
        next_json(ws).await; // auth
        next_json(ws).await; // snapshot
    }

    let command = json!({
        "type": "command",
        "action": { "type": "TOGGLE_SHUFFLE" },
    });
    a.send(WsMessage::Text(command.to_string())).await.unwrap();

    next_state_where(&mut a, |state| state["shuffle"] == true).await;
    next_state_where(&mut b, |state| state["shuffle"] == true).await;
}

#[tokio::test]
async fn detach_request_stops_observation_over_the_wire() {
    let (addr, _dir) = spawn_app(None).await;
    let mut ws = connect(addr, "").await;
    next_json(&mut ws).await; // auth
    next_json(&mut ws).await; // snapshot

    let command = json!({
        "type": "command",
        "action": { "type": "PLAY", "payload": { "id": "t1", "title": "Track One" } },
    });
    ws.send(WsMessage::Text(command.to_string())).await.unwrap();
    next_state_where(&mut ws, |state| {
        state["isPlaying"] == true && state["loading"] == false
    })
    .await;

    ws.send(WsMessage::Text(json!({ "type": "detach" }).to_string()))
        .await
        .unwrap();
    next_state_where(&mut ws, |state| state["isPlaying"] == false).await;
}

#[tokio::test]
async fn unknown_actions_are_absorbed_not_fatal() {
    let (addr, _dir) = spawn_app(None).await;
    let mut ws = connect(addr, "").await;
    next_json(&mut ws).await; // auth
    next_json(&mut ws).await; // snapshot

    let future_command = json!({
        "type": "command",
        "action": { "type": "CROSSFADE_TO", "payload": "t9" },
    });
    ws.send(WsMessage::Text(future_command.to_string()))
        .await
        .unwrap();

    // The channel stays up and keeps serving real commands.
    let command = json!({
        "type": "command",
        "action": { "type": "VOLUME_DOWN" },
    });
    ws.send(WsMessage::Text(command.to_string())).await.unwrap();
    next_state_where(&mut ws, |state| state["volume"] == 90).await;
}
