// Integration tests for the WebSocket relay
//
// Drives real sockets against a server bound to an ephemeral port:
// - presence registration and broadcast
// - the full invite / accept / media / hang-up call flow
// - calling an offline user
// - disconnect cleanup
// - server-initiated close on shutdown

use chatrelay_api::{create_router, AppState};
use chatrelay_core::service::Relay;
use chatrelay_core::Config;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_relay() -> (SocketAddr, AppState) {
    let config = Config::default();
    let state = AppState::new(Relay::new(config.relay.clone()), config);
    let app = create_router(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, state)
}

async fn connect(addr: SocketAddr) -> Client {
    let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    ws
}

async fn send(ws: &mut Client, event: &str, data: Value) {
    let frame = json!({ "event": event, "data": data }).to_string();
    ws.send(Message::text(frame)).await.unwrap();
}

/// Read frames until `event` arrives with data matching `pred`
async fn expect(ws: &mut Client, event: &str, pred: impl Fn(&Value) -> bool) -> Value {
    let wait = async {
        loop {
            let message = ws.next().await.expect("socket closed").unwrap();
            let Message::Text(text) = message else {
                continue;
            };
            let frame: Value = serde_json::from_str(text.as_str()).unwrap();
            if frame["event"] == event && pred(&frame["data"]) {
                return frame["data"].clone();
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {event}"))
}

async fn come_online(addr: SocketAddr, user: &str) -> Client {
    let mut ws = connect(addr).await;
    send(&mut ws, "userOnline", json!({ "userId": user })).await;
    expect(&mut ws, "onlineUsers", |_| true).await;
    ws
}

fn status(kind: &'static str) -> impl Fn(&Value) -> bool {
    move |data| data["type"] == kind
}

#[tokio::test]
async fn test_call_flow_between_online_users() {
    let (addr, state) = spawn_relay().await;
    let mut a = come_online(addr, "A").await;
    let mut b = come_online(addr, "B").await;

    expect(&mut a, "userStatusChanged", |d| d["userId"] == "B" && d["status"] == "online").await;

    let call_data = json!({ "callerId": "A", "roomName": "room_42", "callerName": "Alice" });
    send(&mut a, "initiateCall", json!({ "receiverId": "B", "callData": call_data })).await;

    expect(&mut a, "callStatusChange", status("calling")).await;
    let incoming = expect(&mut b, "incomingCall", |_| true).await;
    assert_eq!(incoming["roomName"], "room_42");
    assert_eq!(incoming["callerName"], "Alice");

    send(&mut b, "acceptCall", json!({ "callerId": "A", "callData": call_data })).await;
    expect(&mut a, "callAccepted", |_| true).await;
    expect(&mut a, "callStatusChange", status("connecting")).await;
    expect(&mut b, "callStatusChange", status("connecting")).await;

    send(&mut a, "livekitConnected", json!({ "roomName": "room_42", "userId": "A" })).await;
    send(&mut b, "livekitConnected", json!({ "roomName": "room_42", "userId": "B" })).await;
    expect(&mut a, "callStatusChange", status("connected")).await;
    expect(&mut b, "callStatusChange", status("connected")).await;

    send(&mut a, "endCall", json!({ "userId": "A", "targetUserId": "B" })).await;
    let ended = expect(&mut b, "callEnded", |_| true).await;
    assert_eq!(ended["endedBy"], "A");
    assert_eq!(ended["roomName"], "room_42");
    expect(&mut b, "callStatusChange", status("ended")).await;

    assert_eq!(state.relay.calls().session_count(), 0);
}

#[tokio::test]
async fn test_call_to_offline_user() {
    let (addr, state) = spawn_relay().await;
    let mut a = come_online(addr, "A").await;

    send(
        &mut a,
        "initiateCall",
        json!({ "receiverId": "C", "callData": { "callerId": "A", "roomName": "room_7" } }),
    )
    .await;

    let error = expect(&mut a, "callStatusChange", status("error")).await;
    assert_eq!(error["message"], "Người dùng không trực tuyến");
    assert_eq!(state.relay.calls().session_count(), 0);
}

#[tokio::test]
async fn test_disconnect_ends_call_and_announces_offline() {
    let (addr, state) = spawn_relay().await;
    let mut a = come_online(addr, "A").await;
    let mut b = come_online(addr, "B").await;

    send(
        &mut a,
        "initiateCall",
        json!({ "receiverId": "B", "callData": { "callerId": "A", "roomName": "room_9" } }),
    )
    .await;
    expect(&mut b, "incomingCall", |_| true).await;

    b.close(None).await.unwrap();

    expect(&mut a, "userStatusChanged", |d| d["userId"] == "B" && d["status"] == "offline").await;
    let ended = expect(&mut a, "callEnded", |_| true).await;
    assert_eq!(ended["reason"], "disconnect");
    assert_eq!(state.relay.calls().session_count(), 0);
}

#[tokio::test]
async fn test_ping_and_malformed_frames() {
    let (addr, _state) = spawn_relay().await;
    let mut ws = connect(addr).await;

    ws.send(Message::text(r#"{"event":"ping"}"#)).await.unwrap();
    expect(&mut ws, "pong", |_| true).await;

    ws.send(Message::text("{not json")).await.unwrap();
    let error = expect(&mut ws, "error", |_| true).await;
    assert!(error["message"].as_str().unwrap().starts_with("Invalid message"));

    send(&mut ws, "privateMessage", json!({ "recipientId": "nobody", "payload": { "text": "hi" } })).await;
    ws.send(Message::text(r#"{"event":"ping"}"#)).await.unwrap();
    expect(&mut ws, "pong", |_| true).await;
}

#[tokio::test]
async fn test_close_all_sends_going_away_and_drains() {
    let (addr, state) = spawn_relay().await;
    let mut a = come_online(addr, "A").await;
    let mut anon = connect(addr).await;
    anon.send(Message::text(r#"{"event":"ping"}"#)).await.unwrap();
    expect(&mut anon, "pong", |_| true).await;
    assert_eq!(state.relay.presence().connection_count(), 2);

    assert_eq!(state.relay.presence().close_all(), 2);

    for ws in [&mut a, &mut anon] {
        let close = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Close(frame))) => return frame,
                    Some(Ok(_)) => continue,
                    other => panic!("expected close frame, got {other:?}"),
                }
            }
        })
        .await
        .expect("no close frame");
        let frame = close.expect("close frame without code");
        assert_eq!(u16::from(frame.code), 1001);
    }

    let drained = async {
        while state.relay.presence().connection_count() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(2), drained)
        .await
        .expect("connections still open after close");
    assert!(!state.relay.presence().is_online(&chatrelay_core::models::UserId::from("A")));
}
