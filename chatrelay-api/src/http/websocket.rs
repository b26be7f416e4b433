//! WebSocket transport for the relay
//!
//! Each socket becomes one relay connection. Text frames carry JSON client
//! events; outbound events are serialized by a dedicated writer task fed from
//! the connection's channel. Binary frames are ignored.
//!
//! When the registry asks a connection to close (server shutdown), the reader
//! stops and the writer sends a `1001 Going Away` close frame.

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use chatrelay_core::service::ConnectionHandle;

use crate::http::AppState;

/// Upgrade to a relay connection.
///
/// No authentication happens here: a connection speaks for whichever user
/// it registers as with `join` or `userOnline`.
pub async fn websocket_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.max_message_size(state.config.relay.max_message_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (handle, mut rx) = ConnectionHandle::channel();
    let connection_id = handle.connection_id.clone();
    let closing = handle.closing().clone();
    state.relay.connect(handle);

    info!(connection_id = %connection_id, "WebSocket connection established");

    let (mut ws_sink, mut ws_stream) = socket.split();
    let is_alive = Arc::new(AtomicBool::new(true));

    // Server events -> WebSocket
    let writer_alive = is_alive.clone();
    let writer_id = connection_id.clone();
    let writer_closing = closing.clone();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                biased;
                () = writer_closing.cancelled() => {
                    let frame = CloseFrame {
                        code: close_code::AWAY,
                        reason: Utf8Bytes::from_static("Server shutting down"),
                    };
                    if let Err(e) = ws_sink.send(Message::Close(Some(frame))).await {
                        debug!(connection_id = %writer_id, error = %e, "Failed to send close frame");
                    }
                    break;
                }
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    error!(connection_id = %writer_id, event = event.name(), error = %e, "Failed to encode event");
                    continue;
                }
            };
            if let Err(e) = ws_sink.send(Message::Text(text.into())).await {
                debug!(connection_id = %writer_id, error = %e, "Failed to send WebSocket message");
                writer_alive.store(false, Ordering::Relaxed);
                break;
            }
        }
    });

    loop {
        let message = tokio::select! {
            () = closing.cancelled() => break,
            message = ws_stream.next() => match message {
                Some(message) => message,
                None => break,
            },
        };
        if !is_alive.load(Ordering::Relaxed) {
            break;
        }
        match message {
            Ok(Message::Text(text)) => state.relay.handle_frame(&connection_id, text.as_str()),
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(bytes)) => {
                debug!(connection_id = %connection_id, len = bytes.len(), "Ignoring binary frame");
            }
            // Ping/pong frames are answered by the protocol layer
            Ok(_) => {}
            Err(e) => {
                warn!(connection_id = %connection_id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    // Dropping the registry's handles closes the writer once it drains
    state.relay.disconnect(&connection_id);

    info!(connection_id = %connection_id, "WebSocket connection closed");
}
