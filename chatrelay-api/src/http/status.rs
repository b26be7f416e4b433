//! Health, metrics and relay status endpoints
//!
//! Read-only views of the in-memory relay state for monitoring probes and
//! operators. Nothing here mutates presence or call sessions.

use axum::{
    extract::{Path, State},
    http::header,
    routing::get,
    Json, Router,
};
use serde::Serialize;

use chatrelay_core::models::{CallSession, OnlineUser, RoomName};
use chatrelay_core::Error;

use crate::http::{AppResult, AppState};

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

pub fn create_status_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .route("/api/presence/online", get(online_users))
        .route("/api/calls", get(active_calls))
        .route("/api/calls/{room_name}", get(call_by_room))
        .route("/api/stats", get(relay_stats))
}

/// Liveness probe
pub async fn health_check() -> &'static str {
    "OK"
}

/// Prometheus scrape endpoint
async fn metrics(
    State(state): State<AppState>,
) -> AppResult<([(header::HeaderName, &'static str); 1], String)> {
    let body = state.relay.gather_metrics()?;
    Ok(([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], body))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUsersResponse {
    pub users: Vec<OnlineUser>,
    pub count: usize,
}

async fn online_users(State(state): State<AppState>) -> Json<OnlineUsersResponse> {
    let users = state.relay.presence().online_users();
    Json(OnlineUsersResponse {
        count: users.len(),
        users,
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallsResponse {
    pub sessions: Vec<CallSession>,
    pub count: usize,
}

async fn active_calls(State(state): State<AppState>) -> Json<CallsResponse> {
    let sessions = state.relay.calls().active_sessions();
    Json(CallsResponse {
        count: sessions.len(),
        sessions,
    })
}

async fn call_by_room(
    State(state): State<AppState>,
    Path(room_name): Path<String>,
) -> AppResult<Json<CallSession>> {
    let room_name = RoomName::from_string(room_name);
    let session = state
        .relay
        .calls()
        .session(&room_name)
        .ok_or_else(|| Error::NotFound(format!("No active call in room {room_name}")))?;
    Ok(Json(session))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub online_users: usize,
    pub active_calls: usize,
    pub open_connections: usize,
    pub total_connections: u64,
}

async fn relay_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let presence = state.relay.presence();
    Json(StatsResponse {
        online_users: presence.online_count(),
        active_calls: state.relay.calls().session_count(),
        open_connections: presence.connection_count(),
        total_connections: presence.total_connections(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use chatrelay_core::models::{CallData, CallStatus, ClientEvent, UserId};
    use chatrelay_core::service::{ConnectionHandle, Relay};
    use chatrelay_core::Config;

    fn empty_state() -> AppState {
        let config = Config::default();
        AppState::new(Relay::new(config.relay.clone()), config)
    }

    fn state_with_call() -> AppState {
        let state = empty_state();
        let mut connections = Vec::new();
        for user in ["A", "B"] {
            let (handle, rx) = ConnectionHandle::channel();
            let id = handle.connection_id.clone();
            state.relay.connect(handle);
            state.relay.handle_event(&id, ClientEvent::Join(UserId::from(user)));
            connections.push((id, rx));
        }
        state.relay.handle_event(
            &connections[0].0,
            ClientEvent::InitiateCall {
                receiver_id: UserId::from("B"),
                call_data: CallData::new("A", "room_42"),
            },
        );
        state
    }

    #[tokio::test]
    async fn test_health() {
        assert_eq!(health_check().await, "OK");
    }

    #[tokio::test]
    async fn test_stats_and_listings() {
        let state = state_with_call();

        let Json(stats) = relay_stats(State(state.clone())).await;
        assert_eq!(stats.online_users, 2);
        assert_eq!(stats.active_calls, 1);
        assert_eq!(stats.total_connections, 2);

        let Json(online) = online_users(State(state.clone())).await;
        assert_eq!(online.count, 2);
        assert_eq!(online.users[0].user_id.as_str(), "A");

        let Json(calls) = active_calls(State(state.clone())).await;
        assert_eq!(calls.count, 1);
        assert_eq!(calls.sessions[0].room_name.as_str(), "room_42");
        assert_eq!(calls.sessions[0].status, CallStatus::Calling);

        let Json(call) = call_by_room(State(state), Path("room_42".to_string()))
            .await
            .unwrap();
        assert_eq!(call.receiver_id.as_str(), "B");
    }

    #[tokio::test]
    async fn test_unknown_room_is_not_found() {
        let err = call_by_room(State(empty_state()), Path("nowhere".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.message, "No active call in room nowhere");
    }

    #[tokio::test]
    async fn test_metrics_scrape() {
        let state = state_with_call();

        let ([(name, content_type)], body) = metrics(State(state)).await.unwrap();
        assert_eq!(name, header::CONTENT_TYPE);
        assert!(content_type.starts_with("text/plain"));
        assert!(body.contains("# TYPE chatrelay_open_connections gauge"));
        assert!(body.contains("chatrelay_open_connections 2"));
        assert!(body.contains("chatrelay_online_users 2"));
        assert!(body.contains("chatrelay_active_calls 1"));
        assert!(body.contains("chatrelay_connections_total 2"));
        assert!(body.contains("chatrelay_call_outcomes_total{outcome=\"calling\"} 1"));
    }
}
