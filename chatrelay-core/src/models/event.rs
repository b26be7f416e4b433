//! Relay wire events
//!
//! Every frame is a JSON object `{"event": <name>, "data": <payload>}`.
//! Payload keys are camelCase.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::call::{CallData, EndReason, RejectReason, StatusKind};
use super::id::{RoomName, UserId};

/// Events sent by clients to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    /// Bind this connection to a user id
    Join(UserId),

    /// Bind this connection and announce the user as online
    UserOnline {
        user_id: UserId,
        #[serde(default)]
        user_info: Option<Value>,
    },

    InitiateCall {
        receiver_id: UserId,
        call_data: CallData,
    },

    AcceptCall {
        caller_id: UserId,
        call_data: CallData,
    },

    RejectCall {
        caller_id: UserId,
        #[serde(default)]
        reason: RejectReason,
        #[serde(default)]
        room_name: Option<RoomName>,
    },

    /// The sender joined the media room of `room_name`
    LivekitConnected {
        room_name: RoomName,
        user_id: UserId,
    },

    EndCall {
        #[serde(default)]
        target_user_id: Option<UserId>,
        #[serde(default)]
        call_data: Option<CallData>,
        #[serde(default)]
        user_id: Option<UserId>,
    },

    SendFriendRequest {
        recipient_id: UserId,
        payload: Value,
    },

    AcceptFriendRequest {
        recipient_id: UserId,
        payload: Value,
    },

    PrivateMessage {
        recipient_id: UserId,
        payload: Value,
    },

    Ping,
}

impl ClientEvent {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Join(_) => "join",
            Self::UserOnline { .. } => "userOnline",
            Self::InitiateCall { .. } => "initiateCall",
            Self::AcceptCall { .. } => "acceptCall",
            Self::RejectCall { .. } => "rejectCall",
            Self::LivekitConnected { .. } => "livekitConnected",
            Self::EndCall { .. } => "endCall",
            Self::SendFriendRequest { .. } => "sendFriendRequest",
            Self::AcceptFriendRequest { .. } => "acceptFriendRequest",
            Self::PrivateMessage { .. } => "privateMessage",
            Self::Ping => "ping",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUser {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<Value>,
}

/// Events sent by the relay to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    IncomingCall(CallData),

    IncomingCallNotification(CallData),

    CallStatusChange {
        #[serde(rename = "type")]
        kind: StatusKind,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_name: Option<RoomName>,
    },

    CallAccepted(CallData),

    CallConnecting(CallData),

    /// Both sides should be in the media room by now
    CallStarted(CallData),

    CallRejected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_name: Option<RoomName>,
        receiver_id: UserId,
        reason: RejectReason,
        message: String,
    },

    CallEnded {
        room_name: RoomName,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ended_by: Option<UserId>,
        reason: EndReason,
        message: String,
    },

    UserStatusChanged {
        user_id: UserId,
        status: PresenceStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_info: Option<Value>,
    },

    /// Snapshot sent to a connection right after it registers
    OnlineUsers { users: Vec<OnlineUser> },

    NewMessage(Value),

    FriendRequestReceived(Value),

    FriendRequestAccepted(Value),

    Pong,

    /// The relay could not process a frame from this connection
    Error { message: String },
}

impl ServerEvent {
    /// Status change carrying the stock message for `kind`
    #[must_use]
    pub fn status(kind: StatusKind, room_name: Option<RoomName>) -> Self {
        Self::status_with_message(kind, kind.default_message(), room_name)
    }

    #[must_use]
    pub fn status_with_message(
        kind: StatusKind,
        message: impl Into<String>,
        room_name: Option<RoomName>,
    ) -> Self {
        Self::CallStatusChange {
            kind,
            message: message.into(),
            room_name,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::IncomingCall(_) => "incomingCall",
            Self::IncomingCallNotification(_) => "incomingCallNotification",
            Self::CallStatusChange { .. } => "callStatusChange",
            Self::CallAccepted(_) => "callAccepted",
            Self::CallConnecting(_) => "callConnecting",
            Self::CallStarted(_) => "callStarted",
            Self::CallRejected { .. } => "callRejected",
            Self::CallEnded { .. } => "callEnded",
            Self::UserStatusChanged { .. } => "userStatusChanged",
            Self::OnlineUsers { .. } => "onlineUsers",
            Self::NewMessage(_) => "newMessage",
            Self::FriendRequestReceived(_) => "friendRequestReceived",
            Self::FriendRequestAccepted(_) => "friendRequestAccepted",
            Self::Pong => "pong",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_initiate_call() {
        let frame = json!({
            "event": "initiateCall",
            "data": {
                "receiverId": "B",
                "callData": { "callerId": "A", "roomName": "room_42", "callerName": "Alice" }
            }
        });

        let event: ClientEvent = serde_json::from_value(frame).unwrap();
        match event {
            ClientEvent::InitiateCall { receiver_id, call_data } => {
                assert_eq!(receiver_id.as_str(), "B");
                assert_eq!(call_data.room_name.as_str(), "room_42");
                assert_eq!(call_data.extra["callerName"], "Alice");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_decode_join_and_ping() {
        let join: ClientEvent = serde_json::from_str(r#"{"event":"join","data":"A"}"#).unwrap();
        assert_eq!(join, ClientEvent::Join(UserId::from("A")));

        let ping: ClientEvent = serde_json::from_str(r#"{"event":"ping"}"#).unwrap();
        assert_eq!(ping, ClientEvent::Ping);
    }

    #[test]
    fn test_decode_reject_without_reason() {
        let event: ClientEvent =
            serde_json::from_str(r#"{"event":"rejectCall","data":{"callerId":"A"}}"#).unwrap();
        assert_eq!(
            event,
            ClientEvent::RejectCall {
                caller_id: UserId::from("A"),
                reason: RejectReason::Declined,
                room_name: None,
            }
        );
    }

    #[test]
    fn test_decode_unknown_event_fails() {
        assert!(serde_json::from_str::<ClientEvent>(r#"{"event":"selfDestruct","data":{}}"#).is_err());
    }

    #[test]
    fn test_encode_status_change() {
        let event = ServerEvent::status_with_message(StatusKind::Error, "Người dùng không trực tuyến", None);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "callStatusChange",
                "data": { "type": "error", "message": "Người dùng không trực tuyến" }
            })
        );
    }

    #[test]
    fn test_encode_call_ended_and_pong() {
        let event = ServerEvent::CallEnded {
            room_name: RoomName::from("room_42"),
            ended_by: Some(UserId::from("A")),
            reason: EndReason::Hangup,
            message: EndReason::Hangup.message().to_string(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "callEnded");
        assert_eq!(value["data"]["endedBy"], "A");
        assert_eq!(value["data"]["reason"], "hangup");

        assert_eq!(serde_json::to_value(ServerEvent::Pong).unwrap(), json!({ "event": "pong" }));
    }

    #[test]
    fn test_event_names_match_wire_tags() {
        let event = ServerEvent::UserStatusChanged {
            user_id: UserId::from("A"),
            status: PresenceStatus::Offline,
            user_info: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], event.name());
        assert_eq!(value["data"]["status"], "offline");
    }
}
