//! One-to-one call sessions and their state machine
//!
//! A session lives from `initiateCall` until it is rejected, ended, timed out
//! or swept. Terminal outcomes are not stored: the relay removes the record.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::id::{RoomName, UserId};
use crate::{Error, Result};

/// Stored call status. Terminal outcomes delete the session instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Calling,
    Connecting,
    Connected,
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Calling => "calling",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// `type` tag of a `callStatusChange` event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Calling,
    Connecting,
    Connected,
    Rejected,
    Timeout,
    Ended,
    Error,
}

impl StatusKind {
    /// User-facing text shown by the client for this status
    #[must_use]
    pub const fn default_message(self) -> &'static str {
        match self {
            Self::Calling => "Đang gọi...",
            Self::Connecting => "Đang kết nối...",
            Self::Connected => "Đã kết nối",
            Self::Rejected => "Cuộc gọi bị từ chối",
            Self::Timeout => "Không có phản hồi",
            Self::Ended => "Cuộc gọi đã kết thúc",
            Self::Error => "Đã xảy ra lỗi",
        }
    }
}

impl From<CallStatus> for StatusKind {
    fn from(status: CallStatus) -> Self {
        match status {
            CallStatus::Calling => Self::Calling,
            CallStatus::Connecting => Self::Connecting,
            CallStatus::Connected => Self::Connected,
        }
    }
}

pub const MSG_USER_OFFLINE: &str = "Người dùng không trực tuyến";
pub const MSG_CALL_NOT_FOUND: &str = "Cuộc gọi không còn tồn tại";
pub const MSG_ROOM_IN_USE: &str = "Phòng họp đang được sử dụng";
pub const MSG_NOT_REGISTERED: &str = "Chưa đăng ký người dùng";
pub const MSG_INVALID_REQUEST: &str = "Yêu cầu không hợp lệ";
pub const MSG_PEER_DISCONNECTED: &str = "Người dùng đã ngắt kết nối";
pub const MSG_SESSION_EXPIRED: &str = "Cuộc gọi đã hết hạn";

/// Why the callee turned a call down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RejectReason {
    Busy,
    #[default]
    Declined,
    Unavailable,
}

impl RejectReason {
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::Busy => "Người dùng đang bận",
            Self::Declined => "Người dùng đã từ chối cuộc gọi",
            Self::Unavailable => "Người dùng hiện không thể nhận cuộc gọi",
        }
    }
}

/// Why a session was torn down after it was established or while ringing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndReason {
    Hangup,
    Disconnect,
    Expired,
}

impl EndReason {
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::Hangup => StatusKind::Ended.default_message(),
            Self::Disconnect => MSG_PEER_DISCONNECTED,
            Self::Expired => MSG_SESSION_EXPIRED,
        }
    }
}

/// Call description supplied by the caller and forwarded verbatim
///
/// Only `callerId` and `roomName` are interpreted by the relay; any other
/// keys (caller name, avatar, call type, ...) are carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallData {
    pub caller_id: UserId,
    pub room_name: RoomName,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CallData {
    #[must_use]
    pub fn new(caller_id: impl Into<UserId>, room_name: impl Into<RoomName>) -> Self {
        Self {
            caller_id: caller_id.into(),
            room_name: room_name.into(),
            extra: Map::new(),
        }
    }
}

/// Relay-owned record of one call attempt between exactly two users
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub room_name: RoomName,
    pub caller_id: UserId,
    pub receiver_id: UserId,
    pub status: CallStatus,
    pub created_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub connected_at: Option<DateTime<Utc>>,
    pub caller_livekit_connected: bool,
    pub receiver_livekit_connected: bool,
    #[serde(skip)]
    pub call_data: CallData,
    /// Distinguishes this session from a later one reusing the room name
    #[serde(skip)]
    pub generation: u64,
}

impl CallSession {
    #[must_use]
    pub fn new(call_data: CallData, receiver_id: UserId, generation: u64, now: DateTime<Utc>) -> Self {
        Self {
            room_name: call_data.room_name.clone(),
            caller_id: call_data.caller_id.clone(),
            receiver_id,
            status: CallStatus::Calling,
            created_at: now,
            accepted_at: None,
            connected_at: None,
            caller_livekit_connected: false,
            receiver_livekit_connected: false,
            call_data,
            generation,
        }
    }

    #[must_use]
    pub fn is_participant(&self, user_id: &UserId) -> bool {
        self.caller_id == *user_id || self.receiver_id == *user_id
    }

    /// The other participant, if `user_id` takes part in this call
    #[must_use]
    pub fn peer_of(&self, user_id: &UserId) -> Option<&UserId> {
        if self.caller_id == *user_id {
            Some(&self.receiver_id)
        } else if self.receiver_id == *user_id {
            Some(&self.caller_id)
        } else {
            None
        }
    }

    /// `calling -> connecting`, only by the receiver.
    ///
    /// Returns true if the call is already fully connected afterwards, which
    /// happens when both media confirmations arrived before the accept.
    pub fn accept(&mut self, by: &UserId, now: DateTime<Utc>) -> Result<bool> {
        if self.receiver_id != *by {
            return Err(Error::InvalidInput(format!(
                "{by} is not the receiver of {}",
                self.room_name
            )));
        }
        if self.status != CallStatus::Calling {
            return Err(Error::InvalidTransition {
                from: self.status,
                event: "acceptCall",
            });
        }
        self.status = CallStatus::Connecting;
        self.accepted_at = Some(now);
        Ok(self.try_finalize(now))
    }

    /// Only the receiver may reject, and only before the call is connected.
    pub fn check_reject(&self, by: &UserId) -> Result<()> {
        if self.receiver_id != *by {
            return Err(Error::InvalidInput(format!(
                "{by} is not the receiver of {}",
                self.room_name
            )));
        }
        if self.status == CallStatus::Connected {
            return Err(Error::InvalidTransition {
                from: self.status,
                event: "rejectCall",
            });
        }
        Ok(())
    }

    /// Record that `user_id` joined the media room.
    ///
    /// Returns true exactly once: when this report completes the pair and
    /// the session moves `connecting -> connected`.
    pub fn mark_media_connected(&mut self, user_id: &UserId, now: DateTime<Utc>) -> Result<bool> {
        if self.caller_id == *user_id {
            self.caller_livekit_connected = true;
        } else if self.receiver_id == *user_id {
            self.receiver_livekit_connected = true;
        } else {
            return Err(Error::InvalidInput(format!(
                "{user_id} is not a participant of {}",
                self.room_name
            )));
        }
        Ok(self.try_finalize(now))
    }

    fn try_finalize(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == CallStatus::Connecting
            && self.caller_livekit_connected
            && self.receiver_livekit_connected
        {
            self.status = CallStatus::Connected;
            self.connected_at = Some(now);
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.created_at)
    }

    /// Backstop check used by the periodic sweep
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration, max_ringing: Duration) -> bool {
        let age = self.age(now);
        age > max_age || (self.status == CallStatus::Calling && age > max_ringing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> CallSession {
        CallSession::new(CallData::new("A", "room_42"), UserId::from("B"), 1, Utc::now())
    }

    #[test]
    fn test_new_session_is_calling() {
        let s = session();
        assert_eq!(s.status, CallStatus::Calling);
        assert_eq!(s.caller_id.as_str(), "A");
        assert_eq!(s.room_name.as_str(), "room_42");
        assert!(!s.caller_livekit_connected);
        assert!(!s.receiver_livekit_connected);
    }

    #[test]
    fn test_only_receiver_can_accept() {
        let mut s = session();
        assert!(s.accept(&UserId::from("A"), Utc::now()).is_err());
        assert!(!s.accept(&UserId::from("B"), Utc::now()).unwrap());
        assert_eq!(s.status, CallStatus::Connecting);
        assert!(matches!(
            s.accept(&UserId::from("B"), Utc::now()),
            Err(Error::InvalidTransition { from: CallStatus::Connecting, .. })
        ));
    }

    #[test]
    fn test_connected_requires_both_reports_in_any_order() {
        let mut s = session();
        s.accept(&UserId::from("B"), Utc::now()).unwrap();

        assert!(!s.mark_media_connected(&UserId::from("B"), Utc::now()).unwrap());
        assert_eq!(s.status, CallStatus::Connecting);
        // Duplicate report from the same side changes nothing
        assert!(!s.mark_media_connected(&UserId::from("B"), Utc::now()).unwrap());
        assert_eq!(s.status, CallStatus::Connecting);

        assert!(s.mark_media_connected(&UserId::from("A"), Utc::now()).unwrap());
        assert_eq!(s.status, CallStatus::Connected);
        assert!(s.connected_at.is_some());

        // Fires only once
        assert!(!s.mark_media_connected(&UserId::from("A"), Utc::now()).unwrap());
    }

    #[test]
    fn test_media_reports_before_accept_finalize_on_accept() {
        let mut s = session();
        assert!(!s.mark_media_connected(&UserId::from("A"), Utc::now()).unwrap());
        assert!(!s.mark_media_connected(&UserId::from("B"), Utc::now()).unwrap());
        assert_eq!(s.status, CallStatus::Calling);

        assert!(s.accept(&UserId::from("B"), Utc::now()).unwrap());
        assert_eq!(s.status, CallStatus::Connected);
    }

    #[test]
    fn test_stranger_cannot_report_media() {
        let mut s = session();
        assert!(s.mark_media_connected(&UserId::from("C"), Utc::now()).is_err());
    }

    #[test]
    fn test_reject_rules() {
        let mut s = session();
        assert!(s.check_reject(&UserId::from("A")).is_err());
        assert!(s.check_reject(&UserId::from("B")).is_ok());

        s.accept(&UserId::from("B"), Utc::now()).unwrap();
        assert!(s.check_reject(&UserId::from("B")).is_ok());

        s.mark_media_connected(&UserId::from("A"), Utc::now()).unwrap();
        s.mark_media_connected(&UserId::from("B"), Utc::now()).unwrap();
        assert!(s.check_reject(&UserId::from("B")).is_err());
    }

    #[test]
    fn test_peer_of() {
        let s = session();
        assert_eq!(s.peer_of(&UserId::from("A")).unwrap().as_str(), "B");
        assert_eq!(s.peer_of(&UserId::from("B")).unwrap().as_str(), "A");
        assert!(s.peer_of(&UserId::from("C")).is_none());
    }

    #[test]
    fn test_staleness() {
        let now = Utc::now();
        let mut s = session();
        s.created_at = now - Duration::seconds(61);
        assert!(s.is_stale(now, Duration::minutes(5), Duration::seconds(60)));

        s.accept(&UserId::from("B"), now).unwrap();
        assert!(!s.is_stale(now, Duration::minutes(5), Duration::seconds(60)));

        s.created_at = now - Duration::minutes(6);
        assert!(s.is_stale(now, Duration::minutes(5), Duration::seconds(60)));
    }

    #[test]
    fn test_call_data_keeps_unknown_fields() {
        let json = r#"{"callerId":"A","roomName":"room_42","callerName":"Alice","isVideo":true}"#;
        let data: CallData = serde_json::from_str(json).unwrap();
        assert_eq!(data.caller_id.as_str(), "A");
        assert_eq!(data.extra.get("callerName").unwrap(), "Alice");

        let back = serde_json::to_value(&data).unwrap();
        assert_eq!(back["isVideo"], true);
        assert_eq!(back["roomName"], "room_42");
    }

    #[test]
    fn test_reject_reason_defaults_to_declined() {
        assert_eq!(RejectReason::default(), RejectReason::Declined);
        let r: RejectReason = serde_json::from_str("\"busy\"").unwrap();
        assert_eq!(r, RejectReason::Busy);
    }
}
