pub mod call;
pub mod event;
pub mod id;

pub use call::{CallData, CallSession, CallStatus, EndReason, RejectReason, StatusKind};
pub use event::{ClientEvent, OnlineUser, PresenceStatus, ServerEvent};
pub use id::{generate_id, ConnectionId, RoomName, UserId};
