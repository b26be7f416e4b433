//! Client event dispatch
//!
//! [`Relay`] is the single entry point the transport layer talks to. It owns
//! the presence registry and the call service, turns each decoded client
//! event into operations on them and reports failures back to the sending
//! connection as status events.

use serde_json::Value;
use tracing::{debug, warn};

use super::call::CallService;
use super::presence::{ConnectionHandle, PresenceRegistry};
use crate::config::RelayConfig;
use crate::metrics::RelayMetrics;
use crate::models::{ClientEvent, ConnectionId, ServerEvent, StatusKind, UserId};
use crate::{Error, Result};

#[derive(Clone)]
pub struct Relay {
    presence: PresenceRegistry,
    calls: CallService,
}

impl Relay {
    #[must_use]
    pub fn new(config: RelayConfig) -> Self {
        let presence = PresenceRegistry::new();
        let calls = CallService::new(presence.clone(), config);
        Self { presence, calls }
    }

    #[must_use]
    pub const fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    #[must_use]
    pub const fn calls(&self) -> &CallService {
        &self.calls
    }

    #[must_use]
    pub fn metrics(&self) -> &RelayMetrics {
        self.presence.metrics()
    }

    /// Refresh the gauges from live state and encode every metric
    pub fn gather_metrics(&self) -> Result<String> {
        let metrics = self.metrics();
        metrics.open_connections.set(gauge_value(self.presence.connection_count()));
        metrics.online_users.set(gauge_value(self.presence.online_count()));
        metrics.active_calls.set(gauge_value(self.calls.session_count()));
        metrics.gather()
    }

    pub fn connect(&self, handle: ConnectionHandle) {
        self.presence.connect(handle);
    }

    /// Decode and dispatch one text frame.
    ///
    /// A frame that is not a known client event gets an `error` event back
    /// and is otherwise ignored.
    pub fn handle_frame(&self, connection_id: &ConnectionId, text: &str) {
        match serde_json::from_str::<ClientEvent>(text) {
            Ok(event) => self.handle_event(connection_id, event),
            Err(e) => {
                warn!(connection_id = %connection_id, error = %e, "Malformed client frame");
                self.presence.send_to_connection(
                    connection_id,
                    ServerEvent::Error {
                        message: format!("Invalid message: {e}"),
                    },
                );
            }
        }
    }

    /// Dispatch one client event. Failures become a
    /// `callStatusChange{type: error}` for the sending connection.
    pub fn handle_event(&self, connection_id: &ConnectionId, event: ClientEvent) {
        let name = event.name();
        debug!(connection_id = %connection_id, event = name, "Client event");

        if let Err(e) = self.dispatch(connection_id, event) {
            debug!(connection_id = %connection_id, event = name, error = %e, "Client event failed");
            self.presence.send_to_connection(
                connection_id,
                ServerEvent::status_with_message(StatusKind::Error, e.user_message(), None),
            );
        }
    }

    fn dispatch(&self, connection_id: &ConnectionId, event: ClientEvent) -> Result<()> {
        match event {
            ClientEvent::Join(user_id) => self.register(connection_id, user_id, None, false),

            ClientEvent::UserOnline { user_id, user_info } => {
                self.register(connection_id, user_id, user_info, true)
            }

            ClientEvent::InitiateCall {
                receiver_id,
                call_data,
            } => {
                let caller = self.sender(connection_id, Some(&call_data.caller_id))?;
                self.calls.initiate_call(&caller, receiver_id, call_data)?;
                Ok(())
            }

            ClientEvent::AcceptCall {
                caller_id,
                call_data,
            } => {
                let receiver = self.sender(connection_id, None)?;
                self.calls.accept_call(&receiver, &caller_id, &call_data)
            }

            ClientEvent::RejectCall {
                caller_id,
                reason,
                room_name,
            } => {
                let receiver = self.sender(connection_id, None)?;
                self.calls
                    .reject_call(&receiver, &caller_id, reason, room_name.as_ref())?;
                Ok(())
            }

            ClientEvent::LivekitConnected { room_name, user_id } => {
                let user = self.sender(connection_id, Some(&user_id))?;
                self.calls.media_connected(&user, &room_name)?;
                Ok(())
            }

            ClientEvent::EndCall {
                target_user_id,
                call_data,
                user_id,
            } => {
                let claimed = user_id.or_else(|| call_data.map(|d| d.caller_id));
                let user = self.sender(connection_id, claimed.as_ref())?;
                let ended = self.calls.end_call(&user);
                if ended == 0 {
                    debug!(
                        user_id = %user,
                        target_user_id = ?target_user_id.as_ref().map(UserId::as_str),
                        "End call matched no session"
                    );
                }
                Ok(())
            }

            ClientEvent::SendFriendRequest {
                recipient_id,
                payload,
            } => {
                self.forward(&recipient_id, ServerEvent::FriendRequestReceived(payload));
                Ok(())
            }

            ClientEvent::AcceptFriendRequest {
                recipient_id,
                payload,
            } => {
                self.forward(&recipient_id, ServerEvent::FriendRequestAccepted(payload));
                Ok(())
            }

            ClientEvent::PrivateMessage {
                recipient_id,
                payload,
            } => {
                self.forward(&recipient_id, ServerEvent::NewMessage(payload));
                Ok(())
            }

            ClientEvent::Ping => {
                self.presence.send_to_connection(connection_id, ServerEvent::Pong);
                Ok(())
            }
        }
    }

    fn register(
        &self,
        connection_id: &ConnectionId,
        user_id: UserId,
        user_info: Option<Value>,
        announce: bool,
    ) -> Result<()> {
        if user_id.as_str().is_empty() {
            return Err(Error::InvalidInput("Missing user id".to_string()));
        }

        self.presence.register(connection_id, user_id.clone(), user_info)?;
        if announce {
            self.presence.announce_online(&user_id);
        }
        self.presence.send_to_connection(
            connection_id,
            ServerEvent::OnlineUsers {
                users: self.presence.online_users(),
            },
        );
        Ok(())
    }

    /// Identity of the sending connection: its registered user, else the id
    /// the payload claims.
    fn sender(&self, connection_id: &ConnectionId, claimed: Option<&UserId>) -> Result<UserId> {
        if let Some(user) = self.presence.user_of(connection_id) {
            return Ok(user);
        }
        match claimed {
            Some(user) if !user.as_str().is_empty() => Ok(user.clone()),
            _ => Err(Error::NotRegistered),
        }
    }

    /// Best-effort delivery; an offline recipient drops the event
    fn forward(&self, recipient_id: &UserId, event: ServerEvent) {
        self.presence.route(recipient_id, event);
    }

    /// Connection closed: the user goes offline and their calls end.
    ///
    /// Nothing happens to calls if the user already re-registered on another
    /// connection.
    pub fn disconnect(&self, connection_id: &ConnectionId) {
        if let Some(user_id) = self.presence.unregister(connection_id) {
            self.calls.handle_disconnect(&user_id);
        } else {
            debug!(connection_id = %connection_id, "Connection closed");
        }
    }
}

fn gauge_value(count: usize) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}
