//! Presence registry
//!
//! Maps user ids to their live connection and routes addressed events.
//! Delivery is best-effort: an event for a user without a live connection is
//! dropped, and nothing is queued or acknowledged.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::RelayMetrics;
use crate::models::{ConnectionId, OnlineUser, PresenceStatus, ServerEvent, UserId};
use crate::{Error, Result};

/// Outbound event channel of one connection
pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

/// A live connection as seen by the relay
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub connection_id: ConnectionId,
    pub sender: EventSender,
    closing: CancellationToken,
}

impl ConnectionHandle {
    /// Create a handle with a fresh connection id and its receiving end
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = Self {
            connection_id: ConnectionId::new(),
            sender,
            closing: CancellationToken::new(),
        };
        (handle, receiver)
    }

    /// Hand an event to the connection's writer. False if it already closed.
    pub fn send(&self, event: ServerEvent) -> bool {
        let name = event.name();
        match self.sender.send(event) {
            Ok(()) => true,
            Err(_) => {
                debug!(
                    connection_id = %self.connection_id,
                    event = name,
                    "Connection closed, event dropped"
                );
                false
            }
        }
    }

    /// Ask the connection's socket tasks to close
    pub fn close(&self) {
        self.closing.cancel();
    }

    /// Cancelled once [`close`](Self::close) has been called
    #[must_use]
    pub fn closing(&self) -> &CancellationToken {
        &self.closing
    }
}

#[derive(Debug, Clone)]
struct PresenceEntry {
    handle: ConnectionHandle,
    user_info: Option<Value>,
    registered_at: DateTime<Utc>,
}

/// Registry of live connections and the user each one speaks for
#[derive(Clone, Default)]
pub struct PresenceRegistry {
    /// Every open connection, registered or not
    connections: Arc<DashMap<ConnectionId, ConnectionHandle>>,

    /// Current connection of each user (last registration wins)
    users: Arc<DashMap<UserId, PresenceEntry>>,

    /// User each connection registered as
    connection_users: Arc<DashMap<ConnectionId, UserId>>,

    metrics: RelayMetrics,
}

impl PresenceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry reporting into an existing set of metrics
    #[must_use]
    pub fn with_metrics(metrics: RelayMetrics) -> Self {
        Self {
            connections: Arc::default(),
            users: Arc::default(),
            connection_users: Arc::default(),
            metrics,
        }
    }

    #[must_use]
    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    /// Track a newly opened connection
    pub fn connect(&self, handle: ConnectionHandle) {
        debug!(connection_id = %handle.connection_id, "Connection opened");
        self.connections.insert(handle.connection_id.clone(), handle);
        self.metrics.connections_total.inc();
    }

    /// Associate `connection_id` with `user_id`, replacing any earlier
    /// association of that user.
    ///
    /// Returns the connection that previously represented the user, if it
    /// was a different one.
    pub fn register(
        &self,
        connection_id: &ConnectionId,
        user_id: UserId,
        user_info: Option<Value>,
    ) -> Result<Option<ConnectionId>> {
        let handle = self
            .connections
            .get(connection_id)
            .map(|h| h.clone())
            .ok_or_else(|| Error::NotFound(format!("Connection {connection_id}")))?;

        // A connection switching identity gives up its old user
        if let Some(previous_user) = self
            .connection_users
            .insert(connection_id.clone(), user_id.clone())
        {
            if previous_user != user_id {
                self.users
                    .remove_if(&previous_user, |_, e| e.handle.connection_id == *connection_id);
            }
        }

        // Keep earlier info on a bare re-join of the same connection
        let user_info = user_info.or_else(|| {
            self.users
                .get(&user_id)
                .filter(|e| e.handle.connection_id == *connection_id)
                .and_then(|e| e.user_info.clone())
        });

        let previous = self
            .users
            .insert(
                user_id.clone(),
                PresenceEntry {
                    handle,
                    user_info,
                    registered_at: Utc::now(),
                },
            )
            .map(|e| e.handle.connection_id)
            .filter(|id| id != connection_id);

        if let Some(ref old) = previous {
            // Leave the old connection open but no longer addressable as this user
            self.connection_users.remove_if(old, |_, u| *u == user_id);
            info!(
                user_id = %user_id,
                connection_id = %connection_id,
                replaced_connection_id = %old,
                "User re-registered on a new connection"
            );
        } else {
            info!(
                user_id = %user_id,
                connection_id = %connection_id,
                online_users = self.users.len(),
                "User registered"
            );
        }

        Ok(previous)
    }

    /// Tell every other connection that `user_id` is online
    pub fn announce_online(&self, user_id: &UserId) -> usize {
        let Some((connection_id, user_info)) = self
            .users
            .get(user_id)
            .map(|e| (e.handle.connection_id.clone(), e.user_info.clone()))
        else {
            return 0;
        };

        self.broadcast_except(
            &connection_id,
            &ServerEvent::UserStatusChanged {
                user_id: user_id.clone(),
                status: PresenceStatus::Online,
                user_info,
            },
        )
    }

    /// Forget a closed connection.
    ///
    /// If it was the user's current connection the user goes offline, every
    /// other connection is told so, and the user id is returned. A stale
    /// connection of a user who re-registered elsewhere changes nothing.
    pub fn unregister(&self, connection_id: &ConnectionId) -> Option<UserId> {
        self.connections.remove(connection_id);

        let (_, user_id) = self.connection_users.remove(connection_id)?;
        self.users
            .remove_if(&user_id, |_, e| e.handle.connection_id == *connection_id)?;

        info!(
            user_id = %user_id,
            connection_id = %connection_id,
            online_users = self.users.len(),
            "User went offline"
        );

        self.broadcast_except(
            connection_id,
            &ServerEvent::UserStatusChanged {
                user_id: user_id.clone(),
                status: PresenceStatus::Offline,
                user_info: None,
            },
        );

        Some(user_id)
    }

    /// Deliver `event` to the recipient's live connection.
    ///
    /// Returns false when the recipient is not registered or its connection
    /// has closed; the event is then dropped.
    pub fn route(&self, recipient: &UserId, event: ServerEvent) -> bool {
        let Some(handle) = self.users.get(recipient).map(|e| e.handle.clone()) else {
            debug!(
                recipient = %recipient,
                event = event.name(),
                "Recipient offline, event dropped"
            );
            return false;
        };
        handle.send(event)
    }

    /// Deliver `event` to a specific connection, registered or not
    pub fn send_to_connection(&self, connection_id: &ConnectionId, event: ServerEvent) -> bool {
        match self.connections.get(connection_id).map(|h| h.clone()) {
            Some(handle) => handle.send(event),
            None => false,
        }
    }

    /// Send `event` to every open connection except `except`
    pub fn broadcast_except(&self, except: &ConnectionId, event: &ServerEvent) -> usize {
        let handles: Vec<ConnectionHandle> = self
            .connections
            .iter()
            .filter(|entry| entry.key() != except)
            .map(|entry| entry.value().clone())
            .collect();

        let mut sent = 0;
        for handle in handles {
            if handle.send(event.clone()) {
                sent += 1;
            } else {
                warn!(
                    connection_id = %handle.connection_id,
                    event = event.name(),
                    "Broadcast to closed connection"
                );
            }
        }
        sent
    }

    /// User the connection registered as, if any
    #[must_use]
    pub fn user_of(&self, connection_id: &ConnectionId) -> Option<UserId> {
        self.connection_users.get(connection_id).map(|u| u.clone())
    }

    /// Current connection of a user, if online
    #[must_use]
    pub fn connection_of(&self, user_id: &UserId) -> Option<ConnectionId> {
        self.users.get(user_id).map(|e| e.handle.connection_id.clone())
    }

    #[must_use]
    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.users.contains_key(user_id)
    }

    /// Snapshot of online users, oldest registration first
    #[must_use]
    pub fn online_users(&self) -> Vec<OnlineUser> {
        let mut entries: Vec<(DateTime<Utc>, OnlineUser)> = self
            .users
            .iter()
            .map(|entry| {
                (
                    entry.registered_at,
                    OnlineUser {
                        user_id: entry.key().clone(),
                        user_info: entry.user_info.clone(),
                    },
                )
            })
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.user_id.cmp(&b.1.user_id)));
        entries.into_iter().map(|(_, user)| user).collect()
    }

    #[must_use]
    pub fn online_count(&self) -> usize {
        self.users.len()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Connections ever opened since startup
    #[must_use]
    pub fn total_connections(&self) -> u64 {
        self.metrics.connections_total.get()
    }

    /// Signal every open connection to close. Returns how many were signalled.
    pub fn close_all(&self) -> usize {
        let mut closed = 0;
        for entry in self.connections.iter() {
            entry.value().close();
            closed += 1;
        }
        info!(connections = closed, "Closing all connections");
        closed
    }
}
