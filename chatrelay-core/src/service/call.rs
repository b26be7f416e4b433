//! Call session coordination
//!
//! Owns every live [`CallSession`], applies state transitions and tells the
//! participants about them through the presence registry.
//!
//! Events for a transition are routed while the sessions lock is still held,
//! so a concurrent transition of the same room can never emit in between.
//! Routing only pushes onto unbounded channels and never awaits.
//!
//! Delayed work (invitation timeout, post-accept confirmation, periodic
//! sweep) runs on spawned tasks. Each delayed task re-checks that its session
//! still exists with the same generation before acting, because any
//! intervening event may already have removed it.

use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::presence::PresenceRegistry;
use crate::config::RelayConfig;
use crate::metrics::{outcome, RelayMetrics};
use crate::models::{
    CallData, CallSession, CallStatus, EndReason, RejectReason, RoomName, ServerEvent, StatusKind,
    UserId,
};
use crate::{Error, Result};

/// Call session registry and state machine driver
#[derive(Clone)]
pub struct CallService {
    sessions: Arc<Mutex<HashMap<RoomName, CallSession>>>,
    presence: PresenceRegistry,
    metrics: RelayMetrics,
    config: Arc<RelayConfig>,
    next_generation: Arc<AtomicU64>,
}

impl CallService {
    #[must_use]
    pub fn new(presence: PresenceRegistry, config: RelayConfig) -> Self {
        let metrics = presence.metrics().clone();
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            presence,
            metrics,
            config: Arc::new(config),
            next_generation: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Start a call from `caller` to `receiver_id`.
    ///
    /// The receiver must be online and the room must not already host a
    /// session. On success the receiver is invited, the caller is told the
    /// call is ringing and the invitation timeout starts.
    pub fn initiate_call(
        &self,
        caller: &UserId,
        receiver_id: UserId,
        mut call_data: CallData,
    ) -> Result<RoomName> {
        if call_data.caller_id != *caller {
            warn!(
                caller = %caller,
                claimed_caller = %call_data.caller_id,
                "Call data names a different caller, using the connection's user"
            );
            call_data.caller_id = caller.clone();
        }
        if *caller == receiver_id {
            return Err(Error::InvalidInput("Cannot call yourself".to_string()));
        }
        if call_data.room_name.as_str().is_empty() {
            return Err(Error::InvalidInput("Missing room name".to_string()));
        }
        if !self.presence.is_online(&receiver_id) {
            info!(caller = %caller, receiver = %receiver_id, "Call to offline user");
            return Err(Error::Offline(receiver_id.to_string()));
        }

        let room_name = call_data.room_name.clone();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut sessions = self.sessions.lock();
            if sessions.contains_key(&room_name) {
                return Err(Error::AlreadyExists(format!("Room {room_name}")));
            }
            sessions.insert(
                room_name.clone(),
                CallSession::new(call_data.clone(), receiver_id.clone(), generation, Utc::now()),
            );

            info!(
                room_name = %room_name,
                caller = %caller,
                receiver = %receiver_id,
                "Call initiated"
            );
            self.metrics.record_call(outcome::CALLING);

            self.presence
                .route(&receiver_id, ServerEvent::IncomingCall(call_data.clone()));
            self.presence
                .route(&receiver_id, ServerEvent::IncomingCallNotification(call_data));
            self.presence.route(
                caller,
                ServerEvent::status(StatusKind::Calling, Some(room_name.clone())),
            );
        }

        let service = self.clone();
        let room = room_name.clone();
        let timeout = self.config.call_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            service.expire_unanswered(&room, generation);
        });

        Ok(room_name)
    }

    /// Invitation timeout: drop the session unless both media transports
    /// came up in time
    fn expire_unanswered(&self, room_name: &RoomName, generation: u64) -> bool {
        let mut sessions = self.sessions.lock();
        let pending = sessions.get(room_name).is_some_and(|s| {
            s.generation == generation && s.status != CallStatus::Connected
        });
        if !pending {
            return false;
        }
        let Some(session) = sessions.remove(room_name) else {
            return false;
        };

        info!(
            room_name = %room_name,
            caller = %session.caller_id,
            receiver = %session.receiver_id,
            status = %session.status,
            "Call timed out before connecting"
        );
        self.metrics.record_call(outcome::TIMEOUT);
        self.notify_both(&session, &ServerEvent::status(StatusKind::Timeout, Some(room_name.clone())));
        true
    }

    /// `calling -> connecting`, by the receiver
    pub fn accept_call(&self, receiver: &UserId, caller_id: &UserId, call_data: &CallData) -> Result<()> {
        let room_name = call_data.room_name.clone();
        let now = Utc::now();

        let generation = {
            let mut sessions = self.sessions.lock();
            let session = sessions
                .get_mut(&room_name)
                .ok_or_else(|| Error::NotFound(format!("Call {room_name}")))?;
            if session.caller_id != *caller_id {
                return Err(Error::InvalidInput(format!(
                    "{caller_id} is not the caller of {room_name}"
                )));
            }
            let connected_now = session.accept(receiver, now)?;

            info!(room_name = %room_name, caller = %caller_id, receiver = %receiver, "Call accepted");

            let data = session.call_data.clone();
            self.presence
                .route(&session.caller_id, ServerEvent::CallAccepted(data.clone()));
            self.notify_both(session, &ServerEvent::status(StatusKind::Connecting, Some(room_name.clone())));
            self.notify_both(session, &ServerEvent::CallConnecting(data));
            if connected_now {
                self.announce_connected(session);
            }
            session.generation
        };

        let service = self.clone();
        let delay = self.config.connect_confirm();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            service.confirm_started(&room_name, generation);
        });

        Ok(())
    }

    /// Post-accept confirmation: tell both sides the call is on if it survived
    fn confirm_started(&self, room_name: &RoomName, generation: u64) -> bool {
        let sessions = self.sessions.lock();
        let Some(session) = sessions.get(room_name).filter(|s| s.generation == generation) else {
            debug!(room_name = %room_name, "Call gone before start confirmation");
            return false;
        };

        debug!(room_name = %room_name, status = %session.status, "Call start confirmed");
        self.notify_both(session, &ServerEvent::CallStarted(session.call_data.clone()));
        true
    }

    /// Receiver turns the call down; the session is removed.
    ///
    /// Without `room_name` the session is found by its two participants.
    pub fn reject_call(
        &self,
        receiver: &UserId,
        caller_id: &UserId,
        reason: RejectReason,
        room_name: Option<&RoomName>,
    ) -> Result<bool> {
        let mut sessions = self.sessions.lock();
        let key = match room_name {
            Some(room) => sessions.contains_key(room).then(|| room.clone()),
            None => sessions
                .values()
                .find(|s| s.caller_id == *caller_id && s.receiver_id == *receiver)
                .map(|s| s.room_name.clone()),
        };
        let Some(key) = key else {
            debug!(caller = %caller_id, receiver = %receiver, "Reject for unknown call ignored");
            return Ok(false);
        };

        let session = sessions
            .get(&key)
            .ok_or_else(|| Error::Internal("session vanished under lock".to_string()))?;
        if session.caller_id != *caller_id {
            return Err(Error::InvalidInput(format!(
                "{caller_id} is not the caller of {key}"
            )));
        }
        session.check_reject(receiver)?;
        sessions.remove(&key);

        info!(
            room_name = %key,
            caller = %caller_id,
            receiver = %receiver,
            reason = ?reason,
            "Call rejected"
        );
        self.metrics.record_call(outcome::REJECTED);

        self.presence.route(
            caller_id,
            ServerEvent::CallRejected {
                room_name: Some(key.clone()),
                receiver_id: receiver.clone(),
                reason,
                message: reason.message().to_string(),
            },
        );
        self.presence.route(
            caller_id,
            ServerEvent::status_with_message(StatusKind::Rejected, reason.message(), Some(key)),
        );
        Ok(true)
    }

    /// A participant reports its media transport connected.
    ///
    /// The session becomes `connected` once both participants reported,
    /// whatever the order.
    pub fn media_connected(&self, user_id: &UserId, room_name: &RoomName) -> Result<CallStatus> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(room_name)
            .ok_or_else(|| Error::NotFound(format!("Call {room_name}")))?;
        let connected_now = session.mark_media_connected(user_id, Utc::now())?;

        debug!(
            room_name = %room_name,
            user_id = %user_id,
            caller_ready = session.caller_livekit_connected,
            receiver_ready = session.receiver_livekit_connected,
            "Media transport connected"
        );

        if connected_now {
            self.announce_connected(session);
        }
        Ok(session.status)
    }

    fn announce_connected(&self, session: &CallSession) {
        info!(
            room_name = %session.room_name,
            caller = %session.caller_id,
            receiver = %session.receiver_id,
            "Call connected"
        );
        self.metrics.record_call(outcome::CONNECTED);
        self.notify_both(
            session,
            &ServerEvent::status(StatusKind::Connected, Some(session.room_name.clone())),
        );
    }

    /// `user_id` hangs up: every session involving them ends and each peer
    /// is told who ended it. Returns the number of sessions ended.
    pub fn end_call(&self, user_id: &UserId) -> usize {
        let mut sessions = self.sessions.lock();
        let ended = remove_sessions_of(&mut sessions, user_id);
        if ended.is_empty() {
            debug!(user_id = %user_id, "End call with no active session");
        }
        for session in &ended {
            info!(room_name = %session.room_name, ended_by = %user_id, "Call ended");
            self.metrics.record_call(outcome::ENDED);
            self.notify_peer_ended(session, user_id, EndReason::Hangup);
        }
        ended.len()
    }

    /// `user_id` lost its connection: end every session involving them
    pub fn handle_disconnect(&self, user_id: &UserId) -> usize {
        let mut sessions = self.sessions.lock();
        let ended = remove_sessions_of(&mut sessions, user_id);
        for session in &ended {
            info!(room_name = %session.room_name, user_id = %user_id, "Call ended by disconnect");
            self.metrics.record_call(outcome::ENDED);
            self.notify_peer_ended(session, user_id, EndReason::Disconnect);
        }
        ended.len()
    }

    fn notify_peer_ended(&self, session: &CallSession, ended_by: &UserId, reason: EndReason) {
        let Some(peer) = session.peer_of(ended_by) else {
            return;
        };
        self.presence.route(
            peer,
            ServerEvent::CallEnded {
                room_name: session.room_name.clone(),
                ended_by: Some(ended_by.clone()),
                reason,
                message: reason.message().to_string(),
            },
        );
        self.presence.route(
            peer,
            ServerEvent::status_with_message(
                StatusKind::Ended,
                reason.message(),
                Some(session.room_name.clone()),
            ),
        );
    }

    fn notify_both(&self, session: &CallSession, event: &ServerEvent) {
        self.presence.route(&session.caller_id, event.clone());
        self.presence.route(&session.receiver_id, event.clone());
    }

    /// Remove sessions the primary timers failed to clean up
    pub fn sweep_stale(&self) -> Vec<RoomName> {
        self.sweep_stale_at(Utc::now())
    }

    pub fn sweep_stale_at(&self, now: chrono::DateTime<Utc>) -> Vec<RoomName> {
        let max_age = seconds(self.config.max_session_age_seconds);
        let max_ringing = seconds(self.config.stale_calling_seconds);

        let mut sessions = self.sessions.lock();
        let rooms: Vec<RoomName> = sessions
            .values()
            .filter(|s| s.is_stale(now, max_age, max_ringing))
            .map(|s| s.room_name.clone())
            .collect();
        let stale: Vec<CallSession> = rooms
            .iter()
            .filter_map(|room| sessions.remove(room))
            .collect();

        for session in &stale {
            warn!(
                room_name = %session.room_name,
                status = %session.status,
                age_seconds = session.age(now).num_seconds(),
                "Swept stale call session"
            );
            let room = Some(session.room_name.clone());
            if session.status == CallStatus::Calling {
                self.metrics.record_call(outcome::TIMEOUT);
                self.notify_both(session, &ServerEvent::status(StatusKind::Timeout, room));
            } else {
                self.metrics.record_call(outcome::ENDED);
                self.notify_both(
                    session,
                    &ServerEvent::CallEnded {
                        room_name: session.room_name.clone(),
                        ended_by: None,
                        reason: EndReason::Expired,
                        message: EndReason::Expired.message().to_string(),
                    },
                );
                self.notify_both(
                    session,
                    &ServerEvent::status_with_message(StatusKind::Ended, EndReason::Expired.message(), room),
                );
            }
        }

        rooms
    }

    /// Start the periodic stale-session sweep
    #[must_use]
    pub fn start_sweeper(&self) -> JoinHandle<()> {
        let service = self.clone();
        let period = self.config.sweep_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately
            interval.tick().await;

            loop {
                interval.tick().await;
                let swept = service.sweep_stale();
                if !swept.is_empty() {
                    info!(count = swept.len(), "Stale call sweep removed sessions");
                }
            }
        })
    }

    #[must_use]
    pub fn session(&self, room_name: &RoomName) -> Option<CallSession> {
        self.sessions.lock().get(room_name).cloned()
    }

    /// Snapshot of live sessions, oldest first
    #[must_use]
    pub fn active_sessions(&self) -> Vec<CallSession> {
        let mut sessions: Vec<CallSession> = self.sessions.lock().values().cloned().collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

fn remove_sessions_of(sessions: &mut HashMap<RoomName, CallSession>, user_id: &UserId) -> Vec<CallSession> {
    let rooms: Vec<RoomName> = sessions
        .values()
        .filter(|s| s.is_participant(user_id))
        .map(|s| s.room_name.clone())
        .collect();
    rooms
        .iter()
        .filter_map(|room| sessions.remove(room))
        .collect()
}

fn seconds(secs: u64) -> ChronoDuration {
    ChronoDuration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
}
