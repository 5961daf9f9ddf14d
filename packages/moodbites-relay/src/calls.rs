//! Call signaling relay.
//!
//! The relay never touches media. It tracks one [`CallSession`] per
//! (caller, responder) pair so it can reject stray responses, time out
//! unanswered requests and tear calls down when a participant vanishes.
//! Offer, answer and ICE payloads are forwarded verbatim.
//!
//! ```text
//! Requested ──accept──► Accepted ──offer/answer──► Active ──end──► Ended
//!     │                    │                                  ▲
//!     ├──reject──► Rejected └────────────────end──────────────┘
//!     └──timeout─► TimedOut
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::chat::types::validate_user_id;
use crate::presence::{default_display_name, ClientHandle, PresenceRegistry};
use crate::protocol::{
    CallAnswer, CallEnded, CallError, CallRequest, CallResponse, CallType, EndCall,
    ForwardedSignal, IncomingCall, ServerEvent, Signal,
};

/// Reason attached when a request times out.
pub const REASON_UNANSWERED: &str = "unanswered";

/// Reason attached when a participant's last connection closes.
pub const REASON_DISCONNECTED: &str = "disconnected";

const ERROR_OFFLINE: &str = "User is offline";

/// State of one call attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Requested,
    Accepted,
    Rejected,
    Active,
    Ended,
    TimedOut,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Rejected | CallState::Ended | CallState::TimedOut)
    }
}

/// One in-flight or finished call attempt.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub id: Uuid,
    pub caller_id: String,
    pub caller_name: String,
    pub responder_id: String,
    pub room_id: String,
    pub call_type: CallType,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CallSession {
    /// The participant that is not `user_id`.
    pub fn peer_of(&self, user_id: &str) -> &str {
        if self.caller_id == user_id {
            &self.responder_id
        } else {
            &self.caller_id
        }
    }

    fn transition(&mut self, state: CallState) {
        self.state = state;
        self.updated_at = Utc::now();
    }
}

/// Call sessions keyed by (caller, responder).
#[derive(Clone, Default)]
pub struct CallTracker {
    sessions: Arc<DashMap<(String, String), CallSession>>,
}

fn key(caller_id: &str, responder_id: &str) -> (String, String) {
    (caller_id.to_string(), responder_id.to_string())
}

impl CallTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new session, replacing any previous one for the same pair.
    pub fn begin(
        &self,
        caller: &ClientHandle,
        responder_id: &str,
        room_id: &str,
        call_type: CallType,
    ) -> CallSession {
        let now = Utc::now();
        let session = CallSession {
            id: Uuid::new_v4(),
            caller_id: caller.user_id.clone(),
            caller_name: caller.display_name.clone(),
            responder_id: responder_id.to_string(),
            room_id: room_id.to_string(),
            call_type,
            state: CallState::Requested,
            created_at: now,
            updated_at: now,
        };

        if let Some(previous) = self
            .sessions
            .insert(key(&caller.user_id, responder_id), session.clone())
        {
            if !previous.state.is_terminal() {
                tracing::debug!(
                    caller_id = caller.user_id.as_str(),
                    responder_id = responder_id,
                    previous_state = ?previous.state,
                    "Superseded call session"
                );
            }
        }

        session
    }

    /// Apply the responder's answer to a pending request.
    /// Returns None unless the session exists and is still Requested.
    pub fn respond(&self, caller_id: &str, responder_id: &str, accepted: bool) -> Option<CallSession> {
        let mut session = self.sessions.get_mut(&key(caller_id, responder_id))?;
        if session.state != CallState::Requested {
            return None;
        }
        session.transition(if accepted {
            CallState::Accepted
        } else {
            CallState::Rejected
        });
        Some(session.clone())
    }

    /// Move an Accepted session between the two users to Active.
    pub fn activate(&self, a: &str, b: &str) -> bool {
        for pair in [key(a, b), key(b, a)] {
            if let Some(mut session) = self.sessions.get_mut(&pair) {
                if session.state == CallState::Accepted {
                    session.transition(CallState::Active);
                    return true;
                }
            }
        }
        false
    }

    /// End every live session between the two users, in either direction.
    pub fn end_between(&self, a: &str, b: &str) -> Vec<CallSession> {
        let mut ended = Vec::new();
        for pair in [key(a, b), key(b, a)] {
            if let Some(mut session) = self.sessions.get_mut(&pair) {
                if !session.state.is_terminal() {
                    session.transition(CallState::Ended);
                    ended.push(session.clone());
                }
            }
        }
        ended
    }

    /// Time out a request that is still unanswered.
    /// `session_id` guards against a newer request for the same pair.
    pub fn time_out(&self, caller_id: &str, responder_id: &str, session_id: Uuid) -> Option<CallSession> {
        let mut session = self.sessions.get_mut(&key(caller_id, responder_id))?;
        if session.id != session_id || session.state != CallState::Requested {
            return None;
        }
        session.transition(CallState::TimedOut);
        Some(session.clone())
    }

    /// Drop a session that never reached the responder.
    pub fn discard(&self, caller_id: &str, responder_id: &str, session_id: Uuid) {
        self.sessions
            .remove_if(&key(caller_id, responder_id), |_, s| s.id == session_id);
    }

    /// End every live session involving `user_id`.
    pub fn end_all_for(&self, user_id: &str) -> Vec<CallSession> {
        let mut ended = Vec::new();
        for mut entry in self.sessions.iter_mut() {
            let session = entry.value_mut();
            if (session.caller_id == user_id || session.responder_id == user_id)
                && !session.state.is_terminal()
            {
                session.transition(CallState::Ended);
                ended.push(session.clone());
            }
        }
        ended
    }

    pub fn get(&self, caller_id: &str, responder_id: &str) -> Option<CallSession> {
        self.sessions
            .get(&key(caller_id, responder_id))
            .map(|s| s.clone())
    }

    /// Remove terminal sessions and sessions older than `ttl_secs`.
    pub fn cleanup(&self, ttl_secs: i64) -> usize {
        let now = Utc::now().timestamp();
        let expired = |session: &CallSession| {
            session.state.is_terminal() || now - session.created_at.timestamp() > ttl_secs
        };
        let candidates: Vec<(String, String)> = self
            .sessions
            .iter()
            .filter(|entry| expired(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();

        // Re-check under the shard lock; the pair may have been restarted.
        let mut removed = 0;
        for pair in &candidates {
            if self
                .sessions
                .remove_if(pair, |_, session| expired(session))
                .is_some()
            {
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::debug!(count = removed, "Cleaned up call sessions");
        }
        removed
    }

    /// Number of tracked sessions, terminal ones included.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Number of sessions that have not reached a terminal state.
    pub fn in_progress(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| !entry.state.is_terminal())
            .count()
    }
}

/// Which signaling payload is being forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

/// Forwards call events between two online users.
#[derive(Clone)]
pub struct CallRelay {
    presence: PresenceRegistry,
    tracker: CallTracker,
    timeout: Duration,
}

impl CallRelay {
    /// A zero `timeout` disables the unanswered-call timer.
    pub fn new(presence: PresenceRegistry, tracker: CallTracker, timeout: Duration) -> Self {
        Self {
            presence,
            tracker,
            timeout,
        }
    }

    pub fn tracker(&self) -> &CallTracker {
        &self.tracker
    }

    /// Handle `webrtc-call-request` from `origin`.
    pub fn request(&self, origin: &ClientHandle, request: CallRequest) {
        let responder_id = request.responder_id;
        if let Err(e) = validate_user_id(&responder_id) {
            return reject(origin, &responder_id, e.client_message());
        }
        if responder_id == origin.user_id {
            return reject(origin, &responder_id, "Cannot call yourself".to_string());
        }
        if !self.presence.is_online(&responder_id) {
            tracing::debug!(
                caller_id = origin.user_id.as_str(),
                responder_id = responder_id.as_str(),
                "Call to offline user"
            );
            return reject(origin, &responder_id, ERROR_OFFLINE.to_string());
        }

        let room_id = request
            .room_id
            .filter(|room| !room.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let session = self
            .tracker
            .begin(origin, &responder_id, &room_id, request.call_type);

        let delivered = self.presence.send_to_user(
            &responder_id,
            ServerEvent::WebrtcCallRequest(IncomingCall {
                caller_id: origin.user_id.clone(),
                caller_name: origin.display_name.clone(),
                call_type: request.call_type,
                room_id,
            }),
        );
        if delivered == 0 {
            self.tracker
                .discard(&origin.user_id, &responder_id, session.id);
            return reject(origin, &responder_id, ERROR_OFFLINE.to_string());
        }

        tracing::info!(
            caller_id = origin.user_id.as_str(),
            responder_id = responder_id.as_str(),
            room_id = session.room_id.as_str(),
            call_type = ?session.call_type,
            "Call requested"
        );

        self.schedule_timeout(&session);
    }

    /// Handle `webrtc-call-response` from `origin` (the responder).
    pub fn respond(&self, origin: &ClientHandle, response: CallResponse) {
        let caller_id = response.caller_id;
        let Some(session) = self
            .tracker
            .respond(&caller_id, &origin.user_id, response.accepted)
        else {
            tracing::debug!(
                caller_id = caller_id.as_str(),
                responder_id = origin.user_id.as_str(),
                "Response without a pending call"
            );
            return reject(origin, &caller_id, "No pending call from this user".to_string());
        };

        let delivered = self.presence.send_to_user(
            &caller_id,
            ServerEvent::WebrtcCallResponse(CallAnswer {
                accepted: response.accepted,
                responder_id: origin.user_id.clone(),
                responder_name: origin.display_name.clone(),
                reason: response.reason,
            }),
        );
        if delivered == 0 {
            self.tracker.end_between(&caller_id, &origin.user_id);
            return reject(origin, &caller_id, ERROR_OFFLINE.to_string());
        }

        tracing::info!(
            caller_id = caller_id.as_str(),
            responder_id = origin.user_id.as_str(),
            state = ?session.state,
            "Call answered"
        );
    }

    /// Forward an offer, answer or ICE candidate to its target.
    pub fn forward_signal(&self, origin: &ClientHandle, kind: SignalKind, signal: Signal) {
        let target_id = signal.target_user_id;
        if let Err(e) = validate_user_id(&target_id) {
            return reject(origin, &target_id, e.client_message());
        }

        let mut payload = signal.payload;
        payload.remove("senderId");
        payload.remove("senderName");
        let forwarded = ForwardedSignal {
            payload,
            sender_id: origin.user_id.clone(),
            sender_name: origin.display_name.clone(),
        };
        let event = match kind {
            SignalKind::Offer => ServerEvent::WebrtcOffer(forwarded),
            SignalKind::Answer => ServerEvent::WebrtcAnswer(forwarded),
            SignalKind::IceCandidate => ServerEvent::WebrtcIceCandidate(forwarded),
        };

        if self.presence.send_to_user(&target_id, event) == 0 {
            return reject(origin, &target_id, ERROR_OFFLINE.to_string());
        }

        if matches!(kind, SignalKind::Offer | SignalKind::Answer)
            && self.tracker.activate(&origin.user_id, &target_id)
        {
            tracing::info!(
                user_id = origin.user_id.as_str(),
                peer_id = target_id.as_str(),
                "Call active"
            );
        }

        tracing::debug!(
            from = origin.user_id.as_str(),
            to = target_id.as_str(),
            kind = ?kind,
            "Forwarded signal"
        );
    }

    /// Handle `webrtc-end-call` from `origin`.
    pub fn end_call(&self, origin: &ClientHandle, end: EndCall) {
        let target_id = end.target_user_id;
        if let Err(e) = validate_user_id(&target_id) {
            return reject(origin, &target_id, e.client_message());
        }

        let ended = self.tracker.end_between(&origin.user_id, &target_id);
        let delivered = self.presence.send_to_user(
            &target_id,
            ServerEvent::WebrtcEndCall(CallEnded {
                sender_id: origin.user_id.clone(),
                sender_name: origin.display_name.clone(),
                reason: end.reason,
            }),
        );

        tracing::info!(
            user_id = origin.user_id.as_str(),
            peer_id = target_id.as_str(),
            sessions = ended.len(),
            "Call ended"
        );

        if delivered == 0 {
            reject(origin, &target_id, ERROR_OFFLINE.to_string());
        }
    }

    /// End every call of a user whose last connection closed.
    pub fn disconnect(&self, user_id: &str, display_name: &str) {
        for session in self.tracker.end_all_for(user_id) {
            let peer_id = session.peer_of(user_id);
            self.presence.send_to_user(
                peer_id,
                ServerEvent::WebrtcEndCall(CallEnded {
                    sender_id: user_id.to_string(),
                    sender_name: display_name.to_string(),
                    reason: Some(REASON_DISCONNECTED.to_string()),
                }),
            );
            tracing::info!(
                user_id = user_id,
                peer_id = peer_id,
                "Call ended by disconnect"
            );
        }
    }

    /// Time out a request if it is still unanswered.
    pub fn expire(&self, caller_id: &str, responder_id: &str, session_id: Uuid) -> bool {
        let Some(session) = self.tracker.time_out(caller_id, responder_id, session_id) else {
            return false;
        };

        tracing::info!(
            caller_id = caller_id,
            responder_id = responder_id,
            "Call unanswered"
        );

        let responder_name = self
            .presence
            .display_name(responder_id)
            .unwrap_or_else(|| default_display_name(responder_id));
        self.presence.send_to_user(
            caller_id,
            ServerEvent::WebrtcCallResponse(CallAnswer {
                accepted: false,
                responder_id: responder_id.to_string(),
                responder_name,
                reason: Some(REASON_UNANSWERED.to_string()),
            }),
        );
        self.presence.send_to_user(
            responder_id,
            ServerEvent::WebrtcEndCall(CallEnded {
                sender_id: caller_id.to_string(),
                sender_name: session.caller_name,
                reason: Some(REASON_UNANSWERED.to_string()),
            }),
        );
        true
    }

    fn schedule_timeout(&self, session: &CallSession) {
        if self.timeout.is_zero() {
            return;
        }

        let relay = self.clone();
        let timeout = self.timeout;
        let caller_id = session.caller_id.clone();
        let responder_id = session.responder_id.clone();
        let session_id = session.id;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            relay.expire(&caller_id, &responder_id, session_id);
        });
    }
}

fn reject(origin: &ClientHandle, target_user_id: &str, error: String) {
    origin.send(ServerEvent::WebrtcCallError(CallError {
        error,
        target_user_id: target_user_id.to_string(),
    }));
}
