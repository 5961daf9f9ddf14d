//! Relay protocol event definitions.
//!
//! Every frame is a JSON text message of the form
//! `{"event": "<name>", "data": <payload>}`. Event names are kebab-case and
//! payload fields camelCase, so existing web clients keep working.
//! Signaling payloads (SDP, ICE) are opaque to the relay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::chat::types::{Attachment, ChatMessage, MessageKind};

// ── Client → Relay ────────────────────────────────────────────────────────────

/// Events sent from a client to the relay server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Bind this connection to a user identity.
    /// Must be sent first unless the identity was given in the query string.
    JoinRoom(JoinRoom),

    /// Persist a chat message and forward it to the receiver.
    SendMessage(SendMessage),

    /// Mark a received message as read.
    MarkAsRead(MarkAsRead),

    /// Typing indicator, forwarded only.
    Typing(Typing),

    /// Change this user's presence status.
    UserStatusUpdate(StatusUpdate),

    /// Request a snapshot of online users.
    GetOnlineUsers,

    /// Ping to keep connection alive.
    Ping,

    /// Ask another user to start a call.
    WebrtcCallRequest(CallRequest),

    /// Accept or reject an incoming call.
    WebrtcCallResponse(CallResponse),

    WebrtcOffer(Signal),
    WebrtcAnswer(Signal),
    WebrtcIceCandidate(Signal),

    /// Hang up.
    WebrtcEndCall(EndCall),
}

/// `join-room` payload: either the bare user id or `{userId, userName}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JoinRoom {
    UserId(String),
    Profile {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "userName", default)]
        user_name: Option<String>,
    },
}

impl JoinRoom {
    pub fn user_id(&self) -> &str {
        match self {
            JoinRoom::UserId(id) => id,
            JoinRoom::Profile { user_id, .. } => user_id,
        }
    }

    pub fn user_name(&self) -> Option<&str> {
        match self {
            JoinRoom::UserId(_) => None,
            JoinRoom::Profile { user_name, .. } => user_name.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub sender_id: String,
    pub receiver_id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub message_type: MessageKind,
    #[serde(flatten)]
    pub attachment: Attachment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkAsRead {
    pub conversation_id: String,
    pub message_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Typing {
    #[serde(default)]
    pub sender_id: Option<String>,
    pub receiver_id: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: UserStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    /// Older clients send `targetUserId`.
    #[serde(alias = "targetUserId")]
    pub responder_id: String,
    #[serde(default)]
    pub call_type: CallType,
    #[serde(default)]
    pub room_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallResponse {
    pub caller_id: String,
    pub accepted: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Offer, answer or ICE candidate addressed to another user.
///
/// Everything except `targetUserId` is forwarded untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub target_user_id: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndCall {
    pub target_user_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

// ── Relay → Client ────────────────────────────────────────────────────────────

/// Events sent from the relay server to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Acknowledgement of a bound identity.
    RoomJoined(RoomJoined),

    /// A chat message addressed to this user.
    ReceiveMessage(DeliveredMessage),

    /// The sender's acknowledgement that a message was stored.
    MessageSent(DeliveredMessage),

    /// A chat message could not be sent.
    MessageError(MessageError),

    /// A message this user sent was read by its receiver.
    MessageRead(MessageRead),

    UserTyping(UserTyping),

    UserStatusChanged(StatusChanged),

    UserDisconnected(UserLeft),

    OnlineUsersList(Vec<OnlineUser>),

    WebrtcCallRequest(IncomingCall),
    WebrtcCallResponse(CallAnswer),
    WebrtcOffer(ForwardedSignal),
    WebrtcAnswer(ForwardedSignal),
    WebrtcIceCandidate(ForwardedSignal),
    WebrtcEndCall(CallEnded),

    /// A call event could not be delivered or was not valid.
    WebrtcCallError(CallError),

    /// Pong response to keep connection alive.
    Pong,

    /// Error response for anything that is not a chat send or call event.
    Error(ErrorMessage),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomJoined {
    pub user_id: String,
    pub user_name: String,
}

/// A stored message plus the conversation it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveredMessage {
    #[serde(flatten)]
    pub message: ChatMessage,
    pub conversation_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageError {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRead {
    pub message_id: String,
    pub conversation_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTyping {
    pub sender_id: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChanged {
    pub user_id: String,
    pub user_name: String,
    pub status: UserStatus,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLeft {
    pub user_id: String,
    pub user_name: String,
}

/// One entry of the online-users snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUser {
    pub user_id: String,
    pub user_name: String,
    pub connected_at: DateTime<Utc>,
    pub status: UserStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCall {
    pub caller_id: String,
    pub caller_name: String,
    pub call_type: CallType,
    pub room_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallAnswer {
    pub accepted: bool,
    pub responder_id: String,
    pub responder_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardedSignal {
    #[serde(flatten)]
    pub payload: Map<String, Value>,
    pub sender_id: String,
    pub sender_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEnded {
    pub sender_id: String,
    pub sender_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallError {
    pub error: String,
    pub target_user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub message: String,
}

// ── Shared Enums ──────────────────────────────────────────────────────────────

/// Presence status of a connected user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    #[default]
    Online,
    Away,
}

/// Media requested for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Audio,
    #[default]
    Video,
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// A frame that could not be turned into a [`ClientEvent`].
#[derive(Debug, Clone)]
pub struct DecodeError {
    /// The event name, if the envelope itself was readable.
    pub event: Option<String>,
    pub reason: String,
}

#[derive(Deserialize)]
struct Envelope {
    event: String,
}

/// Parse a text frame, keeping the event name around for error replies.
pub fn decode_client_event(text: &str) -> Result<ClientEvent, DecodeError> {
    serde_json::from_str::<ClientEvent>(text).map_err(|e| DecodeError {
        event: serde_json::from_str::<Envelope>(text).ok().map(|env| env.event),
        reason: e.to_string(),
    })
}
