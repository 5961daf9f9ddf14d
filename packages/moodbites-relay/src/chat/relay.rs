//! Chat relay: validate, persist, then forward.
//!
//! A message is only forwarded to the receiver after the store has durably
//! accepted it. If persistence fails the sender gets `message-error` and
//! the receiver sees nothing.

use std::sync::Arc;

use super::store::ConversationStore;
use super::types::{validate_user_id, MarkReadOutcome, MessageKind, NewMessage};
use crate::error::{RelayError, Result};
use crate::presence::{ClientHandle, PresenceRegistry};
use crate::protocol::{
    DeliveredMessage, ErrorMessage, MarkAsRead, MessageError, MessageRead, SendMessage, ServerEvent,
    Typing, UserTyping,
};

/// Routes chat events between connections and the conversation store.
#[derive(Clone)]
pub struct ChatRelay {
    presence: PresenceRegistry,
    store: Arc<dyn ConversationStore>,
    max_message_chars: usize,
}

impl ChatRelay {
    pub fn new(
        presence: PresenceRegistry,
        store: Arc<dyn ConversationStore>,
        max_message_chars: usize,
    ) -> Self {
        Self {
            presence,
            store,
            max_message_chars,
        }
    }

    /// Handle `send-message` from `origin`.
    pub async fn send_message(&self, origin: &ClientHandle, payload: SendMessage) {
        let message = match self.validate(origin, payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(user_id = origin.user_id.as_str(), error = %e, "Rejected message");
                origin.send(ServerEvent::MessageError(MessageError {
                    error: e.client_message(),
                }));
                return;
            }
        };

        let store = self.store.clone();
        let appended = tokio::task::spawn_blocking(move || store.append_message(message))
            .await
            .map_err(RelayError::from)
            .and_then(|result| result);

        let appended = match appended {
            Ok(appended) => appended,
            Err(e) => {
                tracing::error!(
                    user_id = origin.user_id.as_str(),
                    error = %e,
                    "Failed to store message"
                );
                origin.send(ServerEvent::MessageError(MessageError {
                    error: e.client_message(),
                }));
                return;
            }
        };

        let delivered = DeliveredMessage {
            message: appended.message,
            conversation_id: appended.conversation_id,
        };
        let receiver_id = delivered.message.receiver_id.clone();

        let connections = self
            .presence
            .send_to_user(&receiver_id, ServerEvent::ReceiveMessage(delivered.clone()));

        tracing::debug!(
            sender_id = origin.user_id.as_str(),
            receiver_id = receiver_id.as_str(),
            conversation_id = delivered.conversation_id.as_str(),
            new_conversation = appended.created_conversation,
            connections,
            "Message stored"
        );

        origin.send(ServerEvent::MessageSent(delivered));
    }

    /// Handle `mark-as-read` from `origin`.
    pub async fn mark_as_read(&self, origin: &ClientHandle, payload: MarkAsRead) {
        if payload.user_id != origin.user_id {
            tracing::warn!(
                user_id = origin.user_id.as_str(),
                claimed = payload.user_id.as_str(),
                "Read receipt for another user"
            );
            origin.send(ServerEvent::Error(ErrorMessage {
                message: "userId does not match the connected user".to_string(),
            }));
            return;
        }

        let store = self.store.clone();
        let conversation_id = payload.conversation_id.clone();
        let message_id = payload.message_id.clone();
        let user_id = payload.user_id.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            store.mark_read(&conversation_id, &message_id, &user_id)
        })
        .await
        .map_err(RelayError::from)
        .and_then(|result| result);

        match outcome {
            Ok(MarkReadOutcome::Marked { sender_id }) => {
                self.presence.send_to_user(
                    &sender_id,
                    ServerEvent::MessageRead(MessageRead {
                        message_id: payload.message_id,
                        conversation_id: payload.conversation_id,
                    }),
                );
            }
            Ok(outcome) => {
                tracing::debug!(
                    user_id = origin.user_id.as_str(),
                    message_id = payload.message_id.as_str(),
                    ?outcome,
                    "Read receipt ignored"
                );
            }
            Err(e @ (RelayError::ConversationNotFound(_) | RelayError::MessageNotFound(_))) => {
                tracing::debug!(user_id = origin.user_id.as_str(), error = %e, "Read receipt ignored");
            }
            Err(e) => {
                tracing::error!(
                    user_id = origin.user_id.as_str(),
                    error = %e,
                    "Failed to mark message as read"
                );
                origin.send(ServerEvent::Error(ErrorMessage {
                    message: e.client_message(),
                }));
            }
        }
    }

    /// Handle `typing` from `origin`. Forward only, best effort.
    pub fn typing(&self, origin: &ClientHandle, payload: Typing) {
        let checked = validate_user_id(&payload.receiver_id).and_then(|()| {
            if payload.receiver_id == origin.user_id {
                Err(RelayError::InvalidPayload(
                    "Cannot send typing to yourself".to_string(),
                ))
            } else {
                Ok(())
            }
        });
        if let Err(e) = checked {
            tracing::warn!(
                user_id = origin.user_id.as_str(),
                error = %e,
                "Rejected typing event"
            );
            origin.send(ServerEvent::Error(ErrorMessage {
                message: e.client_message(),
            }));
            return;
        }

        self.presence.send_to_user(
            &payload.receiver_id,
            ServerEvent::UserTyping(UserTyping {
                sender_id: origin.user_id.clone(),
                is_typing: payload.is_typing,
            }),
        );
    }

    fn validate(&self, origin: &ClientHandle, payload: SendMessage) -> Result<NewMessage> {
        if payload.sender_id != origin.user_id {
            return Err(RelayError::InvalidPayload(
                "senderId does not match the connected user".to_string(),
            ));
        }
        validate_user_id(&payload.receiver_id)?;
        if payload.receiver_id == payload.sender_id {
            return Err(RelayError::InvalidPayload(
                "Cannot send a message to yourself".to_string(),
            ));
        }
        if payload.message_type == MessageKind::Text && payload.message.trim().is_empty() {
            return Err(RelayError::InvalidPayload(
                "message is required for text messages".to_string(),
            ));
        }
        if payload.message.chars().count() > self.max_message_chars {
            return Err(RelayError::InvalidPayload(format!(
                "message exceeds {} characters",
                self.max_message_chars
            )));
        }

        let attachment = payload.attachment.for_kind(payload.message_type)?;

        Ok(NewMessage {
            sender_id: payload.sender_id,
            receiver_id: payload.receiver_id,
            body: payload.message,
            kind: payload.message_type,
            attachment,
        })
    }
}
