//! WebSocket connection handler.
//!
//! Manages individual WebSocket connections: binding them to a user id,
//! decoding client events, dispatching them to the chat and call relays,
//! and cleaning up on close.

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::calls::SignalKind;
use crate::chat::types::validate_user_id;
use crate::presence::{default_display_name, ClientHandle, ClientSender};
use crate::protocol::{
    decode_client_event, ClientEvent, DecodeError, ErrorMessage, MessageError, RoomJoined,
    ServerEvent,
};
use crate::state::RelayState;

/// Longest display name kept for a connection.
const MAX_DISPLAY_NAME_CHARS: usize = 64;

/// Identity supplied on the upgrade request, e.g. `/ws?userId=u1&userName=Asha`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectQuery {
    pub user_id: Option<String>,
    pub user_name: Option<String>,
}

/// Handle a single WebSocket connection.
///
/// This function runs for the lifetime of the connection:
/// 1. Spawns a sender task to forward outbound events
/// 2. Binds the connection to a user id, from the query string or the
///    first `join-room` event
/// 3. Processes incoming events until the connection closes
pub async fn handle_websocket(socket: WebSocket, state: RelayState, query: ConnectQuery) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Create the outbound channel for this client
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();

    // ── Step 1: Spawn Sender Task ─────────────────────────────────────────

    let sender_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break; // Connection closed
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize server event: {}", e);
                }
            }
        }
    });

    // ── Step 2: Bind Identity ─────────────────────────────────────────────

    let preset = query.user_id.filter(|id| !id.trim().is_empty());
    let identity = match preset {
        Some(user_id) => match validate_user_id(&user_id) {
            Ok(()) => Some((user_id, query.user_name)),
            Err(e) => {
                tracing::warn!(error = %e, "Rejected connection identity");
                send_error(&tx, e.client_message());
                None
            }
        },
        None => wait_for_join(&mut ws_receiver, &tx).await,
    };

    let Some((user_id, user_name)) = identity else {
        // Let the sender task flush whatever error it holds.
        drop(tx);
        let _ = sender_task.await;
        return;
    };

    let display_name = display_name_for(&user_id, user_name.as_deref());
    let client = ClientHandle::new(&user_id, &display_name, tx);

    // Registered before the ack, so a client that saw `room-joined` is reachable.
    state.register_client(&client);
    client.send(ServerEvent::RoomJoined(RoomJoined {
        user_id: client.user_id.clone(),
        user_name: client.display_name.clone(),
    }));
    tracing::info!(
        user_id = client.user_id.as_str(),
        connection_id = %client.connection_id,
        "WebSocket registered"
    );

    // ── Step 3: Process Events ────────────────────────────────────────────

    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match decode_client_event(&text) {
                Ok(event) => handle_client_event(&state, &client, event).await,
                Err(e) => reply_decode_error(&client, e),
            },
            Ok(Message::Close(_)) => {
                tracing::info!(user_id = client.user_id.as_str(), "Client sent close frame");
                break;
            }
            Err(e) => {
                tracing::warn!(
                    user_id = client.user_id.as_str(),
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
            _ => {} // Binary, Ping, Pong: ignore
        }
    }

    // ── Step 4: Cleanup ───────────────────────────────────────────────────

    state.unregister_client(&client);
    sender_task.abort();
    tracing::info!(
        user_id = client.user_id.as_str(),
        connection_id = %client.connection_id,
        "WebSocket disconnected"
    );
}

/// Read events until a valid `join-room` arrives.
/// Returns None if the connection closes first.
async fn wait_for_join(
    ws_receiver: &mut SplitStream<WebSocket>,
    tx: &ClientSender,
) -> Option<(String, Option<String>)> {
    loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => match decode_client_event(&text) {
                Ok(ClientEvent::JoinRoom(join)) => match validate_user_id(join.user_id()) {
                    Ok(()) => {
                        return Some((
                            join.user_id().to_string(),
                            join.user_name().map(str::to_string),
                        ))
                    }
                    Err(e) => send_error(tx, e.client_message()),
                },
                Ok(ClientEvent::Ping) => {
                    let _ = tx.send(ServerEvent::Pong);
                }
                Ok(_) => send_error(tx, "Must join a room before sending other events".to_string()),
                Err(e) => {
                    tracing::warn!(error = %e.reason, "Failed to parse client event");
                    send_error(tx, format!("Invalid event format: {}", e.reason));
                }
            },
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                return None; // Connection closed before joining
            }
            _ => continue,
        }
    }
}

/// Handle a decoded event from a bound connection.
pub async fn handle_client_event(state: &RelayState, client: &ClientHandle, event: ClientEvent) {
    match event {
        ClientEvent::JoinRoom(join) => {
            if join.user_id() == client.user_id {
                client.send(ServerEvent::RoomJoined(RoomJoined {
                    user_id: client.user_id.clone(),
                    user_name: client.display_name.clone(),
                }));
            } else {
                tracing::warn!(
                    user_id = client.user_id.as_str(),
                    requested = join.user_id(),
                    "Rebind attempt"
                );
                send_error(
                    &client.sender,
                    "Connection is already bound to another user".to_string(),
                );
            }
        }

        ClientEvent::SendMessage(payload) => {
            state.chat.send_message(client, payload).await;
        }

        ClientEvent::MarkAsRead(payload) => {
            state.chat.mark_as_read(client, payload).await;
        }

        ClientEvent::Typing(payload) => {
            state.chat.typing(client, payload);
        }

        ClientEvent::UserStatusUpdate(update) => {
            state.presence.update_status(&client.user_id, update.status);
        }

        ClientEvent::GetOnlineUsers => {
            client.send(ServerEvent::OnlineUsersList(state.presence.list_online()));
        }

        ClientEvent::Ping => {
            client.send(ServerEvent::Pong);
        }

        ClientEvent::WebrtcCallRequest(request) => {
            state.calls.request(client, request);
        }

        ClientEvent::WebrtcCallResponse(response) => {
            state.calls.respond(client, response);
        }

        ClientEvent::WebrtcOffer(signal) => {
            state.calls.forward_signal(client, SignalKind::Offer, signal);
        }

        ClientEvent::WebrtcAnswer(signal) => {
            state.calls.forward_signal(client, SignalKind::Answer, signal);
        }

        ClientEvent::WebrtcIceCandidate(signal) => {
            state
                .calls
                .forward_signal(client, SignalKind::IceCandidate, signal);
        }

        ClientEvent::WebrtcEndCall(end) => {
            state.calls.end_call(client, end);
        }
    }
}

/// Report an undecodable frame back to its sender.
/// Chat sends get `message-error` so the client can mark the message failed.
fn reply_decode_error(client: &ClientHandle, error: DecodeError) {
    tracing::warn!(
        user_id = client.user_id.as_str(),
        event = error.event.as_deref().unwrap_or("<unreadable>"),
        error = %error.reason,
        "Failed to parse client event"
    );

    match error.event.as_deref() {
        Some("send-message") => {
            client.send(ServerEvent::MessageError(MessageError {
                error: format!("Invalid message payload: {}", error.reason),
            }));
        }
        Some(event) => send_error(
            &client.sender,
            format!("Invalid {} event: {}", event, error.reason),
        ),
        None => send_error(
            &client.sender,
            format!("Invalid event format: {}", error.reason),
        ),
    }
}

fn send_error(tx: &ClientSender, message: String) {
    let _ = tx.send(ServerEvent::Error(ErrorMessage { message }));
}

fn display_name_for(user_id: &str, requested: Option<&str>) -> String {
    match requested.map(str::trim).filter(|name| !name.is_empty()) {
        Some(name) => name.chars().take(MAX_DISPLAY_NAME_CHARS).collect(),
        None => default_display_name(user_id),
    }
}
