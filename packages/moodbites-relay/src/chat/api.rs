//! Conversation history REST endpoints.
//!
//! - `GET /api/conversations/:id` - conversations of user `id`, newest first
//! - `GET /api/conversations/:id/messages?limit&offset` - messages of conversation `id`
//! - `GET /api/conversations/:id/stats` - total and unread counts

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;

use super::types::{validate_user_id, ChatMessage, Conversation, ConversationStats};
use crate::error::Result;
use crate::state::RelayState;

/// Paging for the message history endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct MessagesQuery {
    /// Maximum number of messages; all when absent.
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

/// GET /api/conversations/:userId
pub async fn get_user_conversations(
    State(state): State<RelayState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<Conversation>>> {
    validate_user_id(&user_id)?;

    let store = state.store.clone();
    let conversations =
        tokio::task::spawn_blocking(move || store.conversations_for_user(&user_id)).await??;

    Ok(Json(conversations))
}

/// GET /api/conversations/:conversationId/messages
pub async fn get_messages(
    State(state): State<RelayState>,
    Path(conversation_id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<Vec<ChatMessage>>> {
    let store = state.store.clone();
    let messages = tokio::task::spawn_blocking(move || {
        store.messages(&conversation_id, query.limit, query.offset)
    })
    .await??;

    Ok(Json(messages))
}

/// GET /api/conversations/:conversationId/stats
pub async fn get_stats(
    State(state): State<RelayState>,
    Path(conversation_id): Path<String>,
) -> Result<Json<ConversationStats>> {
    let store = state.store.clone();
    let stats = tokio::task::spawn_blocking(move || store.stats(&conversation_id)).await??;

    Ok(Json(stats))
}
