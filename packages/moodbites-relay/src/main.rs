//! MoodBites Relay Server
//!
//! A WebSocket relay server that provides:
//!
//! 1. **Chat relay**: Messages between two users are stored in a durable
//!    per-pair conversation, then forwarded to the receiver's live
//!    connections. Offline receivers pick them up through the history API.
//!
//! 2. **Presence**: Who is online, on how many connections, and with what
//!    status. Changes are broadcast to everyone else.
//!
//! 3. **Call signaling**: Call requests, answers, SDP offers/answers and ICE
//!    candidates are forwarded between two online users. Unanswered calls
//!    time out on the server.
//!
//! The relay never sees call media, only signaling metadata.

mod calls;
mod chat;
mod error;
mod handler;
mod presence;
mod protocol;
mod state;

use std::time::Duration;

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::{HeaderValue, Method},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use clap::Parser;
use serde_json::json;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use handler::ConnectQuery;
use state::{RelayConfig, RelayState};

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "moodbites-relay", version, about = "MoodBites chat and call relay server")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 3006, env = "RELAY_PORT")]
    port: u16,

    /// SQLite database file for conversations.
    /// Conversations are kept in memory when not set.
    #[arg(long, env = "DATABASE_PATH")]
    database_path: Option<String>,

    /// Seconds before an unanswered call request times out (0 disables)
    #[arg(long, default_value_t = 30, env = "CALL_TIMEOUT_SECS")]
    call_timeout_secs: u64,

    /// Maximum chat message length in characters
    #[arg(long, default_value_t = 5000, env = "MAX_MESSAGE_CHARS")]
    max_message_chars: usize,

    /// Cleanup interval in seconds
    #[arg(long, default_value_t = 60, env = "CLEANUP_INTERVAL_SECS")]
    cleanup_interval_secs: u64,

    /// Maximum age of a tracked call session in seconds
    #[arg(long, default_value_t = 4 * 3600, env = "CALL_SESSION_TTL_SECS")]
    call_session_ttl_secs: i64,

    /// Allowed CORS origins (comma-separated). Any origin when empty.
    #[arg(long, env = "ALLOWED_ORIGINS", value_delimiter = ',')]
    allowed_origins: Vec<String>,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "moodbites_relay=info,tower_http=info".into());
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = RelayConfig {
        port: args.port,
        database_path: args.database_path,
        call_timeout_secs: args.call_timeout_secs,
        max_message_chars: args.max_message_chars,
        call_session_ttl_secs: args.call_session_ttl_secs,
    };

    match config.database_path.as_deref() {
        Some(path) => tracing::info!(path = path, "Using SQLite conversation store"),
        None => tracing::warn!("No database path set, conversations are kept in memory"),
    }

    let state = RelayState::open(config)?;

    // Spawn periodic cleanup task
    let cleanup_state = state.clone();
    let cleanup_interval = args.cleanup_interval_secs.max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(cleanup_interval));
        loop {
            interval.tick().await;
            cleanup_state.cleanup_expired();
        }
    });

    let app = app(state, &args.allowed_origins);

    let addr = format!("0.0.0.0:{}", args.port);
    tracing::info!("MoodBites relay server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;

    Ok(())
}

/// Build the router.
fn app(state: RelayState, allowed_origins: &[String]) -> Router {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .map(|origin| origin.trim())
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    let allow_origin = if origins.is_empty() {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::list(origins)
    };

    let cors = CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET])
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/api/online-users", get(online_users_handler))
        .route(
            "/api/conversations/:id",
            get(chat::api::get_user_conversations),
        )
        .route(
            "/api/conversations/:id/messages",
            get(chat::api::get_messages),
        )
        .route("/api/conversations/:id/stats", get(chat::api::get_stats))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Route Handlers ────────────────────────────────────────────────────────────

/// WebSocket upgrade handler for client connections.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<RelayState>,
    Query(query): Query<ConnectQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handler::handle_websocket(socket, state, query))
}

/// Health check endpoint.
async fn health_handler(State(state): State<RelayState>) -> impl IntoResponse {
    Json(json!({
        "status": "OK",
        "service": "moodbites-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "activeConnections": state.online_count(),
        "timestamp": chrono::Utc::now(),
    }))
}

/// Statistics endpoint.
async fn stats_handler(State(state): State<RelayState>) -> impl IntoResponse {
    Json(json!({
        "online_users": state.online_count(),
        "connections": state.presence.connection_count(),
        "tracked_calls": state.calls.tracker().len(),
        "calls_in_progress": state.calls.tracker().in_progress(),
    }))
}

/// Online users snapshot.
async fn online_users_handler(State(state): State<RelayState>) -> impl IntoResponse {
    let users = state.presence.list_online();
    Json(json!({
        "success": true,
        "count": users.len(),
        "users": users,
    }))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use futures::{SinkExt, StreamExt};
    use serde_json::Value;
    use std::net::SocketAddr;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tower::ServiceExt;

    type WsClient = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    fn test_state() -> RelayState {
        RelayState::open(RelayConfig::default()).unwrap()
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn serve(state: RelayState) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = app(state, &[]);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    async fn connect(addr: SocketAddr, query: &str) -> WsClient {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws{}", addr, query))
            .await
            .unwrap();
        ws
    }

    async fn send(ws: &mut WsClient, event: Value) {
        ws.send(WsMessage::Text(event.to_string())).await.unwrap();
    }

    /// Read frames until an event called `name` arrives; return its data.
    async fn expect_event(ws: &mut WsClient, name: &str) -> Value {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for event")
                .expect("connection closed")
                .unwrap();
            if let WsMessage::Text(text) = frame {
                let value: Value = serde_json::from_str(&text).unwrap();
                if value["event"] == name {
                    return value.get("data").cloned().unwrap_or(Value::Null);
                }
            }
        }
    }

    #[test]
    fn test_default_args() {
        let args = Args::parse_from(["moodbites-relay"]);
        assert_eq!(args.port, 3006);
        assert_eq!(args.call_timeout_secs, 30);
        assert_eq!(args.cleanup_interval_secs, 60);
        assert_eq!(args.call_session_ttl_secs, 14400);
        assert!(args.allowed_origins.is_empty());
        assert!(!args.log_json);
    }

    #[test]
    fn test_allowed_origins_are_split() {
        let args = Args::parse_from([
            "moodbites-relay",
            "--allowed-origins",
            "http://localhost:3000,https://moodbites.app",
        ]);
        assert_eq!(args.allowed_origins.len(), 2);
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (status, body) = get_json(app(test_state(), &[]), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "OK");
        assert_eq!(body["service"], "moodbites-relay");
        assert_eq!(body["activeConnections"], 0);
    }

    #[tokio::test]
    async fn test_online_users_endpoint() {
        let state = test_state();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        state.register_client(&presence::ClientHandle::new("alice", "Alice", tx));

        let (status, body) = get_json(app(state, &[]), "/api/online-users").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["count"], 1);
        assert_eq!(body["users"][0]["userId"], "alice");
        assert_eq!(body["users"][0]["userName"], "Alice");
        assert_eq!(body["users"][0]["status"], "online");
    }

    #[tokio::test]
    async fn test_conversation_routes() {
        let state = test_state();
        let appended = state
            .store
            .append_message(chat::types::NewMessage {
                sender_id: "alice".to_string(),
                receiver_id: "bob".to_string(),
                body: "hi".to_string(),
                kind: chat::types::MessageKind::Text,
                attachment: chat::types::Attachment::default(),
            })
            .unwrap();
        let app = app(state, &[]);

        let (status, body) = get_json(app.clone(), "/api/conversations/bob").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["id"], appended.conversation_id.as_str());
        assert_eq!(body[0]["messages"][0]["message"], "hi");

        let uri = format!("/api/conversations/{}/messages", appended.conversation_id);
        let (status, body) = get_json(app.clone(), &uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        let uri = format!("/api/conversations/{}/stats", appended.conversation_id);
        let (status, body) = get_json(app.clone(), &uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["totalMessages"], 1);
        assert_eq!(body["unreadMessages"], 1);

        let (status, body) = get_json(app.clone(), "/api/conversations/missing/stats").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());

        let (status, _) = get_json(app, "/api/conversations/bad%20id").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_chat_over_websocket() {
        let state = test_state();
        let addr = serve(state.clone()).await;

        let mut alice = connect(addr, "?userId=alice&userName=Alice").await;
        let joined = expect_event(&mut alice, "room-joined").await;
        assert_eq!(joined["userName"], "Alice");

        let mut bob = connect(addr, "").await;
        send(&mut bob, json!({ "event": "join-room", "data": "bob" })).await;
        expect_event(&mut bob, "room-joined").await;

        send(
            &mut alice,
            json!({
                "event": "send-message",
                "data": { "senderId": "alice", "receiverId": "bob", "message": "hi" }
            }),
        )
        .await;

        let received = expect_event(&mut bob, "receive-message").await;
        assert_eq!(received["message"], "hi");
        assert_eq!(received["senderId"], "alice");
        assert_eq!(received["isRead"], false);
        let conversation_id = received["conversationId"].as_str().unwrap().to_string();
        let message_id = received["id"].as_str().unwrap().to_string();

        let sent = expect_event(&mut alice, "message-sent").await;
        assert_eq!(sent["id"], message_id.as_str());

        send(
            &mut bob,
            json!({
                "event": "mark-as-read",
                "data": { "conversationId": conversation_id, "messageId": message_id, "userId": "bob" }
            }),
        )
        .await;
        let read = expect_event(&mut alice, "message-read").await;
        assert_eq!(read["messageId"], message_id.as_str());

        let stats = state.store.stats(&conversation_id).unwrap();
        assert_eq!(stats.total_messages, 1);
        assert_eq!(stats.unread_messages, 0);
    }

    #[tokio::test]
    async fn test_events_before_join_are_refused() {
        let addr = serve(test_state()).await;
        let mut ws = connect(addr, "").await;

        send(&mut ws, json!({ "event": "get-online-users" })).await;
        let error = expect_event(&mut ws, "error").await;
        assert!(error["message"].as_str().unwrap().contains("join"));

        send(&mut ws, json!({ "event": "ping" })).await;
        expect_event(&mut ws, "pong").await;
    }

    #[tokio::test]
    async fn test_call_signaling_over_websocket() {
        let addr = serve(test_state()).await;

        let mut alice = connect(addr, "?userId=alice").await;
        expect_event(&mut alice, "room-joined").await;
        let mut bob = connect(addr, "?userId=bob").await;
        expect_event(&mut bob, "room-joined").await;

        send(
            &mut alice,
            json!({
                "event": "webrtc-call-request",
                "data": { "responderId": "carol", "callType": "video", "roomId": "r1" }
            }),
        )
        .await;
        let error = expect_event(&mut alice, "webrtc-call-error").await;
        assert_eq!(error["targetUserId"], "carol");

        send(
            &mut alice,
            json!({
                "event": "webrtc-call-request",
                "data": { "responderId": "bob", "callType": "video", "roomId": "r1" }
            }),
        )
        .await;
        let incoming = expect_event(&mut bob, "webrtc-call-request").await;
        assert_eq!(incoming["callerId"], "alice");
        assert_eq!(incoming["callType"], "video");

        send(
            &mut bob,
            json!({
                "event": "webrtc-call-response",
                "data": { "callerId": "alice", "accepted": true }
            }),
        )
        .await;
        let response = expect_event(&mut alice, "webrtc-call-response").await;
        assert_eq!(response["accepted"], true);
        assert_eq!(response["responderId"], "bob");

        send(
            &mut alice,
            json!({
                "event": "webrtc-offer",
                "data": { "targetUserId": "bob", "offer": { "type": "offer", "sdp": "v=0" } }
            }),
        )
        .await;
        let offer = expect_event(&mut bob, "webrtc-offer").await;
        assert_eq!(offer["senderId"], "alice");
        assert_eq!(offer["offer"]["sdp"], "v=0");

        // Alice drops; Bob's call is torn down.
        alice.close(None).await.unwrap();
        let ended = expect_event(&mut bob, "webrtc-end-call").await;
        assert_eq!(ended["senderId"], "alice");
        assert_eq!(ended["reason"], "disconnected");
    }
}
