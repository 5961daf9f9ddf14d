//! Server state management.
//!
//! Wires the presence registry, the chat relay, the call relay and the
//! conversation store together. Cloning is cheap; every component shares
//! its data through `Arc`s.

use std::sync::Arc;
use std::time::Duration;

use crate::calls::{CallRelay, CallTracker};
use crate::chat::{ChatRelay, ConversationStore, SqliteStore};
use crate::error::Result;
use crate::presence::{ClientHandle, PresenceRegistry};

/// Default unanswered-call timeout in seconds.
const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;

/// Default upper bound on a message body, in characters.
const DEFAULT_MAX_MESSAGE_CHARS: usize = 5000;

/// Default maximum age of a tracked call session in seconds (4 hours).
const DEFAULT_CALL_SESSION_TTL_SECS: i64 = 4 * 3600;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    /// SQLite file; None keeps conversations in memory.
    pub database_path: Option<String>,
    /// Zero disables the timeout.
    pub call_timeout_secs: u64,
    pub max_message_chars: usize,
    pub call_session_ttl_secs: i64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 3006,
            database_path: None,
            call_timeout_secs: DEFAULT_CALL_TIMEOUT_SECS,
            max_message_chars: DEFAULT_MAX_MESSAGE_CHARS,
            call_session_ttl_secs: DEFAULT_CALL_SESSION_TTL_SECS,
        }
    }
}

/// Shared server state.
#[derive(Clone)]
pub struct RelayState {
    /// User id → live connections.
    pub presence: PresenceRegistry,

    pub chat: ChatRelay,

    pub calls: CallRelay,

    /// Durable conversations, shared with the chat relay.
    pub store: Arc<dyn ConversationStore>,

    /// Server configuration.
    pub config: RelayConfig,
}

impl RelayState {
    /// Create relay state around an existing store.
    pub fn new(config: RelayConfig, store: Arc<dyn ConversationStore>) -> Self {
        let presence = PresenceRegistry::new();
        let chat = ChatRelay::new(presence.clone(), store.clone(), config.max_message_chars);
        let calls = CallRelay::new(
            presence.clone(),
            CallTracker::new(),
            Duration::from_secs(config.call_timeout_secs),
        );

        Self {
            presence,
            chat,
            calls,
            store,
            config,
        }
    }

    /// Open the SQLite store named by the config and build the state.
    pub fn open(config: RelayConfig) -> Result<Self> {
        let store = SqliteStore::open(config.database_path.as_deref())?;
        Ok(Self::new(config, Arc::new(store)))
    }

    // ── Client Management ─────────────────────────────────────────────────

    /// Register a bound connection.
    pub fn register_client(&self, client: &ClientHandle) {
        self.presence.register(client);
    }

    /// Unregister a connection when it closes.
    /// If it was the user's last one, their calls are torn down.
    pub fn unregister_client(&self, client: &ClientHandle) {
        if self
            .presence
            .unregister(&client.user_id, client.connection_id)
        {
            self.calls.disconnect(&client.user_id, &client.display_name);
        }
    }

    /// Get the number of online users.
    pub fn online_count(&self) -> usize {
        self.presence.online_count()
    }

    /// Remove finished and stale call sessions.
    /// Called periodically by the cleanup task.
    pub fn cleanup_expired(&self) -> usize {
        self.calls
            .tracker()
            .cleanup(self.config.call_session_ttl_secs)
    }
}
