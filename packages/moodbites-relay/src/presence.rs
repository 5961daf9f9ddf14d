//! Presence registry.
//!
//! Maps a user id to the set of live connections that user currently holds
//! (one per tab or device). Chat and call forwarding both address users
//! through this registry and fan out to every connection of the target.
//!
//! All mutations are synchronous map operations; nothing awaits between
//! reading and writing an entry. Online/offline transitions and their
//! broadcasts run under one lock, so peers see them in map order.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{OnlineUser, ServerEvent, StatusChanged, UserLeft, UserStatus};

/// A connected client's sender channel.
pub type ClientSender = mpsc::UnboundedSender<ServerEvent>;

/// Identifies one transport connection.
pub type ConnectionId = Uuid;

/// The bound identity of one live connection.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub user_id: String,
    pub display_name: String,
    pub connection_id: ConnectionId,
    pub sender: ClientSender,
}

impl ClientHandle {
    pub fn new(user_id: &str, display_name: &str, sender: ClientSender) -> Self {
        Self {
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
            connection_id: Uuid::new_v4(),
            sender,
        }
    }

    /// Send an event to this connection only.
    pub fn send(&self, event: ServerEvent) -> bool {
        self.sender.send(event).is_ok()
    }
}

/// Display name used when a client does not supply one.
pub fn default_display_name(user_id: &str) -> String {
    let prefix: String = user_id.chars().take(6).collect();
    format!("User-{}", prefix)
}

/// Everything the registry knows about one online user.
#[derive(Debug)]
struct UserPresence {
    display_name: String,
    status: UserStatus,
    connected_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    connections: HashMap<ConnectionId, ClientSender>,
}

impl UserPresence {
    fn snapshot(&self, user_id: &str) -> OnlineUser {
        OnlineUser {
            user_id: user_id.to_string(),
            user_name: self.display_name.clone(),
            connected_at: self.connected_at,
            status: self.status,
        }
    }
}

/// Shared registry of online users.
#[derive(Clone, Default)]
pub struct PresenceRegistry {
    users: Arc<DashMap<String, UserPresence>>,
    /// Held across a register/unregister and its broadcast.
    transitions: Arc<Mutex<()>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection for a user.
    ///
    /// Returns true when this made the user go from offline to online, in
    /// which case every other user is told with `user-status-changed`.
    pub fn register(&self, client: &ClientHandle) -> bool {
        let _transition = self.transitions.lock();
        let now = Utc::now();
        let came_online = match self.users.entry(client.user_id.clone()) {
            Entry::Occupied(mut entry) => {
                let presence = entry.get_mut();
                presence
                    .connections
                    .insert(client.connection_id, client.sender.clone());
                presence.display_name = client.display_name.clone();
                presence.last_seen = now;
                false
            }
            Entry::Vacant(entry) => {
                let mut connections = HashMap::new();
                connections.insert(client.connection_id, client.sender.clone());
                entry.insert(UserPresence {
                    display_name: client.display_name.clone(),
                    status: UserStatus::Online,
                    connected_at: now,
                    last_seen: now,
                    connections,
                });
                true
            }
        };

        tracing::info!(
            user_id = client.user_id.as_str(),
            connection_id = %client.connection_id,
            came_online,
            "Client registered"
        );

        if came_online {
            self.broadcast_except(
                &client.user_id,
                ServerEvent::UserStatusChanged(StatusChanged {
                    user_id: client.user_id.clone(),
                    user_name: client.display_name.clone(),
                    status: UserStatus::Online,
                    last_seen: now,
                }),
            );
        }

        came_online
    }

    /// Remove one connection of a user. Absent entries are ignored.
    ///
    /// Returns true when that was the user's last connection, in which case
    /// every other user is told with `user-disconnected`.
    pub fn unregister(&self, user_id: &str, connection_id: ConnectionId) -> bool {
        let _transition = self.transitions.lock();
        if let Some(mut presence) = self.users.get_mut(user_id) {
            presence.connections.remove(&connection_id);
            presence.last_seen = Utc::now();
        }

        let removed = self
            .users
            .remove_if(user_id, |_, presence| presence.connections.is_empty());

        tracing::info!(
            user_id = user_id,
            connection_id = %connection_id,
            went_offline = removed.is_some(),
            "Client unregistered"
        );

        match removed {
            Some((user_id, presence)) => {
                self.broadcast_except(
                    &user_id,
                    ServerEvent::UserDisconnected(UserLeft {
                        user_id: user_id.clone(),
                        user_name: presence.display_name,
                    }),
                );
                true
            }
            None => false,
        }
    }

    /// Snapshot of a user's presence, or None if offline.
    pub fn lookup(&self, user_id: &str) -> Option<OnlineUser> {
        self.users.get(user_id).map(|p| p.snapshot(user_id))
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.users.contains_key(user_id)
    }

    /// Display name of an online user.
    pub fn display_name(&self, user_id: &str) -> Option<String> {
        self.users.get(user_id).map(|p| p.display_name.clone())
    }

    /// Update a user's status and tell everyone else. No-op if offline.
    pub fn update_status(&self, user_id: &str, status: UserStatus) -> bool {
        let now = Utc::now();
        let display_name = match self.users.get_mut(user_id) {
            Some(mut presence) => {
                presence.status = status;
                presence.last_seen = now;
                presence.display_name.clone()
            }
            None => return false,
        };

        tracing::debug!(user_id = user_id, status = ?status, "Status updated");

        self.broadcast_except(
            user_id,
            ServerEvent::UserStatusChanged(StatusChanged {
                user_id: user_id.to_string(),
                user_name: display_name,
                status,
                last_seen: now,
            }),
        );
        true
    }

    /// Snapshot of all online users, oldest connection first.
    pub fn list_online(&self) -> Vec<OnlineUser> {
        let mut users: Vec<OnlineUser> = self
            .users
            .iter()
            .map(|entry| entry.value().snapshot(entry.key()))
            .collect();
        users.sort_by(|a, b| {
            a.connected_at
                .cmp(&b.connected_at)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        users
    }

    /// Send an event to every connection of a user.
    /// Returns how many connections accepted it; 0 means offline.
    pub fn send_to_user(&self, user_id: &str, event: ServerEvent) -> usize {
        let senders: Vec<ClientSender> = match self.users.get(user_id) {
            Some(presence) => presence.connections.values().cloned().collect(),
            None => return 0,
        };

        senders
            .iter()
            .filter(|sender| sender.send(event.clone()).is_ok())
            .count()
    }

    /// Send an event to every connection not belonging to `user_id`.
    /// Stale connections are skipped silently.
    pub fn broadcast_except(&self, user_id: &str, event: ServerEvent) {
        let senders: Vec<ClientSender> = self
            .users
            .iter()
            .filter(|entry| entry.key() != user_id)
            .flat_map(|entry| entry.value().connections.values().cloned().collect::<Vec<_>>())
            .collect();

        for sender in senders {
            let _ = sender.send(event.clone());
        }
    }

    /// Number of online users.
    pub fn online_count(&self) -> usize {
        self.users.len()
    }

    /// Number of live connections across all users.
    pub fn connection_count(&self) -> usize {
        self.users.iter().map(|entry| entry.connections.len()).sum()
    }
}
