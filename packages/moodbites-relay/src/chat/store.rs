//! Durable conversation storage.
//!
//! The relay only talks to storage through [`ConversationStore`], so the
//! chat logic can be exercised against a failing or fake store in tests.
//! [`SqliteStore`] is the production implementation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::schema;
use super::types::{
    participant_pair, AppendedMessage, Attachment, ChatMessage, Conversation, ConversationStats,
    MarkReadOutcome, MessageKind, NewMessage,
};
use crate::error::{RelayError, Result};

/// Storage operations needed by the chat relay and the history API.
///
/// Implementations are synchronous; async callers go through
/// `tokio::task::spawn_blocking`.
pub trait ConversationStore: Send + Sync {
    /// Find-or-create the conversation for the sender/receiver pair, append
    /// the message and update the header, all as one atomic write.
    fn append_message(&self, message: NewMessage) -> Result<AppendedMessage>;

    /// Flip `isRead` on a message, provided `user_id` is its receiver.
    fn mark_read(
        &self,
        conversation_id: &str,
        message_id: &str,
        user_id: &str,
    ) -> Result<MarkReadOutcome>;

    /// All conversations involving `user_id`, most recently updated first.
    fn conversations_for_user(&self, user_id: &str) -> Result<Vec<Conversation>>;

    /// The conversation between two users, if one exists.
    fn conversation_between(&self, a: &str, b: &str) -> Result<Option<Conversation>>;

    /// Messages of a conversation in chronological order.
    fn messages(
        &self,
        conversation_id: &str,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<ChatMessage>>;

    /// Total and unread message counts.
    fn stats(&self, conversation_id: &str) -> Result<ConversationStats>;
}

/// SQLite-backed conversation store.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the store.
    ///
    /// If path is None, creates an in-memory database (useful for testing).
    pub fn open(path: Option<&str>) -> Result<Self> {
        let conn = match path {
            Some(p) => Connection::open(p)
                .map_err(|e| RelayError::Database(format!("Failed to open database: {}", e)))?,
            None => Connection::open_in_memory().map_err(|e| {
                RelayError::Database(format!("Failed to create in-memory database: {}", e))
            })?,
        };
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        let has_schema: bool = conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_version')",
            [],
            |row| row.get(0),
        )?;
        let version: Option<i32> = if has_schema {
            conn.query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?
        } else {
            None
        };

        match version {
            None => {
                conn.execute_batch(schema::CREATE_TABLES)
                    .map_err(|e| RelayError::Database(format!("Failed to create tables: {}", e)))?;
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    params![schema::SCHEMA_VERSION],
                )
                .map_err(|e| {
                    RelayError::Database(format!("Failed to set schema version: {}", e))
                })?;
                tracing::info!(version = schema::SCHEMA_VERSION, "Conversation schema created");
            }
            Some(v) => {
                tracing::debug!(version = v, "Conversation schema version");
            }
        }

        Ok(())
    }

    fn load_conversation(conn: &Connection, id: &str) -> Result<Option<Conversation>> {
        let header = conn
            .query_row(
                "SELECT id, participant_a, participant_b, last_message, last_updated, created_at
                 FROM conversations WHERE id = ?1",
                params![id],
                row_to_conversation,
            )
            .optional()?;

        match header {
            Some(mut conversation) => {
                conversation.messages = Self::load_messages(conn, id, None, 0)?;
                Ok(Some(conversation))
            }
            None => Ok(None),
        }
    }

    fn load_messages(
        conn: &Connection,
        conversation_id: &str,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<ChatMessage>> {
        // SQLite treats a negative LIMIT as "no limit".
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let mut stmt = conn.prepare(
            "SELECT id, sender_id, receiver_id, body, kind, attachment, created_at, is_read
             FROM messages WHERE conversation_id = ?1
             ORDER BY seq ASC LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt.query_map(
            params![conversation_id, limit, offset as i64],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    fn conversation_exists(conn: &Connection, id: &str) -> Result<bool> {
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM conversations WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

impl ConversationStore for SqliteStore {
    fn append_message(&self, message: NewMessage) -> Result<AppendedMessage> {
        let (a, b) = participant_pair(&message.sender_id, &message.receiver_id);
        if a == b {
            return Err(RelayError::InvalidPayload(
                "A conversation needs two distinct participants".to_string(),
            ));
        }

        let now = from_millis(Utc::now().timestamp_millis());
        let now_ms = now.timestamp_millis();
        let attachment = if message.attachment.is_empty() {
            None
        } else {
            Some(
                serde_json::to_string(&message.attachment)
                    .map_err(|e| RelayError::Database(format!("Failed to encode attachment: {}", e)))?,
            )
        };
        let summary = message.summary();
        let message_id = Uuid::new_v4().to_string();

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let created = tx.execute(
            "INSERT INTO conversations (id, participant_a, participant_b, last_message, last_updated, created_at)
             VALUES (?1, ?2, ?3, '', ?4, ?4)
             ON CONFLICT (participant_a, participant_b) DO NOTHING",
            params![Uuid::new_v4().to_string(), a, b, now_ms],
        )?;

        let conversation_id: String = tx.query_row(
            "SELECT id FROM conversations WHERE participant_a = ?1 AND participant_b = ?2",
            params![a, b],
            |row| row.get(0),
        )?;

        tx.execute(
            "INSERT INTO messages (id, conversation_id, sender_id, receiver_id, body, kind, attachment, created_at, is_read)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)",
            params![
                message_id,
                conversation_id,
                message.sender_id,
                message.receiver_id,
                message.body,
                message.kind.as_str(),
                attachment,
                now_ms,
            ],
        )?;

        tx.execute(
            "UPDATE conversations SET last_message = ?1, last_updated = ?2 WHERE id = ?3",
            params![summary, now_ms, conversation_id],
        )?;

        tx.commit()?;

        Ok(AppendedMessage {
            conversation_id,
            message: ChatMessage {
                id: message_id,
                sender_id: message.sender_id,
                receiver_id: message.receiver_id,
                body: message.body,
                kind: message.kind,
                created_at: now,
                is_read: false,
                attachment: message.attachment,
            },
            created_conversation: created > 0,
        })
    }

    fn mark_read(
        &self,
        conversation_id: &str,
        message_id: &str,
        user_id: &str,
    ) -> Result<MarkReadOutcome> {
        let conn = self.conn.lock();

        if !Self::conversation_exists(&conn, conversation_id)? {
            return Err(RelayError::ConversationNotFound(conversation_id.to_string()));
        }

        let found: Option<(String, String, bool)> = conn
            .query_row(
                "SELECT sender_id, receiver_id, is_read FROM messages
                 WHERE id = ?1 AND conversation_id = ?2",
                params![message_id, conversation_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get::<_, i64>(2)? != 0)),
            )
            .optional()?;

        let Some((sender_id, receiver_id, is_read)) = found else {
            return Err(RelayError::MessageNotFound(message_id.to_string()));
        };

        if receiver_id != user_id {
            return Ok(MarkReadOutcome::NotRecipient);
        }
        if is_read {
            return Ok(MarkReadOutcome::AlreadyRead);
        }

        let rows = conn.execute(
            "UPDATE messages SET is_read = 1 WHERE id = ?1 AND receiver_id = ?2 AND is_read = 0",
            params![message_id, user_id],
        )?;

        if rows > 0 {
            Ok(MarkReadOutcome::Marked { sender_id })
        } else {
            Ok(MarkReadOutcome::AlreadyRead)
        }
    }

    fn conversations_for_user(&self, user_id: &str) -> Result<Vec<Conversation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, participant_a, participant_b, last_message, last_updated, created_at
             FROM conversations WHERE participant_a = ?1 OR participant_b = ?1
             ORDER BY last_updated DESC",
        )?;
        let rows = stmt.query_map(params![user_id], row_to_conversation)?;

        let mut conversations = Vec::new();
        for row in rows {
            let mut conversation = row?;
            conversation.messages = Self::load_messages(&conn, &conversation.id, None, 0)?;
            conversations.push(conversation);
        }
        Ok(conversations)
    }

    fn conversation_between(&self, a: &str, b: &str) -> Result<Option<Conversation>> {
        let (a, b) = participant_pair(a, b);
        let conn = self.conn.lock();
        let id: Option<String> = conn
            .query_row(
                "SELECT id FROM conversations WHERE participant_a = ?1 AND participant_b = ?2",
                params![a, b],
                |row| row.get(0),
            )
            .optional()?;

        match id {
            Some(id) => Self::load_conversation(&conn, &id),
            None => Ok(None),
        }
    }

    fn messages(
        &self,
        conversation_id: &str,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<ChatMessage>> {
        let conn = self.conn.lock();
        if !Self::conversation_exists(&conn, conversation_id)? {
            return Err(RelayError::ConversationNotFound(conversation_id.to_string()));
        }
        Self::load_messages(&conn, conversation_id, limit, offset)
    }

    fn stats(&self, conversation_id: &str) -> Result<ConversationStats> {
        let conn = self.conn.lock();
        if !Self::conversation_exists(&conn, conversation_id)? {
            return Err(RelayError::ConversationNotFound(conversation_id.to_string()));
        }

        let (total, unread): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN is_read = 0 THEN 1 ELSE 0 END), 0)
             FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(ConversationStats {
            total_messages: total as u64,
            unread_messages: unread as u64,
        })
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        participants: vec![row.get(1)?, row.get(2)?],
        last_message: row.get(3)?,
        last_updated: from_millis(row.get(4)?),
        created_at: from_millis(row.get(5)?),
        messages: Vec::new(),
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
    let kind: String = row.get(4)?;
    let attachment: Option<String> = row.get(5)?;
    Ok(ChatMessage {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        receiver_id: row.get(2)?,
        body: row.get(3)?,
        kind: MessageKind::parse(&kind).unwrap_or_default(),
        attachment: attachment
            .and_then(|json| serde_json::from_str::<Attachment>(&json).ok())
            .unwrap_or_default(),
        created_at: from_millis(row.get(6)?),
        is_read: row.get::<_, i64>(7)? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(sender: &str, receiver: &str, body: &str) -> NewMessage {
        NewMessage {
            sender_id: sender.to_string(),
            receiver_id: receiver.to_string(),
            body: body.to_string(),
            kind: MessageKind::Text,
            attachment: Attachment::default(),
        }
    }

    #[test]
    fn test_first_message_creates_conversation() {
        let store = SqliteStore::open(None).unwrap();
        let appended = store.append_message(text("alice", "bob", "hi")).unwrap();
        assert!(appended.created_conversation);
        assert!(!appended.message.is_read);

        let conversation = store.conversation_between("bob", "alice").unwrap().unwrap();
        assert_eq!(conversation.id, appended.conversation_id);
        assert_eq!(conversation.participants, vec!["alice", "bob"]);
        assert_eq!(conversation.last_message, "hi");
        assert_eq!(conversation.messages.len(), 1);
        assert_eq!(conversation.messages[0], appended.message);
    }

    #[test]
    fn test_both_directions_share_one_conversation() {
        let store = SqliteStore::open(None).unwrap();
        let first = store.append_message(text("alice", "bob", "hi")).unwrap();
        let second = store.append_message(text("bob", "alice", "hey")).unwrap();
        assert!(first.created_conversation);
        assert!(!second.created_conversation);
        assert_eq!(first.conversation_id, second.conversation_id);
        assert_eq!(store.conversations_for_user("alice").unwrap().len(), 1);
        assert_eq!(store.conversations_for_user("bob").unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_first_contact_creates_one_conversation() {
        let store = SqliteStore::open(None).unwrap();

        std::thread::scope(|s| {
            for i in 0..8 {
                let store = store.clone();
                s.spawn(move || {
                    let (from, to) = if i % 2 == 0 { ("alice", "bob") } else { ("bob", "alice") };
                    store.append_message(text(from, to, &format!("msg-{}", i))).unwrap();
                });
            }
        });

        let conversations = store.conversations_for_user("alice").unwrap();
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].messages.len(), 8);
    }

    #[test]
    fn test_separate_connections_share_one_conversation() {
        let path = std::env::temp_dir().join(format!("moodbites-relay-{}.db", Uuid::new_v4()));
        let path_str = path.to_string_lossy().to_string();

        let first = SqliteStore::open(Some(&path_str)).unwrap();
        let second = SqliteStore::open(Some(&path_str)).unwrap();
        let a = first.append_message(text("alice", "bob", "from first")).unwrap();
        let b = second.append_message(text("bob", "alice", "from second")).unwrap();
        assert_eq!(a.conversation_id, b.conversation_id);
        assert!(!b.created_conversation);

        drop(first);
        drop(second);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_locked_database_fails_open_and_reopens_intact() {
        let path = std::env::temp_dir().join(format!("moodbites-relay-{}.db", Uuid::new_v4()));
        let path_str = path.to_string_lossy().to_string();

        let store = SqliteStore::open(Some(&path_str)).unwrap();
        let appended = store.append_message(text("alice", "bob", "kept")).unwrap();
        drop(store);

        let locker = Connection::open(&path).unwrap();
        locker.execute_batch("BEGIN EXCLUSIVE;").unwrap();
        let err = match SqliteStore::open(Some(&path_str)) {
            Ok(_) => panic!("open succeeded while the database was locked"),
            Err(e) => e,
        };
        assert!(matches!(err, RelayError::Database(_)));
        assert!(err.to_string().contains("locked"), "unexpected error: {}", err);
        locker.execute_batch("ROLLBACK;").unwrap();
        drop(locker);

        let reopened = SqliteStore::open(Some(&path_str)).unwrap();
        let stats = reopened.stats(&appended.conversation_id).unwrap();
        assert_eq!(stats.total_messages, 1);
        let versions: i64 = reopened
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(versions, 1);

        drop(reopened);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_messages_keep_append_order() {
        let store = SqliteStore::open(None).unwrap();
        let mut conversation_id = String::new();
        for i in 0..20 {
            let (from, to) = if i % 3 == 0 { ("bob", "alice") } else { ("alice", "bob") };
            conversation_id = store
                .append_message(text(from, to, &format!("m{}", i)))
                .unwrap()
                .conversation_id;
        }

        let bodies: Vec<String> = store
            .messages(&conversation_id, None, 0)
            .unwrap()
            .into_iter()
            .map(|m| m.body)
            .collect();
        let expected: Vec<String> = (0..20).map(|i| format!("m{}", i)).collect();
        assert_eq!(bodies, expected);

        let page = store.messages(&conversation_id, Some(5), 10).unwrap();
        assert_eq!(page.len(), 5);
        assert_eq!(page[0].body, "m10");
    }

    #[test]
    fn test_self_conversation_rejected() {
        let store = SqliteStore::open(None).unwrap();
        let err = store.append_message(text("alice", "alice", "me")).unwrap_err();
        assert!(matches!(err, RelayError::InvalidPayload(_)));
    }

    #[test]
    fn test_mark_read_only_by_receiver() {
        let store = SqliteStore::open(None).unwrap();
        let appended = store.append_message(text("alice", "bob", "hi")).unwrap();
        let cid = appended.conversation_id.as_str();
        let mid = appended.message.id.as_str();

        assert_eq!(
            store.mark_read(cid, mid, "alice").unwrap(),
            MarkReadOutcome::NotRecipient
        );
        assert_eq!(store.stats(cid).unwrap().unread_messages, 1);

        assert_eq!(
            store.mark_read(cid, mid, "bob").unwrap(),
            MarkReadOutcome::Marked {
                sender_id: "alice".to_string()
            }
        );
        assert_eq!(
            store.mark_read(cid, mid, "bob").unwrap(),
            MarkReadOutcome::AlreadyRead
        );

        let messages = store.messages(cid, None, 0).unwrap();
        assert!(messages[0].is_read);
    }

    #[test]
    fn test_mark_read_unknown_ids() {
        let store = SqliteStore::open(None).unwrap();
        let appended = store.append_message(text("alice", "bob", "hi")).unwrap();

        assert!(matches!(
            store.mark_read("missing", &appended.message.id, "bob"),
            Err(RelayError::ConversationNotFound(_))
        ));
        assert!(matches!(
            store.mark_read(&appended.conversation_id, "missing", "bob"),
            Err(RelayError::MessageNotFound(_))
        ));
    }

    #[test]
    fn test_stats_counts() {
        let store = SqliteStore::open(None).unwrap();
        let first = store.append_message(text("alice", "bob", "one")).unwrap();
        store.append_message(text("alice", "bob", "two")).unwrap();
        store.append_message(text("bob", "alice", "three")).unwrap();
        store
            .mark_read(&first.conversation_id, &first.message.id, "bob")
            .unwrap();

        let stats = store.stats(&first.conversation_id).unwrap();
        assert_eq!(stats.total_messages, 3);
        assert_eq!(stats.unread_messages, 2);
        assert!(matches!(
            store.stats("missing"),
            Err(RelayError::ConversationNotFound(_))
        ));
    }

    #[test]
    fn test_attachment_round_trips_through_storage() {
        let store = SqliteStore::open(None).unwrap();
        let audio = NewMessage {
            sender_id: "alice".to_string(),
            receiver_id: "bob".to_string(),
            body: String::new(),
            kind: MessageKind::Audio,
            attachment: Attachment {
                audio_url: Some("https://cdn.example.com/v.webm".to_string()),
                audio_duration: Some(30.0),
                ..Attachment::default()
            },
        };
        let appended = store.append_message(audio).unwrap();
        let stored = store.messages(&appended.conversation_id, None, 0).unwrap();
        assert_eq!(stored[0].kind, MessageKind::Audio);
        assert_eq!(stored[0].attachment.audio_duration, Some(30.0));

        let conversation = store.conversation_between("alice", "bob").unwrap().unwrap();
        assert_eq!(conversation.last_message, "[audio]");
    }

    #[test]
    fn test_conversations_sorted_by_last_update() {
        let store = SqliteStore::open(None).unwrap();
        store.append_message(text("alice", "bob", "first")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.append_message(text("alice", "carol", "second")).unwrap();

        let conversations = store.conversations_for_user("alice").unwrap();
        assert_eq!(conversations.len(), 2);
        assert!(conversations[0].participants.contains(&"carol".to_string()));
        assert!(store.conversations_for_user("dave").unwrap().is_empty());
    }
}
