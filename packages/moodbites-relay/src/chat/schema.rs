//! SQL schema for the conversation store.
//!
//! ```text
//! ┌──────────────────────┐        ┌──────────────────────┐
//! │    conversations     │        │       messages       │
//! ├──────────────────────┤        ├──────────────────────┤
//! │ id                   │◄───────│ conversation_id      │
//! │ participant_a        │        │ seq (append order)   │
//! │ participant_b        │        │ id                   │
//! │ last_message         │        │ sender_id            │
//! │ last_updated         │        │ receiver_id          │
//! │ created_at           │        │ body                 │
//! └──────────────────────┘        │ kind                 │
//!   UNIQUE(participant_a,         │ attachment (json)    │
//!          participant_b)         │ created_at           │
//!                                 │ is_read              │
//!                                 └──────────────────────┘
//! ```

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL to create all tables
pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY
);

-- One row per unordered participant pair; participant_a < participant_b.
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    participant_a TEXT NOT NULL,
    participant_b TEXT NOT NULL,
    last_message TEXT NOT NULL DEFAULT '',
    -- Unix milliseconds
    last_updated INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    UNIQUE (participant_a, participant_b),
    CHECK (participant_a < participant_b)
);

CREATE INDEX IF NOT EXISTS idx_conversations_a ON conversations (participant_a, last_updated DESC);
CREATE INDEX IF NOT EXISTS idx_conversations_b ON conversations (participant_b, last_updated DESC);

-- Append-only; seq is the chronological order within a conversation.
CREATE TABLE IF NOT EXISTS messages (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    conversation_id TEXT NOT NULL REFERENCES conversations(id),
    sender_id TEXT NOT NULL,
    receiver_id TEXT NOT NULL,
    body TEXT NOT NULL,
    kind TEXT NOT NULL DEFAULT 'text',
    attachment TEXT,
    created_at INTEGER NOT NULL,
    is_read INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages (conversation_id, seq);
"#;
