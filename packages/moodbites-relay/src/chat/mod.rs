//! Durable two-party chat.
//!
//! Messages are persisted into a per-pair conversation before they are
//! forwarded, so an offline receiver finds them through the history API.

pub mod api;
pub mod relay;
pub mod schema;
pub mod store;
pub mod types;

pub use relay::ChatRelay;
pub use store::{ConversationStore, SqliteStore};
