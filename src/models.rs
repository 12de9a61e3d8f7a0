//! Conversation and message records synchronized by the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A record that can live in a synchronized collection.
///
/// Gives the fold a stable identity for deduplication and a creation
/// timestamp for ordered inserts.
pub trait FeedRecord: Clone + Send + Sync + 'static {
    /// Unique identifier of the record.
    fn record_id(&self) -> &str;
    /// Creation timestamp used for timestamp-ordered collections.
    fn created_at(&self) -> DateTime<Utc>;
}

/// A conversation with a single counterpart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Server-assigned identifier, unique per account.
    pub id: String,
    /// Counterpart phone address.
    pub phone: String,
    /// Linked contact name, when the address book knows the counterpart.
    #[serde(default)]
    pub contact_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl FeedRecord for Conversation {
    fn record_id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// A single message inside a conversation. Append-only from the
/// client's perspective: bodies are never edited, only inserted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    /// Owning conversation.
    pub conversation_id: String,
    /// Sender address.
    pub sender: String,
    /// Message body text.
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl FeedRecord for Message {
    fn record_id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}
