use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Table tag for conversation messages (inbound and replies).
pub const TABLE_MESSAGES: &str = "messages";
/// Table tag for action execution records.
pub const TABLE_ACTIONS: &str = "action_results";
/// Table tag for evaluator judgments.
pub const TABLE_EVALUATIONS: &str = "evaluations";

/// An immutable, timestamped record of something said or decided.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    pub id: Uuid,
    pub agent_id: Uuid,
    /// Who said / did it.
    pub entity_id: Uuid,
    pub room_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub world_id: Option<Uuid>,
    pub content: Content,
    /// Category tag, e.g. [`TABLE_MESSAGES`].
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

/// The body of a memory or an outbound reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,
    /// Names of the actions taken (or requested).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Media>,
    /// Platform the content came from ("discord", "cli", "action", ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<Uuid>,
    /// Set when the memory records a failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Arbitrary structured fields.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// An attachment carried by a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Media {
    pub id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Content {
    /// Plain text content.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    /// Text or an empty string.
    pub fn text_or_empty(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }

    /// True when there is nothing to show a user.
    pub fn is_empty(&self) -> bool {
        self.text.as_deref().is_none_or(|t| t.trim().is_empty()) && self.attachments.is_empty()
    }
}

impl Memory {
    /// Build a memory with a fresh random id.
    pub fn new(
        agent_id: Uuid,
        entity_id: Uuid,
        room_id: Uuid,
        content: Content,
        table: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id,
            entity_id,
            room_id,
            world_id: None,
            content,
            table: table.to_string(),
            embedding: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn with_world(mut self, world_id: Option<Uuid>) -> Self {
        self.world_id = world_id;
        self
    }

    pub fn text(&self) -> &str {
        self.content.text_or_empty()
    }
}

/// Filter for memory queries. Results are newest-first, capped at `count`.
#[derive(Debug, Clone, Default)]
pub struct MemoryQuery {
    pub room_id: Option<Uuid>,
    pub entity_id: Option<Uuid>,
    pub table: Option<String>,
    pub count: Option<usize>,
    /// Only memories created strictly before this instant.
    pub before: Option<DateTime<Utc>>,
}

impl MemoryQuery {
    pub fn room(room_id: Uuid) -> Self {
        Self {
            room_id: Some(room_id),
            ..Default::default()
        }
    }

    pub fn table(mut self, table: &str) -> Self {
        self.table = Some(table.to_string());
        self
    }

    pub fn count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    /// Whether a memory passes every set filter.
    pub fn matches(&self, memory: &Memory) -> bool {
        self.room_id.is_none_or(|r| memory.room_id == r)
            && self.entity_id.is_none_or(|e| memory.entity_id == e)
            && self.table.as_deref().is_none_or(|t| memory.table == t)
            && self.before.is_none_or(|b| memory.created_at < b)
    }
}
