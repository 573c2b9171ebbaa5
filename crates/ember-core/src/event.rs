use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use crate::error::{EmberError, Result};
use crate::memory::Content;
use crate::types::ChannelType;

/// A message as delivered by a platform adapter, before identity mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingMessage {
    /// Platform-native message id; the idempotency key for ingestion.
    pub id: String,
    /// Platform-native channel id.
    pub channel_id: String,
    /// Platform-native server id; direct messages fall back to the channel.
    #[serde(default)]
    pub server_id: Option<String>,
    /// Platform-native author id.
    pub author_id: String,
    #[serde(default)]
    pub author_name: Option<String>,
    pub content: Content,
    /// Originating platform ("discord", "cli", ...).
    pub source: String,
    #[serde(default)]
    pub channel_type: ChannelType,
    pub created_at: DateTime<Utc>,
}

impl IncomingMessage {
    /// A plain text message.
    pub fn text(
        source: &str,
        channel_id: &str,
        author_id: &str,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            channel_id: channel_id.to_string(),
            server_id: None,
            author_id: author_id.to_string(),
            author_name: None,
            content: Content::text(text),
            source: source.to_string(),
            channel_type: ChannelType::Direct,
            created_at: Utc::now(),
        }
    }

    /// The server id used for world mapping.
    pub fn world_key(&self) -> &str {
        self.server_id.as_deref().unwrap_or(&self.channel_id)
    }
}

/// Events flowing through the system: outbound replies plus lifecycle
/// notifications for observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    // ── Message lifecycle ──────────────────────────────────────
    MessageReceived {
        memory_id: Uuid,
        room_id: Uuid,
        entity_id: Uuid,
        source: String,
    },
    /// An outbound reply. Transports deliver `content` to `room_id`.
    MessageSent {
        reply_id: Uuid,
        in_reply_to: Uuid,
        room_id: Uuid,
        world_id: Option<Uuid>,
        channel_id: String,
        source: String,
        content: Content,
    },

    // ── Cycle lifecycle ────────────────────────────────────────
    RunStarted {
        run_id: Uuid,
        message_id: Uuid,
        room_id: Uuid,
    },
    RunEnded {
        run_id: Uuid,
        message_id: Uuid,
        mode: String,
        iterations: u32,
    },
    ActionStarted {
        run_id: Uuid,
        action: String,
    },
    ActionCompleted {
        run_id: Uuid,
        action: String,
        success: bool,
    },
    EvaluatorCompleted {
        message_id: Uuid,
        evaluator: String,
        passed: bool,
    },

    // ── Task lifecycle ─────────────────────────────────────────
    TaskExecuted {
        task_id: Uuid,
        name: String,
        success: bool,
    },

    // ── Plugin / service lifecycle ─────────────────────────────
    PluginLoaded {
        plugin: String,
        version: String,
    },
    PluginSkipped {
        plugin: String,
        reason: String,
    },
    ServiceStarted {
        service_type: String,
    },

    // ── System ─────────────────────────────────────────────────
    Shutdown,
}

/// Decouples message ingestion from processing.
///
/// Inbound messages go through a single-consumer queue so each message is
/// handled by exactly one runtime consumer; outbound and lifecycle events go
/// through a broadcast channel any number of observers can subscribe to.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<Event>>,
    inbound_tx: mpsc::Sender<IncomingMessage>,
    inbound_rx: Arc<Mutex<Option<mpsc::Receiver<IncomingMessage>>>>,
}

impl EventBus {
    pub fn new(capacity: usize, inbound_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(inbound_capacity.max(1));
        Self {
            sender: Arc::new(sender),
            inbound_tx,
            inbound_rx: Arc::new(Mutex::new(Some(inbound_rx))),
        }
    }

    pub fn publish(&self, event: Event) {
        // Ignore send errors (no subscribers).
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Hand an inbound message to the runtime consumer.
    pub async fn submit(&self, message: IncomingMessage) -> Result<()> {
        self.inbound_tx
            .send(message)
            .await
            .map_err(|_| EmberError::Cancelled)
    }

    /// Take the inbound receiver. Only the first caller gets it.
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<IncomingMessage>> {
        self.inbound_rx.lock().take()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(4096, 1024)
    }
}
