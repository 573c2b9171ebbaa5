//! Mock model handler for deterministic testing.
//!
//! Returns pre-configured replies in order and records every request.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::model::{ModelHandler, ModelKind, ModelOutput, ModelRequest};
use ember_core::{EmberError, Result};

/// A pre-configured reply.
#[derive(Debug, Clone)]
pub enum MockReply {
    Text(String),
    Object(serde_json::Value),
    Embedding(Vec<f32>),
    /// Returned as `EmberError::Model(msg)`.
    Error(String),
}

/// A model handler that replays queued replies.
///
/// # Example
/// ```
/// use ember_llm::mock::MockModel;
/// let model = MockModel::new("test")
///     .with_text("Hello, world!");
/// ```
pub struct MockModel {
    name: String,
    replies: Arc<Mutex<VecDeque<MockReply>>>,
    /// Returned once the queue is empty.
    fallback: Arc<Mutex<Option<MockReply>>>,
    requests: Arc<Mutex<Vec<(ModelKind, ModelRequest)>>>,
}

impl MockModel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            replies: Arc::new(Mutex::new(VecDeque::new())),
            fallback: Arc::new(Mutex::new(None)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue a text reply.
    pub fn with_text(self, text: &str) -> Self {
        self.push(MockReply::Text(text.to_string()));
        self
    }

    /// Queue a structured reply.
    pub fn with_object(self, value: serde_json::Value) -> Self {
        self.push(MockReply::Object(value));
        self
    }

    /// Queue an error reply.
    pub fn with_error(self, error: &str) -> Self {
        self.push(MockReply::Error(error.to_string()));
        self
    }

    /// Reply used whenever the queue is empty.
    pub fn with_fallback(self, reply: MockReply) -> Self {
        *self.fallback.lock() = Some(reply);
        self
    }

    /// Queue a reply.
    pub fn push(&self, reply: MockReply) {
        self.replies.lock().push_back(reply);
    }

    /// All requests received so far, in order.
    pub fn requests(&self) -> Vec<(ModelKind, ModelRequest)> {
        self.requests.lock().clone()
    }

    /// Number of requests received for `kind`.
    pub fn call_count(&self, kind: ModelKind) -> usize {
        self.requests.lock().iter().filter(|(k, _)| *k == kind).count()
    }

    fn next_reply(&self) -> MockReply {
        self.replies
            .lock()
            .pop_front()
            .or_else(|| self.fallback.lock().clone())
            .unwrap_or_else(|| MockReply::Text("(mock: no more queued replies)".to_string()))
    }
}

#[async_trait]
impl ModelHandler for MockModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, kind: ModelKind, request: &ModelRequest) -> Result<ModelOutput> {
        self.requests.lock().push((kind, request.clone()));
        match self.next_reply() {
            MockReply::Text(t) => Ok(ModelOutput::Text(t)),
            MockReply::Object(v) => Ok(ModelOutput::Object(v)),
            MockReply::Embedding(e) => Ok(ModelOutput::Embedding(e)),
            MockReply::Error(msg) => Err(EmberError::Model(msg)),
        }
    }
}
