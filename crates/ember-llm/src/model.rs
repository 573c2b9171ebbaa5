use std::sync::Arc;

use async_trait::async_trait;
use ember_core::{EmberError, Result};
use serde::{Deserialize, Serialize};

/// The model types a handler can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelKind {
    TextSmall,
    TextLarge,
    ObjectSmall,
    ObjectLarge,
    TextEmbedding,
    Transcription,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::TextSmall => "TEXT_SMALL",
            ModelKind::TextLarge => "TEXT_LARGE",
            ModelKind::ObjectSmall => "OBJECT_SMALL",
            ModelKind::ObjectLarge => "OBJECT_LARGE",
            ModelKind::TextEmbedding => "TEXT_EMBEDDING",
            ModelKind::Transcription => "TRANSCRIPTION",
        }
    }
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to a model handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    /// The prompt (for text/object kinds) or the text to embed.
    pub prompt: String,
    /// System prompt, kept separate for handlers that support it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    /// JSON schema hint for object kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<serde_json::Value>,
    /// Audio or other binary input for transcription, as a URL or data URI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_url: Option<String>,
}

impl ModelRequest {
    pub fn prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// What a handler produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ModelOutput {
    Text(String),
    Object(serde_json::Value),
    Embedding(Vec<f32>),
}

impl ModelOutput {
    /// Text output, or an object rendered as JSON.
    pub fn into_text(self) -> Result<String> {
        match self {
            ModelOutput::Text(t) => Ok(t),
            ModelOutput::Object(v) => Ok(v.to_string()),
            ModelOutput::Embedding(_) => {
                Err(EmberError::Model("expected text output, got an embedding".into()))
            }
        }
    }

    pub fn into_embedding(self) -> Result<Vec<f32>> {
        match self {
            ModelOutput::Embedding(e) => Ok(e),
            _ => Err(EmberError::Model("expected an embedding".into())),
        }
    }
}

/// Implemented by every model backend a plugin contributes.
#[async_trait]
pub trait ModelHandler: Send + Sync {
    /// Human-readable name, e.g. "openai", "local/llama".
    fn name(&self) -> &str;

    async fn generate(&self, kind: ModelKind, request: &ModelRequest) -> Result<ModelOutput>;
}

/// A handler offered for one model kind. Higher priority wins.
#[derive(Clone)]
pub struct ModelRegistration {
    pub kind: ModelKind,
    pub priority: i32,
    pub handler: Arc<dyn ModelHandler>,
}

impl ModelRegistration {
    pub fn new(kind: ModelKind, priority: i32, handler: Arc<dyn ModelHandler>) -> Self {
        Self {
            kind,
            priority,
            handler,
        }
    }
}

impl std::fmt::Debug for ModelRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistration")
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .field("handler", &self.handler.name())
            .finish()
    }
}
