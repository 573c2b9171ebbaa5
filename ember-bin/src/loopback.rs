//! Built-in loopback plugin so `ember run` works without a model backend.
//!
//! The loopback model always picks `ECHO` and finishes; the summary stays
//! empty, so the only reply is the echoed text. Any real TEXT_LARGE handler
//! registered later outranks it.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use ember_core::{Content, EmberError, Memory, Result, State};
use ember_llm::{ModelHandler, ModelKind, ModelOutput, ModelRegistration, ModelRequest};
use ember_plugin::{Action, ActionResult, Plugin, PluginManifest, ResponseSink, RuntimeContext};

pub struct LoopbackPlugin {
    manifest: PluginManifest,
}

impl LoopbackPlugin {
    pub fn new() -> Self {
        Self {
            manifest: PluginManifest::new("loopback", env!("CARGO_PKG_VERSION"))
                .with_description("Echo every message back (no model backend needed)"),
        }
    }
}

#[async_trait]
impl Plugin for LoopbackPlugin {
    fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    fn actions(&self) -> Vec<Arc<dyn Action>> {
        vec![Arc::new(EchoAction)]
    }

    fn models(&self) -> Vec<ModelRegistration> {
        vec![ModelRegistration::new(
            ModelKind::TextLarge,
            i32::MIN,
            Arc::new(LoopbackModel),
        )]
    }
}

struct EchoAction;

#[async_trait]
impl Action for EchoAction {
    fn name(&self) -> &str {
        "ECHO"
    }

    fn description(&self) -> &str {
        "Repeat the user's message back to them"
    }

    fn similes(&self) -> Vec<String> {
        vec!["REPEAT".into()]
    }

    async fn handle(
        &self,
        _ctx: &dyn RuntimeContext,
        message: &Memory,
        _state: &State,
        sink: &dyn ResponseSink,
    ) -> Result<ActionResult> {
        sink.send(Content::text(message.text())).await?;
        Ok(ActionResult::ok("echoed"))
    }
}

struct LoopbackModel;

#[async_trait]
impl ModelHandler for LoopbackModel {
    fn name(&self) -> &str {
        "loopback"
    }

    async fn generate(&self, kind: ModelKind, request: &ModelRequest) -> Result<ModelOutput> {
        if !matches!(kind, ModelKind::TextLarge | ModelKind::TextSmall) {
            return Err(EmberError::Model(format!("loopback cannot serve {kind}")));
        }
        // Decision prompts carry the isFinish field; summary prompts do not.
        let reply = if request.prompt.contains("\"isFinish\"") {
            json!({"thought": "echo the message", "action": "ECHO", "isFinish": true})
        } else {
            json!({"thought": "already echoed", "text": ""})
        };
        Ok(ModelOutput::Text(reply.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loopback_decides_then_stays_silent() {
        let model = LoopbackModel;
        let decision = model
            .generate(
                ModelKind::TextLarge,
                &ModelRequest::prompt("Respond with JSON: {\"isFinish\": false}"),
            )
            .await
            .unwrap()
            .into_text()
            .unwrap();
        assert!(decision.contains("ECHO"));

        let summary = model
            .generate(ModelKind::TextLarge, &ModelRequest::prompt("Write the final reply"))
            .await
            .unwrap()
            .into_text()
            .unwrap();
        assert!(summary.contains("\"text\":\"\""));

        assert!(
            model
                .generate(ModelKind::TextEmbedding, &ModelRequest::prompt("x"))
                .await
                .is_err()
        );
    }
}
