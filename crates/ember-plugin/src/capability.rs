use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use ember_core::{Memory, Result, State};

use crate::context::{ResponseSink, RuntimeContext};

// ── Actions ────────────────────────────────────────────────────

/// What an action handler reports back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    /// Short human-readable outcome, fed back into the next decision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Values merged into the state of later steps.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub data: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResult {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            success: true,
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

/// Something the agent can do. Stateless; owned by its plugin.
#[async_trait]
pub trait Action: Send + Sync {
    /// Unique name, e.g. "REPLY", "SEND_EMAIL".
    fn name(&self) -> &str;

    /// Description shown to the model when it picks an action.
    fn description(&self) -> &str;

    /// Alternative names the model may use.
    fn similes(&self) -> Vec<String> {
        vec![]
    }

    /// Example exchanges illustrating when to use the action.
    fn examples(&self) -> Vec<String> {
        vec![]
    }

    /// Whether the action applies to this message at all.
    async fn validate(
        &self,
        _ctx: &dyn RuntimeContext,
        _message: &Memory,
        _state: &State,
    ) -> Result<bool> {
        Ok(true)
    }

    /// Run the action. Content for the user goes through `sink`.
    async fn handle(
        &self,
        ctx: &dyn RuntimeContext,
        message: &Memory,
        state: &State,
        sink: &dyn ResponseSink,
    ) -> Result<ActionResult>;
}

// ── Providers ──────────────────────────────────────────────────

/// A provider's contribution to the state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

impl ProviderResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// A source of context for the per-cycle state.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Private providers only run when requested by name.
    fn private(&self) -> bool {
        false
    }

    /// Dynamic providers are expensive or situational; they only run when
    /// the loop asks for them by name.
    fn dynamic(&self) -> bool {
        false
    }

    async fn get(
        &self,
        ctx: &dyn RuntimeContext,
        message: &Memory,
        state: &State,
    ) -> Result<ProviderResult>;
}

// ── Evaluators ─────────────────────────────────────────────────

/// The one result shape every evaluator returns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

impl EvaluationResult {
    pub fn pass() -> Self {
        Self {
            passed: true,
            ..Default::default()
        }
    }

    pub fn fail(diagnostic: impl Into<String>) -> Self {
        Self {
            passed: false,
            diagnostic: Some(diagnostic.into()),
            data: serde_json::Value::Null,
        }
    }
}

/// Post-response judgment over a message and the agent's reaction to it.
#[async_trait]
pub trait Evaluator: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Run regardless of `validate`.
    fn always_run(&self) -> bool {
        false
    }

    async fn validate(
        &self,
        _ctx: &dyn RuntimeContext,
        _message: &Memory,
        _state: &State,
    ) -> Result<bool> {
        Ok(true)
    }

    async fn evaluate(
        &self,
        ctx: &dyn RuntimeContext,
        message: &Memory,
        state: &State,
        did_respond: bool,
    ) -> Result<EvaluationResult>;
}
