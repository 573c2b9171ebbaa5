//! The capability pipeline: action selection and invocation, evaluation.
//!
//! Every call into plugin code is bounded by a timeout and shielded from
//! panics. Failures become recorded memories and failed outcomes; they never
//! propagate to the caller.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ember_core::memory::{TABLE_ACTIONS, TABLE_EVALUATIONS};
use ember_core::{Content, Event, Memory, State};
use ember_plugin::{Action, ActionResult, EvaluationResult, ResponseSink, RuntimeContext};

use crate::guard::guarded;
use crate::registry::CapabilityRegistry;

/// Result of one action invocation.
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub action: String,
    pub result: ActionResult,
    /// The `action_results` memory recording this invocation.
    pub memory_id: Uuid,
    pub elapsed: Duration,
}

impl ActionOutcome {
    pub fn success(&self) -> bool {
        self.result.success
    }
}

/// Result of one evaluator run.
#[derive(Debug, Clone)]
pub struct EvaluatorOutcome {
    pub evaluator: String,
    pub result: EvaluationResult,
    pub memory_id: Uuid,
}

pub struct CapabilityPipeline {
    ctx: Arc<dyn RuntimeContext>,
    registry: Arc<CapabilityRegistry>,
    action_timeout: Duration,
    evaluator_timeout: Duration,
}

impl CapabilityPipeline {
    pub fn new(
        ctx: Arc<dyn RuntimeContext>,
        registry: Arc<CapabilityRegistry>,
        action_timeout: Duration,
        evaluator_timeout: Duration,
    ) -> Self {
        Self {
            ctx,
            registry,
            action_timeout,
            evaluator_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Id of the agent's own entity, the author of everything it records.
    fn agent_entity(&self) -> Uuid {
        let ctx = self.ctx.as_ref();
        ctx.identity().entity(&ctx.agent_id().to_string())
    }

    async fn record(&self, message: &Memory, content: Content, table: &str) -> Uuid {
        let memory = Memory::new(
            self.ctx.agent_id(),
            self.agent_entity(),
            message.room_id,
            content,
            table,
        )
        .with_world(message.world_id);
        if let Err(e) = self.ctx.storage().create_memory(&memory).await {
            warn!(table, error = %e, "failed to record memory");
        }
        memory.id
    }

    // ── Actions ────────────────────────────────────────────────

    /// Actions whose validation passes for this message. Validation errors,
    /// timeouts and panics exclude the action.
    pub async fn select_actions(&self, message: &Memory, state: &State) -> Vec<Arc<dyn Action>> {
        let ctx = self.ctx.as_ref();
        let actions = self.registry.actions();
        let verdicts = join_all(actions.iter().map(|action| {
            guarded(
                "action",
                action.name(),
                self.action_timeout,
                action.validate(ctx, message, state),
            )
        }))
        .await;

        actions
            .into_iter()
            .zip(verdicts)
            .filter_map(|(action, verdict)| match verdict {
                Ok(true) => Some(action),
                Ok(false) => None,
                Err(e) => {
                    warn!(action = action.name(), error = %e, "action validation failed");
                    None
                }
            })
            .collect()
    }

    pub fn find_action(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.registry.find_action(name)
    }

    /// Run an action handler and record the outcome as an `action_results` memory.
    pub async fn invoke(
        &self,
        action: &Arc<dyn Action>,
        message: &Memory,
        state: &State,
        sink: &dyn ResponseSink,
    ) -> ActionOutcome {
        let name = action.name().to_string();
        let started = Instant::now();
        let result = guarded(
            "action",
            &name,
            self.action_timeout,
            action.handle(self.ctx.as_ref(), message, state, sink),
        )
        .await
        .unwrap_or_else(|e| {
            warn!(action = %name, error = %e, "action failed");
            ActionResult::failed(e.to_string())
        });
        let elapsed = started.elapsed();

        let mut extra = serde_json::Map::new();
        extra.insert("success".into(), json!(result.success));
        if !result.values.is_empty() {
            extra.insert("values".into(), json!(result.values));
        }
        if !result.data.is_empty() {
            extra.insert("data".into(), serde_json::Value::Object(result.data.clone()));
        }
        let content = Content {
            text: result.text.clone(),
            actions: vec![name.clone()],
            source: Some("action".into()),
            in_reply_to: Some(message.id),
            error: result.error.clone(),
            extra,
            ..Default::default()
        };
        let memory_id = self.record(message, content, TABLE_ACTIONS).await;

        info!(
            action = %name,
            success = result.success,
            elapsed_ms = elapsed.as_millis() as u64,
            "action invoked"
        );
        ActionOutcome {
            action: name,
            result,
            memory_id,
            elapsed,
        }
    }

    // ── Evaluators ─────────────────────────────────────────────

    /// Run every applicable evaluator in registration order.
    pub async fn evaluate(
        &self,
        message: &Memory,
        state: &State,
        did_respond: bool,
    ) -> Vec<EvaluatorOutcome> {
        let ctx = self.ctx.as_ref();
        let mut outcomes = Vec::new();

        for evaluator in self.registry.evaluators() {
            let name = evaluator.name().to_string();
            if !evaluator.always_run() {
                match guarded(
                    "evaluator",
                    &name,
                    self.evaluator_timeout,
                    evaluator.validate(ctx, message, state),
                )
                .await
                {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(evaluator = %name, "evaluator not applicable");
                        continue;
                    }
                    Err(e) => {
                        warn!(evaluator = %name, error = %e, "evaluator validation failed");
                        continue;
                    }
                }
            }

            let result = guarded(
                "evaluator",
                &name,
                self.evaluator_timeout,
                evaluator.evaluate(ctx, message, state, did_respond),
            )
            .await
            .unwrap_or_else(|e| {
                warn!(evaluator = %name, error = %e, "evaluator failed");
                EvaluationResult::fail(e.to_string())
            });

            let mut extra = serde_json::Map::new();
            extra.insert("evaluator".into(), json!(name));
            extra.insert("passed".into(), json!(result.passed));
            if !result.data.is_null() {
                extra.insert("data".into(), result.data.clone());
            }
            let content = Content {
                text: result.diagnostic.clone(),
                source: Some("evaluator".into()),
                in_reply_to: Some(message.id),
                extra,
                ..Default::default()
            };
            let memory_id = self.record(message, content, TABLE_EVALUATIONS).await;

            self.ctx.publish(Event::EvaluatorCompleted {
                message_id: message.id,
                evaluator: name.clone(),
                passed: result.passed,
            });
            outcomes.push(EvaluatorOutcome {
                evaluator: name,
                result,
                memory_id,
            });
        }
        outcomes
    }
}
