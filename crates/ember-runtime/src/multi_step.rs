//! # Multi-Step Loop
//!
//! One decision cycle per inbound message, driven as an explicit state machine:
//!
//! ```text
//!   Deciding ──decided──▶ Executing ──▶ Deciding   (not finished, budget left)
//!      │                      │
//!      │ parse failure        └──finish / budget spent──▶ Summarizing ──▶ Done
//!      └──────────────▶ Deciding / Summarizing
//! ```
//!
//! Each decision may pull providers and run at most one action. Everything
//! pulled or run is appended to the trajectory, which is fed back into the
//! next decision and into the final summary.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ember_config::schema::AgentConfig;
use ember_core::memory::TABLE_MESSAGES;
use ember_core::{Content, EmberError, Event, Memory, MemoryQuery, Result, State};
use ember_llm::{ModelKind, ModelRequest};
use ember_plugin::{Action, ResponseSink, RuntimeContext};

use crate::guard::guarded;
use crate::pipeline::CapabilityPipeline;
use crate::registry::normalize;
use crate::state::StateComposer;

/// Key under which the trajectory is injected into the state.
pub const ACTION_RESULTS_KEY: &str = "actionResults";

// ── State machine ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Deciding,
    Executing,
    Summarizing,
    Done,
}

/// What the step that just ran reports to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum StepSignal {
    Decided(Decision),
    /// The model errored or its output did not parse.
    DecisionFailed,
    Executed { finish: bool },
    Summarized,
    Cancelled,
}

/// Next loop state. `iteration` counts decisions made so far in the cycle.
pub fn transition(
    state: LoopState,
    signal: &StepSignal,
    iteration: u32,
    max_iterations: u32,
) -> LoopState {
    use LoopState::*;
    match (state, signal) {
        (_, StepSignal::Cancelled) => Done,
        (Deciding, StepSignal::Decided(_)) => Executing,
        (Deciding, StepSignal::DecisionFailed) if iteration >= max_iterations => Summarizing,
        (Deciding, StepSignal::DecisionFailed) => Deciding,
        (Executing, StepSignal::Executed { finish }) if *finish || iteration >= max_iterations => {
            Summarizing
        }
        (Executing, StepSignal::Executed { .. }) => Deciding,
        (Summarizing, StepSignal::Summarized) => Done,
        (current, _) => current,
    }
}

// ── Decisions ──────────────────────────────────────────────────

/// What the model wants to do next.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decision {
    pub thought: String,
    pub providers: Vec<String>,
    pub action: Option<String>,
    pub is_finish: bool,
}

/// The final `{thought, text}` reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Summary {
    pub thought: String,
    pub text: String,
}

/// Locate a JSON object in model output: a fenced block first, then the
/// outermost braces.
fn extract_json(raw: &str) -> Option<serde_json::Map<String, Value>> {
    let fenced = Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```")
        .ok()
        .and_then(|re| re.captures(raw))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str());
    let candidate = fenced.or_else(|| {
        let start = raw.find('{')?;
        let end = raw.rfind('}')?;
        (end > start).then(|| &raw[start..=end])
    })?;
    match serde_json::from_str::<Value>(candidate).ok()? {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// Value of `<tag>…</tag>`, trimmed.
fn xml_tag(raw: &str, tag: &str) -> Option<String> {
    let re = Regex::new(&format!(r"(?s)<{tag}>(.*?)</{tag}>")).ok()?;
    re.captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

fn has_xml(raw: &str) -> bool {
    raw.contains("<response>") || raw.contains("<thought>")
}

fn string_field(map: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match map.get(*k)? {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Array(items) => items.first().and_then(Value::as_str).map(|s| s.trim().to_string()),
        _ => None,
    })
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn truthy(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "1")
}

/// An empty or "none" action means no action.
fn action_name(raw: Option<String>) -> Option<String> {
    raw.filter(|a| !a.is_empty() && !a.eq_ignore_ascii_case("none"))
}

/// Parse a decision from a JSON object (bare or fenced) or `<response>` XML.
pub fn parse_decision(raw: &str) -> Result<Decision> {
    if let Some(map) = extract_json(raw) {
        let providers = match map.get("providers") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            Some(Value::String(s)) => split_list(s),
            _ => Vec::new(),
        };
        let is_finish = match map.get("isFinish").or_else(|| map.get("is_finish")) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => truthy(s),
            _ => false,
        };
        return Ok(Decision {
            thought: string_field(&map, &["thought"]).unwrap_or_default(),
            providers,
            action: action_name(string_field(&map, &["action", "actions"])),
            is_finish,
        });
    }

    if has_xml(raw) {
        return Ok(Decision {
            thought: xml_tag(raw, "thought").unwrap_or_default(),
            providers: xml_tag(raw, "providers")
                .map(|p| split_list(&p))
                .unwrap_or_default(),
            action: action_name(xml_tag(raw, "action").or_else(|| xml_tag(raw, "actions"))),
            is_finish: xml_tag(raw, "isFinish")
                .or_else(|| xml_tag(raw, "is_finish"))
                .is_some_and(|v| truthy(&v)),
        });
    }

    Err(EmberError::Parse(format!(
        "no decision found in model output ({} chars)",
        raw.len()
    )))
}

/// Parse the final summary. Same formats as [`parse_decision`].
pub fn parse_summary(raw: &str) -> Result<Summary> {
    if let Some(map) = extract_json(raw) {
        return Ok(Summary {
            thought: string_field(&map, &["thought"]).unwrap_or_default(),
            text: string_field(&map, &["text"]).unwrap_or_default(),
        });
    }
    if has_xml(raw) || raw.contains("<text>") {
        return Ok(Summary {
            thought: xml_tag(raw, "thought").unwrap_or_default(),
            text: xml_tag(raw, "text").unwrap_or_default(),
        });
    }
    Err(EmberError::Parse("no summary found in model output".into()))
}

// ── Trajectory ─────────────────────────────────────────────────

/// One thing the loop pulled or ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrajectoryEntry {
    Provider {
        iteration: u32,
        name: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Action {
        iteration: u32,
        name: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// Merged into the state of every later step.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        values: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
        data: serde_json::Map<String, Value>,
    },
}

impl TrajectoryEntry {
    pub fn is_action(&self) -> bool {
        matches!(self, TrajectoryEntry::Action { .. })
    }

    pub fn succeeded(&self) -> bool {
        match self {
            TrajectoryEntry::Provider { ok, .. } => *ok,
            TrajectoryEntry::Action { success, .. } => *success,
        }
    }
}

impl fmt::Display for TrajectoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (iteration, kind, name, ok, text, error) = match self {
            TrajectoryEntry::Provider {
                iteration,
                name,
                ok,
                text,
                error,
            } => (iteration, "provider", name, ok, text, error),
            TrajectoryEntry::Action {
                iteration,
                name,
                success,
                text,
                error,
                ..
            } => (iteration, "action", name, success, text, error),
        };
        write!(f, "Step {iteration} {kind} {name}: ")?;
        if *ok {
            write!(f, "ok")?;
            if let Some(t) = text.as_deref().filter(|t| !t.is_empty()) {
                write!(f, " - {t}")?;
            }
        } else {
            write!(f, "failed - {}", error.as_deref().unwrap_or("unknown error"))?;
        }
        Ok(())
    }
}

/// Put the trajectory into `state` as data and as a text block. Values and
/// data returned by earlier actions are merged in step order.
pub fn inject_trajectory(state: &mut State, trajectory: &[TrajectoryEntry]) {
    for entry in trajectory {
        if let TrajectoryEntry::Action { values, data, .. } = entry {
            state
                .values
                .extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
            state
                .data
                .extend(data.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
    }
    let data = serde_json::to_value(trajectory).unwrap_or(Value::Array(Vec::new()));
    state.set_data(ACTION_RESULTS_KEY, data);
    let text = trajectory
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n");
    state.set_value(ACTION_RESULTS_KEY, text);
}

// ── Outcome ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    /// A reply was produced.
    Simple,
    /// The agent chose, or was forced, to stay silent.
    None,
}

impl fmt::Display for ResponseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResponseMode::Simple => "simple",
            ResponseMode::None => "none",
        })
    }
}

#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub mode: ResponseMode,
    pub reply: Option<Content>,
    pub trajectory: Vec<TrajectoryEntry>,
    /// Decisions attempted, including failed ones.
    pub iterations: u32,
    pub parse_failures: u32,
    pub cancelled: bool,
}

// ── Loop ───────────────────────────────────────────────────────

pub struct MultiStepLoop {
    ctx: Arc<dyn RuntimeContext>,
    composer: Arc<StateComposer>,
    pipeline: Arc<CapabilityPipeline>,
    max_iterations: u32,
    conversation_length: usize,
    model_timeout: Duration,
    system_prompt: Option<String>,
}

impl MultiStepLoop {
    pub fn new(
        ctx: Arc<dyn RuntimeContext>,
        composer: Arc<StateComposer>,
        pipeline: Arc<CapabilityPipeline>,
        config: &AgentConfig,
    ) -> Self {
        Self {
            ctx,
            composer,
            pipeline,
            max_iterations: config.max_iterations.max(1),
            conversation_length: config.conversation_length,
            model_timeout: config.model_timeout(),
            system_prompt: config.system_prompt.clone(),
        }
    }

    async fn call_model(&self, prompt: String) -> Result<String> {
        let mut request = ModelRequest::prompt(prompt);
        if let Some(system) = &self.system_prompt {
            request = request.with_system(system.clone());
        }
        let kind = ModelKind::TextLarge;
        let output = guarded(
            "model",
            kind.as_str(),
            self.model_timeout,
            self.ctx.use_model(kind, request),
        )
        .await?;
        output.into_text()
    }

    /// Recent room messages, oldest first, as `Name: text` lines.
    async fn conversation(&self, message: &Memory) -> String {
        if self.conversation_length == 0 {
            return String::new();
        }
        let storage = self.ctx.storage();
        let query = MemoryQuery::room(message.room_id)
            .table(TABLE_MESSAGES)
            .count(self.conversation_length);
        let mut memories = match storage.get_memories(&query).await {
            Ok(m) => m,
            Err(e) => {
                warn!(room = %message.room_id, error = %e, "failed to load conversation");
                return String::new();
            }
        };
        memories.reverse();

        let agent_entity = self.ctx.identity().entity(&self.ctx.agent_id().to_string());
        let mut names: HashMap<Uuid, String> = HashMap::new();
        names.insert(agent_entity, self.ctx.agent_name().to_string());
        let mut lines = Vec::with_capacity(memories.len());
        for memory in &memories {
            if !names.contains_key(&memory.entity_id) {
                let name = match storage.get_entity(memory.entity_id).await {
                    Ok(Some(entity)) => entity.display_name().unwrap_or("User").to_string(),
                    _ => "User".to_string(),
                };
                names.insert(memory.entity_id, name);
            }
            let speaker = names.get(&memory.entity_id).map(String::as_str).unwrap_or("User");
            lines.push(format!("{speaker}: {}", memory.text()));
        }
        lines.join("\n")
    }

    fn decision_prompt(
        &self,
        state: &State,
        conversation: &str,
        actions: &[Arc<dyn Action>],
        iteration: u32,
    ) -> String {
        let mut prompt = format!("# Context\n{}\n", state.render());
        if !conversation.is_empty() {
            prompt.push_str(&format!("\n# Conversation\n{conversation}\n"));
        }
        prompt.push_str("\n# Available actions\n");
        for action in actions {
            prompt.push_str(&format!("- {}: {}\n", action.name(), action.description()));
        }
        prompt.push_str("\n# Available providers\n");
        for provider in self.pipeline.registry().providers() {
            prompt.push_str(&format!("- {}: {}\n", provider.name(), provider.description()));
        }
        prompt.push_str(&format!(
            "\n# Task\nYou are {name}. Step {iteration} of at most {max}. Decide the next step. \
             Name any providers you need and at most one action, or finish.\n\
             Respond with JSON only:\n\
             {{\"thought\": \"...\", \"providers\": [\"...\"], \"action\": \"NAME or null\", \"isFinish\": false}}\n",
            name = self.ctx.agent_name(),
            max = self.max_iterations,
        ));
        prompt
    }

    fn summary_prompt(&self, state: &State, conversation: &str) -> String {
        let mut prompt = format!("# Context\n{}\n", state.render());
        if !conversation.is_empty() {
            prompt.push_str(&format!("\n# Conversation\n{conversation}\n"));
        }
        prompt.push_str(&format!(
            "\n# Task\nYou are {}. Write the final reply to the last message using the steps \
             taken above. Leave \"text\" empty to stay silent.\n\
             Respond with JSON only:\n{{\"thought\": \"...\", \"text\": \"...\"}}\n",
            self.ctx.agent_name()
        ));
        prompt
    }

    /// Run one decision cycle for `message`. Never fails: every problem is
    /// recorded in the outcome.
    pub async fn run(
        &self,
        run_id: Uuid,
        message: &Memory,
        sink: &dyn ResponseSink,
        cancel: &CancellationToken,
    ) -> CycleOutcome {
        let conversation = self.conversation(message).await;
        let (initial, _) = self.composer.compose(message, &[], true).await;
        let actions = self.pipeline.select_actions(message, &initial).await;

        let mut state = LoopState::Deciding;
        let mut iteration = 0u32;
        let mut parse_failures = 0u32;
        let mut trajectory: Vec<TrajectoryEntry> = Vec::new();
        let mut decision: Option<Decision> = None;
        let mut summary: Option<Summary> = None;
        let mut cancelled = false;

        while state != LoopState::Done {
            let signal = if cancel.is_cancelled() {
                cancelled = true;
                StepSignal::Cancelled
            } else {
                match state {
                    LoopState::Deciding => {
                        iteration += 1;
                        let (mut current, _) = self.composer.compose(message, &[], true).await;
                        inject_trajectory(&mut current, &trajectory);
                        let prompt =
                            self.decision_prompt(&current, &conversation, &actions, iteration);
                        match self.call_model(prompt).await.and_then(|raw| parse_decision(&raw)) {
                            Ok(d) => {
                                debug!(
                                    iteration,
                                    action = ?d.action,
                                    providers = ?d.providers,
                                    finish = d.is_finish,
                                    "decision made"
                                );
                                decision = Some(d.clone());
                                StepSignal::Decided(d)
                            }
                            Err(e) => {
                                parse_failures += 1;
                                warn!(iteration, error = %e, "decision failed, moving on");
                                StepSignal::DecisionFailed
                            }
                        }
                    }
                    LoopState::Executing => {
                        let d = decision.take().unwrap_or_default();
                        self.execute(run_id, message, &d, &actions, iteration, sink, &mut trajectory)
                            .await;
                        StepSignal::Executed { finish: d.is_finish }
                    }
                    LoopState::Summarizing => {
                        summary = self.summarize(message, &conversation, &trajectory).await;
                        StepSignal::Summarized
                    }
                    LoopState::Done => break,
                }
            };
            state = transition(state, &signal, iteration, self.max_iterations);
        }

        let reply = summary.filter(|s| !s.text.trim().is_empty()).map(|s| Content {
            text: Some(s.text),
            thought: (!s.thought.is_empty()).then_some(s.thought),
            actions: trajectory
                .iter()
                .filter_map(|e| match e {
                    TrajectoryEntry::Action { name, .. } => Some(name.clone()),
                    _ => None,
                })
                .collect(),
            source: message.content.source.clone(),
            in_reply_to: Some(message.id),
            ..Default::default()
        });
        let mode = if reply.is_some() {
            ResponseMode::Simple
        } else {
            ResponseMode::None
        };

        CycleOutcome {
            mode,
            reply,
            trajectory,
            iterations: iteration,
            parse_failures,
            cancelled,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        run_id: Uuid,
        message: &Memory,
        decision: &Decision,
        actions: &[Arc<dyn Action>],
        iteration: u32,
        sink: &dyn ResponseSink,
        trajectory: &mut Vec<TrajectoryEntry>,
    ) {
        let (mut state, _) = self.composer.compose(message, &[], true).await;

        if !decision.providers.is_empty() {
            let (pulled, outcomes) = self
                .composer
                .compose(message, &decision.providers, true)
                .await;
            for name in &decision.providers {
                let outcome = outcomes
                    .iter()
                    .find(|o| normalize(&o.name) == normalize(name));
                trajectory.push(match outcome {
                    Some(o) => TrajectoryEntry::Provider {
                        iteration,
                        name: o.name.clone(),
                        ok: o.ok,
                        text: o.text.clone(),
                        error: o.error.clone(),
                    },
                    None => TrajectoryEntry::Provider {
                        iteration,
                        name: name.clone(),
                        ok: false,
                        text: None,
                        error: Some(format!("unknown provider: {name}")),
                    },
                });
            }
            state.values.extend(pulled.values);
            if !pulled.text.is_empty() {
                if !state.text.is_empty() {
                    state.text.push_str("\n\n");
                }
                state.text.push_str(&pulled.text);
            }
        }

        let Some(requested) = decision.action.as_deref() else {
            return;
        };
        let wanted = normalize(requested);
        let action = actions.iter().find(|a| {
            normalize(a.name()) == wanted || a.similes().iter().any(|s| normalize(s) == wanted)
        });
        let Some(action) = action else {
            let reason = if self.pipeline.find_action(requested).is_some() {
                format!("action {requested} is not available for this message")
            } else {
                EmberError::ActionNotFound(requested.to_string()).to_string()
            };
            warn!(action = requested, iteration, "{reason}");
            trajectory.push(TrajectoryEntry::Action {
                iteration,
                name: requested.to_string(),
                success: false,
                text: None,
                error: Some(reason),
                values: BTreeMap::new(),
                data: serde_json::Map::new(),
            });
            return;
        };

        inject_trajectory(&mut state, trajectory);
        self.ctx.publish(Event::ActionStarted {
            run_id,
            action: action.name().to_string(),
        });
        let outcome = self.pipeline.invoke(action, message, &state, sink).await;
        self.ctx.publish(Event::ActionCompleted {
            run_id,
            action: outcome.action.clone(),
            success: outcome.success(),
        });
        trajectory.push(TrajectoryEntry::Action {
            iteration,
            name: outcome.action,
            success: outcome.result.success,
            text: outcome.result.text,
            error: outcome.result.error,
            values: outcome.result.values,
            data: outcome.result.data,
        });
    }

    async fn summarize(
        &self,
        message: &Memory,
        conversation: &str,
        trajectory: &[TrajectoryEntry],
    ) -> Option<Summary> {
        let (mut state, _) = self.composer.compose(message, &[], false).await;
        inject_trajectory(&mut state, trajectory);
        let prompt = self.summary_prompt(&state, conversation);
        match self.call_model(prompt).await.and_then(|raw| parse_summary(&raw)) {
            Ok(summary) => Some(summary),
            Err(e) => {
                info!(error = %e, "summary unavailable, staying silent");
                None
            }
        }
    }
}
