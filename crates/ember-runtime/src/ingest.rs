//! Message ingestion: one inbound message in, at most one decision cycle out.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use ember_core::memory::TABLE_MESSAGES;
use ember_core::{Content, Event, IdentityMapper, IncomingMessage, Memory, Result};
use ember_plugin::{ResponseSink, RuntimeContext};

use crate::connection::{Connection, ensure_connection};
use crate::multi_step::{CycleOutcome, MultiStepLoop, ResponseMode, inject_trajectory};
use crate::pipeline::{CapabilityPipeline, EvaluatorOutcome};
use crate::scheduler::TaskScheduler;
use crate::state::StateComposer;

/// What happened to one inbound message.
#[derive(Debug, Clone)]
pub struct ProcessReport {
    /// Stored memory id of the inbound message.
    pub message_id: Uuid,
    pub room_id: Uuid,
    /// The message was seen before; no cycle ran.
    pub duplicate: bool,
    /// `await-input` tasks the message triggered.
    pub tasks_triggered: usize,
    pub outcome: Option<CycleOutcome>,
    /// Every reply emitted for this message, action output included.
    pub replies: Vec<Uuid>,
    pub evaluations: Vec<EvaluatorOutcome>,
}

/// Stores agent content as room messages and publishes it as `MessageSent`.
pub struct RoomSink {
    ctx: Arc<dyn RuntimeContext>,
    connection: Connection,
    channel_id: String,
    source: String,
    in_reply_to: Uuid,
    sent: Mutex<Vec<Uuid>>,
}

impl RoomSink {
    fn new(
        ctx: Arc<dyn RuntimeContext>,
        connection: Connection,
        incoming: &IncomingMessage,
        in_reply_to: Uuid,
    ) -> Self {
        Self {
            ctx,
            connection,
            channel_id: incoming.channel_id.clone(),
            source: incoming.source.clone(),
            in_reply_to,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<Uuid> {
        self.sent.lock().clone()
    }

    async fn emit(&self, mut content: Content) -> Result<Uuid> {
        content.in_reply_to.get_or_insert(self.in_reply_to);
        content.source.get_or_insert_with(|| self.source.clone());
        let memory = Memory::new(
            self.ctx.agent_id(),
            self.connection.agent_entity_id,
            self.connection.room_id,
            content.clone(),
            TABLE_MESSAGES,
        )
        .with_world(Some(self.connection.world_id));
        self.ctx.storage().create_memory(&memory).await?;
        self.ctx.publish(Event::MessageSent {
            reply_id: memory.id,
            in_reply_to: self.in_reply_to,
            room_id: self.connection.room_id,
            world_id: Some(self.connection.world_id),
            channel_id: self.channel_id.clone(),
            source: self.source.clone(),
            content,
        });
        self.sent.lock().push(memory.id);
        Ok(memory.id)
    }
}

#[async_trait]
impl ResponseSink for RoomSink {
    async fn send(&self, content: Content) -> Result<()> {
        self.emit(content).await.map(|_| ())
    }
}

/// Runs the per-message pipeline: connection, idempotent storage,
/// await-input matching, the decision cycle, the reply and evaluation.
pub struct MessageProcessor {
    ctx: Arc<dyn RuntimeContext>,
    mapper: IdentityMapper,
    composer: Arc<StateComposer>,
    pipeline: Arc<CapabilityPipeline>,
    cycle: Arc<MultiStepLoop>,
    scheduler: Arc<TaskScheduler>,
}

impl MessageProcessor {
    pub fn new(
        ctx: Arc<dyn RuntimeContext>,
        composer: Arc<StateComposer>,
        pipeline: Arc<CapabilityPipeline>,
        cycle: Arc<MultiStepLoop>,
        scheduler: Arc<TaskScheduler>,
    ) -> Self {
        let mapper = ctx.identity();
        Self {
            ctx,
            mapper,
            composer,
            pipeline,
            cycle,
            scheduler,
        }
    }

    pub fn mapper(&self) -> &IdentityMapper {
        &self.mapper
    }

    pub async fn process(
        &self,
        incoming: IncomingMessage,
        cancel: &CancellationToken,
    ) -> Result<ProcessReport> {
        let storage = self.ctx.storage();
        let connection =
            ensure_connection(storage.as_ref(), &self.mapper, self.ctx.agent_name(), &incoming)
                .await?;

        let mut content = incoming.content.clone();
        content.source.get_or_insert_with(|| incoming.source.clone());
        let mut memory = Memory::new(
            self.ctx.agent_id(),
            connection.entity_id,
            connection.room_id,
            content,
            TABLE_MESSAGES,
        )
        .with_id(self.mapper.message(&incoming.id))
        .with_world(Some(connection.world_id));
        memory.created_at = incoming.created_at;

        let mut report = ProcessReport {
            message_id: memory.id,
            room_id: connection.room_id,
            duplicate: false,
            tasks_triggered: 0,
            outcome: None,
            replies: Vec::new(),
            evaluations: Vec::new(),
        };

        if !storage.create_memory(&memory).await? {
            info!(message = %memory.id, external_id = %incoming.id, "duplicate message, skipping");
            report.duplicate = true;
            return Ok(report);
        }
        self.ctx.publish(Event::MessageReceived {
            memory_id: memory.id,
            room_id: connection.room_id,
            entity_id: connection.entity_id,
            source: incoming.source.clone(),
        });

        report.tasks_triggered = match self.scheduler.handle_input(&memory).await {
            Ok(n) => n,
            Err(e) => {
                warn!(message = %memory.id, error = %e, "await-input matching failed");
                0
            }
        };

        let run_id = Uuid::new_v4();
        info!(run = %run_id, message = %memory.id, room = %connection.room_id, "run started");
        self.ctx.publish(Event::RunStarted {
            run_id,
            message_id: memory.id,
            room_id: connection.room_id,
        });

        let sink = RoomSink::new(Arc::clone(&self.ctx), connection, &incoming, memory.id);
        let outcome = self.cycle.run(run_id, &memory, &sink, cancel).await;

        if let Some(reply) = outcome.reply.clone()
            && let Err(e) = sink.emit(reply).await
        {
            warn!(run = %run_id, error = %e, "failed to store reply");
        }
        report.replies = sink.sent();

        match outcome.mode {
            ResponseMode::Simple => info!(
                run = %run_id,
                mode = %outcome.mode,
                iterations = outcome.iterations,
                "run ended"
            ),
            ResponseMode::None => info!(
                run = %run_id,
                mode = %outcome.mode,
                iterations = outcome.iterations,
                parse_failures = outcome.parse_failures,
                cancelled = outcome.cancelled,
                "run ended without a reply"
            ),
        }
        self.ctx.publish(Event::RunEnded {
            run_id,
            message_id: memory.id,
            mode: outcome.mode.to_string(),
            iterations: outcome.iterations,
        });

        if !outcome.cancelled {
            let (mut state, _) = self.composer.compose(&memory, &[], true).await;
            inject_trajectory(&mut state, &outcome.trajectory);
            report.evaluations = self
                .pipeline
                .evaluate(&memory, &state, !report.replies.is_empty())
                .await;
        }
        self.composer.cache().invalidate(memory.id);

        report.outcome = Some(outcome);
        Ok(report)
    }
}
