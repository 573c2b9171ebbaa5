use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Mutex as TokioMutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use ember_config::{EmberConfig, StorageBackend};
use ember_core::{EmberError, Event, EventBus, IncomingMessage, Result};
use ember_llm::ModelRouter;
use ember_memory::{InMemoryStore, SqliteStore, StorageAdapter};
use ember_plugin::{Plugin, RuntimeContext};

use crate::context::AgentContext;
use crate::ingest::{MessageProcessor, ProcessReport};
use crate::loader::{LoadReport, PluginLoader};
use crate::multi_step::MultiStepLoop;
use crate::pipeline::CapabilityPipeline;
use crate::registry::CapabilityRegistry;
use crate::scheduler::TaskScheduler;
use crate::services::ServiceRegistry;
use crate::state::{StateCache, StateComposer};

/// Per-room locks serialising decision cycles within a room.
#[derive(Clone, Default)]
struct RoomLocks {
    locks: Arc<RwLock<HashMap<Uuid, Arc<TokioMutex<()>>>>>,
}

impl RoomLocks {
    async fn get(&self, room_id: Uuid) -> Arc<TokioMutex<()>> {
        // Fast path: lock already exists
        {
            let locks = self.locks.read().await;
            if let Some(lock) = locks.get(&room_id) {
                return Arc::clone(lock);
            }
        }
        // Slow path: create a new lock
        let mut locks = self.locks.write().await;
        Arc::clone(
            locks
                .entry(room_id)
                .or_insert_with(|| Arc::new(TokioMutex::new(()))),
        )
    }
}

/// The assembled agent: storage, models, services, capabilities, the
/// decision loop and the task scheduler behind one event bus.
pub struct AgentRuntime {
    config: EmberConfig,
    ctx: Arc<AgentContext>,
    registry: Arc<CapabilityRegistry>,
    scheduler: Arc<TaskScheduler>,
    loader: PluginLoader,
    processor: Arc<MessageProcessor>,
    room_locks: RoomLocks,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl AgentRuntime {
    /// Build a runtime with the storage backend named in the config.
    pub async fn new(config: EmberConfig) -> Result<Self> {
        info!(agent = %config.agent.name, "initializing agent runtime");
        let storage: Arc<dyn StorageAdapter> = match config.storage.backend {
            StorageBackend::Sqlite => {
                let db_path = config.storage.resolved_db_path();
                if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                Arc::new(SqliteStore::open(&db_path)?)
            }
            StorageBackend::Memory => Arc::new(InMemoryStore::new()),
        };
        Self::with_storage(config, storage).await
    }

    /// Build a runtime over an existing storage backend.
    pub async fn with_storage(config: EmberConfig, storage: Arc<dyn StorageAdapter>) -> Result<Self> {
        storage.init().await?;

        let agent = &config.agent;
        let events = EventBus::new(config.events.capacity, config.events.inbound_capacity);
        let models = Arc::new(ModelRouter::new());
        let services = Arc::new(ServiceRegistry::new());
        let registry = Arc::new(CapabilityRegistry::new());

        let ctx = Arc::new(AgentContext::new(
            config.agent_id(),
            agent.name.clone(),
            storage,
            Arc::clone(&models),
            Arc::clone(&services),
            events,
            Duration::from_secs(config.state.settings_cache_ttl_secs),
        ));
        let dyn_ctx: Arc<dyn RuntimeContext> = ctx.clone();

        let composer = Arc::new(StateComposer::new(
            Arc::clone(&dyn_ctx),
            Arc::clone(&registry),
            StateCache::new(
                Duration::from_secs(config.state.cache_ttl_secs),
                config.state.cache_max_entries,
            ),
            agent.provider_timeout(),
        ));
        let pipeline = Arc::new(CapabilityPipeline::new(
            Arc::clone(&dyn_ctx),
            Arc::clone(&registry),
            agent.action_timeout(),
            agent.evaluator_timeout(),
        ));
        let cycle = Arc::new(MultiStepLoop::new(
            Arc::clone(&dyn_ctx),
            Arc::clone(&composer),
            Arc::clone(&pipeline),
            agent,
        ));
        let scheduler = Arc::new(TaskScheduler::new(
            Arc::clone(&dyn_ctx),
            Arc::clone(&registry),
            agent.task_timeout(),
            Duration::from_millis(config.scheduler.tick_interval_ms),
        ));
        let processor = Arc::new(MessageProcessor::new(
            Arc::clone(&dyn_ctx),
            composer,
            pipeline,
            cycle,
            Arc::clone(&scheduler),
        ));
        let loader = PluginLoader::new(
            dyn_ctx,
            services,
            models,
            Arc::clone(&registry),
            config.plugins.disabled.clone(),
        );

        info!(agent_id = %ctx.agent_id(), "agent runtime ready");
        Ok(Self {
            config,
            ctx,
            registry,
            scheduler,
            loader,
            processor,
            room_locks: RoomLocks::default(),
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        })
    }

    // ── Accessors ──────────────────────────────────────────────

    pub fn config(&self) -> &EmberConfig {
        &self.config
    }

    pub fn agent_id(&self) -> Uuid {
        self.ctx.agent_id()
    }

    pub fn context(&self) -> Arc<AgentContext> {
        Arc::clone(&self.ctx)
    }

    /// Get the event bus for subscribing to system events.
    pub fn event_bus(&self) -> &EventBus {
        self.ctx.events()
    }

    pub fn models(&self) -> &Arc<ModelRouter> {
        self.ctx.models()
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        self.ctx.services()
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn storage(&self) -> Arc<dyn StorageAdapter> {
        self.ctx.storage()
    }

    // ── Lifecycle ──────────────────────────────────────────────

    pub async fn load_plugins(&self, plugins: &[Arc<dyn Plugin>]) -> LoadReport {
        let report = self.loader.load(plugins).await;
        info!(
            loaded = report.loaded.len(),
            skipped = report.skipped.len(),
            "plugins loaded"
        );
        report
    }

    /// Hand a message to the runtime consumer.
    pub async fn submit(&self, message: IncomingMessage) -> Result<()> {
        self.ctx.events().submit(message).await
    }

    /// Process one message in place, holding its room's lock.
    pub async fn process_message(&self, message: IncomingMessage) -> Result<ProcessReport> {
        let room_id = self.processor.mapper().room(&message.channel_id);
        let lock = self.room_locks.get(room_id).await;
        let _guard = lock.lock().await;
        self.processor.process(message, &self.cancel).await
    }

    /// Spawn the inbound consumer and, if enabled, the task scheduler.
    pub fn start(&self) -> Result<()> {
        let mut inbound = self.ctx.events().take_inbound().ok_or_else(|| {
            EmberError::Service {
                service: "runtime".into(),
                reason: "already started".into(),
            }
        })?;

        let processor = Arc::clone(&self.processor);
        let room_locks = self.room_locks.clone();
        let cancel = self.cancel.clone();
        let consumer = tokio::spawn(async move {
            info!("message consumer started");
            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = inbound.recv() => match message {
                        Some(m) => m,
                        None => break,
                    },
                };
                let processor = Arc::clone(&processor);
                let room_locks = room_locks.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let room_id = processor.mapper().room(&message.channel_id);
                    let lock = room_locks.get(room_id).await;
                    let _guard = lock.lock().await;
                    let external_id = message.id.clone();
                    if let Err(e) = processor.process(message, &cancel).await {
                        error!(message = %external_id, error = %e, "failed to process message");
                    }
                });
            }
            info!("message consumer stopped");
        });

        let mut handles = self.handles.lock();
        handles.push(consumer);
        if self.config.scheduler.enabled {
            let scheduler = Arc::clone(&self.scheduler);
            handles.push(tokio::spawn(scheduler.run(self.cancel.child_token())));
        }
        info!(agent = %self.config.agent.name, "agent runtime started");
        Ok(())
    }

    /// Cancel in-flight work, stop services and close storage.
    pub async fn stop(&self) -> Result<()> {
        info!("stopping agent runtime");
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        for (service, e) in self.services().stop_all().await {
            warn!(service = %service, error = %e, "service stop failed during shutdown");
        }
        self.ctx.storage().close().await?;
        self.ctx.publish(Event::Shutdown);
        info!("agent runtime stopped");
        Ok(())
    }

    /// Whether `stop` has been called.
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
