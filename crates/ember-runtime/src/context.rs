//! The runtime context handed to capabilities, services and plugin hooks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use ember_core::{EmberError, Event, EventBus, NewTask, Result, WorldSettings};
use ember_llm::{ModelKind, ModelOutput, ModelRequest, ModelRouter};
use ember_memory::StorageAdapter;
use ember_plugin::{RuntimeContext, Service};

use crate::scheduler::validate_schedule;
use crate::services::ServiceRegistry;

/// World settings cached per world id for a fixed lifetime.
pub struct SettingsCache {
    ttl: Duration,
    entries: Mutex<HashMap<Uuid, (Instant, Option<WorldSettings>)>>,
}

impl SettingsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// `Some(settings)` on a fresh hit; `None` when absent or expired.
    pub fn get(&self, world_id: Uuid) -> Option<Option<WorldSettings>> {
        let mut entries = self.entries.lock();
        match entries.get(&world_id) {
            Some((at, settings)) if at.elapsed() < self.ttl => Some(settings.clone()),
            Some(_) => {
                entries.remove(&world_id);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, world_id: Uuid, settings: Option<WorldSettings>) {
        if self.ttl.is_zero() {
            return;
        }
        self.entries.lock().insert(world_id, (Instant::now(), settings));
    }

    pub fn invalidate(&self, world_id: Uuid) {
        self.entries.lock().remove(&world_id);
    }
}

/// Concrete [`RuntimeContext`] backed by the runtime's shared parts.
pub struct AgentContext {
    agent_id: Uuid,
    agent_name: String,
    storage: Arc<dyn StorageAdapter>,
    models: Arc<ModelRouter>,
    services: Arc<ServiceRegistry>,
    events: EventBus,
    settings: SettingsCache,
}

impl AgentContext {
    pub fn new(
        agent_id: Uuid,
        agent_name: impl Into<String>,
        storage: Arc<dyn StorageAdapter>,
        models: Arc<ModelRouter>,
        services: Arc<ServiceRegistry>,
        events: EventBus,
        settings_ttl: Duration,
    ) -> Self {
        Self {
            agent_id,
            agent_name: agent_name.into(),
            storage,
            models,
            services,
            events,
            settings: SettingsCache::new(settings_ttl),
        }
    }

    pub fn models(&self) -> &Arc<ModelRouter> {
        &self.models
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }
}

#[async_trait]
impl RuntimeContext for AgentContext {
    fn agent_id(&self) -> Uuid {
        self.agent_id
    }

    fn agent_name(&self) -> &str {
        &self.agent_name
    }

    fn get_service(&self, service_type: &str) -> Option<Arc<dyn Service>> {
        self.services.get(service_type)
    }

    async fn use_model(&self, kind: ModelKind, request: ModelRequest) -> Result<ModelOutput> {
        self.models.use_model(kind, &request).await
    }

    fn storage(&self) -> Arc<dyn StorageAdapter> {
        Arc::clone(&self.storage)
    }

    async fn create_task(&self, task: NewTask) -> Result<Uuid> {
        validate_schedule(&task.schedule)?;
        let task = task.into_task();
        self.storage.create_task(&task).await?;
        info!(task_id = %task.id, name = %task.name, tags = ?task.tags, "task created");
        Ok(task.id)
    }

    fn publish(&self, event: Event) {
        self.events.publish(event);
    }

    async fn get_world_settings(&self, world_id: Uuid) -> Result<Option<WorldSettings>> {
        if let Some(hit) = self.settings.get(world_id) {
            return Ok(hit);
        }
        let settings = self
            .storage
            .get_world(world_id)
            .await?
            .and_then(|w| w.settings());
        self.settings.put(world_id, settings.clone());
        Ok(settings)
    }

    async fn set_world_setting(
        &self,
        world_id: Uuid,
        key: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        let mut world = self
            .storage
            .get_world(world_id)
            .await?
            .ok_or_else(|| EmberError::NotFound(format!("world {world_id}")))?;
        let mut settings = world.settings().unwrap_or_default();
        settings.update(key, value)?;
        world.set_settings(&settings)?;
        self.storage.update_world(&world).await?;
        self.settings.invalidate(world_id);
        debug!(world = %world_id, setting = key, "world setting updated");
        Ok(())
    }
}
