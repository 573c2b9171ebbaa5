use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use ember_core::{Content, Event, IdentityMapper, NewTask, Result, WorldSettings};
use ember_llm::{ModelKind, ModelOutput, ModelRequest};
use ember_memory::StorageAdapter;

use crate::service::Service;

/// The runtime as seen by capabilities, services and plugin init hooks.
#[async_trait]
pub trait RuntimeContext: Send + Sync {
    fn agent_id(&self) -> Uuid;

    fn agent_name(&self) -> &str;

    /// Identity mapper bound to this agent.
    fn identity(&self) -> IdentityMapper {
        IdentityMapper::new(self.agent_id())
    }

    fn get_service(&self, service_type: &str) -> Option<Arc<dyn Service>>;

    /// Invoke the highest-priority model handler for `kind`.
    async fn use_model(&self, kind: ModelKind, request: ModelRequest) -> Result<ModelOutput>;

    fn storage(&self) -> Arc<dyn StorageAdapter>;

    /// Persist a new task; the scheduler picks it up according to its tags.
    async fn create_task(&self, task: NewTask) -> Result<Uuid>;

    fn publish(&self, event: Event);

    /// Onboarding settings of a world, if it has any.
    async fn get_world_settings(&self, world_id: Uuid) -> Result<Option<WorldSettings>>;

    /// Update one onboarding setting, validating key and dependencies.
    async fn set_world_setting(
        &self,
        world_id: Uuid,
        key: &str,
        value: serde_json::Value,
    ) -> Result<()>;
}

/// Where an action sends content meant for the user.
#[async_trait]
pub trait ResponseSink: Send + Sync {
    async fn send(&self, content: Content) -> Result<()>;
}

/// A sink that only collects what it is sent.
#[derive(Default)]
pub struct CollectingSink {
    sent: Mutex<Vec<Content>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Content> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl ResponseSink for CollectingSink {
    async fn send(&self, content: Content) -> Result<()> {
        self.sent.lock().push(content);
        Ok(())
    }
}
