use std::sync::Arc;

use async_trait::async_trait;

use ember_core::Result;
use ember_llm::ModelRegistration;

use crate::capability::{Action, Evaluator, Provider};
use crate::context::RuntimeContext;
use crate::manifest::PluginManifest;
use crate::service::Service;
use crate::worker::TaskWorker;

/// A bundle of capabilities. The loader commits everything a plugin
/// contributes, or nothing.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn manifest(&self) -> &PluginManifest;

    fn services(&self) -> Vec<Arc<dyn Service>> {
        vec![]
    }

    fn actions(&self) -> Vec<Arc<dyn Action>> {
        vec![]
    }

    fn providers(&self) -> Vec<Arc<dyn Provider>> {
        vec![]
    }

    fn evaluators(&self) -> Vec<Arc<dyn Evaluator>> {
        vec![]
    }

    fn task_workers(&self) -> Vec<Arc<dyn TaskWorker>> {
        vec![]
    }

    fn models(&self) -> Vec<ModelRegistration> {
        vec![]
    }

    /// Called after services and models are in place, before the
    /// capabilities become visible.
    async fn init(&self, _ctx: Arc<dyn RuntimeContext>) -> Result<()> {
        Ok(())
    }
}
