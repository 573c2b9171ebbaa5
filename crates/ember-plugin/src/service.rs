use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

use ember_core::Result;

use crate::context::RuntimeContext;

/// A long-lived singleton (database client, browser, platform connection).
///
/// At most one service per `service_type` is registered at a time.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Registry key, e.g. "browser", "transcription".
    fn service_type(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    async fn start(&self, _ctx: Arc<dyn RuntimeContext>) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    /// Upcast for typed lookup. Implementations return `self`.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Recover the concrete service type.
pub fn downcast_service<T: Service>(service: Arc<dyn Service>) -> Option<Arc<T>> {
    service.into_any().downcast::<T>().ok()
}
