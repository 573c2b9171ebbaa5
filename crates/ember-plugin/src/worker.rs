use async_trait::async_trait;

use ember_core::{Memory, Result, Task};

use crate::context::RuntimeContext;

/// Executes tasks with a matching name.
///
/// Returning [`ember_core::EmberError::TaskAborted`] deletes the task;
/// any other error keeps it for the next attempt.
#[async_trait]
pub trait TaskWorker: Send + Sync {
    /// Matches [`Task::name`].
    fn name(&self) -> &str;

    /// For `await-input` tasks: whether this message answers the task.
    async fn validate(
        &self,
        _ctx: &dyn RuntimeContext,
        _task: &Task,
        _message: Option<&Memory>,
    ) -> Result<bool> {
        Ok(true)
    }

    /// `message` is set when the task was triggered by user input.
    async fn execute(
        &self,
        ctx: &dyn RuntimeContext,
        task: &Task,
        message: Option<&Memory>,
    ) -> Result<()>;
}
