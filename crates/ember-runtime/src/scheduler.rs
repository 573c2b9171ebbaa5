//! # Task Scheduler
//!
//! Tasks live in storage and are executed by the [`TaskWorker`] registered
//! under the task's name. Tags decide how a task is picked up:
//!
//! - `queue`: checked on every tick and run when due.
//! - `repeat`: re-armed after each run instead of being deleted.
//! - `immediate`: a repeating task fires on its first tick.
//! - `await-input`: run once by the next message in the task's room.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ember_core::task::{TAG_AWAIT_INPUT, TAG_IMMEDIATE, TAG_QUEUE};
use ember_core::{EmberError, Event, Memory, NewTask, Result, Task, TaskFilter, TaskSchedule};
use ember_plugin::{RuntimeContext, TaskWorker};

use crate::guard::guarded;
use crate::registry::CapabilityRegistry;

/// Reject schedules that could never fire.
pub fn validate_schedule(schedule: &TaskSchedule) -> Result<()> {
    match schedule {
        TaskSchedule::Cron { expression } => Schedule::from_str(expression)
            .map(|_| ())
            .map_err(|e| EmberError::InvalidSchedule(format!("'{expression}': {e}"))),
        TaskSchedule::Interval { every_ms: 0 } => Err(EmberError::InvalidSchedule(
            "interval must be at least 1ms".into(),
        )),
        _ => Ok(()),
    }
}

/// Whether a queued task should run at `now`. The last run is `updated_at`.
pub fn is_due(task: &Task, now: DateTime<Utc>) -> bool {
    let first_run_now = task.run_count == 0 && task.has_tag(TAG_IMMEDIATE);
    match &task.schedule {
        TaskSchedule::Immediate => true,
        TaskSchedule::Once { fire_at } => now >= *fire_at,
        TaskSchedule::Interval { every_ms } => {
            let every = i64::try_from(*every_ms).unwrap_or(i64::MAX);
            first_run_now || (now - task.updated_at).num_milliseconds() >= every
        }
        TaskSchedule::Cron { expression } => {
            if first_run_now {
                return true;
            }
            match Schedule::from_str(expression) {
                Ok(schedule) => schedule
                    .after(&task.updated_at)
                    .take(1)
                    .next()
                    .is_some_and(|next| next <= now),
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "invalid cron expression, task never due");
                    false
                }
            }
        }
    }
}

pub struct TaskScheduler {
    ctx: Arc<dyn RuntimeContext>,
    registry: Arc<CapabilityRegistry>,
    task_timeout: Duration,
    tick_interval: Duration,
}

impl TaskScheduler {
    pub fn new(
        ctx: Arc<dyn RuntimeContext>,
        registry: Arc<CapabilityRegistry>,
        task_timeout: Duration,
        tick_interval: Duration,
    ) -> Self {
        Self {
            ctx,
            registry,
            task_timeout,
            tick_interval,
        }
    }

    // ── Task management ────────────────────────────────────────

    /// Validate and persist a task.
    pub async fn create_task(&self, task: NewTask) -> Result<Uuid> {
        self.ctx.create_task(task).await
    }

    pub async fn get_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        self.ctx.storage().get_tasks(filter).await
    }

    pub async fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        self.ctx.storage().get_task(id).await
    }

    pub async fn delete_task(&self, id: Uuid) -> Result<bool> {
        self.ctx.storage().delete_task(id).await
    }

    pub fn register_worker(&self, worker: Arc<dyn TaskWorker>) -> bool {
        self.registry.register_worker(worker)
    }

    // ── Execution ──────────────────────────────────────────────

    /// Run every due `queue` task once. Returns how many ran.
    pub async fn tick(&self) -> Result<usize> {
        let now = Utc::now();
        let tasks = self.get_tasks(&TaskFilter::tagged(TAG_QUEUE)).await?;
        let mut executed = 0;
        for task in tasks {
            if task.awaits_input() || !is_due(&task, now) {
                continue;
            }
            let Some(worker) = self.registry.worker(&task.name) else {
                debug!(task_id = %task.id, name = %task.name, "no worker registered, skipping");
                continue;
            };
            self.execute(&task, worker, None, false).await;
            executed += 1;
        }
        Ok(executed)
    }

    /// Offer `message` to the `await-input` tasks of its room. Each task is
    /// consumed by at most one message: the storage delete is the claim.
    pub async fn handle_input(&self, message: &Memory) -> Result<usize> {
        let filter = TaskFilter::tagged(TAG_AWAIT_INPUT).in_room(message.room_id);
        let tasks = self.get_tasks(&filter).await?;
        let mut executed = 0;
        for task in tasks {
            let Some(worker) = self.registry.worker(&task.name) else {
                debug!(task_id = %task.id, name = %task.name, "no worker registered, skipping");
                continue;
            };
            let matches = guarded(
                "task worker",
                &task.name,
                self.task_timeout,
                worker.validate(self.ctx.as_ref(), &task, Some(message)),
            )
            .await;
            match matches {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "task input validation failed");
                    continue;
                }
            }
            if !self.delete_task(task.id).await? {
                debug!(task_id = %task.id, "task already claimed by another message");
                continue;
            }
            self.execute(&task, worker, Some(message), true).await;
            executed += 1;
        }
        Ok(executed)
    }

    /// Run the worker and settle the task: delete, re-arm or keep.
    async fn execute(
        &self,
        task: &Task,
        worker: Arc<dyn TaskWorker>,
        message: Option<&Memory>,
        claimed: bool,
    ) -> bool {
        let result = guarded(
            "task worker",
            &task.name,
            self.task_timeout,
            worker.execute(self.ctx.as_ref(), task, message),
        )
        .await;
        let storage = self.ctx.storage();
        let success = result.is_ok();

        let settled = match result {
            Ok(()) => {
                info!(task_id = %task.id, name = %task.name, "task executed");
                if claimed {
                    Ok(())
                } else if task.is_repeating() {
                    let mut rearmed = task.clone();
                    rearmed.updated_at = Utc::now();
                    rearmed.run_count += 1;
                    storage.update_task(&rearmed).await
                } else {
                    storage.delete_task(task.id).await.map(|_| ())
                }
            }
            Err(e) if e.is_permanent_task_failure() => {
                warn!(task_id = %task.id, name = %task.name, error = %e, "task aborted, deleting");
                if claimed {
                    Ok(())
                } else {
                    storage.delete_task(task.id).await.map(|_| ())
                }
            }
            Err(e) => {
                warn!(task_id = %task.id, name = %task.name, error = %e, "task failed, keeping it");
                if task.is_repeating() && !claimed {
                    let mut rearmed = task.clone();
                    rearmed.updated_at = Utc::now();
                    storage.update_task(&rearmed).await
                } else {
                    Ok(())
                }
            }
        };
        if let Err(e) = settled {
            warn!(task_id = %task.id, error = %e, "failed to update task after execution");
        }

        self.ctx.publish(Event::TaskExecuted {
            task_id: task.id,
            name: task.name.clone(),
            success,
        });
        success
    }

    /// Tick until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(tick_ms = self.tick_interval.as_millis() as u64, "task scheduler started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "scheduler tick failed");
                    }
                }
            }
        }
        info!("task scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::task::TAG_REPEAT;

    fn task(schedule: TaskSchedule, tags: &[&str]) -> Task {
        let mut new = NewTask::new("t").schedule(schedule);
        for tag in tags {
            new = new.tag(tag);
        }
        new.into_task()
    }

    #[test]
    fn test_interval_waits_unless_immediate() {
        let now = Utc::now();
        let every = TaskSchedule::Interval { every_ms: 60_000 };
        assert!(!is_due(&task(every.clone(), &[TAG_QUEUE, TAG_REPEAT]), now));
        assert!(is_due(
            &task(every.clone(), &[TAG_QUEUE, TAG_REPEAT, TAG_IMMEDIATE]),
            now
        ));
        let mut ran = task(every, &[TAG_QUEUE, TAG_REPEAT, TAG_IMMEDIATE]);
        ran.run_count = 1;
        assert!(!is_due(&ran, now));
        assert!(is_due(&ran, now + chrono::Duration::seconds(61)));
    }

    #[test]
    fn test_once_due_at_fire_time() {
        let now = Utc::now();
        let t = task(
            TaskSchedule::Once {
                fire_at: now + chrono::Duration::seconds(5),
            },
            &[TAG_QUEUE],
        );
        assert!(!is_due(&t, now));
        assert!(is_due(&t, now + chrono::Duration::seconds(5)));
    }

    #[test]
    fn test_cron_due_after_next_fire() {
        let t = task(
            TaskSchedule::Cron {
                expression: "0 * * * * *".into(),
            },
            &[TAG_QUEUE, TAG_REPEAT],
        );
        assert!(is_due(&t, t.updated_at + chrono::Duration::seconds(61)));
    }

    #[test]
    fn test_validate_schedule() {
        assert!(validate_schedule(&TaskSchedule::Immediate).is_ok());
        assert!(validate_schedule(&TaskSchedule::Interval { every_ms: 0 }).is_err());
        assert!(
            validate_schedule(&TaskSchedule::Cron {
                expression: "not cron".into()
            })
            .is_err()
        );
        assert!(
            validate_schedule(&TaskSchedule::Cron {
                expression: "0 */5 * * * *".into()
            })
            .is_ok()
        );
    }
}
