use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Picked up by the scheduler's periodic tick.
pub const TAG_QUEUE: &str = "queue";
/// Re-armed after every execution; never auto-deleted.
pub const TAG_REPEAT: &str = "repeat";
/// Repeating task that fires on its first tick instead of waiting an interval.
pub const TAG_IMMEDIATE: &str = "immediate";
/// Consumed by the next message in the same room.
pub const TAG_AWAIT_INPUT: &str = "await-input";

/// When a task should fire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskSchedule {
    /// Due as soon as the scheduler sees it.
    #[default]
    Immediate,
    /// Due once at the given time.
    Once { fire_at: DateTime<Utc> },
    /// Due every `every_ms` milliseconds.
    Interval { every_ms: u64 },
    /// Due on a cron expression (seconds field included).
    Cron { expression: String },
}

/// A named, persisted unit of deferred work. The worker is looked up by `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub room_id: Option<Uuid>,
    pub world_id: Option<Uuid>,
    pub entity_id: Option<Uuid>,
    pub tags: Vec<String>,
    pub schedule: TaskSchedule,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    /// Last execution (or creation, if never run).
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub run_count: u64,
}

impl Task {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn is_repeating(&self) -> bool {
        self.has_tag(TAG_REPEAT)
    }

    pub fn awaits_input(&self) -> bool {
        self.has_tag(TAG_AWAIT_INPUT)
    }
}

/// Everything needed to create a task; id and timestamps are assigned on creation.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub name: String,
    pub description: String,
    pub room_id: Option<Uuid>,
    pub world_id: Option<Uuid>,
    pub entity_id: Option<Uuid>,
    pub tags: Vec<String>,
    pub schedule: TaskSchedule,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl NewTask {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn tag(mut self, tag: &str) -> Self {
        if !self.tags.iter().any(|t| t == tag) {
            self.tags.push(tag.to_string());
        }
        self
    }

    pub fn room(mut self, room_id: Uuid) -> Self {
        self.room_id = Some(room_id);
        self
    }

    pub fn schedule(mut self, schedule: TaskSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn into_task(self) -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::new_v4(),
            name: self.name,
            description: self.description,
            room_id: self.room_id,
            world_id: self.world_id,
            entity_id: self.entity_id,
            tags: self.tags,
            schedule: self.schedule,
            metadata: self.metadata,
            created_at: now,
            updated_at: now,
            run_count: 0,
        }
    }
}

/// Task query. Every set field must match; `tags` requires all listed tags.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub room_id: Option<Uuid>,
    pub tags: Vec<String>,
    pub name: Option<String>,
}

impl TaskFilter {
    pub fn tagged(tag: &str) -> Self {
        Self {
            tags: vec![tag.to_string()],
            ..Default::default()
        }
    }

    pub fn in_room(mut self, room_id: Uuid) -> Self {
        self.room_id = Some(room_id);
        self
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.room_id.is_none_or(|r| task.room_id == Some(r))
            && self.name.as_deref().is_none_or(|n| task.name == n)
            && self.tags.iter().all(|t| task.has_tag(t))
    }
}
