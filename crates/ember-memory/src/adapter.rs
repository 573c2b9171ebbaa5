use async_trait::async_trait;
use uuid::Uuid;

use ember_core::{Entity, Memory, MemoryQuery, Result, Room, Task, TaskFilter, World};

/// Everything the runtime persists.
///
/// Implementations serialise writes internally; callers share one
/// `Arc<dyn StorageAdapter>` across tasks. Errors are surfaced as
/// [`ember_core::EmberError::Storage`] and never retried here.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Prepare the backend (create tables, open files).
    async fn init(&self) -> Result<()>;

    /// Flush and release resources. Further calls may fail.
    async fn close(&self) -> Result<()>;

    // ── Memories ───────────────────────────────────────────────

    /// Insert a memory unless one with the same id exists.
    /// Returns `false` for a duplicate.
    async fn create_memory(&self, memory: &Memory) -> Result<bool>;

    async fn get_memory(&self, id: Uuid) -> Result<Option<Memory>>;

    /// Memories matching the query, newest first.
    async fn get_memories(&self, query: &MemoryQuery) -> Result<Vec<Memory>>;

    async fn delete_memory(&self, id: Uuid) -> Result<bool>;

    // ── Entities ───────────────────────────────────────────────

    async fn get_entity(&self, id: Uuid) -> Result<Option<Entity>>;

    /// Insert an entity unless it exists. Returns `false` if it already did.
    async fn create_entity(&self, entity: &Entity) -> Result<bool>;

    async fn update_entity(&self, entity: &Entity) -> Result<()>;

    // ── Rooms & participants ───────────────────────────────────

    async fn get_room(&self, id: Uuid) -> Result<Option<Room>>;

    async fn create_room(&self, room: &Room) -> Result<bool>;

    async fn get_rooms_for_world(&self, world_id: Uuid) -> Result<Vec<Room>>;

    /// Returns `false` if the entity was already a participant.
    async fn add_participant(&self, room_id: Uuid, entity_id: Uuid) -> Result<bool>;

    async fn get_participants(&self, room_id: Uuid) -> Result<Vec<Uuid>>;

    async fn get_rooms_for_entity(&self, entity_id: Uuid) -> Result<Vec<Uuid>>;

    // ── Worlds ─────────────────────────────────────────────────

    async fn get_world(&self, id: Uuid) -> Result<Option<World>>;

    async fn create_world(&self, world: &World) -> Result<bool>;

    async fn update_world(&self, world: &World) -> Result<()>;

    // ── Tasks ──────────────────────────────────────────────────

    async fn create_task(&self, task: &Task) -> Result<()>;

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>>;

    /// Tasks matching the filter, oldest first.
    async fn get_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>>;

    async fn update_task(&self, task: &Task) -> Result<()>;

    /// Delete a task. Returns `true` only for the caller that removed it,
    /// which makes the delete usable as a claim.
    async fn delete_task(&self, id: Uuid) -> Result<bool>;
}
