use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use ember_core::{EmberError, Entity, Memory, MemoryQuery, Result, Room, Task, TaskFilter, World};

use crate::adapter::StorageAdapter;

#[derive(Default)]
struct Tables {
    /// Insertion order doubles as the recency tie-break.
    memories: Vec<Memory>,
    entities: HashMap<Uuid, Entity>,
    rooms: Vec<Room>,
    participants: Vec<(Uuid, Uuid)>,
    worlds: HashMap<Uuid, World>,
    tasks: BTreeMap<Uuid, Task>,
}

/// Process-local storage. Nothing survives a restart.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored memories across all rooms.
    pub fn memory_count(&self) -> usize {
        self.tables.read().memories.len()
    }
}

#[async_trait]
impl StorageAdapter for InMemoryStore {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    // ── Memories ───────────────────────────────────────────────

    async fn create_memory(&self, memory: &Memory) -> Result<bool> {
        let mut t = self.tables.write();
        if t.memories.iter().any(|m| m.id == memory.id) {
            return Ok(false);
        }
        t.memories.push(memory.clone());
        Ok(true)
    }

    async fn get_memory(&self, id: Uuid) -> Result<Option<Memory>> {
        Ok(self.tables.read().memories.iter().find(|m| m.id == id).cloned())
    }

    async fn get_memories(&self, query: &MemoryQuery) -> Result<Vec<Memory>> {
        let t = self.tables.read();
        let mut found: Vec<(usize, &Memory)> = t
            .memories
            .iter()
            .enumerate()
            .filter(|(_, m)| query.matches(m))
            .collect();
        found.sort_by(|(ia, a), (ib, b)| b.created_at.cmp(&a.created_at).then(ib.cmp(ia)));
        let limit = query.count.unwrap_or(usize::MAX);
        Ok(found.into_iter().take(limit).map(|(_, m)| m.clone()).collect())
    }

    async fn delete_memory(&self, id: Uuid) -> Result<bool> {
        let mut t = self.tables.write();
        let before = t.memories.len();
        t.memories.retain(|m| m.id != id);
        Ok(t.memories.len() != before)
    }

    // ── Entities ───────────────────────────────────────────────

    async fn get_entity(&self, id: Uuid) -> Result<Option<Entity>> {
        Ok(self.tables.read().entities.get(&id).cloned())
    }

    async fn create_entity(&self, entity: &Entity) -> Result<bool> {
        let mut t = self.tables.write();
        if t.entities.contains_key(&entity.id) {
            return Ok(false);
        }
        t.entities.insert(entity.id, entity.clone());
        Ok(true)
    }

    async fn update_entity(&self, entity: &Entity) -> Result<()> {
        let mut t = self.tables.write();
        match t.entities.get_mut(&entity.id) {
            Some(slot) => {
                *slot = entity.clone();
                Ok(())
            }
            None => Err(EmberError::NotFound(format!("entities {}", entity.id))),
        }
    }

    // ── Rooms & participants ───────────────────────────────────

    async fn get_room(&self, id: Uuid) -> Result<Option<Room>> {
        Ok(self.tables.read().rooms.iter().find(|r| r.id == id).cloned())
    }

    async fn create_room(&self, room: &Room) -> Result<bool> {
        let mut t = self.tables.write();
        if t.rooms.iter().any(|r| r.id == room.id) {
            return Ok(false);
        }
        t.rooms.push(room.clone());
        Ok(true)
    }

    async fn get_rooms_for_world(&self, world_id: Uuid) -> Result<Vec<Room>> {
        Ok(self
            .tables
            .read()
            .rooms
            .iter()
            .filter(|r| r.world_id == Some(world_id))
            .cloned()
            .collect())
    }

    async fn add_participant(&self, room_id: Uuid, entity_id: Uuid) -> Result<bool> {
        let mut t = self.tables.write();
        if t.participants.contains(&(room_id, entity_id)) {
            return Ok(false);
        }
        t.participants.push((room_id, entity_id));
        Ok(true)
    }

    async fn get_participants(&self, room_id: Uuid) -> Result<Vec<Uuid>> {
        Ok(self
            .tables
            .read()
            .participants
            .iter()
            .filter(|(r, _)| *r == room_id)
            .map(|(_, e)| *e)
            .collect())
    }

    async fn get_rooms_for_entity(&self, entity_id: Uuid) -> Result<Vec<Uuid>> {
        Ok(self
            .tables
            .read()
            .participants
            .iter()
            .filter(|(_, e)| *e == entity_id)
            .map(|(r, _)| *r)
            .collect())
    }

    // ── Worlds ─────────────────────────────────────────────────

    async fn get_world(&self, id: Uuid) -> Result<Option<World>> {
        Ok(self.tables.read().worlds.get(&id).cloned())
    }

    async fn create_world(&self, world: &World) -> Result<bool> {
        let mut t = self.tables.write();
        if t.worlds.contains_key(&world.id) {
            return Ok(false);
        }
        t.worlds.insert(world.id, world.clone());
        Ok(true)
    }

    async fn update_world(&self, world: &World) -> Result<()> {
        let mut t = self.tables.write();
        match t.worlds.get_mut(&world.id) {
            Some(slot) => {
                *slot = world.clone();
                Ok(())
            }
            None => Err(EmberError::NotFound(format!("worlds {}", world.id))),
        }
    }

    // ── Tasks ──────────────────────────────────────────────────

    async fn create_task(&self, task: &Task) -> Result<()> {
        let mut t = self.tables.write();
        if t.tasks.contains_key(&task.id) {
            return Err(EmberError::Storage(format!("task {} already exists", task.id)));
        }
        t.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        Ok(self.tables.read().tasks.get(&id).cloned())
    }

    async fn get_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let t = self.tables.read();
        let mut tasks: Vec<Task> = t.tasks.values().filter(|task| filter.matches(task)).cloned().collect();
        tasks.sort_by_key(|task| task.created_at);
        Ok(tasks)
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        let mut t = self.tables.write();
        match t.tasks.get_mut(&task.id) {
            Some(slot) => {
                *slot = task.clone();
                Ok(())
            }
            None => Err(EmberError::NotFound(format!("tasks {}", task.id))),
        }
    }

    async fn delete_task(&self, id: Uuid) -> Result<bool> {
        Ok(self.tables.write().tasks.remove(&id).is_some())
    }
}
