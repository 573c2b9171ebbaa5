use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter, types::Value};
use serde::de::DeserializeOwned;
use tracing::{debug, info};
use uuid::Uuid;

use ember_core::{EmberError, Entity, Memory, MemoryQuery, Result, Room, Task, TaskFilter, World};

use crate::adapter::StorageAdapter;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS memories (
        id TEXT PRIMARY KEY,
        agent_id TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        room_id TEXT NOT NULL,
        table_name TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        body TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_memories_room ON memories(room_id, table_name, created_at);

    CREATE TABLE IF NOT EXISTS entities (
        id TEXT PRIMARY KEY,
        body TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS worlds (
        id TEXT PRIMARY KEY,
        body TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS rooms (
        id TEXT PRIMARY KEY,
        world_id TEXT,
        body TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_rooms_world ON rooms(world_id);

    CREATE TABLE IF NOT EXISTS participants (
        room_id TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        joined_at INTEGER NOT NULL,
        PRIMARY KEY (room_id, entity_id)
    );
    CREATE INDEX IF NOT EXISTS idx_participants_entity ON participants(entity_id);

    CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        room_id TEXT,
        created_at INTEGER NOT NULL,
        body TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_tasks_room ON tasks(room_id);
";

fn db_err(e: rusqlite::Error) -> EmberError {
    EmberError::Storage(e.to_string())
}

fn decode<T: DeserializeOwned>(body: &str) -> Result<T> {
    serde_json::from_str(body).map_err(|e| EmberError::Storage(format!("corrupt row: {e}")))
}

/// SQLite-backed storage. One connection, serialised behind a mutex.
pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        info!(?path, "opening sqlite store");

        let conn = Connection::open(path).map_err(db_err)?;

        // Enable WAL mode for concurrent reads
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for tests).
    pub fn open_in_memory() -> Result<Self> {
        Self::open(Path::new(":memory:"))
    }

    fn bodies(&self, sql: &str, args: Vec<Value>) -> Result<Vec<String>> {
        let db = self.db.lock();
        let mut stmt = db.prepare(sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params_from_iter(args), |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    fn body_by_id(&self, table: &str, id: Uuid) -> Result<Option<String>> {
        let db = self.db.lock();
        db.query_row(
            &format!("SELECT body FROM {table} WHERE id = ?1"),
            params![id.to_string()],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .map_err(db_err)
    }

    fn insert_body(&self, table: &str, id: Uuid, body: &str) -> Result<bool> {
        let db = self.db.lock();
        let rows = db
            .execute(
                &format!("INSERT OR IGNORE INTO {table} (id, body) VALUES (?1, ?2)"),
                params![id.to_string(), body],
            )
            .map_err(db_err)?;
        Ok(rows > 0)
    }

    fn update_body(&self, table: &str, id: Uuid, body: &str) -> Result<()> {
        let db = self.db.lock();
        let rows = db
            .execute(
                &format!("UPDATE {table} SET body = ?2 WHERE id = ?1"),
                params![id.to_string(), body],
            )
            .map_err(db_err)?;
        if rows == 0 {
            return Err(EmberError::NotFound(format!("{table} {id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for SqliteStore {
    async fn init(&self) -> Result<()> {
        self.db.lock().execute_batch(SCHEMA).map_err(db_err)
    }

    async fn close(&self) -> Result<()> {
        let db = self.db.lock();
        // Best effort: in-memory databases have no WAL to checkpoint.
        if let Err(e) = db.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);") {
            debug!(error = %e, "wal checkpoint skipped");
        }
        info!("sqlite store closed");
        Ok(())
    }

    // ── Memories ───────────────────────────────────────────────

    async fn create_memory(&self, memory: &Memory) -> Result<bool> {
        let body = serde_json::to_string(memory)?;
        let db = self.db.lock();
        let rows = db
            .execute(
                "INSERT OR IGNORE INTO memories (id, agent_id, entity_id, room_id, table_name, created_at, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    memory.id.to_string(),
                    memory.agent_id.to_string(),
                    memory.entity_id.to_string(),
                    memory.room_id.to_string(),
                    memory.table,
                    memory.created_at.timestamp_micros(),
                    body,
                ],
            )
            .map_err(db_err)?;
        Ok(rows > 0)
    }

    async fn get_memory(&self, id: Uuid) -> Result<Option<Memory>> {
        self.body_by_id("memories", id)?
            .map(|b| decode(&b))
            .transpose()
    }

    async fn get_memories(&self, query: &MemoryQuery) -> Result<Vec<Memory>> {
        let mut sql = String::from("SELECT body FROM memories WHERE 1 = 1");
        let mut args: Vec<Value> = Vec::new();
        if let Some(room) = query.room_id {
            args.push(Value::Text(room.to_string()));
            sql.push_str(&format!(" AND room_id = ?{}", args.len()));
        }
        if let Some(entity) = query.entity_id {
            args.push(Value::Text(entity.to_string()));
            sql.push_str(&format!(" AND entity_id = ?{}", args.len()));
        }
        if let Some(table) = &query.table {
            args.push(Value::Text(table.clone()));
            sql.push_str(&format!(" AND table_name = ?{}", args.len()));
        }
        if let Some(before) = query.before {
            args.push(Value::Integer(before.timestamp_micros()));
            sql.push_str(&format!(" AND created_at < ?{}", args.len()));
        }
        sql.push_str(" ORDER BY created_at DESC, rowid DESC");
        if let Some(count) = query.count {
            args.push(Value::Integer(count as i64));
            sql.push_str(&format!(" LIMIT ?{}", args.len()));
        }

        self.bodies(&sql, args)?
            .iter()
            .map(|b| decode(b))
            .collect()
    }

    async fn delete_memory(&self, id: Uuid) -> Result<bool> {
        let db = self.db.lock();
        let rows = db
            .execute("DELETE FROM memories WHERE id = ?1", params![id.to_string()])
            .map_err(db_err)?;
        Ok(rows > 0)
    }

    // ── Entities ───────────────────────────────────────────────

    async fn get_entity(&self, id: Uuid) -> Result<Option<Entity>> {
        self.body_by_id("entities", id)?
            .map(|b| decode(&b))
            .transpose()
    }

    async fn create_entity(&self, entity: &Entity) -> Result<bool> {
        self.insert_body("entities", entity.id, &serde_json::to_string(entity)?)
    }

    async fn update_entity(&self, entity: &Entity) -> Result<()> {
        self.update_body("entities", entity.id, &serde_json::to_string(entity)?)
    }

    // ── Rooms & participants ───────────────────────────────────

    async fn get_room(&self, id: Uuid) -> Result<Option<Room>> {
        self.body_by_id("rooms", id)?
            .map(|b| decode(&b))
            .transpose()
    }

    async fn create_room(&self, room: &Room) -> Result<bool> {
        let body = serde_json::to_string(room)?;
        let db = self.db.lock();
        let rows = db
            .execute(
                "INSERT OR IGNORE INTO rooms (id, world_id, body) VALUES (?1, ?2, ?3)",
                params![
                    room.id.to_string(),
                    room.world_id.map(|w| w.to_string()),
                    body
                ],
            )
            .map_err(db_err)?;
        Ok(rows > 0)
    }

    async fn get_rooms_for_world(&self, world_id: Uuid) -> Result<Vec<Room>> {
        self.bodies(
            "SELECT body FROM rooms WHERE world_id = ?1 ORDER BY rowid",
            vec![Value::Text(world_id.to_string())],
        )?
        .iter()
        .map(|b| decode(b))
        .collect()
    }

    async fn add_participant(&self, room_id: Uuid, entity_id: Uuid) -> Result<bool> {
        let db = self.db.lock();
        let rows = db
            .execute(
                "INSERT OR IGNORE INTO participants (room_id, entity_id, joined_at) VALUES (?1, ?2, ?3)",
                params![
                    room_id.to_string(),
                    entity_id.to_string(),
                    chrono::Utc::now().timestamp_micros()
                ],
            )
            .map_err(db_err)?;
        Ok(rows > 0)
    }

    async fn get_participants(&self, room_id: Uuid) -> Result<Vec<Uuid>> {
        let db = self.db.lock();
        let mut stmt = db
            .prepare("SELECT entity_id FROM participants WHERE room_id = ?1 ORDER BY joined_at, rowid")
            .map_err(db_err)?;
        let ids = stmt
            .query_map(params![room_id.to_string()], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .filter_map(|r| r.ok())
            .filter_map(|s| Uuid::parse_str(&s).ok())
            .collect();
        Ok(ids)
    }

    async fn get_rooms_for_entity(&self, entity_id: Uuid) -> Result<Vec<Uuid>> {
        let db = self.db.lock();
        let mut stmt = db
            .prepare("SELECT room_id FROM participants WHERE entity_id = ?1 ORDER BY joined_at, rowid")
            .map_err(db_err)?;
        let ids = stmt
            .query_map(params![entity_id.to_string()], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .filter_map(|r| r.ok())
            .filter_map(|s| Uuid::parse_str(&s).ok())
            .collect();
        Ok(ids)
    }

    // ── Worlds ─────────────────────────────────────────────────

    async fn get_world(&self, id: Uuid) -> Result<Option<World>> {
        self.body_by_id("worlds", id)?
            .map(|b| decode(&b))
            .transpose()
    }

    async fn create_world(&self, world: &World) -> Result<bool> {
        self.insert_body("worlds", world.id, &serde_json::to_string(world)?)
    }

    async fn update_world(&self, world: &World) -> Result<()> {
        self.update_body("worlds", world.id, &serde_json::to_string(world)?)
    }

    // ── Tasks ──────────────────────────────────────────────────

    async fn create_task(&self, task: &Task) -> Result<()> {
        let body = serde_json::to_string(task)?;
        let db = self.db.lock();
        db.execute(
            "INSERT INTO tasks (id, name, room_id, created_at, body) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                task.id.to_string(),
                task.name,
                task.room_id.map(|r| r.to_string()),
                task.created_at.timestamp_micros(),
                body,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        self.body_by_id("tasks", id)?
            .map(|b| decode(&b))
            .transpose()
    }

    async fn get_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut sql = String::from("SELECT body FROM tasks WHERE 1 = 1");
        let mut args: Vec<Value> = Vec::new();
        if let Some(room) = filter.room_id {
            args.push(Value::Text(room.to_string()));
            sql.push_str(&format!(" AND room_id = ?{}", args.len()));
        }
        if let Some(name) = &filter.name {
            args.push(Value::Text(name.clone()));
            sql.push_str(&format!(" AND name = ?{}", args.len()));
        }
        sql.push_str(" ORDER BY created_at, rowid");

        let mut tasks = Vec::new();
        for body in self.bodies(&sql, args)? {
            let task: Task = decode(&body)?;
            // Tag filtering happens here; tags live inside the JSON body.
            if filter.matches(&task) {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        self.update_body("tasks", task.id, &serde_json::to_string(task)?)
    }

    async fn delete_task(&self, id: Uuid) -> Result<bool> {
        let db = self.db.lock();
        let rows = db
            .execute("DELETE FROM tasks WHERE id = ?1", params![id.to_string()])
            .map_err(db_err)?;
        Ok(rows > 0)
    }
}
