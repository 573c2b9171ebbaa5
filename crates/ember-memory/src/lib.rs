//! # ember-memory
//!
//! Persistence for the Ember runtime.
//!
//! - [`StorageAdapter`]: the contract every backend implements (memories,
//!   entities, rooms, participants, worlds and tasks).
//! - [`SqliteStore`]: durable backend on SQLite (WAL mode).
//! - [`InMemoryStore`]: process-local backend for tests and ephemeral agents.

pub mod adapter;
pub mod in_memory;
pub mod sqlite;

pub use adapter::StorageAdapter;
pub use in_memory::InMemoryStore;
pub use sqlite::SqliteStore;
