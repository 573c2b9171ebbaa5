//! # ember-core
//!
//! Core types, traits, and primitives for the Ember agent runtime.
//! This crate defines the shared vocabulary used by every other crate in the workspace:
//! the identity mapper, the Entity/Room/World model, memories, state snapshots,
//! tasks, world settings, the event bus and the unified error type.

pub mod error;
pub mod event;
pub mod identity;
pub mod memory;
pub mod settings;
pub mod state;
pub mod task;
pub mod types;

pub use error::{EmberError, Result};
pub use event::{Event, EventBus, IncomingMessage};
pub use identity::{IdKind, IdentityMapper, resolve};
pub use memory::{Content, Media, Memory, MemoryQuery};
pub use settings::{Setting, WorldSettings};
pub use state::State;
pub use task::{NewTask, Task, TaskFilter, TaskSchedule};
pub use types::*;
