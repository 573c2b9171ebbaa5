//! # ember-config
//!
//! Configuration system for the Ember runtime. Reads from `ember.toml` and
//! `EMBER_*` environment variables, in that precedence order.
//!
//! Supports hot-reload via filesystem watcher.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::EmberConfig;
pub use schema::{ConfigWarning, StorageBackend, WarningSeverity};
