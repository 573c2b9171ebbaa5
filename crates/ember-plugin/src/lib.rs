//! # ember-plugin
//!
//! Contracts between the Ember runtime and the plugins that extend it.
//!
//! A plugin is a descriptor bundling capabilities:
//!
//! - **Actions**: things the agent can do in response to a message.
//! - **Providers**: contributors of context to the per-cycle [`State`](ember_core::State).
//! - **Evaluators**: post-response judgments.
//! - **Services**: long-lived singletons with a start/stop lifecycle.
//! - **Task workers**: executors for deferred [`Task`](ember_core::Task)s.
//! - **Model handlers**: backends for [`ModelKind`](ember_llm::ModelKind)s.
//!
//! ## Plugin Manifest
//!
//! Each plugin describes itself with a manifest, parseable from `plugin.toml`:
//!
//! ```toml
//! dependencies = ["sql@^1.0"]
//! required_services = ["browser"]
//!
//! [plugin]
//! name = "web-search"
//! version = "1.0.0"
//! description = "Search the web"
//! ```

pub mod capability;
pub mod context;
pub mod manifest;
pub mod plugin;
pub mod service;
pub mod worker;

pub use capability::{
    Action, ActionResult, EvaluationResult, Evaluator, Provider, ProviderResult,
};
pub use context::{CollectingSink, ResponseSink, RuntimeContext};
pub use manifest::{PluginDependency, PluginManifest, PluginMeta};
pub use plugin::Plugin;
pub use service::{Service, downcast_service};
pub use worker::TaskWorker;
