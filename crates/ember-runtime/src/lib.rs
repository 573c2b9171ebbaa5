//! # ember-runtime
//!
//! The agent runtime: everything between an inbound platform message and the
//! agent's reply.
//!
//! ## Architecture
//!
//! ```text
//!              ┌──────────────┐
//!              │   Adapters   │  ← discord, cli, api, ...
//!              └──────┬───────┘
//!                     │ IncomingMessage (event bus)
//!                     ▼
//!              ┌──────────────┐
//!              │   Ingest     │  1. Resolve entity / room / world
//!              │              │  2. Store the message (idempotent)
//!              │              │  3. Match await-input tasks
//!              └──────┬───────┘
//!                     ▼
//!              ┌──────────────┐
//!              │ Multi-Step   │  Decide → Execute → … → Summarize
//!              │    Loop      │
//!              └──────┬───────┘
//!                     │
//!         ┌───────────┼────────────┐
//!         ▼           ▼            ▼
//!    ┌─────────┐ ┌──────────┐ ┌──────────┐
//!    │  State  │ │ Pipeline │ │  Models  │
//!    │Composer │ │ (actions,│ │  Router  │
//!    └─────────┘ │ evals)   │ └──────────┘
//!                └──────────┘
//! ```
//!
//! Reply, evaluation and lifecycle events go back out on the event bus.
//! The [`TaskScheduler`] runs deferred work on its own tick.

pub mod agent;
pub mod connection;
pub mod context;
pub(crate) mod guard;
pub mod ingest;
pub mod loader;
pub mod multi_step;
pub mod pipeline;
pub mod registry;
pub mod scheduler;
pub mod services;
pub mod state;

pub use agent::AgentRuntime;
pub use connection::{Connection, ensure_connection};
pub use context::{AgentContext, SettingsCache};
pub use ingest::{MessageProcessor, ProcessReport, RoomSink};
pub use loader::{LoadReport, PluginLoader, SkippedPlugin};
pub use multi_step::{
    CycleOutcome, Decision, LoopState, MultiStepLoop, ResponseMode, StepSignal, TrajectoryEntry,
    parse_decision, transition,
};
pub use pipeline::{ActionOutcome, CapabilityPipeline, EvaluatorOutcome};
pub use registry::CapabilityRegistry;
pub use scheduler::TaskScheduler;
pub use services::ServiceRegistry;
pub use state::{ProviderOutcome, StateCache, StateComposer};
