//! # ember-llm
//!
//! Model invocation for the Ember runtime. Plugins register [`ModelHandler`]s
//! per [`ModelKind`] with a priority; the [`ModelRouter`] picks the highest
//! priority handler, retries transient failures with exponential backoff and
//! fails over to the next handler when one keeps failing.

pub mod mock;
pub mod model;
pub mod router;

pub use mock::{MockModel, MockReply};
pub use model::{ModelHandler, ModelKind, ModelOutput, ModelRegistration, ModelRequest};
pub use router::ModelRouter;
