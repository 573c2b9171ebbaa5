use thiserror::Error;

/// Unified error type for the entire Ember runtime.
#[derive(Error, Debug)]
pub enum EmberError {
    // ── Capability errors ──────────────────────────────────────
    #[error("provider failed: {provider}: {reason}")]
    Provider { provider: String, reason: String },

    #[error("action failed: {action}: {reason}")]
    Action { action: String, reason: String },

    #[error("action not found: {0}")]
    ActionNotFound(String),

    #[error("evaluator failed: {evaluator}: {reason}")]
    Evaluator { evaluator: String, reason: String },

    #[error("{kind} '{name}' panicked")]
    CapabilityPanicked { kind: &'static str, name: String },

    #[error("{operation} timed out after {ms}ms")]
    Timeout { operation: String, ms: u64 },

    // ── Model errors ───────────────────────────────────────────
    #[error("model output could not be parsed: {0}")]
    Parse(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("model rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("no model handler registered for {0}")]
    ModelNotFound(String),

    // ── Service errors ─────────────────────────────────────────
    #[error("service already registered: {0}")]
    DuplicateService(String),

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("service error: {service}: {reason}")]
    Service { service: String, reason: String },

    // ── Storage errors ─────────────────────────────────────────
    #[error("storage error: {0}")]
    Storage(String),

    #[error("not found: {0}")]
    NotFound(String),

    // ── Plugin errors ──────────────────────────────────────────
    #[error("plugin error: {plugin}: {reason}")]
    Plugin { plugin: String, reason: String },

    #[error("plugin {plugin} requires {dependency}, which is not loaded")]
    PluginDependency { plugin: String, dependency: String },

    // ── Task errors ────────────────────────────────────────────
    #[error("task failed: {task}: {reason}")]
    TaskFailed { task: String, reason: String },

    /// Raised by a task worker to signal that the task must not run again.
    #[error("task aborted permanently: {task}: {reason}")]
    TaskAborted { task: String, reason: String },

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    // ── Settings errors ────────────────────────────────────────
    #[error("unknown setting: {0}")]
    UnknownSetting(String),

    #[error("setting {setting} depends on unset {dependency}")]
    SettingDependency { setting: String, dependency: String },

    // ── Config errors ──────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    #[error("cancelled")]
    Cancelled,

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl EmberError {
    /// Whether a task worker asked for its task to be removed.
    pub fn is_permanent_task_failure(&self) -> bool {
        matches!(self, EmberError::TaskAborted { .. })
    }

    /// Transient model failures worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            EmberError::RateLimited { .. } => true,
            EmberError::Model(msg) => {
                msg.starts_with("HTTP 429")
                    || msg.starts_with("HTTP 500")
                    || msg.starts_with("HTTP 502")
                    || msg.starts_with("HTTP 503")
                    || msg.contains("timed out")
                    || msg.contains("connection reset")
                    || msg.contains("overloaded")
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, EmberError>;
