use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use ember_core::identity::agent_id_from_name;

/// Root configuration — maps to `ember.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EmberConfig {
    pub agent: AgentConfig,
    pub state: StateConfig,
    pub scheduler: SchedulerConfig,
    pub storage: StorageConfig,
    pub plugins: PluginsConfig,
    pub events: EventsConfig,
    pub logging: LoggingConfig,
}

// ── Agent ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Character name; also seeds the agent id when `id` is unset.
    pub name: String,
    /// Explicit agent UUID.
    pub id: Option<String>,
    /// System prompt passed to every model call.
    pub system_prompt: Option<String>,
    /// Decide/execute pairs per cycle before the loop is forced to summarize.
    pub max_iterations: u32,
    /// Recent room messages included in decision prompts.
    pub conversation_length: usize,
    pub model_timeout_secs: u64,
    pub provider_timeout_secs: u64,
    pub action_timeout_secs: u64,
    pub evaluator_timeout_secs: u64,
    pub task_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "Ember".into(),
            id: None,
            system_prompt: None,
            max_iterations: 6,
            conversation_length: 32,
            model_timeout_secs: 120,
            provider_timeout_secs: 10,
            action_timeout_secs: 60,
            evaluator_timeout_secs: 30,
            task_timeout_secs: 120,
        }
    }
}

impl AgentConfig {
    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model_timeout_secs)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs)
    }

    pub fn evaluator_timeout(&self) -> Duration {
        Duration::from_secs(self.evaluator_timeout_secs)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}

// ── State ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Lifetime of cached provider results for one message.
    pub cache_ttl_secs: u64,
    /// Messages kept in the state cache; oldest evicted first. 0 disables caching.
    pub cache_max_entries: usize,
    /// Lifetime of cached world settings.
    pub settings_cache_ttl_secs: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 300,
            cache_max_entries: 1000,
            settings_cache_ttl_secs: 60,
        }
    }
}

// ── Scheduler ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub tick_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_ms: 1000,
        }
    }
}

// ── Storage ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// SQLite file. Relative paths resolve under `~/.ember/`.
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            db_path: PathBuf::from("ember.db"),
        }
    }
}

impl StorageConfig {
    pub fn resolved_db_path(&self) -> PathBuf {
        if self.db_path.is_absolute() {
            self.db_path.clone()
        } else {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".ember")
                .join(&self.db_path)
        }
    }
}

// ── Plugins ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Plugin names that are never loaded.
    pub disabled: Vec<String>,
}

impl PluginsConfig {
    pub fn is_disabled(&self, name: &str) -> bool {
        self.disabled.iter().any(|d| d == name)
    }
}

// ── Events ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Broadcast buffer for outbound and lifecycle events.
    pub capacity: usize,
    /// Queue depth for inbound messages awaiting the runtime.
    pub inbound_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: 4096,
            inbound_capacity: 1024,
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Output format: "pretty", "json", "compact".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

// ── Validation ─────────────────────────────────────────────────

/// A single config validation issue.
#[derive(Debug)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self.severity {
            WarningSeverity::Error => "error",
            WarningSeverity::Warning => "warning",
            WarningSeverity::Info => "note",
        };
        write!(f, "{} {}: {}", label, self.field, self.message)?;
        if let Some(ref h) = self.hint {
            write!(f, " ({})", h)?;
        }
        Ok(())
    }
}

impl EmberConfig {
    /// The configured agent id, or one derived from the agent name.
    pub fn agent_id(&self) -> Uuid {
        self.agent
            .id
            .as_deref()
            .and_then(|s| Uuid::parse_str(s).ok())
            .unwrap_or_else(|| agent_id_from_name(&self.agent.name))
    }

    /// Validate the config and return a list of warnings/errors.
    /// Returns `Err` with all messages joined if any severity is Error.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();

        // ── Agent identity ───
        if self.agent.name.trim().is_empty() {
            warnings.push(ConfigWarning {
                field: "agent.name".into(),
                message: "agent name is empty".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 'Ember'".into()),
            });
        }
        if let Some(id) = &self.agent.id
            && Uuid::parse_str(id).is_err()
        {
            warnings.push(ConfigWarning {
                field: "agent.id".into(),
                message: format!("'{}' is not a UUID", id),
                severity: WarningSeverity::Error,
                hint: Some("Remove it to derive the id from the agent name".into()),
            });
        }

        // ── Loop ceiling ───
        if self.agent.max_iterations == 0 {
            warnings.push(ConfigWarning {
                field: "agent.max_iterations".into(),
                message: "max_iterations is 0, the agent could never act".into(),
                severity: WarningSeverity::Error,
                hint: Some("The default is 6".into()),
            });
        } else if self.agent.max_iterations > 50 {
            warnings.push(ConfigWarning {
                field: "agent.max_iterations".into(),
                message: format!("{} iterations per message is very high", self.agent.max_iterations),
                severity: WarningSeverity::Warning,
                hint: Some("Every iteration is at least one model call".into()),
            });
        }

        // ── Timeouts ───
        for (field, secs) in [
            ("agent.model_timeout_secs", self.agent.model_timeout_secs),
            ("agent.provider_timeout_secs", self.agent.provider_timeout_secs),
            ("agent.action_timeout_secs", self.agent.action_timeout_secs),
            ("agent.evaluator_timeout_secs", self.agent.evaluator_timeout_secs),
            ("agent.task_timeout_secs", self.agent.task_timeout_secs),
        ] {
            if secs == 0 {
                warnings.push(ConfigWarning {
                    field: field.into(),
                    message: "timeout is 0, every call would time out".into(),
                    severity: WarningSeverity::Error,
                    hint: None,
                });
            }
        }

        // ── State cache ───
        if self.state.cache_max_entries == 0 {
            warnings.push(ConfigWarning {
                field: "state.cache_max_entries".into(),
                message: "state caching is disabled".into(),
                severity: WarningSeverity::Info,
                hint: None,
            });
        }

        // ── Scheduler ───
        if self.scheduler.enabled && self.scheduler.tick_interval_ms < 10 {
            warnings.push(ConfigWarning {
                field: "scheduler.tick_interval_ms".into(),
                message: format!("tick interval {}ms is too short", self.scheduler.tick_interval_ms),
                severity: WarningSeverity::Error,
                hint: Some("Use at least 10ms; the default is 1000ms".into()),
            });
        }

        // ── Storage ───
        if self.storage.backend == StorageBackend::Sqlite
            && self.storage.db_path.as_os_str().is_empty()
        {
            warnings.push(ConfigWarning {
                field: "storage.db_path".into(),
                message: "db_path is empty".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 'ember.db'".into()),
            });
        }
        if self.storage.backend == StorageBackend::Memory {
            warnings.push(ConfigWarning {
                field: "storage.backend".into(),
                message: "in-memory storage, nothing survives a restart".into(),
                severity: WarningSeverity::Info,
                hint: None,
            });
        }

        // ── Events ───
        if self.events.capacity == 0 || self.events.inbound_capacity == 0 {
            warnings.push(ConfigWarning {
                field: "events".into(),
                message: "event channel capacity must be positive".into(),
                severity: WarningSeverity::Error,
                hint: None,
            });
        }

        // ── Logging ───
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.level".into(),
                message: format!("unknown log level '{}'", self.logging.level),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_levels.join(", "))),
            });
        }
        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.format".into(),
                message: format!("unknown log format '{}'", self.logging.format),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_formats.join(", "))),
            });
        }

        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| format!("{}: {}", w.field, w.message))
            .collect();

        if !errors.is_empty() {
            return Err(format!("Configuration errors:\n  - {}", errors.join("\n  - ")));
        }

        Ok(warnings)
    }
}
