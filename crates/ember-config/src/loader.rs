use notify::{Event as NotifyEvent, EventKind, RecursiveMode, Watcher};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use ember_core::{EmberError, Result};

use crate::schema::{EmberConfig, StorageBackend};

type ReloadListener = Box<dyn Fn(&EmberConfig) + Send + Sync>;

/// Loads and optionally hot-reloads the Ember configuration.
pub struct ConfigLoader {
    config: Arc<RwLock<EmberConfig>>,
    config_path: PathBuf,
    listeners: Arc<RwLock<Vec<ReloadListener>>>,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > EMBER_CONFIG env > ~/.ember/ember.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("EMBER_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ember")
            .join("ember.toml")
    }

    /// Load the config from disk, falling back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            Self::parse_file(&config_path)?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            EmberConfig::default()
        };

        let config = Self::apply_env_overrides(config);
        Self::check(&config)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
            listeners: Arc::default(),
        })
    }

    /// Wrap an already-built config (tests, embedding).
    pub fn from_config(config: EmberConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            config_path: PathBuf::new(),
            listeners: Arc::default(),
        }
    }

    fn parse_file(path: &Path) -> Result<EmberConfig> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str::<EmberConfig>(&raw).map_err(|e| {
            EmberError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Validate config: log warnings, fail on errors.
    fn check(config: &EmberConfig) -> Result<()> {
        let warnings = config.validate().map_err(EmberError::Config)?;
        for w in &warnings {
            warn!("{}", w);
        }
        Ok(())
    }

    /// Get a read snapshot of the current config.
    pub fn get(&self) -> EmberConfig {
        self.config.read().clone()
    }

    /// Call `listener` with the new config after every successful reload,
    /// whether from [`reload`](Self::reload) or the file watcher.
    pub fn on_reload(&self, listener: impl Fn(&EmberConfig) + Send + Sync + 'static) {
        self.listeners.write().push(Box::new(listener));
    }

    fn install(
        config: &RwLock<EmberConfig>,
        listeners: &RwLock<Vec<ReloadListener>>,
        new_config: EmberConfig,
    ) {
        *config.write() = new_config.clone();
        for listener in listeners.read().iter() {
            listener(&new_config);
        }
    }

    /// Path being watched.
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Apply EMBER_* environment overrides.
    pub fn apply_env_overrides(config: EmberConfig) -> EmberConfig {
        Self::apply_overrides(config, |key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup. Unparseable values are ignored.
    pub fn apply_overrides(
        mut config: EmberConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> EmberConfig {
        if let Some(v) = lookup("EMBER_AGENT_NAME") {
            config.agent.name = v;
        }
        if let Some(v) = lookup("EMBER_AGENT_ID") {
            config.agent.id = Some(v);
        }
        if let Some(n) = lookup("EMBER_MAX_ITERATIONS").and_then(|v| v.parse().ok()) {
            config.agent.max_iterations = n;
        }
        if let Some(v) = lookup("EMBER_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Some(v) = lookup("EMBER_LOG_FORMAT") {
            config.logging.format = v;
        }
        if let Some(v) = lookup("EMBER_DB_PATH") {
            config.storage.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("EMBER_STORAGE_BACKEND") {
            match v.as_str() {
                "sqlite" => config.storage.backend = StorageBackend::Sqlite,
                "memory" => config.storage.backend = StorageBackend::Memory,
                other => warn!(backend = other, "ignoring unknown EMBER_STORAGE_BACKEND"),
            }
        }
        if let Some(ms) = lookup("EMBER_TICK_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            config.scheduler.tick_interval_ms = ms;
        }
        if let Some(v) = lookup("EMBER_DISABLED_PLUGINS") {
            config.plugins.disabled = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        config
    }

    /// Reload the config from disk. An invalid file leaves the current config in place.
    pub fn reload(&self) -> Result<()> {
        if !self.config_path.exists() {
            return Err(EmberError::Config(format!(
                "config file not found: {}",
                self.config_path.display()
            )));
        }
        let new_config = Self::apply_env_overrides(Self::parse_file(&self.config_path)?);
        Self::check(&new_config)?;
        Self::install(&self.config, &self.listeners, new_config);
        info!("configuration reloaded");
        Ok(())
    }

    /// Start a background file watcher that reloads when the config file changes.
    /// Returns a handle to the watcher (must be kept alive for watching to continue).
    pub fn watch(&self) -> Result<notify::RecommendedWatcher> {
        let config = Arc::clone(&self.config);
        let listeners = Arc::clone(&self.listeners);
        let config_path = self.config_path.clone();

        info!(?config_path, "starting config file watcher");

        let path_for_event = config_path.clone();
        let mut watcher = notify::recommended_watcher(
            move |res: std::result::Result<NotifyEvent, notify::Error>| match res {
                Ok(event) => {
                    if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                        return;
                    }
                    let is_our_file = event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == path_for_event.file_name());
                    if !is_our_file {
                        return;
                    }

                    info!("config file changed, reloading");
                    let parsed = ConfigLoader::parse_file(&path_for_event)
                        .map(ConfigLoader::apply_env_overrides)
                        .and_then(|c| ConfigLoader::check(&c).map(|_| c));
                    match parsed {
                        Ok(new_config) => {
                            ConfigLoader::install(&config, &listeners, new_config);
                            info!("configuration hot-reloaded");
                        }
                        Err(e) => {
                            warn!(error = %e, "config file has errors, keeping current config");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "file watcher error");
                }
            },
        )
        .map_err(|e| EmberError::Config(format!("failed to create file watcher: {}", e)))?;

        // Watch the parent directory (some editors create temp files + rename)
        let watch_path = self
            .config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        watcher
            .watch(watch_path, RecursiveMode::NonRecursive)
            .map_err(|e| EmberError::Config(format!("failed to watch config directory: {}", e)))?;

        Ok(watcher)
    }
}
