//! # Plugin Loader
//!
//! Plugins load in declared order, each one transactionally:
//!
//! 1. dependencies must already be loaded (at a matching version)
//! 2. required services must be registered
//! 3. the plugin's services are started and registered
//! 4. model handlers are registered and `init` runs
//! 5. actions, providers, evaluators and task workers become visible
//!
//! A failure at any stage undoes the earlier stages for that plugin and the
//! plugin is skipped. The runtime keeps going with the others.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use semver::Version;
use serde::Serialize;
use tracing::{info, warn};

use ember_core::{EmberError, Event, Result};
use ember_llm::ModelRouter;
use ember_plugin::{Plugin, RuntimeContext, Service};

use crate::registry::CapabilityRegistry;
use crate::services::ServiceRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedPlugin {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    /// Names of plugins loaded, in load order.
    pub loaded: Vec<String>,
    pub skipped: Vec<SkippedPlugin>,
}

impl LoadReport {
    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded.iter().any(|n| n == name)
    }
}

pub struct PluginLoader {
    ctx: Arc<dyn RuntimeContext>,
    services: Arc<ServiceRegistry>,
    models: Arc<ModelRouter>,
    registry: Arc<CapabilityRegistry>,
    disabled: Vec<String>,
    loaded: RwLock<HashMap<String, Version>>,
}

impl PluginLoader {
    pub fn new(
        ctx: Arc<dyn RuntimeContext>,
        services: Arc<ServiceRegistry>,
        models: Arc<ModelRouter>,
        registry: Arc<CapabilityRegistry>,
        disabled: Vec<String>,
    ) -> Self {
        Self {
            ctx,
            services,
            models,
            registry,
            disabled,
            loaded: RwLock::new(HashMap::new()),
        }
    }

    /// Versions of everything loaded so far.
    pub fn loaded(&self) -> HashMap<String, Version> {
        self.loaded.read().clone()
    }

    /// Load plugins in order. Never fails; skipped plugins are reported.
    pub async fn load(&self, plugins: &[Arc<dyn Plugin>]) -> LoadReport {
        let mut report = LoadReport::default();
        for plugin in plugins {
            let name = plugin.manifest().name().to_string();
            match self.load_one(plugin.as_ref()).await {
                Ok(version) => {
                    info!(plugin = %name, version = %version, "plugin loaded");
                    self.ctx.publish(Event::PluginLoaded {
                        plugin: name.clone(),
                        version: version.to_string(),
                    });
                    report.loaded.push(name);
                }
                Err(e) => {
                    let reason = e.to_string();
                    warn!(plugin = %name, reason = %reason, "plugin skipped");
                    self.ctx.publish(Event::PluginSkipped {
                        plugin: name.clone(),
                        reason: reason.clone(),
                    });
                    report.skipped.push(SkippedPlugin { name, reason });
                }
            }
        }
        report
    }

    async fn load_one(&self, plugin: &dyn Plugin) -> Result<Version> {
        let manifest = plugin.manifest();
        let name = manifest.name().to_string();
        let plugin_err = |reason: String| EmberError::Plugin {
            plugin: name.clone(),
            reason,
        };

        if self.disabled.iter().any(|d| *d == name) {
            return Err(plugin_err("disabled in configuration".into()));
        }
        if self.loaded.read().contains_key(&name) {
            return Err(plugin_err("already loaded".into()));
        }
        manifest.validate()?;
        let version = manifest.semver()?;

        // ── Dependencies ───
        for dep in manifest.parsed_dependencies()? {
            let satisfied = self
                .loaded
                .read()
                .get(&dep.name)
                .is_some_and(|v| dep.accepts(v));
            if !satisfied {
                let dependency = match &dep.version {
                    Some(req) => format!("{}@{}", dep.name, req),
                    None => dep.name.clone(),
                };
                return Err(EmberError::PluginDependency {
                    plugin: name.clone(),
                    dependency,
                });
            }
        }

        // ── Required services ───
        let services = plugin.services();
        for required in &manifest.required_services {
            let provided = services.iter().any(|s| s.service_type() == required.as_str());
            if !provided && !self.services.has(required) {
                return Err(plugin_err(format!(
                    "required service '{required}' is not registered"
                )));
            }
        }

        // ── Services ───
        let mut started: Vec<Arc<dyn Service>> = Vec::new();
        for service in services {
            let service_type = service.service_type().to_string();
            let outcome = if self.services.has(&service_type) {
                Err(EmberError::DuplicateService(service_type.clone()))
            } else {
                service.start(Arc::clone(&self.ctx)).await
            };
            if let Err(e) = outcome {
                self.rollback_services(&started).await;
                return Err(plugin_err(format!("service '{service_type}' failed: {e}")));
            }
            if let Err(e) = self.services.register(Arc::clone(&service)) {
                if let Err(stop_err) = service.stop().await {
                    warn!(
                        service = %service_type,
                        error = %stop_err,
                        "service failed to stop after registration was refused"
                    );
                }
                self.rollback_services(&started).await;
                return Err(plugin_err(e.to_string()));
            }
            self.ctx.publish(Event::ServiceStarted {
                service_type: service_type.clone(),
            });
            started.push(service);
        }

        // ── Models, then init ───
        let mut handlers = Vec::new();
        for registration in plugin.models() {
            handlers.push(registration.handler.name().to_string());
            self.models.register(registration);
        }
        if let Err(e) = plugin.init(Arc::clone(&self.ctx)).await {
            for handler in &handlers {
                self.models.unregister(handler);
            }
            self.rollback_services(&started).await;
            return Err(plugin_err(format!("init failed: {e}")));
        }

        // ── Capabilities ───
        for action in plugin.actions() {
            self.registry.register_action(action);
        }
        for provider in plugin.providers() {
            self.registry.register_provider(provider);
        }
        for evaluator in plugin.evaluators() {
            self.registry.register_evaluator(evaluator);
        }
        for worker in plugin.task_workers() {
            self.registry.register_worker(worker);
        }

        self.loaded.write().insert(name, version.clone());
        Ok(version)
    }

    /// Stop and unregister services in reverse start order.
    async fn rollback_services(&self, started: &[Arc<dyn Service>]) {
        for service in started.iter().rev() {
            let service_type = service.service_type();
            self.services.unregister(service_type);
            if let Err(e) = service.stop().await {
                warn!(service = %service_type, error = %e, "service failed to stop during rollback");
            }
        }
    }
}
