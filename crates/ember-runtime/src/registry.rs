//! Name-keyed tables of the capabilities contributed by plugins.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use ember_plugin::{Action, Evaluator, Provider, TaskWorker};

/// Canonical form for name matching: lowercase, without `_`, `-` or spaces.
pub fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '_' | '-' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Actions, providers, evaluators and task workers, each in registration order.
///
/// Names are unique per table; a later registration under a taken name is
/// rejected with a warning.
#[derive(Default)]
pub struct CapabilityRegistry {
    actions: RwLock<Vec<Arc<dyn Action>>>,
    providers: RwLock<Vec<Arc<dyn Provider>>>,
    evaluators: RwLock<Vec<Arc<dyn Evaluator>>>,
    workers: RwLock<Vec<Arc<dyn TaskWorker>>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Registration ───────────────────────────────────────────

    pub fn register_action(&self, action: Arc<dyn Action>) -> bool {
        let mut actions = self.actions.write();
        if actions.iter().any(|a| a.name() == action.name()) {
            warn!(action = action.name(), "duplicate action name, keeping the first");
            return false;
        }
        debug!(action = action.name(), "action registered");
        actions.push(action);
        true
    }

    pub fn register_provider(&self, provider: Arc<dyn Provider>) -> bool {
        let mut providers = self.providers.write();
        if providers.iter().any(|p| p.name() == provider.name()) {
            warn!(provider = provider.name(), "duplicate provider name, keeping the first");
            return false;
        }
        debug!(provider = provider.name(), "provider registered");
        providers.push(provider);
        true
    }

    pub fn register_evaluator(&self, evaluator: Arc<dyn Evaluator>) -> bool {
        let mut evaluators = self.evaluators.write();
        if evaluators.iter().any(|e| e.name() == evaluator.name()) {
            warn!(evaluator = evaluator.name(), "duplicate evaluator name, keeping the first");
            return false;
        }
        debug!(evaluator = evaluator.name(), "evaluator registered");
        evaluators.push(evaluator);
        true
    }

    pub fn register_worker(&self, worker: Arc<dyn TaskWorker>) -> bool {
        let mut workers = self.workers.write();
        if workers.iter().any(|w| w.name() == worker.name()) {
            warn!(worker = worker.name(), "duplicate task worker name, keeping the first");
            return false;
        }
        debug!(worker = worker.name(), "task worker registered");
        workers.push(worker);
        true
    }

    // ── Lookup ─────────────────────────────────────────────────

    pub fn actions(&self) -> Vec<Arc<dyn Action>> {
        self.actions.read().clone()
    }

    pub fn providers(&self) -> Vec<Arc<dyn Provider>> {
        self.providers.read().clone()
    }

    pub fn evaluators(&self) -> Vec<Arc<dyn Evaluator>> {
        self.evaluators.read().clone()
    }

    /// Resolve an action by name or simile, ignoring case and separators.
    pub fn find_action(&self, name: &str) -> Option<Arc<dyn Action>> {
        let wanted = normalize(name);
        let actions = self.actions.read();
        actions
            .iter()
            .find(|a| normalize(a.name()) == wanted)
            .or_else(|| {
                actions
                    .iter()
                    .find(|a| a.similes().iter().any(|s| normalize(s) == wanted))
            })
            .cloned()
    }

    pub fn find_provider(&self, name: &str) -> Option<Arc<dyn Provider>> {
        let wanted = normalize(name);
        self.providers
            .read()
            .iter()
            .find(|p| normalize(p.name()) == wanted)
            .cloned()
    }

    /// Task workers match task names exactly.
    pub fn worker(&self, name: &str) -> Option<Arc<dyn TaskWorker>> {
        self.workers.read().iter().find(|w| w.name() == name).cloned()
    }
}
