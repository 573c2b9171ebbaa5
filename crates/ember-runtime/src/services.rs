//! Service registry: at most one running singleton per service type.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use ember_core::{EmberError, Result};
use ember_plugin::{Service, downcast_service};

/// Registered services in registration order.
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<Vec<Arc<dyn Service>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service. A second service of the same type is rejected.
    pub fn register(&self, service: Arc<dyn Service>) -> Result<()> {
        let mut services = self.services.write();
        let service_type = service.service_type().to_string();
        if services.iter().any(|s| s.service_type() == service_type) {
            return Err(EmberError::DuplicateService(service_type));
        }
        services.push(service);
        info!(service = %service_type, "service registered");
        Ok(())
    }

    /// Register a service, displacing any existing one of the same type.
    /// The displaced service keeps its registration slot.
    pub fn replace(&self, service: Arc<dyn Service>) -> Option<Arc<dyn Service>> {
        let mut services = self.services.write();
        let service_type = service.service_type().to_string();
        match services.iter().position(|s| s.service_type() == service_type) {
            Some(idx) => {
                info!(service = %service_type, "service replaced");
                Some(std::mem::replace(&mut services[idx], service))
            }
            None => {
                services.push(service);
                info!(service = %service_type, "service registered");
                None
            }
        }
    }

    /// Remove a service without stopping it.
    pub fn unregister(&self, service_type: &str) -> Option<Arc<dyn Service>> {
        let mut services = self.services.write();
        let idx = services.iter().position(|s| s.service_type() == service_type)?;
        Some(services.remove(idx))
    }

    pub fn get(&self, service_type: &str) -> Option<Arc<dyn Service>> {
        self.services
            .read()
            .iter()
            .find(|s| s.service_type() == service_type)
            .cloned()
    }

    /// Typed lookup; `None` if absent or of another concrete type.
    pub fn get_as<T: Service>(&self, service_type: &str) -> Option<Arc<T>> {
        self.get(service_type).and_then(downcast_service::<T>)
    }

    pub fn has(&self, service_type: &str) -> bool {
        self.services
            .read()
            .iter()
            .any(|s| s.service_type() == service_type)
    }

    /// Registered types, in registration order.
    pub fn types(&self) -> Vec<String> {
        self.services
            .read()
            .iter()
            .map(|s| s.service_type().to_string())
            .collect()
    }

    /// Stop every service in reverse registration order and empty the
    /// registry. Failures are logged and returned; they never stop the sweep.
    pub async fn stop_all(&self) -> Vec<(String, EmberError)> {
        let services: Vec<Arc<dyn Service>> = std::mem::take(&mut *self.services.write());
        let mut failures = Vec::new();
        for service in services.iter().rev() {
            let service_type = service.service_type().to_string();
            match service.stop().await {
                Ok(()) => info!(service = %service_type, "service stopped"),
                Err(e) => {
                    warn!(service = %service_type, error = %e, "service failed to stop");
                    failures.push((service_type, e));
                }
            }
        }
        failures
    }
}
