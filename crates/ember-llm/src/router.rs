use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::model::{ModelHandler, ModelKind, ModelOutput, ModelRegistration, ModelRequest};
use ember_core::{EmberError, Result};

/// Maximum retry attempts for transient errors (429, 500, 502, 503).
const MAX_RETRIES: u32 = 3;
/// Base delay for exponential backoff (doubles each retry).
const BASE_DELAY_MS: u64 = 1000;

// ── Circuit Breaker ────────────────────────────────────────────

/// Number of consecutive failures before opening the circuit.
const CIRCUIT_FAILURE_THRESHOLD: u32 = 5;
/// How long the circuit stays open before letting a trial request through.
const CIRCUIT_OPEN_DURATION: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed,
    /// Handler keeps failing; skip it until the timer runs out.
    Open { since: Instant },
    /// One trial request is in flight. A trial that never reports back
    /// (dropped on timeout) expires after the same open duration.
    HalfOpen { since: Instant },
}

#[derive(Debug)]
struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    threshold: u32,
    open_for: Duration,
}

impl CircuitBreaker {
    fn new(threshold: u32, open_for: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            threshold,
            open_for,
        }
    }

    fn allow_request(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open { since } | CircuitState::HalfOpen { since } => {
                if since.elapsed() >= self.open_for {
                    self.state = CircuitState::HalfOpen {
                        since: Instant::now(),
                    };
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.state = CircuitState::Closed;
    }

    fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.threshold {
            self.state = CircuitState::Open {
                since: Instant::now(),
            };
        }
    }

    fn is_open(&self) -> bool {
        matches!(self.state, CircuitState::Open { .. })
    }
}

struct Entry {
    priority: i32,
    handler: Arc<dyn ModelHandler>,
}

/// Routes model calls to the highest-priority handler registered for a kind.
///
/// Transient errors are retried with exponential backoff; a handler that
/// still fails hands over to the next one in priority order.
pub struct ModelRouter {
    /// Per kind, sorted by descending priority; ties keep registration order.
    handlers: RwLock<HashMap<ModelKind, Vec<Entry>>>,
    /// Circuit breakers keyed by handler name.
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    max_retries: u32,
    base_delay: Duration,
    breaker_threshold: u32,
    breaker_open_for: Duration,
}

/// Extract retry-after hint from a RateLimited error.
fn retry_after_hint(err: &EmberError) -> Option<Duration> {
    if let EmberError::RateLimited { retry_after_secs } = err {
        Some(Duration::from_secs(*retry_after_secs))
    } else {
        None
    }
}

impl Default for ModelRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelRouter {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            breakers: Mutex::new(HashMap::new()),
            max_retries: MAX_RETRIES,
            base_delay: Duration::from_millis(BASE_DELAY_MS),
            breaker_threshold: CIRCUIT_FAILURE_THRESHOLD,
            breaker_open_for: CIRCUIT_OPEN_DURATION,
        }
    }

    /// Override the retry policy (tests use a tiny base delay).
    pub fn with_retry(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.base_delay = base_delay;
        self
    }

    /// Override the circuit breaker policy. Applies to handlers registered afterwards.
    pub fn with_circuit_breaker(mut self, threshold: u32, open_for: Duration) -> Self {
        self.breaker_threshold = threshold.max(1);
        self.breaker_open_for = open_for;
        self
    }

    pub fn register(&self, registration: ModelRegistration) {
        let ModelRegistration {
            kind,
            priority,
            handler,
        } = registration;
        info!(kind = %kind, handler = handler.name(), priority, "registered model handler");
        self.breakers
            .lock()
            .entry(handler.name().to_string())
            .or_insert_with(|| CircuitBreaker::new(self.breaker_threshold, self.breaker_open_for));

        let mut handlers = self.handlers.write();
        let list = handlers.entry(kind).or_default();
        let pos = list
            .iter()
            .position(|e| e.priority < priority)
            .unwrap_or(list.len());
        list.insert(pos, Entry { priority, handler });
    }

    /// Remove every handler with the given name. Returns how many were removed.
    pub fn unregister(&self, handler_name: &str) -> usize {
        let mut removed = 0;
        for list in self.handlers.write().values_mut() {
            let before = list.len();
            list.retain(|e| e.handler.name() != handler_name);
            removed += before - list.len();
        }
        removed
    }

    pub fn has_handler(&self, kind: ModelKind) -> bool {
        self.handlers.read().get(&kind).is_some_and(|l| !l.is_empty())
    }

    /// Name of the handler that would serve `kind` right now.
    pub fn active_handler(&self, kind: ModelKind) -> Option<String> {
        self.handlers
            .read()
            .get(&kind)
            .and_then(|l| l.first())
            .map(|e| e.handler.name().to_string())
    }

    fn candidates(&self, kind: ModelKind) -> Vec<Arc<dyn ModelHandler>> {
        self.handlers
            .read()
            .get(&kind)
            .map(|l| l.iter().map(|e| Arc::clone(&e.handler)).collect())
            .unwrap_or_default()
    }

    fn is_available(&self, name: &str) -> bool {
        self.breakers
            .lock()
            .get_mut(name)
            .is_none_or(CircuitBreaker::allow_request)
    }

    fn record_success(&self, name: &str) {
        if let Some(cb) = self.breakers.lock().get_mut(name) {
            cb.record_success();
        }
    }

    fn record_failure(&self, name: &str) {
        let mut breakers = self.breakers.lock();
        if let Some(cb) = breakers.get_mut(name) {
            let was_open = cb.is_open();
            cb.record_failure();
            if !was_open && cb.is_open() {
                warn!(
                    handler = name,
                    failures = cb.consecutive_failures,
                    "circuit breaker open, handler skipped for {}ms",
                    cb.open_for.as_millis()
                );
            }
        }
    }

    /// Invoke the best available handler for `kind`.
    pub async fn use_model(&self, kind: ModelKind, request: &ModelRequest) -> Result<ModelOutput> {
        let candidates = self.candidates(kind);
        if candidates.is_empty() {
            return Err(EmberError::ModelNotFound(kind.to_string()));
        }

        let mut last_err = None;
        for handler in candidates {
            if !self.is_available(handler.name()) {
                debug!(handler = handler.name(), kind = %kind, "circuit open, skipping handler");
                continue;
            }
            match self.generate_with_retry(&*handler, kind, request).await {
                Ok(output) => {
                    self.record_success(handler.name());
                    return Ok(output);
                }
                Err(e) => {
                    self.record_failure(handler.name());
                    warn!(
                        handler = handler.name(),
                        kind = %kind,
                        error = %e,
                        "model handler failed, trying next"
                    );
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| EmberError::ModelNotFound(kind.to_string())))
    }

    /// Convenience: invoke and expect text.
    pub async fn generate_text(&self, kind: ModelKind, request: &ModelRequest) -> Result<String> {
        self.use_model(kind, request).await?.into_text()
    }

    async fn generate_with_retry(
        &self,
        handler: &dyn ModelHandler,
        kind: ModelKind,
        request: &ModelRequest,
    ) -> Result<ModelOutput> {
        let mut attempt = 0;
        loop {
            match handler.generate(kind, request).await {
                Ok(output) => return Ok(output),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = retry_after_hint(&e)
                        .unwrap_or(self.base_delay * 2u32.pow(attempt));
                    warn!(
                        handler = handler.name(),
                        attempt = attempt + 1,
                        max = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after transient error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
