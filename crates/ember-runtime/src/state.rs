//! State composition: fan out to providers, merge their results in
//! registration order and cache them per message.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use ember_core::{Memory, State};
use ember_plugin::{Provider, ProviderResult, RuntimeContext};

use crate::guard::guarded;
use crate::registry::{CapabilityRegistry, normalize};

/// Key under which merged provider texts are exposed in `State::values`.
pub const PROVIDERS_KEY: &str = "providers";

/// How one provider fared during a composition.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderOutcome {
    pub name: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Zero when the result came from the cache.
    #[serde(with = "millis")]
    pub elapsed: Duration,
    pub cached: bool,
}

mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

// ── Cache ──────────────────────────────────────────────────────

struct CacheEntry {
    created: Instant,
    results: HashMap<String, ProviderResult>,
}

/// Per-message provider results with a lifetime and a size bound.
pub struct StateCache {
    ttl: Duration,
    max_entries: usize,
    entries: Mutex<HashMap<Uuid, CacheEntry>>,
}

impl StateCache {
    /// `max_entries == 0` disables caching.
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, message_id: Uuid) -> Option<HashMap<String, ProviderResult>> {
        let mut entries = self.entries.lock();
        match entries.get(&message_id) {
            Some(entry) if entry.created.elapsed() < self.ttl => Some(entry.results.clone()),
            Some(_) => {
                entries.remove(&message_id);
                None
            }
            None => None,
        }
    }

    /// Add results to a message's entry. When full, expired entries go
    /// first, then the oldest.
    pub fn store(&self, message_id: Uuid, results: HashMap<String, ProviderResult>) {
        if self.max_entries == 0 || results.is_empty() {
            return;
        }
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&message_id) {
            entry.results.extend(results);
            return;
        }
        if entries.len() >= self.max_entries {
            entries.retain(|_, e| e.created.elapsed() < self.ttl);
        }
        while entries.len() >= self.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.created)
                .map(|(id, _)| *id);
            match oldest {
                Some(id) => {
                    entries.remove(&id);
                }
                None => break,
            }
        }
        entries.insert(
            message_id,
            CacheEntry {
                created: Instant::now(),
                results,
            },
        );
    }

    pub fn invalidate(&self, message_id: Uuid) {
        self.entries.lock().remove(&message_id);
    }

    pub fn purge(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Composer ───────────────────────────────────────────────────

/// Builds the per-cycle [`State`] from registered providers.
pub struct StateComposer {
    ctx: Arc<dyn RuntimeContext>,
    registry: Arc<CapabilityRegistry>,
    cache: StateCache,
    provider_timeout: Duration,
}

impl StateComposer {
    pub fn new(
        ctx: Arc<dyn RuntimeContext>,
        registry: Arc<CapabilityRegistry>,
        cache: StateCache,
        provider_timeout: Duration,
    ) -> Self {
        Self {
            ctx,
            registry,
            cache,
            provider_timeout,
        }
    }

    pub fn cache(&self) -> &StateCache {
        &self.cache
    }

    /// Providers for a composition: every public, non-dynamic provider when
    /// `names` is empty, otherwise exactly the named ones.
    fn select(&self, names: &[String]) -> Vec<Arc<dyn Provider>> {
        let registered = self.registry.providers();
        if names.is_empty() {
            return registered
                .into_iter()
                .filter(|p| !p.private() && !p.dynamic())
                .collect();
        }
        for name in names {
            if self.registry.find_provider(name).is_none() {
                warn!(provider = %name, "unknown provider requested, ignoring");
            }
        }
        let wanted: Vec<String> = names.iter().map(|n| normalize(n)).collect();
        registered
            .into_iter()
            .filter(|p| wanted.contains(&normalize(p.name())))
            .collect()
    }

    /// Compose the state for `message`. Provider failures are logged and
    /// reported in the outcomes; composition itself never fails.
    pub async fn compose(
        &self,
        message: &Memory,
        names: &[String],
        use_cache: bool,
    ) -> (State, Vec<ProviderOutcome>) {
        let providers = self.select(names);

        let cached = if use_cache {
            self.cache.get(message.id).unwrap_or_default()
        } else {
            self.cache.invalidate(message.id);
            HashMap::new()
        };

        let base = State::new();
        let ctx = self.ctx.as_ref();
        let pending: Vec<&Arc<dyn Provider>> = providers
            .iter()
            .filter(|p| !cached.contains_key(p.name()))
            .collect();

        let fetched = join_all(pending.iter().map(|provider| {
            let base = &base;
            async move {
                let started = Instant::now();
                let result = guarded(
                    "provider",
                    provider.name(),
                    self.provider_timeout,
                    provider.get(ctx, message, base),
                )
                .await;
                (provider.name().to_string(), result, started.elapsed())
            }
        }))
        .await;

        let mut fresh = HashMap::new();
        let mut outcomes: HashMap<String, ProviderOutcome> = HashMap::new();
        for (name, result, elapsed) in fetched {
            match result {
                Ok(r) => {
                    outcomes.insert(
                        name.clone(),
                        ProviderOutcome {
                            name: name.clone(),
                            ok: true,
                            text: r.text.clone(),
                            error: None,
                            elapsed,
                            cached: false,
                        },
                    );
                    fresh.insert(name, r);
                }
                Err(e) => {
                    warn!(provider = %name, error = %e, "provider failed, skipping its contribution");
                    outcomes.insert(
                        name.clone(),
                        ProviderOutcome {
                            name,
                            ok: false,
                            text: None,
                            error: Some(e.to_string()),
                            elapsed,
                            cached: false,
                        },
                    );
                }
            }
        }
        if use_cache {
            self.cache.store(message.id, fresh.clone());
        }

        let mut state = State::new();
        let mut texts = Vec::new();
        let mut data = serde_json::Map::new();
        let mut ordered = Vec::with_capacity(providers.len());
        for provider in &providers {
            let name = provider.name();
            let result = match fresh.get(name) {
                Some(r) => r,
                None => match cached.get(name) {
                    Some(r) => {
                        ordered.push(ProviderOutcome {
                            name: name.to_string(),
                            ok: true,
                            text: r.text.clone(),
                            error: None,
                            elapsed: Duration::ZERO,
                            cached: true,
                        });
                        r
                    }
                    None => {
                        ordered.extend(outcomes.remove(name));
                        continue;
                    }
                },
            };
            ordered.extend(outcomes.remove(name));
            for (k, v) in &result.values {
                state.set_value(k.clone(), v.clone());
            }
            if let Some(text) = result.text.as_deref().filter(|t| !t.trim().is_empty()) {
                texts.push(text.to_string());
            }
            if !result.data.is_null() {
                data.insert(name.to_string(), result.data.clone());
            }
        }

        state.text = texts.join("\n\n");
        state.set_value(PROVIDERS_KEY, state.text.clone());
        state.set_data(PROVIDERS_KEY, serde_json::Value::Object(data));

        debug!(
            message = %message.id,
            providers = ordered.len(),
            failed = ordered.iter().filter(|o| !o.ok).count(),
            "state composed"
        );
        (state, ordered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_evicts_oldest() {
        let cache = StateCache::new(Duration::from_secs(60), 2);
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            let mut results = HashMap::new();
            results.insert("p".to_string(), ProviderResult::text("x"));
            cache.store(*id, results);
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.get(ids[0]).is_none());
        assert!(cache.get(ids[2]).is_some());
    }

    #[test]
    fn test_full_cache_sweeps_expired_entries() {
        let cache = StateCache::new(Duration::from_millis(30), 2);
        let results = || HashMap::from([("p".to_string(), ProviderResult::text("x"))]);
        cache.store(Uuid::new_v4(), results());
        cache.store(Uuid::new_v4(), results());
        std::thread::sleep(Duration::from_millis(40));

        let fresh = Uuid::new_v4();
        cache.store(fresh, results());
        assert_eq!(cache.len(), 1);
        assert!(cache.get(fresh).is_some());
    }

    #[test]
    fn test_cache_disabled_when_zero_entries() {
        let cache = StateCache::new(Duration::from_secs(60), 0);
        let mut results = HashMap::new();
        results.insert("p".to_string(), ProviderResult::text("x"));
        cache.store(Uuid::new_v4(), results);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_expires() {
        let cache = StateCache::new(Duration::ZERO, 10);
        let id = Uuid::new_v4();
        let mut results = HashMap::new();
        results.insert("p".to_string(), ProviderResult::text("x"));
        cache.store(id, results);
        assert!(cache.get(id).is_none());
    }
}
