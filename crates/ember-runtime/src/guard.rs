//! Timeout and panic containment for capability calls.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;

use ember_core::{EmberError, Result};

/// Run a plugin-supplied future bounded by `limit`. A timeout becomes
/// [`EmberError::Timeout`] and a panic becomes [`EmberError::CapabilityPanicked`].
pub async fn guarded<T, F>(kind: &'static str, name: &str, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, AssertUnwindSafe(fut).catch_unwind()).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(EmberError::CapabilityPanicked {
            kind,
            name: name.to_string(),
        }),
        Err(_) => Err(EmberError::Timeout {
            operation: format!("{kind} '{name}'"),
            ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}
