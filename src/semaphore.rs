//! Per-provider concurrency bound.
//!
//! Unlike a rejecting bulkhead (which fails immediately via `try_acquire` once a
//! provider is at capacity), the caller here blocks until a permit frees up: it
//! acquires before issuing the provider call. We keep the `Arc<Semaphore>` shape and
//! registry-by-name pattern but use `acquire_owned` so callers suspend rather than
//! get rejected.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A held permit; the provider call runs while this is alive and the permit is
/// released unconditionally when it drops (covers both success and error paths).
pub struct ProviderPermit {
    _permit: OwnedSemaphorePermit,
}

#[derive(Clone)]
struct ProviderSemaphore {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// Process-wide registry of per-provider semaphores.
#[derive(Clone, Default)]
pub struct ProviderSemaphores {
    inner: Arc<Mutex<HashMap<String, ProviderSemaphore>>>,
}

impl ProviderSemaphores {
    /// Register a provider's capacity if not already registered. Capacity changes after
    /// the first registration are ignored: live semaphores keep their original size.
    pub fn register(&self, provider: &str, capacity: usize) {
        let mut map = self.inner.lock().expect("semaphore registry mutex poisoned");
        map.entry(provider.to_string())
            .or_insert_with(|| ProviderSemaphore { semaphore: Arc::new(Semaphore::new(capacity)), capacity });
    }

    /// Acquire a permit for `provider`, blocking until one is available. Panics if the
    /// provider was never registered via [`Self::register`] — callers go through
    /// [`crate::provider::ProviderRegistry`], which registers every known provider at
    /// construction.
    pub async fn acquire(&self, provider: &str) -> ProviderPermit {
        let semaphore = {
            let map = self.inner.lock().expect("semaphore registry mutex poisoned");
            map.get(provider)
                .unwrap_or_else(|| panic!("provider semaphore not registered: {provider}"))
                .semaphore
                .clone()
        };
        let permit = semaphore.acquire_owned().await.expect("semaphore never closed");
        ProviderPermit { _permit: permit }
    }

    pub fn capacity(&self, provider: &str) -> Option<usize> {
        self.inner.lock().expect("semaphore registry mutex poisoned").get(provider).map(|p| p.capacity)
    }

    pub fn available_permits(&self, provider: &str) -> Option<usize> {
        self.inner
            .lock()
            .expect("semaphore registry mutex poisoned")
            .get(provider)
            .map(|p| p.semaphore.available_permits())
    }
}
