//! Per-provider circuit breaker: CLOSED/OPEN/HALF_OPEN, lock-free.
//!
//! One [`CircuitBreakerState`] per provider lives in a [`BreakerRegistry`] keyed by
//! provider name, tracking the richer per-provider status the pipeline needs
//! (failure count, last success/failure) rather than just the bare state enum.

use crate::clock::{Clock, MonotonicClock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl From<u8> for CircuitState {
    fn from(v: u8) -> Self {
        match v {
            STATE_CLOSED => CircuitState::Closed,
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => unreachable!("invalid circuit breaker state"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: usize,
    pub recovery_timeout: std::time::Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 3, recovery_timeout: std::time::Duration::from_secs(30) }
    }
}

/// Snapshot of a provider's breaker state, matching `ProviderStatus` in the data model.
#[derive(Debug, Clone, Copy)]
pub struct ProviderStatus {
    pub state: CircuitState,
    pub failure_count: usize,
    pub last_failure_ms: Option<u64>,
    pub last_success_ms: Option<u64>,
}

pub(crate) struct CircuitBreakerState {
    state: AtomicU8,
    failure_count: AtomicUsize,
    opened_at_millis: AtomicU64,
    last_failure_ms: AtomicU64,
    last_success_ms: AtomicU64,
    probe_in_flight: AtomicU8,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakerState {
    fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            failure_count: AtomicUsize::new(0),
            opened_at_millis: AtomicU64::new(0),
            last_failure_ms: AtomicU64::new(0),
            last_success_ms: AtomicU64::new(0),
            probe_in_flight: AtomicU8::new(0),
            config,
            clock,
        }
    }

    /// Check whether a call may proceed. Transitions OPEN→HALF_OPEN when the recovery
    /// timeout has elapsed, admitting exactly one probe.
    fn check(&self) -> Result<(), CircuitState> {
        loop {
            let current = self.state.load(Ordering::Acquire);
            match current {
                STATE_CLOSED => return Ok(()),
                STATE_OPEN => {
                    let opened_at = self.opened_at_millis.load(Ordering::Acquire);
                    let now = self.clock.now_millis();
                    let elapsed = now.saturating_sub(opened_at);
                    if elapsed < self.config.recovery_timeout.as_millis() as u64 {
                        return Err(CircuitState::Open);
                    }
                    // Recovery timeout elapsed: try to claim the single probe slot.
                    if self
                        .probe_in_flight
                        .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.state.store(STATE_HALF_OPEN, Ordering::Release);
                        tracing::info!("circuit breaker -> half-open");
                        return Ok(());
                    }
                    return Err(CircuitState::Open);
                }
                STATE_HALF_OPEN => {
                    // A probe is already admitted; everyone else sees it as open.
                    return Err(CircuitState::Open);
                }
                _ => unreachable!("invalid circuit breaker state"),
            }
        }
    }

    fn record_success(&self) {
        self.last_success_ms.store(self.clock.now_millis(), Ordering::Release);
        let current = self.state.load(Ordering::Acquire);
        match current {
            STATE_HALF_OPEN => {
                self.failure_count.store(0, Ordering::Release);
                self.opened_at_millis.store(0, Ordering::Release);
                self.probe_in_flight.store(0, Ordering::Release);
                self.state.store(STATE_CLOSED, Ordering::Release);
                tracing::info!("circuit breaker -> closed");
            }
            STATE_CLOSED => {
                self.failure_count.store(0, Ordering::Release);
            }
            _ => {}
        }
    }

    fn record_failure(&self) {
        self.last_failure_ms.store(self.clock.now_millis(), Ordering::Release);
        let current = self.state.load(Ordering::Acquire);
        match current {
            STATE_HALF_OPEN => {
                self.probe_in_flight.store(0, Ordering::Release);
                self.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
                self.state.store(STATE_OPEN, Ordering::Release);
                tracing::warn!("circuit breaker: probe failed -> open");
            }
            STATE_CLOSED => {
                let failures = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold {
                    if self
                        .state
                        .compare_exchange(
                            STATE_CLOSED,
                            STATE_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        self.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
                        tracing::error!(failures, threshold = self.config.failure_threshold, "circuit breaker -> open");
                    }
                }
            }
            _ => {}
        }
    }

    fn reset(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
        self.failure_count.store(0, Ordering::Release);
        self.opened_at_millis.store(0, Ordering::Release);
        self.probe_in_flight.store(0, Ordering::Release);
    }

    fn status(&self) -> ProviderStatus {
        ProviderStatus {
            state: self.state.load(Ordering::Acquire).into(),
            failure_count: self.failure_count.load(Ordering::Acquire),
            last_failure_ms: match self.last_failure_ms.load(Ordering::Acquire) {
                0 => None,
                ms => Some(ms),
            },
            last_success_ms: match self.last_success_ms.load(Ordering::Acquire) {
                0 => None,
                ms => Some(ms),
            },
        }
    }
}

/// A handle into one provider's breaker state, obtained from [`BreakerRegistry`].
#[derive(Clone)]
pub struct BreakerHandle {
    state: Arc<CircuitBreakerState>,
}

impl BreakerHandle {
    pub fn check(&self) -> Result<(), CircuitState> {
        self.state.check()
    }

    pub fn record_success(&self) {
        self.state.record_success()
    }

    pub fn record_failure(&self) {
        self.state.record_failure()
    }

    pub fn reset(&self) {
        self.state.reset()
    }

    pub fn status(&self) -> ProviderStatus {
        self.state.status()
    }
}

/// Process-wide registry of per-provider circuit breakers, constructed once and shared
/// via `Arc`/`Clone` throughout the pipeline.
#[derive(Clone)]
pub struct BreakerRegistry {
    inner: Arc<Mutex<HashMap<String, BreakerHandle>>>,
    clock: Arc<dyn Clock>,
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self { inner: Arc::new(Mutex::new(HashMap::new())), clock: Arc::new(MonotonicClock::default()) }
    }
}

impl BreakerRegistry {
    pub fn with_clock<C: Clock + 'static>(clock: C) -> Self {
        Self { inner: Arc::new(Mutex::new(HashMap::new())), clock: Arc::new(clock) }
    }

    /// Get or lazily create a breaker for `provider` with the given config.
    pub fn get_or_insert(&self, provider: &str, config: BreakerConfig) -> BreakerHandle {
        let mut map = self.inner.lock().expect("breaker registry mutex poisoned");
        map.entry(provider.to_string())
            .or_insert_with(|| BreakerHandle {
                state: Arc::new(CircuitBreakerState::new(config, self.clock.clone())),
            })
            .clone()
    }

    pub fn get(&self, provider: &str) -> Option<BreakerHandle> {
        self.inner.lock().expect("breaker registry mutex poisoned").get(provider).cloned()
    }

    /// Force a provider's breaker back to CLOSED (operator action).
    pub fn reset(&self, provider: &str) -> Result<(), String> {
        match self.get(provider) {
            Some(handle) => {
                handle.reset();
                Ok(())
            }
            None => Err(format!("no breaker registered for provider: {provider}")),
        }
    }

    pub fn snapshot(&self) -> Vec<(String, ProviderStatus)> {
        let map = self.inner.lock().expect("breaker registry mutex poisoned");
        let mut entries: Vec<_> = map.iter().map(|(k, v)| (k.clone(), v.status())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64 as StdAtomicU64;

    #[derive(Debug, Clone)]
    struct ManualClock {
        now: Arc<StdAtomicU64>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self { now: Arc::new(StdAtomicU64::new(0)) }
        }
        fn advance(&self, ms: u64) {
            self.now.fetch_add(ms, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn starts_closed() {
        let registry = BreakerRegistry::default();
        let handle = registry.get_or_insert("openai", BreakerConfig::default());
        assert!(handle.check().is_ok());
        assert_eq!(handle.status().state, CircuitState::Closed);
    }

    #[test]
    fn opens_after_threshold_failures() {
        let registry = BreakerRegistry::default();
        let handle = registry.get_or_insert(
            "anthropic",
            BreakerConfig { failure_threshold: 3, recovery_timeout: std::time::Duration::from_secs(30) },
        );
        for _ in 0..3 {
            handle.record_failure();
        }
        assert_eq!(handle.check(), Err(CircuitState::Open));
    }

    #[test]
    fn fatal_errors_should_not_be_recorded_by_caller() {
        // The breaker itself doesn't know about error categories; it's the caller's
        // job (see crate::router) to skip record_failure for Fatal errors. Here we
        // just confirm two failures alone don't trip a threshold-of-3 breaker.
        let registry = BreakerRegistry::default();
        let handle = registry.get_or_insert("cohere", BreakerConfig::default());
        handle.record_failure();
        handle.record_failure();
        assert!(handle.check().is_ok());
    }

    #[test]
    fn half_open_after_recovery_timeout_admits_one_probe() {
        let clock = ManualClock::new();
        let registry = BreakerRegistry::with_clock(clock.clone());
        let handle = registry.get_or_insert(
            "google_ai",
            BreakerConfig { failure_threshold: 1, recovery_timeout: std::time::Duration::from_millis(100) },
        );
        handle.record_failure();
        assert_eq!(handle.check(), Err(CircuitState::Open));

        clock.advance(150);
        assert!(handle.check().is_ok());
        assert_eq!(handle.status().state, CircuitState::HalfOpen);

        // A second caller observing half-open with a probe in flight sees Open.
        assert_eq!(handle.check(), Err(CircuitState::Open));
    }

    #[test]
    fn successful_probe_closes_circuit() {
        let clock = ManualClock::new();
        let registry = BreakerRegistry::with_clock(clock.clone());
        let handle = registry.get_or_insert(
            "deepseek",
            BreakerConfig { failure_threshold: 1, recovery_timeout: std::time::Duration::from_millis(100) },
        );
        handle.record_failure();
        clock.advance(150);
        assert!(handle.check().is_ok());
        handle.record_success();
        assert_eq!(handle.status().state, CircuitState::Closed);
        assert_eq!(handle.status().failure_count, 0);
    }

    #[test]
    fn failed_probe_reopens_circuit() {
        let clock = ManualClock::new();
        let registry = BreakerRegistry::with_clock(clock.clone());
        let handle = registry.get_or_insert(
            "openai",
            BreakerConfig { failure_threshold: 1, recovery_timeout: std::time::Duration::from_millis(100) },
        );
        handle.record_failure();
        clock.advance(150);
        assert!(handle.check().is_ok());
        handle.record_failure();
        assert_eq!(handle.check(), Err(CircuitState::Open));
    }

    #[test]
    fn manual_reset_forces_closed() {
        let registry = BreakerRegistry::default();
        let handle = registry.get_or_insert("openai", BreakerConfig { failure_threshold: 1, ..Default::default() });
        handle.record_failure();
        assert_eq!(handle.check(), Err(CircuitState::Open));
        registry.reset("openai").unwrap();
        assert!(handle.check().is_ok());
    }

    #[test]
    fn reset_unknown_provider_errs() {
        let registry = BreakerRegistry::default();
        assert!(registry.reset("nope").is_err());
    }

    #[test]
    fn snapshot_is_sorted_by_provider() {
        let registry = BreakerRegistry::default();
        registry.get_or_insert("zeta", BreakerConfig::default());
        registry.get_or_insert("alpha", BreakerConfig::default());
        let snap = registry.snapshot();
        assert_eq!(snap[0].0, "alpha");
        assert_eq!(snap[1].0, "zeta");
    }
}
