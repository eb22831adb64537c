use std::fmt;
use std::time::Duration;

#[cfg(feature = "telemetry-json")]
use serde_json::json;

/// Structured events emitted by the pipeline's components.
///
/// Every component in §4 of the design emits one of these so operators can observe
/// state transitions and persistence outcomes without a separate admin surface (see
/// [`crate::telemetry::sinks`] for how events are consumed).
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// Error Router retry/fallback decisions.
    Retry(RetryEvent),
    /// Circuit breaker state transitions.
    Breaker(BreakerEvent),
    /// Provider semaphore acquisition.
    Semaphore(SemaphoreEvent),
    /// Persistence outcomes (committed, deferred to WAL, or fatally failed).
    Persistence(PersistenceEvent),
    /// A provider call missed its deadline.
    Timeout(TimeoutEvent),
    /// Terminal outcome of one `generate_tokens` call.
    Request(RequestOutcome),
}

/// Events emitted while retrying or falling back within one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryEvent {
    /// A retry of the same model is about to happen after `delay`.
    Attempt {
        /// The attempt number within the current model (1-indexed).
        attempt: usize,
        /// The backoff delay before this retry.
        delay: Duration,
    },
    /// Every model in the fallback list has been exhausted.
    Exhausted {
        /// Total number of attempts made across all models.
        total_attempts: usize,
        /// Total time spent retrying and falling back.
        total_duration: Duration,
    },
}

/// Events emitted by a provider's circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerEvent {
    /// The breaker tripped open after `failure_count` consecutive counted failures.
    Opened { failure_count: usize },
    /// The recovery timeout elapsed and a single probe was admitted.
    HalfOpen,
    /// A probe (or a call in CLOSED) succeeded; the breaker is closed.
    Closed,
}

/// Events emitted by a provider's semaphore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemaphoreEvent {
    /// A permit was acquired immediately.
    Acquired { active_count: usize, max_concurrency: usize },
    /// All permits were in use; the caller suspended until one freed up.
    Exhausted { active_count: usize, max_concurrency: usize },
}

/// Events emitted by the persistence layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceEvent {
    /// A batch was written directly to the database.
    Committed { tokens: usize },
    /// The database was unreachable; the batch was appended to the WAL instead.
    Deferred { tokens: usize },
    /// The WAL was successfully replayed into the database.
    Replayed { tokens: usize },
    /// Both the database and the WAL failed, or the WAL is corrupt.
    Failed { reason: String },
}

/// A provider call exceeded its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutEvent {
    Occurred { timeout: Duration },
}

/// Terminal outcome of one `generate_tokens` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Success { duration: Duration },
    Failure { duration: Duration },
}

impl fmt::Display for RelayEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayEvent::Retry(event) => write!(f, "Retry::{}", event),
            RelayEvent::Breaker(event) => write!(f, "Breaker::{}", event),
            RelayEvent::Semaphore(event) => write!(f, "Semaphore::{}", event),
            RelayEvent::Persistence(event) => write!(f, "Persistence::{}", event),
            RelayEvent::Timeout(event) => write!(f, "Timeout::{}", event),
            RelayEvent::Request(event) => write!(f, "Request::{}", event),
        }
    }
}

impl fmt::Display for RetryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryEvent::Attempt { attempt, delay } => {
                write!(f, "Attempt(#{}, delay={:?})", attempt, delay)
            }
            RetryEvent::Exhausted { total_attempts, total_duration } => {
                write!(f, "Exhausted(attempts={}, duration={:?})", total_attempts, total_duration)
            }
        }
    }
}

impl fmt::Display for BreakerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerEvent::Opened { failure_count } => write!(f, "Opened(failures={})", failure_count),
            BreakerEvent::HalfOpen => write!(f, "HalfOpen"),
            BreakerEvent::Closed => write!(f, "Closed"),
        }
    }
}

impl fmt::Display for SemaphoreEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SemaphoreEvent::Acquired { active_count, max_concurrency } => {
                write!(f, "Acquired({}/{})", active_count, max_concurrency)
            }
            SemaphoreEvent::Exhausted { active_count, max_concurrency } => {
                write!(f, "Exhausted({}/{})", active_count, max_concurrency)
            }
        }
    }
}

impl fmt::Display for PersistenceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistenceEvent::Committed { tokens } => write!(f, "Committed(tokens={})", tokens),
            PersistenceEvent::Deferred { tokens } => write!(f, "Deferred(tokens={})", tokens),
            PersistenceEvent::Replayed { tokens } => write!(f, "Replayed(tokens={})", tokens),
            PersistenceEvent::Failed { reason } => write!(f, "Failed({})", reason),
        }
    }
}

impl fmt::Display for TimeoutEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutEvent::Occurred { timeout } => write!(f, "Occurred(timeout={:?})", timeout),
        }
    }
}

impl fmt::Display for RequestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestOutcome::Success { duration } => write!(f, "Success(duration={:?})", duration),
            RequestOutcome::Failure { duration } => write!(f, "Failure(duration={:?})", duration),
        }
    }
}

#[cfg_attr(not(feature = "telemetry-json"), allow(dead_code))]
#[inline]
fn clamp_u64(val: u128) -> u64 {
    val.min(u128::from(u64::MAX)) as u64
}

/// Convert a [`RelayEvent`] into a JSON value for sinks that ship events off-process.
#[cfg(feature = "telemetry-json")]
pub fn event_to_json(event: &RelayEvent) -> serde_json::Value {
    match event {
        RelayEvent::Retry(r) => match r {
            RetryEvent::Attempt { attempt, delay } => json!({
                "kind": "retry_attempt",
                "attempt": *attempt,
                "delay_ms": clamp_u64(delay.as_millis()),
            }),
            RetryEvent::Exhausted { total_attempts, total_duration } => json!({
                "kind": "retry_exhausted",
                "attempts": *total_attempts,
                "duration_ms": clamp_u64(total_duration.as_millis()),
            }),
        },
        RelayEvent::Breaker(c) => match c {
            BreakerEvent::Opened { failure_count } => {
                json!({ "kind": "breaker_opened", "failures": *failure_count })
            }
            BreakerEvent::HalfOpen => json!({ "kind": "breaker_half_open" }),
            BreakerEvent::Closed => json!({ "kind": "breaker_closed" }),
        },
        RelayEvent::Semaphore(b) => match b {
            SemaphoreEvent::Acquired { active_count, max_concurrency } => json!({
                "kind": "semaphore_acquired",
                "active": *active_count,
                "max": *max_concurrency
            }),
            SemaphoreEvent::Exhausted { active_count, max_concurrency } => json!({
                "kind": "semaphore_exhausted",
                "active": *active_count,
                "max": *max_concurrency
            }),
        },
        RelayEvent::Persistence(p) => match p {
            PersistenceEvent::Committed { tokens } => json!({ "kind": "persistence_committed", "tokens": *tokens }),
            PersistenceEvent::Deferred { tokens } => json!({ "kind": "persistence_deferred", "tokens": *tokens }),
            PersistenceEvent::Replayed { tokens } => json!({ "kind": "persistence_replayed", "tokens": *tokens }),
            PersistenceEvent::Failed { reason } => json!({ "kind": "persistence_failed", "reason": reason }),
        },
        RelayEvent::Timeout(t) => match t {
            TimeoutEvent::Occurred { timeout } => json!({
                "kind": "timeout",
                "timeout_ms": clamp_u64(timeout.as_millis())
            }),
        },
        RelayEvent::Request(r) => match r {
            RequestOutcome::Success { duration } => json!({
                "kind": "request_success",
                "duration_ms": clamp_u64(duration.as_millis())
            }),
            RequestOutcome::Failure { duration } => json!({
                "kind": "request_failure",
                "duration_ms": clamp_u64(duration.as_millis())
            }),
        },
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_event_display() {
        let event = RetryEvent::Attempt { attempt: 2, delay: Duration::from_millis(100) };
        assert!(event.to_string().contains("Attempt"));
        assert!(event.to_string().contains("#2"));
    }

    #[test]
    fn breaker_event_display() {
        let event = BreakerEvent::Opened { failure_count: 5 };
        assert!(event.to_string().contains("Opened"));
        assert!(event.to_string().contains("5"));
    }

    #[test]
    fn semaphore_event_display() {
        let event = SemaphoreEvent::Exhausted { active_count: 5, max_concurrency: 5 };
        assert!(event.to_string().contains("Exhausted"));
        assert!(event.to_string().contains("5/5"));
    }

    #[test]
    fn persistence_event_display() {
        let event = PersistenceEvent::Failed { reason: "disk full".into() };
        assert!(event.to_string().contains("Failed"));
        assert!(event.to_string().contains("disk full"));
    }

    #[test]
    fn relay_event_clone_and_eq() {
        let event = RelayEvent::Retry(RetryEvent::Attempt { attempt: 1, delay: Duration::from_millis(50) });
        let cloned = event.clone();
        assert_eq!(event, cloned);
    }

    #[test]
    fn relay_event_request_variants_display() {
        let ok = RelayEvent::Request(RequestOutcome::Success { duration: Duration::from_millis(5) });
        let err = RelayEvent::Request(RequestOutcome::Failure { duration: Duration::from_millis(7) });
        assert!(format!("{}", ok).contains("Success"));
        assert!(format!("{}", err).contains("Failure"));
    }
}
