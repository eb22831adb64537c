//! Telemetry and observability for the generation pipeline.
//!
//! Every component described in §4 of the design emits a [`RelayEvent`] (retries,
//! breaker transitions, semaphore pressure, persistence outcomes, timeouts, and
//! per-request terminal status). Sinks consume these events; each is implemented as
//! a `tower::Service<RelayEvent>` so they compose with the standard tower
//! combinators (and with each other, via [`sinks::MulticastSink`]/[`sinks::FallbackSink`]).
//!
//! This is purely an observability surface: admin/health introspection endpoints
//! are an external collaborator's concern (see the crate's top-level docs).

pub mod events;
pub mod sinks;

pub use events::{
    BreakerEvent, PersistenceEvent, RelayEvent, RequestOutcome, RetryEvent, SemaphoreEvent, TimeoutEvent,
};
pub use sinks::{
    emit_best_effort, ComposedSinkError, EventEmitter, FallbackSink, LogSink, MemorySink,
    MulticastSink, NonBlockingSink, NullSink, StreamingSink, TelemetrySink,
};
