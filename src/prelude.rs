//! Convenient re-exports for common llm-relay types.
pub use crate::{
    breaker::{BreakerConfig, BreakerRegistry, CircuitState, ProviderStatus},
    config::{Config, ConfigError},
    error::{GenerationError, PersistenceError, PersistenceOutcome, ProviderCallError},
    model::{Attempt, AttemptStatus, Request, RequestContext, RequestStatus, Token},
    persistence::{DatabaseOps, PersistenceService, ReplayLoop, WalHandler},
    pipeline::Pipeline,
    provider::{ProviderBackend, ProviderRegistry, ProviderTunables},
    router::{Action, RouteContext},
    semaphore::ProviderSemaphores,
    sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper},
    telemetry::{EventEmitter, RelayEvent, TelemetrySink},
    token_builder::TokenBuilder,
};
