#![forbid(unsafe_code)]

//! # llm-relay
//!
//! A reliable, streaming front-end for heterogeneous LLM providers. Clients submit a
//! prompt plus an ordered list of models; tokens stream back while being durably
//! persisted in order, so a reconnecting client (or an operator restoring from
//! backup) can reconstruct the full response.
//!
//! ## What this crate does
//!
//! - Selects a provider under safety controls: a per-provider [`CircuitBreaker`](breaker::BreakerRegistry)
//!   and a bounded [`semaphore`].
//! - Converts a provider's raw stream into ordered, indexed [`Token`](model::Token)s
//!   via the [`token_builder`].
//! - Batches tokens through a back-pressuring [`buffer`].
//! - Persists each batch to the database or, on outage, to a write-ahead log, with a
//!   background task replaying the log back once the database recovers
//!   (see [`persistence`]).
//! - Falls back to alternative models on failure according to the policy in
//!   [`router`].
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use llm_relay::persistence::{DatabaseOps, PersistenceService, WalHandler};
//! use llm_relay::provider::{ProviderBackend, ProviderRegistry};
//! use llm_relay::model::RequestContext;
//! use llm_relay::Pipeline;
//! use futures::StreamExt;
//!
//! # async fn run(backend: Arc<dyn ProviderBackend>, db: Arc<dyn DatabaseOps>) {
//! let wal = Arc::new(WalHandler::new("tokens.wal", 100 * 1024 * 1024));
//! let persistence = Arc::new(PersistenceService::new(wal, db));
//! let registry = Arc::new(ProviderRegistry::default());
//! let pipeline = Arc::new(Pipeline::new(registry, backend, persistence, 16, Duration::from_secs(1)));
//!
//! let ctx = RequestContext::new("req-1");
//! let mut stream = pipeline.generate_tokens("gpt-4".into(), "hi".into(), ctx);
//! while let Some(token) = stream.next().await {
//!     match token {
//!         Ok(t) => println!("{}", t.text),
//!         Err(e) => eprintln!("generation failed: {e}"),
//!     }
//! }
//! # }
//! ```

pub mod backoff;
pub mod breaker;
pub mod buffer;
pub mod clock;
pub mod config;
pub mod error;
pub mod model;
pub mod persistence;
pub mod pipeline;
pub mod provider;
pub mod router;
pub mod semaphore;
pub mod sleeper;
pub mod telemetry;
pub mod token_builder;

pub use breaker::{BreakerConfig, BreakerRegistry, CircuitState, ProviderStatus};
pub use config::{Config, ConfigError};
pub use error::{GenerationError, PersistenceError, PersistenceOutcome, ProviderCallError};
pub use model::{Attempt, AttemptStatus, Request, RequestContext, RequestStatus, Token};
pub use persistence::{DatabaseOps, PersistenceService, ReplayLoop, WalHandler};
pub use pipeline::Pipeline;
pub use provider::{HttpProviderBackend, ProviderBackend, ProviderEndpoint, ProviderRegistry, ProviderTunables};
pub use semaphore::ProviderSemaphores;
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use token_builder::TokenBuilder;

pub mod prelude;
