//! Generation Pipeline (C8): orchestrates C1-C7 for one request. Grounded on
//! `token_generation_pipeline.py`'s `generate_tokens`, reshaped from an `async for`
//! loop with nested `try`/`except` into the attempt/retry/fallback state machine the
//! original's helper methods (`_handle_provider_down_error`, `_handle_fatal_error`)
//! only partially captured.

use crate::breaker::BreakerRegistry;
use crate::buffer::BufferManager;
use crate::error::{GenerationError, ProviderCallError};
use crate::model::{RequestContext, Token};
use crate::persistence::PersistenceService;
use crate::provider::{ProviderBackend, ProviderRegistry};
use crate::router::{self, Action, RouteContext};
use crate::semaphore::ProviderSemaphores;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{EventEmitter, NullSink, RelayEvent, RequestOutcome, RetryEvent};
use crate::token_builder::TokenBuilder;
use async_stream::stream;
use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct Pipeline {
    registry: Arc<ProviderRegistry>,
    backend: Arc<dyn ProviderBackend>,
    breakers: BreakerRegistry,
    semaphores: ProviderSemaphores,
    persistence: Arc<PersistenceService>,
    batch_size: usize,
    flush_age: Duration,
    sleeper: Arc<dyn Sleeper>,
    telemetry: Arc<dyn EventEmitter>,
}

impl Pipeline {
    /// Registers every known provider's semaphore capacity and breaker config up
    /// front, so `generate_tokens` never hits `ProviderSemaphores::acquire`'s
    /// unregistered-provider panic.
    pub fn new(
        registry: Arc<ProviderRegistry>,
        backend: Arc<dyn ProviderBackend>,
        persistence: Arc<PersistenceService>,
        batch_size: usize,
        flush_age: Duration,
    ) -> Self {
        Self::with_sleeper(registry, backend, persistence, batch_size, flush_age, Arc::new(TokioSleeper))
    }

    /// Same as [`Self::new`] but with an injectable [`Sleeper`], so retry backoff and
    /// fallback jitter can be made instantaneous in tests.
    pub fn with_sleeper(
        registry: Arc<ProviderRegistry>,
        backend: Arc<dyn ProviderBackend>,
        persistence: Arc<PersistenceService>,
        batch_size: usize,
        flush_age: Duration,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let breakers = BreakerRegistry::default();
        let semaphores = ProviderSemaphores::default();
        for provider in registry.providers() {
            let tunables = registry.tunables(provider);
            breakers.get_or_insert(provider, tunables.breaker);
            semaphores.register(provider, tunables.concurrency);
        }
        Self {
            registry,
            backend,
            breakers,
            semaphores,
            persistence,
            batch_size,
            flush_age,
            sleeper,
            telemetry: Arc::new(NullSink),
        }
    }

    /// Attach a telemetry sink that receives retry/fallback/request-outcome events as
    /// `generate_tokens` runs. Replaces the no-op default.
    pub fn with_telemetry(mut self, telemetry: Arc<dyn EventEmitter>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    /// `generate_tokens(model, prompt, ctx) -> stream<Token>`. Finite, not restartable.
    /// Yields in strict index order within an attempt; a fallback resets the index at
    /// the new attempt's 0 and is not deduplicated against tokens from prior attempts.
    pub fn generate_tokens(
        self: Arc<Self>,
        model: String,
        prompt: String,
        ctx: RequestContext,
    ) -> BoxStream<'static, Result<Token, GenerationError>> {
        Box::pin(stream! {
            let started_at = Instant::now();
            let mut models = Vec::with_capacity(1 + ctx.fallback_models.len());
            models.push(model);
            models.extend(ctx.fallback_models.iter().cloned());

            let mut model_idx = 0usize;
            let mut attempt_seq: u32 = 1;
            let mut attempt_in_model: u32 = 1;

            loop {
                if model_idx >= models.len() {
                    self.telemetry.emit(RelayEvent::Retry(RetryEvent::Exhausted {
                        total_attempts: attempt_seq as usize,
                        total_duration: started_at.elapsed(),
                    }));
                    self.telemetry.emit(RelayEvent::Request(RequestOutcome::Failure { duration: started_at.elapsed() }));
                    yield Err(GenerationError::Exhausted {
                        last_error: "fallback list exhausted".into(),
                        attempts: attempt_seq as usize,
                    });
                    return;
                }

                let current_model = models[model_idx].clone();
                let provider = self.registry.provider_for_model(&current_model);
                let breaker = self.breakers.get_or_insert(provider, self.registry.tunables(provider).breaker);

                if breaker.check().is_err() {
                    tracing::warn!(provider, model = %current_model, "circuit open, advancing to fallback");
                    model_idx += 1;
                    attempt_in_model = 1;
                    attempt_seq += 1;
                    self.sleeper.sleep(router::fallback_jitter()).await;
                    continue;
                }

                let permit = self.semaphores.acquire(provider).await;
                let mut builder = TokenBuilder::new(ctx.request_id.clone(), attempt_seq, current_model.clone());
                let buffer = BufferManager::new(self.batch_size, self.flush_age);
                let persistence = self.persistence.clone();

                let mut raw_stream = self.backend.stream_raw(provider, &current_model, &prompt).await;
                let mut attempt_error: Option<ProviderCallError> = None;

                while let Some(item) = raw_stream.next().await {
                    match item {
                        Ok(raw) => {
                            let token = builder.build(raw);
                            buffer.add(token.clone()).await;
                            if buffer.flush_needed().await {
                                let persistence_for_drain = persistence.clone();
                                let drained = buffer
                                    .drain(move |batch| async move {
                                        // Committed and Deferred both count as "success" from the
                                        // buffer's perspective (see crate::buffer's drain docs).
                                        persistence_for_drain.persist_batch(&batch).await.map(|_outcome| ())
                                    })
                                    .await;
                                if let Err(e) = drained {
                                    self.telemetry.emit(RelayEvent::Request(RequestOutcome::Failure { duration: started_at.elapsed() }));
                                    yield Err(GenerationError::Persistence(e));
                                    drop(permit);
                                    return;
                                }
                            }
                            yield Ok(token);
                        }
                        Err(e) => {
                            attempt_error = Some(e);
                            break;
                        }
                    }
                }

                let persistence_for_flush = persistence.clone();
                let flushed = buffer
                    .force_flush(move |batch| async move {
                        persistence_for_flush.persist_batch(&batch).await.map(|_outcome| ())
                    })
                    .await;
                if let Err(e) = flushed {
                    self.telemetry.emit(RelayEvent::Request(RequestOutcome::Failure { duration: started_at.elapsed() }));
                    yield Err(GenerationError::Persistence(e));
                    drop(permit);
                    return;
                }

                match attempt_error {
                    None => {
                        breaker.record_success();
                        drop(permit);
                        self.telemetry.emit(RelayEvent::Request(RequestOutcome::Success { duration: started_at.elapsed() }));
                        return;
                    }
                    Some(err) => {
                        if err.counts_toward_breaker() {
                            breaker.record_failure();
                        }
                        let action = router::route(&err, RouteContext { attempt: attempt_in_model, max_retries: ctx.max_retries });
                        drop(permit);

                        match action {
                            Action::Retry { delay } => {
                                self.telemetry.emit(RelayEvent::Retry(RetryEvent::Attempt {
                                    attempt: attempt_in_model as usize,
                                    delay,
                                }));
                                self.sleeper.sleep(delay).await;
                                attempt_in_model += 1;
                                attempt_seq += 1;
                            }
                            Action::Fallback => {
                                self.sleeper.sleep(router::fallback_jitter()).await;
                                model_idx += 1;
                                attempt_in_model = 1;
                                attempt_seq += 1;
                            }
                            Action::Abort => {
                                self.telemetry.emit(RelayEvent::Request(RequestOutcome::Failure { duration: started_at.elapsed() }));
                                yield Err(GenerationError::Aborted { cause: err.to_string() });
                                return;
                            }
                        }
                    }
                }
            }
        })
    }
}
