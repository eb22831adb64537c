//! Provider Adaptor (C1): a uniform async stream over heterogeneous LLM SDKs, plus the
//! static `model -> provider` table and the tunables every provider carries.

pub mod fake;
pub mod http;

pub use fake::{FakeProviderBackend, Scripted};
pub use http::{HttpProviderBackend, ProviderEndpoint};

use crate::breaker::BreakerConfig;
use crate::error::ProviderCallError;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::time::Duration;

/// Per-provider tunables: semaphore capacity and circuit breaker thresholds.
#[derive(Debug, Clone, Copy)]
pub struct ProviderTunables {
    pub concurrency: usize,
    pub breaker: BreakerConfig,
    pub probe_timeout: Duration,
}

impl Default for ProviderTunables {
    fn default() -> Self {
        Self {
            concurrency: 3,
            breaker: BreakerConfig::default(),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// Static table of known providers and the models routed to each.
pub struct ProviderRegistry {
    model_to_provider: HashMap<&'static str, &'static str>,
    tunables: HashMap<&'static str, ProviderTunables>,
    default_provider: &'static str,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        let mut model_to_provider = HashMap::new();
        for m in ["gpt-4", "gpt-3.5-turbo", "gpt-4-turbo", "gpt-4o"] {
            model_to_provider.insert(m, "openai");
        }
        for m in ["claude-3-opus", "claude-3-sonnet", "claude-haiku", "claude-3-haiku"] {
            model_to_provider.insert(m, "anthropic");
        }
        for m in ["gemini-pro", "gemini-flash", "palm-2", "gemini-1.5-pro"] {
            model_to_provider.insert(m, "google_ai");
        }
        for m in ["deepseek-chat", "deepseek-coder"] {
            model_to_provider.insert(m, "deepseek");
        }
        for m in ["command-r", "command-r-plus"] {
            model_to_provider.insert(m, "cohere");
        }

        let mut tunables = HashMap::new();
        tunables.insert("openai", ProviderTunables { concurrency: 5, ..Default::default() });
        tunables.insert("anthropic", ProviderTunables::default());
        tunables.insert("google_ai", ProviderTunables::default());
        tunables.insert("deepseek", ProviderTunables::default());
        tunables.insert("cohere", ProviderTunables::default());

        for (provider, t) in tunables.iter_mut() {
            if let Some(capacity) = crate::config::provider_concurrency_override(provider) {
                t.concurrency = capacity;
            }
        }

        Self { model_to_provider, tunables, default_provider: "openai" }
    }
}

impl ProviderRegistry {
    /// Resolve a model to its provider, defaulting (and logging) for unknown models.
    pub fn provider_for_model(&self, model: &str) -> &'static str {
        match self.model_to_provider.get(model) {
            Some(p) => p,
            None => {
                tracing::warn!(model, default = self.default_provider, "unknown model, defaulting provider");
                self.default_provider
            }
        }
    }

    pub fn tunables(&self, provider: &str) -> ProviderTunables {
        self.tunables.get(provider).copied().unwrap_or_default()
    }

    pub fn providers(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.tunables.keys().copied()
    }
}

/// A raw token chunk from a provider, before it has been assigned an index.
pub type RawChunk = String;

/// The contract every provider backend (real SDK wrapper, or a deterministic fake)
/// must satisfy. Kept deliberately thin: one streaming call, classified errors.
#[async_trait::async_trait]
pub trait ProviderBackend: Send + Sync {
    /// Stream raw token chunks for `model`/`prompt`. The stream is finite and not
    /// restartable; any failure terminates it with a classified
    /// [`ProviderCallError`].
    async fn stream_raw(
        &self,
        provider: &str,
        model: &str,
        prompt: &str,
    ) -> BoxStream<'static, Result<RawChunk, ProviderCallError>>;
}

/// Classify a raw error string/code into the taxonomy, in priority order:
/// rate-limit, timeout, connection/5xx, 4xx-other/malformed, else provider error.
///
/// Provider backends that wrap real HTTP responses should funnel their status codes
/// and messages through here rather than re-implementing the priority order.
pub fn classify_error(status: Option<u16>, message: &str) -> ProviderCallError {
    let lower = message.to_lowercase();

    if status == Some(429) || lower.contains("rate limit") {
        return ProviderCallError::RateLimit { retry_after: None };
    }
    if status == Some(504) || lower.contains("timeout") {
        return ProviderCallError::Timeout;
    }
    if matches!(status, Some(500..=503))
        || lower.contains("connection")
        || lower.contains("network")
        || lower.contains("socket")
    {
        return ProviderCallError::ProviderError { message: message.to_string() };
    }
    // Every non-429 4xx is a client-side problem (bad request, auth, not found, too
    // many redirects, payload too large, ...) and is never worth retrying.
    if matches!(status, Some(s) if (400..500).contains(&s)) || lower.contains("invalid") || lower.contains("bad request") {
        return ProviderCallError::Fatal { message: message.to_string() };
    }
    ProviderCallError::ProviderError { message: message.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_model_maps_to_provider() {
        let registry = ProviderRegistry::default();
        assert_eq!(registry.provider_for_model("claude-3-opus"), "anthropic");
        assert_eq!(registry.provider_for_model("gemini-pro"), "google_ai");
    }

    #[test]
    fn unknown_model_defaults_to_openai() {
        let registry = ProviderRegistry::default();
        assert_eq!(registry.provider_for_model("some-future-model"), "openai");
    }

    #[test]
    fn openai_gets_five_way_concurrency() {
        let registry = ProviderRegistry::default();
        assert_eq!(registry.tunables("openai").concurrency, 5);
        assert_eq!(registry.tunables("anthropic").concurrency, 3);
    }

    #[test]
    fn env_override_applies_at_construction_only() {
        std::env::set_var("ANTHROPIC_CONCURRENCY", "9");
        let registry = ProviderRegistry::default();
        assert_eq!(registry.tunables("anthropic").concurrency, 9);
        std::env::remove_var("ANTHROPIC_CONCURRENCY");
        // A registry built before the var was set (or after it's removed) keeps its
        // own value: the override only takes effect at construction time.
        assert_eq!(registry.tunables("anthropic").concurrency, 9);
    }

    #[test]
    fn classify_error_priority_rate_limit_before_timeout() {
        let e = classify_error(Some(429), "rate limit and timeout both mentioned");
        assert!(matches!(e, ProviderCallError::RateLimit { .. }));
    }

    #[test]
    fn classify_error_timeout() {
        let e = classify_error(None, "request timeout after 30s");
        assert!(matches!(e, ProviderCallError::Timeout));
    }

    #[test]
    fn classify_error_server_error_is_retryable() {
        let e = classify_error(Some(502), "bad gateway");
        assert!(matches!(e, ProviderCallError::ProviderError { .. }));
    }

    #[test]
    fn classify_error_client_error_is_fatal() {
        let e = classify_error(Some(401), "invalid api key");
        assert!(matches!(e, ProviderCallError::Fatal { .. }));
    }

    #[test]
    fn classify_error_every_non_429_4xx_is_fatal() {
        for status in [402, 405, 406, 409, 410, 413, 422, 423, 426, 428, 431, 451] {
            let e = classify_error(Some(status), "unused message");
            assert!(matches!(e, ProviderCallError::Fatal { .. }), "status {status} should classify as Fatal");
        }
    }

    #[test]
    fn classify_error_unknown_defaults_to_provider_error() {
        let e = classify_error(None, "something weird happened");
        assert!(matches!(e, ProviderCallError::ProviderError { .. }));
    }
}
