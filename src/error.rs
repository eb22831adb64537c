//! Crate-wide error taxonomy.
//!
//! Every fallible surface in this crate returns one of the variants below (or wraps one).
//! The split mirrors the propagation rules: token-level/attempt-level errors are
//! [`ProviderCallError`], persistence results are [`PersistenceOutcome`]/[`PersistenceError`],
//! and anything that reaches the public [`GenerationError`] has already exhausted retries
//! and fallbacks.

use std::fmt;
use std::time::Duration;

/// Errors classified out of a provider's raw stream.
#[derive(Debug, Clone)]
pub enum ProviderCallError {
    /// Provider explicitly rate-limited the call.
    RateLimit { retry_after: Option<Duration> },
    /// The call did not complete within its deadline.
    Timeout,
    /// Transient provider-side failure (network, 5xx).
    ProviderError { message: String },
    /// The provider's circuit breaker is open; the call was never attempted.
    ProviderDown { provider: String },
    /// Non-retryable failure: malformed request, 4xx other than 429, bad input.
    Fatal { message: String },
}

impl fmt::Display for ProviderCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimit { retry_after } => match retry_after {
                Some(d) => write!(f, "rate limited, retry after {:?}", d),
                None => write!(f, "rate limited"),
            },
            Self::Timeout => write!(f, "provider call timed out"),
            Self::ProviderError { message } => write!(f, "provider error: {}", message),
            Self::ProviderDown { provider } => write!(f, "circuit open for provider {}", provider),
            Self::Fatal { message } => write!(f, "fatal: {}", message),
        }
    }
}

impl std::error::Error for ProviderCallError {}

impl ProviderCallError {
    /// Whether a failure of this kind should count against the provider's circuit breaker.
    ///
    /// `Fatal` never counts: it reflects a bad request, not a misbehaving provider.
    pub fn counts_toward_breaker(&self) -> bool {
        !matches!(self, Self::Fatal { .. })
    }
}

/// Outcome of a persistence attempt. `Deferred` is not a failure: the caller should
/// treat it the same as `Committed` (the buffer already does, see [`crate::buffer`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceOutcome {
    /// Tokens were written to the database.
    Committed,
    /// Database was unavailable; tokens were appended to the WAL instead.
    Deferred,
}

/// Fatal persistence failure: both the database write and the WAL fallback failed.
#[derive(Debug, Clone)]
pub enum PersistenceError {
    /// The database reported a fatal condition (e.g. disk full).
    Database { message: String },
    /// The WAL append itself failed (e.g. disk full).
    WalWrite { message: String },
    /// A WAL line failed to parse during replay and was not the unambiguous trailing line.
    WalCorruption { path: String, line_number: usize },
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Database { message } => write!(f, "persistence failed (database): {}", message),
            Self::WalWrite { message } => write!(f, "persistence failed (wal write): {}", message),
            Self::WalCorruption { path, line_number } => {
                write!(f, "wal corruption in {} at line {}", path, line_number)
            }
        }
    }
}

impl std::error::Error for PersistenceError {}

/// Raised to the pipeline's caller after retries and fallbacks are exhausted.
#[derive(Debug, Clone)]
pub enum GenerationError {
    /// Every model in the fallback list failed.
    Exhausted { last_error: String, attempts: usize },
    /// A fatal, non-retryable error aborted the request immediately.
    Aborted { cause: String },
    /// Tokens could not be durably persisted.
    Persistence(PersistenceError),
    /// The client disconnected or cancelled the request.
    UserAbort,
}

impl fmt::Display for GenerationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted { last_error, attempts } => {
                write!(f, "generation failed after {} attempts: {}", attempts, last_error)
            }
            Self::Aborted { cause } => write!(f, "generation aborted: {}", cause),
            Self::Persistence(e) => write!(f, "generation failed: {}", e),
            Self::UserAbort => write!(f, "generation cancelled by caller"),
        }
    }
}

impl std::error::Error for GenerationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Persistence(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PersistenceError> for GenerationError {
    fn from(e: PersistenceError) -> Self {
        Self::Persistence(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_does_not_count_toward_breaker() {
        let e = ProviderCallError::Fatal { message: "bad request".into() };
        assert!(!e.counts_toward_breaker());
    }

    #[test]
    fn rate_limit_counts_toward_breaker() {
        let e = ProviderCallError::RateLimit { retry_after: None };
        assert!(e.counts_toward_breaker());
    }

    #[test]
    fn provider_down_counts_toward_breaker() {
        let e = ProviderCallError::ProviderDown { provider: "openai".into() };
        assert!(e.counts_toward_breaker());
    }

    #[test]
    fn generation_error_displays_cause() {
        let e = GenerationError::Exhausted { last_error: "timeout".into(), attempts: 4 };
        assert!(e.to_string().contains("4 attempts"));
        assert!(e.to_string().contains("timeout"));
    }
}
