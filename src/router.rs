//! Error Router (C4): a pure decision function mapping a classified provider error to
//! an [`Action`], per the policy table. Backoff uses `1.5^attempt` with uniform jitter
//! in `[0, 1)` seconds: `(1.5 ** attempt_seq) + random.uniform(0, 1)`.

use crate::error::ProviderCallError;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Retry the same model after `delay`.
    Retry { delay: Duration },
    /// Give up on this model and advance to the next one in the fallback list.
    Fallback,
    /// Abort the request; do not retry or fall back.
    Abort,
}

/// The attempt-local context the router needs: how many attempts of *this model*
/// have been made so far (1-indexed, within a single model's retry loop) and the
/// configured ceiling.
#[derive(Debug, Clone, Copy)]
pub struct RouteContext {
    pub attempt: u32,
    pub max_retries: u32,
}

fn exponential_with_jitter(attempt: u32) -> Duration {
    let base = 1.5f64.powi(attempt as i32);
    let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
    Duration::from_secs_f64(base + jitter)
}

/// Decide what to do about `error` given `ctx`. Pure aside from the jitter RNG.
///
/// Every decision is logged with the error's category, the attempt number, and the
/// action chosen, so operators can reconstruct per-category retry/fallback rates from
/// `tracing` output (see SPEC_FULL.md §4.4) without a separate stats admin surface.
pub fn route(error: &ProviderCallError, ctx: RouteContext) -> Action {
    let category = error_category(error);
    let action = match error {
        ProviderCallError::RateLimit { retry_after } => {
            if ctx.attempt < ctx.max_retries {
                let mut delay = exponential_with_jitter(ctx.attempt);
                if let Some(retry_after) = retry_after {
                    delay = delay.max(*retry_after);
                }
                Action::Retry { delay }
            } else {
                Action::Fallback
            }
        }
        ProviderCallError::Timeout => {
            if ctx.attempt < ctx.max_retries {
                Action::Retry { delay: exponential_with_jitter(ctx.attempt) }
            } else {
                Action::Fallback
            }
        }
        ProviderCallError::ProviderDown { .. } => Action::Fallback,
        ProviderCallError::Fatal { .. } => Action::Abort,
        ProviderCallError::ProviderError { .. } => {
            if ctx.attempt < ctx.max_retries {
                Action::Retry { delay: exponential_with_jitter(ctx.attempt) }
            } else {
                Action::Fallback
            }
        }
    };
    tracing::debug!(category, attempt = ctx.attempt, max_retries = ctx.max_retries, action = action_label(&action), "error router decision");
    action
}

fn error_category(error: &ProviderCallError) -> &'static str {
    match error {
        ProviderCallError::RateLimit { .. } => "rate_limit",
        ProviderCallError::Timeout => "timeout",
        ProviderCallError::ProviderDown { .. } => "provider_down",
        ProviderCallError::Fatal { .. } => "fatal",
        ProviderCallError::ProviderError { .. } => "provider_error",
    }
}

fn action_label(action: &Action) -> &'static str {
    match action {
        Action::Retry { .. } => "retry",
        Action::Fallback => "fallback",
        Action::Abort => "abort",
    }
}

/// Uniform jitter in `[1, 3)` seconds applied before switching to a fallback model.
pub fn fallback_jitter() -> Duration {
    Duration::from_secs_f64(rand::thread_rng().gen_range(1.0..3.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_retries_under_max() {
        let action = route(
            &ProviderCallError::RateLimit { retry_after: None },
            RouteContext { attempt: 1, max_retries: 3 },
        );
        assert!(matches!(action, Action::Retry { .. }));
    }

    #[test]
    fn rate_limit_falls_back_at_max() {
        let action = route(
            &ProviderCallError::RateLimit { retry_after: None },
            RouteContext { attempt: 3, max_retries: 3 },
        );
        assert_eq!(action, Action::Fallback);
    }

    #[test]
    fn rate_limit_respects_retry_after_floor() {
        let action = route(
            &ProviderCallError::RateLimit { retry_after: Some(Duration::from_secs(30)) },
            RouteContext { attempt: 1, max_retries: 3 },
        );
        match action {
            Action::Retry { delay } => assert!(delay >= Duration::from_secs(30)),
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn timeout_retries_then_falls_back() {
        assert!(matches!(
            route(&ProviderCallError::Timeout, RouteContext { attempt: 0, max_retries: 3 }),
            Action::Retry { .. }
        ));
        assert_eq!(
            route(&ProviderCallError::Timeout, RouteContext { attempt: 3, max_retries: 3 }),
            Action::Fallback
        );
    }

    #[test]
    fn provider_down_always_falls_back_immediately() {
        let action = route(
            &ProviderCallError::ProviderDown { provider: "openai".into() },
            RouteContext { attempt: 0, max_retries: 3 },
        );
        assert_eq!(action, Action::Fallback);
    }

    #[test]
    fn fatal_always_aborts() {
        let action = route(
            &ProviderCallError::Fatal { message: "bad input".into() },
            RouteContext { attempt: 0, max_retries: 3 },
        );
        assert_eq!(action, Action::Abort);
    }

    #[test]
    fn unknown_provider_error_behaves_like_timeout() {
        assert!(matches!(
            route(
                &ProviderCallError::ProviderError { message: "weird".into() },
                RouteContext { attempt: 0, max_retries: 3 }
            ),
            Action::Retry { .. }
        ));
    }

    #[test]
    fn fallback_jitter_is_within_one_to_three_seconds() {
        for _ in 0..50 {
            let d = fallback_jitter();
            assert!(d >= Duration::from_secs(1));
            assert!(d < Duration::from_secs(3));
        }
    }
}
