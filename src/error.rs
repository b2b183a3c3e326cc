//! Error types for the dispatch stack
//!
//! The limiter and the breaker never use errors for a "no" decision; they
//! return structured values so callers can wait, skip, or escalate. The
//! variants here cover everything that is genuinely an error: provider
//! failures, exhausted fallback chains, misconfiguration, and jobs that ran
//! out of retries.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for the dispatch stack.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Main error type for the dispatch stack.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A local admission decision said no. Carries how long to wait.
    #[error("rate limit exceeded for {service}:{operation}, retry after {retry_after:?}")]
    RateLimitExceeded {
        service: String,
        operation: String,
        retry_after: Duration,
    },

    /// The remote provider itself signalled rate limiting (HTTP 429 or an
    /// equivalent in-band signal).
    #[error("upstream rate limit from {dependency}")]
    UpstreamRateLimit { dependency: String },

    /// The circuit breaker for a dependency is open.
    #[error("circuit open for {dependency} until t={retry_at_ms}ms")]
    CircuitOpen { dependency: String, retry_at_ms: u64 },

    /// The wrapped operation did not complete within its timeout.
    #[error("{dependency} timed out after {after:?}")]
    Timeout { dependency: String, after: Duration },

    /// The provider returned an error.
    #[error("provider error from {dependency}: {message}")]
    Provider { dependency: String, message: String },

    /// Every configured tier was tried and failed. Carries the last
    /// underlying cause for diagnostics; callers are expected to fall back
    /// to a local, dependency-free computation instead of retrying.
    #[error("all providers failed for {use_case}")]
    AllProvidersFailed {
        use_case: String,
        #[source]
        last: Box<DispatchError>,
    },

    /// Invalid configuration. Never retried, surfaced synchronously.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A job exhausted its retry budget and was moved to the dead-letter path.
    #[error("job {job_id} dead-lettered after {attempts} attempts")]
    DeadLetter { job_id: String, attempts: u32 },

    /// The shared store misbehaved.
    #[error("store error: {0}")]
    Store(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// How an error should be handled by the layer that observed it.
///
/// The original system decided ad hoc per call site whether a retryable
/// rejection was logged-and-skipped or surfaced to the caller. This is the
/// single place that policy lives now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry (or skip to the next tier) and log at `warn`; do not surface.
    RetryableSilent,
    /// Retry is allowed but the caller must be told (carries wait hints).
    RetryableSurfaced,
    /// Never retried. Surface immediately.
    Fatal,
}

/// Classify an error under the central retry-surfacing policy.
pub fn classify(error: &DispatchError) -> ErrorClass {
    match error {
        DispatchError::RateLimitExceeded { .. } => ErrorClass::RetryableSurfaced,
        DispatchError::CircuitOpen { .. } => ErrorClass::RetryableSurfaced,
        DispatchError::UpstreamRateLimit { .. } => ErrorClass::RetryableSilent,
        DispatchError::Timeout { .. } => ErrorClass::RetryableSilent,
        DispatchError::Provider { .. } => ErrorClass::RetryableSilent,
        DispatchError::Store(_) => ErrorClass::RetryableSilent,
        DispatchError::AllProvidersFailed { .. } => ErrorClass::Fatal,
        DispatchError::Configuration(_) => ErrorClass::Fatal,
        DispatchError::DeadLetter { .. } => ErrorClass::Fatal,
        DispatchError::Serialization(_) => ErrorClass::Fatal,
    }
}

impl DispatchError {
    /// True for errors the dispatcher and orchestrator may retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(classify(self), ErrorClass::Fatal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_context() {
        let err = DispatchError::RateLimitExceeded {
            service: "whatsapp".into(),
            operation: "messaging".into(),
            retry_after: Duration::from_secs(3),
        };
        assert!(err.to_string().contains("whatsapp:messaging"));

        let err = DispatchError::CircuitOpen {
            dependency: "openai".into(),
            retry_at_ms: 60_000,
        };
        assert!(err.to_string().contains("openai"));
    }

    #[test]
    fn all_providers_failed_preserves_cause() {
        let last = DispatchError::Timeout {
            dependency: "anthropic".into(),
            after: Duration::from_secs(5),
        };
        let err = DispatchError::AllProvidersFailed {
            use_case: "leadScoring".into(),
            last: Box::new(last),
        };
        let source = std::error::Error::source(&err).expect("source");
        assert!(source.to_string().contains("anthropic"));
    }

    #[test]
    fn classification_policy() {
        assert_eq!(
            classify(&DispatchError::Configuration("bad".into())),
            ErrorClass::Fatal
        );
        assert_eq!(
            classify(&DispatchError::UpstreamRateLimit {
                dependency: "openai".into()
            }),
            ErrorClass::RetryableSilent
        );
        assert!(DispatchError::Provider {
            dependency: "cohere".into(),
            message: "500".into()
        }
        .is_retryable());
        assert!(!DispatchError::Configuration("bad".into()).is_retryable());
    }
}
