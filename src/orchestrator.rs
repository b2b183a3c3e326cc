//! Fallback orchestrator
//!
//! What this module provides
//! - The multi-tier provider walk: breaker gate, admission gate, per-tier
//!   timeout race, budget-aware ordering, and the single place a chain of
//!   retryable errors becomes one terminal error
//!
//! Exports
//! - Models
//!   - `Priority::{Normal, High}`
//!   - `ProviderCall<T>` (what a tier invocation yields)
//!   - `FallbackOutcome<T> { value, provider, model, tokens_used }`
//! - Services
//!   - `FallbackOrchestrator::execute_with_fallback`
//!
//! Implementation strategy
//! - Tiers are walked in static priority order unless the ledger reports
//!   budget pressure, in which case a cheapest-first reinterpretation of the
//!   same list is used; `Priority::High` always restores static order.
//!   Budget is a bias, never a block.
//! - A tier whose breaker is open or whose admission check says no is
//!   skipped without invoking its operation. Skips log at `warn`/`debug`
//!   under the central surfacing policy; only full exhaustion surfaces.
//! - When the first-choice tier fails with an upstream rate-limit signal,
//!   a bounded grace sleep runs before the next tier. Dropping the
//!   orchestrator future cancels the sleep and the in-flight tier race, and
//!   records nothing on the breaker.
//!
//! Testing strategy
//! - Scripted operation factories counting invocations per provider; assert
//!   which tiers ran, what the outcome carried, and what the ledger recorded

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::breaker::BreakerRegistry;
use crate::error::{DispatchError, Result};
use crate::ledger::UsageLedger;
use crate::limiter::RateLimiter;
use crate::providers::{Provider, ProviderTier, TierCatalog, UseCase};

/// Caller-declared urgency. High priority keeps static tier order even
/// under budget pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    #[default]
    Normal,
    High,
}

/// What one tier invocation yields: the caller's value plus the token count
/// used for cost accounting.
#[derive(Debug, Clone)]
pub struct ProviderCall<T> {
    pub value: T,
    pub tokens_used: u64,
}

/// Successful orchestrator outcome, reporting which tier served it.
#[derive(Debug, Clone)]
pub struct FallbackOutcome<T> {
    pub value: T,
    pub provider: Provider,
    pub model: String,
    pub tokens_used: u64,
}

/// Multi-tier provider fallback over breaker + limiter + ledger.
pub struct FallbackOrchestrator {
    catalog: TierCatalog,
    breakers: Arc<BreakerRegistry>,
    limiter: Arc<RateLimiter>,
    ledger: Arc<UsageLedger>,
    account: String,
    /// Bounded wait after the first-choice tier reports upstream rate
    /// limiting, before moving to the next tier.
    rate_limit_grace: Duration,
}

impl FallbackOrchestrator {
    pub fn new(
        catalog: TierCatalog,
        breakers: Arc<BreakerRegistry>,
        limiter: Arc<RateLimiter>,
        ledger: Arc<UsageLedger>,
        account: impl Into<String>,
    ) -> Self {
        Self {
            catalog,
            breakers,
            limiter,
            ledger,
            account: account.into(),
            rate_limit_grace: Duration::from_millis(2_000),
        }
    }

    pub fn with_rate_limit_grace(mut self, grace: Duration) -> Self {
        self.rate_limit_grace = grace;
        self
    }

    pub fn catalog(&self) -> &TierCatalog {
        &self.catalog
    }

    /// The order tiers will actually be tried in right now.
    async fn tier_order(&self, use_case: UseCase, priority: Priority) -> Result<Vec<ProviderTier>> {
        let tiers = self
            .catalog
            .tiers(use_case)
            .ok_or_else(|| {
                DispatchError::Configuration(format!("no tiers configured for {use_case}"))
            })?
            .to_vec();

        if priority == Priority::High {
            return Ok(tiers);
        }
        // Budget is soft: if the ledger cannot be read, fall back to static
        // order rather than failing the call.
        match self.ledger.under_pressure().await {
            Ok(true) => {
                let mut reordered = tiers;
                reordered.sort_by(|a, b| {
                    a.cost_per_token
                        .partial_cmp(&b.cost_per_token)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                debug!(use_case = %use_case, "budget pressure: cheapest tier first");
                Ok(reordered)
            }
            Ok(false) => Ok(tiers),
            Err(err) => {
                warn!(use_case = %use_case, error = %err, "budget check failed, keeping static order");
                Ok(tiers)
            }
        }
    }

    /// Walk the tiers for `use_case` until one succeeds.
    ///
    /// The operation factory is invoked once per attempted tier, racing that
    /// tier's timeout. Success reports to the tier's breaker and the ledger
    /// and returns immediately; later tiers are never tried. Exhaustion
    /// yields `AllProvidersFailed` carrying the last underlying cause, at
    /// which point callers are expected to use a local deterministic
    /// fallback rather than retrying here.
    pub async fn execute_with_fallback<T, F, Fut>(
        &self,
        use_case: UseCase,
        priority: Priority,
        factory: F,
    ) -> Result<FallbackOutcome<T>>
    where
        F: Fn(ProviderTier) -> Fut,
        Fut: Future<Output = Result<ProviderCall<T>>>,
    {
        let order = self.tier_order(use_case, priority).await?;
        let mut last_error: Option<DispatchError> = None;

        for (position, tier) in order.into_iter().enumerate() {
            let breaker = self.breakers.breaker(tier.provider.as_str());
            if !breaker.allows() {
                warn!(
                    use_case = %use_case,
                    provider = %tier.provider,
                    "skipping tier: circuit open"
                );
                last_error = Some(DispatchError::CircuitOpen {
                    dependency: tier.provider.as_str().to_string(),
                    retry_at_ms: breaker.snapshot().next_attempt_ms,
                });
                continue;
            }

            let decision = self
                .limiter
                .check_and_reserve(tier.provider.as_str(), use_case.as_str(), &self.account)
                .await?;
            if !decision.allowed {
                debug!(
                    use_case = %use_case,
                    provider = %tier.provider,
                    retry_after_ms = decision.retry_after_ms(),
                    "skipping tier: admission rejected"
                );
                last_error = Some(DispatchError::RateLimitExceeded {
                    service: tier.provider.as_str().to_string(),
                    operation: use_case.as_str().to_string(),
                    retry_after: decision.retry_after,
                });
                continue;
            }

            match breaker
                .execute_with_timeout(tier.timeout(), factory(tier.clone()))
                .await
            {
                Ok(call) => {
                    if let Err(err) = self.ledger.record(use_case, &tier, call.tokens_used).await {
                        warn!(use_case = %use_case, error = %err, "usage record failed");
                    }
                    return Ok(FallbackOutcome {
                        value: call.value,
                        provider: tier.provider,
                        model: tier.model,
                        tokens_used: call.tokens_used,
                    });
                }
                Err(err) => {
                    warn!(
                        use_case = %use_case,
                        provider = %tier.provider,
                        error = %err,
                        "tier failed"
                    );
                    let upstream_limited =
                        matches!(err, DispatchError::UpstreamRateLimit { .. });
                    last_error = Some(err);
                    if position == 0 && upstream_limited {
                        // Give the primary's quota a moment before burning
                        // the fallback tiers. Cancellable with the caller.
                        tokio::time::sleep(self.rate_limit_grace).await;
                    }
                }
            }
        }

        Err(DispatchError::AllProvidersFailed {
            use_case: use_case.as_str().to_string(),
            last: Box::new(last_error.unwrap_or_else(|| {
                DispatchError::Configuration(format!("no usable tiers for {use_case}"))
            })),
        })
    }
}
