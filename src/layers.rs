//! Tower middleware over the dispatch primitives
//!
//! What this module provides
//! - Reusable Tower layers so a model client or webhook sender built as a
//!   `Service` picks up admission control and circuit breaking without
//!   calling the limiter or registry by hand
//!
//! Exports
//! - Layers
//!   - `AdmissionLayer` (gates calls through a `RateLimiter` rule)
//!   - `BreakerLayer` (wraps calls in a shared `CircuitBreaker`)
//!
//! Implementation strategy
//! - Both layers hold the inner service behind `Arc<Mutex<S>>` and gate
//!   BEFORE touching it, so a rejected call never invokes (or readies) the
//!   inner service
//! - `BreakerLayer` shares the same `CircuitBreaker` instance the registry
//!   hands out, so middleware traffic and direct `execute` traffic count
//!   against one state machine
//!
//! Testing strategy
//! - `tower::service_fn` fakes with call counters; assert the inner service
//!   is not invoked once the gate rejects

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::Mutex;
use tower::{Layer, Service, ServiceExt};

use crate::breaker::CircuitBreaker;
use crate::error::DispatchError;
use crate::limiter::RateLimiter;

/// Gate a service behind one (service, operation, identifier) admission rule.
pub struct AdmissionLayer {
    limiter: Arc<RateLimiter>,
    service: String,
    operation: String,
    identifier: String,
}

impl AdmissionLayer {
    pub fn new(
        limiter: Arc<RateLimiter>,
        service: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            limiter,
            service: service.into(),
            operation: operation.into(),
            identifier: crate::limiter::GLOBAL_IDENTIFIER.into(),
        }
    }

    /// Use a per-caller identifier instead of the shared global budget.
    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = identifier.into();
        self
    }
}

pub struct Admission<S> {
    inner: Arc<Mutex<S>>,
    limiter: Arc<RateLimiter>,
    service: String,
    operation: String,
    identifier: String,
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = Admission<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Admission {
            inner: Arc::new(Mutex::new(inner)),
            limiter: self.limiter.clone(),
            service: self.service.clone(),
            operation: self.operation.clone(),
            identifier: self.identifier.clone(),
        }
    }
}

impl<S, Req> Service<Req> for Admission<S>
where
    Req: Send + 'static,
    S: Service<Req, Error = DispatchError> + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = DispatchError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let limiter = self.limiter.clone();
        let inner = self.inner.clone();
        let service = self.service.clone();
        let operation = self.operation.clone();
        let identifier = self.identifier.clone();
        Box::pin(async move {
            let decision = limiter
                .check_and_reserve(&service, &operation, &identifier)
                .await?;
            if !decision.allowed {
                return Err(DispatchError::RateLimitExceeded {
                    service,
                    operation,
                    retry_after: decision.retry_after,
                });
            }
            let mut guard = inner.lock().await;
            ServiceExt::ready(&mut *guard).await?.call(req).await
        })
    }
}

/// Wrap a service in a shared circuit breaker, default timeout included.
pub struct BreakerLayer {
    breaker: Arc<CircuitBreaker>,
}

impl BreakerLayer {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self { breaker }
    }
}

pub struct Breaker<S> {
    inner: Arc<Mutex<S>>,
    breaker: Arc<CircuitBreaker>,
}

impl<S> Layer<S> for BreakerLayer {
    type Service = Breaker<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Breaker {
            inner: Arc::new(Mutex::new(inner)),
            breaker: self.breaker.clone(),
        }
    }
}

impl<S, Req> Service<Req> for Breaker<S>
where
    Req: Send + 'static,
    S: Service<Req, Error = DispatchError> + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = DispatchError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let breaker = self.breaker.clone();
        let inner = self.inner.clone();
        Box::pin(async move {
            breaker
                .execute(async move {
                    let mut guard = inner.lock().await;
                    ServiceExt::ready(&mut *guard).await?.call(req).await
                })
                .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, BreakerState};
    use crate::clock::ManualClock;
    use crate::limiter::RateLimitTable;
    use crate::store::MemoryStore;
    use crate::window::WindowRule;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::service_fn;

    fn limiter_with_rule(rule: WindowRule) -> Arc<RateLimiter> {
        let clock = ManualClock::shared(1_000_000);
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let mut limits: RateLimitTable = HashMap::new();
        limits
            .entry("sms".into())
            .or_default()
            .insert("send".into(), rule);
        Arc::new(RateLimiter::new(store, clock, limits))
    }

    #[tokio::test]
    async fn admission_rejects_without_invoking_inner() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_cl = calls.clone();
        let svc = service_fn(move |()| {
            let calls = calls_cl.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<(), DispatchError>(())
            }
        });
        let limiter = limiter_with_rule(WindowRule::sliding(1, 60_000));
        let mut svc = AdmissionLayer::new(limiter, "sms", "send").layer(svc);

        ServiceExt::ready(&mut svc)
            .await
            .unwrap()
            .call(())
            .await
            .unwrap();
        let err = ServiceExt::ready(&mut svc)
            .await
            .unwrap()
            .call(())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::RateLimitExceeded { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn breaker_layer_short_circuits_once_open() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_cl = calls.clone();
        let svc = service_fn(move |()| {
            let calls = calls_cl.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(DispatchError::Provider {
                    dependency: "openai".into(),
                    message: "boom".into(),
                })
            }
        });
        let clock = ManualClock::shared(0);
        let breaker = Arc::new(CircuitBreaker::new(
            "openai",
            BreakerConfig {
                error_threshold: 2,
                ..Default::default()
            },
            clock,
        ));
        let mut svc = BreakerLayer::new(breaker.clone()).layer(svc);

        for _ in 0..2 {
            let _ = ServiceExt::ready(&mut svc).await.unwrap().call(()).await;
        }
        assert_eq!(breaker.snapshot().state, BreakerState::Open);
        let err = ServiceExt::ready(&mut svc)
            .await
            .unwrap()
            .call(())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::CircuitOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn breaker_layer_shares_state_with_direct_calls() {
        let clock = ManualClock::shared(0);
        let breaker = Arc::new(CircuitBreaker::new(
            "anthropic",
            BreakerConfig {
                error_threshold: 1,
                ..Default::default()
            },
            clock,
        ));
        // Trip the breaker outside the middleware.
        breaker.record_failure();

        let svc = service_fn(|()| async { Ok::<(), DispatchError>(()) });
        let mut svc = BreakerLayer::new(breaker).layer(svc);
        let err = ServiceExt::ready(&mut svc)
            .await
            .unwrap()
            .call(())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::CircuitOpen { .. }));
    }
}
