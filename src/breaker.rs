//! Circuit breaker
//!
//! What this module provides
//! - A per-dependency failure/success state machine (CLOSED/OPEN/HALF_OPEN)
//!   and a registry that creates breakers lazily by dependency name
//!
//! Exports
//! - Models
//!   - `BreakerState`, `BreakerConfig`, `BreakerSnapshot`
//! - Services
//!   - `CircuitBreaker::execute` (timeout race included)
//!   - `BreakerRegistry::{breaker, execute_with_breaker, status, subscribe}`
//!
//! Implementation strategy
//! - All transitions run under one mutex per breaker; lock scopes contain no
//!   awaits. A bounded number of extra trial calls may slip through while
//!   HALF_OPEN, which is an accepted relaxation; CLOSED->OPEN and
//!   OPEN->HALF_OPEN transitions are never lost.
//! - The wrapped operation races a timer via `tokio::time::timeout`; the
//!   timer winning drops the operation future instead of awaiting it, and a
//!   timeout counts as a failure exactly like a provider error.
//! - Dropping an in-flight `execute` future records neither success nor
//!   failure.
//! - State changes notify an explicit observer list instead of an event bus;
//!   observers are for monitoring only and correctness never depends on them.
//!
//! Testing strategy
//! - `ManualClock` drives cooldown expiry so OPEN -> HALF_OPEN is tested
//!   without sleeping through real reset timeouts

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::clock::Clock;
use crate::error::{DispatchError, Result};

/// Breaker states, in the classic three-state arrangement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-breaker thresholds and timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that trip CLOSED -> OPEN.
    pub error_threshold: u32,
    /// Consecutive HALF_OPEN successes that restore CLOSED.
    pub success_threshold: u32,
    /// Cooldown before an OPEN breaker lets a trial call through.
    pub reset_timeout_ms: u64,
    /// Default timeout raced against the wrapped operation.
    pub operation_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            error_threshold: 5,
            success_threshold: 2,
            reset_timeout_ms: 60_000,
            operation_timeout_ms: 60_000,
        }
    }
}

/// Read-only view of one breaker, for status endpoints and logs.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub failures: u32,
    pub successes: u32,
    pub last_failure_ms: Option<u64>,
    pub next_attempt_ms: u64,
}

#[derive(Debug)]
struct Gauges {
    state: BreakerState,
    failures: u32,
    successes: u32,
    last_failure_ms: Option<u64>,
    next_attempt_ms: u64,
}

type TransitionHook = dyn Fn(&str, BreakerState) + Send + Sync;
type HookList = Arc<Mutex<Vec<Arc<TransitionHook>>>>;

/// Failure state machine for one dependency name.
pub struct CircuitBreaker {
    name: String,
    cfg: BreakerConfig,
    clock: Arc<dyn Clock>,
    gauges: Mutex<Gauges>,
    hooks: HookList,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, cfg: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_hooks(name, cfg, clock, Arc::new(Mutex::new(Vec::new())))
    }

    fn with_hooks(
        name: impl Into<String>,
        cfg: BreakerConfig,
        clock: Arc<dyn Clock>,
        hooks: HookList,
    ) -> Self {
        Self {
            name: name.into(),
            cfg,
            clock,
            gauges: Mutex::new(Gauges {
                state: BreakerState::Closed,
                failures: 0,
                successes: 0,
                last_failure_ms: None,
                next_attempt_ms: 0,
            }),
            hooks,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a call would currently be admitted. Non-mutating; used by the
    /// orchestrator to skip tiers whose breaker is open.
    pub fn allows(&self) -> bool {
        let gauges = self.lock();
        gauges.state != BreakerState::Open || self.clock.now_ms() >= gauges.next_attempt_ms
    }

    /// Run `op` through the breaker with the configured default timeout.
    pub async fn execute<T, F>(&self, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.execute_with_timeout(Duration::from_millis(self.cfg.operation_timeout_ms), op)
            .await
    }

    /// Run `op` through the breaker, racing it against `timeout`.
    ///
    /// When the breaker is open and the cooldown has not elapsed, `op` is
    /// never polled and `CircuitOpen` is returned immediately. Once the
    /// cooldown elapses the state advances to HALF_OPEN before execution.
    pub async fn execute_with_timeout<T, F>(&self, timeout: Duration, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.admit()?;
        match tokio::time::timeout(timeout, op).await {
            Ok(Ok(value)) => {
                self.record_success();
                Ok(value)
            }
            Ok(Err(err)) => {
                self.record_failure();
                Err(err)
            }
            Err(_elapsed) => {
                self.record_failure();
                Err(DispatchError::Timeout {
                    dependency: self.name.clone(),
                    after: timeout,
                })
            }
        }
    }

    fn admit(&self) -> Result<()> {
        let mut notify = None;
        {
            let mut gauges = self.lock();
            if gauges.state == BreakerState::Open {
                let now = self.clock.now_ms();
                if now < gauges.next_attempt_ms {
                    return Err(DispatchError::CircuitOpen {
                        dependency: self.name.clone(),
                        retry_at_ms: gauges.next_attempt_ms,
                    });
                }
                gauges.state = BreakerState::HalfOpen;
                gauges.successes = 0;
                notify = Some(BreakerState::HalfOpen);
            }
        }
        if let Some(state) = notify {
            self.notify(state);
        }
        Ok(())
    }

    /// Count a success against this breaker.
    pub fn record_success(&self) {
        let mut notify = None;
        {
            let mut gauges = self.lock();
            gauges.failures = 0;
            if gauges.state == BreakerState::HalfOpen {
                gauges.successes += 1;
                if gauges.successes >= self.cfg.success_threshold {
                    gauges.state = BreakerState::Closed;
                    gauges.successes = 0;
                    notify = Some(BreakerState::Closed);
                }
            }
        }
        if let Some(state) = notify {
            self.notify(state);
        }
    }

    /// Count a failure against this breaker. Trips CLOSED -> OPEN at the
    /// error threshold; any HALF_OPEN failure reopens immediately.
    pub fn record_failure(&self) {
        let now = self.clock.now_ms();
        let mut notify = None;
        {
            let mut gauges = self.lock();
            gauges.failures += 1;
            gauges.last_failure_ms = Some(now);
            match gauges.state {
                BreakerState::HalfOpen => {
                    gauges.state = BreakerState::Open;
                    gauges.successes = 0;
                    gauges.next_attempt_ms = now + self.cfg.reset_timeout_ms;
                    notify = Some(BreakerState::Open);
                }
                BreakerState::Closed if gauges.failures >= self.cfg.error_threshold => {
                    gauges.state = BreakerState::Open;
                    gauges.next_attempt_ms = now + self.cfg.reset_timeout_ms;
                    notify = Some(BreakerState::Open);
                }
                _ => {}
            }
        }
        if let Some(state) = notify {
            self.notify(state);
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let gauges = self.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: gauges.state,
            failures: gauges.failures,
            successes: gauges.successes,
            last_failure_ms: gauges.last_failure_ms,
            next_attempt_ms: gauges.next_attempt_ms,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Gauges> {
        // Lock scopes never hold across awaits, and hooks run outside the
        // lock, so poisoning only happens if a hook-free critical section
        // panicked. Propagate the inner state anyway.
        match self.gauges.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn notify(&self, state: BreakerState) {
        let hooks: Vec<Arc<TransitionHook>> = match self.hooks.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for hook in hooks {
            hook(&self.name, state);
        }
    }
}

/// Lazily-populated map of breakers by dependency name.
///
/// One registry per process; every dependency gets one breaker for its
/// lifetime. A logging hook is installed by default so state changes show up
/// in the logs the way the original system surfaced them.
pub struct BreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    default_cfg: BreakerConfig,
    clock: Arc<dyn Clock>,
    hooks: HookList,
}

impl BreakerRegistry {
    pub fn new(default_cfg: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let hooks: HookList = Arc::new(Mutex::new(Vec::new()));
        let registry = Self {
            breakers: Mutex::new(HashMap::new()),
            default_cfg,
            clock,
            hooks,
        };
        registry.subscribe(Arc::new(|name: &str, state: BreakerState| {
            warn!(dependency = name, ?state, "circuit breaker state change");
        }));
        registry
    }

    /// Register an observer for state transitions across all breakers,
    /// including ones created later.
    pub fn subscribe(&self, hook: Arc<TransitionHook>) {
        match self.hooks.lock() {
            Ok(mut guard) => guard.push(hook),
            Err(poisoned) => poisoned.into_inner().push(hook),
        }
    }

    /// The breaker for `name`, created with the registry default config on
    /// first use.
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breaker_with(name, self.default_cfg)
    }

    /// The breaker for `name`, created with `cfg` on first use. Config is
    /// fixed at creation; later calls with a different config get the
    /// existing instance.
    pub fn breaker_with(&self, name: &str, cfg: BreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = match self.breakers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::with_hooks(
                    name,
                    cfg,
                    self.clock.clone(),
                    self.hooks.clone(),
                ))
            })
            .clone()
    }

    /// Run `op` through the named dependency's breaker.
    pub async fn execute_with_breaker<T, F>(&self, name: &str, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.breaker(name).execute(op).await
    }

    /// Snapshot of every breaker, keyed by dependency name.
    pub fn status(&self) -> HashMap<String, BreakerSnapshot> {
        let breakers = match self.breakers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        breakers
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.snapshot()))
            .collect()
    }
}
