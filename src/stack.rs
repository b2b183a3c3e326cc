//! Assembled dispatch stack
//!
//! What this module provides
//! - One facade that wires the limiter, breaker registry, ledger,
//!   orchestrator, and batch dispatcher from a `DispatchConfig` plus the
//!   store/queue/clock handles, so application code holds a single value
//!
//! Exports
//! - Services
//!   - `DispatchStack::{new, in_memory}`
//!   - Delegating methods for admission, breaker execution, provider
//!     fallback, and batch submission
//!   - `spawn_status_logger` (periodic breaker status log + persisted
//!     snapshots)
//!
//! Implementation strategy
//! - Construction validates the config once; everything downstream trusts it
//! - Components share one store and one clock so admission counters, usage
//!   records, and breaker cooldowns agree on time

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use crate::breaker::{BreakerRegistry, BreakerSnapshot, CircuitBreaker};
use crate::clock::{Clock, SystemClock};
use crate::config::DispatchConfig;
use crate::dispatcher::{BatchDispatcher, JobQueue, JobRunner, JobSubmission, MemoryQueue, WorkerHandle};
use crate::error::Result;
use crate::ledger::UsageLedger;
use crate::limiter::{Decision, RateLimiter};
use crate::orchestrator::{FallbackOrchestrator, FallbackOutcome, Priority, ProviderCall};
use crate::providers::{ProviderTier, UseCase};
use crate::store::AtomicStore;

/// The wired-up dispatch layer.
pub struct DispatchStack {
    config: DispatchConfig,
    store: Arc<dyn AtomicStore>,
    limiter: Arc<RateLimiter>,
    breakers: Arc<BreakerRegistry>,
    ledger: Arc<UsageLedger>,
    orchestrator: FallbackOrchestrator,
    dispatcher: Arc<BatchDispatcher>,
    workers: std::sync::Mutex<Vec<WorkerHandle>>,
}

impl std::fmt::Debug for DispatchStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchStack")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DispatchStack {
    /// Wire a stack from a validated config and shared handles.
    pub fn new(
        config: DispatchConfig,
        store: Arc<dyn AtomicStore>,
        queue: Arc<dyn JobQueue>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let limiter = Arc::new(RateLimiter::new(
            store.clone(),
            clock.clone(),
            config.rate_limits.clone(),
        ));
        let breakers = Arc::new(BreakerRegistry::new(config.breaker, clock.clone()));
        let ledger = Arc::new(UsageLedger::new(
            store.clone(),
            clock.clone(),
            config.budget,
        ));
        let orchestrator = FallbackOrchestrator::new(
            config.tiers.clone(),
            breakers.clone(),
            limiter.clone(),
            ledger.clone(),
            config.account.clone(),
        )
        .with_rate_limit_grace(Duration::from_millis(config.rate_limit_grace_ms));
        let dispatcher = Arc::new(BatchDispatcher::new(
            queue,
            limiter.clone(),
            breakers.clone(),
            config.channels.clone(),
            clock,
        ));
        Ok(Self {
            config,
            store,
            limiter,
            breakers,
            ledger,
            orchestrator,
            dispatcher,
            workers: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Single-process stack over the in-memory store and queue.
    pub fn in_memory(config: DispatchConfig) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = Arc::new(crate::store::MemoryStore::new(clock.clone()));
        let queue = Arc::new(MemoryQueue::new(clock.clone()));
        Self::new(config, store, queue, clock)
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn ledger(&self) -> &Arc<UsageLedger> {
        &self.ledger
    }

    pub fn dispatcher(&self) -> &Arc<BatchDispatcher> {
        &self.dispatcher
    }

    /// Admission check for one (service, operation, identifier) triple.
    pub async fn check_and_reserve(
        &self,
        service: &str,
        operation: &str,
        identifier: &str,
    ) -> Result<Decision> {
        self.limiter
            .check_and_reserve(service, operation, identifier)
            .await
    }

    /// The named dependency's breaker, for direct or layered use.
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers.breaker(name)
    }

    /// Run `op` through the named dependency's breaker.
    pub async fn execute_with_breaker<T, F>(&self, name: &str, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.breakers.execute_with_breaker(name, op).await
    }

    /// Walk the configured provider tiers for `use_case`.
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
        self.orchestrator
            .execute_with_fallback(use_case, priority, factory)
            .await
    }

    /// Enqueue a batch for a channel, spaced per its schedule.
    pub async fn submit_batch(
        &self,
        channel: &str,
        submissions: Vec<JobSubmission>,
    ) -> Result<Vec<Uuid>> {
        self.dispatcher.submit(channel, submissions).await
    }

    /// Spawn a polling worker for one channel. The stack keeps the handle;
    /// `shutdown` stops every worker it spawned.
    pub fn spawn_worker(
        &self,
        channel: impl Into<String>,
        runner: Arc<dyn JobRunner>,
        poll_interval: Duration,
    ) {
        let handle = self
            .dispatcher
            .clone()
            .spawn_worker(channel, runner, poll_interval);
        match self.workers.lock() {
            Ok(mut workers) => workers.push(handle),
            Err(poisoned) => poisoned.into_inner().push(handle),
        }
    }

    /// Stop every spawned worker, draining their in-flight jobs first. The
    /// ledger writes through on every record, so nothing else needs flushing.
    pub async fn shutdown(&self) {
        let handles = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for handle in handles {
            handle.stop().await;
        }
    }

    /// Snapshot of every breaker the stack has created so far.
    pub fn breaker_status(&self) -> std::collections::HashMap<String, BreakerSnapshot> {
        self.breakers.status()
    }

    /// Periodic status task: logs breaker state and persists snapshots under
    /// `breaker_status:{name}` so out-of-process dashboards can read them.
    /// Abort the returned handle to stop it.
    pub fn spawn_status_logger(&self) -> tokio::task::JoinHandle<()> {
        let breakers = self.breakers.clone();
        let store = self.store.clone();
        let every = Duration::from_millis(self.config.status_log_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let status = breakers.status();
                for (name, snapshot) in &status {
                    info!(
                        dependency = name.as_str(),
                        state = ?snapshot.state,
                        failures = snapshot.failures,
                        "breaker status"
                    );
                    let serialized = match serde_json::to_string(snapshot) {
                        Ok(serialized) => serialized,
                        Err(err) => {
                            warn!(error = %err, "status snapshot serialization failed");
                            continue;
                        }
                    };
                    if let Err(err) = store
                        .put_with_ttl(&format!("breaker_status:{name}"), &serialized, every * 3)
                        .await
                    {
                        warn!(error = %err, "status snapshot write failed");
                    }
                }
            }
        })
    }
}
