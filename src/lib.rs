//! # dispatch-stack
//!
//! A resilient dispatch layer for outbound channel traffic and multi-tier
//! AI provider calls: admission control over shared window counters, circuit
//! breakers per dependency, budget-aware provider fallback, cost accounting,
//! and a throttled batch dispatcher with retries and a dead-letter path.
//!
//! ## Core Concepts
//!
//! - **Store**: one shared atomic store backs all admission state, so any
//!   number of workers agree on every counter
//! - **Limiter**: sliding or fixed window rules per (service, operation),
//!   checked per caller identifier; a "no" is a value with a retry hint
//! - **Breakers**: a lazily-populated registry of per-dependency circuit
//!   breakers, shared by the orchestrator, the dispatcher, and any Tower
//!   services wrapped in [`layers::BreakerLayer`]
//! - **Orchestrator**: walks an ordered provider tier list, skipping tiers
//!   whose breaker or rate limit says no, reordering under budget pressure
//! - **Dispatcher**: spaces batches per channel schedule and retries with
//!   backoff until delivery or dead-letter
//!
//! ## Getting Started
//!
//! ```rust,no_run
//! use dispatch_stack::{DispatchConfig, DispatchStack, Priority, ProviderCall, UseCase};
//!
//! # async fn example() -> dispatch_stack::Result<()> {
//! let stack = DispatchStack::in_memory(DispatchConfig::default())?;
//!
//! let outcome = stack
//!     .execute_with_fallback(UseCase::LeadScoring, Priority::Normal, |tier| async move {
//!         // Call the provider named by `tier` here.
//!         Ok(ProviderCall { value: 85u32, tokens_used: 40 })
//!     })
//!     .await?;
//! println!("scored by {} ({})", outcome.provider, outcome.model);
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod breaker;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod layers;
pub mod ledger;
pub mod limiter;
pub mod orchestrator;
pub mod providers;
pub mod stack;
pub mod store;
pub mod window;

// Public re-exports for convenience
pub use backoff::{Backoff, BackoffKind};
pub use breaker::{BreakerConfig, BreakerRegistry, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ChannelConfig, DispatchConfig};
pub use dispatcher::{
    BatchDispatcher, Job, JobQueue, JobRunner, JobSubmission, MemoryQueue, WorkerHandle,
};
pub use error::{classify, DispatchError, ErrorClass, Result};
pub use ledger::{BudgetConfig, UsageLedger, UsageRecord};
pub use limiter::{Decision, RateLimitTable, RateLimiter};
pub use orchestrator::{FallbackOrchestrator, FallbackOutcome, Priority, ProviderCall};
pub use providers::{Provider, ProviderTier, TierCatalog, UseCase};
pub use stack::DispatchStack;
pub use store::{AtomicStore, MemoryStore, SlidingReserve};
pub use window::{WindowKind, WindowRule};

// Re-export Tower traits users of `layers` need
pub use tower::{Layer, Service, ServiceExt};
