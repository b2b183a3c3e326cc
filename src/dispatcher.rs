//! Batch dispatcher
//!
//! What this module provides
//! - Throttled batch/queue dispatch for rate-limited channels: spacing,
//!   bounded concurrency, retry with backoff, and a dead-letter path
//!
//! Exports
//! - Models
//!   - `Job`, `JobSubmission`
//! - Services
//!   - `JobQueue` (push/pull/ack/nack/dead_letter, the durable-broker seam)
//!   - `MemoryQueue`
//!   - `JobRunner` + `runner_fn`
//!   - `BatchDispatcher::{submit, process_available, spawn_worker}`
//!
//! Implementation strategy
//! - A batch of K jobs for channel C gets `not_before = submit + i * d`
//!   where `d` is C's configured inter-job spacing; `not_before` is
//!   monotonically non-decreasing in submission order, actual dispatch
//!   order across workers is best effort
//! - Workers pull ready jobs up to C's concurrency bound (a semaphore) and
//!   run them through the limiter + breaker stack; failures reschedule with
//!   exponential backoff until `max_attempts`, then park in the dead-letter
//!   path with the full failure history attached
//! - Unknown channels and malformed jobs are configuration errors surfaced
//!   synchronously to the submitter, never queued
//!
//! Testing strategy
//! - `MemoryQueue` + `ManualClock`: advance past `not_before`/backoff
//!   deadlines and sweep with `process_available`, no real sleeps in the
//!   retry tests

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::breaker::BreakerRegistry;
use crate::clock::Clock;
use crate::config::ChannelConfig;
use crate::error::{DispatchError, Result};
use crate::limiter::RateLimiter;

/// One unit of outbound work for a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub channel: String,
    pub payload: serde_json::Value,
    /// Per-caller admission identifier (phone number, mailbox, page id).
    pub identifier: String,
    /// Completed attempts so far.
    pub attempt: u32,
    pub max_attempts: u32,
    /// Earliest dispatch time, milliseconds since epoch.
    pub not_before_ms: u64,
    /// One entry per failed attempt, for the dead-letter record.
    pub failure_history: Vec<String>,
}

/// What a caller hands to `submit`: payload plus admission identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSubmission {
    pub payload: serde_json::Value,
    pub identifier: String,
}

/// The durable queue/broker seam. The dispatcher is a scheduling policy on
/// top of this; durability is the implementation's concern.
#[async_trait]
pub trait JobQueue: Send + Sync + 'static {
    async fn push(&self, job: Job) -> Result<()>;

    /// Earliest ready job for the channel (`now >= not_before`), moved to
    /// in-flight. `None` when nothing is ready.
    async fn pull(&self, channel: &str, now_ms: u64) -> Result<Option<Job>>;

    /// Acknowledge a delivered in-flight job.
    async fn ack(&self, job_id: Uuid) -> Result<()>;

    /// Return an in-flight job to the queue, ready again after `delay`.
    async fn nack(&self, job: Job, delay: Duration) -> Result<()>;

    /// Park an in-flight job terminally.
    async fn dead_letter(&self, job: Job) -> Result<()>;
}

#[derive(Default)]
struct QueueInner {
    ready: Vec<Job>,
    in_flight: HashMap<Uuid, Job>,
    dead: Vec<Job>,
}

/// Process-local `JobQueue` for tests and single-node deployments.
pub struct MemoryQueue {
    clock: Arc<dyn Clock>,
    inner: Mutex<QueueInner>,
}

impl MemoryQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(QueueInner::default()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, QueueInner>> {
        self.inner
            .lock()
            .map_err(|_| DispatchError::Store("job queue mutex poisoned".into()))
    }

    /// Queued (not in-flight, not dead) jobs for a channel, soonest first.
    pub fn ready_jobs(&self, channel: &str) -> Vec<Job> {
        let inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut jobs: Vec<Job> = inner
            .ready
            .iter()
            .filter(|job| job.channel == channel)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.not_before_ms);
        jobs
    }

    /// Terminally parked jobs for a channel.
    pub fn dead_letters(&self, channel: &str) -> Vec<Job> {
        let inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner
            .dead
            .iter()
            .filter(|job| job.channel == channel)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn push(&self, job: Job) -> Result<()> {
        self.lock()?.ready.push(job);
        Ok(())
    }

    async fn pull(&self, channel: &str, now_ms: u64) -> Result<Option<Job>> {
        let mut inner = self.lock()?;
        let ready_idx = inner
            .ready
            .iter()
            .enumerate()
            .filter(|(_, job)| job.channel == channel && job.not_before_ms <= now_ms)
            .min_by_key(|(_, job)| job.not_before_ms)
            .map(|(idx, _)| idx);
        let Some(idx) = ready_idx else {
            return Ok(None);
        };
        let job = inner.ready.swap_remove(idx);
        inner.in_flight.insert(job.id, job.clone());
        Ok(Some(job))
    }

    async fn ack(&self, job_id: Uuid) -> Result<()> {
        self.lock()?.in_flight.remove(&job_id);
        Ok(())
    }

    async fn nack(&self, mut job: Job, delay: Duration) -> Result<()> {
        let mut inner = self.lock()?;
        inner.in_flight.remove(&job.id);
        job.not_before_ms = self.clock.now_ms() + delay.as_millis() as u64;
        inner.ready.push(job);
        Ok(())
    }

    async fn dead_letter(&self, job: Job) -> Result<()> {
        let mut inner = self.lock()?;
        inner.in_flight.remove(&job.id);
        inner.dead.push(job);
        Ok(())
    }
}

/// The provider invocation for one channel: actually deliver a job.
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    async fn run(&self, job: Job) -> Result<()>;
}

struct FnRunner<F>(F);

#[async_trait]
impl<F, Fut> JobRunner for FnRunner<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn run(&self, job: Job) -> Result<()> {
        (self.0)(job).await
    }
}

/// Wrap an async closure as a `JobRunner`.
pub fn runner_fn<F, Fut>(f: F) -> Arc<dyn JobRunner>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnRunner(f))
}

/// Stop handle for a spawned channel worker.
pub struct WorkerHandle {
    shutdown: Arc<std::sync::atomic::AtomicBool>,
    handle: tokio::task::JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal shutdown and wait for in-flight jobs to drain.
    pub async fn stop(self) {
        self.shutdown
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let _ = self.handle.await;
    }
}

/// Throttled batch dispatcher over a `JobQueue`.
pub struct BatchDispatcher {
    queue: Arc<dyn JobQueue>,
    limiter: Arc<RateLimiter>,
    breakers: Arc<BreakerRegistry>,
    channels: HashMap<String, ChannelConfig>,
    clock: Arc<dyn Clock>,
}

impl BatchDispatcher {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        limiter: Arc<RateLimiter>,
        breakers: Arc<BreakerRegistry>,
        channels: HashMap<String, ChannelConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            queue,
            limiter,
            breakers,
            channels,
            clock,
        }
    }

    fn channel(&self, name: &str) -> Result<&ChannelConfig> {
        self.channels
            .get(name)
            .ok_or_else(|| DispatchError::Configuration(format!("unknown channel {name}")))
    }

    /// Enqueue a batch, spacing jobs by the channel's configured interval so
    /// the batch as a whole respects the channel's rate limit.
    pub async fn submit(
        &self,
        channel: &str,
        submissions: Vec<JobSubmission>,
    ) -> Result<Vec<Uuid>> {
        let cfg = self.channel(channel)?;
        let now = self.clock.now_ms();
        let interval = cfg.interval_ms;
        let max_attempts = cfg.max_attempts;

        let mut ids = Vec::with_capacity(submissions.len());
        for (position, submission) in submissions.into_iter().enumerate() {
            let job = Job {
                id: Uuid::new_v4(),
                channel: channel.to_string(),
                payload: submission.payload,
                identifier: submission.identifier,
                attempt: 0,
                max_attempts,
                not_before_ms: now + position as u64 * interval,
                failure_history: Vec::new(),
            };
            ids.push(job.id);
            self.queue.push(job).await?;
        }
        info!(channel, jobs = ids.len(), interval_ms = interval, "batch enqueued");
        Ok(ids)
    }

    /// One sweep: pull every currently-ready job for the channel and run
    /// them, bounded by the channel's concurrency. Returns the number of
    /// jobs pulled. Waits for every pulled job to settle before returning,
    /// so a caller that stops sweeping has no dangling in-flight work.
    pub async fn process_available(
        &self,
        channel: &str,
        runner: Arc<dyn JobRunner>,
    ) -> Result<usize> {
        let cfg = self.channel(channel)?.clone();
        let semaphore = Arc::new(Semaphore::new(cfg.concurrency));
        let mut handles = Vec::new();

        loop {
            let Some(job) = self.queue.pull(channel, self.clock.now_ms()).await? else {
                break;
            };
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let queue = self.queue.clone();
            let limiter = self.limiter.clone();
            let breakers = self.breakers.clone();
            let runner = runner.clone();
            let cfg = cfg.clone();
            handles.push(tokio::spawn(async move {
                Self::execute_job(queue, limiter, breakers, cfg, runner, job).await;
                drop(permit);
            }));
        }

        let pulled = handles.len();
        for handle in handles {
            let _ = handle.await;
        }
        Ok(pulled)
    }

    /// Spawn a polling worker for a channel. The handle's `stop` drains
    /// in-flight jobs before returning.
    pub fn spawn_worker(
        self: Arc<Self>,
        channel: impl Into<String>,
        runner: Arc<dyn JobRunner>,
        poll_interval: Duration,
    ) -> WorkerHandle {
        let shutdown = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let shutdown_cl = shutdown.clone();
        let dispatcher = self;
        let channel = channel.into();
        let handle = tokio::spawn(async move {
            while !shutdown_cl.load(std::sync::atomic::Ordering::SeqCst) {
                match dispatcher.process_available(&channel, runner.clone()).await {
                    Ok(0) => tokio::time::sleep(poll_interval).await,
                    Ok(_) => {}
                    Err(err) => {
                        error!(channel, error = %err, "worker sweep failed");
                        tokio::time::sleep(poll_interval).await;
                    }
                }
            }
        });
        WorkerHandle { shutdown, handle }
    }

    async fn execute_job(
        queue: Arc<dyn JobQueue>,
        limiter: Arc<RateLimiter>,
        breakers: Arc<BreakerRegistry>,
        cfg: ChannelConfig,
        runner: Arc<dyn JobRunner>,
        job: Job,
    ) {
        let decision = match limiter
            .check_and_reserve(&job.channel, &cfg.operation, &job.identifier)
            .await
        {
            Ok(decision) => decision,
            Err(err) => {
                error!(job_id = %job.id, error = %err, "admission check failed");
                Self::settle_failure(queue, cfg, job, err).await;
                return;
            }
        };
        if !decision.allowed {
            let err = DispatchError::RateLimitExceeded {
                service: job.channel.clone(),
                operation: cfg.operation.clone(),
                retry_after: decision.retry_after,
            };
            Self::settle_failure(queue, cfg, job, err).await;
            return;
        }

        let breaker = breakers.breaker(&job.channel);
        let outcome = breaker.execute(runner.run(job.clone())).await;
        match outcome {
            Ok(()) => {
                debug!(job_id = %job.id, channel = job.channel, "job delivered");
                if let Err(err) = queue.ack(job.id).await {
                    error!(job_id = %job.id, error = %err, "ack failed");
                }
            }
            Err(err) => Self::settle_failure(queue, cfg, job, err).await,
        }
    }

    async fn settle_failure(
        queue: Arc<dyn JobQueue>,
        cfg: ChannelConfig,
        mut job: Job,
        err: DispatchError,
    ) {
        job.attempt += 1;
        job.failure_history
            .push(format!("attempt {}: {err}", job.attempt));

        let exhausted = job.attempt >= job.max_attempts;
        if exhausted || !err.is_retryable() {
            warn!(
                job_id = %job.id,
                channel = job.channel,
                attempts = job.attempt,
                error = %err,
                "job dead-lettered"
            );
            if let Err(err) = queue.dead_letter(job).await {
                error!(error = %err, "dead-letter push failed");
            }
            return;
        }

        let mut delay = cfg.backoff.delay_for_attempt(job.attempt - 1);
        if let DispatchError::RateLimitExceeded { retry_after, .. } = &err {
            delay = delay.max(*retry_after);
        }
        debug!(
            job_id = %job.id,
            channel = job.channel,
            attempt = job.attempt,
            delay_ms = delay.as_millis() as u64,
            "job rescheduled"
        );
        if let Err(err) = queue.nack(job, delay).await {
            error!(error = %err, "nack failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::Backoff;
    use crate::breaker::BreakerConfig;
    use crate::clock::ManualClock;
    use crate::limiter::RateLimitTable;
    use crate::window::WindowRule;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        clock: Arc<ManualClock>,
        queue: Arc<MemoryQueue>,
        dispatcher: Arc<BatchDispatcher>,
    }

    fn fixture_with(channels: HashMap<String, ChannelConfig>, limits: RateLimitTable) -> Fixture {
        let clock = ManualClock::shared(1_000_000);
        let store = Arc::new(crate::store::MemoryStore::new(clock.clone()));
        let queue = Arc::new(MemoryQueue::new(clock.clone()));
        let limiter = Arc::new(RateLimiter::new(store, clock.clone(), limits));
        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig::default(), clock.clone()));
        let dispatcher = Arc::new(BatchDispatcher::new(
            queue.clone(),
            limiter,
            breakers,
            channels,
            clock.clone(),
        ));
        Fixture {
            clock,
            queue,
            dispatcher,
        }
    }

    fn whatsapp_channel(max_attempts: u32) -> HashMap<String, ChannelConfig> {
        let mut channels = HashMap::new();
        channels.insert(
            "whatsapp".to_string(),
            ChannelConfig {
                concurrency: 10,
                interval_ms: 3_000,
                max_attempts,
                backoff: Backoff::exponential(
                    Duration::from_millis(2_000),
                    2.0,
                    Duration::from_secs(60),
                )
                .with_jitter(false),
                operation: "send".into(),
            },
        );
        channels
    }

    fn submissions(n: usize) -> Vec<JobSubmission> {
        (0..n)
            .map(|i| JobSubmission {
                payload: json!({"body": format!("msg {i}")}),
                identifier: format!("+1555000{i:04}"),
            })
            .collect()
    }

    #[tokio::test]
    async fn batch_jobs_are_spaced_by_channel_interval() {
        let f = fixture_with(whatsapp_channel(3), HashMap::new());
        let ids = f
            .dispatcher
            .submit("whatsapp", submissions(10))
            .await
            .unwrap();
        assert_eq!(ids.len(), 10);

        let jobs = f.queue.ready_jobs("whatsapp");
        assert_eq!(jobs.len(), 10);
        for pair in jobs.windows(2) {
            assert!(pair[1].not_before_ms - pair[0].not_before_ms >= 3_000);
        }
        assert_eq!(jobs[0].not_before_ms, 1_000_000);
        assert_eq!(jobs[9].not_before_ms, 1_000_000 + 9 * 3_000);
    }

    #[tokio::test]
    async fn unknown_channel_is_a_synchronous_configuration_error() {
        let f = fixture_with(whatsapp_channel(3), HashMap::new());
        let err = f
            .dispatcher
            .submit("carrier-pigeon", submissions(1))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Configuration(_)));
    }

    #[tokio::test]
    async fn only_ready_jobs_are_dispatched() {
        let f = fixture_with(whatsapp_channel(3), HashMap::new());
        let delivered = Arc::new(AtomicUsize::new(0));
        let delivered_cl = delivered.clone();
        let runner = runner_fn(move |_job| {
            let delivered = delivered_cl.clone();
            async move {
                delivered.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        f.dispatcher
            .submit("whatsapp", submissions(4))
            .await
            .unwrap();
        // Only the first job is ready at submission time.
        let pulled = f
            .dispatcher
            .process_available("whatsapp", runner.clone())
            .await
            .unwrap();
        assert_eq!(pulled, 1);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);

        // Advance past every slot and drain the rest.
        f.clock.advance(3 * 3_000);
        let pulled = f
            .dispatcher
            .process_available("whatsapp", runner)
            .await
            .unwrap();
        assert_eq!(pulled, 3);
        assert_eq!(delivered.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn failing_job_is_dead_lettered_after_max_attempts() {
        let f = fixture_with(whatsapp_channel(3), HashMap::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_cl = calls.clone();
        let runner = runner_fn(move |job: Job| {
            let calls = calls_cl.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DispatchError::Provider {
                    dependency: job.channel,
                    message: "delivery failed".into(),
                })
            }
        });

        f.dispatcher
            .submit("whatsapp", submissions(1))
            .await
            .unwrap();
        // Sweep enough times for 3 attempts plus one extra sweep to prove
        // the job is never dispatched a 4th time.
        for _ in 0..5 {
            f.dispatcher
                .process_available("whatsapp", runner.clone())
                .await
                .unwrap();
            f.clock.advance(70_000); // beyond any backoff delay
        }

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let dead = f.queue.dead_letters("whatsapp");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempt, 3);
        assert_eq!(dead[0].failure_history.len(), 3);
        assert!(dead[0].failure_history[0].contains("attempt 1"));
    }

    #[tokio::test]
    async fn retry_delay_grows_exponentially() {
        let f = fixture_with(whatsapp_channel(3), HashMap::new());
        let runner = runner_fn(|job: Job| async move {
            Err(DispatchError::Provider {
                dependency: job.channel,
                message: "boom".into(),
            })
        });

        f.dispatcher
            .submit("whatsapp", submissions(1))
            .await
            .unwrap();
        f.dispatcher
            .process_available("whatsapp", runner.clone())
            .await
            .unwrap();
        let job = &f.queue.ready_jobs("whatsapp")[0];
        // First retry: initial backoff of 2s.
        assert_eq!(job.not_before_ms, f.clock.now_ms() + 2_000);

        f.clock.advance(2_000);
        f.dispatcher
            .process_available("whatsapp", runner)
            .await
            .unwrap();
        let job = &f.queue.ready_jobs("whatsapp")[0];
        // Second retry: doubled.
        assert_eq!(job.not_before_ms, f.clock.now_ms() + 4_000);
    }

    #[tokio::test]
    async fn locally_rate_limited_job_waits_at_least_retry_after() {
        let mut limits: RateLimitTable = HashMap::new();
        limits
            .entry("whatsapp".to_string())
            .or_default()
            .insert("send".to_string(), WindowRule::sliding(0, 120_000));
        let f = fixture_with(whatsapp_channel(5), limits);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_cl = calls.clone();
        let runner = runner_fn(move |_job| {
            let calls = calls_cl.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        f.dispatcher
            .submit("whatsapp", submissions(1))
            .await
            .unwrap();
        f.dispatcher
            .process_available("whatsapp", runner)
            .await
            .unwrap();
        // The runner never ran; the job was rescheduled by the limiter's
        // retry-after (the full window), not the smaller backoff delay.
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let job = &f.queue.ready_jobs("whatsapp")[0];
        assert!(job.not_before_ms >= f.clock.now_ms() + 120_000);
        assert_eq!(job.attempt, 1);
    }

    #[tokio::test]
    async fn channel_operation_selects_the_admission_rule() {
        let mut channels = whatsapp_channel(5);
        {
            let cfg = channels.get_mut("whatsapp").unwrap();
            cfg.operation = "per_phone".into();
            cfg.interval_ms = 0;
        }
        let mut limits: RateLimitTable = HashMap::new();
        limits
            .entry("whatsapp".to_string())
            .or_default()
            .insert("per_phone".to_string(), WindowRule::sliding(2, 60_000));
        let f = fixture_with(channels, limits);

        let delivered = Arc::new(AtomicUsize::new(0));
        let delivered_cl = delivered.clone();
        let runner = runner_fn(move |_job| {
            let delivered = delivered_cl.clone();
            async move {
                delivered.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        // Three jobs to one phone number against a two-per-window rule.
        let batch = (0..3)
            .map(|i| JobSubmission {
                payload: json!({"seq": i}),
                identifier: "+15550001111".to_string(),
            })
            .collect();
        f.dispatcher.submit("whatsapp", batch).await.unwrap();
        f.dispatcher
            .process_available("whatsapp", runner)
            .await
            .unwrap();

        assert_eq!(delivered.load(Ordering::SeqCst), 2);
        let held = f.queue.ready_jobs("whatsapp");
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].attempt, 1);
        assert!(held[0].not_before_ms >= f.clock.now_ms() + 60_000);
    }

    #[tokio::test]
    async fn concurrency_stays_within_channel_bound() {
        let mut channels = HashMap::new();
        channels.insert(
            "email".to_string(),
            ChannelConfig {
                concurrency: 2,
                interval_ms: 0,
                max_attempts: 1,
                backoff: Backoff::fixed(Duration::from_millis(10)),
                operation: "send".into(),
            },
        );
        let f = fixture_with(channels, HashMap::new());

        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (current_cl, peak_cl) = (current.clone(), peak.clone());
        let runner = runner_fn(move |_job| {
            let current = current_cl.clone();
            let peak = peak_cl.clone();
            async move {
                let live = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(live, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        });

        f.dispatcher.submit("email", submissions(6)).await.unwrap();
        f.dispatcher
            .process_available("email", runner)
            .await
            .unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn worker_drains_on_stop() {
        let mut channels = HashMap::new();
        channels.insert(
            "email".to_string(),
            ChannelConfig {
                concurrency: 4,
                interval_ms: 0,
                max_attempts: 1,
                backoff: Backoff::fixed(Duration::from_millis(10)),
                operation: "send".into(),
            },
        );
        let clock = Arc::new(crate::clock::SystemClock);
        let store = Arc::new(crate::store::MemoryStore::new(clock.clone()));
        let queue = Arc::new(MemoryQueue::new(clock.clone()));
        let limiter = Arc::new(RateLimiter::new(store, clock.clone(), HashMap::new()));
        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig::default(), clock.clone()));
        let dispatcher = Arc::new(BatchDispatcher::new(
            queue.clone(),
            limiter,
            breakers,
            channels,
            clock,
        ));

        let delivered = Arc::new(AtomicUsize::new(0));
        let delivered_cl = delivered.clone();
        let runner = runner_fn(move |_job| {
            let delivered = delivered_cl.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                delivered.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        dispatcher.submit("email", submissions(5)).await.unwrap();
        let worker = dispatcher
            .clone()
            .spawn_worker("email", runner, Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(50)).await;
        worker.stop().await;
        assert_eq!(delivered.load(Ordering::SeqCst), 5);
    }
}
