//! Window admission counting
//!
//! What this module provides
//! - The pure admission algorithms behind the rate limiter: sliding-window
//!   and fixed-window counting against the shared atomic store
//!
//! Exports
//! - Models
//!   - `WindowKind::{Sliding, Fixed}`
//!   - `WindowRule { limit, window_ms, kind }`
//!   - `Decision { allowed, limit, remaining, retry_after, reset_at_ms }`
//! - Utils
//!   - `check_sliding`, `check_fixed`
//!
//! Implementation strategy
//! - Sliding: one atomic prune-count-insert against a sorted set keyed by
//!   timestamp. Exact rolling count, O(window size) state per key.
//! - Fixed: atomic increment of a per-bucket counter with TTL = window.
//!   Cheaper, but admits up to 2x the limit across a bucket boundary; that
//!   is accepted policy here, not a bug, and downstream budget floors and
//!   breaker thresholds are tuned with it in mind.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::store::AtomicStore;

/// Which counting scheme a rule uses. A per-(service, operation)
/// configuration choice, never runtime-adaptive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    Sliding,
    Fixed,
}

/// One admission rule: at most `limit` events per `window_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowRule {
    pub limit: u64,
    pub window_ms: u64,
    #[serde(rename = "type")]
    pub kind: WindowKind,
}

impl WindowRule {
    pub fn sliding(limit: u64, window_ms: u64) -> Self {
        Self {
            limit,
            window_ms,
            kind: WindowKind::Sliding,
        }
    }

    pub fn fixed(limit: u64, window_ms: u64) -> Self {
        Self {
            limit,
            window_ms,
            kind: WindowKind::Fixed,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Admission decision. A "no" is a value, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// How long to wait before the next slot frees up. Zero when allowed.
    pub retry_after: Duration,
    /// When the active window resets, milliseconds since epoch.
    pub reset_at_ms: u64,
}

impl Decision {
    /// Decision for keys with no configured rule: always admitted.
    pub fn unbounded(now_ms: u64) -> Self {
        Self {
            allowed: true,
            limit: u64::MAX,
            remaining: u64::MAX,
            retry_after: Duration::ZERO,
            reset_at_ms: now_ms,
        }
    }

    pub fn retry_after_ms(&self) -> u64 {
        self.retry_after.as_millis() as u64
    }
}

/// Sliding-window check-and-reserve.
///
/// Prunes entries older than `now - window`, then admits and appends `now`
/// only while the live count is below the limit. Rejections report when the
/// oldest live entry will age out.
pub async fn check_sliding(
    store: &dyn AtomicStore,
    key: &str,
    rule: &WindowRule,
    now_ms: u64,
) -> Result<Decision> {
    let window_start = now_ms.saturating_sub(rule.window_ms);
    let member = format!("{now_ms}-{}", Uuid::new_v4());
    let reserve = store
        .sliding_reserve(
            key,
            window_start,
            rule.limit,
            now_ms,
            &member,
            rule.window(),
        )
        .await?;

    if !reserve.admitted {
        let next_free_ms = reserve
            .oldest_score
            .map(|oldest| (oldest + rule.window_ms).saturating_sub(now_ms))
            .unwrap_or(rule.window_ms)
            .max(1);
        return Ok(Decision {
            allowed: false,
            limit: rule.limit,
            remaining: 0,
            retry_after: Duration::from_millis(next_free_ms),
            reset_at_ms: now_ms + next_free_ms,
        });
    }

    Ok(Decision {
        allowed: true,
        limit: rule.limit,
        remaining: rule.limit - reserve.count - 1,
        retry_after: Duration::ZERO,
        reset_at_ms: now_ms + rule.window_ms,
    })
}

/// Fixed-window check-and-reserve.
///
/// Counts into the bucket `floor(now / window)`. Requests in adjacent
/// buckets are counted independently, so up to 2x the limit can land inside
/// one rolling window across the boundary. Accepted policy, documented at
/// the module level.
pub async fn check_fixed(
    store: &dyn AtomicStore,
    key: &str,
    rule: &WindowRule,
    now_ms: u64,
) -> Result<Decision> {
    let bucket = now_ms / rule.window_ms;
    let bucket_key = format!("{key}:{bucket}");
    let count = store.incr_with_ttl(&bucket_key, rule.window()).await?;
    let reset_at_ms = (bucket + 1) * rule.window_ms;

    if count > rule.limit {
        return Ok(Decision {
            allowed: false,
            limit: rule.limit,
            remaining: 0,
            retry_after: Duration::from_millis(reset_at_ms.saturating_sub(now_ms).max(1)),
            reset_at_ms,
        });
    }

    Ok(Decision {
        allowed: true,
        limit: rule.limit,
        remaining: rule.limit - count,
        retry_after: Duration::ZERO,
        reset_at_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn setup() -> (Arc<ManualClock>, MemoryStore) {
        let clock = ManualClock::shared(10_000_000);
        (clock.clone(), MemoryStore::new(clock))
    }

    #[tokio::test]
    async fn sliding_admits_up_to_limit_then_rejects() {
        let (clock, store) = setup();
        let rule = WindowRule::sliding(3, 60_000);
        for _ in 0..3 {
            let d = check_sliding(&store, "k", &rule, clock.now_ms())
                .await
                .unwrap();
            assert!(d.allowed);
        }
        let d = check_sliding(&store, "k", &rule, clock.now_ms())
            .await
            .unwrap();
        assert!(!d.allowed);
        assert!(d.retry_after > Duration::ZERO);
        assert_eq!(d.remaining, 0);
    }

    #[tokio::test]
    async fn sliding_retry_after_tracks_oldest_entry() {
        let (clock, store) = setup();
        let rule = WindowRule::sliding(1, 10_000);
        check_sliding(&store, "k", &rule, clock.now_ms())
            .await
            .unwrap();
        clock.advance(4_000);
        let d = check_sliding(&store, "k", &rule, clock.now_ms())
            .await
            .unwrap();
        assert!(!d.allowed);
        // Oldest entry ages out 10s after it landed, 6s from now.
        assert_eq!(d.retry_after, Duration::from_millis(6_000));
    }

    #[tokio::test]
    async fn sliding_frees_slots_as_entries_age_out() {
        let (clock, store) = setup();
        let rule = WindowRule::sliding(1, 5_000);
        assert!(
            check_sliding(&store, "k", &rule, clock.now_ms())
                .await
                .unwrap()
                .allowed
        );
        clock.advance(5_001);
        assert!(
            check_sliding(&store, "k", &rule, clock.now_ms())
                .await
                .unwrap()
                .allowed
        );
    }

    #[tokio::test]
    async fn fixed_counts_remaining_and_rejects_over_limit() {
        let (clock, store) = setup();
        let rule = WindowRule::fixed(2, 60_000);
        let d = check_fixed(&store, "k", &rule, clock.now_ms())
            .await
            .unwrap();
        assert!(d.allowed);
        assert_eq!(d.remaining, 1);
        let d = check_fixed(&store, "k", &rule, clock.now_ms())
            .await
            .unwrap();
        assert!(d.allowed);
        assert_eq!(d.remaining, 0);
        let d = check_fixed(&store, "k", &rule, clock.now_ms())
            .await
            .unwrap();
        assert!(!d.allowed);
        assert!(d.retry_after > Duration::ZERO);
        assert_eq!(d.reset_at_ms % 60_000, 0);
    }

    #[tokio::test]
    async fn fixed_window_boundary_allows_double_burst() {
        // Documented behavior: N1 <= L in bucket B plus N2 <= L in bucket
        // B+1 are all admitted even when N1 + N2 > L.
        let (clock, store) = setup();
        let rule = WindowRule::fixed(5, 60_000);
        clock.set(60_000 * 100 + 59_000); // near end of a bucket
        for _ in 0..5 {
            assert!(
                check_fixed(&store, "k", &rule, clock.now_ms())
                    .await
                    .unwrap()
                    .allowed
            );
        }
        clock.advance(2_000); // crosses into the next bucket
        for _ in 0..5 {
            assert!(
                check_fixed(&store, "k", &rule, clock.now_ms())
                    .await
                    .unwrap()
                    .allowed
            );
        }
    }
}
