//! Shared atomic store
//!
//! What this module provides
//! - The interface to the external key-value/atomic-counter service that
//!   backs window state, breaker snapshots, and the usage ledger
//! - `MemoryStore`, a process-local implementation for tests and single-node
//!   deployments
//!
//! Exports
//! - Models
//!   - `SlidingReserve { admitted, count, oldest_score }`
//! - Services
//!   - `AtomicStore` (object-safe async trait)
//!   - `MemoryStore`
//!
//! Implementation strategy
//! - Admission updates are exposed as single compound operations
//!   (`incr_with_ttl`, `sliding_reserve`) so the read-decide-write cycle is
//!   atomic in the store rather than racy in the caller. A Redis-backed
//!   implementation would run these as scripts; `MemoryStore` serializes
//!   through one mutex.
//! - TTLs are honored lazily on access; expired entries read as absent.
//!
//! Testing strategy
//! - Drive `MemoryStore` with a `ManualClock` and assert expiry, counter
//!   reset, and the sliding reservation ceiling under concurrent callers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::Clock;
use crate::error::{DispatchError, Result};

/// Outcome of an atomic sliding-window reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlidingReserve {
    /// Whether the member was inserted (the call was admitted).
    pub admitted: bool,
    /// Number of live entries in the window, not counting a just-inserted one.
    pub count: u64,
    /// Score of the oldest live entry, if any.
    pub oldest_score: Option<u64>,
}

/// Shared key-value/atomic-counter service reachable by all workers.
///
/// The dispatch core holds no authoritative in-process state that must
/// survive a restart; everything an admission decision depends on goes
/// through this trait.
#[async_trait]
pub trait AtomicStore: Send + Sync + 'static {
    /// Atomically increment a counter, creating it with `ttl` when absent.
    /// Returns the post-increment value.
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<u64>;

    /// Atomic sliding-window step: prune members with score `< min_score`,
    /// then insert `member` at `score` only if fewer than `limit` members
    /// remain. The key's TTL is refreshed to `ttl` on insert.
    async fn sliding_reserve(
        &self,
        key: &str,
        min_score: u64,
        limit: u64,
        score: u64,
        member: &str,
        ttl: Duration,
    ) -> Result<SlidingReserve>;

    /// Append a value to a list, creating it with `ttl` when absent.
    async fn append_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// All values of a list, oldest first. Absent or expired keys read empty.
    async fn list_all(&self, key: &str) -> Result<Vec<String>>;

    /// Set a plain value with a TTL.
    async fn put_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Get a plain value. Expired keys read as `None`.
    async fn get(&self, key: &str) -> Result<Option<String>>;
}

#[derive(Debug)]
enum Entry {
    Counter { value: u64, expires_at_ms: u64 },
    Sorted { members: Vec<(u64, String)>, expires_at_ms: u64 },
    List { items: Vec<String>, expires_at_ms: u64 },
    Value { value: String, expires_at_ms: u64 },
}

impl Entry {
    fn expires_at(&self) -> u64 {
        match self {
            Entry::Counter { expires_at_ms, .. }
            | Entry::Sorted { expires_at_ms, .. }
            | Entry::List { expires_at_ms, .. }
            | Entry::Value { expires_at_ms, .. } => *expires_at_ms,
        }
    }
}

/// Process-local `AtomicStore` backed by a mutex-guarded map.
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Entry>>> {
        self.entries
            .lock()
            .map_err(|_| DispatchError::Store("memory store mutex poisoned".into()))
    }

    fn drop_if_expired(entries: &mut HashMap<String, Entry>, key: &str, now_ms: u64) {
        if let Some(entry) = entries.get(key) {
            if entry.expires_at() <= now_ms {
                entries.remove(key);
            }
        }
    }
}

fn wrong_type(key: &str) -> DispatchError {
    DispatchError::Store(format!("key {key} holds a different value type"))
}

fn ttl_deadline(now_ms: u64, ttl: Duration) -> u64 {
    now_ms.saturating_add(ttl.as_millis() as u64)
}

#[async_trait]
impl AtomicStore for MemoryStore {
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<u64> {
        let now = self.clock.now_ms();
        let mut entries = self.lock()?;
        Self::drop_if_expired(&mut entries, key, now);
        match entries.get_mut(key) {
            None => {
                entries.insert(
                    key.to_string(),
                    Entry::Counter {
                        value: 1,
                        expires_at_ms: ttl_deadline(now, ttl),
                    },
                );
                Ok(1)
            }
            Some(Entry::Counter { value, .. }) => {
                *value += 1;
                Ok(*value)
            }
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn sliding_reserve(
        &self,
        key: &str,
        min_score: u64,
        limit: u64,
        score: u64,
        member: &str,
        ttl: Duration,
    ) -> Result<SlidingReserve> {
        let now = self.clock.now_ms();
        let mut entries = self.lock()?;
        Self::drop_if_expired(&mut entries, key, now);
        let entry = entries.entry(key.to_string()).or_insert(Entry::Sorted {
            members: Vec::new(),
            expires_at_ms: ttl_deadline(now, ttl),
        });
        let Entry::Sorted {
            members,
            expires_at_ms,
        } = entry
        else {
            return Err(wrong_type(key));
        };

        members.retain(|(s, _)| *s >= min_score);
        let count = members.len() as u64;
        let oldest_score = members.iter().map(|(s, _)| *s).min();
        if count >= limit {
            return Ok(SlidingReserve {
                admitted: false,
                count,
                oldest_score,
            });
        }
        members.push((score, member.to_string()));
        *expires_at_ms = ttl_deadline(now, ttl);
        Ok(SlidingReserve {
            admitted: true,
            count,
            oldest_score,
        })
    }

    async fn append_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let now = self.clock.now_ms();
        let mut entries = self.lock()?;
        Self::drop_if_expired(&mut entries, key, now);
        match entries.get_mut(key) {
            None => {
                entries.insert(
                    key.to_string(),
                    Entry::List {
                        items: vec![value.to_string()],
                        expires_at_ms: ttl_deadline(now, ttl),
                    },
                );
                Ok(())
            }
            Some(Entry::List { items, .. }) => {
                items.push(value.to_string());
                Ok(())
            }
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn list_all(&self, key: &str) -> Result<Vec<String>> {
        let now = self.clock.now_ms();
        let mut entries = self.lock()?;
        Self::drop_if_expired(&mut entries, key, now);
        match entries.get(key) {
            None => Ok(Vec::new()),
            Some(Entry::List { items, .. }) => Ok(items.clone()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn put_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let now = self.clock.now_ms();
        let mut entries = self.lock()?;
        entries.insert(
            key.to_string(),
            Entry::Value {
                value: value.to_string(),
                expires_at_ms: ttl_deadline(now, ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.now_ms();
        let mut entries = self.lock()?;
        Self::drop_if_expired(&mut entries, key, now);
        match entries.get(key) {
            None => Ok(None),
            Some(Entry::Value { value, .. }) => Ok(Some(value.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }
}
