//! Usage ledger
//!
//! What this module provides
//! - Append-only cost accounting for every executed provider call, and the
//!   remaining-budget queries the orchestrator consults before reordering
//!   tiers
//!
//! Exports
//! - Models
//!   - `UsageRecord { date, use_case, provider, model, tokens, cost, timestamp }`
//!   - `BudgetConfig { daily_usd, monthly_usd, floor_usd }`
//! - Services
//!   - `UsageLedger::{record, spent_on, remaining_daily_budget, under_pressure}`
//!
//! Implementation strategy
//! - One store list per calendar day (`ai_usage:{date}`), JSON records,
//!   pruned by a 7-day TTL; daily spend is a fold over the day's list
//! - Budget is a soft signal: nothing here blocks a call, the orchestrator
//!   only uses `under_pressure` to bias tier order

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::clock::Clock;
use crate::error::{DispatchError, Result};
use crate::providers::{Provider, ProviderTier, UseCase};
use crate::store::AtomicStore;

const RETENTION: Duration = Duration::from_secs(7 * 86_400);

/// Budget knobs. Soft constraints only.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub daily_usd: f64,
    pub monthly_usd: f64,
    /// Remaining daily budget below which cheap-first ordering kicks in.
    pub floor_usd: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_usd: 100.0,
            monthly_usd: 2_000.0,
            floor_usd: 10.0,
        }
    }
}

/// One executed (or attempted) provider call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub date: NaiveDate,
    pub use_case: UseCase,
    pub provider: Provider,
    pub model: String,
    pub tokens: u64,
    pub cost: f64,
    pub timestamp: DateTime<Utc>,
}

/// Cost ledger over the shared store.
pub struct UsageLedger {
    store: Arc<dyn AtomicStore>,
    clock: Arc<dyn Clock>,
    budget: BudgetConfig,
}

impl UsageLedger {
    pub fn new(store: Arc<dyn AtomicStore>, clock: Arc<dyn Clock>, budget: BudgetConfig) -> Self {
        Self {
            store,
            clock,
            budget,
        }
    }

    pub fn budget(&self) -> &BudgetConfig {
        &self.budget
    }

    fn now(&self) -> Result<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp_millis(self.clock.now_ms() as i64)
            .ok_or_else(|| DispatchError::Store("clock out of range".into()))
    }

    fn day_key(date: NaiveDate) -> String {
        format!("ai_usage:{date}")
    }

    /// Append a usage record for an executed call.
    pub async fn record(
        &self,
        use_case: UseCase,
        tier: &ProviderTier,
        tokens: u64,
    ) -> Result<UsageRecord> {
        let now = self.now()?;
        let record = UsageRecord {
            date: now.date_naive(),
            use_case,
            provider: tier.provider,
            model: tier.model.clone(),
            tokens,
            cost: tokens as f64 * tier.cost_per_token,
            timestamp: now,
        };
        let serialized = serde_json::to_string(&record)?;
        self.store
            .append_with_ttl(&Self::day_key(record.date), &serialized, RETENTION)
            .await?;
        debug!(
            use_case = %use_case,
            provider = %tier.provider,
            tokens,
            cost = record.cost,
            "usage recorded"
        );
        Ok(record)
    }

    /// Total spend recorded for one calendar day.
    pub async fn spent_on(&self, date: NaiveDate) -> Result<f64> {
        let mut total = 0.0;
        for raw in self.store.list_all(&Self::day_key(date)).await? {
            let record: UsageRecord = serde_json::from_str(&raw)?;
            total += record.cost;
        }
        Ok(total)
    }

    pub async fn spent_today(&self) -> Result<f64> {
        self.spent_on(self.now()?.date_naive()).await
    }

    /// Daily budget minus today's spend. Negative when overspent.
    pub async fn remaining_daily_budget(&self) -> Result<f64> {
        Ok(self.budget.daily_usd - self.spent_today().await?)
    }

    /// Monthly budget minus the retained spend for the current month. Only
    /// as complete as the 7-day retention window.
    pub async fn remaining_monthly_budget(&self) -> Result<f64> {
        let today = self.now()?.date_naive();
        let mut spent = 0.0;
        for day in 1..=today.day() {
            if let Some(date) = NaiveDate::from_ymd_opt(today.year(), today.month(), day) {
                spent += self.spent_on(date).await?;
            }
        }
        Ok(self.budget.monthly_usd - spent)
    }

    /// True when the remaining daily budget fell below the floor and tier
    /// order should prefer the cheapest option first.
    pub async fn under_pressure(&self) -> Result<bool> {
        Ok(self.remaining_daily_budget().await? < self.budget.floor_usd)
    }
}
