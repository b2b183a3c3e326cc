//! Configuration for the dispatch stack
//!
//! Rule tables, channel schedules, breaker thresholds, tier catalog, and
//! budget knobs, loadable from a TOML file with environment overrides.
//! Everything is validated up front: an unknown provider or a zero-worker
//! channel is a load-time `Configuration` error, never a runtime surprise.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::Backoff;
use crate::breaker::BreakerConfig;
use crate::error::{DispatchError, Result};
use crate::ledger::BudgetConfig;
use crate::limiter::RateLimitTable;
use crate::providers::TierCatalog;
use crate::window::WindowRule;

/// Scheduling policy for one outbound channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// In-flight jobs allowed at once.
    pub concurrency: usize,
    /// Minimum spacing between jobs of one batch.
    pub interval_ms: u64,
    /// Attempts before a job is dead-lettered.
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Which rate-limit operation gates each dispatched job, looked up as
    /// (channel, operation, job identifier) in the rule table.
    #[serde(default = "default_admission_operation")]
    pub operation: String,
}

fn default_admission_operation() -> String {
    "send".into()
}

impl ChannelConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Top-level configuration for one dispatch stack instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Account identifier used for account-wide admission keys.
    pub account: String,
    /// Grace wait after the primary tier reports upstream rate limiting.
    pub rate_limit_grace_ms: u64,
    /// Cadence of the optional breaker status log task.
    pub status_log_interval_ms: u64,
    pub rate_limits: RateLimitTable,
    pub channels: HashMap<String, ChannelConfig>,
    pub breaker: BreakerConfig,
    pub tiers: TierCatalog,
    pub budget: BudgetConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            account: "global".into(),
            rate_limits: default_rate_limits(),
            channels: default_channels(),
            breaker: BreakerConfig::default(),
            tiers: TierCatalog::builtin(),
            budget: BudgetConfig::default(),
            rate_limit_grace_ms: 2_000,
            status_log_interval_ms: 30_000,
        }
    }
}

impl DispatchConfig {
    /// Load from a TOML file, apply env overrides, validate.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|err| {
            DispatchError::Configuration(format!(
                "cannot read {}: {err}",
                path.as_ref().display()
            ))
        })?;
        let mut config: DispatchConfig = toml::from_str(&contents)
            .map_err(|err| DispatchError::Configuration(err.to_string()))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus env overrides, validated.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(account) = std::env::var("DISPATCH_ACCOUNT") {
            self.account = account;
        }
        if let Some(daily) = env_parse("DISPATCH_DAILY_BUDGET_USD") {
            self.budget.daily_usd = daily;
        }
        if let Some(floor) = env_parse("DISPATCH_BUDGET_FLOOR_USD") {
            self.budget.floor_usd = floor;
        }
        if let Some(threshold) = env_parse("DISPATCH_BREAKER_ERROR_THRESHOLD") {
            self.breaker.error_threshold = threshold;
        }
        if let Some(reset) = env_parse("DISPATCH_BREAKER_RESET_TIMEOUT_MS") {
            self.breaker.reset_timeout_ms = reset;
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.tiers.validate()?;
        for (name, channel) in &self.channels {
            if channel.concurrency == 0 {
                return Err(DispatchError::Configuration(format!(
                    "channel {name} has zero concurrency"
                )));
            }
            if channel.max_attempts == 0 {
                return Err(DispatchError::Configuration(format!(
                    "channel {name} has zero max_attempts"
                )));
            }
        }
        for (service, operations) in &self.rate_limits {
            for (operation, rule) in operations {
                if rule.window_ms == 0 {
                    return Err(DispatchError::Configuration(format!(
                        "rule {service}:{operation} has a zero window"
                    )));
                }
            }
        }
        if self.budget.floor_usd > self.budget.daily_usd {
            return Err(DispatchError::Configuration(
                "budget floor exceeds the daily budget".into(),
            ));
        }
        if self.breaker.error_threshold == 0 || self.breaker.success_threshold == 0 {
            return Err(DispatchError::Configuration(
                "breaker thresholds must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

const MINUTE: u64 = 60_000;
const HOUR: u64 = 3_600_000;
const DAY: u64 = 86_400_000;

/// The rule table this deployment ships with, mirroring the platform limits
/// of the channels it talks to.
pub fn default_rate_limits() -> RateLimitTable {
    let mut table: RateLimitTable = HashMap::new();

    let whatsapp = table.entry("whatsapp".into()).or_default();
    // Tier-1 business-initiated conversation cap; exact rolling count.
    whatsapp.insert("messaging".into(), WindowRule::sliding(1_000, DAY));
    whatsapp.insert("per_phone".into(), WindowRule::sliding(20, MINUTE));
    whatsapp.insert("media_upload".into(), WindowRule::sliding(100, HOUR));

    let facebook = table.entry("facebook".into()).or_default();
    facebook.insert("posts".into(), WindowRule::fixed(50, DAY));
    facebook.insert("api".into(), WindowRule::sliding(200, HOUR));

    let instagram = table.entry("instagram".into()).or_default();
    instagram.insert("posts".into(), WindowRule::fixed(25, DAY));
    instagram.insert("stories".into(), WindowRule::fixed(100, DAY));
    instagram.insert("api".into(), WindowRule::sliding(200, HOUR));

    let linkedin = table.entry("linkedin".into()).or_default();
    linkedin.insert("posts_user".into(), WindowRule::fixed(100, DAY));
    linkedin.insert("posts_company".into(), WindowRule::fixed(50, DAY));

    let email = table.entry("email".into()).or_default();
    email.insert("daily".into(), WindowRule::fixed(100_000, DAY));
    email.insert("burst".into(), WindowRule::sliding(1_000, 1_000));

    let sms = table.entry("sms".into()).or_default();
    sms.insert("per_second".into(), WindowRule::sliding(30, 1_000));
    sms.insert("per_number".into(), WindowRule::fixed(200, DAY));

    table
}

/// Default channel schedules: spacing and retry policy per channel.
pub fn default_channels() -> HashMap<String, ChannelConfig> {
    let mut channels = HashMap::new();
    channels.insert(
        "whatsapp".into(),
        ChannelConfig {
            concurrency: 10,
            interval_ms: 3_000,
            max_attempts: 3,
            backoff: Backoff::exponential(
                Duration::from_millis(2_000),
                2.0,
                Duration::from_secs(60),
            ),
            operation: "per_phone".into(),
        },
    );
    channels.insert(
        "email".into(),
        ChannelConfig {
            concurrency: 50,
            interval_ms: 100,
            max_attempts: 3,
            backoff: Backoff::fixed(Duration::from_millis(5_000)),
            operation: "burst".into(),
        },
    );
    channels.insert(
        "social".into(),
        ChannelConfig {
            concurrency: 5,
            interval_ms: 10_000,
            max_attempts: 2,
            backoff: Backoff::fixed(Duration::from_millis(60_000)),
            operation: default_admission_operation(),
        },
    );
    channels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::WindowKind;

    #[test]
    fn defaults_validate() {
        let config = DispatchConfig::default();
        config.validate().unwrap();
        assert_eq!(config.account, "global");
        assert_eq!(config.channels["whatsapp"].interval_ms, 3_000);
        let rule = config.rate_limits["whatsapp"]["per_phone"];
        assert_eq!(rule.limit, 20);
        assert_eq!(rule.kind, WindowKind::Sliding);
        // Every shipped channel admits under an operation the rule table
        // actually publishes a limit for.
        assert_eq!(config.channels["whatsapp"].operation, "per_phone");
        assert!(config.rate_limits["whatsapp"].contains_key("per_phone"));
        assert_eq!(config.channels["email"].operation, "burst");
        assert!(config.rate_limits["email"].contains_key("burst"));
        assert_eq!(
            config.rate_limits["facebook"]["posts"].kind,
            WindowKind::Fixed
        );
    }

    #[test]
    fn zero_concurrency_rejected() {
        let mut config = DispatchConfig::default();
        config.channels.get_mut("email").unwrap().concurrency = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("email"));
    }

    #[test]
    fn budget_floor_must_fit_daily_budget() {
        let mut config = DispatchConfig::default();
        config.budget.floor_usd = config.budget.daily_usd + 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_roundtrip() {
        let config = DispatchConfig::default();
        let serialized = toml::to_string(&config).unwrap();
        let parsed: DispatchConfig = toml::from_str(&serialized).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.channels.len(), config.channels.len());
    }

    #[test]
    fn unknown_provider_in_toml_fails_to_load() {
        let toml_src = r#"
            [[tiers.leadScoring]]
            provider = "gemini"
            model = "flash"
            cost_per_token = 0.0001
            timeout_ms = 5000
            max_tokens = 100
        "#;
        let err = toml::from_str::<DispatchConfig>(toml_src).unwrap_err();
        assert!(err.to_string().contains("gemini"));
    }
}
