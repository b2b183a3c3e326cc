//! Provider tiers
//!
//! What this module provides
//! - The closed set of AI providers, the logical use cases, and the ordered
//!   tier lists (primary -> fallback -> local) the orchestrator walks
//!
//! Exports
//! - Models
//!   - `Provider`, `UseCase`, `ProviderTier`, `TierCatalog`
//!
//! Implementation strategy
//! - `Provider` is a closed enum so an unrecognized provider in a config
//!   file is a load-time deserialization error, never a runtime miss
//! - Tier lists are immutable at runtime; budget pressure reorders a copy of
//!   the iteration order, never the list itself

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};

/// The providers this deployment can talk to. Closed on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Anthropic,
    Cohere,
    Ollama,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Cohere => "cohere",
            Provider::Ollama => "ollama",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical use cases with their own tier lists and budget allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UseCase {
    LeadScoring,
    ContentGeneration,
    MessagePersonalization,
}

impl UseCase {
    pub fn as_str(&self) -> &'static str {
        match self {
            UseCase::LeadScoring => "leadScoring",
            UseCase::ContentGeneration => "contentGeneration",
            UseCase::MessagePersonalization => "messagePersonalization",
        }
    }
}

impl fmt::Display for UseCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ranked option for satisfying a use case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderTier {
    pub provider: Provider,
    pub model: String,
    /// Dollars per token. Zero for local models.
    pub cost_per_token: f64,
    pub timeout_ms: u64,
    pub max_tokens: u32,
}

impl ProviderTier {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Ordered tier lists per use case, validated at configuration load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TierCatalog {
    tiers: HashMap<UseCase, Vec<ProviderTier>>,
}

impl TierCatalog {
    pub fn new(tiers: HashMap<UseCase, Vec<ProviderTier>>) -> Self {
        Self { tiers }
    }

    /// Tier list for a use case, highest priority first.
    pub fn tiers(&self, use_case: UseCase) -> Option<&[ProviderTier]> {
        self.tiers.get(&use_case).map(Vec::as_slice)
    }

    pub fn use_cases(&self) -> impl Iterator<Item = UseCase> + '_ {
        self.tiers.keys().copied()
    }

    /// Reject catalogs a fallback walk could not execute.
    pub fn validate(&self) -> Result<()> {
        for (use_case, tiers) in &self.tiers {
            if tiers.is_empty() {
                return Err(DispatchError::Configuration(format!(
                    "use case {use_case} has an empty tier list"
                )));
            }
            for tier in tiers {
                if tier.timeout_ms == 0 {
                    return Err(DispatchError::Configuration(format!(
                        "tier {}/{} for {use_case} has a zero timeout",
                        tier.provider, tier.model
                    )));
                }
                if tier.cost_per_token < 0.0 {
                    return Err(DispatchError::Configuration(format!(
                        "tier {}/{} for {use_case} has a negative cost",
                        tier.provider, tier.model
                    )));
                }
            }
        }
        Ok(())
    }

    /// The tier catalog this deployment ships with: lead scoring, content
    /// generation, and message personalization, each primary -> fallback
    /// (-> local where a local model is viable).
    pub fn builtin() -> Self {
        let mut tiers = HashMap::new();
        tiers.insert(
            UseCase::LeadScoring,
            vec![
                ProviderTier {
                    provider: Provider::OpenAi,
                    model: "gpt-3.5-turbo-0125".into(),
                    cost_per_token: 0.0005,
                    timeout_ms: 5_000,
                    max_tokens: 100,
                },
                ProviderTier {
                    provider: Provider::Anthropic,
                    model: "claude-instant-1.2".into(),
                    cost_per_token: 0.0004,
                    timeout_ms: 5_000,
                    max_tokens: 100,
                },
                ProviderTier {
                    provider: Provider::Ollama,
                    model: "llama2:7b".into(),
                    cost_per_token: 0.0,
                    timeout_ms: 10_000,
                    max_tokens: 100,
                },
            ],
        );
        tiers.insert(
            UseCase::ContentGeneration,
            vec![
                ProviderTier {
                    provider: Provider::OpenAi,
                    model: "gpt-4-turbo-preview".into(),
                    cost_per_token: 0.03,
                    timeout_ms: 30_000,
                    max_tokens: 2_000,
                },
                ProviderTier {
                    provider: Provider::OpenAi,
                    model: "gpt-3.5-turbo-16k".into(),
                    cost_per_token: 0.002,
                    timeout_ms: 20_000,
                    max_tokens: 2_000,
                },
                ProviderTier {
                    provider: Provider::Ollama,
                    model: "mixtral:8x7b".into(),
                    cost_per_token: 0.0,
                    timeout_ms: 30_000,
                    max_tokens: 2_000,
                },
            ],
        );
        tiers.insert(
            UseCase::MessagePersonalization,
            vec![
                ProviderTier {
                    provider: Provider::OpenAi,
                    model: "gpt-3.5-turbo-0125".into(),
                    cost_per_token: 0.0005,
                    timeout_ms: 5_000,
                    max_tokens: 500,
                },
                ProviderTier {
                    provider: Provider::Cohere,
                    model: "command-light".into(),
                    cost_per_token: 0.0003,
                    timeout_ms: 5_000,
                    max_tokens: 500,
                },
            ],
        );
        Self { tiers }
    }
}
