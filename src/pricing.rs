//! Token cost accounting.
//!
//! All prices are stored **per single token**, in the currency unit of the
//! resulting cost (USD for the built-in table). Providers usually quote per
//! 1,000 or per 1,000,000 tokens; such quotes go through [`PriceUnit`] and
//! are normalized once, when the table is built. Arithmetic uses
//! [`rust_decimal::Decimal`] so repeated accumulation never drifts.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::request::Usage;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Unit a price quote is expressed in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceUnit {
    #[default]
    PerToken,
    PerThousandTokens,
    PerMillionTokens,
}

impl PriceUnit {
    fn tokens(&self) -> Decimal {
        match self {
            PriceUnit::PerToken => Decimal::ONE,
            PriceUnit::PerThousandTokens => Decimal::from(1_000u32),
            PriceUnit::PerMillionTokens => Decimal::from(1_000_000u32),
        }
    }
}

/// A price quote as written in configuration.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
struct PriceQuote {
    #[serde(default)]
    unit: PriceUnit,
    prompt: Decimal,
    completion: Decimal,
}

/// Per-token prices for one model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "PriceQuote", into = "PriceQuote")]
pub struct ModelPricing {
    pub prompt_per_token: Decimal,
    pub completion_per_token: Decimal,
}

impl ModelPricing {
    pub fn per_token(prompt: Decimal, completion: Decimal) -> Self {
        ModelPricing {
            prompt_per_token: prompt,
            completion_per_token: completion,
        }
    }

    /// Normalize a quote in `unit` to per-token prices.
    pub fn quoted(prompt: Decimal, completion: Decimal, unit: PriceUnit) -> Self {
        let tokens = unit.tokens();
        ModelPricing {
            prompt_per_token: prompt / tokens,
            completion_per_token: completion / tokens,
        }
    }

    pub fn cost(&self, usage: Usage) -> Decimal {
        cost(usage.prompt_tokens, usage.completion_tokens, self)
    }
}

impl From<PriceQuote> for ModelPricing {
    fn from(quote: PriceQuote) -> Self {
        ModelPricing::quoted(quote.prompt, quote.completion, quote.unit)
    }
}

impl From<ModelPricing> for PriceQuote {
    fn from(pricing: ModelPricing) -> Self {
        PriceQuote {
            unit: PriceUnit::PerToken,
            prompt: pricing.prompt_per_token,
            completion: pricing.completion_per_token,
        }
    }
}

/// `prompt_tokens × prompt price + completion_tokens × completion price`.
pub fn cost(prompt_tokens: u64, completion_tokens: u64, pricing: &ModelPricing) -> Decimal {
    Decimal::from(prompt_tokens) * pricing.prompt_per_token
        + Decimal::from(completion_tokens) * pricing.completion_per_token
}

/// Model id → per-token prices, with aliases for deployment names.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PricingTable {
    #[serde(default)]
    models: HashMap<String, ModelPricing>,
    /// Alias (e.g. `chat-model-large`) → priced model id.
    #[serde(default)]
    aliases: HashMap<String, String>,
}

impl PricingTable {
    pub fn empty() -> Self {
        PricingTable::default()
    }

    /// Published list prices (USD) for the models the chat front end offers.
    pub fn builtin() -> Self {
        PricingTable::empty()
            .with_model(
                "gpt-4o",
                ModelPricing::quoted(Decimal::new(250, 2), Decimal::new(1000, 2), PriceUnit::PerMillionTokens),
            )
            .with_model(
                "gpt-4o-mini",
                ModelPricing::quoted(Decimal::new(15, 2), Decimal::new(60, 2), PriceUnit::PerMillionTokens),
            )
            .with_model(
                "claude-3-5-sonnet",
                ModelPricing::quoted(Decimal::new(300, 2), Decimal::new(1500, 2), PriceUnit::PerMillionTokens),
            )
            .with_alias("chat-model-large", "gpt-4o")
            .with_alias("chat-model-small", "gpt-4o-mini")
            .with_alias("title-model", "gpt-4o-mini")
            .with_alias("block-model", "gpt-4o-mini")
            .with_alias("chat-model-large-claude", "claude-3-5-sonnet")
    }

    pub fn with_model(mut self, model_id: impl Into<String>, pricing: ModelPricing) -> Self {
        self.models.insert(model_id.into(), pricing);
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>, model_id: impl Into<String>) -> Self {
        self.aliases.insert(alias.into(), model_id.into());
        self
    }

    /// Resolve a model id (or alias) to its priced id and prices.
    pub fn resolve(&self, model_id: &str) -> Option<(&str, ModelPricing)> {
        if let Some((id, pricing)) = self.models.get_key_value(model_id) {
            return Some((id.as_str(), *pricing));
        }
        let target = self.aliases.get(model_id)?;
        self.models
            .get_key_value(target)
            .map(|(id, pricing)| (id.as_str(), *pricing))
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.resolve(model_id).is_some()
    }
}

/// A derived monetary cost.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cost {
    pub amount: Decimal,
    /// Priced model id the amount was computed with.
    pub priced_as: String,
    /// True when the requested model was unknown and a fallback price was used.
    pub estimated: bool,
}

impl Cost {
    /// Exact decimal string without trailing zeros, e.g. `"0.0125"`.
    pub fn to_decimal_string(&self) -> String {
        self.amount.normalize().to_string()
    }
}

impl fmt::Display for Cost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_decimal_string())?;
        if self.estimated {
            write!(f, " (estimated as {})", self.priced_as)?;
        }
        Ok(())
    }
}

/// Converts token usage into cost using a pricing table.
///
/// Unknown models fail with `Error::ConfigError` unless a fallback model has
/// been opted into, in which case the result is flagged `estimated`.
///
/// ```
/// use llm_cache_kit::pricing::{ModelPricing, PricingTable, UsageAccountant};
/// use rust_decimal::Decimal;
///
/// let table = PricingTable::empty().with_model(
///     "gpt-4o",
///     ModelPricing::per_token(Decimal::new(5, 6), Decimal::new(15, 6)),
/// );
/// let accountant = UsageAccountant::new(table);
///
/// let cost = accountant.cost(1000, 500, "gpt-4o").unwrap();
/// assert_eq!(cost.to_decimal_string(), "0.0125");
/// assert!(accountant.cost(1000, 500, "unknown-model").is_err());
/// ```
#[derive(Clone, Debug)]
pub struct UsageAccountant {
    table: PricingTable,
    estimate_fallback: Option<String>,
}

impl UsageAccountant {
    pub fn new(table: PricingTable) -> Self {
        UsageAccountant {
            table,
            estimate_fallback: None,
        }
    }

    /// Price unknown models as `model_id` and mark the result estimated.
    pub fn with_estimate_fallback(mut self, model_id: impl Into<String>) -> Self {
        self.estimate_fallback = Some(model_id.into());
        self
    }

    /// Pricing table and estimate fallback from a loaded [`Config`].
    pub fn from_config(config: &Config) -> Self {
        let accountant = Self::new(config.pricing.clone());
        match &config.estimate_fallback {
            Some(model_id) => accountant.with_estimate_fallback(model_id.clone()),
            None => accountant,
        }
    }

    pub fn table(&self) -> &PricingTable {
        &self.table
    }

    /// # Errors
    ///
    /// Returns `Error::ConfigError` if `model_id` is not priced and either no
    /// fallback is configured or the fallback itself is not priced.
    pub fn cost(&self, prompt_tokens: u64, completion_tokens: u64, model_id: &str) -> Result<Cost> {
        if let Some((priced_as, pricing)) = self.table.resolve(model_id) {
            return Ok(Cost {
                amount: cost(prompt_tokens, completion_tokens, &pricing),
                priced_as: priced_as.to_string(),
                estimated: false,
            });
        }

        let Some(fallback) = self.estimate_fallback.as_deref() else {
            return Err(Error::ConfigError(format!(
                "no pricing configured for model '{}'",
                model_id
            )));
        };

        let (priced_as, pricing) = self.table.resolve(fallback).ok_or_else(|| {
            Error::ConfigError(format!(
                "estimate fallback model '{}' has no pricing",
                fallback
            ))
        })?;
        warn!(
            "Model '{}' has no pricing; estimating cost with '{}'",
            model_id, priced_as
        );
        Ok(Cost {
            amount: cost(prompt_tokens, completion_tokens, &pricing),
            priced_as: priced_as.to_string(),
            estimated: true,
        })
    }

    pub fn cost_for_usage(&self, usage: Usage, model_id: &str) -> Result<Cost> {
        self.cost(usage.prompt_tokens, usage.completion_tokens, model_id)
    }
}

impl Default for UsageAccountant {
    fn default() -> Self {
        Self::new(PricingTable::builtin())
    }
}
