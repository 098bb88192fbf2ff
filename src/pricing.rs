//! Token pricing and per-job cost computation.
//!
//! The agent's terminal result event reports raw token counts but the cost
//! figure it includes is not always present, so cost is recomputed here from
//! per-model rates. Rates are dollars per million tokens.

use std::collections::HashMap;

use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::warn;

use crate::stream::ResultUsage;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ModelPricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
    pub cache_read_per_mtok: f64,
    pub cache_write_per_mtok: f64,
}

impl ModelPricing {
    pub fn cost_usd(&self, usage: &ResultUsage) -> f64 {
        const MTOK: f64 = 1_000_000.0;
        usage.input_tokens as f64 / MTOK * self.input_per_mtok
            + usage.output_tokens as f64 / MTOK * self.output_per_mtok
            + usage.cache_read_input_tokens as f64 / MTOK * self.cache_read_per_mtok
            + usage.cache_creation_input_tokens as f64 / MTOK * self.cache_write_per_mtok
    }
}

pub trait PricingProvider: Send + Sync {
    /// Rates for a model id. Model ids carry date suffixes
    /// (`claude-sonnet-4-5-20250929`), so lookup is by longest matching
    /// prefix, falling back to a conservative default.
    fn pricing_for(&self, model: &str) -> ModelPricing;
}

/// Built-in rate table. Used directly, and as the fallback whenever a
/// remote refresh has not succeeded yet.
pub struct StaticPricing {
    rates: HashMap<String, ModelPricing>,
    default: ModelPricing,
}

impl StaticPricing {
    pub fn new() -> Self {
        let mut rates = HashMap::new();
        rates.insert(
            "claude-opus".to_string(),
            ModelPricing {
                input_per_mtok: 15.0,
                output_per_mtok: 75.0,
                cache_read_per_mtok: 1.5,
                cache_write_per_mtok: 18.75,
            },
        );
        rates.insert(
            "claude-sonnet".to_string(),
            ModelPricing {
                input_per_mtok: 3.0,
                output_per_mtok: 15.0,
                cache_read_per_mtok: 0.3,
                cache_write_per_mtok: 3.75,
            },
        );
        rates.insert(
            "claude-haiku".to_string(),
            ModelPricing {
                input_per_mtok: 1.0,
                output_per_mtok: 5.0,
                cache_read_per_mtok: 0.1,
                cache_write_per_mtok: 1.25,
            },
        );
        // Unknown models get billed at the highest tier rather than zero.
        let default = rates["claude-opus"];
        Self { rates, default }
    }

    fn lookup(rates: &HashMap<String, ModelPricing>, default: ModelPricing, model: &str) -> ModelPricing {
        rates
            .iter()
            .filter(|(prefix, _)| model.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, p)| *p)
            .unwrap_or(default)
    }
}

impl Default for StaticPricing {
    fn default() -> Self {
        Self::new()
    }
}

impl PricingProvider for StaticPricing {
    fn pricing_for(&self, model: &str) -> ModelPricing {
        Self::lookup(&self.rates, self.default, model)
    }
}

/// Rate table refreshed from a remote JSON document, keyed by model-id
/// prefix. Refresh failures keep the last good table.
pub struct RefreshingPricing {
    url: String,
    client: reqwest::Client,
    rates: RwLock<HashMap<String, ModelPricing>>,
    fallback: StaticPricing,
}

impl RefreshingPricing {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
            rates: RwLock::new(HashMap::new()),
            fallback: StaticPricing::new(),
        }
    }

    pub async fn refresh(&self) {
        let fetched: Result<HashMap<String, ModelPricing>, anyhow::Error> = async {
            let resp = self.client.get(&self.url).send().await?.error_for_status()?;
            Ok(resp.json().await?)
        }
        .await;

        match fetched {
            Ok(table) if !table.is_empty() => {
                *self.rates.write().await = table;
            }
            Ok(_) => warn!("Pricing refresh returned an empty table, keeping current rates"),
            Err(e) => warn!("Pricing refresh from {} failed: {:#}", self.url, e),
        }
    }

    /// Synchronous snapshot lookup; falls back to the static table until
    /// the first successful refresh.
    pub fn pricing_for_blocking(&self, model: &str) -> ModelPricing {
        match self.rates.try_read() {
            Ok(rates) if !rates.is_empty() => {
                StaticPricing::lookup(&rates, self.fallback.default, model)
            }
            _ => self.fallback.pricing_for(model),
        }
    }
}

impl PricingProvider for RefreshingPricing {
    fn pricing_for(&self, model: &str) -> ModelPricing {
        self.pricing_for_blocking(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(input: i64, output: i64, read: i64, write: i64) -> ResultUsage {
        ResultUsage {
            input_tokens: input,
            output_tokens: output,
            cache_read_input_tokens: read,
            cache_creation_input_tokens: write,
        }
    }

    #[test]
    fn test_prefix_match_ignores_date_suffix() {
        let pricing = StaticPricing::new();
        let sonnet = pricing.pricing_for("claude-sonnet-4-5-20250929");
        assert_eq!(sonnet.input_per_mtok, 3.0);
        let opus = pricing.pricing_for("claude-opus-4-6");
        assert_eq!(opus.input_per_mtok, 15.0);
    }

    #[test]
    fn test_unknown_model_uses_top_tier_default() {
        let pricing = StaticPricing::new();
        let p = pricing.pricing_for("experimental-model-x");
        assert_eq!(p.input_per_mtok, 15.0);
    }

    #[test]
    fn test_cost_computation() {
        let p = StaticPricing::new().pricing_for("claude-sonnet-4-5");
        // 1M input at $3 + 100k output at $15 + 2M cache read at $0.30.
        let cost = p.cost_usd(&usage(1_000_000, 100_000, 2_000_000, 0));
        assert!((cost - (3.0 + 1.5 + 0.6)).abs() < 1e-9);
    }

    #[test]
    fn test_zero_usage_costs_nothing() {
        let p = StaticPricing::new().pricing_for("claude-haiku-3-5");
        assert_eq!(p.cost_usd(&usage(0, 0, 0, 0)), 0.0);
    }

    #[tokio::test]
    async fn test_refreshing_falls_back_before_first_refresh() {
        let pricing = RefreshingPricing::new("http://127.0.0.1:1/rates.json".to_string());
        let p = pricing.pricing_for("claude-sonnet-4-5");
        assert_eq!(p.input_per_mtok, 3.0);
    }
}
