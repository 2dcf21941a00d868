//! Built-in pricing table for common models.
//!
//! Prices are in USD per 1 million tokens. Each model has input and output
//! prices, and optionally cache write/read prices for providers that bill
//! prompt caching separately.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use tasklane_core::{TokenAccounting, Usage};

/// Per-million-token pricing for a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Price per 1M input tokens in USD.
    pub input_per_m: f64,
    /// Price per 1M output tokens in USD.
    pub output_per_m: f64,
    /// Price per 1M tokens written to the prompt cache.
    #[serde(default)]
    pub cache_write_per_m: f64,
    /// Price per 1M tokens read from the prompt cache.
    #[serde(default)]
    pub cache_read_per_m: f64,
}

impl ModelPricing {
    /// Create a new pricing entry without cache pricing.
    pub fn new(input_per_m: f64, output_per_m: f64) -> Self {
        Self {
            input_per_m,
            output_per_m,
            cache_write_per_m: 0.0,
            cache_read_per_m: 0.0,
        }
    }

    pub fn with_cache(mut self, write_per_m: f64, read_per_m: f64) -> Self {
        self.cache_write_per_m = write_per_m;
        self.cache_read_per_m = read_per_m;
        self
    }

    /// Compute cost for the given usage.
    pub fn cost(&self, usage: &Usage) -> f64 {
        (usage.input_tokens as f64 * self.input_per_m
            + usage.output_tokens as f64 * self.output_per_m
            + usage.cache_write_tokens as f64 * self.cache_write_per_m
            + usage.cache_read_tokens as f64 * self.cache_read_per_m)
            / 1_000_000.0
    }
}

/// Thread-safe pricing table with built-in defaults and custom overrides.
pub struct PricingTable {
    prices: RwLock<HashMap<String, ModelPricing>>,
}

impl PricingTable {
    /// Create a pricing table with built-in model prices.
    pub fn with_defaults() -> Self {
        let mut prices = HashMap::new();

        // ── Anthropic ──────────────────────────────────────────────
        prices.insert(
            "anthropic/claude-sonnet-4".into(),
            ModelPricing::new(3.0, 15.0).with_cache(3.75, 0.3),
        );
        prices.insert(
            "anthropic/claude-opus-4".into(),
            ModelPricing::new(15.0, 75.0).with_cache(18.75, 1.5),
        );
        prices.insert(
            "anthropic/claude-3.5-haiku".into(),
            ModelPricing::new(0.8, 4.0).with_cache(1.0, 0.08),
        );

        // ── OpenAI ─────────────────────────────────────────────────
        prices.insert(
            "openai/gpt-4o".into(),
            ModelPricing::new(2.5, 10.0).with_cache(0.0, 1.25),
        );
        prices.insert(
            "openai/gpt-4o-mini".into(),
            ModelPricing::new(0.15, 0.6).with_cache(0.0, 0.075),
        );
        prices.insert("openai/o3-mini".into(), ModelPricing::new(1.1, 4.4));

        // ── Google ─────────────────────────────────────────────────
        prices.insert("google/gemini-2.0-flash".into(), ModelPricing::new(0.1, 0.4));
        prices.insert("google/gemini-1.5-pro".into(), ModelPricing::new(1.25, 5.0));

        // ── DeepSeek ───────────────────────────────────────────────
        prices.insert(
            "deepseek/deepseek-v3".into(),
            ModelPricing::new(0.27, 1.1).with_cache(0.0, 0.07),
        );
        prices.insert("deepseek/deepseek-r1".into(), ModelPricing::new(0.55, 2.19));

        Self {
            prices: RwLock::new(prices),
        }
    }

    /// Create an empty pricing table.
    pub fn empty() -> Self {
        Self {
            prices: RwLock::new(HashMap::new()),
        }
    }

    /// Add or update pricing for a model.
    pub fn set(&self, model: impl Into<String>, pricing: ModelPricing) {
        let mut prices = self.prices.write().unwrap_or_else(|e| e.into_inner());
        prices.insert(model.into(), pricing);
    }

    /// Look up pricing for a model.
    ///
    /// Tries an exact match first, then the bare name without the provider
    /// prefix, then the longest known bare name that prefixes the model
    /// (`gpt-4o-mini-2024-07-18` matches `gpt-4o-mini`).
    pub fn get(&self, model: &str) -> Option<ModelPricing> {
        let prices = self.prices.read().unwrap_or_else(|e| e.into_inner());

        if let Some(p) = prices.get(model) {
            return Some(p.clone());
        }

        let model_lower = model.to_lowercase();
        let bare_model = model_lower.rsplit('/').next().unwrap_or(&model_lower);

        let mut best: Option<(usize, &ModelPricing)> = None;
        for (key, pricing) in prices.iter() {
            let bare_key = key.rsplit('/').next().unwrap_or(key).to_lowercase();
            if bare_model.starts_with(&bare_key) && best.is_none_or(|(len, _)| bare_key.len() > len) {
                best = Some((bare_key.len(), pricing));
            }
        }
        best.map(|(_, p)| p.clone())
    }

    /// Build the accounting record for one request.
    ///
    /// A cost reported by the provider wins over the table. Unknown models
    /// cost 0.0.
    pub fn accounting(&self, model: &str, usage: &Usage) -> TokenAccounting {
        let cost = usage.total_cost.unwrap_or_else(|| match self.get(model) {
            Some(p) => p.cost(usage),
            None => {
                tracing::debug!(model = %model, "No pricing for model, cost recorded as 0");
                0.0
            }
        });
        TokenAccounting {
            tokens_in: usage.input_tokens,
            tokens_out: usage.output_tokens,
            cache_writes: usage.cache_write_tokens,
            cache_reads: usage.cache_read_tokens,
            cost,
        }
    }

    /// List all known model names.
    pub fn models(&self) -> Vec<String> {
        let prices = self.prices.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = prices.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(input: u64, output: u64, writes: u64, reads: u64) -> Usage {
        Usage {
            input_tokens: input,
            output_tokens: output,
            cache_write_tokens: writes,
            cache_read_tokens: reads,
            total_cost: None,
        }
    }

    #[test]
    fn known_model_cost() {
        let table = PricingTable::with_defaults();
        // Claude Sonnet 4: $3/M input, $15/M output
        let acc = table.accounting("anthropic/claude-sonnet-4", &usage(1000, 500, 0, 0));
        assert!((acc.cost - 0.0105).abs() < 1e-10);
        assert_eq!(acc.tokens_in, 1000);
    }

    #[test]
    fn cache_tokens_are_priced() {
        let p = ModelPricing::new(3.0, 15.0).with_cache(3.75, 0.3);
        let c = p.cost(&usage(0, 0, 1_000_000, 1_000_000));
        assert!((c - 4.05).abs() < 1e-10);
    }

    #[test]
    fn provider_reported_cost_wins() {
        let table = PricingTable::with_defaults();
        let mut u = usage(1000, 500, 0, 0);
        u.total_cost = Some(0.42);
        let acc = table.accounting("anthropic/claude-sonnet-4", &u);
        assert!((acc.cost - 0.42).abs() < 1e-10);
    }

    #[test]
    fn unknown_model_costs_nothing() {
        let table = PricingTable::with_defaults();
        let acc = table.accounting("unknown/model-xyz", &usage(1000, 500, 0, 0));
        assert!(acc.cost.abs() < 1e-10);
    }

    #[test]
    fn versioned_model_matches_longest_prefix() {
        let table = PricingTable::with_defaults();
        let p = table.get("gpt-4o-mini-2024-07-18").unwrap();
        assert!((p.input_per_m - 0.15).abs() < 1e-10);
        let p = table.get("openai/gpt-4o-2024-11-20").unwrap();
        assert!((p.input_per_m - 2.5).abs() < 1e-10);
    }

    #[test]
    fn set_overrides_existing() {
        let table = PricingTable::empty();
        table.set("custom/model", ModelPricing::new(1.0, 2.0));
        assert_eq!(table.models(), vec!["custom/model".to_string()]);
        let acc = table.accounting("custom/model", &usage(1_000_000, 1_000_000, 0, 0));
        assert!((acc.cost - 3.0).abs() < 1e-10);
    }
}
