//! Per-token prices keyed by provider model id.
//!
//! The table is external data loaded with the alias configuration; cost is only ever looked
//! up here. A model with no entry costs nothing.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::provider::upstream_model_name;

/// Price of a single token, in USD.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenPricing {
    #[serde(default)]
    pub input_cost_per_token: f64,
    #[serde(default)]
    pub output_cost_per_token: f64,
}

/// Token counts reported by the completion engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl Usage {
    /// Read the usage object out of a response or chunk. Missing or malformed usage counts as zero.
    pub fn from_response(response: &serde_json::Value) -> Self {
        response
            .get("usage")
            .filter(|u| !u.is_null())
            .and_then(|u| serde_json::from_value(u.clone()).ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PriceTable {
    prices: HashMap<String, TokenPricing>,
}

impl PriceTable {
    pub fn new(prices: HashMap<String, TokenPricing>) -> Self {
        Self { prices }
    }

    /// Look up a provider model id, first verbatim and then without its provider prefix.
    pub fn lookup(&self, model: &str) -> Option<&TokenPricing> {
        self.prices
            .get(model)
            .or_else(|| self.prices.get(upstream_model_name(model)))
    }

    /// Cost in USD of the given usage. Unknown models cost `0.0`.
    pub fn cost(&self, model: &str, usage: &Usage) -> f64 {
        match self.lookup(model) {
            Some(pricing) => {
                usage.prompt_tokens as f64 * pricing.input_cost_per_token
                    + usage.completion_tokens as f64 * pricing.output_cost_per_token
            }
            None => {
                tracing::debug!(model = %model, "No price entry, recording zero cost");
                0.0
            }
        }
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}
