//! Model rate table and cost estimation.
//!
//! Rates are USD per 1K tokens, split into input and output. The built-in
//! table can be merged with an overrides map supplied by the caller (file
//! loading is a caller concern). Unknown models get a deliberately
//! pessimistic default so estimates stay on the safe side.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Per-1K-token pricing for one model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rate {
    pub input: f64,
    pub output: f64,
}

/// Fallback rate for models absent from the table.
pub const DEFAULT_RATE: Rate = Rate {
    input: 0.2,
    output: 0.8,
};

/// Rate table: built-in entries merged with caller overrides.
#[derive(Debug, Clone)]
pub struct RateTable {
    rates: BTreeMap<String, Rate>,
}

impl RateTable {
    /// The built-in table.
    pub fn builtin() -> Self {
        let mut rates = BTreeMap::new();
        let mut add = |model: &str, input: f64, output: f64| {
            rates.insert(model.to_string(), Rate { input, output });
        };

        add("gpt-4o", 0.0025, 0.01);
        add("gpt-4o-mini", 0.00015, 0.0006);
        add("gpt-4.1", 0.002, 0.008);
        add("gpt-4.1-mini", 0.0004, 0.0016);
        add("o3-mini", 0.0011, 0.0044);
        add("claude-sonnet-4", 0.003, 0.015);
        add("claude-haiku-3-5", 0.0008, 0.004);
        add("gemini-2.5-pro", 0.00125, 0.01);
        add("gemini-2.5-flash", 0.000075, 0.0003);
        add("llama-3.3-70b", 0.00059, 0.00079);
        add("deepseek-v3", 0.00027, 0.0011);
        add("mistral-large", 0.002, 0.006);

        Self { rates }
    }

    /// Merge caller-supplied overrides on top of the built-in table.
    pub fn with_overrides(mut self, overrides: BTreeMap<String, Rate>) -> Self {
        self.rates.extend(overrides);
        self
    }

    /// Rate for a model, falling back to [`DEFAULT_RATE`].
    pub fn resolve(&self, model: &str) -> Rate {
        self.rates.get(model).copied().unwrap_or(DEFAULT_RATE)
    }

    pub fn has_rate(&self, model: &str) -> bool {
        self.rates.contains_key(model)
    }

    /// Estimated cost in USD for one invocation.
    pub fn estimate_cost(&self, model: &str, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        let rate = self.resolve(model);
        (prompt_tokens as f64 * rate.input + completion_tokens as f64 * rate.output) / 1000.0
    }
}

impl Default for RateTable {
    fn default() -> Self {
        Self::builtin()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------


#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Cost is non-negative, finite, and monotone in token counts.
        #[test]
        fn prop_cost_is_sane(
            prompt in 0u32..1_000_000,
            completion in 0u32..1_000_000,
            model in "[a-z]{3,12}",
        ) {
            let table = RateTable::builtin();
            let cost = table.estimate_cost(&model, prompt, completion);
            prop_assert!(cost >= 0.0);
            prop_assert!(cost.is_finite());

            let bigger = table.estimate_cost(&model, prompt.saturating_add(1), completion);
            prop_assert!(bigger >= cost);
        }
    }
}
