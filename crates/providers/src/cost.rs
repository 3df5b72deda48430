//! Per-request cost accounting.

use switchyard_common::Usage;

// OpenAI is billed at fixed published rates; the configurable rates apply
// to grok (and any future provider without its own entry).
const OPENAI_PROMPT_PER_MILLION: f64 = 1.00;
const OPENAI_COMPLETION_PER_MILLION: f64 = 4.00;

/// USD rates per one million tokens.
#[derive(Debug, Clone, Copy)]
pub struct CostTable {
    pub prompt_per_million: f64,
    pub completion_per_million: f64,
}

impl CostTable {
    #[must_use]
    pub fn new(prompt_per_million: f64, completion_per_million: f64) -> Self {
        Self {
            prompt_per_million,
            completion_per_million,
        }
    }

    /// Cost of one request in USD.
    #[must_use]
    pub fn cost(&self, provider: &str, usage: &Usage) -> f64 {
        let (prompt_rate, completion_rate) = match provider {
            "openai" => (OPENAI_PROMPT_PER_MILLION, OPENAI_COMPLETION_PER_MILLION),
            _ => (self.prompt_per_million, self.completion_per_million),
        };
        let prompt = usage.prompt_tokens as f64 / 1_000_000.0 * prompt_rate;
        let completion = usage.completion_tokens as f64 / 1_000_000.0 * completion_rate;
        prompt + completion
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(prompt: u64, completion: u64) -> Usage {
        Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
        }
    }

    #[test]
    fn grok_uses_the_configured_rates() {
        let table = CostTable::new(2.0, 10.0);
        let cost = table.cost("grok", &usage(1_000_000, 500_000));
        assert!((cost - 7.0).abs() < 1e-9);
    }

    #[test]
    fn openai_uses_fixed_published_rates() {
        let table = CostTable::new(2.0, 10.0);
        let cost = table.cost("openai", &usage(1_000_000, 1_000_000));
        assert!((cost - 5.0).abs() < 1e-9);
    }
}
