// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Session cost accounting and ceiling enforcement.

use std::sync::Mutex;

use viggo_model::ModelCatalogEntry;

/// Tracks the running USD cost of a session against a hard ceiling.
///
/// Internally synchronized; share via `Arc`.  `session_cost` is
/// monotonically non-decreasing — there is no way to refund tokens.
pub struct CostGuard {
    input_price_per_mtok: f64,
    output_price_per_mtok: f64,
    session_cost: Mutex<f64>,
    limit: f64,
}

impl CostGuard {
    /// Build from the model's catalog entry and the configured limits.
    ///
    /// Autonomy mode raises the ceiling to `autonomy_ceiling`; the limit is
    /// never infinite.  Unknown models price at zero, so only the round
    /// bound constrains them.
    pub fn new(
        entry: Option<&ModelCatalogEntry>,
        session_cost_limit: f64,
        autonomy: bool,
        autonomy_ceiling: f64,
    ) -> Self {
        let limit = if autonomy {
            autonomy_ceiling
        } else {
            session_cost_limit
        };
        Self {
            input_price_per_mtok: entry.map(|e| e.input_price_per_mtok).unwrap_or(0.0),
            output_price_per_mtok: entry.map(|e| e.output_price_per_mtok).unwrap_or(0.0),
            session_cost: Mutex::new(0.0),
            limit: limit.max(0.0),
        }
    }

    /// Record one turn's token usage; returns the incremental cost.
    pub fn record(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        let increment = (input_tokens as f64 / 1e6) * self.input_price_per_mtok
            + (output_tokens as f64 / 1e6) * self.output_price_per_mtok;
        let mut cost = self.session_cost.lock().unwrap();
        *cost += increment;
        increment
    }

    pub fn exceeded(&self) -> bool {
        *self.session_cost.lock().unwrap() >= self.limit
    }

    pub fn session_cost(&self) -> f64 {
        *self.session_cost.lock().unwrap()
    }

    pub fn limit(&self) -> f64 {
        self.limit
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(input: f64, output: f64) -> ModelCatalogEntry {
        ModelCatalogEntry {
            id: "m".into(),
            provider: "p".into(),
            context_window: 1000,
            max_output_tokens: 100,
            input_price_per_mtok: input,
            output_price_per_mtok: output,
            description: String::new(),
        }
    }

    #[test]
    fn record_accumulates_monotonically() {
        let e = entry(2.0, 10.0);
        let g = CostGuard::new(Some(&e), 1.0, false, 100.0);
        let c1 = g.record(1_000_000, 0); // $2
        assert!((c1 - 2.0).abs() < 1e-9);
        let before = g.session_cost();
        g.record(0, 100_000); // +$1
        assert!(g.session_cost() > before);
        assert!((g.session_cost() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn exceeded_when_at_or_over_limit() {
        let e = entry(1.0, 0.0);
        let g = CostGuard::new(Some(&e), 1.0, false, 100.0);
        assert!(!g.exceeded());
        g.record(1_000_000, 0); // exactly $1
        assert!(g.exceeded());
    }

    #[test]
    fn autonomy_raises_limit_but_not_to_infinity() {
        let e = entry(1.0, 1.0);
        let g = CostGuard::new(Some(&e), 0.01, true, 100.0);
        assert_eq!(g.limit(), 100.0);
        assert!(g.limit().is_finite());
    }

    #[test]
    fn unknown_model_prices_at_zero() {
        let g = CostGuard::new(None, 1.0, false, 100.0);
        g.record(10_000_000, 10_000_000);
        assert_eq!(g.session_cost(), 0.0);
        assert!(!g.exceeded());
    }
}
