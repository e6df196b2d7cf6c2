// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-turn tool selection.
//!
//! Exposing the full catalog on every request wastes context and degrades
//! tool-choice quality.  The selector scores each descriptor against the
//! user input and exposes only the best subset, plus a fixed always-include
//! set the agent cannot function without.  Scoring is purely lexical and
//! deterministic: the same input always yields the same subset.

use std::collections::BTreeSet;

use crate::registry::{ToolDescriptor, ToolRegistry};

/// Tools exposed regardless of score.
pub const ALWAYS_INCLUDE: &[&str] = &["read_file", "shell", "write_file"];

/// Outcome of one selection.
#[derive(Debug, Clone)]
pub struct Selection {
    /// Chosen descriptors, best first.
    pub tools: Vec<ToolDescriptor>,
    /// Classifier confidence in [0, 1].
    pub confidence: f32,
    /// Categories of the tools that actually matched the input.
    pub categories: BTreeSet<String>,
}

pub struct ToolSelector {
    max_tools: usize,
    always_include: Vec<String>,
}

impl ToolSelector {
    pub fn new(max_tools: usize) -> Self {
        Self {
            max_tools: max_tools.max(1),
            always_include: ALWAYS_INCLUDE.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn with_always_include(mut self, names: Vec<String>) -> Self {
        self.always_include = names;
        self
    }

    /// Score the catalog against `input` and return the chosen subset.
    pub fn select(&self, input: &str, registry: &ToolRegistry) -> Selection {
        let tokens = tokenize(input);
        let mut scored: Vec<(i64, ToolDescriptor)> = registry
            .descriptors()
            .into_iter()
            .map(|d| (score(&d, &tokens), d))
            .collect();

        // Deterministic order: score desc, then name asc.
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.name.cmp(&b.1.name)));

        let top_score = scored.first().map(|(s, _)| *s).unwrap_or(0);
        let categories: BTreeSet<String> = scored
            .iter()
            .filter(|(s, _)| *s > 0)
            .map(|(_, d)| d.category.clone())
            .collect();

        let mut chosen: Vec<ToolDescriptor> = Vec::new();
        for (s, d) in &scored {
            if chosen.len() >= self.max_tools {
                break;
            }
            if *s > 0 || self.always_include.contains(&d.name) {
                chosen.push(d.clone());
            }
        }
        // Always-include tools enter even when the cap is already full.
        for name in &self.always_include {
            if !chosen.iter().any(|d| &d.name == name) {
                if let Some((_, d)) = scored.iter().find(|(_, d)| &d.name == name) {
                    chosen.push(d.clone());
                }
            }
        }

        // Confidence saturates once the best match has a few solid hits.
        let confidence = (top_score as f32 / 6.0).clamp(0.0, 1.0);

        Selection {
            tools: chosen,
            confidence,
            categories,
        }
    }
}

fn tokenize(input: &str) -> Vec<String> {
    input
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| t.len() > 1)
        .map(|t| t.to_string())
        .collect()
}

fn score(d: &ToolDescriptor, tokens: &[String]) -> i64 {
    let mut s: i64 = 0;
    let name_parts: Vec<&str> = d.name.split('_').collect();
    let desc_lower = d.description.to_lowercase();
    for tok in tokens {
        if name_parts.iter().any(|p| p == tok) {
            s += 3;
        }
        if d.keywords.iter().any(|k| k == tok) {
            s += 2;
        }
        if desc_lower.contains(tok.as_str()) {
            s += 1;
        }
    }
    if s > 0 {
        s += d.priority as i64;
    }
    s
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
