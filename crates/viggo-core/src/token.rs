// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Token estimation.
//!
//! A chars/4 approximation, uniform across models.  Providers report the
//! authoritative count in their usage events; this estimate exists so the
//! context manager and the UI can react *before* a request is sent.

use viggo_model::Message;

#[derive(Debug, Clone, Default)]
pub struct TokenCounter {
    model: String,
}

impl TokenCounter {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Estimate tokens for a raw string.
    pub fn count_str(&self, s: &str) -> usize {
        (s.len() / 4).max(1)
    }

    /// Estimate tokens for one message, including a small per-message
    /// envelope overhead for role framing.
    pub fn count_message(&self, m: &Message) -> usize {
        m.approx_tokens() + 4
    }

    /// Estimate tokens for a whole request.
    pub fn count_messages(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.count_message(m)).sum()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
