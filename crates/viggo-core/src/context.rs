// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Context-window management.
//!
//! `prepare` takes the session history and returns a list that fits within
//! the usable window (context window minus the response reserve).  System
//! messages always survive; the most recent messages survive verbatim; the
//! middle of the history is folded into one synthesized summary System
//! message.  The fold never splits a tool-call/tool-result group — a
//! summarised call whose result survives (or vice versa) makes providers
//! reject the request.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use viggo_model::{Message, MessageContent, Role};

use crate::compact::deterministic_summary;
use crate::token::TokenCounter;

/// Severity of a context usage warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarnLevel {
    Warn,
    Critical,
}

#[derive(Debug, Clone)]
pub struct ContextWarning {
    pub level: WarnLevel,
    pub message: String,
}

/// Optional LLM-backed summary hook.  When absent (or failing), the
/// deterministic summarizer is used.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, span: &[Message], target_tokens: usize) -> anyhow::Result<String>;
}

pub struct ContextManager {
    counter: TokenCounter,
    max_context_tokens: usize,
    response_reserve_tokens: usize,
    recent_keep_count: usize,
    compression_ratio: f32,
    summarizer: Option<Arc<dyn Summarizer>>,
    /// Domain context blocks appended as terminal System messages
    /// (e.g. a persistent task list).
    context_blocks: Vec<String>,
}

impl ContextManager {
    pub fn new(
        model: &str,
        max_context_tokens: usize,
        response_reserve_tokens: usize,
        recent_keep_count: usize,
        compression_ratio: f32,
    ) -> Self {
        Self {
            counter: TokenCounter::new(model),
            max_context_tokens,
            response_reserve_tokens,
            recent_keep_count,
            compression_ratio: compression_ratio.clamp(0.05, 1.0),
            summarizer: None,
            context_blocks: Vec::new(),
        }
    }

    pub fn with_summarizer(mut self, s: Arc<dyn Summarizer>) -> Self {
        self.install_summarizer(s);
        self
    }

    pub fn with_context_block(mut self, block: impl Into<String>) -> Self {
        self.add_context_block(block);
        self
    }

    pub fn install_summarizer(&mut self, s: Arc<dyn Summarizer>) {
        self.summarizer = Some(s);
    }

    pub fn add_context_block(&mut self, block: impl Into<String>) {
        self.context_blocks.push(block.into());
    }

    pub fn counter(&self) -> &TokenCounter {
        &self.counter
    }

    fn cap(&self) -> usize {
        self.max_context_tokens
            .saturating_sub(self.response_reserve_tokens)
            .max(1)
    }

    /// Fraction of the usable window the given messages consume.
    pub fn usage_fraction(&self, messages: &[Message]) -> f32 {
        self.counter.count_messages(messages) as f32 / self.cap() as f32
    }

    /// Fit `messages` into the usable window.
    ///
    /// Idempotent: applying `prepare` to its own output is a no-op when the
    /// output already fits.  `force_fold` folds even when the messages fit
    /// (used when a middleware requests eager compaction).
    pub async fn prepare(
        &self,
        messages: &[Message],
        force_fold: bool,
    ) -> (Vec<Message>, Option<ContextWarning>) {
        let mut msgs: Vec<Message> = messages.to_vec();

        // Terminal domain-context blocks.  Skip blocks already present so
        // re-preparing prepared output does not duplicate them.
        for block in &self.context_blocks {
            let exists = msgs
                .iter()
                .any(|m| m.role == Role::System && m.as_text() == Some(block.as_str()));
            if !exists {
                msgs.push(Message::system(block.clone()));
            }
        }

        let cap = self.cap();
        let over = self.counter.count_messages(&msgs) > cap;
        if over || force_fold {
            let mut keep = self.recent_keep_count;
            loop {
                let folded = self.fold(&msgs, keep).await;
                let fits = self.counter.count_messages(&folded) <= cap;
                if fits || keep == 0 {
                    msgs = folded;
                    break;
                }
                // Still over: widen the fold into the preserved tail.
                keep -= 1;
            }
        }

        let warning = self.usage_warning(&msgs);
        (msgs, warning)
    }

    fn usage_warning(&self, messages: &[Message]) -> Option<ContextWarning> {
        let fraction = self.usage_fraction(messages);
        if fraction >= 0.95 {
            Some(ContextWarning {
                level: WarnLevel::Critical,
                message: format!(
                    "context window critical: {:.0}% of the usable budget in use",
                    fraction * 100.0
                ),
            })
        } else if fraction >= 0.8 {
            Some(ContextWarning {
                level: WarnLevel::Warn,
                message: format!(
                    "context window high: {:.0}% of the usable budget in use",
                    fraction * 100.0
                ),
            })
        } else {
            None
        }
    }

    /// Fold everything but the System messages and the last `keep`
    /// non-System messages into one summary System message.
    async fn fold(&self, messages: &[Message], keep: usize) -> Vec<Message> {
        let non_system: Vec<Message> = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .cloned()
            .collect();
        if non_system.len() <= keep.max(1) {
            return messages.to_vec();
        }

        let mut summarize_count = non_system.len() - keep;

        // Walk the boundary back past tool-call/result groups so the fold
        // never separates a call from its result.
        while summarize_count > 0 && summarize_count < non_system.len() {
            match &non_system[summarize_count].content {
                MessageContent::ToolResult { .. } | MessageContent::ToolCall { .. } => {
                    summarize_count -= 1;
                }
                _ => break,
            }
        }
        if summarize_count == 0 {
            return messages.to_vec();
        }

        let to_fold = &non_system[..summarize_count];
        let recent = &non_system[summarize_count..];

        let fold_tokens: usize = to_fold.iter().map(|m| self.counter.count_message(m)).sum();
        let target_tokens =
            ((fold_tokens as f32 * self.compression_ratio) as usize).max(64);

        let summary_text = match &self.summarizer {
            Some(s) => match s.summarize(to_fold, target_tokens).await {
                Ok(text) if !text.is_empty() => text,
                Ok(_) => deterministic_summary(to_fold, target_tokens * 4),
                Err(e) => {
                    warn!(error = %e, "summarizer failed; using deterministic fallback");
                    deterministic_summary(to_fold, target_tokens * 4)
                }
            },
            None => deterministic_summary(to_fold, target_tokens * 4),
        };

        let mut out: Vec<Message> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .cloned()
            .collect();
        out.push(Message::summary(format!(
            "[conversation summary]\n{summary_text}"
        )));
        out.extend(recent.iter().cloned());
        out
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(max: usize) -> ContextManager {
        ContextManager::new("grok-3", max, 0, 2, 0.3)
    }

    fn long_history(n: usize, chars_per_msg: usize) -> Vec<Message> {
        let mut msgs = vec![Message::system("system prompt")];
        for i in 0..n {
            if i % 2 == 0 {
                msgs.push(Message::user(format!("u{i} {}", "x".repeat(chars_per_msg))));
            } else {
                msgs.push(Message::assistant(format!(
                    "a{i} {}",
                    "y".repeat(chars_per_msg)
                )));
            }
        }
        msgs
    }

    #[tokio::test]
    async fn small_history_is_untouched() {
        let m = manager(100_000);
        let msgs = long_history(4, 10);
        let (out, warning) = m.prepare(&msgs, false).await;
        assert_eq!(out.len(), msgs.len());
        assert!(warning.is_none());
    }

    #[tokio::test]
    async fn oversized_history_is_folded_under_cap() {
        let m = manager(2_000);
        let msgs = long_history(40, 400); // ~40 * 100 tokens, far over cap
        let (out, _) = m.prepare(&msgs, false).await;
        assert!(m.counter().count_messages(&out) <= 2_000);
        assert!(out.len() < msgs.len());
        // System prompt survives, summary present.
        assert_eq!(out[0].as_text(), Some("system prompt"));
        assert!(out.iter().any(|x| x.summary));
    }

    #[tokio::test]
    async fn recent_messages_survive_verbatim() {
        let m = manager(2_000);
        let msgs = long_history(40, 400);
        let last = msgs.last().unwrap().as_text().unwrap().to_string();
        let (out, _) = m.prepare(&msgs, false).await;
        assert_eq!(out.last().unwrap().as_text(), Some(last.as_str()));
    }

    #[tokio::test]
    async fn prepare_is_idempotent() {
        let m = manager(2_000);
        let msgs = long_history(40, 400);
        let (once, _) = m.prepare(&msgs, false).await;
        let (twice, _) = m.prepare(&once, false).await;
        let texts = |v: &[Message]| -> Vec<String> {
            v.iter()
                .map(|m| m.as_text().unwrap_or("").to_string())
                .collect()
        };
        assert_eq!(texts(&once), texts(&twice));
    }

    #[tokio::test]
    async fn fold_never_splits_tool_groups() {
        let m = ContextManager::new("grok-3", 500, 0, 2, 0.3);
        let mut msgs = vec![Message::system("sys")];
        for i in 0..10 {
            msgs.push(Message::user(format!("request {i} {}", "p".repeat(200))));
            msgs.push(Message::tool_call(format!("c{i}"), "shell", "{}"));
            msgs.push(Message::tool_result(format!("c{i}"), "shell", "ok"));
        }
        let (out, _) = m.prepare(&msgs, false).await;
        // Every surviving ToolResult has its ToolCall in the output too.
        for msg in &out {
            if let MessageContent::ToolResult { tool_call_id, .. } = &msg.content {
                assert!(
                    out.iter().any(|m| matches!(
                        &m.content,
                        MessageContent::ToolCall { tool_call_id: id, .. } if id == tool_call_id
                    )),
                    "orphan tool result {tool_call_id}"
                );
            }
        }
    }

    #[tokio::test]
    async fn warnings_fire_at_thresholds() {
        // Window sized so 4 short messages land above 80%.
        let msgs = vec![
            Message::system("s".repeat(400)),
            Message::user("u".repeat(400)),
        ];
        let m = ContextManager::new("grok-3", 250, 0, 2, 0.3);
        let (_, warning) = m.prepare(&msgs, false).await;
        // The fold cannot shrink two messages that are all System/recent,
        // so usage stays high and the warning fires.
        let w = warning.expect("expected a warning");
        assert!(matches!(w.level, WarnLevel::Warn | WarnLevel::Critical));
    }

    #[tokio::test]
    async fn context_blocks_are_appended_once() {
        let m = manager(100_000).with_context_block("## Task list\n- item");
        let msgs = vec![Message::system("sys"), Message::user("hello")];
        let (once, _) = m.prepare(&msgs, false).await;
        assert_eq!(
            once.iter()
                .filter(|x| x.as_text() == Some("## Task list\n- item"))
                .count(),
            1
        );
        let (twice, _) = m.prepare(&once, false).await;
        assert_eq!(
            twice
                .iter()
                .filter(|x| x.as_text() == Some("## Task list\n- item"))
                .count(),
            1,
            "re-preparing must not duplicate context blocks"
        );
    }

    #[tokio::test]
    async fn force_fold_compacts_even_when_fitting() {
        let m = manager(100_000);
        let msgs = long_history(20, 100);
        let (out, _) = m.prepare(&msgs, true).await;
        assert!(out.iter().any(|x| x.summary), "forced fold must summarize");
        assert!(out.len() < msgs.len());
    }

    struct FixedSummarizer;

    #[async_trait]
    impl Summarizer for FixedSummarizer {
        async fn summarize(&self, _span: &[Message], _target: usize) -> anyhow::Result<String> {
            Ok("LLM SUMMARY".into())
        }
    }

    #[tokio::test]
    async fn summarizer_hook_is_used_when_installed() {
        let m = manager(2_000).with_summarizer(Arc::new(FixedSummarizer));
        let msgs = long_history(40, 400);
        let (out, _) = m.prepare(&msgs, false).await;
        assert!(out
            .iter()
            .any(|x| x.as_text().map(|t| t.contains("LLM SUMMARY")).unwrap_or(false)));
    }
}
