// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Before/after-turn hooks.
//!
//! Middlewares run in ascending priority order; the first non-`Continue`
//! result short-circuits the phase and its action is returned to the
//! executor.  The default pipeline carries the turn limiter, the cost
//! ceiling, and the context-pressure compactor.

use std::sync::Arc;

use async_trait::async_trait;

use viggo_model::Usage;

use crate::cost::CostGuard;

/// Disposition returned by a middleware phase.
#[derive(Debug, Clone, PartialEq)]
pub enum MiddlewareResult {
    Continue,
    /// Surface a warning to the user; the turn proceeds.
    Warn(String),
    /// Ask the executor to compact the context eagerly.
    Compact,
    /// Terminate the turn, optionally with an explanation.
    Stop(Option<String>),
}

/// Snapshot of turn state handed to each middleware.
#[derive(Clone)]
pub struct TurnContext {
    pub tool_round: u32,
    pub max_tool_rounds: u32,
    /// Usage reported by the most recent provider call.
    pub last_usage: Usage,
    /// Fraction of the usable context window in use.
    pub context_fraction: f32,
    pub cost: Arc<CostGuard>,
}

#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;
    fn priority(&self) -> i32 {
        0
    }
    async fn before_turn(&self, _ctx: &TurnContext) -> MiddlewareResult {
        MiddlewareResult::Continue
    }
    async fn after_turn(&self, _ctx: &TurnContext) -> MiddlewareResult {
        MiddlewareResult::Continue
    }
}

pub struct MiddlewarePipeline {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewarePipeline {
    pub fn new(mut middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        middlewares.sort_by_key(|m| m.priority());
        Self { middlewares }
    }

    pub fn empty() -> Self {
        Self {
            middlewares: Vec::new(),
        }
    }

    /// The standard pipeline: turn limiter, cost ceiling, context pressure.
    pub fn standard() -> Self {
        Self::new(vec![
            Arc::new(TurnLimitMiddleware),
            Arc::new(CostMiddleware),
            Arc::new(ContextWarnMiddleware::default()),
        ])
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    pub async fn before(&self, ctx: &TurnContext) -> MiddlewareResult {
        for m in &self.middlewares {
            let r = m.before_turn(ctx).await;
            if r != MiddlewareResult::Continue {
                return r;
            }
        }
        MiddlewareResult::Continue
    }

    pub async fn after(&self, ctx: &TurnContext) -> MiddlewareResult {
        for m in &self.middlewares {
            let r = m.after_turn(ctx).await;
            if r != MiddlewareResult::Continue {
                return r;
            }
        }
        MiddlewareResult::Continue
    }
}

// ─── Built-in middlewares ─────────────────────────────────────────────────────

/// Warns at 80% of the round budget, stops at 100%.
pub struct TurnLimitMiddleware;

#[async_trait]
impl Middleware for TurnLimitMiddleware {
    fn name(&self) -> &str {
        "turn_limit"
    }
    fn priority(&self) -> i32 {
        10
    }

    async fn before_turn(&self, ctx: &TurnContext) -> MiddlewareResult {
        if ctx.tool_round >= ctx.max_tool_rounds {
            return MiddlewareResult::Stop(Some(
                "Maximum tool execution rounds reached.".to_string(),
            ));
        }
        if ctx.max_tool_rounds > 0
            && ctx.tool_round * 10 >= ctx.max_tool_rounds * 8
            && ctx.tool_round + 1 < ctx.max_tool_rounds
        {
            return MiddlewareResult::Warn(format!(
                "approaching tool round limit: {}/{}",
                ctx.tool_round, ctx.max_tool_rounds
            ));
        }
        MiddlewareResult::Continue
    }
}

/// Checks the session cost ceiling after each round.  Usage recording
/// happens at the stream boundary so the pre-tool check inside the round
/// already sees the current round's cost.
pub struct CostMiddleware;

#[async_trait]
impl Middleware for CostMiddleware {
    fn name(&self) -> &str {
        "cost"
    }
    fn priority(&self) -> i32 {
        20
    }

    async fn after_turn(&self, ctx: &TurnContext) -> MiddlewareResult {
        if ctx.cost.exceeded() {
            return MiddlewareResult::Stop(Some(format!(
                "Session cost limit of ${:.2} reached (spent ${:.4}). \
                 Raise the limit to continue.",
                ctx.cost.limit(),
                ctx.cost.session_cost()
            )));
        }
        MiddlewareResult::Continue
    }
}

/// Requests eager compaction when context pressure builds.
pub struct ContextWarnMiddleware {
    pub compact_threshold: f32,
}

impl Default for ContextWarnMiddleware {
    fn default() -> Self {
        Self {
            compact_threshold: 0.85,
        }
    }
}

#[async_trait]
impl Middleware for ContextWarnMiddleware {
    fn name(&self) -> &str {
        "context_warn"
    }
    fn priority(&self) -> i32 {
        30
    }

    async fn before_turn(&self, ctx: &TurnContext) -> MiddlewareResult {
        if ctx.context_fraction >= self.compact_threshold {
            return MiddlewareResult::Compact;
        }
        MiddlewareResult::Continue
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
