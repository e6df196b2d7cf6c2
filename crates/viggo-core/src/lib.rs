// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod accum;
pub mod agent;
pub mod cancel;
pub mod compact;
pub mod context;
pub mod cost;
pub mod events;
pub mod middleware;
pub mod queue;
pub mod session;
pub mod token;
pub mod variator;

pub use accum::{StreamAccumulator, ToolCallRequest};
pub use agent::AgentExecutor;
pub use cancel::CancellationToken;
pub use context::{ContextManager, ContextWarning, Summarizer, WarnLevel};
pub use cost::CostGuard;
pub use events::{AgentEvent, ChatEntry};
pub use middleware::{
    ContextWarnMiddleware, CostMiddleware, Middleware, MiddlewarePipeline, MiddlewareResult,
    TurnContext, TurnLimitMiddleware,
};
pub use queue::{MessageQueue, QueueMode, QueuedMessage};
pub use session::Session;
pub use token::TokenCounter;
pub use variator::ObservationVariator;

#[cfg(test)]
mod tests;
