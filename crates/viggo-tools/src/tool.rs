// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;

/// A single tool invocation with parsed arguments.
///
/// The raw `arguments` JSON string from the model is parsed by the
/// dispatcher before a [`Tool`] ever sees the call.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier from the model (forwarded verbatim)
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments
    pub args: Value,
}

/// The result of executing a tool.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    pub content: String,
    /// If true, the tool execution failed non-fatally (content holds the
    /// error message).
    pub is_error: bool,
    /// Structured extras a tool wants to surface (exit codes, byte counts…).
    pub metadata: Value,
}

impl ToolOutput {
    /// Successful plain-text result.
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            is_error: false,
            metadata: Value::Null,
        }
    }

    /// Error result containing a plain-text error message.
    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: msg.into(),
            is_error: true,
            metadata: Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// One event from a streaming tool execution.
#[derive(Debug, Clone)]
pub enum ToolStreamEvent {
    /// An incremental output fragment.
    Delta(String),
    /// The terminal result; always the last event.
    Done(ToolOutput),
}

pub type ToolEventStream = Pin<Box<dyn Stream<Item = ToolStreamEvent> + Send>>;

/// Describes the shape of a tool's text output for context-aware truncation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputCategory {
    /// Terminal / process output: keep head + tail lines so both the
    /// command preamble and the final result are visible.
    HeadTail,
    /// Ordered match list: keep the leading matches.
    MatchList,
    /// File content: balanced head + tail window.
    FileContent,
    /// Generic text: hard-truncate at the character boundary.
    #[default]
    Generic,
}

/// Trait that every built-in and user-defined tool must implement.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for parameters
    fn parameters_schema(&self) -> Value;
    /// Selector category: "file_read" | "file_write" | "shell" | "search" |
    /// "web" | "context" | …
    fn category(&self) -> &str;
    /// Keywords the selector scores against the user input.
    fn keywords(&self) -> &[&str] {
        &[]
    }
    /// Selector tie-break priority; higher sorts earlier.
    fn priority(&self) -> i32 {
        0
    }
    /// Read-only tools may run in parallel within a lane.  Mutating tools
    /// take the lane's serial slot.  This is declared per tool, not derived
    /// from arguments at runtime.
    fn read_only(&self) -> bool {
        false
    }
    /// Streaming-capable tools implement [`execute_streaming`] natively.
    fn streaming(&self) -> bool {
        false
    }
    /// Output shape for context-aware truncation.
    fn output_category(&self) -> OutputCategory {
        OutputCategory::Generic
    }
    /// Execute the tool.  Errors should be wrapped in [`ToolOutput::err`].
    async fn execute(&self, call: &ToolCall) -> ToolOutput;

    /// Streaming execution: a sequence of deltas terminated by `Done`.
    ///
    /// The default wraps [`execute`](Self::execute) as a one-element
    /// sequence; tools that set [`streaming`](Self::streaming) override it.
    async fn execute_streaming(&self, call: &ToolCall) -> ToolEventStream {
        let output = self.execute(call).await;
        Box::pin(futures::stream::iter(vec![ToolStreamEvent::Done(output)]))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
