// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::accum::ToolCallRequest;

/// Events emitted by the executor during a single turn.
/// Consumers (CLI runner, UI bridge) subscribe to these to drive output.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// User-visible text (streamed deltas and synthesized notices)
    Content(String),
    /// Chain-of-thought text, carried on a separate channel
    Reasoning(String),
    /// The model requested these tool calls this round
    ToolCalls(Vec<ToolCallRequest>),
    /// Incremental output from a streaming tool
    ToolStream { call_id: String, delta: String },
    /// A tool call finished
    ToolResult {
        call_id: String,
        tool_name: String,
        output: String,
        is_error: bool,
    },
    /// Current input token estimate
    TokenCount(usize),
    /// An out-of-band user message interrupted the tool batch
    Steer(String),
    /// The turn is finished; always the final event
    Done,
}

/// One entry in the UI-facing conversation log.
///
/// The log invariant mirrors the message invariant: every `ToolCall` entry
/// is eventually answered by a `ToolResult` entry with the same id, or the
/// turn is incomplete.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEntry {
    User {
        text: String,
        timestamp: DateTime<Utc>,
    },
    Assistant {
        text: String,
        timestamp: DateTime<Utc>,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: String,
        timestamp: DateTime<Utc>,
    },
    ToolResult {
        id: String,
        name: String,
        output: String,
        is_error: bool,
        timestamp: DateTime<Utc>,
    },
}

impl ChatEntry {
    pub fn user(text: impl Into<String>) -> Self {
        Self::User {
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::Assistant {
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, args: impl Into<String>) -> Self {
        Self::ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: args.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn tool_result(
        id: impl Into<String>,
        name: impl Into<String>,
        output: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::ToolResult {
            id: id.into(),
            name: name.into(),
            output: output.into(),
            is_error,
            timestamp: Utc::now(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_entry_serialises_with_type_tag() {
        let e = ChatEntry::user("hi");
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("\"type\":\"user\""));
        assert!(json.contains("\"text\":\"hi\""));
    }

    #[test]
    fn tool_entries_round_trip() {
        let e = ChatEntry::tool_result("c1", "shell", "out", false);
        let json = serde_json::to_string(&e).unwrap();
        let back: ChatEntry = serde_json::from_str(&json).unwrap();
        match back {
            ChatEntry::ToolResult { id, name, is_error, .. } => {
                assert_eq!(id, "c1");
                assert_eq!(name, "shell");
                assert!(!is_error);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }
}
