// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::store::ResultStore;
use crate::tool::{OutputCategory, Tool, ToolCall, ToolOutput};

/// Built-in tool that rehydrates a compacted tool result.
///
/// When old tool outputs are replaced by restore stubs to free context, the
/// full payloads stay in the durable result store keyed by `tool_call_id`.
/// The model calls this tool with the id from the stub to read them back.
pub struct RestoreContextTool {
    store: Arc<ResultStore>,
}

impl RestoreContextTool {
    pub fn new(store: Arc<ResultStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for RestoreContextTool {
    fn name(&self) -> &str {
        "restore_context"
    }

    fn description(&self) -> &str {
        "Retrieve the full, untruncated output of an earlier tool call that\n\
         was compacted out of the conversation.  'tool_call_id' is the id\n\
         mentioned in the compaction stub."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "tool_call_id": {
                    "type": "string",
                    "description": "Id of the compacted tool call to restore"
                }
            },
            "required": ["tool_call_id"],
            "additionalProperties": false
        })
    }

    fn category(&self) -> &str {
        "context"
    }
    fn keywords(&self) -> &[&str] {
        &["restore", "context", "earlier", "previous", "output"]
    }
    fn read_only(&self) -> bool {
        true
    }
    fn output_category(&self) -> OutputCategory {
        OutputCategory::HeadTail
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let Some(id) = call.args.get("tool_call_id").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, "missing required field: tool_call_id");
        };
        match self.store.read(id) {
            Ok(content) => ToolOutput::ok(&call.id, content),
            Err(e) => ToolOutput::err(&call.id, e.to_string()),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
