// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{OutputCategory, Tool, ToolCall, ToolOutput};

/// Built-in tool that reads a file from the workspace.
pub struct ReadFileTool {
    workspace_root: PathBuf,
}

impl ReadFileTool {
    pub fn new(workspace_root: PathBuf) -> Self {
        Self { workspace_root }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file and return its contents.\n\
         'path' is required (relative paths resolve against the workspace).\n\
         Optional 'offset' (1-based line) and 'limit' (line count) select a\n\
         window of a large file."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File to read" },
                "offset": { "type": "integer", "description": "1-based first line (optional)" },
                "limit": { "type": "integer", "description": "Number of lines (optional)" }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    fn category(&self) -> &str {
        "file_read"
    }
    fn keywords(&self) -> &[&str] {
        &["read", "view", "show", "open", "cat", "file", "contents"]
    }
    fn priority(&self) -> i32 {
        1
    }
    fn read_only(&self) -> bool {
        true
    }
    fn output_category(&self) -> OutputCategory {
        OutputCategory::FileContent
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let Some(raw) = call.args.get("path").and_then(|p| p.as_str()) else {
            return ToolOutput::err(&call.id, "missing required field: path");
        };
        let path = if PathBuf::from(raw).is_absolute() {
            PathBuf::from(raw)
        } else {
            self.workspace_root.join(raw)
        };

        let text = match tokio::fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(e) => {
                return ToolOutput::err(&call.id, format!("cannot read {}: {e}", path.display()))
            }
        };

        let offset = call.args.get("offset").and_then(|v| v.as_u64());
        let limit = call.args.get("limit").and_then(|v| v.as_u64());
        let content = match (offset, limit) {
            (None, None) => text,
            (offset, limit) => {
                let start = offset.unwrap_or(1).saturating_sub(1) as usize;
                let count = limit.unwrap_or(u64::MAX) as usize;
                text.lines()
                    .skip(start)
                    .take(count)
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        };
        ToolOutput::ok(&call.id, content)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
