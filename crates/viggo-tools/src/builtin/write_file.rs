// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{Tool, ToolCall, ToolOutput};

/// Built-in tool that writes (creates or replaces) a file.
///
/// The dispatcher validates and rewrites `path` against the sandbox policy
/// before this tool runs, and snapshots the target via the checkpoint hook.
#[derive(Default)]
pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Create or overwrite a file with the given content.\n\
         'path' and 'content' are required.  Parent directories are created\n\
         as needed."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File to write" },
                "content": { "type": "string", "description": "Full new file content" }
            },
            "required": ["path", "content"],
            "additionalProperties": false
        })
    }

    fn category(&self) -> &str {
        "file_write"
    }
    fn keywords(&self) -> &[&str] {
        &["write", "create", "save", "edit", "file", "new"]
    }
    fn priority(&self) -> i32 {
        1
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let Some(path) = call.args.get("path").and_then(|p| p.as_str()) else {
            return ToolOutput::err(&call.id, "missing required field: path");
        };
        let Some(content) = call.args.get("content").and_then(|c| c.as_str()) else {
            return ToolOutput::err(&call.id, "missing required field: content");
        };

        let path = PathBuf::from(path);
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ToolOutput::err(
                    &call.id,
                    format!("cannot create {}: {e}", parent.display()),
                );
            }
        }
        match tokio::fs::write(&path, content).await {
            Ok(()) => ToolOutput::ok(
                &call.id,
                format!("Wrote {} bytes to {}", content.len(), path.display()),
            ),
            Err(e) => ToolOutput::err(&call.id, format!("cannot write {}: {e}", path.display())),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn writes_file_and_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("deep/nested/file.txt");
        let t = WriteFileTool;
        let out = t
            .execute(&ToolCall {
                id: "1".into(),
                name: "write_file".into(),
                args: json!({"path": target.to_string_lossy(), "content": "payload"}),
            })
            .await;
        assert!(!out.is_error, "{}", out.content);
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "payload");
        assert!(out.content.contains("7 bytes"));
    }

    #[tokio::test]
    async fn missing_fields_are_failed_outputs() {
        let t = WriteFileTool;
        let out = t
            .execute(&ToolCall {
                id: "1".into(),
                name: "write_file".into(),
                args: json!({"path": "/tmp/x"}),
            })
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("content"));
    }

    #[test]
    fn declares_mutating_category() {
        let t = WriteFileTool;
        assert_eq!(t.category(), "file_write");
        assert!(!t.read_only());
    }
}
