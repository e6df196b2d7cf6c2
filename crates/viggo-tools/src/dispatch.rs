// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Routing of model-issued tool calls to concrete handlers.
//!
//! The dispatcher owns the boundary between the model's untrusted output
//! and the tool layer: it parses the raw argument JSON, validates write
//! paths against the sandbox policy, snapshots files before mutation, and
//! routes `mcp__`-prefixed names to an external router when one is
//! registered.  Every failure mode becomes a failed [`ToolOutput`] — the
//! model sees the error and may retry; the turn never aborts here.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use viggo_sandbox::Sandbox;

use crate::registry::ToolRegistry;
use crate::tool::{ToolCall, ToolEventStream, ToolOutput, ToolStreamEvent};

/// Name prefix that routes a call to the MCP router instead of a built-in.
pub const MCP_PREFIX: &str = "mcp__";

/// Snapshots files before the dispatcher lets a tool mutate them, so the
/// change is reversible.
#[async_trait]
pub trait CheckpointHook: Send + Sync {
    async fn before_edit(&self, path: &Path);
    async fn before_create(&self, path: &Path);
}

/// External tool transport (MCP-style).  Registered at init iff the
/// capability is available; calls routed here otherwise produce a
/// structured capability-missing error.
#[async_trait]
pub trait McpRouter: Send + Sync {
    async fn call(&self, tool: &str, args: &Value) -> anyhow::Result<String>;
}

pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    sandbox: Arc<Sandbox>,
    checkpoints: Option<Arc<dyn CheckpointHook>>,
    mcp: Option<Arc<dyn McpRouter>>,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, sandbox: Arc<Sandbox>) -> Self {
        Self {
            registry,
            sandbox,
            checkpoints: None,
            mcp: None,
        }
    }

    pub fn with_checkpoints(mut self, hook: Arc<dyn CheckpointHook>) -> Self {
        self.checkpoints = Some(hook);
        self
    }

    pub fn with_mcp(mut self, router: Arc<dyn McpRouter>) -> Self {
        self.mcp = Some(router);
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Execute one tool call from its wire form.
    pub async fn execute(&self, id: &str, name: &str, arguments: &str) -> ToolOutput {
        let args = match parse_arguments(arguments) {
            Ok(v) => v,
            Err(e) => return ToolOutput::err(id, format!("invalid arguments: {e}")),
        };

        if let Some(external) = name.strip_prefix(MCP_PREFIX) {
            return self.execute_mcp(id, external, &args).await;
        }

        let Some(tool) = self.registry.get(name) else {
            return ToolOutput::err(id, format!("unknown tool: {name}"));
        };

        let call = match self.prepare_call(id, name, args, tool.category()).await {
            Ok(c) => c,
            Err(out) => return *out,
        };

        debug!(tool = name, call_id = id, "dispatching tool call");

        // Isolate the handler in its own task so a panic becomes a failed
        // result instead of tearing down the turn.
        let task = tokio::spawn(async move { tool.execute(&call).await });
        match task.await {
            Ok(output) => output,
            Err(e) => ToolOutput::err(id, format!("tool execution panicked: {e}")),
        }
    }

    /// Streaming variant: a lazy sequence of deltas whose terminal event is
    /// the final [`ToolOutput`].  Non-streaming tools are wrapped as a
    /// one-element sequence.
    pub async fn execute_streaming(&self, id: &str, name: &str, arguments: &str) -> ToolEventStream {
        let args = match parse_arguments(arguments) {
            Ok(v) => v,
            Err(e) => {
                return single(ToolOutput::err(id, format!("invalid arguments: {e}")));
            }
        };

        if let Some(external) = name.strip_prefix(MCP_PREFIX) {
            return single(self.execute_mcp(id, external, &args).await);
        }

        let Some(tool) = self.registry.get(name) else {
            return single(ToolOutput::err(id, format!("unknown tool: {name}")));
        };

        let call = match self.prepare_call(id, name, args, tool.category()).await {
            Ok(c) => c,
            Err(out) => return single(*out),
        };

        tool.execute_streaming(&call).await
    }

    /// Common pre-flight: write-path validation and checkpointing.
    async fn prepare_call(
        &self,
        id: &str,
        name: &str,
        mut args: Value,
        category: &str,
    ) -> Result<ToolCall, Box<ToolOutput>> {
        if category == "file_write" {
            let Some(raw_path) = args.get("path").and_then(|p| p.as_str()) else {
                return Err(Box::new(ToolOutput::err(id, "missing required field: path")));
            };
            let resolved = match self.sandbox.resolve_write_path(Path::new(raw_path)) {
                Ok(p) => p,
                Err(e) => return Err(Box::new(ToolOutput::err(id, e.to_string()))),
            };
            if let Some(hook) = &self.checkpoints {
                if resolved.exists() {
                    hook.before_edit(&resolved).await;
                } else {
                    hook.before_create(&resolved).await;
                }
            }
            args["path"] = Value::String(resolved.to_string_lossy().into_owned());
        } else if category == "shell" {
            // Shell commands can mutate anything under the workspace;
            // checkpoint at the workspace root.
            if let Some(hook) = &self.checkpoints {
                if let Some(wd) = &self.sandbox.config().work_dir {
                    hook.before_edit(wd).await;
                }
            }
        }

        Ok(ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            args,
        })
    }

    async fn execute_mcp(&self, id: &str, tool: &str, args: &Value) -> ToolOutput {
        match &self.mcp {
            Some(router) => match router.call(tool, args).await {
                Ok(out) => ToolOutput::ok(id, out),
                Err(e) => {
                    warn!(tool, error = %e, "mcp tool call failed");
                    ToolOutput::err(id, format!("mcp tool {tool} failed: {e}"))
                }
            },
            None => ToolOutput::err(
                id,
                format!("capability missing: no MCP router registered for {MCP_PREFIX}{tool}"),
            ),
        }
    }
}

fn parse_arguments(arguments: &str) -> anyhow::Result<Value> {
    if arguments.trim().is_empty() {
        // Models occasionally send an empty argument string for zero-arg
        // tools; treat it as the empty object.
        return Ok(Value::Object(Default::default()));
    }
    let v: Value = serde_json::from_str(arguments)?;
    anyhow::ensure!(v.is_object(), "arguments must be a JSON object");
    Ok(v)
}

fn single(output: ToolOutput) -> ToolEventStream {
    Box::pin(futures::stream::iter(vec![ToolStreamEvent::Done(output)]))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Mutex;

    use futures::StreamExt;
    use serde_json::json;
    use viggo_config::SandboxConfig;

    use super::*;
    use crate::tool::Tool;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echo"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        fn category(&self) -> &str {
            "misc"
        }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            ToolOutput::ok(&call.id, call.args["text"].as_str().unwrap_or("").to_string())
        }
    }

    struct WriteStub;

    #[async_trait]
    impl Tool for WriteStub {
        fn name(&self) -> &str {
            "write_file"
        }
        fn description(&self) -> &str {
            "write"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        fn category(&self) -> &str {
            "file_write"
        }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            ToolOutput::ok(&call.id, call.args["path"].as_str().unwrap_or("").to_string())
        }
    }

    struct PanicTool;

    #[async_trait]
    impl Tool for PanicTool {
        fn name(&self) -> &str {
            "panic"
        }
        fn description(&self) -> &str {
            "panics"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        fn category(&self) -> &str {
            "misc"
        }
        async fn execute(&self, _call: &ToolCall) -> ToolOutput {
            panic!("boom")
        }
    }

    #[derive(Default)]
    struct RecordingHook {
        edits: Mutex<Vec<PathBuf>>,
        creates: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl CheckpointHook for RecordingHook {
        async fn before_edit(&self, path: &Path) {
            self.edits.lock().unwrap().push(path.to_path_buf());
        }
        async fn before_create(&self, path: &Path) {
            self.creates.lock().unwrap().push(path.to_path_buf());
        }
    }

    struct StubRouter;

    #[async_trait]
    impl McpRouter for StubRouter {
        async fn call(&self, tool: &str, _args: &Value) -> anyhow::Result<String> {
            Ok(format!("mcp says hi from {tool}"))
        }
    }

    fn dispatcher(workspace: PathBuf) -> ToolDispatcher {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool);
        reg.register(WriteStub);
        reg.register(PanicTool);
        let sandbox = Sandbox::new(
            SandboxConfig {
                backend: Some("none".into()),
                ..Default::default()
            },
            workspace,
        );
        ToolDispatcher::new(Arc::new(reg), Arc::new(sandbox))
    }

    #[tokio::test]
    async fn executes_known_tool() {
        let d = dispatcher(PathBuf::from("/work"));
        let out = d.execute("1", "echo", r#"{"text":"hi"}"#).await;
        assert!(!out.is_error);
        assert_eq!(out.content, "hi");
    }

    #[tokio::test]
    async fn invalid_json_becomes_failed_output() {
        let d = dispatcher(PathBuf::from("/work"));
        let out = d.execute("1", "echo", "{not json").await;
        assert!(out.is_error);
        assert!(out.content.contains("invalid arguments"));
    }

    #[tokio::test]
    async fn non_object_arguments_rejected() {
        let d = dispatcher(PathBuf::from("/work"));
        let out = d.execute("1", "echo", "[1,2,3]").await;
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn empty_arguments_default_to_empty_object() {
        let d = dispatcher(PathBuf::from("/work"));
        let out = d.execute("1", "echo", "").await;
        assert!(!out.is_error);
    }

    #[tokio::test]
    async fn unknown_tool_is_failed_output() {
        let d = dispatcher(PathBuf::from("/work"));
        let out = d.execute("1", "missing", "{}").await;
        assert!(out.is_error);
        assert!(out.content.contains("unknown tool"));
    }

    #[tokio::test]
    async fn panicking_tool_becomes_failed_output() {
        let d = dispatcher(PathBuf::from("/work"));
        let out = d.execute("1", "panic", "{}").await;
        assert!(out.is_error);
        assert!(out.content.contains("panicked"));
    }

    #[tokio::test]
    async fn write_path_is_validated_and_rewritten() {
        let d = dispatcher(PathBuf::from("/work"));
        let out = d
            .execute("1", "write_file", r#"{"path":"src/lib.rs","content":"x"}"#)
            .await;
        assert!(!out.is_error);
        assert_eq!(out.content, "/work/src/lib.rs");
    }

    #[tokio::test]
    async fn write_outside_workspace_is_rejected() {
        let d = dispatcher(PathBuf::from("/work"));
        let out = d
            .execute("1", "write_file", r#"{"path":"/etc/passwd","content":"x"}"#)
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("escapes the workspace"));
    }

    #[tokio::test]
    async fn checkpoint_hook_runs_before_create() {
        let dir = tempfile::tempdir().unwrap();
        let hook = Arc::new(RecordingHook::default());
        let d = dispatcher(dir.path().to_path_buf()).with_checkpoints(hook.clone());
        let _ = d
            .execute("1", "write_file", r#"{"path":"new.txt","content":"x"}"#)
            .await;
        assert_eq!(hook.creates.lock().unwrap().len(), 1);
        assert!(hook.edits.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn checkpoint_hook_runs_before_edit_of_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.txt"), "previous").unwrap();
        let hook = Arc::new(RecordingHook::default());
        let d = dispatcher(dir.path().to_path_buf()).with_checkpoints(hook.clone());
        let _ = d
            .execute("1", "write_file", r#"{"path":"old.txt","content":"x"}"#)
            .await;
        assert_eq!(hook.edits.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mcp_prefix_without_router_reports_capability_missing() {
        let d = dispatcher(PathBuf::from("/work"));
        let out = d.execute("1", "mcp__remote_tool", "{}").await;
        assert!(out.is_error);
        assert!(out.content.contains("capability missing"));
    }

    #[tokio::test]
    async fn mcp_prefix_routes_through_router() {
        let d = dispatcher(PathBuf::from("/work")).with_mcp(Arc::new(StubRouter));
        let out = d.execute("1", "mcp__remote_tool", "{}").await;
        assert!(!out.is_error);
        assert!(out.content.contains("remote_tool"));
    }

    #[tokio::test]
    async fn streaming_wraps_non_streaming_tools() {
        let d = dispatcher(PathBuf::from("/work"));
        let mut s = d.execute_streaming("1", "echo", r#"{"text":"hi"}"#).await;
        match s.next().await {
            Some(ToolStreamEvent::Done(out)) => assert_eq!(out.content, "hi"),
            other => panic!("expected Done, got {other:?}"),
        }
        assert!(s.next().await.is_none());
    }
}
