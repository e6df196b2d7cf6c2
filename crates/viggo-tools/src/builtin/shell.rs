// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use viggo_sandbox::{ExecResult, Sandbox};

use crate::policy::{ApprovalPolicy, ToolPolicy};
use crate::tool::{OutputCategory, Tool, ToolCall, ToolEventStream, ToolOutput, ToolStreamEvent};

/// Built-in tool that runs a shell command through the sandbox.
pub struct ShellTool {
    sandbox: Arc<Sandbox>,
    policy: ToolPolicy,
}

impl ShellTool {
    pub fn new(sandbox: Arc<Sandbox>, policy: ToolPolicy) -> Self {
        Self { sandbox, policy }
    }

    fn command_from(call: &ToolCall) -> Result<String, ToolOutput> {
        match call.args.get("command").and_then(|v| v.as_str()) {
            Some(c) if !c.trim().is_empty() => Ok(c.to_string()),
            _ => Err(ToolOutput::err(
                &call.id,
                "missing required field: command",
            )),
        }
    }

    fn check_policy(&self, call_id: &str, command: &str) -> Option<ToolOutput> {
        // Interactive approval is the caller's concern; the kernel enforces
        // the deny list only.
        if self.policy.decide(command) == ApprovalPolicy::Deny {
            return Some(ToolOutput::err(
                call_id,
                format!("command denied by policy: {command}"),
            ));
        }
        None
    }

    fn render(call_id: &str, r: ExecResult) -> ToolOutput {
        let mut content = String::new();
        if !r.stdout.is_empty() {
            content.push_str(&r.stdout);
        }
        if !r.stderr.is_empty() {
            if !content.is_empty() && !content.ends_with('\n') {
                content.push('\n');
            }
            content.push_str("[stderr]\n");
            content.push_str(&r.stderr);
        }

        let metadata = json!({
            "exit_code": r.exit_code,
            "duration_ms": r.duration.as_millis() as u64,
            "backend": r.backend.as_str(),
            "sandboxed": r.sandboxed,
            "timed_out": r.timed_out,
        });

        if r.timed_out {
            return ToolOutput::err(call_id, format!("timeout: {}", r.stderr)).with_metadata(metadata);
        }
        match r.exit_code {
            0 => ToolOutput::ok(call_id, content).with_metadata(metadata),
            // Exit code 1 is the Unix convention for "no matches" (grep/rg)
            // and "condition false" (test); flagging it as an error teaches
            // the model that the command itself failed.
            1 => {
                let out = if content.is_empty() {
                    "[exit 1]".to_string()
                } else {
                    format!("[exit 1]\n{content}")
                };
                ToolOutput::ok(call_id, out).with_metadata(metadata)
            }
            code => {
                ToolOutput::err(call_id, format!("[exit {code}]\n{content}")).with_metadata(metadata)
            }
        }
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return stdout + stderr.\n\
         'command' is required and can be any one-liner for the platform shell.\n\
         Commands run inside the configured sandbox; network and filesystem\n\
         access follow the session policy.\n\
         Prefer non-interactive commands. Avoid commands that require a TTY."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The complete shell one-liner to execute."
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    fn category(&self) -> &str {
        "shell"
    }
    fn keywords(&self) -> &[&str] {
        &["run", "execute", "command", "bash", "shell", "build", "test"]
    }
    fn priority(&self) -> i32 {
        1
    }
    fn streaming(&self) -> bool {
        true
    }
    fn output_category(&self) -> OutputCategory {
        OutputCategory::HeadTail
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let command = match Self::command_from(call) {
            Ok(c) => c,
            Err(out) => return out,
        };
        if let Some(denied) = self.check_policy(&call.id, &command) {
            return denied;
        }
        debug!(cmd = %command, "executing shell tool");
        match self.sandbox.exec_shell(&command).await {
            Ok(result) => Self::render(&call.id, result),
            Err(e) => ToolOutput::err(&call.id, e.to_string()),
        }
    }

    /// Stream stdout line-by-line as it is produced.
    ///
    /// Dropping the returned stream aborts the run: pending sends fail, the
    /// reader task stops, and `kill_on_drop` reaps the child.
    async fn execute_streaming(&self, call: &ToolCall) -> ToolEventStream {
        let command = match Self::command_from(call) {
            Ok(c) => c,
            Err(out) => return single(out),
        };
        if let Some(denied) = self.check_policy(&call.id, &command) {
            return single(denied);
        }

        let argv: Vec<String> = if cfg!(windows) {
            vec!["cmd".into(), "/c".into(), command.clone()]
        } else {
            vec!["sh".into(), "-c".into(), command.clone()]
        };
        let (mut cmd, backend, sandboxed) = match self.sandbox.prepare(&argv) {
            Ok(t) => t,
            Err(e) => return single(ToolOutput::err(&call.id, e.to_string())),
        };
        let timeout = self.sandbox.timeout();
        let call_id = call.id.clone();
        let (tx, rx) = mpsc::channel::<ToolStreamEvent>(64);

        tokio::spawn(async move {
            let started = std::time::Instant::now();
            let mut child = match cmd.spawn() {
                Ok(c) => c,
                Err(e) => {
                    let _ = tx
                        .send(ToolStreamEvent::Done(ToolOutput::err(
                            &call_id,
                            format!("spawn error: {e}"),
                        )))
                        .await;
                    return;
                }
            };

            let mut collected = String::new();
            let deadline = tokio::time::Instant::now() + timeout;

            if let Some(stdout) = child.stdout.take() {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    tokio::select! {
                        line = lines.next_line() => match line {
                            Ok(Some(l)) => {
                                let delta = format!("{l}\n");
                                collected.push_str(&delta);
                                if tx.send(ToolStreamEvent::Delta(delta)).await.is_err() {
                                    // Consumer gone (cancellation): stop
                                    // reading; kill_on_drop reaps the child.
                                    return;
                                }
                            }
                            Ok(None) | Err(_) => break,
                        },
                        _ = tokio::time::sleep_until(deadline) => {
                            let _ = child.kill().await;
                            let _ = tx
                                .send(ToolStreamEvent::Done(ToolOutput::err(
                                    &call_id,
                                    format!("timeout after {}s", timeout.as_secs()),
                                )))
                                .await;
                            return;
                        }
                    }
                }
            }

            let mut stderr_buf = String::new();
            if let Some(mut se) = child.stderr.take() {
                let _ = se.read_to_string(&mut stderr_buf).await;
            }

            let status = match tokio::time::timeout_at(deadline, child.wait()).await {
                Ok(Ok(s)) => s,
                Ok(Err(e)) => {
                    let _ = tx
                        .send(ToolStreamEvent::Done(ToolOutput::err(
                            &call_id,
                            format!("wait error: {e}"),
                        )))
                        .await;
                    return;
                }
                Err(_) => {
                    let _ = child.kill().await;
                    let _ = tx
                        .send(ToolStreamEvent::Done(ToolOutput::err(
                            &call_id,
                            format!("timeout after {}s", timeout.as_secs()),
                        )))
                        .await;
                    return;
                }
            };

            let result = ExecResult {
                exit_code: status.code().unwrap_or(-1),
                stdout: collected,
                stderr: stderr_buf,
                duration: started.elapsed(),
                timed_out: false,
                backend,
                sandboxed,
            };
            let _ = tx.send(ToolStreamEvent::Done(Self::render(&call_id, result))).await;
        });

        Box::pin(ReceiverStream::new(rx))
    }
}

fn single(output: ToolOutput) -> ToolEventStream {
    Box::pin(futures::stream::iter(vec![ToolStreamEvent::Done(output)]))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
