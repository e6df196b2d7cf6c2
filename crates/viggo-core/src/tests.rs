// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// End-to-end tests for the executor loop.
///
/// Uses ScriptedMockProvider so every scenario is deterministic and
/// requires no network access.
#[cfg(test)]
mod executor_tests {
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    use viggo_config::{AgentConfig, SandboxConfig};
    use viggo_model::{
        CompletionRequest, Message, MessageContent, ModelCatalogEntry, ModelProvider,
        ResponseEvent, ScriptedMockProvider,
    };
    use viggo_sandbox::Sandbox;
    use viggo_tools::{
        LaneQueue, ResultStore, Tool, ToolCall, ToolDispatcher, ToolEventStream, ToolOutput,
        ToolRegistry, ToolStreamEvent,
    };

    use crate::{
        AgentEvent, AgentExecutor, CancellationToken, ChatEntry, CostGuard, MessageQueue,
        QueueMode,
    };

    // ── Test tools ────────────────────────────────────────────────────────────

    /// Canned-response tool; optionally sized to exercise truncation.
    struct StubTool {
        name: &'static str,
        reply: String,
        read_only: bool,
    }

    #[async_trait]
    impl Tool for StubTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "stub tool for tests"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        fn category(&self) -> &str {
            "file_read"
        }
        fn read_only(&self) -> bool {
            self.read_only
        }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            ToolOutput::ok(&call.id, self.reply.clone())
        }
    }

    /// Streaming tool that ticks every 50 ms for ~5 s before finishing.
    struct SlowStreamTool;

    #[async_trait]
    impl Tool for SlowStreamTool {
        fn name(&self) -> &str {
            "bash"
        }
        fn description(&self) -> &str {
            "slow streaming tool"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        fn category(&self) -> &str {
            "shell"
        }
        fn streaming(&self) -> bool {
            true
        }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            ToolOutput::ok(&call.id, "finished")
        }
        async fn execute_streaming(&self, call: &ToolCall) -> ToolEventStream {
            let id = call.id.clone();
            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(async move {
                for i in 0..100 {
                    if tx
                        .send(ToolStreamEvent::Delta(format!("tick {i}\n")))
                        .await
                        .is_err()
                    {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                let _ = tx
                    .send(ToolStreamEvent::Done(ToolOutput::ok(&id, "finished")))
                    .await;
            });
            Box::pin(ReceiverStream::new(rx))
        }
    }

    /// Provider whose complete() always fails, for error-path tests.
    struct FailingProvider;

    #[async_trait]
    impl ModelProvider for FailingProvider {
        fn name(&self) -> &str {
            "mock"
        }
        fn model_name(&self) -> &str {
            "mock-model"
        }
        async fn complete(
            &self,
            _req: CompletionRequest,
        ) -> anyhow::Result<viggo_model::ResponseStream> {
            anyhow::bail!("connection refused")
        }
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(StubTool {
            name: "view_file",
            reply: "{\"name\": \"demo\", \"version\": \"1.0.0\"}".into(),
            read_only: true,
        });
        reg.register(StubTool {
            name: "big_dump",
            reply: "x".repeat(50_000),
            read_only: true,
        });
        reg.register(SlowStreamTool);
        reg
    }

    fn executor_with(
        model: Arc<dyn ModelProvider>,
        config: AgentConfig,
        workspace: &Path,
    ) -> AgentExecutor {
        let sandbox = Arc::new(Sandbox::new(
            SandboxConfig {
                backend: Some("none".into()),
                ..Default::default()
            },
            workspace.to_path_buf(),
        ));
        let dispatcher = Arc::new(ToolDispatcher::new(Arc::new(registry()), sandbox));
        let lanes = Arc::new(LaneQueue::new(4, Duration::from_secs(120)));
        let store = Arc::new(ResultStore::new(workspace.join("results")).unwrap());
        AgentExecutor::new(model, dispatcher, lanes, store, config)
    }

    fn default_executor(model: Arc<dyn ModelProvider>, workspace: &Path) -> AgentExecutor {
        executor_with(model, AgentConfig::default(), workspace)
    }

    async fn run_collect(
        exec: &mut AgentExecutor,
        input: &str,
        history: &mut Vec<ChatEntry>,
        messages: &mut Vec<Message>,
        cancel: CancellationToken,
    ) -> Vec<AgentEvent> {
        let (tx, mut rx) = mpsc::channel(256);
        exec.process_stream(input, history, messages, cancel, tx).await;
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    /// Every assistant tool call must be answered by exactly one tool
    /// result with the same id and name, appearing later in the list.
    fn assert_tool_pairing(messages: &[Message]) {
        for (i, m) in messages.iter().enumerate() {
            if let MessageContent::ToolCall {
                tool_call_id,
                function,
            } = &m.content
            {
                let answers: Vec<_> = messages[i..]
                    .iter()
                    .filter(|r| {
                        matches!(
                            &r.content,
                            MessageContent::ToolResult { tool_call_id: id, name, .. }
                                if id == tool_call_id && *name == function.name
                        )
                    })
                    .collect();
                assert_eq!(
                    answers.len(),
                    1,
                    "tool call {tool_call_id} must have exactly one result"
                );
            }
            if let MessageContent::ToolResult { tool_call_id, .. } = &m.content {
                assert!(
                    messages[..i].iter().any(|c| matches!(
                        &c.content,
                        MessageContent::ToolCall { tool_call_id: id, .. } if id == tool_call_id
                    )),
                    "tool result {tool_call_id} must answer a preceding call"
                );
            }
        }
    }

    fn priced_guard(limit: f64) -> Arc<CostGuard> {
        let entry = ModelCatalogEntry {
            id: "m".into(),
            provider: "p".into(),
            context_window: 128_000,
            max_output_tokens: 4096,
            input_price_per_mtok: 10_000.0,
            output_price_per_mtok: 10_000.0,
            description: String::new(),
        };
        Arc::new(CostGuard::new(Some(&entry), limit, false, 100.0))
    }

    // ── Scenario: pure chat turn ──────────────────────────────────────────────

    #[tokio::test]
    async fn pure_chat_turn_emits_token_count_content_done() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(ScriptedMockProvider::always_text("hello"));
        let mut exec = default_executor(model, dir.path());
        let (mut history, mut messages) = (Vec::new(), Vec::new());

        let events = run_collect(
            &mut exec,
            "hi",
            &mut history,
            &mut messages,
            CancellationToken::new(),
        )
        .await;

        assert!(
            matches!(&events[0], AgentEvent::TokenCount(n) if *n >= 1),
            "first event must be a token count"
        );
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::Content(t) if t == "hello")));
        assert!(matches!(events.last(), Some(AgentEvent::Done)));

        // Final history: User("hi"), Assistant("hello"); no tool entries.
        assert_eq!(history.len(), 2);
        assert!(matches!(&history[0], ChatEntry::User { text, .. } if text == "hi"));
        assert!(matches!(&history[1], ChatEntry::Assistant { text, .. } if text == "hello"));
        assert!(!events
            .iter()
            .any(|e| matches!(e, AgentEvent::ToolResult { .. })));
    }

    // ── Scenario: single tool turn ────────────────────────────────────────────

    #[tokio::test]
    async fn single_tool_turn_chunk_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(ScriptedMockProvider::tool_then_text(
            "c1",
            "view_file",
            r#"{"path":"package.json"}"#,
            "Here is package.json …",
        ));
        let mut exec = default_executor(model, dir.path());
        let (mut history, mut messages) = (Vec::new(), Vec::new());

        let events = run_collect(
            &mut exec,
            "show me package.json",
            &mut history,
            &mut messages,
            CancellationToken::new(),
        )
        .await;

        // TokenCount, ToolCalls([c1]), ToolResult(c1, success), TokenCount,
        // Content, Done.
        let kinds: Vec<&'static str> = events
            .iter()
            .map(|e| match e {
                AgentEvent::TokenCount(_) => "tokens",
                AgentEvent::ToolCalls(_) => "tool_calls",
                AgentEvent::ToolResult { .. } => "tool_result",
                AgentEvent::Content(_) => "content",
                AgentEvent::Done => "done",
                _ => "other",
            })
            .collect();
        assert_eq!(
            kinds,
            vec!["tokens", "tool_calls", "tool_result", "tokens", "content", "done"]
        );

        match &events[1] {
            AgentEvent::ToolCalls(calls) => {
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].id, "c1");
                assert_eq!(calls[0].name, "view_file");
            }
            other => panic!("expected ToolCalls, got {other:?}"),
        }
        match &events[2] {
            AgentEvent::ToolResult {
                call_id, is_error, ..
            } => {
                assert_eq!(call_id, "c1");
                assert!(!is_error);
            }
            other => panic!("expected ToolResult, got {other:?}"),
        }

        assert_tool_pairing(&messages);
    }

    // ── Scenario: tool-round bound ────────────────────────────────────────────

    #[tokio::test]
    async fn tool_round_bound_stops_after_max_rounds() {
        let dir = tempfile::tempdir().unwrap();
        let tool_round = |id: &str| {
            vec![
                ResponseEvent::ToolCall {
                    index: 0,
                    id: id.into(),
                    name: "view_file".into(),
                    arguments: "{}".into(),
                },
                ResponseEvent::Usage {
                    input_tokens: 5,
                    output_tokens: 5,
                },
                ResponseEvent::Done,
            ]
        };
        let model = Arc::new(ScriptedMockProvider::new(vec![
            tool_round("c1"),
            tool_round("c2"),
            tool_round("c3"), // never reached
        ]));
        let config = AgentConfig {
            max_tool_rounds: 2,
            ..Default::default()
        };
        let calls = model.calls.clone();
        let mut exec = executor_with(model, config, dir.path());
        let (mut history, mut messages) = (Vec::new(), Vec::new());

        let events = run_collect(
            &mut exec,
            "loop forever",
            &mut history,
            &mut messages,
            CancellationToken::new(),
        )
        .await;

        let tool_results = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::ToolResult { .. }))
            .count();
        assert_eq!(tool_results, 2, "exactly two tool executions");
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::Content(t) if t == "Maximum tool execution rounds reached.")));
        assert!(matches!(events.last(), Some(AgentEvent::Done)));
        // Round bound also bounds provider calls: ≤ maxToolRounds + 1.
        assert!(*calls.lock().unwrap() <= 3);
        assert_tool_pairing(&messages);
    }

    // ── Scenario: cancel ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn cancel_before_start_yields_exactly_cancelled_and_done() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(ScriptedMockProvider::always_text("never"));
        let calls = model.calls.clone();
        let mut exec = default_executor(model, dir.path());
        let (mut history, mut messages) = (Vec::new(), Vec::new());

        let cancel = CancellationToken::new();
        cancel.trip();
        let events = run_collect(&mut exec, "hi", &mut history, &mut messages, cancel).await;

        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], AgentEvent::Content(t) if t == "[cancelled]"));
        assert!(matches!(&events[1], AgentEvent::Done));
        assert_eq!(*calls.lock().unwrap(), 0, "no provider call may be issued");
        assert!(messages.is_empty(), "history must stay untouched");
    }

    #[tokio::test]
    async fn cancel_mid_tool_stream_aborts_without_tool_message() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(ScriptedMockProvider::new(vec![vec![
            ResponseEvent::ToolCall {
                index: 0,
                id: "c1".into(),
                name: "bash".into(),
                arguments: r#"{"command":"spin"}"#.into(),
            },
            ResponseEvent::Done,
        ]]));
        let calls = model.calls.clone();
        let mut exec = default_executor(model, dir.path());
        let (mut history, mut messages) = (Vec::new(), Vec::new());

        let cancel = CancellationToken::new();
        let trip = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trip.trip();
        });

        let events = run_collect(&mut exec, "run it", &mut history, &mut messages, cancel).await;

        let deltas = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::ToolStream { .. }))
            .count();
        assert!(deltas >= 1, "some tool-stream deltas must arrive before cancel");
        let tail: Vec<&AgentEvent> = events.iter().rev().take(2).collect();
        assert!(matches!(tail[0], AgentEvent::Done));
        assert!(matches!(tail[1], AgentEvent::Content(t) if t == "[cancelled]"));

        // No Tool message for the cancelled call; no further provider call.
        assert!(!messages.iter().any(|m| matches!(
            &m.content,
            MessageContent::ToolResult { tool_call_id, .. } if tool_call_id == "c1"
        )));
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    // ── Scenario: cost ceiling ────────────────────────────────────────────────

    #[tokio::test]
    async fn cost_ceiling_stops_before_tool_execution() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(ScriptedMockProvider::tool_then_text(
            "c1",
            "view_file",
            "{}",
            "never reached",
        ));
        let calls = model.calls.clone();
        // $10k/Mtok pricing: the scripted usage (5 in + 5 out) costs $0.10,
        // far over the 1-cent limit.
        let mut exec = default_executor(model, dir.path()).with_cost_guard(priced_guard(0.01));
        let (mut history, mut messages) = (Vec::new(), Vec::new());

        let events = run_collect(
            &mut exec,
            "do something pricey",
            &mut history,
            &mut messages,
            CancellationToken::new(),
        )
        .await;

        assert!(events.iter().any(
            |e| matches!(e, AgentEvent::Content(t) if t.contains("cost limit") && t.contains("$0.01"))
        ));
        assert!(matches!(events.last(), Some(AgentEvent::Done)));
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, AgentEvent::ToolResult { .. }))
                .count(),
            0,
            "no tool may execute after the ceiling fires"
        );
        assert_eq!(*calls.lock().unwrap(), 1, "no further provider calls");
        // The pending call is answered by a stub so pairing still holds.
        assert_tool_pairing(&messages);
        // The terminal message is assistant-authored.
        assert!(matches!(
            messages.last().map(|m| m.role),
            Some(viggo_model::Role::Assistant)
        ));
    }

    #[tokio::test]
    async fn exceeded_cost_blocks_next_turn_entirely() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(ScriptedMockProvider::always_text("cheap reply"));
        let calls = model.calls.clone();
        let guard = priced_guard(0.01);
        guard.record(5, 5); // $0.10 spent before the turn
        let mut exec = default_executor(model, dir.path()).with_cost_guard(guard);
        let (mut history, mut messages) = (Vec::new(), Vec::new());

        let events = run_collect(
            &mut exec,
            "hello again",
            &mut history,
            &mut messages,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(*calls.lock().unwrap(), 0, "no provider call once exceeded");
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::Content(t) if t.contains("cost limit"))));
    }

    // ── Steering ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn steer_message_preempts_tool_batch() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(ScriptedMockProvider::new(vec![
            vec![
                ResponseEvent::ToolCall {
                    index: 0,
                    id: "c1".into(),
                    name: "view_file".into(),
                    arguments: "{}".into(),
                },
                ResponseEvent::ToolCall {
                    index: 1,
                    id: "c2".into(),
                    name: "view_file".into(),
                    arguments: "{}".into(),
                },
                ResponseEvent::Done,
            ],
            vec![
                ResponseEvent::TextDelta("acknowledged".into()),
                ResponseEvent::Done,
            ],
        ]));
        let mut exec = default_executor(model, dir.path());
        let queue: Arc<MessageQueue> = exec.message_queue();
        queue.push("actually, stop and look at the README", QueueMode::Steer);
        let (mut history, mut messages) = (Vec::new(), Vec::new());

        let events = run_collect(
            &mut exec,
            "go",
            &mut history,
            &mut messages,
            CancellationToken::new(),
        )
        .await;

        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::Steer(t) if t.contains("README"))));
        // The steer text became the next user turn.
        assert!(messages.iter().any(|m| {
            m.role == viggo_model::Role::User
                && m.as_text().map(|t| t.contains("README")).unwrap_or(false)
        }));
        // Skipped calls are answered with stubs; pairing survives.
        assert_tool_pairing(&messages);
        // The second round still produced the final answer.
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::Content(t) if t == "acknowledged")));
    }

    #[tokio::test]
    async fn followup_messages_are_appended_before_done() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(ScriptedMockProvider::always_text("first answer"));
        let mut exec = default_executor(model, dir.path());
        let queue = exec.message_queue();
        queue.push("and then do this", QueueMode::Followup);
        queue.push("note A", QueueMode::Collect);
        queue.push("note B", QueueMode::Collect);
        let (mut history, mut messages) = (Vec::new(), Vec::new());

        let events = run_collect(
            &mut exec,
            "hi",
            &mut history,
            &mut messages,
            CancellationToken::new(),
        )
        .await;

        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::Steer(t) if t == "and then do this")));
        let texts: Vec<&str> = messages.iter().filter_map(|m| m.as_text()).collect();
        assert!(texts.contains(&"and then do this"));
        assert!(texts.contains(&"note A\nnote B"), "collect mode concatenates");
        assert!(queue.is_empty());
    }

    // ── Commentary tool calls ─────────────────────────────────────────────────

    #[tokio::test]
    async fn commentary_text_synthesizes_and_executes_tool_call() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(ScriptedMockProvider::new(vec![
            vec![
                ResponseEvent::TextDelta(
                    "<|channel|>commentary to=view_file <|message|>{\"path\":\"a\"}".into(),
                ),
                ResponseEvent::Done,
            ],
            vec![
                ResponseEvent::TextDelta("done".into()),
                ResponseEvent::Done,
            ],
        ]));
        let mut exec = default_executor(model, dir.path());
        let (mut history, mut messages) = (Vec::new(), Vec::new());

        let events = run_collect(
            &mut exec,
            "look at a",
            &mut history,
            &mut messages,
            CancellationToken::new(),
        )
        .await;

        assert!(
            events
                .iter()
                .any(|e| matches!(e, AgentEvent::ToolResult { tool_name, .. } if tool_name == "view_file")),
            "commentary call must be dispatched like a native one"
        );
        // The originating text is stripped from the conversation.
        assert!(!messages
            .iter()
            .filter_map(|m| m.as_text())
            .any(|t| t.contains("commentary")));
        assert_tool_pairing(&messages);
    }

    // ── Error paths ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn provider_failure_becomes_terminal_assistant_message() {
        let dir = tempfile::tempdir().unwrap();
        let mut exec = default_executor(Arc::new(FailingProvider), dir.path());
        let (mut history, mut messages) = (Vec::new(), Vec::new());

        let events = run_collect(
            &mut exec,
            "hi",
            &mut history,
            &mut messages,
            CancellationToken::new(),
        )
        .await;

        assert!(events.iter().any(
            |e| matches!(e, AgentEvent::Content(t) if t.starts_with("Sorry, I encountered an error:"))
        ));
        assert!(matches!(events.last(), Some(AgentEvent::Done)));
        let last = messages.last().unwrap();
        assert_eq!(last.role, viggo_model::Role::Assistant);
        assert!(last.as_text().unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn empty_input_is_rejected_without_starting_the_turn() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(ScriptedMockProvider::always_text("x"));
        let calls = model.calls.clone();
        let mut exec = default_executor(model, dir.path());
        let (mut history, mut messages) = (Vec::new(), Vec::new());

        let events = run_collect(
            &mut exec,
            "   ",
            &mut history,
            &mut messages,
            CancellationToken::new(),
        )
        .await;

        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::Content(t) if t.contains("non-empty"))));
        assert!(history.is_empty());
        assert!(messages.is_empty());
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    // ── Truncation and the durable store ──────────────────────────────────────

    #[tokio::test]
    async fn oversized_tool_output_is_truncated_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(ScriptedMockProvider::tool_then_text(
            "c1",
            "big_dump",
            "{}",
            "summarised",
        ));
        let mut exec = default_executor(model, dir.path());
        let (mut history, mut messages) = (Vec::new(), Vec::new());

        let events = run_collect(
            &mut exec,
            "dump it",
            &mut history,
            &mut messages,
            CancellationToken::new(),
        )
        .await;

        let result_output = events
            .iter()
            .find_map(|e| match e {
                AgentEvent::ToolResult { output, .. } => Some(output.clone()),
                _ => None,
            })
            .unwrap();
        assert!(result_output.len() < 50_000, "result must be truncated");
        assert!(result_output.contains("bytes omitted"));

        // The untruncated payload is recoverable from the store.
        let store = ResultStore::new(dir.path().join("results")).unwrap();
        assert_eq!(store.read("c1").unwrap().len(), 50_000);
    }

    // ── History bound ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn history_is_bounded_after_the_turn() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(ScriptedMockProvider::always_text("ok"));
        let config = AgentConfig {
            max_history: 3,
            ..Default::default()
        };
        let mut exec = executor_with(model, config, dir.path());
        let mut history = Vec::new();
        // Pre-existing long history.
        let mut messages: Vec<Message> = vec![Message::system("sys")];
        for i in 0..20 {
            messages.push(Message::user(format!("old {i}")));
        }

        let _ = run_collect(
            &mut exec,
            "latest",
            &mut history,
            &mut messages,
            CancellationToken::new(),
        )
        .await;

        let non_system = messages
            .iter()
            .filter(|m| m.role != viggo_model::Role::System)
            .count();
        assert!(non_system <= 3, "history must be bounded, got {non_system}");
    }

    // ── Output-token accounting ───────────────────────────────────────────────

    #[tokio::test]
    async fn output_tokens_accumulate_across_rounds() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(ScriptedMockProvider::tool_then_text(
            "c1",
            "view_file",
            "{}",
            "done",
        ));
        let mut exec = default_executor(model, dir.path());
        let (mut history, mut messages) = (Vec::new(), Vec::new());

        let _ = run_collect(
            &mut exec,
            "go",
            &mut history,
            &mut messages,
            CancellationToken::new(),
        )
        .await;

        // Both scripted rounds report 5 output tokens; the counter adds,
        // it does not overwrite.
        assert_eq!(exec.total_output_tokens(), 10);
    }
}
