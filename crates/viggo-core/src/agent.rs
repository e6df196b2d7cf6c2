// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use viggo_config::AgentConfig;
use viggo_model::{
    catalog, CompletionRequest, Message, ModelProvider, ToolChoice, ToolSchema, Usage,
};
use viggo_tools::{EnqueueOptions, LaneError, LaneQueue, ResultStore, Selection, ToolDispatcher,
    ToolOutput, ToolSelector, ToolStreamEvent};

use crate::{
    accum::{parse_commentary_tool_calls, StreamAccumulator, ToolCallRequest},
    cancel::CancellationToken,
    compact::head_tail_truncate,
    context::{ContextManager, Summarizer},
    cost::CostGuard,
    events::{AgentEvent, ChatEntry},
    middleware::{MiddlewarePipeline, MiddlewareResult, TurnContext},
    queue::{MessageQueue, QueueMode},
    session::{enforce_history_bound, Session},
    variator::ObservationVariator,
};

const CANCELLED_NOTICE: &str = "[cancelled]";
const ROUND_BOUND_NOTICE: &str = "Maximum tool execution rounds reached.";

/// The agent execution kernel.
///
/// Drives one conversation: selects the per-turn tool set, calls the
/// provider, folds the streamed response, dispatches tool calls under
/// per-session serialization, enforces the context and cost budgets, and
/// appends everything to the caller-owned `history`/`messages`.  The two
/// arrays are owned by exactly one executor task during a turn; external
/// code must not mutate them until the turn finishes.
pub struct AgentExecutor {
    model: Arc<dyn ModelProvider>,
    dispatcher: Arc<ToolDispatcher>,
    lanes: Arc<LaneQueue>,
    store: Arc<ResultStore>,
    queue: Arc<MessageQueue>,
    selector: ToolSelector,
    context: ContextManager,
    pipeline: MiddlewarePipeline,
    cost: Arc<CostGuard>,
    config: AgentConfig,
    session: Session,
    variator: ObservationVariator,
    /// Tool subset chosen on round 0 and reused for the rest of the turn.
    cached_selection: Option<Selection>,
    /// Output tokens accumulated across all rounds of all turns.
    total_output_tokens: u64,
}

impl AgentExecutor {
    pub fn new(
        model: Arc<dyn ModelProvider>,
        dispatcher: Arc<ToolDispatcher>,
        lanes: Arc<LaneQueue>,
        store: Arc<ResultStore>,
        config: AgentConfig,
    ) -> Self {
        let entry = catalog::lookup(model.name(), model.model_name());
        let window = config
            .context_window_override
            .or_else(|| entry.as_ref().map(|e| e.context_window as usize))
            .unwrap_or(128_000);
        let cost = Arc::new(CostGuard::new(
            entry.as_ref(),
            config.session_cost_limit,
            config.autonomy,
            config.autonomy_ceiling,
        ));
        let context = ContextManager::new(
            model.model_name(),
            window,
            config.response_reserve_tokens,
            config.recent_keep_count,
            config.compaction_ratio,
        );
        let selector = ToolSelector::new(config.selector_max_tools);
        Self {
            model,
            dispatcher,
            lanes,
            store,
            queue: Arc::new(MessageQueue::new()),
            selector,
            context,
            pipeline: MiddlewarePipeline::standard(),
            cost,
            config,
            session: Session::new(),
            variator: ObservationVariator::new(),
            cached_selection: None,
            total_output_tokens: 0,
        }
    }

    /// Replace the middleware pipeline.  `MiddlewarePipeline::empty()`
    /// switches the executor to inline cost checking.
    pub fn with_pipeline(mut self, pipeline: MiddlewarePipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Replace the cost guard.  Used when pricing comes from somewhere
    /// other than the bundled catalog (custom endpoints, tests).
    pub fn with_cost_guard(mut self, cost: Arc<CostGuard>) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_summarizer(mut self, s: Arc<dyn Summarizer>) -> Self {
        self.context.install_summarizer(s);
        self
    }

    pub fn with_context_block(mut self, block: impl Into<String>) -> Self {
        self.context.add_context_block(block);
        self
    }

    /// The queue for out-of-band user messages (steer / follow-up).
    pub fn message_queue(&self) -> Arc<MessageQueue> {
        self.queue.clone()
    }

    pub fn cost(&self) -> &Arc<CostGuard> {
        &self.cost
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn total_output_tokens(&self) -> u64 {
        self.total_output_tokens
    }

    /// Sequential form of [`process_stream`](Self::process_stream): runs
    /// the turn to completion and returns the chat entries it appended.
    pub async fn process(
        &mut self,
        input: &str,
        history: &mut Vec<ChatEntry>,
        messages: &mut Vec<Message>,
        cancel: CancellationToken,
    ) -> Vec<ChatEntry> {
        let baseline = history.len();
        let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);
        let drain = async {
            // Events are consumed and discarded; the caller reads the
            // appended entries instead.
            while rx.recv().await.is_some() {}
        };
        let run = self.process_stream(input, history, messages, cancel, tx);
        tokio::join!(run, drain);
        history[baseline..].to_vec()
    }

    /// Streaming form: drives one turn, emitting [`AgentEvent`]s through
    /// `tx`.  Mutates `history` and `messages` in place by append.  Never
    /// lets an error escape: any failure becomes a terminal assistant
    /// error message followed by `Done`.
    pub async fn process_stream(
        &mut self,
        input: &str,
        history: &mut Vec<ChatEntry>,
        messages: &mut Vec<Message>,
        cancel: CancellationToken,
        tx: mpsc::Sender<AgentEvent>,
    ) {
        if let Err(e) = self.run_turn(input, history, messages, &cancel, &tx).await {
            let msg = format!("Sorry, I encountered an error: {e}");
            warn!(error = %e, "turn failed");
            messages.push(Message::assistant(&msg));
            history.push(ChatEntry::assistant(&msg));
            let _ = tx.send(AgentEvent::Content(msg)).await;
        }
        let _ = tx.send(AgentEvent::Done).await;
    }

    async fn run_turn(
        &mut self,
        input: &str,
        history: &mut Vec<ChatEntry>,
        messages: &mut Vec<Message>,
        cancel: &CancellationToken,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> anyhow::Result<()> {
        // Invalid input is rejected synchronously; the turn never starts.
        if input.trim().is_empty() {
            let _ = tx
                .send(AgentEvent::Content(
                    "Please provide a non-empty input.".to_string(),
                ))
                .await;
            return Ok(());
        }
        if cancel.is_tripped() {
            return self.emit_cancelled(tx).await;
        }

        messages.push(Message::user(input));
        history.push(ChatEntry::user(input));
        let _ = tx
            .send(AgentEvent::TokenCount(
                self.context.counter().count_messages(messages),
            ))
            .await;

        self.cached_selection = None;
        let mut eager_compact = false;
        let mut last_usage = Usage::default();
        let mut completed = false;

        'rounds: for round in 0..self.config.max_tool_rounds {
            if cancel.is_tripped() {
                return self.emit_cancelled(tx).await;
            }

            // Before-turn middleware phase.
            if !self.pipeline.is_empty() {
                let ctx = self.turn_context(round, last_usage, messages);
                match self.pipeline.before(&ctx).await {
                    MiddlewareResult::Continue => {}
                    MiddlewareResult::Warn(msg) => {
                        let _ = tx.send(AgentEvent::Content(msg)).await;
                    }
                    MiddlewareResult::Compact => eager_compact = true,
                    MiddlewareResult::Stop(msg) => {
                        let text =
                            msg.unwrap_or_else(|| "Turn stopped by middleware.".to_string());
                        let _ = tx.send(AgentEvent::Content(text)).await;
                        return Ok(());
                    }
                }
            }

            // The ceiling gates every provider call, not just tool rounds.
            if self.cost.exceeded() {
                self.append_cost_stop(history, messages, tx).await;
                return Ok(());
            }

            // Tool selection runs once per turn; later rounds reuse it.
            if self.cached_selection.is_none() {
                let selection = self.selector.select(input, self.dispatcher.registry());
                debug!(
                    tools = selection.tools.len(),
                    confidence = selection.confidence,
                    "tool selection"
                );
                if selection.confidence < self.config.selector_confidence_floor {
                    let names: Vec<&str> =
                        selection.tools.iter().map(|d| d.name.as_str()).collect();
                    messages.push(Message::system(format!(
                        "Available tools this turn: {}. Prefer these registered tools \
                         over ad-hoc approaches.",
                        names.join(", ")
                    )));
                }
                self.cached_selection = Some(selection);
            }
            let tools: Vec<ToolSchema> = self
                .cached_selection
                .as_ref()
                .map(|s| {
                    s.tools
                        .iter()
                        .map(|d| ToolSchema {
                            name: d.name.clone(),
                            description: d.description.clone(),
                            parameters: d.parameters.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default();

            // Fit the window, then swap bulky old tool results for stubs.
            let (mut prepared, warning) = self.context.prepare(messages, eager_compact).await;
            eager_compact = false;
            if let Some(w) = warning {
                let _ = tx.send(AgentEvent::Content(w.message)).await;
            }
            #[cfg(feature = "durable-results")]
            {
                let stubbed = crate::compact::compact_large_tool_results(
                    &mut prepared,
                    self.config.tool_result_compact_threshold,
                    &self.store,
                );
                if stubbed > 0 {
                    debug!(stubbed, "compacted old tool results to restore stubs");
                }
            }

            // Provider call.
            let req = CompletionRequest {
                messages: prepared,
                tools,
                tool_choice: ToolChoice::Auto,
                stream: true,
            };
            let mut stream = self.model.complete(req).await?;
            let mut acc = StreamAccumulator::new();
            while let Some(event) = stream.next().await {
                if cancel.is_tripped() {
                    drop(stream);
                    return self.emit_cancelled(tx).await;
                }
                let delta = acc.fold(event?);
                if let Some(d) = delta.display {
                    let _ = tx.send(AgentEvent::Content(d)).await;
                }
                if let Some(r) = delta.reasoning {
                    let _ = tx.send(AgentEvent::Reasoning(r)).await;
                }
                if let Some(t) = delta.token_count {
                    let _ = tx.send(AgentEvent::TokenCount(t)).await;
                }
            }
            let turn = acc.finalize();
            last_usage = turn.usage;
            // Recorded here so the pre-tool ceiling check below already
            // sees this round's cost.
            self.cost
                .record(turn.usage.input_tokens, turn.usage.output_tokens);
            self.total_output_tokens += turn.usage.output_tokens as u64;

            // Models without native tool support emit commentary-pattern
            // calls in the text stream; synthesize calls from them.
            let mut text = turn.text;
            let mut tool_calls = turn.tool_calls;
            if tool_calls.is_empty() {
                let (synth, stripped) = parse_commentary_tool_calls(&turn.raw_text);
                if !synth.is_empty() {
                    debug!(count = synth.len(), "synthesized commentary tool calls");
                    tool_calls = synth;
                    text = stripped;
                }
            }

            if !text.is_empty() {
                messages.push(Message::assistant(&text));
                history.push(ChatEntry::assistant(&text));
            }
            for tc in &tool_calls {
                messages.push(Message::tool_call(&tc.id, &tc.name, &tc.arguments));
                history.push(ChatEntry::tool_call(&tc.id, &tc.name, &tc.arguments));
            }

            if tool_calls.is_empty() {
                completed = true;
                break;
            }
            let _ = tx.send(AgentEvent::ToolCalls(tool_calls.clone())).await;

            // Pre-tool ceiling check: the provider call that requested
            // these tools may itself have crossed the ceiling.
            if self.cost.exceeded() {
                self.skip_pending_calls(
                    &tool_calls,
                    "not executed: session cost limit exceeded",
                    history,
                    messages,
                );
                self.append_cost_stop(history, messages, tx).await;
                return Ok(());
            }

            for (idx, tc) in tool_calls.iter().enumerate() {
                if cancel.is_tripped() {
                    return self.emit_cancelled(tx).await;
                }

                // A pending steer message preempts the rest of the batch
                // and becomes the next user turn.
                if let Some(steer) = self.queue.pop_steer() {
                    self.skip_pending_calls(
                        &tool_calls[idx..],
                        "not executed: interrupted by user",
                        history,
                        messages,
                    );
                    messages.push(Message::user(&steer));
                    history.push(ChatEntry::user(&steer));
                    let _ = tx.send(AgentEvent::Steer(steer)).await;
                    continue 'rounds;
                }

                let output = if self.dispatcher.registry().is_streaming(&tc.name) {
                    match self.run_streaming_tool(tc, cancel, tx).await {
                        Some(out) => out,
                        None => return self.emit_cancelled(tx).await,
                    }
                } else {
                    self.run_queued_tool(tc).await
                };

                // Persist the untruncated payload before anything trims it.
                #[cfg(feature = "durable-results")]
                if let Err(e) = self.store.write(&tc.id, &output.content) {
                    warn!(tool_call_id = %tc.id, error = %e, "cannot persist tool result");
                }
                let truncated =
                    head_tail_truncate(&output.content, self.config.tool_result_char_cap);
                #[cfg(feature = "durable-results")]
                let framed = self.variator.apply(&tc.name, &truncated);
                #[cfg(not(feature = "durable-results"))]
                let framed = truncated.clone();

                messages.push(Message::tool_result(&tc.id, &tc.name, &framed));
                history.push(ChatEntry::tool_result(
                    &tc.id,
                    &tc.name,
                    &truncated,
                    output.is_error,
                ));
                let _ = tx
                    .send(AgentEvent::ToolResult {
                        call_id: tc.id.clone(),
                        tool_name: tc.name.clone(),
                        output: truncated,
                        is_error: output.is_error,
                    })
                    .await;
                let _ = tx
                    .send(AgentEvent::TokenCount(
                        self.context.counter().count_messages(messages),
                    ))
                    .await;
            }

            enforce_history_bound(messages, self.config.max_history);

            // After-turn middleware phase; without a pipeline, the inline
            // ceiling check stands in for the cost middleware.
            if self.pipeline.is_empty() {
                if self.cost.exceeded() {
                    self.append_cost_stop(history, messages, tx).await;
                    return Ok(());
                }
            } else {
                let ctx = self.turn_context(round, last_usage, messages);
                match self.pipeline.after(&ctx).await {
                    MiddlewareResult::Continue => {}
                    MiddlewareResult::Warn(msg) => {
                        let _ = tx.send(AgentEvent::Content(msg)).await;
                    }
                    MiddlewareResult::Compact => eager_compact = true,
                    MiddlewareResult::Stop(msg) => {
                        let text =
                            msg.unwrap_or_else(|| "Turn stopped by middleware.".to_string());
                        messages.push(Message::assistant(&text));
                        history.push(ChatEntry::assistant(&text));
                        let _ = tx.send(AgentEvent::Content(text)).await;
                        return Ok(());
                    }
                }
            }
        }

        if !completed {
            let _ = tx
                .send(AgentEvent::Content(ROUND_BOUND_NOTICE.to_string()))
                .await;
        }

        // Queued follow-ups become user turns before the stream closes.
        let mut collected: Vec<String> = Vec::new();
        for qm in self.queue.drain() {
            match qm.mode {
                QueueMode::Steer | QueueMode::Followup => {
                    messages.push(Message::user(&qm.text));
                    history.push(ChatEntry::user(&qm.text));
                    let _ = tx.send(AgentEvent::Steer(qm.text)).await;
                }
                QueueMode::Collect => collected.push(qm.text),
            }
        }
        if !collected.is_empty() {
            let text = collected.join("\n");
            messages.push(Message::user(&text));
            history.push(ChatEntry::user(&text));
        }

        enforce_history_bound(messages, self.config.max_history);
        Ok(())
    }

    /// Run a streaming-capable tool, forwarding deltas.  Returns `None`
    /// when cancellation tripped mid-stream (the stream is dropped, which
    /// runs the tool's cleanup and kills its subprocess).
    async fn run_streaming_tool(
        &self,
        tc: &ToolCallRequest,
        cancel: &CancellationToken,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> Option<ToolOutput> {
        let mut stream = self
            .dispatcher
            .execute_streaming(&tc.id, &tc.name, &tc.arguments)
            .await;
        let mut final_output: Option<ToolOutput> = None;
        while let Some(ev) = stream.next().await {
            if cancel.is_tripped() {
                drop(stream);
                return None;
            }
            match ev {
                ToolStreamEvent::Delta(delta) => {
                    let _ = tx
                        .send(AgentEvent::ToolStream {
                            call_id: tc.id.clone(),
                            delta,
                        })
                        .await;
                }
                ToolStreamEvent::Done(out) => final_output = Some(out),
            }
        }
        Some(final_output.unwrap_or_else(|| {
            ToolOutput::err(&tc.id, "tool stream ended without a result")
        }))
    }

    /// Run a non-streaming tool through the lane queue.
    async fn run_queued_tool(&self, tc: &ToolCallRequest) -> ToolOutput {
        let registry = self.dispatcher.registry();
        let opts = EnqueueOptions {
            parallel: registry.is_read_only(&tc.name),
            category: registry
                .get(&tc.name)
                .map(|t| t.category().to_string())
                .unwrap_or_default(),
            timeout: None,
        };
        let dispatcher = self.dispatcher.clone();
        let (id, name, args) = (tc.id.clone(), tc.name.clone(), tc.arguments.clone());
        match self
            .lanes
            .enqueue(&self.session.id, opts, async move {
                dispatcher.execute(&id, &name, &args).await
            })
            .await
        {
            Ok(out) => out,
            Err(e @ LaneError::Timeout(_)) => ToolOutput::err(&tc.id, e.to_string()),
            Err(e) => ToolOutput::err(&tc.id, e.to_string()),
        }
    }

    /// Answer every pending call with a stub result so the tool-call
    /// pairing invariant survives an early exit.
    fn skip_pending_calls(
        &self,
        calls: &[ToolCallRequest],
        reason: &str,
        history: &mut Vec<ChatEntry>,
        messages: &mut Vec<Message>,
    ) {
        for tc in calls {
            let stub = format!("[{reason}]");
            messages.push(Message::tool_result(&tc.id, &tc.name, &stub));
            history.push(ChatEntry::tool_result(&tc.id, &tc.name, &stub, true));
        }
    }

    async fn append_cost_stop(
        &self,
        history: &mut Vec<ChatEntry>,
        messages: &mut Vec<Message>,
        tx: &mpsc::Sender<AgentEvent>,
    ) {
        let msg = format!(
            "Stopping here: the session cost limit of ${:.2} has been reached \
             (spent ${:.4}). Raise the limit or start a new session to continue.",
            self.cost.limit(),
            self.cost.session_cost()
        );
        messages.push(Message::assistant(&msg));
        history.push(ChatEntry::assistant(&msg));
        let _ = tx.send(AgentEvent::Content(msg)).await;
    }

    async fn emit_cancelled(&self, tx: &mpsc::Sender<AgentEvent>) -> anyhow::Result<()> {
        let _ = tx
            .send(AgentEvent::Content(CANCELLED_NOTICE.to_string()))
            .await;
        Ok(())
    }

    fn turn_context(&self, round: u32, last_usage: Usage, messages: &[Message]) -> TurnContext {
        TurnContext {
            tool_round: round,
            max_tool_rounds: self.config.max_tool_rounds,
            last_usage,
            context_fraction: self.context.usage_fraction(messages),
            cost: self.cost.clone(),
        }
    }
}
