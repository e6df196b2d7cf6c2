// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Shared base implementation for OpenAI-compatible chat completion APIs.
//!
//! xAI, OpenAI, Ollama, and LM Studio all speak the same
//! `/chat/completions` + SSE wire format; this module provides a single
//! `OpenAICompatProvider` that every such driver configures with its own
//! defaults (URL, auth, local-inference quirks).

use anyhow::Context;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    provider::ResponseStream,
    retry::{classify_status, with_backoff, Transience},
    CompletionRequest, MessageContent, ResponseEvent, Role,
};

pub struct OpenAICompatProvider {
    /// Provider id returned by `ModelProvider::name()`.
    driver_name: &'static str,
    /// Model id forwarded to the API.
    model: String,
    /// API key (pre-resolved from config or env).  `None` for local servers.
    api_key: Option<String>,
    /// Full chat completions URL.
    chat_url: String,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
    /// Local-inference backend (Ollama, LM Studio, llama.cpp…).  These
    /// frequently reject function calling: tools are elided and tool-role
    /// messages rewritten to user messages.
    local_inference: bool,
    /// Extra key-value pairs merged verbatim into the request body.
    extra_body: serde_json::Value,
}

impl OpenAICompatProvider {
    pub fn new(
        driver_name: &'static str,
        model: String,
        api_key: Option<String>,
        base_url: &str,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
        extra_body: serde_json::Value,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        let local_inference =
            matches!(driver_name, "ollama" | "lmstudio") || is_loopback_url(base);
        Self {
            driver_name,
            model,
            api_key,
            chat_url: format!("{base}/chat/completions"),
            max_tokens: max_tokens.unwrap_or(4096),
            temperature: temperature.unwrap_or(0.2),
            client: reqwest::Client::new(),
            local_inference,
            extra_body,
        }
    }

    fn build_body(&self, req: &CompletionRequest) -> Value {
        let messages = if self.local_inference {
            build_openai_messages(&rewrite_tool_roles(&req.messages))
        } else {
            build_openai_messages(&req.messages)
        };

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": req.stream,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        });
        if req.stream {
            body["stream_options"] = json!({ "include_usage": true });
        }

        // Backends that reject function calling get no tools at all; the
        // kernel falls back to commentary-pattern tool parsing for them.
        if !req.tools.is_empty() && !self.local_inference {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tools);
            body["tool_choice"] = json!(req.tool_choice.as_wire());
        }

        // Grok models can ground answers with live search; enable it only
        // when the input actually looks time-sensitive so ordinary coding
        // turns are not slowed down.
        if self.driver_name == "xai" {
            let last_user = req
                .messages
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .and_then(|m| m.as_text())
                .unwrap_or("");
            if wants_live_search(last_user) {
                body["search_parameters"] = json!({ "mode": "auto" });
            }
        }

        if let Some(map) = self.extra_body.as_object() {
            for (k, v) in map {
                body[k] = v.clone();
            }
        }
        body
    }
}

#[async_trait::async_trait]
impl crate::ModelProvider for OpenAICompatProvider {
    fn name(&self) -> &str {
        self.driver_name
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let body = self.build_body(&req);

        debug!(
            driver = %self.driver_name,
            model = %self.model,
            message_count = req.messages.len(),
            tool_count = req.tools.len(),
            "sending completion request"
        );

        let resp = with_backoff(self.driver_name, || {
            let mut http_req = self.client.post(&self.chat_url).json(&body);
            if let Some(key) = &self.api_key {
                http_req = http_req.bearer_auth(key);
            }
            async move {
                let resp = http_req
                    .send()
                    .await
                    .map_err(|e| (Transience::Retryable, anyhow::Error::new(e)))?;
                let status = resp.status();
                if status.is_success() {
                    return Ok(resp);
                }
                let text = resp.text().await.unwrap_or_default();
                Err((
                    classify_status(status.as_u16()),
                    anyhow::anyhow!("error {status}: {text}"),
                ))
            }
        })
        .await
        .with_context(|| format!("{} request failed", self.driver_name))?;

        let byte_stream = resp.bytes_stream();
        // SSE events can be split across TCP packets.  Maintain a line
        // buffer across chunks; emit events only for complete lines.
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let events: Vec<anyhow::Result<ResponseEvent>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_complete_sse_lines(buf)
                    }
                    Err(e) => vec![Err(anyhow::anyhow!(e))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

/// True when the input heuristically needs current information: live-search
/// keywords or an explicit 4-digit year.
pub(crate) fn wants_live_search(input: &str) -> bool {
    let lower = input.to_lowercase();
    const KEYWORDS: &[&str] = &[
        "today",
        "latest",
        "current",
        "recent",
        "this week",
        "this month",
        "this year",
        "news",
        "right now",
    ];
    if KEYWORDS.iter().any(|k| lower.contains(k)) {
        return true;
    }
    // A standalone 19xx/20xx year.
    lower
        .split(|c: char| !c.is_ascii_digit())
        .any(|tok| tok.len() == 4 && (tok.starts_with("19") || tok.starts_with("20")))
}

fn is_loopback_url(url: &str) -> bool {
    url.contains("localhost") || url.contains("127.0.0.1") || url.contains("0.0.0.0")
}

/// Rewrite tool-role messages into user messages for backends that do not
/// accept the tool role at all.  The result text keeps the tool name so the
/// model can still associate it with its request.
pub(crate) fn rewrite_tool_roles(messages: &[crate::Message]) -> Vec<crate::Message> {
    messages
        .iter()
        .map(|m| match &m.content {
            MessageContent::ToolResult { name, content, .. } => {
                crate::Message::user(format!("[Tool Result] {name}: {content}"))
            }
            MessageContent::ToolCall { function, .. } => crate::Message::assistant(format!(
                "[Tool Call] {}({})",
                function.name, function.arguments
            )),
            _ => m.clone(),
        })
        .collect()
}

/// Convert a slice of [`crate::Message`]s into the OpenAI wire-format array.
///
/// **Parallel tool call coalescing**: OpenAI requires that all tool calls
/// from one assistant turn appear inside a *single* assistant message as a
/// `tool_calls` array.  Internally each call is a separate `ToolCall`
/// message, so consecutive ones are merged here.
pub(crate) fn build_openai_messages(messages: &[crate::Message]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(messages.len());
    let mut pending_calls: Vec<Value> = Vec::new();

    let flush = |out: &mut Vec<Value>, pending: &mut Vec<Value>| {
        if !pending.is_empty() {
            out.push(json!({
                "role": "assistant",
                "content": Value::Null,
                "tool_calls": std::mem::take(pending),
            }));
        }
    };

    for m in messages {
        match &m.content {
            MessageContent::ToolCall {
                tool_call_id,
                function,
            } => {
                pending_calls.push(json!({
                    "id": tool_call_id,
                    "type": "function",
                    "function": {
                        "name": function.name,
                        "arguments": function.arguments,
                    }
                }));
            }
            MessageContent::ToolResult {
                tool_call_id,
                name,
                content,
            } => {
                flush(&mut out, &mut pending_calls);
                out.push(json!({
                    "role": "tool",
                    "tool_call_id": tool_call_id,
                    "name": name,
                    "content": content,
                }));
            }
            MessageContent::Text(t) => {
                flush(&mut out, &mut pending_calls);
                let mut msg = json!({ "role": role_str(&m.role), "content": t });
                if let Some(name) = &m.name {
                    msg["name"] = json!(name);
                }
                out.push(msg);
            }
        }
    }
    flush(&mut out, &mut pending_calls);
    out
}

fn role_str(r: &Role) -> &'static str {
    match r {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

/// Parse a single complete SSE `data:` line into a [`ResponseEvent`].
///
/// Returns `None` for empty lines, comment lines, or unparseable data.
fn parse_sse_data_line(line: &str) -> Option<anyhow::Result<ResponseEvent>> {
    let data = line.strip_prefix("data: ")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(Ok(ResponseEvent::Done));
    }
    let v: Value = serde_json::from_str(data).ok()?;
    Some(Ok(parse_sse_chunk(&v)))
}

/// Drain all complete `\n`-terminated SSE lines from `buf`.
///
/// Any trailing incomplete line is left in `buf` so it can be extended by
/// the next TCP chunk.
pub(crate) fn drain_complete_sse_lines(buf: &mut String) -> Vec<anyhow::Result<ResponseEvent>> {
    let mut events = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        if let Some(ev) = parse_sse_data_line(&line) {
            events.push(ev);
        }
    }
    events
}

fn parse_sse_chunk(v: &Value) -> ResponseEvent {
    // Usage-only chunk (emitted when stream_options.include_usage = true)
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        return ResponseEvent::Usage {
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
        };
    }

    let choice = &v["choices"][0];

    if choice["finish_reason"].as_str() == Some("length") {
        return ResponseEvent::MaxTokens;
    }

    let delta = &choice["delta"];

    // Tool call delta — each SSE chunk carries one tool-call delta; the
    // "index" field routes accumulation for parallel calls.
    if let Some(tc) = delta.get("tool_calls").and_then(|t| t.get(0)) {
        return ResponseEvent::ToolCall {
            index: tc["index"].as_u64().unwrap_or(0) as u32,
            id: tc["id"].as_str().unwrap_or("").to_string(),
            name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
            arguments: tc["function"]["arguments"]
                .as_str()
                .unwrap_or("")
                .to_string(),
        };
    }

    // Reasoning delta — `reasoning_content` (xAI grok-3-mini, DeepSeek-R1)
    // or `reasoning` (some aggregators).
    let reasoning = delta
        .get("reasoning_content")
        .and_then(|c| c.as_str())
        .or_else(|| delta.get("reasoning").and_then(|c| c.as_str()));
    if let Some(r) = reasoning {
        if !r.is_empty() {
            return ResponseEvent::ReasoningDelta(r.to_string());
        }
    }

    if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
        return ResponseEvent::TextDelta(text.to_string());
    }

    ResponseEvent::TextDelta(String::new())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Message;

    // ── Message building ──────────────────────────────────────────────────────

    #[test]
    fn text_messages_pass_through() {
        let wire = build_openai_messages(&[
            Message::system("sys"),
            Message::user("hi"),
            Message::assistant("hello"),
        ]);
        assert_eq!(wire.len(), 3);
        assert_eq!(wire[0]["role"], "system");
        assert_eq!(wire[1]["content"], "hi");
        assert_eq!(wire[2]["role"], "assistant");
    }

    #[test]
    fn consecutive_tool_calls_coalesce_into_one_assistant_message() {
        let wire = build_openai_messages(&[
            Message::user("do two things"),
            Message::tool_call("c1", "read_file", "{\"path\":\"a\"}"),
            Message::tool_call("c2", "read_file", "{\"path\":\"b\"}"),
            Message::tool_result("c1", "read_file", "A"),
            Message::tool_result("c2", "read_file", "B"),
        ]);
        assert_eq!(wire.len(), 4);
        let calls = wire[1]["tool_calls"].as_array().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0]["id"], "c1");
        assert_eq!(calls[1]["id"], "c2");
        assert_eq!(wire[2]["role"], "tool");
        assert_eq!(wire[2]["tool_call_id"], "c1");
        assert_eq!(wire[2]["name"], "read_file");
    }

    #[test]
    fn trailing_tool_call_is_flushed() {
        let wire = build_openai_messages(&[
            Message::user("go"),
            Message::tool_call("c1", "shell", "{}"),
        ]);
        assert_eq!(wire.len(), 2);
        assert!(wire[1]["tool_calls"].is_array());
    }

    #[test]
    fn named_message_carries_name_field() {
        let mut m = Message::user("hi");
        m.name = Some("alice".into());
        let wire = build_openai_messages(&[m]);
        assert_eq!(wire[0]["name"], "alice");
    }

    // ── Local-backend rewriting ───────────────────────────────────────────────

    #[test]
    fn tool_roles_rewritten_for_local_backends() {
        let msgs = rewrite_tool_roles(&[
            Message::user("hi"),
            Message::tool_call("c1", "shell", "{\"cmd\":\"ls\"}"),
            Message::tool_result("c1", "shell", "file.txt"),
        ]);
        assert_eq!(msgs[1].role, Role::Assistant);
        assert!(msgs[1].as_text().unwrap().starts_with("[Tool Call]"));
        assert_eq!(msgs[2].role, Role::User);
        assert!(msgs[2].as_text().unwrap().starts_with("[Tool Result]"));
    }

    #[test]
    fn local_backend_elides_tools_from_body() {
        let p = OpenAICompatProvider::new(
            "ollama",
            "llama3.2".into(),
            None,
            "http://localhost:11434/v1",
            None,
            None,
            Value::Null,
        );
        let req = CompletionRequest {
            messages: vec![Message::user("hi")],
            tools: vec![crate::ToolSchema {
                name: "t".into(),
                description: "d".into(),
                parameters: json!({"type":"object"}),
            }],
            stream: true,
            ..Default::default()
        };
        let body = p.build_body(&req);
        assert!(body.get("tools").is_none(), "local backend must elide tools");
    }

    #[test]
    fn hosted_backend_includes_tools_and_choice() {
        let p = OpenAICompatProvider::new(
            "xai",
            "grok-3".into(),
            Some("k".into()),
            "https://api.x.ai/v1",
            None,
            None,
            Value::Null,
        );
        let req = CompletionRequest {
            messages: vec![Message::user("hi")],
            tools: vec![crate::ToolSchema {
                name: "t".into(),
                description: "d".into(),
                parameters: json!({"type":"object"}),
            }],
            stream: false,
            ..Default::default()
        };
        let body = p.build_body(&req);
        assert_eq!(body["tools"].as_array().unwrap().len(), 1);
        assert_eq!(body["tool_choice"], "auto");
    }

    // ── Live search heuristic ─────────────────────────────────────────────────

    #[test]
    fn live_search_triggers_on_keywords() {
        assert!(wants_live_search("what is the latest rustc release"));
        assert!(wants_live_search("news about the kernel today"));
        assert!(!wants_live_search("refactor this function"));
    }

    #[test]
    fn live_search_triggers_on_year() {
        assert!(wants_live_search("who won the election in 2024"));
        assert!(!wants_live_search("set the port to 8080"));
    }

    #[test]
    fn grok_body_gets_search_parameters_for_time_sensitive_input() {
        let p = OpenAICompatProvider::new(
            "xai",
            "grok-3".into(),
            Some("k".into()),
            "https://api.x.ai/v1",
            None,
            None,
            Value::Null,
        );
        let req = CompletionRequest {
            messages: vec![Message::user("what happened today")],
            ..Default::default()
        };
        let body = p.build_body(&req);
        assert_eq!(body["search_parameters"]["mode"], "auto");

        let req2 = CompletionRequest {
            messages: vec![Message::user("rename this variable")],
            ..Default::default()
        };
        assert!(p.build_body(&req2).get("search_parameters").is_none());
    }

    // ── SSE parsing ───────────────────────────────────────────────────────────

    #[test]
    fn sse_text_delta_parsed() {
        let mut buf = "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n".to_string();
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 1);
        assert!(
            matches!(events[0].as_ref().unwrap(), ResponseEvent::TextDelta(t) if t == "hi")
        );
    }

    #[test]
    fn sse_done_sentinel_parsed() {
        let mut buf = "data: [DONE]\n".to_string();
        let events = drain_complete_sse_lines(&mut buf);
        assert!(matches!(events[0].as_ref().unwrap(), ResponseEvent::Done));
    }

    #[test]
    fn sse_incomplete_line_left_in_buffer() {
        let mut buf = "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\ndata: {\"cho"
            .to_string();
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 1);
        assert_eq!(buf, "data: {\"cho");
    }

    #[test]
    fn sse_tool_call_delta_parsed_with_index() {
        let chunk = json!({
            "choices": [{
                "delta": {
                    "tool_calls": [{
                        "index": 1,
                        "id": "c9",
                        "function": { "name": "shell", "arguments": "{\"cm" }
                    }]
                }
            }]
        });
        match parse_sse_chunk(&chunk) {
            ResponseEvent::ToolCall {
                index,
                id,
                name,
                arguments,
            } => {
                assert_eq!(index, 1);
                assert_eq!(id, "c9");
                assert_eq!(name, "shell");
                assert_eq!(arguments, "{\"cm");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn sse_usage_chunk_parsed() {
        let chunk = json!({ "usage": { "prompt_tokens": 12, "completion_tokens": 3 } });
        assert!(matches!(
            parse_sse_chunk(&chunk),
            ResponseEvent::Usage { input_tokens: 12, output_tokens: 3 }
        ));
    }

    #[test]
    fn sse_reasoning_delta_parsed() {
        let chunk = json!({
            "choices": [{ "delta": { "reasoning_content": "thinking…" } }]
        });
        assert!(matches!(
            parse_sse_chunk(&chunk),
            ResponseEvent::ReasoningDelta(r) if r == "thinking…"
        ));
    }

    #[test]
    fn sse_finish_reason_length_maps_to_max_tokens() {
        let chunk = json!({ "choices": [{ "delta": {}, "finish_reason": "length" }] });
        assert!(matches!(parse_sse_chunk(&chunk), ResponseEvent::MaxTokens));
    }
}
