// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Google Gemini driver — native Generative Language API.
//!
//! Uses the `generateContent` / `streamGenerateContent` endpoints.
//!
//! Gemini enforces a strict conversation grammar: the contents list must
//! start with a `user` turn, roles must not repeat, and every
//! `functionResponse` must directly answer a preceding `functionCall`.
//! Histories that were edited, compacted, or interrupted violate these
//! rules constantly, so the request side runs a multi-pass sanitizer
//! before anything is sent.
//!
//! # Auth
//! API key via `x-goog-api-key` header.
//!
//! # Endpoint pattern
//! `POST {base}/v1beta/models/{model}:streamGenerateContent?alt=sse`

use anyhow::Context;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{
    provider::ResponseStream,
    retry::{classify_status, with_backoff, Transience},
    CompletionRequest, MessageContent, ResponseEvent, Role,
};

pub struct GoogleProvider {
    model: String,
    api_key: Option<String>,
    base_url: String,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
}

impl GoogleProvider {
    pub fn new(
        model: String,
        api_key: Option<String>,
        base_url: Option<String>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Self {
        Self {
            model,
            api_key,
            base_url: base_url
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com".into()),
            max_tokens: max_tokens.unwrap_or(8192),
            temperature: temperature.unwrap_or(0.2),
            client: reqwest::Client::new(),
        }
    }

    fn build_body(&self, req: &CompletionRequest) -> Value {
        let (system_parts, contents) = build_gemini_contents(&req.messages);
        let contents = sanitize_contents(contents);

        let mut body = json!({
            "contents": contents,
            "generationConfig": {
                "maxOutputTokens": self.max_tokens,
                "temperature": self.temperature,
            }
        });
        if !system_parts.is_empty() {
            body["systemInstruction"] = json!({ "parts": system_parts });
        }
        if !req.tools.is_empty() {
            let decls: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": sanitize_tool_schema(t.parameters.clone()),
                    })
                })
                .collect();
            body["tools"] = json!([{ "functionDeclarations": decls }]);
            body["toolConfig"] = json!({ "functionCallingConfig": { "mode": "AUTO" } });
        }
        body
    }

    async fn post(&self, url: &str, body: &Value) -> anyhow::Result<reqwest::Response> {
        let key = self.api_key.as_deref().context("GEMINI_API_KEY not set")?;
        with_backoff("google", || {
            let http_req = self
                .client
                .post(url)
                .header("x-goog-api-key", key)
                .json(body);
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
                    anyhow::anyhow!("Google Gemini error {status}: {text}"),
                ))
            }
        })
        .await
    }

    /// Non-streaming call, used directly and as the streaming fallback.
    async fn complete_non_streaming(&self, body: &Value) -> anyhow::Result<Vec<ResponseEvent>> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        );
        let resp = self.post(&url, body).await?;
        let v: Value = resp.json().await.context("Google Gemini response body")?;
        Ok(parse_gemini_response(&v))
    }
}

#[async_trait::async_trait]
impl crate::ModelProvider for GoogleProvider {
    fn name(&self) -> &str {
        "google"
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let body = self.build_body(&req);
        debug!(model = %self.model, "sending Google Gemini request");

        if !req.stream {
            let events = self.complete_non_streaming(&body).await?;
            let wrapped: Vec<anyhow::Result<ResponseEvent>> =
                events.into_iter().map(Ok).collect();
            return Ok(Box::pin(futures::stream::iter(wrapped)));
        }

        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.base_url.trim_end_matches('/'),
            self.model
        );

        let resp = match self.post(&url, &body).await {
            Ok(r) => r,
            Err(e) => {
                // Some deployments reject the SSE endpoint outright.  A
                // non-streaming result delivered as synthetic deltas is
                // strictly better than failing the turn.
                warn!(error = %e, "streaming endpoint failed; falling back to generateContent");
                let events = self.complete_non_streaming(&body).await?;
                let wrapped: Vec<anyhow::Result<ResponseEvent>> =
                    events.into_iter().map(Ok).collect();
                return Ok(Box::pin(futures::stream::iter(wrapped)));
            }
        };

        let byte_stream = resp.bytes_stream();
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let events: Vec<anyhow::Result<ResponseEvent>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_sse_lines(buf)
                    }
                    Err(e) => vec![Err(anyhow::anyhow!(e))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

// ─── Request transform ────────────────────────────────────────────────────────

/// Split the history into (systemInstruction parts, contents turns).
///
/// - Leading System messages become `systemInstruction`.
/// - A System message appearing mid-conversation (e.g. a tool-discovery
///   hint) is demoted to a prefixed `user` turn: Gemini's role grammar has
///   no system role inside `contents`.
/// - User → `user`, Assistant → `model`, Tool → `function`.
pub(crate) fn build_gemini_contents(messages: &[crate::Message]) -> (Vec<Value>, Vec<Value>) {
    let mut system_parts: Vec<Value> = Vec::new();
    let mut contents: Vec<Value> = Vec::new();
    let mut seen_non_system = false;

    for m in messages {
        match m.role {
            Role::System => {
                if let Some(t) = m.as_text() {
                    if seen_non_system {
                        contents.push(json!({
                            "role": "user",
                            "parts": [{ "text": format!("[context] {t}") }],
                        }));
                    } else {
                        system_parts.push(json!({ "text": t }));
                    }
                }
            }
            Role::User => {
                seen_non_system = true;
                contents.push(json!({
                    "role": "user",
                    "parts": [{ "text": m.as_text().unwrap_or("") }],
                }));
            }
            Role::Assistant => {
                seen_non_system = true;
                let parts = match &m.content {
                    MessageContent::ToolCall { function, .. } => {
                        let args: Value =
                            serde_json::from_str(&function.arguments).unwrap_or(json!({}));
                        vec![json!({
                            "functionCall": { "name": function.name, "args": args }
                        })]
                    }
                    _ => vec![json!({ "text": m.as_text().unwrap_or("") })],
                };
                contents.push(json!({ "role": "model", "parts": parts }));
            }
            Role::Tool => {
                seen_non_system = true;
                if let MessageContent::ToolResult { name, content, .. } = &m.content {
                    contents.push(json!({
                        "role": "function",
                        "parts": [{
                            "functionResponse": {
                                "name": name,
                                "response": { "output": content },
                            }
                        }]
                    }));
                }
            }
        }
    }
    (system_parts, contents)
}

/// Enforce Gemini's conversation grammar on a raw contents list.
///
/// Passes, in order:
/// 1. Drop orphan `function` turns not immediately preceded by a `model`
///    turn containing a `functionCall` part.
/// 2. Strip `functionCall` parts from `model` turns not followed by a
///    `function` turn; drop the turn when no parts remain.
/// 3. Merge consecutive same-role turns.
/// 4. Ensure the list starts with a `user` turn.
pub(crate) fn sanitize_contents(contents: Vec<Value>) -> Vec<Value> {
    // Pass 1: orphan functionResponse turns.
    let mut kept: Vec<Value> = Vec::with_capacity(contents.len());
    for turn in contents {
        if turn["role"] == "function" {
            let answered = kept
                .last()
                .map(|prev| prev["role"] == "model" && has_function_call(prev))
                .unwrap_or(false)
                // A function turn may also extend a run of function turns
                // answering parallel calls from the same model turn.
                || matches!(kept.last(), Some(prev) if prev["role"] == "function");
            if !answered {
                continue;
            }
        }
        kept.push(turn);
    }

    // Pass 2: unanswered functionCall parts.
    let mut stripped: Vec<Value> = Vec::with_capacity(kept.len());
    for (i, turn) in kept.iter().enumerate() {
        if turn["role"] == "model" && has_function_call(turn) {
            let answered = kept
                .get(i + 1)
                .map(|next| next["role"] == "function")
                .unwrap_or(false);
            if !answered {
                let parts: Vec<Value> = turn["parts"]
                    .as_array()
                    .map(|p| {
                        p.iter()
                            .filter(|part| part.get("functionCall").is_none())
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                if parts.is_empty() {
                    continue;
                }
                stripped.push(json!({ "role": "model", "parts": parts }));
                continue;
            }
        }
        stripped.push(turn.clone());
    }

    // Pass 3: merge consecutive same-role turns.
    let mut merged: Vec<Value> = Vec::with_capacity(stripped.len());
    for turn in stripped {
        match merged.last_mut() {
            Some(prev) if prev["role"] == turn["role"] => {
                let extra: Vec<Value> = turn["parts"].as_array().cloned().unwrap_or_default();
                if let Some(parts) = prev["parts"].as_array_mut() {
                    parts.extend(extra);
                }
            }
            _ => merged.push(turn),
        }
    }

    // Pass 4: the list must open with a user turn.
    if merged.first().map(|t| t["role"] != "user").unwrap_or(false) {
        merged.insert(
            0,
            json!({ "role": "user", "parts": [{ "text": "(continue)" }] }),
        );
    }
    merged
}

fn has_function_call(turn: &Value) -> bool {
    turn["parts"]
        .as_array()
        .map(|parts| parts.iter().any(|p| p.get("functionCall").is_some()))
        .unwrap_or(false)
}

/// Rewrite a JSON Schema into Gemini's dialect.
///
/// Gemini wants uppercase primitive type names and rejects `ARRAY` types
/// without an `items` schema.  Recurses into `properties` and `items`.
pub(crate) fn sanitize_tool_schema(mut schema: Value) -> Value {
    if let Some(obj) = schema.as_object_mut() {
        if let Some(t) = obj.get("type").and_then(|t| t.as_str()) {
            let upper = match t {
                "string" => Some("STRING"),
                "number" => Some("NUMBER"),
                "integer" => Some("INTEGER"),
                "boolean" => Some("BOOLEAN"),
                "array" => Some("ARRAY"),
                "object" => Some("OBJECT"),
                "null" => Some("NULL"),
                // Already uppercase or unknown: leave as-is.
                _ => None,
            };
            if let Some(u) = upper {
                obj.insert("type".into(), json!(u));
            }
        }
        if obj.get("type").and_then(|t| t.as_str()) == Some("ARRAY")
            && !obj.contains_key("items")
        {
            obj.insert("items".into(), json!({ "type": "OBJECT" }));
        }
        if let Some(items) = obj.remove("items") {
            obj.insert("items".into(), sanitize_tool_schema(items));
        }
        if let Some(Value::Object(props)) = obj.remove("properties") {
            let sanitized: serde_json::Map<String, Value> = props
                .into_iter()
                .map(|(k, v)| (k, sanitize_tool_schema(v)))
                .collect();
            obj.insert("properties".into(), Value::Object(sanitized));
        }
    }
    schema
}

// ─── Response parsing ─────────────────────────────────────────────────────────

fn drain_sse_lines(buf: &mut String) -> Vec<anyhow::Result<ResponseEvent>> {
    let mut events = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        let Some(data) = line.strip_prefix("data: ") else {
            continue;
        };
        let data = data.trim();
        if data.is_empty() {
            continue;
        }
        if data == "[DONE]" {
            events.push(Ok(ResponseEvent::Done));
            continue;
        }
        if let Ok(v) = serde_json::from_str::<Value>(data) {
            events.push(Ok(parse_gemini_chunk(&v)));
        }
    }
    events
}

fn parse_gemini_chunk(v: &Value) -> ResponseEvent {
    if let Some(meta) = v.get("usageMetadata") {
        return ResponseEvent::Usage {
            input_tokens: meta["promptTokenCount"].as_u64().unwrap_or(0) as u32,
            output_tokens: meta["candidatesTokenCount"].as_u64().unwrap_or(0) as u32,
        };
    }

    let candidate = &v["candidates"][0];
    let parts = match candidate["content"]["parts"].as_array() {
        Some(p) => p,
        None => {
            if candidate["finishReason"].as_str().is_some() {
                return ResponseEvent::Done;
            }
            return ResponseEvent::TextDelta(String::new());
        }
    };

    for part in parts {
        if part.get("thought").and_then(|t| t.as_bool()) == Some(true) {
            if let Some(text) = part["text"].as_str() {
                return ResponseEvent::ReasoningDelta(text.to_string());
            }
        }
        if let Some(fc) = part.get("functionCall") {
            let name = fc["name"].as_str().unwrap_or("").to_string();
            let args = serde_json::to_string(&fc["args"]).unwrap_or_default();
            return ResponseEvent::ToolCall {
                index: 0,
                id: format!("gm_{}", uuid::Uuid::new_v4().simple()),
                name,
                arguments: args,
            };
        }
        if let Some(text) = part["text"].as_str() {
            return ResponseEvent::TextDelta(text.to_string());
        }
    }

    if candidate["finishReason"].as_str().is_some() {
        return ResponseEvent::Done;
    }
    ResponseEvent::TextDelta(String::new())
}

/// Parse a full (non-streaming) generateContent response into events.
///
/// Degenerate responses are mapped to graceful text rather than errors:
/// - `finishReason: MALFORMED_FUNCTION_CALL` → a retry prompt, so the model
///   re-attempts the call with valid JSON on the next round.
/// - `finishReason` set but no parts (SAFETY, RECITATION…) → a decline.
pub(crate) fn parse_gemini_response(v: &Value) -> Vec<ResponseEvent> {
    let mut events = Vec::new();

    let candidate = &v["candidates"][0];
    let finish = candidate["finishReason"].as_str().unwrap_or("");

    if finish == "MALFORMED_FUNCTION_CALL" {
        events.push(ResponseEvent::TextDelta(
            "The previous tool call was malformed. Please retry the call with valid \
             JSON arguments."
                .into(),
        ));
        events.push(ResponseEvent::Done);
        return events;
    }

    match candidate["content"]["parts"].as_array() {
        Some(parts) => {
            let mut tc_index = 0u32;
            for part in parts {
                if let Some(fc) = part.get("functionCall") {
                    events.push(ResponseEvent::ToolCall {
                        index: tc_index,
                        id: format!("gm_{}", uuid::Uuid::new_v4().simple()),
                        name: fc["name"].as_str().unwrap_or("").to_string(),
                        arguments: serde_json::to_string(&fc["args"]).unwrap_or_default(),
                    });
                    tc_index += 1;
                } else if let Some(text) = part["text"].as_str() {
                    events.push(ResponseEvent::TextDelta(text.to_string()));
                }
            }
        }
        None => {
            if !finish.is_empty() {
                events.push(ResponseEvent::TextDelta(format!(
                    "I can't answer that request (stopped: {finish})."
                )));
            }
        }
    }

    if let Some(meta) = v.get("usageMetadata") {
        events.push(ResponseEvent::Usage {
            input_tokens: meta["promptTokenCount"].as_u64().unwrap_or(0) as u32,
            output_tokens: meta["candidatesTokenCount"].as_u64().unwrap_or(0) as u32,
        });
    }
    events.push(ResponseEvent::Done);
    events
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
