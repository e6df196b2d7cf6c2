// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Streaming response accumulation.
//!
//! Providers deliver an assistant turn as a sequence of partial deltas:
//! text fragments, reasoning fragments, and tool-call pieces keyed by a
//! parallel-call index whose name and argument JSON arrive split across
//! chunks.  The accumulator folds that sequence into one coherent turn:
//! strings concatenate, tool calls merge element-wise by index, and the
//! transient index is dropped at finalization.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::warn;

use viggo_model::{ResponseEvent, Usage};

/// Minimum interval between emitted token-count updates (~2 Hz).
const TOKEN_EMIT_INTERVAL: Duration = Duration::from_millis(500);

/// A fully assembled tool call, ready for dispatch.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    /// JSON object as a string, repaired if the model emitted broken JSON.
    pub arguments: String,
}

/// What one folded delta surfaced, for immediate emission.
#[derive(Debug, Default)]
pub struct FoldDelta {
    /// Sanitized user-visible text, when the delta carried any.
    pub display: Option<String>,
    /// Reasoning text, when the delta carried any.
    pub reasoning: Option<String>,
    /// True when a tool call first acquired a complete function name.
    pub new_tool_call: bool,
    /// Running token estimate, throttled to [`TOKEN_EMIT_INTERVAL`].
    pub token_count: Option<usize>,
}

/// The finalized assistant turn.
#[derive(Debug)]
pub struct AssistantTurn {
    /// Raw accumulated text (control tokens preserved).
    pub raw_text: String,
    /// Sanitized text for history and display.
    pub text: String,
    pub reasoning: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: Usage,
    pub max_tokens_hit: bool,
}

#[derive(Debug, Default)]
struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
}

pub struct StreamAccumulator {
    raw_text: String,
    reasoning: String,
    pending: BTreeMap<u32, PendingToolCall>,
    usage: Usage,
    max_tokens_hit: bool,
    chars_seen: usize,
    last_token_emit: Instant,
}

impl Default for StreamAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self {
            raw_text: String::new(),
            reasoning: String::new(),
            pending: BTreeMap::new(),
            usage: Usage::default(),
            max_tokens_hit: false,
            chars_seen: 0,
            last_token_emit: Instant::now(),
        }
    }

    /// Fold one provider event into the accumulated state.
    pub fn fold(&mut self, event: ResponseEvent) -> FoldDelta {
        let mut out = FoldDelta::default();
        match event {
            ResponseEvent::TextDelta(delta) => {
                if delta.is_empty() {
                    return out;
                }
                self.raw_text.push_str(&delta);
                self.chars_seen += delta.len();
                let display = sanitize_control_tokens(&delta);
                if !display.is_empty() {
                    out.display = Some(display);
                }
                out.token_count = self.maybe_token_count();
            }
            ResponseEvent::ReasoningDelta(delta) => {
                if delta.is_empty() {
                    return out;
                }
                self.reasoning.push_str(&delta);
                self.chars_seen += delta.len();
                out.reasoning = Some(delta);
                out.token_count = self.maybe_token_count();
            }
            ResponseEvent::ToolCall {
                index,
                id,
                name,
                arguments,
            } => {
                let entry = self.pending.entry(index).or_default();
                let had_name = !entry.name.is_empty();
                if !id.is_empty() {
                    entry.id = id;
                }
                if !name.is_empty() {
                    entry.name.push_str(&name);
                }
                entry.args_buf.push_str(&arguments);
                self.chars_seen += entry.name.len() + arguments.len();
                out.new_tool_call = !had_name && !entry.name.is_empty();
            }
            ResponseEvent::Usage {
                input_tokens,
                output_tokens,
            } => {
                self.usage.input_tokens = input_tokens;
                self.usage.output_tokens = output_tokens;
            }
            ResponseEvent::MaxTokens => {
                self.max_tokens_hit = true;
            }
            ResponseEvent::Error(e) => {
                warn!("model stream error: {e}");
            }
            ResponseEvent::Done => {}
        }
        out
    }

    fn maybe_token_count(&mut self) -> Option<usize> {
        if self.last_token_emit.elapsed() < TOKEN_EMIT_INTERVAL {
            return None;
        }
        self.last_token_emit = Instant::now();
        Some((self.chars_seen / 4).max(1))
    }

    /// Consume the accumulator and assemble the turn.
    ///
    /// Pending calls are ordered by their provider index, which is then
    /// dropped.  Calls with an empty name cannot be dispatched and are
    /// discarded; an empty id gets a synthetic fallback so the pairing
    /// invariant can still be maintained.
    pub fn finalize(self) -> AssistantTurn {
        let mut tool_calls = Vec::with_capacity(self.pending.len());
        for (i, (_, ptc)) in self.pending.into_iter().enumerate() {
            if ptc.name.is_empty() {
                warn!(
                    tool_call_id = %ptc.id,
                    "dropping tool call with empty name from model; cannot dispatch"
                );
                continue;
            }
            let id = if ptc.id.is_empty() {
                warn!(tool_name = %ptc.name, "tool call had empty id; generating synthetic id");
                format!("tc_synthetic_{i}")
            } else {
                ptc.id
            };
            tool_calls.push(ToolCallRequest {
                id,
                name: ptc.name,
                arguments: normalize_arguments(&ptc.args_buf),
            });
        }

        AssistantTurn {
            text: sanitize_control_tokens(&self.raw_text),
            raw_text: self.raw_text,
            reasoning: self.reasoning,
            tool_calls,
            usage: self.usage,
            max_tokens_hit: self.max_tokens_hit,
        }
    }
}

/// Resolve an accumulated argument buffer to a valid JSON object string.
///
/// Tool arguments must be an object; `null`, arrays, or unparseable text
/// would fail on the next request, so broken buffers are repaired where
/// possible and replaced with `{}` otherwise.
fn normalize_arguments(buf: &str) -> String {
    if buf.trim().is_empty() {
        return "{}".to_string();
    }
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(buf) {
        if v.is_object() {
            return buf.to_string();
        }
        warn!("tool call arguments were not a JSON object; substituting {{}}");
        return "{}".to_string();
    }
    match attempt_json_repair(buf) {
        Some(v) if v.is_object() => {
            warn!("repaired invalid JSON arguments from model");
            v.to_string()
        }
        _ => {
            warn!(args = %buf, "unrepairable tool call arguments; substituting {{}}");
            "{}".to_string()
        }
    }
}

/// Attempt to repair common JSON syntax errors: invalid escape sequences
/// inside strings, and truncated objects missing a closing quote/brace.
fn attempt_json_repair(json_str: &str) -> Option<serde_json::Value> {
    let fixed = fix_invalid_json_escapes(json_str);
    if let Ok(v) = serde_json::from_str(&fixed) {
        return Some(v);
    }

    if !fixed.trim_end().ends_with('}') {
        let mut completed = fixed.clone();
        let quote_count = fixed.chars().filter(|&c| c == '"').count();
        if quote_count % 2 == 1 {
            completed.push('"');
        }
        completed.push('}');
        if let Ok(v) = serde_json::from_str(&completed) {
            return Some(v);
        }
    }
    None
}

/// Replace invalid escape sequences inside string values with an escaped
/// backslash.  Valid JSON escapes are `"`, `\`, `/`, `b`, `f`, `n`, `r`,
/// `t`, `u`; models occasionally emit `\c`, `\(` and the like.
fn fix_invalid_json_escapes(json_str: &str) -> String {
    let mut result = String::with_capacity(json_str.len() + 16);
    let mut chars = json_str.chars();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            match c {
                '\\' => match chars.next() {
                    Some(next)
                        if matches!(next, '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u') =>
                    {
                        result.push('\\');
                        result.push(next);
                    }
                    Some(next) => {
                        result.push('\\');
                        result.push('\\');
                        result.push(next);
                    }
                    None => result.push('\\'),
                },
                '"' => {
                    in_string = false;
                    result.push('"');
                }
                _ => result.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            result.push(c);
        }
    }
    result
}

/// Strip control tokens of the form `<|channel|>` from user-visible text.
pub fn sanitize_control_tokens(text: &str) -> String {
    // Cheap path: most deltas carry no control tokens at all.
    if !text.contains("<|") {
        return text.to_string();
    }
    let re = control_token_regex();
    re.replace_all(text, "").to_string()
}

fn control_token_regex() -> Regex {
    Regex::new(r"<\|[a-zA-Z0-9_]+\|>").expect("static regex")
}

/// Parse commentary-pattern tool calls from raw assistant text.
///
/// Models served without native function calling emit calls inline as
/// `commentary to=<tool> <json-object>`, usually wrapped in control tokens
/// (`<|channel|>commentary to=shell <|message|>{…}`).  Control tokens are
/// stripped first so the marker and its JSON are adjacent, then each span
/// is replaced by a synthesized call.
pub fn parse_commentary_tool_calls(text: &str) -> (Vec<ToolCallRequest>, String) {
    let raw = sanitize_control_tokens(text);
    let raw = raw.as_str();
    let marker = Regex::new(r"commentary\s+to=([A-Za-z0-9_\-.]+)\s*").expect("static regex");
    let mut calls = Vec::new();
    let mut stripped = String::with_capacity(raw.len());
    let mut cursor = 0usize;

    for m in marker.captures_iter(raw) {
        let whole = m.get(0).expect("capture 0");
        if whole.start() < cursor {
            continue;
        }
        let tool = m.get(1).expect("capture 1").as_str().to_string();
        let json_start = whole.end();
        let Some(json_len) = balanced_object_len(&raw[json_start..]) else {
            continue;
        };
        let args = &raw[json_start..json_start + json_len];
        if serde_json::from_str::<serde_json::Value>(args)
            .map(|v| v.is_object())
            .unwrap_or(false)
        {
            stripped.push_str(&raw[cursor..whole.start()]);
            cursor = json_start + json_len;
            calls.push(ToolCallRequest {
                id: format!("cm_{}", calls.len()),
                name: tool,
                arguments: args.to_string(),
            });
        }
    }
    stripped.push_str(&raw[cursor..]);
    (calls, stripped.trim().to_string())
}

/// Byte length of the balanced JSON object at the start of `s`, if any.
fn balanced_object_len(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if i == 0 && c != '{' {
            return None;
        }
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + c.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
