// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Deterministic context-reduction primitives.
//!
//! Two independent mechanisms keep tool output from swamping the window:
//!
//! 1. Per-result truncation ([`head_tail_truncate`]) caps a single result
//!    as it enters the session, keeping the head and the tail — errors and
//!    summaries live at the end of command output, preambles at the start.
//! 2. Cumulative compaction ([`compact_large_tool_results`]) replaces the
//!    *oldest* tool results with restore stubs once their combined size
//!    passes a threshold, after persisting the full payloads to the
//!    durable store so `restore_context` can fetch them back.

use viggo_model::{Message, MessageContent, Role};
use viggo_tools::ResultStore;

/// Truncate `content` to at most `cap_chars`, preserving head and tail.
///
/// The elision marker states exactly how many bytes were dropped so the
/// model knows more output exists.
pub fn head_tail_truncate(content: &str, cap_chars: usize) -> String {
    if cap_chars == 0 || content.len() <= cap_chars {
        return content.to_string();
    }

    let half = cap_chars / 2;
    let head_end = floor_char_boundary(content, half);
    let tail_start = ceil_char_boundary(content, content.len() - half);
    let omitted = tail_start - head_end;
    format!(
        "{}\n...[{} bytes omitted]...\n{}",
        &content[..head_end],
        omitted,
        &content[tail_start..]
    )
}

/// Replace the oldest tool results with restore stubs until the cumulative
/// size of all tool results fits under `threshold_chars`.
///
/// Full payloads are persisted to `store` under their `tool_call_id` before
/// the stub replaces them (write-once; replays keep the original).  The
/// newest results are left intact — they are the ones the model is about to
/// reason over.  Returns the number of results compacted.
pub fn compact_large_tool_results(
    messages: &mut [Message],
    threshold_chars: usize,
    store: &ResultStore,
) -> usize {
    let mut total: usize = messages
        .iter()
        .map(|m| match &m.content {
            MessageContent::ToolResult { content, .. } => content.len(),
            _ => 0,
        })
        .sum();
    if total <= threshold_chars {
        return 0;
    }

    let mut compacted = 0;
    for m in messages.iter_mut() {
        if total <= threshold_chars {
            break;
        }
        let MessageContent::ToolResult {
            tool_call_id,
            name,
            content,
        } = &m.content
        else {
            continue;
        };
        let stub = restore_stub(tool_call_id, content.len());
        if stub.len() >= content.len() {
            // Already small; compacting it would grow the session.
            continue;
        }
        if let Err(e) = store.write(tool_call_id, content) {
            tracing::warn!(tool_call_id, error = %e, "cannot persist tool result; keeping inline");
            continue;
        }
        total -= content.len() - stub.len();
        m.content = MessageContent::ToolResult {
            tool_call_id: tool_call_id.clone(),
            name: name.clone(),
            content: stub,
        };
        compacted += 1;
    }
    compacted
}

fn restore_stub(tool_call_id: &str, original_len: usize) -> String {
    format!(
        "[tool output compacted: {original_len} bytes stored; call restore_context \
         with tool_call_id \"{tool_call_id}\" to retrieve it]"
    )
}

/// Deterministic fallback summarizer for context folding.
///
/// Concatenates a per-message line of the form `Role: <head> … <tail>`,
/// bounded so the result stays within `target_chars`.  Used when no LLM
/// summarizer hook is installed.
pub fn deterministic_summary(messages: &[Message], target_chars: usize) -> String {
    if messages.is_empty() {
        return String::new();
    }
    let per_message = (target_chars / messages.len()).max(32);
    let mut out = String::with_capacity(target_chars.min(per_message * messages.len()));
    for m in messages {
        let role = match m.role {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::Tool => "Tool",
        };
        let text = match &m.content {
            MessageContent::Text(t) => t.clone(),
            MessageContent::ToolCall { function, .. } => {
                format!("[tool_call: {}({})]", function.name, function.arguments)
            }
            MessageContent::ToolResult { name, content, .. } => {
                format!("[tool_result {name}: {content}]")
            }
        };
        let line = if text.len() <= per_message {
            text
        } else {
            let keep = per_message / 2;
            let head_end = floor_char_boundary(&text, keep);
            let tail_start = ceil_char_boundary(&text, text.len() - keep);
            format!("{} … {}", &text[..head_end], &text[tail_start..])
        };
        out.push_str(role);
        out.push_str(": ");
        out.push_str(&line);
        out.push('\n');
    }
    out
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    idx = idx.min(s.len());
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(s: &str, mut idx: usize) -> usize {
    idx = idx.min(s.len());
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
