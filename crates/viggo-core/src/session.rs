// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use uuid::Uuid;

use viggo_model::{Message, MessageContent, Role};

/// Identity of one conversation session.  The session id doubles as the
/// lane id for tool serialization.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Bound the history: drop the oldest non-System messages until at most
/// `max_history` remain.
///
/// Dropping an assistant tool-call message also drops its paired tool
/// result (and vice versa) so the pairing invariant survives the trim.
pub fn enforce_history_bound(messages: &mut Vec<Message>, max_history: usize) {
    loop {
        let non_system = messages.iter().filter(|m| m.role != Role::System).count();
        if non_system <= max_history {
            return;
        }
        let Some(oldest) = messages.iter().position(|m| m.role != Role::System) else {
            return;
        };
        let removed = messages.remove(oldest);
        match removed.content {
            MessageContent::ToolCall { tool_call_id, .. } => {
                messages.retain(|m| {
                    !matches!(
                        &m.content,
                        MessageContent::ToolResult { tool_call_id: id, .. } if *id == tool_call_id
                    )
                });
            }
            MessageContent::ToolResult { tool_call_id, .. } => {
                messages.retain(|m| {
                    !matches!(
                        &m.content,
                        MessageContent::ToolCall { tool_call_id: id, .. } if *id == tool_call_id
                    )
                });
            }
            _ => {}
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sessions_have_unique_ids() {
        assert_ne!(Session::new().id, Session::new().id);
    }

    #[test]
    fn bound_keeps_system_plus_max_history() {
        let mut msgs = vec![Message::system("sys")];
        for i in 0..10 {
            msgs.push(Message::user(format!("u{i}")));
        }
        enforce_history_bound(&mut msgs, 4);
        assert_eq!(msgs.len(), 5, "system + 4 recent");
        assert_eq!(msgs[0].as_text(), Some("sys"));
        assert_eq!(msgs[1].as_text(), Some("u6"));
        assert_eq!(msgs.last().unwrap().as_text(), Some("u9"));
    }

    #[test]
    fn bound_is_noop_when_under_limit() {
        let mut msgs = vec![Message::system("sys"), Message::user("hi")];
        enforce_history_bound(&mut msgs, 50);
        assert_eq!(msgs.len(), 2);
    }

    #[test]
    fn dropping_a_tool_call_drops_its_result() {
        let mut msgs = vec![
            Message::system("sys"),
            Message::tool_call("c1", "shell", "{}"),
            Message::tool_result("c1", "shell", "out"),
            Message::user("u1"),
            Message::assistant("a1"),
            Message::user("u2"),
        ];
        enforce_history_bound(&mut msgs, 3);
        // c1 call and result dropped together; no orphan remains.
        assert!(!msgs.iter().any(|m| matches!(
            &m.content,
            MessageContent::ToolResult { tool_call_id, .. } if tool_call_id == "c1"
        )));
        assert!(!msgs.iter().any(|m| matches!(
            &m.content,
            MessageContent::ToolCall { tool_call_id, .. } if tool_call_id == "c1"
        )));
        let non_system = msgs.iter().filter(|m| m.role != Role::System).count();
        assert!(non_system <= 3);
    }
}
