//! Dialogue history: the ordered message log for one session.
//!
//! Append-only apart from the system-prompt slot at index 0, which is
//! replaced in place. Snapshots preserve insertion order; that order is
//! exactly what the LLM sees.

use serde::{Deserialize, Serialize};

use crate::llm::ToolCall;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One turn record. `content` may be empty on assistant messages that only
/// carry tool calls; `tool_call_id` is set only on tool-result messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Ordered message log with a replaceable system slot.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct DialogueHistory {
    messages: Vec<Message>,
}

impl DialogueHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace the system prompt. The slot is always index 0.
    pub fn set_system(&mut self, prompt: impl Into<String>) {
        let prompt = prompt.into();
        match self.messages.first_mut() {
            Some(first) if first.role == Role::System => first.content = prompt,
            _ => self.messages.insert(0, Message::system(prompt)),
        }
    }

    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }

    /// Snapshot with extra context appended to the system prompt. The stored
    /// history is untouched.
    pub fn snapshot_with_memory(&self, extra_system_text: &str) -> Vec<Message> {
        let mut messages = self.messages.clone();
        if extra_system_text.is_empty() {
            return messages;
        }
        match messages.first_mut() {
            Some(first) if first.role == Role::System => {
                first.content.push_str("\n\n");
                first.content.push_str(extra_system_text);
            }
            _ => messages.insert(0, Message::system(extra_system_text)),
        }
        messages
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Retain the system message plus the last `n` non-system messages.
    pub fn keep_recent(&mut self, n: usize) {
        let system = self
            .messages
            .first()
            .filter(|m| m.role == Role::System)
            .cloned();
        let non_system: Vec<Message> = self
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .cloned()
            .collect();
        let skip = non_system.len().saturating_sub(n);
        self.messages.clear();
        if let Some(system) = system {
            self.messages.push(system);
        }
        self.messages.extend(non_system.into_iter().skip(skip));
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{FunctionCall, ToolCall};

    #[test]
    fn test_set_system_is_idempotent() {
        let mut history = DialogueHistory::new();
        history.set_system("prompt");
        history.set_system("prompt");
        assert_eq!(history.len(), 1);
        assert_eq!(history.snapshot()[0].content, "prompt");
    }

    #[test]
    fn test_set_system_replaces_in_place() {
        let mut history = DialogueHistory::new();
        history.set_system("old");
        history.append(Message::user("hi"));
        history.set_system("new");
        let snap = history.snapshot();
        assert_eq!(snap[0].content, "new");
        assert_eq!(snap[1].content, "hi");
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn test_snapshot_preserves_order() {
        let mut history = DialogueHistory::new();
        history.set_system("s");
        history.append(Message::user("q1"));
        history.append(Message::assistant("a1"));
        history.append(Message::user("q2"));
        let roles: Vec<Role> = history.snapshot().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant, Role::User]);
    }

    #[test]
    fn test_keep_recent() {
        let mut history = DialogueHistory::new();
        history.set_system("s");
        for i in 0..6 {
            history.append(Message::user(format!("u{i}")));
            history.append(Message::assistant(format!("a{i}")));
        }
        history.keep_recent(4);
        let snap = history.snapshot();
        assert_eq!(snap.len(), 5);
        assert_eq!(snap[0].role, Role::System);
        assert_eq!(snap[1].content, "u4");
        assert_eq!(snap[4].content, "a5");
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut history = DialogueHistory::new();
        history.set_system("s");
        history.append(Message::user("现在几点"));
        history.append(Message::assistant_with_tools(
            "",
            vec![ToolCall {
                id: "call_1".to_string(),
                kind: "function".to_string(),
                index: 0,
                function: FunctionCall {
                    name: "get_time".to_string(),
                    arguments: "{}".to_string(),
                },
            }],
        ));
        history.append(Message::tool_result("call_1", "10:00"));

        let json = serde_json::to_string(&history).unwrap();
        let restored: DialogueHistory = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.snapshot(), history.snapshot());
    }

    #[test]
    fn test_snapshot_with_memory_leaves_history_untouched() {
        let mut history = DialogueHistory::new();
        history.set_system("base");
        let snap = history.snapshot_with_memory("extra facts");
        assert!(snap[0].content.contains("extra facts"));
        assert_eq!(history.snapshot()[0].content, "base");
    }
}
