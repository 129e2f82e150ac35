//! Conversation context with token-budget eviction.
//!
//! Single-writer (the LLM stage), many-reader. Callers wrap a [`Context`] in
//! a lock and hand snapshots to observers; eviction happens on append.

use serde::{Deserialize, Serialize};

use crate::frame::{now_ms, ToolCall};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One role-tagged context entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Set on `Role::Tool` messages; pairs the entry with an assistant
    /// tool call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Set on assistant messages that requested tool invocations.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tool_calls: Vec<ToolCall>,
    pub timestamp_ms: u64,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn assistant_tool_calls(calls: Vec<ToolCall>) -> Self {
        let mut msg = Self::new(Role::Assistant, "");
        msg.tool_calls = calls;
        msg
    }

    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut msg = Self::new(Role::Tool, content);
        msg.tool_call_id = Some(call_id.into());
        msg
    }

    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
            timestamp_ms: now_ms(),
        }
    }
}

/// Rough token estimate: ~4 characters per token for Latin text.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().max(1) / 4 + 1
}

/// Ordered conversation history bounded by a token budget.
///
/// The head is a system message assembled at session start from persona text
/// and memory recall. Eviction removes the oldest non-system entry; a
/// tool-call pair (assistant request + its tool results) is evicted
/// atomically and never while unresolved.
#[derive(Debug, Clone)]
pub struct Context {
    messages: Vec<Message>,
    token_budget: usize,
}

impl Context {
    pub fn new(system_prompt: impl Into<String>, token_budget: usize) -> Self {
        Self {
            messages: vec![Message::system(system_prompt)],
            token_budget,
        }
    }

    /// Prepend recalled memory snippets into the system head.
    pub fn inject_recall(&mut self, prefix: &str, snippets: &[String]) {
        if snippets.is_empty() {
            return;
        }
        let block: String = snippets
            .iter()
            .map(|s| format!("- {}\n", s))
            .collect();
        let head = &mut self.messages[0];
        head.content = format!("{}\n\n{}{}", head.content, prefix, block);
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
        self.evict();
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.push(Message::user(text));
    }

    pub fn push_assistant(&mut self, text: impl Into<String>) {
        self.push(Message::assistant(text));
    }

    /// Record a resolved tool exchange: the assistant request and its result.
    pub fn push_tool_exchange(&mut self, call: ToolCall, result_content: impl Into<String>) {
        let call_id = call.call_id.clone();
        self.push(Message::assistant_tool_calls(vec![call]));
        self.push(Message::tool(call_id, result_content));
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn token_count(&self) -> usize {
        self.messages
            .iter()
            .map(|m| estimate_tokens(&m.content) + 4)
            .sum()
    }

    /// Last `k` non-system messages, oldest first. Used by the gate.
    pub fn recent(&self, k: usize) -> Vec<Message> {
        self.messages
            .iter()
            .filter(|m| m.role != Role::System)
            .rev()
            .take(k)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }

    fn evict(&mut self) {
        while self.token_count() > self.token_budget {
            match self.oldest_evictable() {
                Some(range) => {
                    self.messages.drain(range);
                }
                None => break,
            }
        }
    }

    /// Index range of the oldest evictable unit: a single non-system message,
    /// or a fully-resolved tool-call group.
    fn oldest_evictable(&self) -> Option<std::ops::Range<usize>> {
        let mut i = 0;
        while i < self.messages.len() {
            let msg = &self.messages[i];
            match msg.role {
                Role::System => {
                    i += 1;
                }
                Role::Assistant if !msg.tool_calls.is_empty() => {
                    // Group: this request plus the tool messages answering it.
                    let expected: Vec<&str> = msg
                        .tool_calls
                        .iter()
                        .map(|c| c.call_id.as_str())
                        .collect();
                    let mut end = i + 1;
                    let mut resolved = 0;
                    while end < self.messages.len() && self.messages[end].role == Role::Tool {
                        if let Some(id) = &self.messages[end].tool_call_id {
                            if expected.contains(&id.as_str()) {
                                resolved += 1;
                            }
                        }
                        end += 1;
                    }
                    if resolved == expected.len() {
                        return Some(i..end);
                    }
                    // Unresolved pair: skip past it, never elide.
                    i = end;
                }
                Role::Tool => {
                    // A stray tool message belongs to the group before it;
                    // only reachable when that group was skipped.
                    i += 1;
                }
                _ => return Some(i..i + 1),
            }
        }
        None
    }
}
