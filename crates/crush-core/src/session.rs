// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crush_tools::TodoItem;

/// One piece of a message's content, in the order it was produced.
///
/// Mirrors the data model's `Part` variants exactly. `ToolCall`/`ToolResult`
/// carry opaque JSON strings rather than `serde_json::Value` so that a
/// provider's exact byte-for-byte arguments round-trip even when they are
/// not valid JSON (the agent loop repairs malformed JSON before dispatch,
/// but the raw string is preserved here for replay/debugging).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text { text: String },
    Reasoning { text: String },
    ToolCall {
        id: String,
        name: String,
        input: String,
        finished: bool,
        /// Always false in this implementation: every tool is dispatched
        /// locally through the sandbox client, never executed by the
        /// provider itself.
        provider_executed: bool,
    },
    ToolResult {
        tool_call_id: String,
        name: String,
        content: String,
        is_error: bool,
        metadata: Option<serde_json::Value>,
    },
    /// Terminal part. A message with a `Finish` part is closed — no further
    /// parts may be appended (`I-MSG-CLOSED`).
    Finish { reason: String },
}

impl Part {
    pub fn approx_tokens(&self) -> usize {
        let chars = match self {
            Part::Text { text } | Part::Reasoning { text } => text.len(),
            Part::ToolCall { name, input, .. } => name.len() + input.len(),
            Part::ToolResult { content, .. } => content.len(),
            Part::Finish { reason } => reason.len(),
        };
        (chars / 4).max(1)
    }

    pub fn is_finish(&self) -> bool {
        matches!(self, Part::Finish { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One message in a session's history.
///
/// `id` is a ULID: lexicographically sortable and monotonically increasing,
/// so message ID order equals creation order (`I-MSG-ORDER`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub parts: Vec<Part>,
    /// Set once a `Finish` part closes this message.
    pub finished: bool,
}

impl Message {
    pub fn new(session_id: impl Into<String>, role: Role) -> Self {
        Self {
            id: Ulid::new().to_string(),
            session_id: session_id.into(),
            role,
            parts: Vec::new(),
            finished: false,
        }
    }

    pub fn system(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        let mut m = Self::new(session_id, Role::System);
        m.parts.push(Part::Text { text: text.into() });
        m.finished = true;
        m
    }

    pub fn user(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        let mut m = Self::new(session_id, Role::User);
        m.parts.push(Part::Text { text: text.into() });
        m.finished = true;
        m
    }

    /// An assistant message carrying only text, already finished. Used for
    /// plain text turns and for compaction summaries.
    pub fn assistant_text(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        let mut m = Self::new(session_id, Role::Assistant);
        let text = text.into();
        if !text.is_empty() {
            m.parts.push(Part::Text { text });
        }
        m.parts.push(Part::Finish {
            reason: "stop".into(),
        });
        m.finished = true;
        m
    }

    /// An assistant message carrying a single tool call, left open
    /// (`finished = false`) until the matching `ToolResult` arrives.
    pub fn assistant_tool_call(
        session_id: impl Into<String>,
        id: impl Into<String>,
        name: impl Into<String>,
        input: impl Into<String>,
    ) -> Self {
        let mut m = Self::new(session_id, Role::Assistant);
        m.parts.push(Part::ToolCall {
            id: id.into(),
            name: name.into(),
            input: input.into(),
            finished: true,
            provider_executed: false,
        });
        m
    }

    pub fn tool_result(
        session_id: impl Into<String>,
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        let mut m = Self::new(session_id, Role::Tool);
        m.parts.push(Part::ToolResult {
            tool_call_id: tool_call_id.into(),
            name: name.into(),
            content: content.into(),
            is_error,
            metadata: None,
        });
        m.finished = true;
        m
    }

    pub fn tool_result_with_metadata(
        session_id: impl Into<String>,
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
        metadata: serde_json::Value,
    ) -> Self {
        let mut m = Self::tool_result(session_id, tool_call_id, name, content, is_error);
        if let Some(Part::ToolResult { metadata: slot, .. }) = m.parts.last_mut() {
            *slot = Some(metadata);
        }
        m
    }

    /// Concatenation of this message's `Text` parts, or `None` if it has
    /// none.
    pub fn as_text(&self) -> Option<String> {
        let text: String = self
            .parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = (&str, &str, &str)> {
        self.parts.iter().filter_map(|p| match p {
            Part::ToolCall {
                id, name, input, ..
            } => Some((id.as_str(), name.as_str(), input.as_str())),
            _ => None,
        })
    }

    pub fn approx_tokens(&self) -> usize {
        self.parts.iter().map(Part::approx_tokens).sum::<usize>().max(1)
    }

    /// Flatten into the provider wire format. A message can expand into
    /// several wire messages (one per tool call / tool result part) since
    /// `crush_model::MessageContent` only carries one content item.
    pub fn to_wire(&self) -> Vec<crush_model::Message> {
        let role = match self.role {
            Role::System => crush_model::Role::System,
            Role::User => crush_model::Role::User,
            Role::Assistant => crush_model::Role::Assistant,
            Role::Tool => crush_model::Role::Tool,
        };
        let mut out = Vec::new();
        for part in &self.parts {
            match part {
                Part::Text { text } | Part::Reasoning { text } => {
                    if !text.is_empty() {
                        out.push(crush_model::Message {
                            role: role.clone(),
                            content: crush_model::MessageContent::Text(text.clone()),
                        });
                    }
                }
                Part::ToolCall {
                    id, name, input, ..
                } => {
                    out.push(crush_model::Message {
                        role: role.clone(),
                        content: crush_model::MessageContent::ToolCall {
                            tool_call_id: id.clone(),
                            function: crush_model::FunctionCall {
                                name: name.clone(),
                                arguments: input.clone(),
                            },
                        },
                    });
                }
                Part::ToolResult {
                    tool_call_id,
                    content,
                    ..
                } => {
                    out.push(crush_model::Message {
                        role: crush_model::Role::Tool,
                        content: crush_model::MessageContent::ToolResult {
                            tool_call_id: tool_call_id.clone(),
                            content: content.clone(),
                        },
                    });
                }
                Part::Finish { .. } => {}
            }
        }
        out
    }
}

/// In-memory session state the agent loop mutates each turn.
///
/// Mutated only by its own agent loop and the `todo_write` tool, per the
/// single-writer discipline in the concurrency model.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub messages: Vec<Message>,
    /// Approximate total token count for the current message list.
    pub token_count: usize,
    pub max_tokens: usize,
    pub max_output_tokens: usize,
    pub todos: Vec<TodoItem>,
    /// Monotonic counter bumped on every mutation — exposed to the session
    /// coordinator so it can detect concurrent-mutation bugs in tests.
    pub version: u64,
    pub cache_read_total: u64,
    pub cache_write_total: u64,
    /// Running correction factor applied to the chars/4 estimate, updated
    /// from the provider's actual reported input token count each turn.
    pub calibration_factor: f32,
    /// Token overhead of tool schemas + dynamic context, recomputed each
    /// turn; not part of `messages` so it is tracked separately.
    pub schema_overhead: usize,
}

impl Session {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            id: Ulid::new().to_string(),
            messages: Vec::new(),
            token_count: 0,
            max_tokens,
            max_output_tokens: 0,
            todos: Vec::new(),
            version: 0,
            cache_read_total: 0,
            cache_write_total: 0,
            calibration_factor: 1.0,
            schema_overhead: 0,
        }
    }

    pub fn push(&mut self, msg: Message) {
        self.token_count += msg.approx_tokens();
        self.messages.push(msg);
        self.version += 1;
    }

    pub fn push_many(&mut self, msgs: impl IntoIterator<Item = Message>) {
        for m in msgs {
            self.push(m);
        }
    }

    /// Effective input budget in tokens: the context window minus the
    /// reserved output allowance.
    pub fn input_budget(&self) -> usize {
        self.max_tokens.saturating_sub(self.max_output_tokens)
    }

    /// Fraction of the input budget consumed (0.0-1.0), including schema
    /// overhead not tracked in `messages`.
    pub fn context_fraction(&self) -> f32 {
        let budget = self.input_budget();
        if budget == 0 {
            return 0.0;
        }
        let calibrated = ((self.token_count + self.schema_overhead) as f32) * self.calibration_factor;
        calibrated / (budget as f32)
    }

    pub fn is_near_limit(&self, threshold: f32) -> bool {
        self.context_fraction() >= threshold
    }

    pub fn recalculate_tokens(&mut self) {
        self.token_count = self.messages.iter().map(Message::approx_tokens).sum();
    }

    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.recalculate_tokens();
        self.version += 1;
    }

    pub fn add_cache_usage(&mut self, read: u32, write: u32) {
        self.cache_read_total += read as u64;
        self.cache_write_total += write as u64;
    }

    /// Update the calibration factor from a provider's actual reported input
    /// token count vs. this session's chars/4 estimate for the same request.
    /// Exponential smoothing avoids a single outlier distorting future
    /// budget checks.
    pub fn update_calibration(&mut self, actual: u32, estimated: usize) {
        if estimated == 0 {
            return;
        }
        let observed = actual as f32 / estimated as f32;
        self.calibration_factor = self.calibration_factor * 0.7 + observed * 0.3;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sid() -> &'static str {
        "s1"
    }

    #[test]
    fn new_session_has_unique_id() {
        let a = Session::new(1000);
        let b = Session::new(1000);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn new_session_starts_empty() {
        let s = Session::new(1000);
        assert!(s.messages.is_empty());
        assert_eq!(s.token_count, 0);
        assert_eq!(s.version, 0);
    }

    #[test]
    fn push_increments_token_count_and_version() {
        let mut s = Session::new(1000);
        s.push(Message::user(sid(), "12345678"));
        assert_eq!(s.token_count, 2);
        assert_eq!(s.version, 1);
    }

    #[test]
    fn push_many_accumulates_tokens() {
        let mut s = Session::new(10_000);
        s.push_many([
            Message::user(sid(), "12345678"),
            Message::assistant_text(sid(), "abcd"),
        ]);
        assert_eq!(s.version, 2);
    }

    #[test]
    fn recalculate_tokens_matches_push_sum() {
        let mut s = Session::new(1000);
        s.push(Message::user(sid(), "hello world"));
        let after_push = s.token_count;
        s.recalculate_tokens();
        assert_eq!(s.token_count, after_push);
    }

    #[test]
    fn replace_messages_sets_messages_and_recalculates_tokens() {
        let mut s = Session::new(1000);
        s.push(Message::user(sid(), "first"));
        s.push(Message::assistant_text(sid(), "reply"));
        assert_eq!(s.messages.len(), 2);
        s.replace_messages(vec![Message::user(sid(), "only")]);
        assert_eq!(s.messages.len(), 1);
        assert_eq!(s.messages[0].as_text(), Some("only".to_string()));
    }

    #[test]
    fn context_fraction_zero_when_empty() {
        let s = Session::new(1000);
        assert_eq!(s.context_fraction(), 0.0);
    }

    #[test]
    fn context_fraction_zero_at_zero_budget() {
        let s = Session::new(0);
        assert_eq!(s.context_fraction(), 0.0);
    }

    #[test]
    fn is_near_limit_true_when_over_threshold() {
        let mut s = Session::new(4);
        s.push(Message::user(sid(), "1234567890123"));
        s.push(Message::user(sid(), "abcd"));
        assert!(s.is_near_limit(0.8));
    }

    #[test]
    fn message_round_trips_to_wire_text() {
        let m = Message::user(sid(), "hi there");
        let wire = m.to_wire();
        assert_eq!(wire.len(), 1);
        assert_eq!(wire[0].as_text(), Some("hi there"));
    }

    #[test]
    fn tool_call_message_closes_on_result() {
        let call = Message::assistant_tool_call(sid(), "tc1", "read_file", "{}");
        assert!(call.tool_calls().any(|(id, name, _)| id == "tc1" && name == "read_file"));
        let result = Message::tool_result(sid(), "tc1", "read_file", "contents", false);
        assert!(result.finished);
    }

    #[test]
    fn finish_part_closes_message() {
        let m = Message::assistant_text(sid(), "done");
        assert!(m.parts.last().unwrap().is_finish());
    }

    #[test]
    fn calibration_smooths_toward_observed_ratio() {
        let mut s = Session::new(1000);
        let before = s.calibration_factor;
        s.update_calibration(200, 100);
        assert!(s.calibration_factor > before);
    }

    #[test]
    fn add_cache_usage_accumulates() {
        let mut s = Session::new(1000);
        s.add_cache_usage(10, 5);
        s.add_cache_usage(3, 2);
        assert_eq!(s.cache_read_total, 13);
        assert_eq!(s.cache_write_total, 7);
    }
}
