use serde::{Deserialize, Serialize};

// ─── Provider wire types ──────────────────────────────────────────────────────
//
// These are the flat, provider-facing message shapes a `ModelProvider`
// consumes and streams against. They are deliberately simpler than the
// session-level `Message`/`Part` domain model in `crush_core`: the agent loop
// flattens a session's rich part history into this shape before calling the
// provider, and reassembles `ResponseEvent`s back into `Part`s on the way out.

/// A single message in the flattened conversation history sent to a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn tool_result(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::ToolResult {
                tool_call_id: id.into(),
                content: content.into(),
            },
        }
    }

    /// Return the plain text of this message, if it has text content.
    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(t) => Some(t),
            _ => None,
        }
    }

    /// Approximate token count used for context management — 4 characters
    /// per token, the same calibration the teacher's compaction logic uses.
    pub fn approx_tokens(&self) -> usize {
        let chars = match &self.content {
            MessageContent::Text(t) => t.len(),
            MessageContent::ToolCall { function, .. } => {
                function.name.len() + function.arguments.len()
            }
            MessageContent::ToolResult { content, .. } => content.len(),
        };
        (chars / 4).max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// The content of a flattened provider message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    ToolCall {
        tool_call_id: String,
        function: FunctionCall,
    },
    ToolResult {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded argument object
    pub arguments: String,
}

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: serde_json::Value,
}

/// Request sent to a model provider.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub stream: bool,
    /// Dynamic context (e.g. a to-do list or cwd) appended as a second system
    /// block *without* a cache breakpoint, so only the stable prefix is
    /// cached by providers that support explicit prompt caching.
    pub system_dynamic_suffix: Option<String>,
}

/// A single streamed event from the model.
///
/// The agent loop (`crush_core::agent`) folds a stream of these into the
/// session's `Part` list: `TextDelta`/`ThinkingDelta` accumulate into
/// `Part::Text`/`Part::Reasoning`, `ToolCall` becomes a `Part::ToolCall`
/// (marked parallel-safe or not via `ResponseEvent::Done`'s implicit
/// producer-order contract), and `Done`/`Error` terminate the turn.
#[derive(Debug, Clone)]
pub enum ResponseEvent {
    /// A text delta streamed from the model
    TextDelta(String),
    /// The model wants to call a tool. Deltas for the same `id` accumulate
    /// `arguments` until the tool call is complete.
    ToolCall {
        id: String,
        name: String,
        arguments: String,
    },
    /// A reasoning/thinking delta, kept separate from visible text.
    ThinkingDelta(String),
    /// Final usage statistics for the turn.
    Usage {
        input_tokens: u32,
        output_tokens: u32,
        cache_read_tokens: u32,
        cache_write_tokens: u32,
    },
    /// The stream finished normally.
    Done,
    /// A recoverable error (non-fatal warning); does not end the generation.
    Error(String),
}

/// Token usage from one turn.
#[derive(Debug, Clone, Default)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cache_read_tokens: u32,
    pub cache_write_tokens: u32,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
