// SPDX-License-Identifier: MIT
use crush_tools::{events::TodoItem, ToolCall};

/// Events emitted by the agent loop while driving a single generation.
///
/// The session coordinator (`crush-gateway`) subscribes to this channel,
/// persists each event to the durable event log (`C5`), and fans it out to
/// connected clients over the pub/sub bus (`C6`). This type is the in-process
/// shape; the persisted/wire shape is the `Event` record described in the
/// data model (`stream_id`, `session_id`, `type`, `payload`, `created_at`).
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A text chunk streamed from the model — folds into the assistant
    /// message's current `Text` part. Mirrors the `message_delta` event type.
    MessageDelta(String),
    /// A complete text response, emitted once streaming for a part finishes.
    MessageComplete(String),
    /// A chain-of-thought chunk (extended thinking API), kept separate from
    /// message text per the `Reasoning` part variant.
    ReasoningDelta(String),
    /// A complete reasoning block, accumulated from `ReasoningDelta` events.
    ReasoningComplete(String),
    /// The model produced a tool call; dispatch is about to begin.
    /// Mirrors the `tool_call_started` event type.
    ToolCallStarted(ToolCall),
    /// A tool call finished and its `ToolResult` part was appended.
    /// Mirrors the `tool_result` event type.
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        output: String,
        is_error: bool,
    },
    /// Context was compacted; before/after token counts for the UI.
    ContextCompacted {
        tokens_before: usize,
        tokens_after: usize,
    },
    /// Current token usage update. Mirrors `session_update`.
    TokenUsage {
        input: u32,
        output: u32,
        context_total: usize,
        /// Tokens served from the provider's prompt cache this turn.
        cache_read: u32,
        /// Tokens written into the provider's prompt cache this turn.
        cache_write: u32,
    },
    /// The to-do list was updated by the `todo_write` tool.
    TodoUpdate(Vec<TodoItem>),
    /// The generation reached a terminal state. Mirrors `generation_complete`.
    GenerationComplete(GenerationOutcome),
    /// A recoverable error occurred during the turn. Mirrors `error`.
    Error(String),
}

/// Which compaction strategy actually ran for a given compaction event —
/// distinct from `CompactionStrategy` (the configured preference) because an
/// over-budget context forces `Emergency` truncation regardless of config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionStrategyUsed {
    Structured,
    Narrative,
    Emergency,
}

/// Terminal outcome of a generation, carried by `AgentEvent::GenerationComplete`.
/// Corresponds to the `Finish{reason}` part and the `done{ok|error|cancelled}`
/// state in the agent loop's state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    Ok { reason: String },
    Error { message: String },
    Cancelled,
}
