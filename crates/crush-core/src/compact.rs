// SPDX-License-Identifier: MIT
use crush_config::CompactionStrategy;
use crush_tools::OutputCategory;

use crate::session::{Message, Part, Role};

// ─── Compaction prompts ───────────────────────────────────────────────────────

const SUMMARIZE_PROMPT: &str =
    "You are a context compaction assistant. Summarise the following conversation history \
     in a concise, information-dense way. Preserve all technical details, decisions, file \
     names, code snippets, and tool outputs that may be relevant to future work. \
     The summary will replace the original history to free up context space.";

const STRUCTURED_COMPACTION_PROMPT: &str = "\
You are a context compaction assistant for a coding agent. \
Produce a structured state checkpoint from the conversation history below. \
Use EXACTLY the following Markdown sections — do not add or remove sections. \
Be information-dense: preserve file paths, function names, error messages, \
code snippets, test names, and technical decisions verbatim where they matter.

## Active Task
Describe in 1-3 sentences what the agent is currently working on.

## Key Decisions & Rationale
List every significant technical decision made and why (bullet points). \
Include file or component names.

## Files & Artifacts
List every file that was read, modified, or created, with a brief note on what was done.

## Constraints & Requirements
List every requirement, constraint, or user preference that must be preserved.

## Pending Items
List every unfinished subtask or open question.

## Session Narrative
Write a dense technical summary (2-5 paragraphs) of what happened, \
capturing the essential flow of events, tool outputs, and reasoning. \
Focus on facts the agent will need to continue correctly.";

/// Resolves a [`CompactionStrategy`] to its prompt text. A struct rather than
/// a bare match so a future strategy (e.g. per-project custom prompts) has
/// somewhere to hang configuration without changing every call site.
struct CompactionPrompt;

impl CompactionPrompt {
    fn text(strategy: &CompactionStrategy) -> &'static str {
        match strategy {
            CompactionStrategy::Structured => STRUCTURED_COMPACTION_PROMPT,
            CompactionStrategy::Narrative => SUMMARIZE_PROMPT,
        }
    }
}

/// Flattens a message list into plain text for embedding in a compaction
/// prompt. System messages are dropped — they're re-attached separately by
/// the caller, which would otherwise double them up in the summary input.
struct HistorySerializer;

impl HistorySerializer {
    fn render(messages: &[Message]) -> String {
        messages
            .iter()
            .filter(|m| !matches!(m.role, Role::System))
            .map(Self::render_message)
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    fn render_message(m: &Message) -> String {
        let role = match m.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::Tool => "Tool",
            Role::System => "System",
        };
        let text = m.parts.iter().map(Self::render_part).collect::<Vec<_>>().join(" ");
        format!("{role}: {text}")
    }

    fn render_part(part: &Part) -> String {
        match part {
            Part::Text { text } | Part::Reasoning { text } => text.clone(),
            Part::ToolCall { name, input, .. } => format!("[tool_call: {name}({input})]"),
            Part::ToolResult { content, .. } => format!("[tool_result: {content}]"),
            Part::Finish { .. } => String::new(),
        }
    }
}

fn with_session_id(messages: &[Message], system_msg: &Option<Message>) -> String {
    messages
        .first()
        .map(|m| m.session_id.clone())
        .or_else(|| system_msg.as_ref().map(|m| m.session_id.clone()))
        .unwrap_or_else(|| "unknown".to_string())
}

// ─── Public API ───────────────────────────────────────────────────────────────

/// Replace the conversation history with a single summarisation request using
/// the narrative strategy. Prefer [`compact_session_with_strategy`] for new
/// callers; kept standalone because tests exercise it directly.
pub fn compact_session(messages: &mut Vec<Message>, system_msg: Option<Message>) -> usize {
    compact_session_with_strategy(messages, system_msg, &CompactionStrategy::Narrative)
}

/// Strategy-aware compaction: restructures the message list so that the model
/// will produce a summary (or structured checkpoint) on the next turn.
///
/// The caller is responsible for actually invoking the model and rebuilding
/// the session from the resulting summary text. This function only rewrites
/// the `messages` list to contain the compaction prompt.
pub fn compact_session_with_strategy(
    messages: &mut Vec<Message>,
    system_msg: Option<Message>,
    strategy: &CompactionStrategy,
) -> usize {
    let before = messages.len();
    let session_id = with_session_id(messages, &system_msg);
    let prompt = CompactionPrompt::text(strategy);
    let history_text = HistorySerializer::render(messages);
    let summary_request = Message::user(&session_id, format!("{prompt}\n\n---\n\n{history_text}"));

    messages.clear();
    if let Some(sys) = system_msg {
        messages.push(sys);
    }
    messages.push(summary_request);
    before
}

/// Emergency fallback compaction used when the session is too large to fit even
/// a compaction prompt within the context window.
///
/// Drops all but the last `keep_n` non-system messages and prepends a canned
/// notice. No model call is made — this is a purely deterministic operation
/// that always succeeds regardless of session size.
pub fn emergency_compact(messages: &mut Vec<Message>, system_msg: Option<Message>, keep_n: usize) -> usize {
    let before = messages.len();
    let session_id = with_session_id(messages, &system_msg);

    let non_system: Vec<Message> = messages.iter().filter(|m| m.role != Role::System).cloned().collect();
    let keep = keep_n.min(non_system.len());
    let preserved = non_system[non_system.len() - keep..].to_vec();

    let notice = Message::assistant_text(
        &session_id,
        "[Context emergency-compacted: earlier history was dropped to prevent a \
         context-window overflow. The agent may lack full context for earlier \
         decisions. Proceed carefully and ask the user to re-provide any missing \
         requirements if needed.]",
    );

    messages.clear();
    if let Some(sys) = system_msg {
        messages.push(sys);
    }
    messages.push(notice);
    messages.extend(preserved);
    before
}

/// Deterministic, content-aware tool-result truncation.
///
/// Returns `content` unchanged when it fits within `cap_tokens`. Otherwise
/// applies a category-specific extraction strategy that preserves the most
/// useful portion of the output. Dispatching on [`OutputCategory`] (not tool
/// names) keeps this function independent of the tools crate's concrete tool
/// list; each tool declares its own category.
pub fn smart_truncate(content: &str, category: OutputCategory, cap_tokens: usize) -> String {
    if cap_tokens == 0 {
        return content.to_string();
    }
    let cap_chars = cap_tokens * 4;
    if content.len() <= cap_chars {
        return content.to_string();
    }

    let budget = TruncationBudget { content, cap_chars, omitted_bytes: content.len() - cap_chars };
    match category {
        OutputCategory::HeadTail => {
            budget.head_and_tail(60, 40, &format!("[... {{lines}} lines / {} bytes omitted ...]", budget.omitted_bytes))
        }
        OutputCategory::MatchList => budget.head_only(&format!(
            "[... {{lines}} more matches omitted ({} bytes); use a more specific pattern to see them ...]",
            budget.omitted_bytes
        )),
        OutputCategory::FileContent => budget.head_and_tail(
            usize::MAX,
            usize::MAX,
            &format!(
                "[... {{lines}} lines omitted ({} bytes); use read_file with offset/limit to see more ...]",
                budget.omitted_bytes
            ),
        ),
        OutputCategory::Generic => budget.hard_cut(),
    }
}

// ─── Truncation strategies ──────────────────────────────────────────────────

/// Carries the inputs every truncation strategy needs so `smart_truncate`
/// reads as a plain dispatch table instead of threading `content`/`cap_chars`
/// through a chain of free functions.
struct TruncationBudget<'a> {
    content: &'a str,
    cap_chars: usize,
    omitted_bytes: usize,
}

impl<'a> TruncationBudget<'a> {
    /// Hard-cuts at the nearest line boundary within the cap; used by
    /// [`OutputCategory::Generic`] where there's no structure worth preserving.
    fn hard_cut(&self) -> String {
        let cut = self.content[..self.cap_chars].rfind('\n').map(|p| p + 1).unwrap_or(self.cap_chars);
        format!(
            "{}\n[... {} bytes omitted; content truncated to fit context budget ...]",
            &self.content[..cut],
            self.omitted_bytes
        )
    }

    /// Keeps only the leading lines that fit within the full cap.
    fn head_only(&self, notice_template: &str) -> String {
        let lines: Vec<&str> = self.content.lines().collect();
        let (kept, kept_count) = Self::fill_lines(lines.iter().copied(), self.cap_chars);
        let omitted = lines.len() - kept_count;
        if omitted == 0 {
            return self.content[..self.cap_chars.min(self.content.len())].to_string();
        }
        format!("{kept}\n{}", notice_template.replace("{lines}", &omitted.to_string()))
    }

    /// Keeps `max_head` leading lines and `max_tail` trailing lines, each
    /// within half the cap, with a notice in between. `usize::MAX` for either
    /// bound means "as many as the character budget allows".
    fn head_and_tail(&self, max_head: usize, max_tail: usize, notice_template: &str) -> String {
        let lines: Vec<&str> = self.content.lines().collect();
        let half_cap = self.cap_chars / 2;

        let (head, head_count) = Self::fill_lines(lines.iter().copied().take(max_head), half_cap);

        let (mut tail_lines, _) = Self::fill_lines_rev(lines.iter().rev().copied().take(max_tail), half_cap);
        tail_lines.reverse();
        let tail_count = tail_lines.len();
        let tail = tail_lines.join("\n");

        let omitted = lines.len().saturating_sub(head_count + tail_count);
        if omitted == 0 {
            return self.content[..self.cap_chars.min(self.content.len())].to_string();
        }
        format!("{head}\n{}\n{tail}", notice_template.replace("{lines}", &omitted.to_string()))
    }

    /// Greedily joins lines (in iteration order) with `\n` until adding the
    /// next one would exceed `budget` characters. Returns the joined text and
    /// how many lines were kept.
    fn fill_lines<'b>(lines: impl Iterator<Item = &'b str>, budget: usize) -> (String, usize) {
        let mut kept = String::new();
        let mut count = 0usize;
        for line in lines {
            let needed = if kept.is_empty() { line.len() } else { line.len() + 1 };
            if kept.len() + needed > budget {
                break;
            }
            if !kept.is_empty() {
                kept.push('\n');
            }
            kept.push_str(line);
            count += 1;
        }
        (kept, count)
    }

    /// Same greedy fill as [`Self::fill_lines`] but collects into a `Vec`
    /// instead of joining immediately, since tail lines are gathered in
    /// reverse order and need to be flipped before display.
    fn fill_lines_rev<'b>(lines: impl Iterator<Item = &'b str>, budget: usize) -> (Vec<&'b str>, usize) {
        let mut kept = Vec::new();
        let mut chars = 0usize;
        for line in lines {
            let needed = if kept.is_empty() { line.len() } else { line.len() + 1 };
            if chars + needed > budget {
                break;
            }
            chars += needed;
            kept.push(line);
        }
        (kept, chars)
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sid() -> &'static str {
        "s1"
    }

    fn make_history() -> Vec<Message> {
        vec![
            Message::system(sid(), "You are a helpful assistant."),
            Message::user(sid(), "What is Rust?"),
            Message::assistant_text(sid(), "Rust is a systems programming language."),
            Message::user(sid(), "Show me an example."),
            Message::assistant_text(sid(), "fn main() { println!(\"Hello\"); }"),
        ]
    }

    // ── compact_session (narrative) ───────────────────────────────────────────

    #[test]
    fn returns_original_message_count() {
        let mut msgs = make_history();
        let before = compact_session(&mut msgs, None);
        assert_eq!(before, 5);
    }

    #[test]
    fn output_has_single_user_summary_request_without_system() {
        let mut msgs = make_history();
        compact_session(&mut msgs, None);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].role, Role::User);
    }

    #[test]
    fn output_with_system_message_has_two_messages() {
        let mut msgs = make_history();
        let sys = Message::system(sid(), "Keep this system message.");
        compact_session(&mut msgs, Some(sys));
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, Role::System);
        assert_eq!(msgs[1].role, Role::User);
    }

    #[test]
    fn system_message_content_is_preserved() {
        let mut msgs = make_history();
        let sys = Message::system(sid(), "Custom system prompt.");
        compact_session(&mut msgs, Some(sys));
        assert_eq!(msgs[0].as_text(), Some("Custom system prompt.".to_string()));
    }

    #[test]
    fn summary_request_contains_original_text() {
        let mut msgs = make_history();
        compact_session(&mut msgs, None);
        let summary_text = msgs[0].as_text().unwrap();
        assert!(summary_text.contains("What is Rust?"));
        assert!(summary_text.contains("systems programming language"));
    }

    #[test]
    fn system_messages_excluded_from_history_text() {
        let mut msgs = make_history();
        compact_session(&mut msgs, None);
        let summary_text = msgs[0].as_text().unwrap();
        assert!(!summary_text.contains("You are a helpful assistant"));
    }

    #[test]
    fn tool_call_serialised_in_history() {
        let mut msgs = vec![
            Message::user(sid(), "run ls"),
            Message::assistant_tool_call(sid(), "id1", "run_terminal_command", r#"{"command":"ls"}"#),
        ];
        compact_session(&mut msgs, None);
        let text = msgs[0].as_text().unwrap();
        assert!(text.contains("run_terminal_command"));
        assert!(text.contains("ls"));
    }

    #[test]
    fn tool_result_serialised_in_history() {
        let mut msgs = vec![
            Message::user(sid(), "run ls"),
            Message::tool_result(sid(), "id1", "run_terminal_command", "file1.txt\nfile2.txt", false),
        ];
        compact_session(&mut msgs, None);
        let text = msgs[0].as_text().unwrap();
        assert!(text.contains("file1.txt"));
    }

    #[test]
    fn compact_empty_history_returns_zero() {
        let mut msgs: Vec<Message> = vec![];
        let count = compact_session(&mut msgs, None);
        assert_eq!(count, 0);
    }

    #[test]
    fn compact_empty_history_produces_single_request() {
        let mut msgs: Vec<Message> = vec![];
        compact_session(&mut msgs, None);
        assert_eq!(msgs.len(), 1);
    }

    // ── compact_session_with_strategy (structured) ────────────────────────────

    #[test]
    fn structured_compaction_prompt_contains_required_sections() {
        let mut msgs = make_history();
        compact_session_with_strategy(&mut msgs, None, &CompactionStrategy::Structured);
        let text = msgs[0].as_text().unwrap();
        assert!(text.contains("## Active Task"));
        assert!(text.contains("## Key Decisions"));
        assert!(text.contains("## Files & Artifacts"));
        assert!(text.contains("## Constraints"));
        assert!(text.contains("## Pending Items"));
        assert!(text.contains("## Session Narrative"));
    }

    #[test]
    fn structured_compaction_includes_history() {
        let mut msgs = make_history();
        compact_session_with_strategy(&mut msgs, None, &CompactionStrategy::Structured);
        let text = msgs[0].as_text().unwrap();
        assert!(text.contains("What is Rust?"));
    }

    // ── emergency_compact ─────────────────────────────────────────────────────

    #[test]
    fn emergency_compact_returns_original_count() {
        let mut msgs = make_history();
        let before = emergency_compact(&mut msgs, None, 2);
        assert_eq!(before, 5);
    }

    #[test]
    fn emergency_compact_keeps_at_most_keep_n_non_system_messages() {
        let mut msgs = make_history();
        emergency_compact(&mut msgs, None, 2);
        let non_sys: Vec<_> = msgs.iter().filter(|m| m.role != Role::System).collect();
        assert_eq!(non_sys.len(), 3, "notice + 2 preserved messages expected");
    }

    #[test]
    fn emergency_compact_preserves_most_recent_messages() {
        let mut msgs = vec![
            Message::user(sid(), "old message"),
            Message::assistant_text(sid(), "old reply"),
            Message::user(sid(), "recent message"),
            Message::assistant_text(sid(), "recent reply"),
        ];
        emergency_compact(&mut msgs, None, 2);
        let text: Vec<String> = msgs.iter().filter_map(|m| m.as_text()).collect();
        assert!(text.iter().any(|t| t.contains("recent message")));
        assert!(text.iter().any(|t| t.contains("recent reply")));
    }

    #[test]
    fn emergency_compact_with_system_message_puts_sys_first() {
        let mut msgs = make_history();
        let sys = Message::system(sid(), "system content");
        emergency_compact(&mut msgs, Some(sys), 2);
        assert_eq!(msgs[0].role, Role::System);
        assert_eq!(msgs[0].as_text(), Some("system content".to_string()));
    }

    #[test]
    fn emergency_compact_notice_contains_warning_text() {
        let mut msgs = make_history();
        emergency_compact(&mut msgs, None, 2);
        let notice_text = msgs[0].as_text().unwrap();
        assert!(notice_text.contains("emergency-compacted"));
    }

    // ── smart_truncate ────────────────────────────────────────────────────────

    fn make_lines(n: usize) -> String {
        (0..n).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n")
    }

    #[test]
    fn smart_truncate_returns_original_when_under_cap() {
        let short = "hello world";
        assert_eq!(smart_truncate(short, OutputCategory::HeadTail, 100), short);
    }

    #[test]
    fn smart_truncate_zero_cap_returns_original() {
        let content = "a".repeat(10_000);
        assert_eq!(smart_truncate(&content, OutputCategory::HeadTail, 0), content);
    }

    #[test]
    fn smart_truncate_empty_content_returns_empty() {
        assert_eq!(smart_truncate("", OutputCategory::Generic, 10), "");
    }

    #[test]
    fn smart_truncate_exactly_at_cap_not_truncated() {
        let content = "a".repeat(40);
        let result = smart_truncate(&content, OutputCategory::Generic, 10);
        assert_eq!(result, content);
    }

    #[test]
    fn smart_truncate_one_byte_over_cap_is_truncated() {
        let content = "a".repeat(41);
        let result = smart_truncate(&content, OutputCategory::Generic, 10);
        assert_ne!(result, content);
        assert!(result.contains("omitted"));
    }

    #[test]
    fn all_categories_add_omission_notice_when_truncated() {
        let content = make_lines(1000);
        for category in [
            OutputCategory::HeadTail,
            OutputCategory::MatchList,
            OutputCategory::FileContent,
            OutputCategory::Generic,
        ] {
            let result = smart_truncate(&content, category, 10);
            assert!(result.contains("omitted"));
        }
    }

    #[test]
    fn headtail_preserves_first_lines() {
        let content = make_lines(200);
        let result = smart_truncate(&content, OutputCategory::HeadTail, 50);
        assert!(result.contains("line 0"));
        assert!(result.contains("line 1"));
    }

    #[test]
    fn headtail_preserves_last_lines() {
        let content = make_lines(200);
        let result = smart_truncate(&content, OutputCategory::HeadTail, 50);
        assert!(result.contains("line 199"));
        assert!(result.contains("line 198"));
    }

    #[test]
    fn headtail_drops_middle_lines() {
        let content = make_lines(200);
        let result = smart_truncate(&content, OutputCategory::HeadTail, 50);
        assert!(!result.contains("line 100\n") && !result.contains("\nline 100"));
    }

    #[test]
    fn matchlist_keeps_leading_matches() {
        let content = (0..500).map(|i| format!("match {i}: some content")).collect::<Vec<_>>().join("\n");
        let result = smart_truncate(&content, OutputCategory::MatchList, 50);
        assert!(result.contains("match 0:"));
    }

    #[test]
    fn matchlist_does_not_preserve_trailing_content() {
        let content = (0..500).map(|i| format!("match {i}: some content")).collect::<Vec<_>>().join("\n");
        let result = smart_truncate(&content, OutputCategory::MatchList, 50);
        assert!(!result.contains("match 499:"));
    }

    #[test]
    fn filecontent_preserves_first_and_last_lines() {
        let content = make_lines(1000);
        let result = smart_truncate(&content, OutputCategory::FileContent, 50);
        assert!(result.contains("line 0"));
        assert!(result.contains("line 999"));
    }

    #[test]
    fn filecontent_drops_middle_lines() {
        let content = make_lines(1000);
        let result = smart_truncate(&content, OutputCategory::FileContent, 50);
        assert!(!result.contains("line 500\n") && !result.contains("\nline 500"));
    }

    #[test]
    fn generic_truncates_at_newline_boundary() {
        let content = format!("{}\n{}", "a".repeat(10), "b".repeat(100));
        let result = smart_truncate(&content, OutputCategory::Generic, 5);
        assert!(!result.contains("bbb"));
    }

    #[test]
    fn generic_falls_back_to_hard_cut_when_no_newline() {
        let content = "x".repeat(10_000);
        let result = smart_truncate(&content, OutputCategory::Generic, 10);
        let x_count = result.chars().take_while(|&c| c == 'x').count();
        assert_eq!(x_count, 40);
    }

    #[test]
    fn headtail_omission_notice_mentions_lines_and_bytes() {
        let content = make_lines(200);
        let result = smart_truncate(&content, OutputCategory::HeadTail, 20);
        assert!(result.contains("omitted"));
        assert!(result.contains("bytes"));
    }

    #[test]
    fn matchlist_omission_notice_mentions_matches() {
        let content = (0..500).map(|i| format!("match {i}: foo")).collect::<Vec<_>>().join("\n");
        let result = smart_truncate(&content, OutputCategory::MatchList, 20);
        assert!(result.contains("matches omitted"));
    }

    #[test]
    fn filecontent_omission_notice_suggests_offset_limit() {
        let content = make_lines(1000);
        let result = smart_truncate(&content, OutputCategory::FileContent, 20);
        assert!(result.contains("offset") || result.contains("limit"));
    }

    #[test]
    fn smart_truncate_respects_cap_approximately() {
        let content = "x".repeat(80_000);
        let result = smart_truncate(&content, OutputCategory::Generic, 100);
        assert!(result.len() < 1000);
    }
}
