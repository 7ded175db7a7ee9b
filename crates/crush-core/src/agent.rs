// SPDX-License-Identifier: MIT
use std::sync::Arc;

use anyhow::Context;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crush_config::{AgentConfig, CompactionStrategy};
use crush_model::{CompletionRequest, ModelProvider, ResponseEvent};
use crush_tools::{ApprovalPolicy, ToolOutput, ToolPolicy, ToolRegistry};

use crate::{
    compact::{compact_session_with_strategy, emergency_compact, smart_truncate},
    events::{AgentEvent, CompactionStrategyUsed, GenerationOutcome},
    permission::{PermissionDecision, PermissionGate, PermissionRequest},
    prompts::{system_prompt, PromptContext},
    runtime_context::AgentRuntimeContext,
    session::{Message, Role, Session},
};

/// The agent loop (C7): owns one session and drives the model <-> tool
/// dispatch cycle for a single generation at a time.
///
/// Per the concurrency model's single-writer discipline, only this loop
/// mutates `session.messages` / `session.todos` / `session.version` — every
/// other actor (the session coordinator, the permission arbiter) talks to it
/// through the `tx` event channel or the permission gate.
pub struct Agent {
    session: Session,
    tools: Arc<ToolRegistry>,
    policy: Arc<ToolPolicy>,
    model: Arc<dyn ModelProvider>,
    config: Arc<AgentConfig>,
    runtime: AgentRuntimeContext,
    permission_gate: Arc<dyn PermissionGate>,
    tool_event_rx: mpsc::Receiver<crush_tools::ToolEvent>,
}

impl Agent {
    pub fn new(
        model: Arc<dyn ModelProvider>,
        tools: Arc<ToolRegistry>,
        policy: Arc<ToolPolicy>,
        config: Arc<AgentConfig>,
        runtime: AgentRuntimeContext,
        permission_gate: Arc<dyn PermissionGate>,
        tool_event_rx: mpsc::Receiver<crush_tools::ToolEvent>,
        max_context_tokens: usize,
    ) -> Self {
        let max_output_tokens = model.catalog_max_output_tokens().unwrap_or(0) as usize;
        let mut session = Session::new(max_context_tokens);
        session.max_output_tokens = max_output_tokens;
        Self {
            session,
            tools,
            policy,
            model,
            config,
            runtime,
            permission_gate,
            tool_event_rx,
        }
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Push a user message, run the agent loop, and stream events through
    /// `tx`. The caller drops the receiver when it is no longer interested
    /// (e.g. on disconnect — the loop keeps running and its effects are
    /// still applied to the session, matching `Cancel`'s "side effects not
    /// rolled back" semantics).
    pub async fn submit(
        &mut self,
        user_input: &str,
        tx: mpsc::Sender<AgentEvent>,
    ) -> anyhow::Result<()> {
        self.ensure_fits_budget(&tx, 0).await?;
        if self.session.messages.is_empty() {
            self.session.push(self.system_message());
        }
        self.session.push(Message::user(&self.session.id, user_input));
        self.run_agentic_loop(tx, None).await
    }

    /// Like [`submit`] but cancellable: when `cancel` resolves, the current
    /// streaming turn is interrupted at the next `await` point. Any text
    /// already streamed is committed to the session as a finished assistant
    /// message and `AgentEvent::GenerationComplete(Cancelled)` is emitted.
    pub async fn submit_with_cancel(
        &mut self,
        user_input: &str,
        tx: mpsc::Sender<AgentEvent>,
        cancel: oneshot::Receiver<()>,
    ) -> anyhow::Result<()> {
        self.ensure_fits_budget(&tx, 0).await?;
        if self.session.messages.is_empty() {
            self.session.push(self.system_message());
        }
        self.session.push(Message::user(&self.session.id, user_input));
        self.run_agentic_loop(tx, Some(cancel)).await
    }

    /// Replace session history with the given messages, then submit a new
    /// user turn. Used for edit-and-resubmit: the caller sends truncated
    /// history plus new user content. Prepends the system message if the
    /// list does not start with one.
    pub async fn replace_history_and_submit(
        &mut self,
        messages: Vec<Message>,
        new_user_content: &str,
        tx: mpsc::Sender<AgentEvent>,
    ) -> anyhow::Result<()> {
        let mut msgs = messages;
        if msgs.is_empty() || msgs[0].role != Role::System {
            msgs.insert(0, self.system_message());
        }
        self.session.replace_messages(msgs);
        self.ensure_fits_budget(&tx, 0).await?;
        self.session.push(Message::user(&self.session.id, new_user_content));
        self.run_agentic_loop(tx, None).await
    }

    /// Pre-load conversation history into the session without submitting.
    /// System messages in `messages` are stripped — the correct system
    /// message is injected automatically on the next `submit`.
    pub fn seed_history(&mut self, messages: Vec<Message>) {
        let mut msgs: Vec<Message> = messages.into_iter().filter(|m| m.role != Role::System).collect();
        if !msgs.is_empty() {
            msgs.insert(0, self.system_message());
            self.session.replace_messages(msgs);
        }
    }

    /// Main loop body, shared by cancellable and non-cancellable entry
    /// points. `cancel: None` disables cancellation checks entirely.
    async fn run_agentic_loop(
        &mut self,
        tx: mpsc::Sender<AgentEvent>,
        mut cancel: Option<oneshot::Receiver<()>>,
    ) -> anyhow::Result<()> {
        let mut rounds = 0u32;

        loop {
            if let Some(c) = cancel.as_mut() {
                if !matches!(c.try_recv(), Err(oneshot::error::TryRecvError::Empty)) {
                    let _ = tx
                        .send(AgentEvent::GenerationComplete(GenerationOutcome::Cancelled))
                        .await;
                    return Ok(());
                }
            }

            rounds += 1;
            if rounds > self.config.max_tool_rounds {
                let wrap_msg = format!(
                    "You have reached the maximum tool-call budget ({} rounds). \
                     Do not call any more tools. Write a concise summary of: \
                     (1) what has been completed, (2) what still remains, \
                     and (3) how to continue.",
                    self.config.max_tool_rounds
                );
                self.session.push(Message::user(&self.session.id, &wrap_msg));
                self.session.schema_overhead = self.estimate_schema_overhead();
                let (text, _) = self.stream_one_turn(tx.clone(), false).await?;
                if !text.is_empty() {
                    self.session.push(Message::assistant_text(&self.session.id, &text));
                }
                let _ = tx
                    .send(AgentEvent::GenerationComplete(GenerationOutcome::Ok {
                        reason: "max_tool_rounds".into(),
                    }))
                    .await;
                break;
            }

            self.session.schema_overhead = self.estimate_schema_overhead();
            let turn = match cancel.as_mut() {
                Some(c) => {
                    tokio::select! {
                        biased;
                        _ = c => None,
                        result = self.stream_one_turn(tx.clone(), true) => Some(result),
                    }
                }
                None => Some(self.stream_one_turn(tx.clone(), true).await),
            };

            let (text, tool_calls) = match turn {
                None => {
                    let _ = tx
                        .send(AgentEvent::GenerationComplete(GenerationOutcome::Cancelled))
                        .await;
                    return Ok(());
                }
                Some(Err(e)) => {
                    let _ = tx
                        .send(AgentEvent::GenerationComplete(GenerationOutcome::Error {
                            message: e.to_string(),
                        }))
                        .await;
                    return Err(e);
                }
                Some(Ok(t)) => t,
            };

            if !text.is_empty() {
                self.session.push(Message::assistant_text(&self.session.id, &text));
            }

            if tool_calls.is_empty() {
                let _ = tx
                    .send(AgentEvent::GenerationComplete(GenerationOutcome::Ok {
                        reason: "stop".into(),
                    }))
                    .await;
                break;
            }

            self.dispatch_tool_calls(&tx, tool_calls).await;
            self.ensure_fits_budget(&tx, rounds).await?;
        }

        Ok(())
    }

    /// Run all tool calls from one model turn through the dispatch pipeline:
    /// resolve policy, request permission for `Ask`-level calls, execute the
    /// ones that are authorized, and push a `ToolResult` message for every
    /// call regardless of outcome (`I-TOOLCALL-RESOLVED`).
    async fn dispatch_tool_calls(
        &mut self,
        tx: &mpsc::Sender<AgentEvent>,
        tool_calls: Vec<crush_tools::ToolCall>,
    ) {
        // Phase 1: push all assistant tool-call messages before any result,
        // so parallel tool calls serialize correctly in the provider wire
        // format.
        for tc in &tool_calls {
            let _ = tx.send(AgentEvent::ToolCallStarted(tc.clone())).await;
            self.session.push(Message::assistant_tool_call(
                &self.session.id,
                &tc.id,
                &tc.name,
                tc.args.to_string(),
            ));
        }

        // Phase 2: resolve policy + permission for every call up front, then
        // dispatch the authorized ones concurrently (producer order
        // preserved since `tokio::spawn` results are awaited in index order).
        let mut authorized: Vec<bool> = Vec::with_capacity(tool_calls.len());
        let mut denial_reason: Vec<Option<&'static str>> = Vec::with_capacity(tool_calls.len());
        for tc in &tool_calls {
            let decision = self.resolve_permission(tc).await;
            match decision {
                Outcome::Run => {
                    authorized.push(true);
                    denial_reason.push(None);
                }
                Outcome::Denied => {
                    authorized.push(false);
                    denial_reason.push(Some("denied_by_policy"));
                }
                Outcome::PermissionDenied => {
                    authorized.push(false);
                    denial_reason.push(Some("denied"));
                }
                Outcome::PermissionTimedOut => {
                    authorized.push(false);
                    denial_reason.push(Some("timed_out"));
                }
            }
        }

        let mut tasks: Vec<Option<tokio::task::JoinHandle<ToolOutput>>> =
            Vec::with_capacity(tool_calls.len());
        for (tc, run) in tool_calls.iter().zip(authorized.iter()) {
            if *run {
                let registry = Arc::clone(&self.tools);
                let tc = tc.clone();
                tasks.push(Some(tokio::spawn(async move { registry.execute(&tc).await })));
            } else {
                tasks.push(None);
            }
        }

        let mut outputs: Vec<ToolOutput> = Vec::with_capacity(tool_calls.len());
        for (i, task) in tasks.into_iter().enumerate() {
            let output = match task {
                None => {
                    let tag = denial_reason[i].unwrap_or("denied");
                    ToolOutput::err_tagged(
                        &tool_calls[i].id,
                        format!("tool call denied: {tag} (tool: {})", tool_calls[i].name),
                        tag,
                    )
                }
                Some(task) => match task.await {
                    Ok(o) => o,
                    Err(e) => ToolOutput::err(&tool_calls[i].id, format!("tool panicked: {e}")),
                },
            };
            self.drain_tool_events(tx).await;
            let _ = tx
                .send(AgentEvent::ToolCallFinished {
                    call_id: tool_calls[i].id.clone(),
                    tool_name: tool_calls[i].name.clone(),
                    output: output.content.clone(),
                    is_error: output.is_error,
                })
                .await;
            outputs.push(output);
        }

        // Phase 3: push tool-result messages, applying smart truncation when
        // a result exceeds the configured token cap.
        let cap = self.config.tool_result_token_cap;
        for ((tc, output), denial) in tool_calls.iter().zip(outputs.iter()).zip(denial_reason.iter()) {
            let category = self.tools.get(&tc.name).map(|t| t.output_category()).unwrap_or_default();
            let content = smart_truncate(&output.content, category, cap);
            let metadata = if output.is_error {
                let tag = denial.map(|d| d.to_string()).or_else(|| output.error_tag.clone());
                Some(serde_json::json!({ "class": "policy", "tag": tag }))
            } else {
                None
            };
            let msg = match metadata {
                Some(meta) => Message::tool_result_with_metadata(
                    &self.session.id,
                    &tc.id,
                    &tc.name,
                    content,
                    true,
                    meta,
                ),
                None => Message::tool_result(&self.session.id, &tc.id, &tc.name, content, output.is_error),
            };
            self.session.push(msg);
        }
    }

    async fn resolve_permission(&self, tc: &crush_tools::ToolCall) -> Outcome {
        let Some(tool) = self.tools.get(&tc.name) else {
            return Outcome::Denied;
        };
        let effective = match tool.default_policy() {
            ApprovalPolicy::Deny => ApprovalPolicy::Deny,
            ApprovalPolicy::Auto => ApprovalPolicy::Auto,
            ApprovalPolicy::Ask => {
                // Shell commands get glob-based auto-approval from the
                // configured allow/deny pattern lists; other tools always
                // prompt when their default policy is Ask.
                if let Some(cmd) = tc.args.get("command").and_then(|v| v.as_str()) {
                    self.policy.decide(cmd)
                } else {
                    ApprovalPolicy::Ask
                }
            }
        };

        match effective {
            ApprovalPolicy::Deny => Outcome::Denied,
            ApprovalPolicy::Auto => Outcome::Run,
            ApprovalPolicy::Ask => {
                let req = PermissionRequest {
                    session_id: self.session.id.clone(),
                    tool_call_id: tc.id.clone(),
                    tool_name: tc.name.clone(),
                    description: tc.args.to_string(),
                    params: tc.args.clone(),
                };
                match self.permission_gate.request(req).await {
                    PermissionDecision::Granted => Outcome::Run,
                    PermissionDecision::Denied => Outcome::PermissionDenied,
                    PermissionDecision::TimedOut => Outcome::PermissionTimedOut,
                }
            }
        }
    }

    async fn drain_tool_events(&mut self, tx: &mpsc::Sender<AgentEvent>) {
        while let Ok(te) = self.tool_event_rx.try_recv() {
            match te {
                crush_tools::ToolEvent::TodoUpdate(todos) => {
                    self.session.todos = todos.clone();
                    let _ = tx.send(AgentEvent::TodoUpdate(todos)).await;
                }
            }
        }
    }

    /// Call the model once, streaming text deltas and collecting tool-call
    /// events. Returns `(full_text, tool_calls)`.
    async fn stream_one_turn(
        &mut self,
        tx: mpsc::Sender<AgentEvent>,
        with_tools: bool,
    ) -> anyhow::Result<(String, Vec<crush_tools::ToolCall>)> {
        let tools: Vec<crush_model::ToolSchema> = if with_tools {
            self.tools
                .schemas()
                .into_iter()
                .map(|s| crush_model::ToolSchema {
                    name: s.name,
                    description: s.description,
                    parameters: s.parameters,
                })
                .collect()
        } else {
            vec![]
        };

        let messages: Vec<crush_model::Message> =
            self.session.messages.iter().flat_map(Message::to_wire).collect();

        let req = CompletionRequest {
            messages,
            tools,
            stream: true,
            system_dynamic_suffix: self.dynamic_context(),
        };

        let mut stream = self
            .model
            .complete(req)
            .await
            .context("model completion failed")?;

        let mut full_text = String::new();
        let mut tool_calls: Vec<crush_tools::ToolCall> = Vec::new();
        // Keyed by a locally-assigned sequence number: a non-empty `id` or
        // `name` signals the start of a new call, so consecutive
        // argument-only deltas (empty id and name) accumulate onto the most
        // recently started one.
        let mut pending_tcs: Vec<PendingToolCall> = Vec::new();

        while let Some(event) = stream.next().await {
            match event? {
                ResponseEvent::TextDelta(delta) if !delta.is_empty() => {
                    full_text.push_str(&delta);
                    let _ = tx.send(AgentEvent::MessageDelta(delta)).await;
                }
                ResponseEvent::TextDelta(_) => {}
                ResponseEvent::ThinkingDelta(delta) => {
                    let _ = tx.send(AgentEvent::ReasoningDelta(delta)).await;
                }
                ResponseEvent::ToolCall { id, name, arguments } => {
                    let starts_new_call = !id.is_empty() || pending_tcs.is_empty();
                    if starts_new_call {
                        pending_tcs.push(PendingToolCall {
                            id,
                            name,
                            args_buf: arguments,
                        });
                    } else {
                        let ptc = pending_tcs.last_mut().expect("checked non-empty above");
                        if !name.is_empty() {
                            ptc.name = name;
                        }
                        ptc.args_buf.push_str(&arguments);
                    }
                }
                ResponseEvent::Usage {
                    input_tokens,
                    output_tokens,
                    cache_read_tokens,
                    cache_write_tokens,
                } => {
                    self.session.add_cache_usage(cache_read_tokens, cache_write_tokens);
                    let actual_input = input_tokens + cache_read_tokens;
                    if actual_input > 0 {
                        let estimated = self.session.token_count + self.session.schema_overhead;
                        self.session.update_calibration(actual_input, estimated);
                    }
                    let _ = tx
                        .send(AgentEvent::TokenUsage {
                            input: input_tokens,
                            output: output_tokens,
                            context_total: self.session.token_count,
                            cache_read: cache_read_tokens,
                            cache_write: cache_write_tokens,
                        })
                        .await;
                }
                ResponseEvent::Done => break,
                ResponseEvent::Error(e) => {
                    warn!("model stream error: {e}");
                    let _ = tx.send(AgentEvent::Error(e)).await;
                }
            }
        }

        for (i, ptc) in pending_tcs.into_iter().enumerate() {
            if ptc.name.is_empty() {
                warn!(tool_call_id = %ptc.id, "dropping tool call with empty name from model");
                continue;
            }
            let mut tc = ptc.finish(&self.session.id);
            if tc.id.is_empty() {
                tc.id = format!("tc_synthetic_{i}");
            }
            tool_calls.push(tc);
        }

        if !full_text.is_empty() {
            let _ = tx.send(AgentEvent::MessageComplete(full_text.clone())).await;
        }

        Ok((full_text, tool_calls))
    }

    async fn run_single_turn(&mut self, tx: mpsc::Sender<AgentEvent>) -> anyhow::Result<String> {
        let (text, _) = self.stream_one_turn(tx, false).await?;
        Ok(text)
    }

    /// Estimate the token overhead of items sent with every request but not
    /// stored in `session.messages`: tool schemas and the dynamic context
    /// block.
    fn estimate_schema_overhead(&self) -> usize {
        let schema_tokens: usize = self
            .tools
            .schemas()
            .iter()
            .map(|s| (s.name.len() + s.description.len() + s.parameters.to_string().len()) / 4)
            .sum();
        let dynamic_tokens = self.dynamic_context().map(|s| s.len() / 4).unwrap_or(0);
        schema_tokens + dynamic_tokens
    }

    /// Single compaction entry point. Checks the effective token budget and
    /// compacts the session if needed — called before every submission and
    /// after every batch of tool results.
    async fn ensure_fits_budget(
        &mut self,
        tx: &mpsc::Sender<AgentEvent>,
        turn: u32,
    ) -> anyhow::Result<()> {
        let input_budget = self.session.input_budget();
        if input_budget == 0 {
            return Ok(());
        }

        let threshold = (self.config.compaction_threshold - self.config.compaction_overhead_reserve).max(0.1);
        if !self.session.is_near_limit(threshold) {
            return Ok(());
        }

        let tokens_before = self.session.token_count;
        let sys = self.system_message();
        let keep_n = self.config.compaction_keep_recent;

        let non_system: Vec<Message> = self
            .session
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .cloned()
            .collect();

        let preserve_count = if non_system.len() > keep_n * 2 { keep_n } else { 0 };
        let mut summarize_count = non_system.len().saturating_sub(preserve_count);

        // Never split inside a tool-call / tool-result pair — move the split
        // point backward until it lands on a clean turn boundary so the
        // compacted session never references a ToolResult whose ToolCall
        // was summarized away.
        while summarize_count > 0 && summarize_count < non_system.len() {
            let has_tool_content = non_system[summarize_count]
                .parts
                .iter()
                .any(|p| matches!(p, crate::session::Part::ToolCall { .. } | crate::session::Part::ToolResult { .. }));
            if has_tool_content {
                summarize_count -= 1;
            } else {
                break;
            }
        }

        let recent_raw_tokens: usize = non_system[summarize_count..].iter().map(Message::approx_tokens).sum();
        let compaction_input_raw = self.session.token_count.saturating_sub(recent_raw_tokens);
        let calibrated_compaction_input =
            (compaction_input_raw as f32 * self.session.calibration_factor) as usize;
        let emergency_fraction = 0.95_f32;
        let compaction_would_overflow = summarize_count == 0
            || (calibrated_compaction_input as f32 / input_budget as f32) >= emergency_fraction;

        let strategy_used = if compaction_would_overflow {
            emergency_compact(&mut self.session.messages, Some(sys), keep_n);
            self.session.recalculate_tokens();
            CompactionStrategyUsed::Emergency
        } else {
            let original_messages = self.session.messages.clone();
            let original_token_count = self.session.token_count;

            let recent_messages: Vec<Message> = non_system[summarize_count..].to_vec();
            let mut to_compact: Vec<Message> = non_system[..summarize_count].to_vec();

            compact_session_with_strategy(&mut to_compact, Some(sys.clone()), &self.config.compaction_strategy);
            self.session.messages = to_compact;
            self.session.recalculate_tokens();

            match self.run_single_turn(tx.clone()).await {
                Ok(summary) if !summary.is_empty() => {
                    self.session.messages.clear();
                    self.session.messages.push(sys);
                    self.session
                        .messages
                        .push(Message::assistant_text(&self.session.id, summary));
                    self.session.messages.extend(recent_messages);
                    self.session.recalculate_tokens();

                    match &self.config.compaction_strategy {
                        CompactionStrategy::Structured => CompactionStrategyUsed::Structured,
                        CompactionStrategy::Narrative => CompactionStrategyUsed::Narrative,
                    }
                }
                outcome => {
                    if let Err(ref e) = outcome {
                        warn!("compaction model call failed, falling back to emergency compact: {e}");
                    } else {
                        warn!("compaction returned empty summary, falling back to emergency compact");
                    }
                    self.session.messages = original_messages;
                    self.session.token_count = original_token_count;
                    emergency_compact(&mut self.session.messages, Some(sys), keep_n);
                    self.session.recalculate_tokens();
                    CompactionStrategyUsed::Emergency
                }
            }
        };

        let _ = strategy_used;
        let _ = turn;
        let _ = tx
            .send(AgentEvent::ContextCompacted {
                tokens_before,
                tokens_after: self.session.token_count,
            })
            .await;

        Ok(())
    }

    pub fn current_system_message(&self) -> Message {
        self.system_message()
    }

    fn system_message(&self) -> Message {
        let ctx = self.prompt_context();
        let stable_ctx = ctx.stable_only();
        let text = system_prompt(self.config.system_prompt.as_deref(), stable_ctx);
        Message::system(&self.session.id, text)
    }

    fn prompt_context(&self) -> PromptContext<'_> {
        PromptContext {
            project_root: self.runtime.project_root.as_deref(),
            git_context: self.runtime.git_context_note.as_deref(),
            append: self.runtime.append_system_prompt.as_deref(),
        }
    }

    fn dynamic_context(&self) -> Option<String> {
        if self.config.system_prompt.is_some() {
            return None;
        }
        self.runtime.git_context_note.clone()
    }
}

/// Which permission-resolution path a tool call took.
enum Outcome {
    Run,
    Denied,
    PermissionDenied,
    PermissionTimedOut,
}

struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
}

impl PendingToolCall {
    fn finish(self, session_id: &str) -> crush_tools::ToolCall {
        let args = if self.args_buf.is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            match serde_json::from_str(&self.args_buf) {
                Ok(v) => v,
                Err(parse_err) => match attempt_json_repair(&self.args_buf) {
                    Ok(v) => v,
                    Err(_) => {
                        warn!(
                            tool_name = %self.name,
                            tool_call_id = %self.id,
                            error = %parse_err,
                            "model sent tool call with invalid JSON arguments; substituting {{}}"
                        );
                        serde_json::Value::Object(Default::default())
                    }
                },
            }
        };
        crush_tools::ToolCall {
            id: self.id,
            name: self.name,
            args,
            session_id: session_id.to_string(),
        }
    }
}

/// Attempt to repair common JSON syntax errors in model-emitted tool
/// arguments: invalid escape sequences, a missing comma between key-value
/// pairs, or a truncated trailing brace/quote.
fn attempt_json_repair(json_str: &str) -> anyhow::Result<serde_json::Value> {
    let fixed = fix_invalid_json_escapes(json_str);
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(&fixed) {
        return Ok(v);
    }

    let repaired = regex::Regex::new(r#""([^"]+)"([a-zA-Z_][a-zA-Z0-9_]*)":\s*"#)
        .unwrap()
        .replace_all(&fixed, r#""$1", "$2": "#);
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(&repaired) {
        return Ok(v);
    }

    if !fixed.trim().ends_with('}') {
        let mut completed = fixed.clone();
        let quote_count = fixed.chars().filter(|&c| c == '"').count();
        if quote_count % 2 == 1 {
            completed.push('"');
        }
        if !completed.trim().ends_with('}') {
            completed.push('}');
        }
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(&completed) {
            return Ok(v);
        }
    }

    anyhow::bail!("JSON repair failed: all repair strategies exhausted")
}

/// Replace any JSON-string escape sequence other than `" \ / b f n r t u`
/// with a doubled backslash so the string round-trips through serde_json.
fn fix_invalid_json_escapes(json_str: &str) -> String {
    let mut result = String::with_capacity(json_str.len() + 16);
    let mut chars = json_str.chars();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            match c {
                '\\' => match chars.next() {
                    Some(next) if matches!(next, '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u') => {
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
