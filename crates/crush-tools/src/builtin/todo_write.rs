// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::events::{TodoItem, ToolEvent};
use crate::policy::ApprovalPolicy;
use crate::tool::{Tool, ToolCall, ToolOutput};

const STATUSES: &[&str] = &["pending", "in_progress", "completed", "cancelled"];

/// Replaces the session's todo list and notifies the gateway's event stream
/// (C6) so a connected UI can render the update live, rather than waiting
/// for the agent's next turn to report it.
pub struct TodoWriteTool {
    todos: Arc<Mutex<Vec<TodoItem>>>,
    event_tx: mpsc::Sender<ToolEvent>,
}

impl TodoWriteTool {
    pub fn new(todos: Arc<Mutex<Vec<TodoItem>>>, event_tx: mpsc::Sender<ToolEvent>) -> Self {
        Self { todos, event_tx }
    }
}

#[async_trait]
impl Tool for TodoWriteTool {
    fn name(&self) -> &str {
        "todo_write"
    }

    fn description(&self) -> &str {
        "Replace the session's task list with a fresh set of todos.\n\n\
         This is a full replacement, not a patch — always pass every item you want to keep, \
         not just the ones that changed. Don't narrate the update in your reply; the UI \
         reflects the list on its own.\n\n\
         Statuses: pending, in_progress (at most one at a time, enforced here), completed, \
         cancelled.\n\n\
         Reach for this when a request breaks into three or more real steps, spans multiple \
         tool calls, or was handed to you as a list. Skip it for anything answerable in one or \
         two actions, or for purely conversational turns — and don't add a step just to verify \
         work that wasn't asked to be verified.\n\n\
         Good practice: start the first item as in_progress and begin working it in the same \
         turn (e.g. call read_file or glob alongside todo_write); mark an item completed the \
         moment it's actually done rather than batching updates; finish what's in_progress \
         before picking up something new.\n\n\
         Every item needs a unique id, content, and status."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "todos": {
                    "type": "array",
                    "description": "Array of todo items to set (replaces existing list)",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": {
                                "type": "string",
                                "description": "Unique identifier for the task"
                            },
                            "content": {
                                "type": "string",
                                "description": "Description of the task"
                            },
                            "status": {
                                "type": "string",
                                "enum": ["pending", "in_progress", "completed", "cancelled"],
                                "description": "Current status of the task"
                            }
                        },
                        "required": ["id", "content", "status"],
                        "additionalProperties": false
                    }
                }
            },
            "required": ["todos"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let raw = match call.args.get("todos").and_then(|v| v.as_array()) {
            Some(arr) => arr,
            None => return ToolOutput::err(&call.id, "missing 'todos' array"),
        };

        let items = match parse_items(raw) {
            Ok(items) => items,
            Err(e) => return ToolOutput::err(&call.id, e),
        };

        if let Err(e) = check_single_in_progress(&items) {
            return ToolOutput::err(&call.id, e);
        }

        debug!(count = items.len(), "todo_write tool");

        *self.todos.lock().await = items.clone();
        let _ = self.event_tx.send(ToolEvent::TodoUpdate(items.clone())).await;

        ToolOutput::ok(&call.id, render_summary(&items))
    }
}

fn parse_items(raw: &[Value]) -> Result<Vec<TodoItem>, String> {
    raw.iter()
        .map(|item| {
            let id = item.get("id").and_then(|v| v.as_str()).ok_or_else(|| "todo item missing 'id'".to_string())?;
            let content = item
                .get("content")
                .and_then(|v| v.as_str())
                .ok_or_else(|| format!("todo '{id}' missing 'content'"))?;
            let status = item
                .get("status")
                .and_then(|v| v.as_str())
                .ok_or_else(|| format!("todo '{id}' missing 'status'"))?;
            if !STATUSES.contains(&status) {
                return Err(format!("invalid status '{status}' for todo '{id}'"));
            }
            Ok(TodoItem { id: id.to_string(), content: content.to_string(), status: status.to_string() })
        })
        .collect()
}

fn check_single_in_progress(items: &[TodoItem]) -> Result<(), String> {
    let in_progress = items.iter().filter(|t| t.status == "in_progress").count();
    if in_progress > 1 {
        return Err("at most one todo can be 'in_progress' at a time".to_string());
    }
    Ok(())
}

fn render_summary(items: &[TodoItem]) -> String {
    if items.is_empty() {
        return "Todo list cleared.".to_string();
    }
    let lines: Vec<String> = items
        .iter()
        .map(|t| {
            let icon = match t.status.as_str() {
                "completed" => "✓",
                "in_progress" => "→",
                "cancelled" => "✗",
                _ => "○",
            };
            format!("{icon} [{}] {}", t.id, t.content)
        })
        .collect();
    format!("Todos updated:\n{}", lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::tool::{Tool, ToolCall};

    fn make_tool() -> (TodoWriteTool, Arc<Mutex<Vec<TodoItem>>>, mpsc::Receiver<ToolEvent>) {
        let todos = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel(16);
        let tool = TodoWriteTool::new(todos.clone(), tx);
        (tool, todos, rx)
    }

    fn call(args: serde_json::Value) -> ToolCall {
        ToolCall { id: "t1".into(), name: "todo_write".into(), args, session_id: "s1".into() }
    }

    #[tokio::test]
    async fn sets_todos() {
        let (tool, todos, _rx) = make_tool();
        let out = tool
            .execute(&call(json!({
                "todos": [
                    {"id": "1", "content": "do something", "status": "pending"},
                    {"id": "2", "content": "in progress", "status": "in_progress"}
                ]
            })))
            .await;
        assert!(!out.is_error, "{}", out.content);
        let locked = todos.lock().await;
        assert_eq!(locked.len(), 2);
        assert_eq!(locked[0].id, "1");
    }

    #[tokio::test]
    async fn emits_tool_event() {
        let (tool, _todos, mut rx) = make_tool();
        tool.execute(&call(json!({"todos": [{"id": "a", "content": "task", "status": "pending"}]}))).await;
        let event = rx.try_recv().expect("should have emitted event");
        matches!(event, ToolEvent::TodoUpdate(_));
    }

    #[tokio::test]
    async fn rejects_multiple_in_progress() {
        let (tool, _todos, _rx) = make_tool();
        let out = tool
            .execute(&call(json!({
                "todos": [
                    {"id": "1", "content": "a", "status": "in_progress"},
                    {"id": "2", "content": "b", "status": "in_progress"}
                ]
            })))
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("at most one"));
    }

    #[tokio::test]
    async fn missing_todos_is_error() {
        let (tool, _todos, _rx) = make_tool();
        let out = tool.execute(&call(json!({}))).await;
        assert!(out.is_error);
        assert!(out.content.contains("missing 'todos'"));
    }

    #[tokio::test]
    async fn rejects_invalid_status() {
        let (tool, _todos, _rx) = make_tool();
        let out = tool.execute(&call(json!({"todos": [{"id": "1", "content": "x", "status": "bogus"}]}))).await;
        assert!(out.is_error);
        assert!(out.content.contains("invalid status"));
    }
}
