// SPDX-License-Identifier: MIT
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::policy::ApprovalPolicy;
use crate::sandbox::{ExecuteRequest, Sandbox};
use crate::tool::{Tool, ToolCall, ToolOutput};

const OUTPUT_LIMIT: usize = 100_000;

/// Runs a shell command through the C1 sandbox boundary. Process spawning,
/// working-directory handling, and the timeout itself live in the sandbox
/// backend; this tool assembles the request and formats stdout/stderr.
pub struct RunTerminalCommandTool {
    sandbox: Arc<dyn Sandbox>,
    default_timeout_secs: u64,
}

impl RunTerminalCommandTool {
    pub fn new(sandbox: Arc<dyn Sandbox>, default_timeout_secs: u64) -> Self {
        Self { sandbox, default_timeout_secs }
    }
}

#[async_trait]
impl Tool for RunTerminalCommandTool {
    fn name(&self) -> &str {
        "run_terminal_command"
    }

    fn description(&self) -> &str {
        "Run a shell command inside the session sandbox — for build tools, package managers, \
         git, and anything else that isn't a plain file read/write.\n\n\
         Stick to specialized tools for file work: read_file, write, edit_file, grep, and glob \
         all operate on the same sandboxed filesystem and produce cleaner, more structured \
         results than piping through cat/sed/grep/find here. Reach for ripgrep ('rg') rather \
         than plain grep if you do need an ad-hoc search inside a command pipeline.\n\n\
         Quote any path containing spaces. Chain dependent steps with '&&'; run independent \
         commands as separate calls so they can execute in parallel. The default timeout is \
         set by the session configuration — pass timeout_secs to override it for a slow build \
         or test run rather than letting it fail and retrying.\n\n\
         Git and review-tool usage follows the same discipline an engineer would apply by hand: \
         never rewrite published history, never skip hooks or force-push without being asked, \
         and never fold an amend onto a commit that already went to a remote. Stage specific \
         paths rather than blanket-adding the whole tree, and leave the decision to push, open \
         a merge request, or open a PR to an explicit user request.\n\n\
         Output is capped at 100,000 characters per stream; anything past that is truncated. \
         A non-zero exit status is reported as an error so it's visible without separately \
         checking the exit code."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "workdir": {
                    "type": "string",
                    "description": "Working directory (optional, defaults to cwd)"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Execution timeout in seconds (optional)"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Ask
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let command = match call.args.get("command").and_then(|v| v.as_str()) {
            Some(c) => c.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'command' argument"),
        };
        let workdir = call.args.get("workdir").and_then(|v| v.as_str()).map(str::to_string);
        let timeout_secs = call.args.get("timeout_secs").and_then(|v| v.as_u64()).unwrap_or(self.default_timeout_secs);

        debug!(cmd = %command, "run_terminal_command tool");

        let req = ExecuteRequest { cmd: command, workdir, timeout: Duration::from_secs(timeout_secs) };

        match self.sandbox.execute(&call.session_id, req).await {
            Ok(out) => render(&out, timeout_secs, &call.id),
            Err(e) => ToolOutput::err(&call.id, e.to_string()),
        }
    }
}

fn render(out: &crate::sandbox::ExecuteOutput, timeout_secs: u64, call_id: &str) -> ToolOutput {
    let mut content = String::new();
    if !out.stdout.is_empty() {
        content.push_str(&truncate(&out.stdout, OUTPUT_LIMIT));
    }
    if !out.stderr.is_empty() {
        if !content.is_empty() {
            content.push('\n');
        }
        content.push_str("[stderr]\n");
        content.push_str(&truncate(&out.stderr, OUTPUT_LIMIT));
    }
    if content.is_empty() {
        content = format!("[exit {}]", out.exit_code);
    }
    let _ = timeout_secs;

    if out.exit_code == 0 {
        ToolOutput::ok(call_id, content)
    } else {
        ToolOutput::err(call_id, format!("[exit {}]\n{content}", out.exit_code))
    }
}

fn truncate(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        s.to_string()
    } else {
        format!("{}...[truncated {} bytes]", &s[..limit], s.len() - limit)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::sandbox::LocalSandbox;
    use crate::tool::{Tool, ToolCall};

    fn call(args: serde_json::Value) -> ToolCall {
        ToolCall { id: "t1".into(), name: "run_terminal_command".into(), args, session_id: "s1".into() }
    }

    fn tool() -> RunTerminalCommandTool {
        RunTerminalCommandTool::new(Arc::new(LocalSandbox::new()), 30)
    }

    #[tokio::test]
    async fn executes_echo_and_returns_stdout() {
        let out = tool().execute(&call(json!({"command": "echo hello"}))).await;
        assert!(!out.is_error);
        assert!(out.content.contains("hello"));
    }

    #[tokio::test]
    async fn captures_stderr() {
        let out = tool().execute(&call(json!({"command": "echo err >&2"}))).await;
        assert!(out.content.contains("err"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_error() {
        let out = tool().execute(&call(json!({"command": "exit 1"}))).await;
        assert!(out.is_error);
        assert!(out.content.contains("[exit 1]"));
    }

    #[tokio::test]
    async fn missing_command_is_error() {
        let out = tool().execute(&call(json!({}))).await;
        assert!(out.is_error);
        assert!(out.content.contains("missing 'command'"));
    }

    #[tokio::test]
    async fn timeout_returns_error() {
        let t = RunTerminalCommandTool::new(Arc::new(LocalSandbox::new()), 1);
        let out = t.execute(&call(json!({"command": "sleep 60", "timeout_secs": 1}))).await;
        assert!(out.is_error);
        assert!(out.content.contains("timeout"));
    }
}
