// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::policy::ApprovalPolicy;
use crate::sandbox::{Sandbox, SandboxError};
use crate::tool::{Tool, ToolCall, ToolOutput};

/// Deletes a single file through the C1 sandbox boundary. Directory
/// rejection is the sandbox's concern (`SandboxError::IsDirectory`); this
/// tool only turns that into the model-facing hint to use a shell command.
pub struct DeleteFileTool {
    sandbox: Arc<dyn Sandbox>,
}

impl DeleteFileTool {
    pub fn new(sandbox: Arc<dyn Sandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for DeleteFileTool {
    fn name(&self) -> &str {
        "delete_file"
    }

    fn description(&self) -> &str {
        "Delete a single file. Fails gracefully if not found. NEVER delete without explicit user request.\n\
         Permanent — no recovery. For directories use run_terminal_command with rm -r."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute or relative path to the file to delete"
                }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Ask
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let path = match call.args.get("path").and_then(|v| v.as_str()) {
            Some(p) => p.to_string(),
            None => {
                let args_preview = serde_json::to_string(&call.args).unwrap_or_else(|_| "null".to_string());
                return ToolOutput::err(&call.id, format!("missing required parameter 'path'. Received: {args_preview}"));
            }
        };

        debug!(path = %path, "delete_file tool");

        match self.sandbox.delete_file(&call.session_id, &path).await {
            Ok(()) => ToolOutput::ok(&call.id, format!("deleted {path}")),
            Err(SandboxError::IsDirectory(p)) => {
                ToolOutput::err(&call.id, format!("{p} is a directory; use run_terminal_command with 'rm -rf' instead"))
            }
            Err(e) => ToolOutput::err(&call.id, e.to_string()),
        }
    }
}
