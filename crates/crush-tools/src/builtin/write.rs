// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::file_history::FileHistory;
use crate::policy::ApprovalPolicy;
use crate::sandbox::Sandbox;
use crate::tool::{Tool, ToolCall, ToolOutput};

/// Writes/overwrites a file through the C1 sandbox boundary, recording the
/// resulting content in C2 (so the next edit has a version to diff against)
/// and requesting fresh diagnostics for the written path (SPEC_FULL.md
/// §4.4 step 6).
pub struct WriteTool {
    sandbox: Arc<dyn Sandbox>,
    pub history: Arc<FileHistory>,
}

impl WriteTool {
    pub fn new(sandbox: Arc<dyn Sandbox>, history: Arc<FileHistory>) -> Self {
        Self { sandbox, history }
    }
}

#[async_trait]
impl Tool for WriteTool {
    fn name(&self) -> &str { "write" }

    fn description(&self) -> &str {
        "Writes a file to the local filesystem. This tool will overwrite the existing file if \
         one exists at the provided path. ALWAYS prefer editing existing files with edit_file. \
         NEVER write new files unless explicitly required. \
         NEVER proactively create documentation or README files unless explicitly requested. \
         Creates parent directories automatically. \
         Set append=true to add to the end of an existing file instead of overwriting."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute or relative path to the file"
                },
                "content": {
                    "type": "string",
                    "description": "Content to write to the file"
                },
                "append": {
                    "type": "boolean",
                    "description": "If true, append to existing content instead of overwriting (default false)"
                }
            },
            "required": ["path", "content"]
        })
    }

    fn default_policy(&self) -> ApprovalPolicy { ApprovalPolicy::Ask }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let path = match call.args.get("path").and_then(|v| v.as_str()) {
            Some(p) => p.to_string(),
            None => {
                let args_preview = serde_json::to_string(&call.args)
                    .unwrap_or_else(|_| "null".to_string());
                return ToolOutput::err(
                    &call.id,
                    format!("missing required parameter 'path'. Received: {}", args_preview)
                );
            }
        };
        let content = match call.args.get("content").and_then(|v| v.as_str()) {
            Some(c) => c.to_string(),
            None => {
                let args_preview = serde_json::to_string(&call.args)
                    .unwrap_or_else(|_| "null".to_string());
                return ToolOutput::err(
                    &call.id,
                    format!("missing required parameter 'content'. Received: {}", args_preview)
                );
            }
        };
        let should_append = call.args.get("append").and_then(|v| v.as_bool()).unwrap_or(false);

        debug!(path = %path, append = should_append, "write tool");

        let existing = self.sandbox.read_file(&call.session_id, &path).await.ok().map(|o| o.content);
        if let Some(existing) = &existing {
            self.history.sync_with_sandbox(&call.session_id, &path, existing);
        }

        let new_content = if should_append {
            format!("{}{content}", existing.unwrap_or_default())
        } else {
            content.clone()
        };

        if let Err(e) = self.sandbox.write_file(&call.session_id, &path, &new_content).await {
            return ToolOutput::err(&call.id, e.to_string());
        }

        let diff = self.history.append_version(&call.session_id, &path, &new_content);
        let verb = if should_append { "appended" } else { "wrote" };
        let mut summary = format!("{verb} {} bytes to {path}", content.len());
        if let Some(d) = diff {
            summary.push_str(&format!(" (+{}/-{})", d.additions, d.removals));
        }

        if let Ok(diagnostics) = self.sandbox.get_lsp_diagnostics(&call.session_id, &path).await {
            if !diagnostics.is_empty() {
                summary.push_str("\n\ndiagnostics:");
                for d in diagnostics {
                    summary.push_str(&format!("\n  {}:{} [{}] {}", d.path, d.line, d.severity, d.message));
                }
            }
        }

        ToolOutput::ok(&call.id, summary)
    }
}
