// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::policy::ApprovalPolicy;
use crate::sandbox::{GrepRequest, Sandbox};
use crate::tool::{OutputCategory, Tool, ToolCall, ToolOutput};

/// Pattern search through the C1 sandbox boundary. `rg`-vs-`grep` selection,
/// argument building, and process spawning live in the sandbox backend; this
/// tool only assembles a [`GrepRequest`] from the call arguments.
pub struct GrepTool {
    sandbox: Arc<dyn Sandbox>,
}

impl GrepTool {
    pub fn new(sandbox: Arc<dyn Sandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Pattern search built on ripgrep. Prefer over search_codebase when you know the exact symbol or string.\n\
         pattern: full regex (escape literal braces: \\{\\}). include: glob filter (*.rs, **/*.{ts,tsx}).\n\
         case_sensitive: true by default. limit: 100 by default.\n\
         output_mode: content (default, shows file:line:col:text) | files_with_matches | count\n\
         context_lines: lines of context before+after each match (default 0).\n\
         Use files_with_matches for discovery, then read_file for details.\n\
         For whole-codebase search with .git/target/node_modules auto-excluded → use search_codebase."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Regular expression pattern to search for"
                },
                "path": {
                    "type": "string",
                    "description": "File or directory to search in (default: current directory)"
                },
                "include": {
                    "type": "string",
                    "description": "Glob pattern to filter files, e.g. '*.rs' or '*.{ts,tsx}'"
                },
                "case_sensitive": {
                    "type": "boolean",
                    "description": "Case-sensitive search (default true)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of matches to return (default 100)"
                },
                "output_mode": {
                    "type": "string",
                    "enum": ["content", "files_with_matches", "count"],
                    "description": "Output format: content (default), files_with_matches, or count"
                },
                "context_lines": {
                    "type": "integer",
                    "description": "Lines of context before and after each match (default 0)"
                }
            },
            "required": ["pattern"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }
    fn output_category(&self) -> OutputCategory {
        OutputCategory::MatchList
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let pattern = match call.args.get("pattern").and_then(|v| v.as_str()) {
            Some(p) => p.to_string(),
            None => {
                let args_preview = serde_json::to_string(&call.args).unwrap_or_else(|_| "null".to_string());
                return ToolOutput::err(&call.id, format!("missing required parameter 'pattern'. Received: {args_preview}"));
            }
        };

        let req = GrepRequest {
            pattern,
            path: call.args.get("path").and_then(|v| v.as_str()).unwrap_or(".").to_string(),
            include: call.args.get("include").and_then(|v| v.as_str()).map(str::to_string),
            case_sensitive: call.args.get("case_sensitive").and_then(|v| v.as_bool()).unwrap_or(true),
            output_mode: call.args.get("output_mode").and_then(|v| v.as_str()).unwrap_or("content").to_string(),
            context_lines: call.args.get("context_lines").and_then(|v| v.as_u64()).unwrap_or(0) as usize,
            limit: call.args.get("limit").and_then(|v| v.as_u64()).unwrap_or(100) as usize,
        };

        debug!(pattern = %req.pattern, path = %req.path, output_mode = %req.output_mode, "grep tool");

        match self.sandbox.grep(&call.session_id, req).await {
            Ok(output) if output.trim().is_empty() => ToolOutput::ok(&call.id, "(no matches)"),
            Ok(output) => ToolOutput::ok(&call.id, output),
            Err(e) => ToolOutput::err(&call.id, format!("grep error: {e}")),
        }
    }
}
