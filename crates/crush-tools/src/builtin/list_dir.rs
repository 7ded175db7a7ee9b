// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::policy::ApprovalPolicy;
use crate::sandbox::Sandbox;
use crate::tool::{Tool, ToolCall, ToolOutput};

/// Lists a directory through the C1 sandbox boundary. The walk itself
/// (exclusion list, depth cutoff, trailing-slash convention) lives in the
/// sandbox backend; this tool only turns a [`crate::sandbox::DirListing`]
/// into the text the model sees.
pub struct ListDirTool {
    sandbox: Arc<dyn Sandbox>,
}

impl ListDirTool {
    pub fn new(sandbox: Arc<dyn Sandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List directory contents. depth: default 2, max 5. limit: 100 entries by default.\n\
         Excludes .git/ target/ node_modules/. Directories have trailing /.\n\
         For file pattern search use glob; for content search use grep."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute or relative path to the directory"
                },
                "depth": {
                    "type": "integer",
                    "description": "Maximum recursion depth (default 2, max 5)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of entries to return (default 100)"
                }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let path = match call.args.get("path").and_then(|v| v.as_str()) {
            Some(p) => p.to_string(),
            None => {
                let args_preview = serde_json::to_string(&call.args).unwrap_or_else(|_| "null".to_string());
                return ToolOutput::err(&call.id, format!("missing required parameter 'path'. Received: {args_preview}"));
            }
        };
        let depth = call.args.get("depth").and_then(|v| v.as_u64()).unwrap_or(2).min(5) as usize;
        let limit = call.args.get("limit").and_then(|v| v.as_u64()).unwrap_or(100) as usize;

        debug!(path = %path, depth, limit, "list_dir tool");

        let listing = match self.sandbox.list_dir(&call.session_id, &path, depth, limit).await {
            Ok(l) => l,
            Err(e) => return ToolOutput::err(&call.id, e.to_string()),
        };

        if listing.entries.is_empty() {
            return ToolOutput::ok(&call.id, "(empty directory)");
        }

        let mut output = listing.entries.join("\n");
        if listing.truncated {
            output.push_str(&format!("\n...[output truncated at {limit} entries]"));
        }

        ToolOutput::ok(&call.id, output)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::sandbox::LocalSandbox;
    use crate::tool::{Tool, ToolCall};

    fn call(args: serde_json::Value) -> ToolCall {
        ToolCall { id: "l1".into(), name: "list_dir".into(), args, session_id: "s1".into() }
    }

    fn tool() -> ListDirTool {
        ListDirTool::new(Arc::new(LocalSandbox::new()))
    }

    #[tokio::test]
    async fn lists_directory_contents() {
        let out = tool().execute(&call(json!({"path": "/tmp"}))).await;
        assert!(!out.is_error, "{}", out.content);
    }

    #[tokio::test]
    async fn dirs_have_trailing_slash() {
        use std::sync::atomic::{AtomicU32, Ordering};
        static CTR: AtomicU32 = AtomicU32::new(0);
        let n = CTR.fetch_add(1, Ordering::Relaxed);
        let dir = format!("/tmp/crush_listdir_{}_{n}", std::process::id());
        std::fs::create_dir_all(format!("{dir}/subdir")).unwrap();
        std::fs::write(format!("{dir}/file.txt"), "x").unwrap();

        let out = tool().execute(&call(json!({"path": dir}))).await;
        assert!(out.content.contains("subdir/"), "dirs should have trailing slash");
        assert!(out.content.contains("file.txt"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn missing_dir_path_is_error() {
        let out = tool().execute(&call(json!({}))).await;
        assert!(out.is_error);
        assert!(out.content.contains("missing required parameter 'path'"));
    }

    #[tokio::test]
    async fn depth_zero_shows_only_immediate_children() {
        use std::sync::atomic::{AtomicU32, Ordering};
        static CTR: AtomicU32 = AtomicU32::new(0);
        let n = CTR.fetch_add(1, Ordering::Relaxed);
        let dir = format!("/tmp/crush_listdir_depth_{}_{n}", std::process::id());
        std::fs::create_dir_all(format!("{dir}/subdir/nested")).unwrap();
        std::fs::write(format!("{dir}/top.txt"), "x").unwrap();
        std::fs::write(format!("{dir}/subdir/inner.txt"), "x").unwrap();

        let out = tool().execute(&call(json!({"path": dir, "depth": 0}))).await;
        assert!(out.content.contains("top.txt"));
        assert!(out.content.contains("subdir/"));
        assert!(!out.content.contains("inner.txt"), "inner.txt should not appear at depth=0");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn nonexistent_dir_is_error() {
        let out = tool().execute(&call(json!({"path": "/tmp/crush_no_such_dir_xyzzy_99999"}))).await;
        assert!(out.is_error);
    }
}
