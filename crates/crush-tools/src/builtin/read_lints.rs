// SPDX-License-Identifier: MIT
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::policy::ApprovalPolicy;
use crate::sandbox::{ExecuteRequest, Sandbox};
use crate::tool::{OutputCategory, Tool, ToolCall, ToolOutput};

const LINT_TIMEOUT: Duration = Duration::from_secs(60);

/// Runs the project's linter/type-checker through the C1 sandbox boundary.
/// Project-type detection walks ancestor directories via `sandbox.exists`
/// rather than the host filesystem directly; the actual `cargo check` /
/// `tsc` / `ruff` invocation goes through `sandbox.execute`.
pub struct ReadLintsTool {
    sandbox: Arc<dyn Sandbox>,
}

impl ReadLintsTool {
    pub fn new(sandbox: Arc<dyn Sandbox>) -> Self {
        Self { sandbox }
    }

    async fn detect_project_type(&self, session_id: &str, workdir: &str) -> Option<&'static str> {
        let mut current = std::path::PathBuf::from(workdir);
        loop {
            if self.sandbox.exists(session_id, current.join("Cargo.toml").to_str()?).await {
                return Some("rust");
            }
            if self.sandbox.exists(session_id, current.join("package.json").to_str()?).await {
                return Some("typescript");
            }
            if self.sandbox.exists(session_id, current.join("pyproject.toml").to_str()?).await
                || self.sandbox.exists(session_id, current.join("setup.py").to_str()?).await
            {
                return Some("python");
            }
            if !current.pop() {
                return None;
            }
        }
    }

    async fn run(&self, session_id: &str, workdir: &str, cmd: &str) -> String {
        let req = ExecuteRequest { cmd: cmd.to_string(), workdir: Some(workdir.to_string()), timeout: LINT_TIMEOUT };
        match self.sandbox.execute(session_id, req).await {
            Ok(out) => format!("{}{}", out.stdout, out.stderr),
            Err(e) => format!("lint command failed: {e}"),
        }
    }

    async fn cargo_check(&self, session_id: &str, workdir: &str) -> String {
        let combined = self.run(session_id, workdir, "cargo check --message-format short").await;
        let filtered: Vec<&str> = combined.lines().filter(|l| l.contains("error") || l.contains("warning")).collect();
        if filtered.is_empty() {
            "(no issues)".to_string()
        } else {
            filtered.join("\n")
        }
    }

    async fn tsc(&self, session_id: &str, workdir: &str) -> String {
        let combined = self.run(session_id, workdir, "npx tsc --noEmit --pretty false").await;
        if combined.trim().is_empty() {
            "(no issues)".to_string()
        } else {
            combined
        }
    }

    async fn ruff(&self, session_id: &str, workdir: &str, paths: &[String]) -> String {
        let target = if paths.is_empty() { ".".to_string() } else { paths.join(" ") };
        let combined = self.run(session_id, workdir, &format!("ruff check --output-format concise {target}")).await;
        if combined.trim().is_empty() {
            "(no issues)".to_string()
        } else {
            combined
        }
    }
}

#[async_trait]
impl Tool for ReadLintsTool {
    fn name(&self) -> &str {
        "read_lints"
    }

    fn description(&self) -> &str {
        "Get linter diagnostics for files or directories. No paths → whole workspace.\n\
         workdir: set to project root for correct relative path resolution.\n\
         ONLY call on files you've just edited — pre-existing errors will also appear.\n\
         Prefer paths=[specific file or dir you just changed] to avoid noise."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "paths": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Specific files or directories to lint (optional; defaults to project root)"
                },
                "workdir": {
                    "type": "string",
                    "description": "Working directory for the lint command (default: current directory)"
                }
            },
            "required": ["paths", "workdir"],
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
        let workdir = call.args.get("workdir").and_then(|v| v.as_str()).unwrap_or(".").to_string();
        let paths: Vec<String> = call
            .args
            .get("paths")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        debug!(workdir = %workdir, "read_lints tool");

        let project_type = self.detect_project_type(&call.session_id, &workdir).await;
        let mut results: Vec<String> = Vec::new();

        match project_type {
            Some("rust") => results.push(self.cargo_check(&call.session_id, &workdir).await),
            Some("typescript") => results.push(self.tsc(&call.session_id, &workdir).await),
            Some("python") => results.push(self.ruff(&call.session_id, &workdir, &paths).await),
            _ => {
                let rust_out = self.cargo_check(&call.session_id, &workdir).await;
                if !rust_out.contains("error: could not find") && !rust_out.trim().is_empty() {
                    results.push(format!("[rust]\n{rust_out}"));
                }
                let ruff_out = self.ruff(&call.session_id, &workdir, &paths).await;
                if !ruff_out.trim().is_empty() && !ruff_out.contains("No such file") {
                    results.push(format!("[python]\n{ruff_out}"));
                }
            }
        }

        let output = results.join("\n\n");
        if output.trim().is_empty() {
            ToolOutput::ok(&call.id, "(no diagnostics)")
        } else {
            ToolOutput::ok(&call.id, output)
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::sandbox::LocalSandbox;
    use crate::tool::{Tool, ToolCall};

    fn call(args: serde_json::Value) -> ToolCall {
        ToolCall { id: "rl1".into(), name: "read_lints".into(), args, session_id: "s1".into() }
    }

    fn tool() -> ReadLintsTool {
        ReadLintsTool::new(Arc::new(LocalSandbox::new()))
    }

    #[tokio::test]
    async fn runs_on_rust_project() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]\nname = \"fixture\"\nversion = \"0.1.0\"\n").unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "pub fn hello() {}\n").unwrap();

        let out = tool().execute(&call(json!({"workdir": dir.path().to_str().unwrap()}))).await;
        assert!(!out.is_error, "{}", out.content);
    }

    #[tokio::test]
    async fn no_workdir_defaults_gracefully() {
        let out = tool().execute(&call(json!({}))).await;
        assert!(!out.is_error, "{}", out.content);
    }
}
