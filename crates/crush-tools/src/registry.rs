// SPDX-License-Identifier: MIT
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;

use crate::policy::{marks_path_viewed, requires_prior_view};
use crate::sandbox::Sandbox;
use crate::{Tool, ToolCall, ToolOutput};

/// A tool schema – mirrors crush_model's wire schema but keeps tools crate
/// independent from the model crate.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Central registry holding all available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    /// The C1 boundary, used only to check path existence for the
    /// read-before-write gate below — never anything path-bearing beyond
    /// that, since actual I/O is each tool's own concern.
    sandbox: Arc<dyn Sandbox>,
    /// Per-session set of paths a view-marking tool call has returned
    /// content for. SPEC_FULL.md §4.4 step 3: a write/edit to a path not yet
    /// in this set is rejected as a blind overwrite, unless the path doesn't
    /// exist yet (there is nothing to view before creating a new file).
    files_read: DashMap<String, HashSet<String>>,
}

// SAFETY: ToolRegistry is Sync because:
// - HashMap<String, Arc<dyn Tool>> is Sync (String is Sync, Arc<T: Send + Sync> is Sync)
// - Tools implement Send + Sync (required by the Tool trait)
// - No interior mutability exists after construction (all methods take &self)
// - Parallel tool execution is safe because tools are immutable after registration
unsafe impl Sync for ToolRegistry {}

impl ToolRegistry {
    pub fn new(sandbox: Arc<dyn Sandbox>) -> Self {
        Self { tools: HashMap::new(), sandbox, files_read: DashMap::new() }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Produce schemas for ALL registered tools (mode-unfiltered).
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self.tools.values().map(|t| ToolSchema {
            name: t.name().to_string(),
            description: t.description().to_string(),
            parameters: t.parameters_schema(),
        }).collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let tool = match self.tools.get(&call.name) {
            Some(tool) => tool,
            None => return ToolOutput::err(&call.id, format!("unknown tool: {}", call.name)),
        };

        let path = call.args.get("path").and_then(|v| v.as_str()).map(str::to_string);

        if requires_prior_view(&call.name) {
            if let Some(path) = &path {
                let already_read = self.files_read.get(&call.session_id).is_some_and(|s| s.contains(path));
                let exists = self.sandbox.exists(&call.session_id, path).await;
                if exists && !already_read {
                    return ToolOutput::err_tagged(&call.id, "must view file before modifying", "must_view_first");
                }
            }
        }

        let output = tool.execute(call).await;

        if !output.is_error && marks_path_viewed(&call.name) {
            if let Some(path) = path {
                self.files_read.entry(call.session_id.clone()).or_default().insert(path);
            }
        }

        output
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self { Self::new(Arc::new(crate::sandbox::LocalSandbox::new())) }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
