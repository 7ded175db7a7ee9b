// SPDX-License-Identifier: MIT
//! Runtime context for an agent session.
//!
//! Separate from `crush_config::AgentConfig`, which holds only config-file
//! fields. `AgentRuntimeContext` carries values detected at process startup
//! (working directory, git state) that the system prompt needs but that
//! don't belong in a serialised config.
use std::path::PathBuf;

/// Environment-detected context injected into an agent at construction time.
#[derive(Debug, Default, Clone)]
pub struct AgentRuntimeContext {
    /// Absolute path to the project root (found via `.git` walk-up from
    /// `CRUSH_CWD`, falling back to the process working directory).
    pub project_root: Option<PathBuf>,
    /// Pre-formatted git context block (branch, commit, dirty status).
    pub git_context_note: Option<String>,
    /// Text appended verbatim to the default system prompt.
    pub append_system_prompt: Option<String>,
}
