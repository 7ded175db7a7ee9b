// SPDX-License-Identifier: MIT
use chrono::Local;
use std::path::Path;

/// Optional contextual blocks injected into the system prompt.
#[derive(Debug, Default)]
pub struct PromptContext<'a> {
    /// Absolute path to the project root (from `.git` detection).
    pub project_root: Option<&'a Path>,
    /// Pre-formatted git context (branch, commit, dirty status).
    ///
    /// **Caching note**: this field is *volatile* — it changes with every
    /// commit and file edit. When prompt caching is enabled this content
    /// belongs in an uncached system block so the stable prefix stays
    /// cacheable across turns.
    pub git_context: Option<&'a str>,
    /// Text appended verbatim after the Guidelines section.
    pub append: Option<&'a str>,
}

impl<'a> PromptContext<'a> {
    /// Return a version of this context with the volatile field cleared —
    /// the stable, cacheable portion of the system prompt.
    pub fn stable_only(&self) -> Self {
        Self {
            project_root: self.project_root,
            git_context: None,
            append: self.append,
        }
    }
}

mod guidelines {
    pub fn general() -> &'static str {
        "- Be concise and precise. Use tools instead of guessing.\n\
         - State your plan briefly before a multi-step change, then execute it."
    }

    pub fn tool_usage() -> &'static str {
        "- NEVER use `run_terminal_command` for file I/O — use `read_file`/`write`/`edit_file`/`grep`/`glob`.\n\
         - Prefer `edit_file` over `write` for modifying existing files (preserves surrounding context).\n\
         - Discovery workflow: `glob` to find files → `grep` to narrow → `read_file` with specific ranges for context.\n\
         - You must `read_file` a path before `write`/`edit_file`/`delete_file` touches it — blind overwrites are rejected.\n\
         - Batch `read_file` calls in parallel — read all potentially relevant files in one turn."
    }

    pub fn code_quality() -> &'static str {
        "- Make sure all the code you generate follows good separation of concerns and clean code principles.\n\
         - NEVER create new files proactively unless explicitly requested.\n\
         - Write tests when adding new functionality.\n\
         - Preserve existing code structure and coding style patterns."
    }

    pub fn workflow_efficiency() -> &'static str {
        "- Use `todo_write` for multi-step tasks (3+ steps); update silently and mark complete after each step.\n\
         - Batch independent tool calls in parallel to increase efficiency.\n\
         - Run `read_lints` on files you just edited before considering a change complete."
    }

    pub fn error_handling() -> &'static str {
        "- When a tool fails, try a different approach before giving up.\n\
         - Always set `workdir` in `run_terminal_command` to the project root for commands that depend on location.\n\
         - NEVER skip git hooks or force-push without explicit user permission."
    }
}

fn build_guidelines_section() -> String {
    format!(
        "## Guidelines\n\n\
         ### General Principles\n\
         {}\n\n\
         ### Tool Usage Patterns\n\
         {}\n\n\
         ### Code Quality\n\
         {}\n\n\
         ### Workflow Efficiency\n\
         {}\n\n\
         ### Error Handling\n\
         {}",
        guidelines::general(),
        guidelines::tool_usage(),
        guidelines::code_quality(),
        guidelines::workflow_efficiency(),
        guidelines::error_handling(),
    )
}

/// Build the system prompt for a generation.
///
/// `custom` overrides the built-in prompt entirely (from
/// `AgentConfig::system_prompt`); `ctx.append` is still honoured on top of a
/// custom prompt so deployment-level additions always apply.
pub fn system_prompt(custom: Option<&str>, ctx: PromptContext<'_>) -> String {
    if let Some(custom) = custom {
        if let Some(extra) = ctx.append {
            return format!("{}\n\n{}", custom.trim_end(), extra);
        }
        return custom.to_string();
    }

    let identity = format!(
        "You are Crush, a coding agent that executes tasks against a sandboxed \
         development environment on behalf of a connected client.\n\n\
         Current date and time: `{now}`\n\
         Current working directory: `{cwd}`\n\n\
         You can read and write files, run shell commands, and search the codebase — \
         every such action is dispatched through the sandbox, not your local process. \
         Write operations and shell commands outside the auto-approve policy require \
         explicit permission from the connected client before they run; if a permission \
         request times out or is denied, the tool result will say so and you should \
         adapt rather than retry the same call.",
        now = Local::now().format("%Y-%m-%d %H:%M:%S"),
        cwd = std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "<unknown>".to_string()),
    );

    let project_section = if let Some(root) = ctx.project_root {
        format!(
            "\n\n## Project Context\n\
             Project root directory: `{}`\n\
             - Use this absolute path for all file read/write operations.\n\
             - Pass this path as the `workdir` argument to `run_terminal_command` \
               so shell commands execute in the correct directory.",
            root.display()
        )
    } else {
        String::new()
    };

    let git_section = ctx
        .git_context
        .map(|git| format!("\n\n{git}"))
        .unwrap_or_default();

    let guidelines_section = build_guidelines_section();

    let append_section = ctx
        .append
        .map(|extra| format!("\n\n{extra}"))
        .unwrap_or_default();

    format!(
        "{identity}{project_section}{git_section}\n\n\
         {guidelines_section}\
         {append_section}",
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn p(s: &str) -> PathBuf {
        PathBuf::from(s)
    }
    fn empty() -> PromptContext<'static> {
        PromptContext::default()
    }

    #[test]
    fn custom_prompt_is_returned_verbatim() {
        let prompt = system_prompt(Some("Custom instructions here."), empty());
        assert_eq!(prompt, "Custom instructions here.");
    }

    #[test]
    fn custom_prompt_with_append() {
        let ctx = PromptContext {
            append: Some("Extra rule."),
            ..Default::default()
        };
        let prompt = system_prompt(Some("Base."), ctx);
        assert!(prompt.contains("Base."));
        assert!(prompt.contains("Extra rule."));
    }

    #[test]
    fn default_prompt_names_the_agent() {
        let pr = system_prompt(None, empty());
        assert!(pr.contains("Crush"));
    }

    #[test]
    fn default_prompt_mentions_sandboxed_execution() {
        let pr = system_prompt(None, empty());
        assert!(pr.contains("sandbox"));
    }

    #[test]
    fn default_prompt_mentions_permission_requirement() {
        let pr = system_prompt(None, empty());
        assert!(pr.contains("permission"));
    }

    #[test]
    fn all_guideline_categories_present() {
        let pr = system_prompt(None, empty());
        assert!(pr.contains("### General Principles"));
        assert!(pr.contains("### Tool Usage Patterns"));
        assert!(pr.contains("### Code Quality"));
        assert!(pr.contains("### Workflow Efficiency"));
        assert!(pr.contains("### Error Handling"));
    }

    #[test]
    fn guidelines_mention_critical_tools() {
        let pr = system_prompt(None, empty());
        assert!(pr.contains("`run_terminal_command`"));
        assert!(pr.contains("`edit_file`"));
        assert!(pr.contains("`grep`"));
        assert!(pr.contains("`glob`"));
        assert!(pr.contains("`read_file`"));
    }

    #[test]
    fn guidelines_mention_read_before_write() {
        let pr = system_prompt(None, empty());
        assert!(pr.contains("blind overwrites are rejected"));
    }

    #[test]
    fn guidelines_mention_parallel_tool_calls() {
        let pr = system_prompt(None, empty());
        assert!(pr.contains("parallel"));
    }

    #[test]
    fn project_root_appears_in_prompt() {
        let root = p("/home/user/my-project");
        let ctx = PromptContext {
            project_root: Some(&root),
            ..Default::default()
        };
        let pr = system_prompt(None, ctx);
        assert!(pr.contains("/home/user/my-project"));
        assert!(pr.contains("Project Context"));
    }

    #[test]
    fn no_project_root_no_section() {
        let pr = system_prompt(None, empty());
        assert!(!pr.contains("Project Context"));
    }

    #[test]
    fn git_context_appears_in_prompt() {
        let git = "## Git Context\nBranch: main\nCommit: abc1234";
        let ctx = PromptContext {
            git_context: Some(git),
            ..Default::default()
        };
        let pr = system_prompt(None, ctx);
        assert!(pr.contains("Git Context"));
        assert!(pr.contains("abc1234"));
    }

    #[test]
    fn append_section_is_added_after_guidelines() {
        let ctx = PromptContext {
            append: Some("Custom rule: never delete files."),
            ..Default::default()
        };
        let pr = system_prompt(None, ctx);
        let guidelines_pos = pr.find("Guidelines").unwrap();
        let append_pos = pr.find("Custom rule").unwrap();
        assert!(append_pos > guidelines_pos);
    }

    #[test]
    fn stable_only_clears_git_context() {
        let git = "## Git Context\nBranch: main";
        let ctx = PromptContext {
            git_context: Some(git),
            project_root: None,
            append: Some("keep me"),
        };
        let stable = ctx.stable_only();
        assert!(stable.git_context.is_none());
        assert_eq!(stable.append, Some("keep me"));
    }
}
