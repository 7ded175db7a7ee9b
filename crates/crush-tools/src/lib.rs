// SPDX-License-Identifier: Apache-2.0
pub mod builtin;
pub mod events;
pub mod file_history;
pub mod policy;
pub mod registry;
pub mod sandbox;
pub mod tool;

pub use events::{TodoItem, ToolEvent};
pub use file_history::{DiffMetadata, FileHistory};
pub use policy::{ApprovalPolicy, ToolPolicy};
pub use registry::{ToolRegistry, ToolSchema};
pub use sandbox::{
    DiagnosticEntry, DirListing, ExecuteOutput, ExecuteRequest, GrepRequest, LocalSandbox,
    ReadFileOutput, Sandbox, SandboxClient, SandboxError, SandboxResult,
};
pub use tool::{OutputCategory, Tool, ToolCall, ToolOutput, ToolOutputPart};

pub use builtin::delete_file::DeleteFileTool;
pub use builtin::edit_file::EditFileTool;
pub use builtin::glob::GlobTool;
pub use builtin::grep::GrepTool;
pub use builtin::list_dir::ListDirTool;
pub use builtin::read_file::ReadFileTool;
pub use builtin::read_lints::ReadLintsTool;
pub use builtin::run_terminal_command::RunTerminalCommandTool;
pub use builtin::todo_write::TodoWriteTool;
pub use builtin::write::WriteTool;
