// SPDX-License-Identifier: MIT
pub mod delete_file;
pub mod edit_file;
pub mod glob;
pub mod grep;
pub mod list_dir;
pub mod read_file;
pub mod read_lints;
pub mod run_terminal_command;
pub mod todo_write;
pub mod write;
