// SPDX-License-Identifier: Apache-2.0
//! `crush` — the gateway binary. Loads configuration, assembles the tool
//! registry and a single agent session, then serves the WebSocket connection
//! gateway until shutdown. All runtime behavior beyond the config-file path
//! is env-var driven (`CRUSH_CWD`, `CRUSH_DATA_DIR`, `CRUSH_DEBUG`,
//! `CRUSH_PROFILE`) — the CLI shell itself carries no core-behavior flags,
//! matching the teacher's split between `clap` for operator ergonomics and
//! config/env for everything the running system actually does.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::{mpsc, Mutex};
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crush_core::{Agent, AgentRuntimeContext, PermissionGate};
use crush_gateway::GatewayHandle;
use crush_model::MockProvider;
use crush_tools::{
    DeleteFileTool, EditFileTool, FileHistory, GlobTool, GrepTool, ListDirTool, LocalSandbox,
    ReadFileTool, ReadLintsTool, RunTerminalCommandTool, Sandbox, TodoItem, TodoWriteTool,
    ToolEvent, ToolPolicy, ToolRegistry, WriteTool,
};

#[derive(Parser)]
#[command(name = "crush", version, about = "Multi-user, multi-session AI coding-agent runtime")]
struct Cli {
    /// Path to an additional YAML config layer, merged over the defaults and
    /// XDG config file.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = crush_config::load(cli.config.as_deref()).context("loading configuration")?;

    init_logging(config.runtime.debug, config.runtime.profile);

    let data_dir = config
        .runtime
        .data_dir
        .clone()
        .or_else(|| dirs::data_dir().map(|d| d.join("crush")))
        .unwrap_or_else(|| PathBuf::from(".crush"));
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;

    let gateway = GatewayHandle::new(&config, &data_dir).context("initializing gateway subsystems")?;

    let agent = build_agent(&config, gateway.arbiter.clone())?;
    let session_id = agent.session().id.clone();
    gateway.register_session(session_id.clone(), agent);

    info!(session_id = %session_id, data_dir = %data_dir.display(), "session ready");
    info!(
        "connect with: ws://{}/ws?token=<JWT>&session_id={session_id}",
        config.gateway.bind_addr
    );

    gateway.serve(&config.gateway).await
}

/// Assemble the builtin tool set and a fresh agent bound to it. Every
/// path-bearing or process-spawning tool is handed the same `Arc<dyn
/// Sandbox>` (C1) rather than touching `tokio::fs`/`tokio::process` itself —
/// SPEC_FULL.md §9: "the core must never touch the user's filesystem
/// directly." `LocalSandbox` is the reference backend (no remote sandbox
/// service deployed); swap in `SandboxClient::new(&config.sandbox)` where a
/// real sandbox service is available. The model provider is intentionally a
/// mock here — the core does not implement the language model (SPEC_FULL.md
/// §1 Non-goals), so a production deployment swaps `MockProvider` for a real
/// `ModelProvider` implementation supplied outside this workspace.
fn build_agent(config: &crush_config::Config, permission_gate: Arc<dyn PermissionGate>) -> anyhow::Result<Agent> {
    let (tool_tx, tool_rx) = mpsc::channel::<ToolEvent>(64);
    let todos: Arc<Mutex<Vec<TodoItem>>> = Arc::new(Mutex::new(Vec::new()));

    let file_history = Arc::new(FileHistory::new());
    let sandbox: Arc<dyn Sandbox> = Arc::new(LocalSandbox::new());

    let mut registry = ToolRegistry::new(sandbox.clone());
    registry.register(RunTerminalCommandTool::new(sandbox.clone(), config.tools.timeout_secs));
    registry.register(ReadFileTool::new(sandbox.clone()));
    registry.register(WriteTool::new(sandbox.clone(), file_history.clone()));
    registry.register(EditFileTool::new(sandbox.clone(), file_history.clone()));
    registry.register(GlobTool::new(sandbox.clone()));
    registry.register(GrepTool::new(sandbox.clone()));
    registry.register(ListDirTool::new(sandbox.clone()));
    registry.register(DeleteFileTool::new(sandbox.clone()));
    registry.register(ReadLintsTool::new(sandbox.clone()));
    registry.register(TodoWriteTool::new(todos, tool_tx));

    let policy = ToolPolicy::from_config(&config.tools);
    let runtime = AgentRuntimeContext::default();
    let model: Arc<dyn crush_model::ModelProvider> = Arc::new(MockProvider);
    let max_context_tokens = model.catalog_context_window().unwrap_or(128_000) as usize;

    Ok(Agent::new(
        model,
        Arc::new(registry),
        Arc::new(policy),
        Arc::new(config.agent.clone()),
        runtime,
        permission_gate,
        tool_rx,
        max_context_tokens,
    ))
}

fn init_logging(debug: bool, profile: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).json().with_writer(std::io::stderr))
        .with(filter)
        .try_init();

    if profile {
        info!("profiling spans enabled (CRUSH_PROFILE)");
    }
}
