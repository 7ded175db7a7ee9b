// SPDX-License-Identifier: MIT
//! C1 — Sandbox boundary.
//!
//! [`Sandbox`] is the only thing any tool is allowed to touch a session's
//! filesystem or process space through. [`SandboxClient`] forwards every call
//! over HTTP to a remote sandbox service; [`LocalSandbox`] is the in-process
//! reference implementation, running the same operations against the host's
//! own `tokio::fs`/`tokio::process`. Both implement the same trait, so a
//! builtin tool never knows or cares which backend it is talking to.
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crush_config::SandboxConfig;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox unavailable: {0}")]
    Unavailable(String),
    #[error("sandbox remote error {code}: {message}")]
    Remote { code: String, message: String },
    #[error("bad sandbox request: {0}")]
    BadRequest(String),
    #[error("local sandbox I/O error: {0}")]
    Io(String),
    #[error("{0} is a directory")]
    IsDirectory(String),
}

pub type SandboxResult<T> = Result<T, SandboxError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadFileOutput {
    pub content: String,
    /// Set when the backend itself cut the content short (e.g. a remote size
    /// cap). `LocalSandbox` never truncates — pagination is a C4 concern.
    pub truncated: bool,
    /// Path actually read, after any backend-side resolution (e.g.
    /// `LocalSandbox`'s ancestor-directory fallback). Differs from the
    /// requested path only when resolution kicked in.
    pub resolved_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticEntry {
    pub path: String,
    pub line: u32,
    pub severity: String,
    pub message: String,
}

/// Result of a directory listing: relative entry paths (directories carry a
/// trailing `/`) plus whether `limit` cut the walk short.
#[derive(Debug, Clone, Default)]
pub struct DirListing {
    pub entries: Vec<String>,
    pub truncated: bool,
}

/// Parameters for [`Sandbox::grep`]. A struct rather than positional
/// arguments — mirrors the shape of [`ExecuteRequest`] and keeps call sites
/// readable as the field count grows.
#[derive(Debug, Clone)]
pub struct GrepRequest {
    pub pattern: String,
    pub path: String,
    pub include: Option<String>,
    pub case_sensitive: bool,
    /// `content` (file:line:col:text), `files_with_matches`, or `count`.
    pub output_mode: String,
    pub context_lines: usize,
    pub limit: usize,
}

impl Default for GrepRequest {
    fn default() -> Self {
        Self {
            pattern: String::new(),
            path: ".".to_string(),
            include: None,
            case_sensitive: true,
            output_mode: "content".to_string(),
            context_lines: 0,
            limit: 100,
        }
    }
}

/// Parameters for [`Sandbox::execute`].
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub cmd: String,
    pub workdir: Option<String>,
    pub timeout: Duration,
}

/// C1 — the only path through which a tool touches a session's filesystem or
/// spawns a process. SPEC_FULL.md §9: "the core must never touch the user's
/// filesystem directly; all path-bearing operations go through C1."
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn read_file(&self, session_id: &str, path: &str) -> SandboxResult<ReadFileOutput>;
    async fn write_file(&self, session_id: &str, path: &str, content: &str) -> SandboxResult<()>;
    async fn delete_file(&self, session_id: &str, path: &str) -> SandboxResult<()>;
    async fn list_dir(&self, session_id: &str, path: &str, depth: usize, limit: usize) -> SandboxResult<DirListing>;
    async fn grep(&self, session_id: &str, req: GrepRequest) -> SandboxResult<String>;
    async fn glob(&self, session_id: &str, pattern: &str, root: &str, max_results: usize) -> SandboxResult<Vec<String>>;
    async fn execute(&self, session_id: &str, req: ExecuteRequest) -> SandboxResult<ExecuteOutput>;
    async fn get_lsp_diagnostics(&self, session_id: &str, path: &str) -> SandboxResult<Vec<DiagnosticEntry>>;

    /// Whether `path` currently exists. Used by the read-before-write gate
    /// (SPEC_FULL.md §4.4 step 3) — a path that does not exist yet has
    /// nothing to have been "viewed".
    async fn exists(&self, session_id: &str, path: &str) -> bool;
}

// ─── SandboxClient — HTTP-backed production implementation ────────────────────

/// Shared facade over `POST {base_url}/execute`, `/file/{read,write,delete,list,grep,glob}`,
/// and `/lsp/diagnostics`. One `reqwest::Client` is built once and reused for every call;
/// each method applies its own timeout from `SandboxConfig`.
pub struct SandboxClient {
    http: reqwest::Client,
    base_url: String,
    io_timeout: Duration,
    execute_timeout: Duration,
    diagnostics_timeout: Duration,
}

impl SandboxClient {
    pub fn new(config: &SandboxConfig) -> SandboxResult<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| SandboxError::BadRequest(e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            io_timeout: Duration::from_secs(config.io_timeout_secs),
            execute_timeout: Duration::from_secs(config.execute_timeout_secs),
            diagnostics_timeout: Duration::from_secs(config.diagnostics_timeout_secs),
        })
    }

    async fn post(&self, path: &str, body: Value, timeout: Duration) -> SandboxResult<Value> {
        let resp = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    SandboxError::Unavailable(e.to_string())
                } else {
                    SandboxError::BadRequest(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body: Value = resp.json().await.unwrap_or_else(|_| json!({}));
            let code = body.get("code").and_then(|v| v.as_str()).unwrap_or(status.as_str()).to_string();
            let message = body.get("message").and_then(|v| v.as_str())
                .unwrap_or("sandbox returned a non-2xx response without a structured body")
                .to_string();
            return Err(SandboxError::Remote { code, message });
        }

        resp.json().await.map_err(|e| SandboxError::BadRequest(e.to_string()))
    }
}

#[async_trait]
impl Sandbox for SandboxClient {
    async fn read_file(&self, session_id: &str, path: &str) -> SandboxResult<ReadFileOutput> {
        let body = json!({ "session_id": session_id, "path": path });
        let v = self.post("/file/read", body, self.io_timeout).await?;
        serde_json::from_value(v).map_err(|e| SandboxError::BadRequest(e.to_string()))
    }

    async fn write_file(&self, session_id: &str, path: &str, content: &str) -> SandboxResult<()> {
        let body = json!({ "session_id": session_id, "path": path, "content": content });
        self.post("/file/write", body, self.io_timeout).await?;
        Ok(())
    }

    async fn delete_file(&self, session_id: &str, path: &str) -> SandboxResult<()> {
        let body = json!({ "session_id": session_id, "path": path });
        self.post("/file/delete", body, self.io_timeout).await?;
        Ok(())
    }

    async fn list_dir(&self, session_id: &str, path: &str, depth: usize, limit: usize) -> SandboxResult<DirListing> {
        let body = json!({ "session_id": session_id, "path": path, "depth": depth, "limit": limit });
        let v = self.post("/file/list", body, self.io_timeout).await?;
        let entries = serde_json::from_value(v.get("entries").cloned().unwrap_or(Value::Array(vec![])))
            .map_err(|e| SandboxError::BadRequest(e.to_string()))?;
        let truncated = v.get("truncated").and_then(|b| b.as_bool()).unwrap_or(false);
        Ok(DirListing { entries, truncated })
    }

    async fn grep(&self, session_id: &str, req: GrepRequest) -> SandboxResult<String> {
        let body = json!({
            "session_id": session_id,
            "pattern": req.pattern,
            "path": req.path,
            "include": req.include,
            "case_sensitive": req.case_sensitive,
            "output_mode": req.output_mode,
            "context_lines": req.context_lines,
            "limit": req.limit,
        });
        let v = self.post("/file/grep", body, self.io_timeout).await?;
        Ok(v.get("output").and_then(|o| o.as_str()).unwrap_or("").to_string())
    }

    async fn glob(&self, session_id: &str, pattern: &str, root: &str, max_results: usize) -> SandboxResult<Vec<String>> {
        let body = json!({ "session_id": session_id, "pattern": pattern, "root": root, "max_results": max_results });
        let v = self.post("/file/glob", body, self.io_timeout).await?;
        serde_json::from_value(v.get("matches").cloned().unwrap_or(Value::Array(vec![])))
            .map_err(|e| SandboxError::BadRequest(e.to_string()))
    }

    async fn execute(&self, session_id: &str, req: ExecuteRequest) -> SandboxResult<ExecuteOutput> {
        let body = json!({
            "session_id": session_id,
            "cmd": req.cmd,
            "workdir": req.workdir,
            "timeout_secs": req.timeout.as_secs(),
        });
        let v = self.post("/execute", body, self.execute_timeout).await?;
        serde_json::from_value(v).map_err(|e| SandboxError::BadRequest(e.to_string()))
    }

    async fn get_lsp_diagnostics(&self, session_id: &str, path: &str) -> SandboxResult<Vec<DiagnosticEntry>> {
        let body = json!({ "session_id": session_id, "path": path });
        let v = self.post("/lsp/diagnostics", body, self.diagnostics_timeout).await?;
        serde_json::from_value(v.get("diagnostics").cloned().unwrap_or(Value::Array(vec![])))
            .map_err(|e| SandboxError::BadRequest(e.to_string()))
    }

    async fn exists(&self, session_id: &str, path: &str) -> bool {
        self.read_file(session_id, path).await.is_ok()
    }
}

// ─── LocalSandbox — tokio::fs/tokio::process reference implementation ─────────

const EXCLUDED_DIRS: &[&str] = &[".git", "target", "node_modules", ".svn", "__pycache__", ".mypy_cache"];

/// Runs every sandbox operation against the host's own filesystem and process
/// table. The reference/default backend for single-tenant deployments that
/// have no remote sandbox service — same trait, same call shape as
/// [`SandboxClient`], just no network hop. `session_id` is accepted by every
/// method for trait-compatibility but unused: there is only one filesystem.
#[derive(Default)]
pub struct LocalSandbox;

impl LocalSandbox {
    pub fn new() -> Self {
        Self
    }

    /// For an absolute path that does not exist, try dropping one or two
    /// "middle" path components to find the file at an ancestor level. Lets a
    /// model recover when it constructs a path one directory too deep.
    fn ascend_to_find(path: &str) -> Option<std::path::PathBuf> {
        use std::path::{Component, Path};

        let p = Path::new(path);
        if !p.is_absolute() || p.exists() {
            return None;
        }

        let parts: Vec<Component> = p.components().collect();
        const MAX_DEPTH: usize = 12;
        if parts.len() < 4 || parts.len() > MAX_DEPTH {
            return None;
        }

        for drop_at in 1..parts.len() - 1 {
            let candidate: std::path::PathBuf =
                parts[..drop_at].iter().chain(parts[drop_at + 1..].iter()).collect();
            if candidate.exists() {
                return Some(candidate);
            }
        }
        for drop_at in 1..parts.len().saturating_sub(2) {
            let candidate: std::path::PathBuf =
                parts[..drop_at].iter().chain(parts[drop_at + 2..].iter()).collect();
            if candidate.exists() {
                return Some(candidate);
            }
        }
        None
    }

    /// Samples up to 4096 bytes to decide whether `bytes` is binary: any NUL
    /// byte, or more than 30% bytes outside TAB/LF/CR/printable-ASCII.
    fn looks_binary(bytes: &[u8]) -> bool {
        if bytes.is_empty() {
            return false;
        }
        let sample = &bytes[..bytes.len().min(4096)];
        if sample.contains(&0u8) {
            return true;
        }
        let non_printable = sample.iter().filter(|&&b| b < 9 || (b > 13 && b < 32)).count();
        non_printable * 100 / sample.len() > 30
    }

    fn relative_path(base: &str, full: &str) -> String {
        full.strip_prefix(base)
            .map(|s| s.trim_start_matches('/').to_string())
            .unwrap_or_else(|| full.to_string())
    }

    #[async_recursion::async_recursion]
    async fn walk_dir(base: &str, dir: &str, current_depth: usize, max_depth: usize, limit: usize, out: &mut DirListing) {
        if out.entries.len() >= limit {
            out.truncated = true;
            return;
        }
        let mut rd = match tokio::fs::read_dir(dir).await {
            Ok(rd) => rd,
            Err(_) => return,
        };
        let mut children: Vec<(String, bool)> = Vec::new();
        while let Ok(Some(entry)) = rd.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            children.push((name, is_dir));
        }
        children.sort_by(|(a, a_dir), (b, b_dir)| b_dir.cmp(a_dir).then(a.cmp(b)));

        for (name, is_dir) in children {
            if out.entries.len() >= limit {
                out.truncated = true;
                return;
            }
            let full_path = format!("{}/{}", dir.trim_end_matches('/'), name);
            let rel = Self::relative_path(base, &full_path);
            if is_dir {
                out.entries.push(format!("{rel}/"));
                if current_depth < max_depth && !EXCLUDED_DIRS.contains(&name.as_str()) {
                    Self::walk_dir(base, &full_path, current_depth + 1, max_depth, limit, out).await;
                }
            } else {
                out.entries.push(rel);
            }
        }
    }

    async fn run_search(req: &GrepRequest) -> std::io::Result<std::process::Output> {
        let has_rg = tokio::process::Command::new("which")
            .arg("rg")
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false);

        if has_rg {
            let mut args = vec!["--color".to_string(), "never".to_string()];
            match req.output_mode.as_str() {
                "files_with_matches" => args.push("-l".to_string()),
                "count" => args.push("-c".to_string()),
                _ => {
                    args.push("--vimgrep".to_string());
                    args.push("--no-heading".to_string());
                }
            }
            if !req.case_sensitive {
                args.push("--ignore-case".to_string());
            }
            if req.context_lines > 0 && req.output_mode == "content" {
                args.push(format!("-C{}", req.context_lines));
            }
            if let Some(glob) = &req.include {
                args.push("-g".to_string());
                args.push(glob.clone());
            }
            args.push(req.pattern.clone());
            args.push(req.path.clone());
            tokio::process::Command::new("rg").args(&args).stdin(std::process::Stdio::null()).output().await
        } else {
            let mut args = vec!["-rn".to_string()];
            match req.output_mode.as_str() {
                "files_with_matches" => args.push("-l".to_string()),
                "count" => args.push("-c".to_string()),
                _ => {}
            }
            if !req.case_sensitive {
                args.push("-i".to_string());
            }
            if req.context_lines > 0 && req.output_mode == "content" {
                args.push(format!("-C{}", req.context_lines));
            }
            if let Some(glob) = &req.include {
                args.push("--include".to_string());
                args.push(glob.clone());
            }
            args.push(req.pattern.clone());
            args.push(req.path.clone());
            tokio::process::Command::new("grep").args(&args).stdin(std::process::Stdio::null()).output().await
        }
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    async fn read_file(&self, _session_id: &str, path: &str) -> SandboxResult<ReadFileOutput> {
        let resolved = Self::ascend_to_find(path).map(|p| p.to_string_lossy().into_owned()).unwrap_or_else(|| path.to_string());
        let bytes = tokio::fs::read(&resolved).await.map_err(|e| SandboxError::Io(format!("read error: {e}")))?;
        if Self::looks_binary(&bytes) {
            return Err(SandboxError::BadRequest(format!(
                "{path} looks binary ({} bytes); this tool only reads text",
                bytes.len()
            )));
        }
        Ok(ReadFileOutput {
            content: String::from_utf8_lossy(&bytes).into_owned(),
            truncated: false,
            resolved_path: resolved,
        })
    }

    async fn write_file(&self, _session_id: &str, path: &str, content: &str) -> SandboxResult<()> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
        }
        tokio::fs::write(path, content).await.map_err(|e| SandboxError::Io(format!("write error: {e}")))
    }

    async fn delete_file(&self, _session_id: &str, path: &str) -> SandboxResult<()> {
        match tokio::fs::metadata(path).await {
            Ok(m) if m.is_dir() => return Err(SandboxError::IsDirectory(path.to_string())),
            Err(e) => return Err(SandboxError::Io(format!("stat error: {e}"))),
            Ok(_) => {}
        }
        tokio::fs::remove_file(path).await.map_err(|e| SandboxError::Io(format!("delete error: {e}")))
    }

    async fn list_dir(&self, _session_id: &str, path: &str, depth: usize, limit: usize) -> SandboxResult<DirListing> {
        match tokio::fs::metadata(path).await {
            Ok(m) if m.is_dir() => {}
            Ok(_) => return Err(SandboxError::BadRequest(format!("not a directory: {path}"))),
            Err(e) => return Err(SandboxError::Io(format!("cannot access {path}: {e}"))),
        }
        let mut out = DirListing::default();
        Self::walk_dir(path, path, 0, depth, limit, &mut out).await;
        Ok(out)
    }

    async fn grep(&self, _session_id: &str, req: GrepRequest) -> SandboxResult<String> {
        let output = Self::run_search(&req).await.map_err(|e| SandboxError::Io(format!("grep error: {e}")))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let lines: Vec<&str> = stdout.lines().take(req.limit).collect();
        let mut result = lines.join("\n");
        let total = stdout.lines().count();
        if total > req.limit {
            result.push_str(&format!(
                "\n...[{} more matches not shown — narrow with path= or include= to see all results]",
                total - req.limit
            ));
        }
        Ok(result)
    }

    async fn glob(&self, _session_id: &str, pattern: &str, root: &str, max_results: usize) -> SandboxResult<Vec<String>> {
        let normalized = pattern.strip_prefix("**/").unwrap_or(pattern);
        let cmd_str = format!(
            "find {root} -name '{normalized}' -not -path '*/target/*' -not -path '*/.git/*' | head -{max_results}"
        );
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&cmd_str)
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .map_err(|e| SandboxError::Io(format!("glob error: {e}")))?;
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(text.lines().map(str::to_string).collect())
    }

    async fn execute(&self, _session_id: &str, req: ExecuteRequest) -> SandboxResult<ExecuteOutput> {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(&req.cmd);
        if let Some(wd) = &req.workdir {
            cmd.current_dir(wd);
        }
        let result = tokio::time::timeout(req.timeout, cmd.output()).await;
        match result {
            Ok(Ok(output)) => Ok(ExecuteOutput {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                exit_code: output.status.code().unwrap_or(-1),
            }),
            Ok(Err(e)) => Err(SandboxError::Io(format!("spawn error: {e}"))),
            Err(_) => Err(SandboxError::Unavailable(format!("timeout after {}s", req.timeout.as_secs()))),
        }
    }

    async fn get_lsp_diagnostics(&self, _session_id: &str, _path: &str) -> SandboxResult<Vec<DiagnosticEntry>> {
        // No bundled language-server process in the local/single-tenant
        // backend; a remote SandboxClient talking to a real sandbox service
        // is expected to return actual diagnostics here.
        Ok(Vec::new())
    }

    async fn exists(&self, _session_id: &str, path: &str) -> bool {
        tokio::fs::metadata(path).await.is_ok()
    }
}
