use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, RwLock};
use tokio::time::{timeout, Instant};

use crate::config::{ServerSpec, WORKSPACE_SCOPED_SERVERS};
use crate::error::{McpError, Result};

/// Default bound on one tool call, end to end.
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
/// Servers emit a progress heartbeat roughly every 10 s; a 15 s gap between
/// lines means the server is stuck even if the global deadline is far away.
const LINE_TIMEOUT: Duration = Duration::from_secs(15);
/// Bound on each handshake response (initialize, tools/list).
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Grace period between asking a server to exit and killing it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Construction parameters for [`McpClient`].
#[derive(Debug, Clone)]
pub struct McpClientConfig {
    pub workspace_path: PathBuf,
    pub servers: Vec<ServerSpec>,
    pub auto_reconnect: bool,
    pub timeout: Duration,
}

impl McpClientConfig {
    pub fn new(workspace_path: impl Into<PathBuf>, servers: Vec<ServerSpec>) -> Self {
        Self {
            workspace_path: workspace_path.into(),
            servers,
            auto_reconnect: true,
            timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn without_reconnect(mut self) -> Self {
        self.auto_reconnect = false;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Dead,
}

/// Health of one server, suitable for status output.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub status: ConnectionState,
    pub tools: Vec<String>,
    pub last_ping: Option<DateTime<Utc>>,
}

struct ServerConn {
    child: Child,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
}

/// Multiplexing MCP client: one subprocess per logical server, all owned
/// exclusively by this instance.
///
/// Calls to the same server serialize on that server's connection; calls to
/// different servers run concurrently, which is what makes
/// [`McpClient::call_multiple`] a real fan-out.
pub struct McpClient {
    workspace_path: PathBuf,
    auto_reconnect: bool,
    default_timeout: Duration,
    specs: HashMap<String, ServerSpec>,
    order: Vec<String>,
    request_id: AtomicU64,
    conns: RwLock<HashMap<String, Arc<Mutex<Option<ServerConn>>>>>,
    status: RwLock<HashMap<String, ServerStatus>>,
    initialized: AtomicBool,
}

impl McpClient {
    pub fn new(config: McpClientConfig) -> Self {
        let order: Vec<String> = config.servers.iter().map(|s| s.name.clone()).collect();
        let status = order
            .iter()
            .map(|name| {
                (
                    name.clone(),
                    ServerStatus {
                        status: ConnectionState::Disconnected,
                        tools: Vec::new(),
                        last_ping: None,
                    },
                )
            })
            .collect();
        Self {
            workspace_path: config.workspace_path,
            auto_reconnect: config.auto_reconnect,
            default_timeout: config.timeout,
            specs: config
                .servers
                .into_iter()
                .map(|s| (s.name.clone(), s))
                .collect(),
            order,
            request_id: AtomicU64::new(0),
            conns: RwLock::new(HashMap::new()),
            status: RwLock::new(status),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn workspace_path(&self) -> &Path {
        &self.workspace_path
    }

    /// Start every configured server, perform the `initialize` +
    /// `tools/list` handshake with each, and cache their tool names.
    ///
    /// Success requires every server to be healthy; on any failure all
    /// subprocesses are torn down and the error lists every failing server.
    pub async fn initialize(&self) -> Result<()> {
        let results = futures::future::join_all(
            self.order
                .iter()
                .map(|name| async move { (name.clone(), self.connect_server(name).await) }),
        )
        .await;

        let failures: Vec<String> = results
            .iter()
            .filter_map(|(name, result)| {
                result
                    .as_ref()
                    .err()
                    .map(|e| format!("  - {name}: {e}"))
            })
            .collect();

        if !failures.is_empty() {
            self.close().await;
            return Err(McpError::Connection(format!(
                "failed to connect to MCP servers:\n{}",
                failures.join("\n")
            )));
        }

        self.initialized.store(true, Ordering::SeqCst);
        tracing::info!(servers = self.order.len(), "all MCP servers connected");
        Ok(())
    }

    /// Spawn (or respawn) one server and run the handshake against it.
    async fn connect_server(&self, name: &str) -> Result<()> {
        let spec = self
            .specs
            .get(name)
            .ok_or_else(|| McpError::Config(format!("unknown server '{name}'")))?
            .clone();

        let (conn, tools) = self.spawn_and_handshake(&spec).await?;

        let slot = {
            let mut conns = self.conns.write().await;
            conns
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(None)))
                .clone()
        };
        // Callers queued on this server's mutex pick up the fresh connection.
        *slot.lock().await = Some(conn);

        self.status.write().await.insert(
            name.to_string(),
            ServerStatus {
                status: ConnectionState::Connected,
                tools,
                last_ping: Some(Utc::now()),
            },
        );
        tracing::debug!(server = name, "MCP server connected");
        Ok(())
    }

    async fn spawn_and_handshake(&self, spec: &ServerSpec) -> Result<(ServerConn, Vec<String>)> {
        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .envs(spec.env.iter().cloned())
            .current_dir(&self.workspace_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| McpError::Transport(format!("failed to start {}: {e}", spec.name)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Transport(format!("{}: no stdin pipe", spec.name)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Transport(format!("{}: no stdout pipe", spec.name)))?;

        let mut conn = ServerConn {
            child,
            stdin,
            lines: BufReader::new(stdout).lines(),
        };

        if let Err(e) = self
            .handshake_request(&mut conn, &spec.name, "initialize")
            .await
        {
            let _ = conn.child.kill().await;
            return Err(e);
        }

        let tools_result = match self.handshake_request(&mut conn, &spec.name, "tools/list").await {
            Ok(result) => result,
            Err(e) => {
                let _ = conn.child.kill().await;
                return Err(e);
            }
        };

        let tools: Vec<String> = tools_result
            .get("tools")
            .and_then(Value::as_array)
            .map(|tools| {
                tools
                    .iter()
                    .filter_map(|t| t.get("name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        tracing::debug!(server = %spec.name, tools = tools.len(), "handshake complete");
        Ok((conn, tools))
    }

    async fn handshake_request(
        &self,
        conn: &mut ServerConn,
        server: &str,
        method: &str,
    ) -> Result<Value> {
        let id = self.next_request_id();
        let request = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": {}});
        write_line(&mut conn.stdin, server, &request).await?;

        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let line = match timeout(remaining, conn.lines.next_line()).await {
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => {
                    return Err(McpError::Connection(format!(
                        "{server}: closed stdout during {method}"
                    )))
                }
                Ok(Err(e)) => {
                    return Err(McpError::Connection(format!(
                        "{server}: read failed during {method}: {e}"
                    )))
                }
                Err(_) => {
                    return Err(McpError::Connection(format!(
                        "{server}: failed to respond to {method}"
                    )))
                }
            };

            let message: Value = serde_json::from_str(line.trim()).map_err(|e| {
                McpError::Connection(format!("{server}: invalid JSON during {method}: {e}"))
            })?;
            if message.get("id").and_then(Value::as_u64) == Some(id) {
                if let Some(error) = message.get("error") {
                    return Err(McpError::Connection(format!(
                        "{server}: {method} failed: {}",
                        error.get("message").and_then(Value::as_str).unwrap_or("?")
                    )));
                }
                return Ok(message.get("result").cloned().unwrap_or(Value::Null));
            }
            // Notifications during handshake are ignored.
        }
    }

    /// Call a tool on a server. This is the main entry point for all
    /// external effects.
    ///
    /// On a connection-level failure the affected server is respawned and
    /// the call retried exactly once (when auto-reconnect is enabled);
    /// further failure surfaces to the caller.
    pub async fn call(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
        call_timeout: Option<Duration>,
    ) -> Result<Value> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(McpError::Connection(
                "MCP client not initialized; call initialize() first".to_string(),
            ));
        }

        match self.call_inner(server, tool, &arguments, call_timeout).await {
            Err(e) if e.is_connection() && self.auto_reconnect && self.specs.contains_key(server) => {
                tracing::warn!(server, error = %e, "connection lost, attempting reconnect");
                self.connect_server(server).await?;
                tracing::info!(server, "reconnected, retrying call");
                self.call_inner(server, tool, &arguments, call_timeout).await
            }
            other => other,
        }
    }

    async fn call_inner(
        &self,
        server: &str,
        tool: &str,
        arguments: &Value,
        call_timeout: Option<Duration>,
    ) -> Result<Value> {
        let slot = self
            .conns
            .read()
            .await
            .get(server)
            .cloned()
            .ok_or_else(|| McpError::Connection(format!("server '{server}' not connected")))?;

        let mut guard = slot.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| McpError::Connection(format!("server '{server}' is dead")))?;

        if let Ok(Some(status)) = conn.child.try_wait() {
            *guard = None;
            self.set_dead(server).await;
            return Err(McpError::Connection(format!(
                "server '{server}' process has died (exit: {status})"
            )));
        }

        let arguments = inject_workspace(server, arguments, &self.workspace_path);
        let id = self.next_request_id();
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/call",
            "params": {"name": tool, "arguments": arguments},
        });

        tracing::debug!(server, tool, id, "MCP call");
        if let Err(e) = write_line(&mut conn.stdin, server, &request).await {
            *guard = None;
            self.set_dead(server).await;
            return Err(e);
        }

        let deadline = Instant::now() + call_timeout.unwrap_or(self.default_timeout);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let line_wait = LINE_TIMEOUT.min(remaining);

            let line = match timeout(line_wait, conn.lines.next_line()).await {
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => {
                    *guard = None;
                    self.set_dead(server).await;
                    return Err(McpError::Connection(format!(
                        "server '{server}' closed stdout (process died)"
                    )));
                }
                Ok(Err(e)) => {
                    *guard = None;
                    self.set_dead(server).await;
                    return Err(McpError::Connection(format!(
                        "read from '{server}' failed: {e}"
                    )));
                }
                Err(_) => {
                    // A stuck stream is unusable either way; only the message
                    // differs between the global and per-line timeout.
                    let global = Instant::now() >= deadline;
                    *guard = None;
                    self.set_dead(server).await;
                    return Err(McpError::Connection(if global {
                        format!("call to '{server}' exceeded global timeout")
                    } else {
                        format!(
                            "no output from '{server}' for {}s (server may be stuck)",
                            LINE_TIMEOUT.as_secs()
                        )
                    }));
                }
            };

            if Instant::now() >= deadline {
                *guard = None;
                self.set_dead(server).await;
                return Err(McpError::Connection(format!(
                    "call to '{server}' exceeded global timeout"
                )));
            }

            let message: Value = match serde_json::from_str(line.trim()) {
                Ok(message) => message,
                Err(e) => {
                    *guard = None;
                    self.set_dead(server).await;
                    return Err(McpError::Connection(format!(
                        "invalid JSON from '{server}': {e}"
                    )));
                }
            };

            if message.get("id").and_then(Value::as_u64) == Some(id) {
                if let Some(error) = message.get("error") {
                    return Err(McpError::Tool {
                        server: server.to_string(),
                        tool: tool.to_string(),
                        message: error
                            .get("message")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown error")
                            .to_string(),
                    });
                }
                self.touch(server).await;
                return Ok(message.get("result").cloned().unwrap_or(Value::Null));
            }

            match message.get("method").and_then(Value::as_str) {
                Some("$/progress") => {
                    let note = message
                        .pointer("/params/message")
                        .and_then(Value::as_str)
                        .unwrap_or("progress...");
                    tracing::debug!(server, note, "progress");
                }
                Some(method) => tracing::debug!(server, method, "notification"),
                None => tracing::warn!(server, %message, "unexpected message"),
            }
        }
    }

    /// Issue several calls concurrently; the result vector preserves input
    /// order regardless of completion order, with per-call failures inline.
    pub async fn call_multiple(&self, calls: &[(String, String, Value)]) -> Vec<Result<Value>> {
        tracing::info!(count = calls.len(), "executing MCP calls in parallel");
        let futures: Vec<_> = calls
            .iter()
            .map(|(server, tool, args)| self.call(server, tool, args.clone(), None))
            .collect();
        let results = futures::future::join_all(futures).await;

        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            tracing::warn!(failed, total = calls.len(), "parallel MCP calls had failures");
        } else {
            tracing::info!(total = calls.len(), "all parallel MCP calls completed");
        }
        results
    }

    /// Ask every server to exit, then kill whatever is still alive after
    /// the grace period.
    pub async fn close(&self) {
        self.initialized.store(false, Ordering::SeqCst);
        let slots: Vec<(String, Arc<Mutex<Option<ServerConn>>>)> =
            self.conns.write().await.drain().collect();

        for (name, slot) in slots {
            let mut guard = slot.lock().await;
            if let Some(conn) = guard.take() {
                let ServerConn {
                    mut child, stdin, ..
                } = conn;
                // EOF on stdin asks a well-behaved server to exit.
                drop(stdin);
                match timeout(SHUTDOWN_GRACE, child.wait()).await {
                    Ok(_) => tracing::debug!(server = %name, "server terminated"),
                    Err(_) => {
                        let _ = child.kill().await;
                        tracing::warn!(server = %name, "had to kill server");
                    }
                }
            }
            if let Some(status) = self.status.write().await.get_mut(&name) {
                status.status = ConnectionState::Disconnected;
                status.tools.clear();
            }
        }
        tracing::info!("MCP connections closed");
    }

    pub async fn cleanup(&self) {
        self.close().await;
    }

    /// Per-server health snapshot.
    pub async fn status(&self) -> HashMap<String, ServerStatus> {
        self.status.read().await.clone()
    }

    fn next_request_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn set_dead(&self, server: &str) {
        if let Some(status) = self.status.write().await.get_mut(server) {
            status.status = ConnectionState::Dead;
        }
    }

    async fn touch(&self, server: &str) {
        if let Some(status) = self.status.write().await.get_mut(server) {
            status.last_ping = Some(Utc::now());
        }
    }
}

async fn write_line(stdin: &mut ChildStdin, server: &str, payload: &Value) -> Result<()> {
    let mut line = payload.to_string();
    line.push('\n');
    stdin
        .write_all(line.as_bytes())
        .await
        .map_err(|e| McpError::Connection(format!("write to '{server}' failed: {e}")))?;
    stdin
        .flush()
        .await
        .map_err(|e| McpError::Connection(format!("flush to '{server}' failed: {e}")))
}

/// Servers that are workspace-scoped get `workspace_path` injected when the
/// caller did not pass one.
fn inject_workspace(server: &str, arguments: &Value, workspace: &Path) -> Value {
    let mut arguments = if arguments.is_object() {
        arguments.clone()
    } else {
        json!({})
    };
    if WORKSPACE_SCOPED_SERVERS.contains(&server) {
        let map = arguments.as_object_mut().expect("object ensured above");
        map.entry("workspace_path")
            .or_insert_with(|| Value::String(workspace.to_string_lossy().into_owned()));
    }
    arguments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_injection_only_for_scoped_servers() {
        let workspace = Path::new("/tmp/ws");
        let injected = inject_workspace("memory", &json!({"content": "x"}), workspace);
        assert_eq!(injected["workspace_path"], "/tmp/ws");

        let untouched = inject_workspace("perplexity", &json!({"query": "x"}), workspace);
        assert!(untouched.get("workspace_path").is_none());

        // An explicit value is never overwritten.
        let explicit = inject_workspace("asimov", &json!({"workspace_path": "/other"}), workspace);
        assert_eq!(explicit["workspace_path"], "/other");
    }

    #[test]
    fn request_ids_increment() {
        let client = McpClient::new(McpClientConfig::new("/tmp", vec![]));
        assert_eq!(client.next_request_id(), 1);
        assert_eq!(client.next_request_id(), 2);
    }

    #[tokio::test]
    async fn call_before_initialize_fails() {
        let client = McpClient::new(McpClientConfig::new("/tmp", vec![]));
        let err = client
            .call("memory", "store", json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Connection(_)));
    }
}
