use std::path::{Path, PathBuf};

use crate::error::{McpError, Result};

/// Logical server names connected by default.
pub const DEFAULT_SERVERS: &[&str] = &[
    "build_validation",
    "file_tools",
    "perplexity",
    "memory",
    "tree-sitter",
    "asimov",
    "claude",
];

/// Servers whose tools expect a `workspace_path` argument; the client
/// injects it when the caller left it out.
pub const WORKSPACE_SCOPED_SERVERS: &[&str] = &["memory", "workflow", "asimov"];

/// How to launch one MCP server subprocess.
#[derive(Debug, Clone)]
pub struct ServerSpec {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl ServerSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Build launch specs for the default server set.
///
/// Server scripts live in an `mcp-servers` directory found by walking
/// upward from `start`; each logical name maps to `<name>_server.py` with
/// dashes folded to underscores.
pub fn default_server_specs(start: &Path) -> Result<Vec<ServerSpec>> {
    let root = find_servers_root(start)?;
    Ok(DEFAULT_SERVERS
        .iter()
        .map(|name| {
            let script = root.join(format!("{}_server.py", name.replace('-', "_")));
            ServerSpec::new(*name, "python3").arg(script.to_string_lossy())
        })
        .collect())
}

fn find_servers_root(start: &Path) -> Result<PathBuf> {
    let mut current = start.to_path_buf();
    for _ in 0..10 {
        let candidate = current.join("mcp-servers");
        if candidate.is_dir() {
            return Ok(candidate);
        }
        if !current.pop() {
            break;
        }
    }
    Err(McpError::Config(format!(
        "no mcp-servers directory found above {}",
        start.display()
    )))
}
