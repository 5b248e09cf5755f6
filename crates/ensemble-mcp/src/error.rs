use thiserror::Error;

/// Errors raised by the MCP client.
///
/// Connection-level failures (dead subprocess, timeout, undecodable output)
/// and tool-level failures (a well-formed JSON-RPC error from the server)
/// are distinct: the former may trigger a reconnect, the latter never does.
#[derive(Debug, Error)]
pub enum McpError {
    /// The subprocess is unreachable, unresponsive, or produced garbage.
    #[error("connection error: {0}")]
    Connection(String),

    /// The subprocess could not be spawned at all.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server returned a JSON-RPC error payload for a tool call.
    #[error("tool error: {server}.{tool}: {message}")]
    Tool {
        server: String,
        tool: String,
        message: String,
    },

    /// Client-side misconfiguration (unknown server, bad spec).
    #[error("configuration error: {0}")]
    Config(String),
}

impl McpError {
    /// Connection-level failures are eligible for the single reconnect retry.
    pub fn is_connection(&self) -> bool {
        matches!(self, McpError::Connection(_) | McpError::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, McpError>;
