//! Client side of the Ensemble MCP surface: every external capability
//! (LLM completion, web search, file tools, code analysis, memory) lives in
//! a long-lived subprocess speaking JSON-RPC 2.0, one value per line, over
//! stdin/stdout. This crate owns those subprocesses.

mod client;
mod config;
mod error;

pub use client::{ConnectionState, McpClient, McpClientConfig, ServerStatus};
pub use config::{default_server_specs, ServerSpec, DEFAULT_SERVERS, WORKSPACE_SCOPED_SERVERS};
pub use error::{McpError, Result};
