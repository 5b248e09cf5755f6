use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};

use ensemble_core::{CreditTracker, EngineConfig, EnsembleError, PermissionsManager};
use ensemble_mcp::{default_server_specs, McpClient, McpClientConfig};
use ensemble_observability::{canonical_logs_dir_from_root, init_process_logging};
use ensemble_orchestrator::LlmPlanner;
use ensemble_server::{serve, AppState, SessionBackend, SessionRuntime};

mod executors;

use executors::build_executors;

#[derive(Parser, Debug)]
#[command(name = "ensemble-engine")]
#[command(about = "Headless Ensemble multi-agent code-generation backend")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the WebSocket session server.
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 8765)]
        port: u16,
        #[arg(long, env = "ENSEMBLE_STATE_DIR")]
        state_dir: Option<String>,
        /// Directory to search upward from for the mcp-servers scripts.
        #[arg(long)]
        mcp_root: Option<String>,
    },
    /// Preview the agent plan for a prompt without executing anything.
    Plan {
        prompt: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            state_dir,
            mcp_root,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let (_guard, log_info) =
                init_process_logging(&canonical_logs_dir_from_root(&state_dir), 14)?;
            tracing::info!(logs_dir = %log_info.logs_dir, "logging initialized");

            let config = EngineConfig::from_env();
            let credit = CreditTracker::global();
            credit.set_limits(config.credit_limits()).await;

            let backend = McpSessionBackend {
                credit: credit.clone(),
                mcp_root: mcp_root.map(PathBuf::from),
            };
            let state = AppState {
                config,
                credit,
                backend: Arc::new(backend),
            };

            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            tracing::info!("starting ensemble-engine on ws://{addr}/ws/chat");
            serve(addr, state).await?;
        }
        Command::Plan { prompt } => {
            tracing_subscriber::fmt()
                .with_env_filter("warn")
                .with_target(false)
                .init();
            let plan = ensemble_orchestrator::fallback_plan(&prompt);
            let (agent, mode) =
                ensemble_core::CapabilityRegistry::find_agent_for_task(&prompt, None);
            println!("{}", serde_json::to_string_pretty(&plan)?);
            eprintln!("single-agent route: {agent}:{mode}");
        }
    }

    Ok(())
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".ensemble")
}

/// Production session backend: spawns the MCP server set for the workspace
/// and wires the LLM planner plus the reference executors over it.
struct McpSessionBackend {
    credit: Arc<CreditTracker>,
    mcp_root: Option<PathBuf>,
}

#[async_trait]
impl SessionBackend for McpSessionBackend {
    async fn start(&self, workspace_path: &Path) -> ensemble_core::Result<SessionRuntime> {
        let search_start = match &self.mcp_root {
            Some(root) => root.clone(),
            None => std::env::current_dir()?,
        };
        let specs = default_server_specs(&search_start)
            .map_err(|e| EnsembleError::Mcp(e.to_string()))?;

        let mcp = Arc::new(McpClient::new(McpClientConfig::new(workspace_path, specs)));
        mcp.initialize()
            .await
            .map_err(|e| EnsembleError::Mcp(e.to_string()))?;

        Ok(SessionRuntime {
            planner: Arc::new(LlmPlanner::new(mcp.clone())),
            executors: build_executors(mcp.clone(), self.credit.clone()),
            permissions: Arc::new(PermissionsManager::new()),
            mcp: Some(mcp),
        })
    }
}
