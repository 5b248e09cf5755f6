// Ensemble Error Types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnsembleError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Permission denied: {agent} lacks {permission} for action '{action}'")]
    PermissionDenied {
        agent: String,
        permission: String,
        action: String,
    },

    #[error("Budget exhausted: {0}")]
    BudgetExhausted(String),

    #[error("Emergency shutdown: {0}")]
    EmergencyShutdown(String),

    #[error("Planning error: {0}")]
    Planning(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    #[error("MCP error: {0}")]
    Mcp(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, EnsembleError>;
