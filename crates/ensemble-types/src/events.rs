use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::agent::AgentKind;

/// Events emitted by the orchestrator while a workflow runs.
///
/// The session layer converts these into server frames; nothing here is
/// wire format on its own.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    StepStarted {
        agent: AgentKind,
        mode: String,
        step: usize,
        total: usize,
        remaining_budget: f64,
        timestamp: DateTime<Utc>,
    },
    StepFinished {
        agent: AgentKind,
        mode: String,
        status: String,
        cost_usd: f64,
        timestamp: DateTime<Utc>,
    },
    AgentActivity {
        agent: AgentKind,
        event_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        timestamp: DateTime<Utc>,
    },
    BudgetExhausted {
        remaining: f64,
        timestamp: DateTime<Utc>,
    },
    WorkflowCompleted {
        success: bool,
        total_cost_usd: f64,
        timestamp: DateTime<Utc>,
    },
    WorkflowAborted {
        reason: String,
        timestamp: DateTime<Utc>,
    },
}
