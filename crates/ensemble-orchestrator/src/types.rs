// Workflow Types
// Core records for plans, per-step executions, and workflow state

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use ensemble_core::CapabilityRegistry;
use ensemble_types::{AgentKind, WorkflowError};

// ============================================================================
// Plans
// ============================================================================

/// One scheduled step: which agent, in which mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub agent: AgentKind,
    pub mode: String,
}

impl PlanStep {
    pub fn new(agent: AgentKind, mode: impl Into<String>) -> Self {
        Self {
            agent,
            mode: mode.into(),
        }
    }

    /// Step running the agent's registry default mode.
    pub fn default_mode(agent: AgentKind) -> Self {
        Self {
            agent,
            mode: CapabilityRegistry::default_mode(agent).to_string(),
        }
    }
}

/// Condition gating a planned step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepCondition {
    Always,
    IfSuccess,
    IfFailure,
    IfQualityLow,
    Parallel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkflowType {
    Create,
    Fix,
    Explain,
    Refactor,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

/// A planned step with its planner-supplied metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedAgent {
    pub agent: AgentKind,
    pub description: String,
    #[serde(default = "default_condition")]
    pub condition: StepCondition,
    #[serde(default = "default_iterations")]
    pub max_iterations: u32,
}

fn default_condition() -> StepCondition {
    StepCondition::Always
}

fn default_iterations() -> u32 {
    1
}

/// Complete plan produced by the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowPlan {
    pub task_description: String,
    pub workflow_type: WorkflowType,
    pub agents: Vec<PlannedAgent>,
    pub success_criteria: Vec<String>,
    pub estimated_duration: String,
    pub complexity: Complexity,
    #[serde(default)]
    pub requires_human_approval: bool,
}

impl WorkflowPlan {
    /// The ordered (agent, mode) queue the orchestrator starts from.
    pub fn steps(&self) -> Vec<PlanStep> {
        self.agents
            .iter()
            .map(|a| PlanStep::default_mode(a.agent))
            .collect()
    }
}

// ============================================================================
// Execution records
// ============================================================================

/// Terminal and transient statuses of a step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    Aborted,
}

/// Accounting record for a single agent execution.
#[derive(Debug, Clone, Serialize)]
pub struct AgentExecution {
    pub agent: AgentKind,
    pub mode: String,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub input: Value,
    pub output: Value,
    pub errors: Vec<String>,
    pub cost_usd: f64,
    pub tokens_used: u64,
}

impl AgentExecution {
    pub fn running(agent: AgentKind, mode: &str, input: Value) -> Self {
        Self {
            agent,
            mode: mode.to_string(),
            status: ExecutionStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            input,
            output: Value::Null,
            errors: Vec::new(),
            cost_usd: 0.0,
            tokens_used: 0,
        }
    }

    /// Duration in seconds; zero while still running.
    pub fn duration(&self) -> f64 {
        match self.end_time {
            Some(end) => (end - self.start_time)
                .to_std()
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
            None => 0.0,
        }
    }
}

/// Complete execution state of one workflow run.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowExecution {
    /// The original plan, retained for audit; adaptation never rewrites it.
    pub plan: Vec<PlanStep>,
    pub executions: Vec<AgentExecution>,
    pub current_index: usize,
    pub total_cost_usd: f64,
    pub total_tokens: u64,
    pub max_budget_usd: f64,
    pub workspace_path: String,
    pub user_query: String,
}

impl WorkflowExecution {
    pub fn new(
        plan: Vec<PlanStep>,
        workspace_path: impl Into<String>,
        user_query: impl Into<String>,
        max_budget_usd: f64,
    ) -> Self {
        Self {
            plan,
            executions: Vec::new(),
            current_index: 0,
            total_cost_usd: 0.0,
            total_tokens: 0,
            max_budget_usd,
            workspace_path: workspace_path.into(),
            user_query: user_query.into(),
        }
    }

    pub fn remaining_budget(&self) -> f64 {
        self.max_budget_usd - self.total_cost_usd
    }
}

// ============================================================================
// Workflow state
// ============================================================================

/// The mutable state threaded through agent executions.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkflowState {
    pub workspace_path: String,
    pub user_query: String,
    /// Mode of the agent currently executing.
    pub agent_mode: String,
    /// Per-agent result payloads; last writer wins on repeats.
    pub results: HashMap<String, Value>,
    pub errors: Vec<WorkflowError>,
    pub quality_scores: HashMap<String, f64>,
    pub agents_completed: Vec<String>,
    pub files_generated: Vec<String>,
    pub metadata: Map<String, Value>,
    pub user_abort: bool,
}

impl WorkflowState {
    pub fn new(workspace_path: impl Into<String>, user_query: impl Into<String>) -> Self {
        Self {
            workspace_path: workspace_path.into(),
            user_query: user_query.into(),
            ..Self::default()
        }
    }

    /// Shallow-merge a delta: list-valued fields append, map-valued fields
    /// overwrite per key, scalars replace. A delta carrying
    /// `replace_errors` rewrites the error list (a fixer resolving errors).
    pub fn merge(&mut self, delta: StateDelta) {
        for (agent, payload) in delta.results {
            self.results.insert(agent, payload);
        }
        if let Some(errors) = delta.replace_errors {
            self.errors = errors;
        } else {
            self.errors.extend(delta.errors);
        }
        for (agent, score) in delta.quality_scores {
            self.quality_scores.insert(agent, score);
        }
        self.agents_completed.extend(delta.agents_completed);
        self.files_generated.extend(delta.files_generated);
        for (key, value) in delta.metadata {
            self.metadata.insert(key, value);
        }
        if let Some(abort) = delta.user_abort {
            self.user_abort = abort;
        }
    }
}

/// What an agent executor hands back. Merged into [`WorkflowState`];
/// executors never mutate the state in place.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StateDelta {
    pub results: HashMap<String, Value>,
    pub errors: Vec<WorkflowError>,
    /// When set, replaces the accumulated error list instead of appending.
    pub replace_errors: Option<Vec<WorkflowError>>,
    pub quality_scores: HashMap<String, f64>,
    pub agents_completed: Vec<String>,
    pub files_generated: Vec<String>,
    pub metadata: Map<String, Value>,
    pub user_abort: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensemble_types::ErrorSeverity;
    use serde_json::json;

    #[test]
    fn plan_steps_use_default_modes() {
        let step = PlanStep::default_mode(AgentKind::Architect);
        assert_eq!(step.mode, "design");
        let step = PlanStep::default_mode(AgentKind::Codesmith);
        assert_eq!(step.mode, "default");
    }

    #[test]
    fn merge_appends_lists_and_overwrites_maps() {
        let mut state = WorkflowState::new("/tmp/ws", "build it");
        state.errors.push(WorkflowError::new("first", ErrorSeverity::Low));
        state.results.insert("research".into(), json!({"v": 1}));

        let mut delta = StateDelta::default();
        delta.errors.push(WorkflowError::new("second", ErrorSeverity::Medium));
        delta.results.insert("research".into(), json!({"v": 2}));
        delta.agents_completed.push("research".into());
        delta.quality_scores.insert("codesmith".into(), 0.9);
        state.merge(delta);

        assert_eq!(state.errors.len(), 2);
        assert_eq!(state.results["research"]["v"], 2);
        assert_eq!(state.agents_completed, vec!["research"]);
        assert_eq!(state.quality_scores["codesmith"], 0.9);
    }

    #[test]
    fn merge_replace_errors_rewrites_the_list() {
        let mut state = WorkflowState::new("/tmp/ws", "fix it");
        for i in 0..4 {
            state
                .errors
                .push(WorkflowError::new(format!("e{i}"), ErrorSeverity::Medium));
        }

        let delta = StateDelta {
            replace_errors: Some(vec![WorkflowError::new("leftover", ErrorSeverity::Low)]),
            ..StateDelta::default()
        };
        state.merge(delta);
        assert_eq!(state.errors.len(), 1);
        assert_eq!(state.errors[0].message, "leftover");
    }

    #[test]
    fn execution_duration_derived_from_timestamps() {
        let mut record = AgentExecution::running(AgentKind::Research, "research", json!({}));
        assert_eq!(record.duration(), 0.0);
        record.end_time = Some(record.start_time + chrono::Duration::milliseconds(1500));
        assert!((record.duration() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn remaining_budget_can_go_negative() {
        let mut execution = WorkflowExecution::new(vec![], "/tmp/ws", "q", 0.10);
        execution.total_cost_usd = 0.16;
        assert!(execution.remaining_budget() < 0.0);
    }
}
