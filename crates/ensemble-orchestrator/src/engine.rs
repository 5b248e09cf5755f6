// Dynamic Orchestrator
// Executes an AI-generated plan step by step: permission gate, budget gate,
// approval protocol, executor dispatch, self-call draining, and an adapter
// pass between steps.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use ensemble_core::{
    CapabilityRegistry, CreditTracker, EnsembleError, Permission, PermissionsManager,
};
use ensemble_types::{
    AgentKind, ErrorSeverity, RiskLevel, WorkflowError, WorkflowEvent,
};

use crate::adapter::{AdaptationType, WorkflowAdapter, WorkflowContext};
use crate::executors::{ExecutionContext, ExecutorRegistry, RequestQueue};
use crate::types::{
    AgentExecution, ExecutionStatus, PlanStep, StateDelta, WorkflowExecution, WorkflowPlan,
    WorkflowState,
};

const HISTORY_LIMIT: usize = 50;

// ============================================================================
// Approval protocol
// ============================================================================

/// An approval request surfaced to the client before a gated step runs.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequest {
    pub agent: AgentKind,
    pub mode: String,
    pub description: String,
    pub risk_level: RiskLevel,
}

/// Channel through which approval requests reach the user. Implementations
/// bound the wait themselves; a timeout counts as denial.
#[async_trait]
pub trait ApprovalChannel: Send + Sync {
    async fn request_approval(&self, request: ApprovalRequest) -> bool;
}

// ============================================================================
// Budget reporting
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct BudgetReport {
    pub total_budget: f64,
    pub spent: f64,
    pub remaining: f64,
    pub tokens_used: u64,
    pub agents_executed: usize,
    pub cost_breakdown: Vec<CostBreakdown>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CostBreakdown {
    pub agent: AgentKind,
    pub mode: String,
    pub cost: f64,
    pub duration: f64,
}

// ============================================================================
// Orchestrator
// ============================================================================

struct StepOutcome {
    status: ExecutionStatus,
    delta: Option<StateDelta>,
    error: Option<WorkflowError>,
}

/// Workflow execution engine: runs a plan as a mutable pending queue,
/// one agent at a time.
pub struct DynamicOrchestrator {
    workspace_path: String,
    executors: ExecutorRegistry,
    permissions: Arc<PermissionsManager>,
    credit: Arc<CreditTracker>,
    approval: Option<Arc<dyn ApprovalChannel>>,
    event_tx: Option<tokio::sync::mpsc::UnboundedSender<WorkflowEvent>>,
    adapter: WorkflowAdapter,
    max_budget: f64,
    adapt_every_step: bool,
    requests: RequestQueue,
    cancel: CancellationToken,
    current: Option<WorkflowExecution>,
    history: VecDeque<WorkflowExecution>,
}

impl DynamicOrchestrator {
    pub fn new(
        workspace_path: impl Into<String>,
        executors: ExecutorRegistry,
        permissions: Arc<PermissionsManager>,
        credit: Arc<CreditTracker>,
    ) -> Self {
        let workspace_path = workspace_path.into();
        tracing::info!(workspace = %workspace_path, "dynamic orchestrator initialized");
        Self {
            workspace_path,
            executors,
            permissions,
            credit,
            approval: None,
            event_tx: None,
            adapter: WorkflowAdapter::new(),
            max_budget: 10.0,
            adapt_every_step: true,
            requests: RequestQueue::new(),
            cancel: CancellationToken::new(),
            current: None,
            history: VecDeque::new(),
        }
    }

    pub fn with_budget(mut self, max_budget: f64) -> Self {
        self.max_budget = max_budget;
        self
    }

    pub fn with_approval_channel(mut self, channel: Arc<dyn ApprovalChannel>) -> Self {
        self.approval = Some(channel);
        self
    }

    pub fn with_event_sender(
        mut self,
        tx: tokio::sync::mpsc::UnboundedSender<WorkflowEvent>,
    ) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn with_adapter(mut self, adapter: WorkflowAdapter) -> Self {
        self.adapter = adapter;
        self
    }

    /// Disable the per-step adapter pass; the adapter then runs only when
    /// the pending queue drains.
    pub fn with_adapt_every_step(mut self, enabled: bool) -> Self {
        self.adapt_every_step = enabled;
        self
    }

    /// Handle executors use to enqueue self-calls.
    pub fn request_queue(&self) -> RequestQueue {
        self.requests.clone()
    }

    /// Token a session may cancel; observed at the next early-termination
    /// check, the in-flight agent is allowed to finish.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Execute a full plan. Convenience wrapper over [`execute_workflow`].
    ///
    /// [`execute_workflow`]: DynamicOrchestrator::execute_workflow
    pub async fn execute_plan(
        &mut self,
        plan: &WorkflowPlan,
        user_query: &str,
        initial_state: WorkflowState,
    ) -> WorkflowState {
        let path: Vec<String> = plan
            .agents
            .iter()
            .map(|a| a.agent.as_str().to_string())
            .collect();
        self.execute_workflow(&path, &HashMap::new(), user_query, initial_state)
            .await
    }

    /// Main entry point: execute the named agents in order, adapting the
    /// pending queue between steps, until the queue drains, the budget is
    /// exhausted, or early termination triggers.
    pub async fn execute_workflow(
        &mut self,
        workflow_path: &[String],
        agent_modes: &HashMap<String, String>,
        user_query: &str,
        initial_state: WorkflowState,
    ) -> WorkflowState {
        let mut pending: Vec<PlanStep> = Vec::new();
        for name in workflow_path {
            match AgentKind::parse(name) {
                Some(agent) => {
                    let mode = agent_modes
                        .get(name)
                        .cloned()
                        .unwrap_or_else(|| CapabilityRegistry::default_mode(agent).to_string());
                    pending.push(PlanStep::new(agent, mode));
                }
                None => tracing::warn!(agent = %name, "unknown agent in plan, dropping"),
            }
        }

        tracing::info!(
            plan = %pending.iter().map(|s| s.agent.as_str()).collect::<Vec<_>>().join(" -> "),
            budget = self.max_budget,
            "starting dynamic workflow execution"
        );

        self.current = Some(WorkflowExecution::new(
            pending.clone(),
            &self.workspace_path,
            user_query,
            self.max_budget,
        ));

        let mut state = initial_state;
        state.workspace_path = self.workspace_path.clone();
        state.user_query = user_query.to_string();
        let mut completed: Vec<AgentKind> = Vec::new();
        let start_time = Utc::now();

        'run: loop {
            while !pending.is_empty() {
                let remaining = self.execution().remaining_budget();
                if remaining <= 0.0 {
                    tracing::error!(remaining, "budget exhausted, aborting workflow");
                    state
                        .errors
                        .push(WorkflowError::new("Budget exhausted", ErrorSeverity::High));
                    self.emit(WorkflowEvent::BudgetExhausted {
                        remaining,
                        timestamp: Utc::now(),
                    });
                    break 'run;
                }

                let step = pending.remove(0);
                let step_number = self.execution().executions.len() + 1;
                let total = step_number + pending.len();
                tracing::info!(
                    agent = %step.agent,
                    mode = %step.mode,
                    step = step_number,
                    total,
                    remaining_budget = remaining,
                    "executing agent"
                );
                self.emit(WorkflowEvent::StepStarted {
                    agent: step.agent,
                    mode: step.mode.clone(),
                    step: step_number,
                    total,
                    remaining_budget: remaining,
                    timestamp: Utc::now(),
                });

                let outcome = self.run_step(&step, &state).await;
                state.agent_mode = step.mode.clone();
                self.absorb_outcome(step.agent, outcome, &mut state, &mut completed);

                self.drain_agent_requests(&mut state, &mut completed).await;
                self.execution_mut().current_index += 1;

                let mut remedy_applied = false;
                if self.adapt_every_step {
                    remedy_applied = self
                        .run_adapter_pass(&completed, &mut pending, user_query, start_time, &mut state)
                        .await;
                    if workflow_aborted(&state) {
                        self.emit_aborted(&state);
                        break 'run;
                    }
                }

                if self.should_terminate_early(&state, remedy_applied) {
                    break 'run;
                }
            }

            // Plan drained. Without per-step adaptation the adapter runs
            // here and the loop condition is re-evaluated.
            if !self.adapt_every_step {
                self.run_adapter_pass(&completed, &mut pending, user_query, start_time, &mut state)
                    .await;
                if workflow_aborted(&state) {
                    self.emit_aborted(&state);
                    break;
                }
                if !pending.is_empty() {
                    continue 'run;
                }
            }
            break;
        }

        let execution = self.execution();
        tracing::info!(
            total_cost = execution.total_cost_usd,
            total_tokens = execution.total_tokens,
            agents_executed = execution.executions.len(),
            "workflow execution complete"
        );
        let success = state.errors.is_empty() && !workflow_aborted(&state);
        self.emit(WorkflowEvent::WorkflowCompleted {
            success,
            total_cost_usd: execution.total_cost_usd,
            timestamp: Utc::now(),
        });

        if let Some(execution) = self.current.take() {
            self.history.push_back(execution);
            while self.history.len() > HISTORY_LIMIT {
                self.history.pop_front();
            }
        }

        state
    }

    // ========================================================================
    // Per-step execution
    // ========================================================================

    async fn run_step(&mut self, step: &PlanStep, state: &WorkflowState) -> StepOutcome {
        let agent = step.agent;
        let mode = step.mode.as_str();
        let mut record = AgentExecution::running(
            agent,
            mode,
            json!({"workspace_path": self.workspace_path, "mode": mode}),
        );

        // Unknown modes fall back to the agent's default for estimates.
        let spec = CapabilityRegistry::get_mode(agent, Some(mode))
            .or_else(|| CapabilityRegistry::get_mode(agent, None));
        let estimated_cost = spec.map(|s| s.cost_estimate).unwrap_or(0.0);
        let risk_level = spec.map(|s| s.risk_level).unwrap_or(RiskLevel::WritesFiles);
        tracing::info!(
            estimated_cost,
            estimated_latency = spec.map(|s| s.latency_estimate).unwrap_or(0.0),
            "step estimates"
        );

        // Permission gate: every side-effecting mode needs its permission
        // before the executor is invoked.
        let permission = permission_for_risk(risk_level);
        match self.permissions.check_and_enforce(
            agent.as_str(),
            &format!("{agent}:{mode}"),
            permission,
            false,
        ) {
            Ok((true, _)) => {}
            Ok((false, message)) => {
                tracing::warn!(agent = %agent, %message, "permission denied, skipping step");
                self.emit(WorkflowEvent::AgentActivity {
                    agent,
                    event_type: "permission_denied".to_string(),
                    payload: Some(json!({"message": message.clone()})),
                    timestamp: Utc::now(),
                });
                record.status = ExecutionStatus::Skipped;
                record.end_time = Some(Utc::now());
                record.errors.push(message);
                return self.finish_step(record, None, None);
            }
            Err(e) => {
                record.status = ExecutionStatus::Failed;
                record.end_time = Some(Utc::now());
                record.errors.push(e.to_string());
                let error = WorkflowError::from_agent(agent, e.to_string(), ErrorSeverity::High);
                return self.finish_step(record, None, Some(error));
            }
        }

        if spec.is_some_and(|s| s.requires_approval) {
            let approved = self.request_approval(agent, mode, risk_level).await;
            if !approved {
                tracing::warn!(agent = %agent, "approval denied, skipping agent");
                record.status = ExecutionStatus::Skipped;
                record.end_time = Some(Utc::now());
                return self.finish_step(record, None, None);
            }
        }

        let Some(executor) = self.executors.get(agent) else {
            tracing::error!(agent = %agent, "no executor registered");
            record.status = ExecutionStatus::Failed;
            record.end_time = Some(Utc::now());
            record.errors.push(format!("No executor for {agent}"));
            let error = WorkflowError::from_agent(
                agent,
                format!("No executor for {agent}"),
                ErrorSeverity::Medium,
            );
            return self.finish_step(record, None, Some(error));
        };

        let mut exec_state = state.clone();
        exec_state.agent_mode = mode.to_string();
        let ctx = ExecutionContext {
            requests: self.requests.clone(),
        };

        match executor.execute(&ctx, &exec_state).await {
            Ok(delta) => {
                record.end_time = Some(Utc::now());
                record.status = ExecutionStatus::Success;
                record.output = serde_json::to_value(&delta).unwrap_or(Value::Null);
                // Future: actual cost and tokens reported by the executor.
                record.cost_usd = estimated_cost;
                tracing::info!(agent = %agent, duration = record.duration(), "agent completed");
                self.finish_step(record, Some(delta), None)
            }
            Err(e) => {
                tracing::error!(agent = %agent, error = %e, "agent failed");
                record.end_time = Some(Utc::now());
                record.status = ExecutionStatus::Failed;
                record.errors.push(e.to_string());
                let severity = match &e {
                    EnsembleError::EmergencyShutdown(_) => ErrorSeverity::Critical,
                    _ => ErrorSeverity::Medium,
                };
                let error = WorkflowError::from_agent(agent, format!("{agent}: {e}"), severity);
                self.finish_step(record, None, Some(error))
            }
        }
    }

    fn finish_step(
        &mut self,
        record: AgentExecution,
        delta: Option<StateDelta>,
        error: Option<WorkflowError>,
    ) -> StepOutcome {
        let status = record.status;
        self.emit(WorkflowEvent::StepFinished {
            agent: record.agent,
            mode: record.mode.clone(),
            status: status_name(status),
            cost_usd: record.cost_usd,
            timestamp: Utc::now(),
        });
        let execution = self.execution_mut();
        execution.total_cost_usd += record.cost_usd;
        execution.total_tokens += record.tokens_used;
        execution.executions.push(record);
        StepOutcome {
            status,
            delta,
            error,
        }
    }

    fn absorb_outcome(
        &mut self,
        agent: AgentKind,
        outcome: StepOutcome,
        state: &mut WorkflowState,
        completed: &mut Vec<AgentKind>,
    ) {
        if let Some(delta) = outcome.delta {
            state.merge(delta);
        }
        if outcome.status == ExecutionStatus::Success {
            state.agents_completed.push(agent.as_str().to_string());
            completed.push(agent);
        }
        if let Some(error) = outcome.error {
            state.errors.push(error);
        }
    }

    // ========================================================================
    // Agent self-calls
    // ========================================================================

    /// Drain queued agent-to-agent requests FIFO, budget permitting. Inputs
    /// are merged into a copy of the state; the resulting delta flows back
    /// into the main state.
    async fn drain_agent_requests(
        &mut self,
        state: &mut WorkflowState,
        completed: &mut Vec<AgentKind>,
    ) {
        while let Some(request) = self.requests.pop() {
            if self.execution().remaining_budget() <= 0.0 {
                tracing::warn!("cannot fulfill agent request, budget exhausted");
                break;
            }
            tracing::info!(target = %request.target, mode = %request.mode, "processing agent request");

            let mut call_state = state.clone();
            for (key, value) in request.inputs.clone() {
                call_state.metadata.insert(key, value);
            }
            let mode = if request.mode.is_empty() {
                CapabilityRegistry::default_mode(request.target).to_string()
            } else {
                request.mode.clone()
            };
            let step = PlanStep::new(request.target, mode);
            let outcome = self.run_step(&step, &call_state).await;
            self.absorb_outcome(request.target, outcome, state, completed);
        }
    }

    // ========================================================================
    // Adapter coordination
    // ========================================================================

    /// One adapter pass. Returns true when an insert/repeat remedy was
    /// applied, which defers the error-count termination for this round.
    async fn run_adapter_pass(
        &mut self,
        completed: &[AgentKind],
        pending: &mut Vec<PlanStep>,
        user_query: &str,
        start_time: DateTime<Utc>,
        state: &mut WorkflowState,
    ) -> bool {
        let context = WorkflowContext {
            task_description: user_query.to_string(),
            current_phase: completed
                .last()
                .map(|a| a.as_str().to_string())
                .unwrap_or_else(|| "start".to_string()),
            completed_agents: completed.to_vec(),
            pending_agents: pending.iter().map(|s| s.agent).collect(),
            results: state.results.clone(),
            errors: state.errors.clone(),
            quality_scores: state.quality_scores.clone(),
            metadata: state.metadata.clone(),
            workspace_path: self.workspace_path.clone(),
            start_time,
        };

        let decisions = self.adapter.analyze(&context).await;
        let mut remedy_applied = false;
        for decision in decisions {
            remedy_applied |= matches!(
                decision.adaptation,
                AdaptationType::InsertAgent | AdaptationType::RepeatAgent
            );
            self.adapter
                .apply(decision, pending, &mut state.metadata);
        }
        remedy_applied
    }

    // ========================================================================
    // Early termination
    // ========================================================================

    /// The workflow stops early on accumulated errors, a critical error
    /// message, or a user abort. An adapter remedy (insert/repeat) applied
    /// this round defers the plain error-count check so the remedy gets a
    /// chance to run.
    fn should_terminate_early(&self, state: &WorkflowState, remedy_applied: bool) -> bool {
        if state.errors.len() >= 3 && !remedy_applied {
            tracing::error!(errors = state.errors.len(), "too many errors, terminating");
            return true;
        }
        for error in &state.errors {
            if error.message.to_lowercase().contains("critical") {
                tracing::error!("critical error detected, terminating");
                return true;
            }
        }
        if state.user_abort || self.cancel.is_cancelled() {
            tracing::warn!("user requested abort");
            return true;
        }
        false
    }

    // ========================================================================
    // Approval
    // ========================================================================

    async fn request_approval(&self, agent: AgentKind, mode: &str, risk: RiskLevel) -> bool {
        match &self.approval {
            None => {
                tracing::warn!(agent = %agent, "no approval channel wired, auto-approving");
                tokio::time::sleep(Duration::from_millis(100)).await;
                true
            }
            Some(channel) => {
                tracing::info!(agent = %agent, mode, "requesting approval");
                channel
                    .request_approval(ApprovalRequest {
                        agent,
                        mode: mode.to_string(),
                        description: format!("{agent} wants to {mode}"),
                        risk_level: risk,
                    })
                    .await
            }
        }
    }

    // ========================================================================
    // Reporting
    // ========================================================================

    /// Budget report over the current (or most recent) execution.
    pub fn get_budget_report(&self) -> Option<BudgetReport> {
        let execution = self.current.as_ref().or_else(|| self.history.back())?;
        Some(BudgetReport {
            total_budget: execution.max_budget_usd,
            spent: execution.total_cost_usd,
            remaining: execution.remaining_budget(),
            tokens_used: execution.total_tokens,
            agents_executed: execution.executions.len(),
            cost_breakdown: execution
                .executions
                .iter()
                .map(|e| CostBreakdown {
                    agent: e.agent,
                    mode: e.mode.clone(),
                    cost: e.cost_usd,
                    duration: e.duration(),
                })
                .collect(),
        })
    }

    /// Completed executions, oldest first, bounded.
    pub fn history(&self) -> &VecDeque<WorkflowExecution> {
        &self.history
    }

    pub fn adaptation_stats(&self) -> crate::adapter::AdaptationStats {
        self.adapter.stats()
    }

    pub fn credit(&self) -> &Arc<CreditTracker> {
        &self.credit
    }

    fn execution(&self) -> &WorkflowExecution {
        self.current.as_ref().expect("no active execution")
    }

    fn execution_mut(&mut self) -> &mut WorkflowExecution {
        self.current.as_mut().expect("no active execution")
    }

    fn emit(&self, event: WorkflowEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    fn emit_aborted(&self, state: &WorkflowState) {
        let reason = state
            .metadata
            .get("abort_reason")
            .map(|v| v.to_string())
            .unwrap_or_else(|| "aborted".to_string());
        tracing::warn!(%reason, "workflow aborted by adapter decision");
        self.emit(WorkflowEvent::WorkflowAborted {
            reason,
            timestamp: Utc::now(),
        });
    }
}

fn workflow_aborted(state: &WorkflowState) -> bool {
    state
        .metadata
        .get("aborted")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn permission_for_risk(risk: RiskLevel) -> Permission {
    match risk {
        RiskLevel::ReadOnly => Permission::CanReadFiles,
        RiskLevel::WritesFiles => Permission::CanWriteFiles,
        RiskLevel::Networked => Permission::CanWebSearch,
        RiskLevel::Critical => Permission::CanModifySystem,
    }
}

fn status_name(status: ExecutionStatus) -> String {
    serde_json::to_value(status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}
