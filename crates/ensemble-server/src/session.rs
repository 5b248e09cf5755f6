// Session state machine
// connected -> initialized -> running -> idle -> (running ...), with frame
// handling decoupled from the socket so the protocol is testable directly.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use ensemble_orchestrator::{
    fallback_plan, validate_plan, DynamicOrchestrator, WorkflowState,
};
use ensemble_types::{ClientFrame, ServerFrame, WorkflowEvent};

use crate::approval::{ApprovalBroker, WsApprovalChannel};
use crate::{AppState, SessionOutput, SessionRuntime, SERVER_VERSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionPhase {
    Connected,
    Initialized,
    Running,
    Idle,
}

pub struct Session {
    id: String,
    app: AppState,
    phase: SessionPhase,
    workspace_path: Option<PathBuf>,
    runtime: Option<Arc<SessionRuntime>>,
    approvals: Arc<ApprovalBroker>,
    out: mpsc::UnboundedSender<SessionOutput>,
}

impl Session {
    pub fn new(app: AppState, out: mpsc::UnboundedSender<SessionOutput>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            app,
            phase: SessionPhase::Connected,
            workspace_path: None,
            runtime: None,
            approvals: Arc::new(ApprovalBroker::new()),
            out,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Send the welcome frame; the client must init before anything else.
    pub fn on_connect(&self) {
        tracing::info!(session = %self.id, "client connected");
        self.send(ServerFrame::Connection {
            session_id: self.id.clone(),
            version: SERVER_VERSION.to_string(),
            requires_init: true,
        });
    }

    /// Handle one raw text frame from the client. Malformed input gets an
    /// error frame; the connection stays open in its current phase.
    pub async fn handle_text(&mut self, text: &str) {
        match serde_json::from_str::<ClientFrame>(text) {
            Ok(frame) => self.handle_frame(frame).await,
            Err(e) => {
                tracing::debug!(session = %self.id, error = %e, "malformed client frame");
                self.send_error("unrecognized or malformed frame", Some("bad_frame"));
            }
        }
    }

    async fn handle_frame(&mut self, frame: ClientFrame) {
        match frame {
            ClientFrame::Init { workspace_path } => self.handle_init(workspace_path).await,
            ClientFrame::Chat { content } => self.handle_chat(content),
            ClientFrame::ApprovalResponse {
                approved,
                approval_id,
            } => {
                self.approvals
                    .resolve(approval_id.as_deref(), approved)
                    .await;
            }
            ClientFrame::Ping => self.send(ServerFrame::Pong),
        }
    }

    async fn handle_init(&mut self, workspace_path: String) {
        if self.phase != SessionPhase::Connected {
            self.send_error("session already initialized", Some("already_initialized"));
            return;
        }

        let path = PathBuf::from(&workspace_path);
        let is_dir = tokio::fs::metadata(&path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            self.send_error(
                format!("workspace path is not a directory: {workspace_path}"),
                Some("invalid_workspace"),
            );
            return;
        }

        match self.app.backend.start(&path).await {
            Ok(runtime) => {
                self.runtime = Some(Arc::new(runtime));
                self.workspace_path = Some(path);
                self.phase = SessionPhase::Initialized;
                tracing::info!(session = %self.id, workspace = %workspace_path, "session initialized");
                self.send(ServerFrame::Initialized {
                    session_id: self.id.clone(),
                    workspace_path,
                });
            }
            Err(e) => {
                tracing::error!(session = %self.id, error = %e, "session backend failed to start");
                self.send_error(format!("failed to start session: {e}"), Some("backend_error"));
            }
        }
    }

    fn handle_chat(&mut self, content: String) {
        match self.phase {
            SessionPhase::Connected => {
                self.send_error("init required before chat", Some("init_required"));
            }
            SessionPhase::Running => {
                self.send_error("an execution is already running", Some("busy"));
            }
            SessionPhase::Initialized | SessionPhase::Idle => {
                let runtime = self.runtime.clone().expect("initialized session has runtime");
                let workspace = self
                    .workspace_path
                    .clone()
                    .expect("initialized session has workspace");
                self.phase = SessionPhase::Running;

                let app = self.app.clone();
                let approvals = self.approvals.clone();
                let out = self.out.clone();
                tokio::spawn(async move {
                    run_workflow(app, runtime, approvals, out.clone(), workspace, content).await;
                    let _ = out.send(SessionOutput::ExecutionFinished);
                });
            }
        }
    }

    /// The spawned execution finished; the session can accept another query.
    pub fn on_execution_finished(&mut self) {
        if self.phase == SessionPhase::Running {
            self.phase = SessionPhase::Idle;
        }
    }

    /// Socket gone. A running workflow is left to finish (its execution is
    /// archived either way); otherwise the MCP subprocesses are shut down.
    pub async fn on_disconnect(&mut self) {
        tracing::info!(session = %self.id, "client disconnected");
        if self.phase != SessionPhase::Running {
            if let Some(runtime) = &self.runtime {
                if let Some(mcp) = &runtime.mcp {
                    mcp.close().await;
                }
            }
        }
    }

    fn send(&self, frame: ServerFrame) {
        let _ = self.out.send(SessionOutput::Frame(frame));
    }

    fn send_error(&self, message: impl Into<String>, code: Option<&str>) {
        self.send(ServerFrame::Error {
            message: message.into(),
            code: code.map(str::to_string),
        });
    }
}

// ============================================================================
// Workflow execution
// ============================================================================

async fn run_workflow(
    app: AppState,
    runtime: Arc<SessionRuntime>,
    approvals: Arc<ApprovalBroker>,
    out: mpsc::UnboundedSender<SessionOutput>,
    workspace: PathBuf,
    query: String,
) {
    let started = Instant::now();
    let send = |frame: ServerFrame| {
        let _ = out.send(SessionOutput::Frame(frame));
    };

    send(ServerFrame::Status {
        message: "Planning workflow".to_string(),
        phase: Some("planning".to_string()),
    });

    let workspace_str = workspace.to_string_lossy().to_string();
    let mut plan = runtime.planner.plan(&query, &workspace_str, None).await;
    let (ok, issues) = validate_plan(&plan);
    if !ok {
        tracing::warn!(?issues, "invalid plan, falling back to default pipeline");
        send(ServerFrame::Status {
            message: format!("Plan rejected ({}), using default pipeline", issues.join("; ")),
            phase: Some("planning".to_string()),
        });
        plan = fallback_plan(&query);
    }

    send(ServerFrame::ModelSelection {
        model: "claude".to_string(),
        reason: "code-generation planner backend".to_string(),
    });
    send(ServerFrame::Status {
        message: format!(
            "Plan ready: {}",
            plan.agents
                .iter()
                .map(|a| a.agent.as_str())
                .collect::<Vec<_>>()
                .join(" -> ")
        ),
        phase: Some("planned".to_string()),
    });

    // Bridge orchestrator events into frames as they occur.
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<WorkflowEvent>();
    let forward_out = out.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            for frame in frames_for_event(event) {
                let _ = forward_out.send(SessionOutput::Frame(frame));
            }
        }
    });

    let approval_channel = WsApprovalChannel::new(
        approvals,
        out.clone(),
        Duration::from_secs(app.config.approval_timeout_secs),
    );
    let mut orchestrator = DynamicOrchestrator::new(
        workspace_str.clone(),
        runtime.executors.clone(),
        runtime.permissions.clone(),
        app.credit.clone(),
    )
    .with_budget(app.config.max_budget_usd)
    .with_adapt_every_step(app.config.adapt_every_step)
    .with_event_sender(event_tx)
    .with_approval_channel(Arc::new(approval_channel));

    let initial = WorkflowState::new(workspace_str, &query);
    let final_state = orchestrator.execute_plan(&plan, &query, initial).await;

    let adaptations = serde_json::to_value(orchestrator.adaptation_stats()).ok();
    drop(orchestrator);
    let _ = forwarder.await;

    let aborted = final_state
        .metadata
        .get("aborted")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let success = final_state.errors.is_empty() && !aborted;
    let quality_score = ["reviewfix", "reviewer", "codesmith"]
        .iter()
        .find_map(|agent| final_state.quality_scores.get(*agent))
        .copied();

    send(ServerFrame::Result {
        success,
        execution_time: started.elapsed().as_secs_f64(),
        quality_score,
        agents_completed: final_state.agents_completed.clone(),
        files_generated: final_state.files_generated.clone(),
        errors: final_state.errors.iter().map(|e| e.message.clone()).collect(),
        adaptations,
    });
}

fn frames_for_event(event: WorkflowEvent) -> Vec<ServerFrame> {
    match event {
        WorkflowEvent::StepStarted {
            agent,
            mode,
            step,
            total,
            remaining_budget,
            ..
        } => vec![
            ServerFrame::Status {
                message: format!(
                    "Executing {agent} ({mode}), step {step}/{total}, ${remaining_budget:.2} remaining"
                ),
                phase: Some(agent.as_str().to_string()),
            },
            ServerFrame::Progress {
                node: agent.as_str().to_string(),
                fraction: Some((step.saturating_sub(1)) as f64 / total.max(1) as f64),
            },
        ],
        WorkflowEvent::StepFinished {
            agent,
            mode,
            status,
            cost_usd,
            ..
        } => vec![ServerFrame::AgentEvent {
            agent: agent.as_str().to_string(),
            event_type: status,
            payload: Some(serde_json::json!({"mode": mode, "cost_usd": cost_usd})),
        }],
        WorkflowEvent::AgentActivity {
            agent,
            event_type,
            payload,
            ..
        } => vec![ServerFrame::AgentEvent {
            agent: agent.as_str().to_string(),
            event_type,
            payload,
        }],
        WorkflowEvent::BudgetExhausted { remaining, .. } => vec![ServerFrame::Status {
            message: format!("Budget exhausted (${remaining:.2} remaining)"),
            phase: Some("terminated".to_string()),
        }],
        WorkflowEvent::WorkflowAborted { reason, .. } => vec![ServerFrame::Status {
            message: format!("Workflow aborted: {reason}"),
            phase: Some("aborted".to_string()),
        }],
        WorkflowEvent::WorkflowCompleted { .. } => Vec::new(),
    }
}
