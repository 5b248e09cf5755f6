// Agent Executor Interface
// Executors are external collaborators: opaque callables that read the
// workflow state and return a delta. They never mutate state in place.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value};

use ensemble_core::Result;
use ensemble_types::AgentKind;

use crate::types::{StateDelta, WorkflowState};

/// A queued agent-to-agent request.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub requester: AgentKind,
    pub target: AgentKind,
    pub mode: String,
    pub reason: String,
    pub inputs: Map<String, Value>,
}

/// Shared FIFO of self-call requests. Executors enqueue through the handle
/// they receive in [`ExecutionContext`]; the orchestrator drains after the
/// requesting agent returns.
#[derive(Clone, Default)]
pub struct RequestQueue {
    inner: Arc<Mutex<VecDeque<AgentRequest>>>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a request for another agent.
    pub fn request_agent(
        &self,
        requester: AgentKind,
        target: AgentKind,
        mode: impl Into<String>,
        reason: impl Into<String>,
        inputs: Option<Map<String, Value>>,
    ) {
        let request = AgentRequest {
            requester,
            target,
            mode: mode.into(),
            reason: reason.into(),
            inputs: inputs.unwrap_or_default(),
        };
        tracing::info!(
            requester = %request.requester,
            target = %request.target,
            mode = %request.mode,
            reason = %request.reason,
            "agent request queued"
        );
        self.inner
            .lock()
            .expect("request queue lock poisoned")
            .push_back(request);
    }

    pub(crate) fn pop(&self) -> Option<AgentRequest> {
        self.inner
            .lock()
            .expect("request queue lock poisoned")
            .pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.inner
            .lock()
            .expect("request queue lock poisoned")
            .is_empty()
    }
}

/// Handles an executor may use during a run.
#[derive(Clone)]
pub struct ExecutionContext {
    pub requests: RequestQueue,
}

/// One agent implementation.
///
/// `state` carries at minimum `workspace_path`, `user_query`, `agent_mode`
/// and the accumulated results. The returned delta is merged shallowly;
/// raising is captured by the orchestrator as a failed execution record,
/// never propagated to the session loop.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(&self, ctx: &ExecutionContext, state: &WorkflowState) -> Result<StateDelta>;
}

/// Executors keyed by agent identity.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<AgentKind, Arc<dyn AgentExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent: AgentKind, executor: Arc<dyn AgentExecutor>) {
        self.executors.insert(agent, executor);
    }

    pub fn get(&self, agent: AgentKind) -> Option<Arc<dyn AgentExecutor>> {
        self.executors.get(&agent).cloned()
    }

    pub fn agents(&self) -> Vec<AgentKind> {
        self.executors.keys().copied().collect()
    }
}
