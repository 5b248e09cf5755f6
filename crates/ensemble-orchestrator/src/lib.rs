pub mod adapter;
pub mod engine;
pub mod executors;
pub mod planner;
pub mod types;

pub use adapter::{
    AdaptationDecision, AdaptationReason, AdaptationStats, AdaptationType, LearningAdvisor,
    WorkflowAdapter, WorkflowContext,
};
pub use engine::{ApprovalChannel, ApprovalRequest, BudgetReport, DynamicOrchestrator};
pub use executors::{AgentExecutor, ExecutionContext, ExecutorRegistry, RequestQueue};
pub use planner::{fallback_plan, parse_plan, validate_plan, LlmPlanner, WorkflowPlanner};
pub use types::{
    AgentExecution, Complexity, ExecutionStatus, PlanStep, PlannedAgent, StateDelta,
    StepCondition, WorkflowExecution, WorkflowPlan, WorkflowState, WorkflowType,
};
