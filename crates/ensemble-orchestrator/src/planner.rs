// Workflow Planner
// Turns a user query into an ordered agent plan, delegating plan synthesis
// to the code-generation LLM over MCP. Parse failures fall back to the
// canonical CREATE pipeline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use ensemble_mcp::McpClient;
use ensemble_types::AgentKind;

use crate::types::{Complexity, PlannedAgent, StepCondition, WorkflowPlan, WorkflowType};

const PLANNER_TIMEOUT: Duration = Duration::from_secs(60);

/// Produces a workflow plan for a user query.
#[async_trait]
pub trait WorkflowPlanner: Send + Sync {
    async fn plan(
        &self,
        user_query: &str,
        workspace_path: &str,
        context: Option<&Value>,
    ) -> WorkflowPlan;
}

// ============================================================================
// LLM-backed planner
// ============================================================================

/// Planner backed by the `claude` MCP server's `generate` tool.
pub struct LlmPlanner {
    mcp: Arc<McpClient>,
    server: String,
}

impl LlmPlanner {
    pub fn new(mcp: Arc<McpClient>) -> Self {
        Self {
            mcp,
            server: "claude".to_string(),
        }
    }

    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = server.into();
        self
    }

    fn system_prompt() -> String {
        r#"You are a workflow planner for a multi-agent code-generation system.
Analyze the user request and produce an optimal execution plan.

# Available Agents
- research: gathers information, analyzes requirements, searches existing code
- architect: designs system architecture, plans file structure
- codesmith: generates code based on architecture and requirements
- reviewfix: reviews code quality, runs validation, fixes issues

# Output Format
Return ONLY a JSON object:
{
    "task_summary": "brief description of the task",
    "workflow_type": "CREATE|FIX|EXPLAIN|REFACTOR|CUSTOM",
    "complexity": "simple|moderate|complex",
    "estimated_duration": "e.g. 2-5 minutes",
    "agents": [
        {
            "agent": "research|architect|codesmith|reviewfix",
            "description": "what this agent will do",
            "condition": "always|if_success|if_failure|if_quality_low|parallel",
            "max_iterations": 1
        }
    ],
    "success_criteria": ["conditions that indicate success"],
    "requires_human_approval": false
}

# Common Patterns
1. CREATE: research -> architect -> codesmith -> reviewfix
2. FIX: research -> reviewfix (with loop)
3. EXPLAIN: research only

Not every task needs all agents. Be minimal."#
            .to_string()
    }

    fn build_user_prompt(user_query: &str, workspace_path: &str, context: Option<&Value>) -> String {
        let mut prompt = format!("Task: {user_query}\nWorkspace: {workspace_path}\n");
        if let Some(context) = context {
            if let Some(files) = context.get("existing_files") {
                prompt.push_str(&format!("Existing files in workspace: {files}\n"));
            }
            if let Some(error) = context.get("previous_error").and_then(Value::as_str) {
                prompt.push_str(&format!("Previous error: {error}\n"));
            }
        }
        prompt.push_str("\nCreate an optimal workflow plan for this task.");
        prompt
    }
}

#[async_trait]
impl WorkflowPlanner for LlmPlanner {
    async fn plan(
        &self,
        user_query: &str,
        workspace_path: &str,
        context: Option<&Value>,
    ) -> WorkflowPlan {
        tracing::info!(query = user_query, "planning workflow");

        let arguments = json!({
            "prompt": Self::build_user_prompt(user_query, workspace_path, context),
            "system_prompt": Self::system_prompt(),
        });

        let response = match self
            .mcp
            .call(&self.server, "generate", arguments, Some(PLANNER_TIMEOUT))
            .await
        {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, "planner LLM call failed, using fallback plan");
                return fallback_plan(user_query);
            }
        };

        let text = extract_text(&response);
        match parse_plan(&text) {
            Some(plan) => {
                tracing::info!(
                    agents = plan.agents.len(),
                    complexity = ?plan.complexity,
                    "workflow plan created"
                );
                plan
            }
            None => {
                tracing::error!("failed to parse planner output, using fallback plan");
                fallback_plan(user_query)
            }
        }
    }
}

// ============================================================================
// Parsing
// ============================================================================

#[derive(Deserialize)]
struct RawPlan {
    task_summary: String,
    workflow_type: String,
    complexity: String,
    estimated_duration: String,
    agents: Vec<RawAgent>,
    #[serde(default)]
    success_criteria: Vec<String>,
    #[serde(default)]
    requires_human_approval: bool,
}

#[derive(Deserialize)]
struct RawAgent {
    agent: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    condition: Option<String>,
    #[serde(default)]
    max_iterations: Option<u32>,
}

/// Pull the generated text out of the tool result, whatever its wrapping.
fn extract_text(result: &Value) -> String {
    if let Some(text) = result.as_str() {
        return text.to_string();
    }
    for key in ["content", "text", "response"] {
        if let Some(text) = result.get(key).and_then(Value::as_str) {
            return text.to_string();
        }
    }
    result.to_string()
}

/// Parse a plan out of model output, tolerating markdown fences and prose
/// around the JSON object.
pub fn parse_plan(text: &str) -> Option<WorkflowPlan> {
    let json_slice = extract_json_object(text)?;
    let raw: RawPlan = serde_json::from_str(json_slice).ok()?;

    let mut agents = Vec::new();
    for step in raw.agents {
        // Plans only admit the core identities; anything else is dropped
        // with a warning and the remainder executes.
        let Some(agent) = AgentKind::parse(&step.agent).filter(|a| a.is_core()) else {
            tracing::warn!(agent = %step.agent, "dropping unknown agent from plan");
            continue;
        };
        agents.push(PlannedAgent {
            agent,
            description: step.description,
            condition: parse_condition(step.condition.as_deref()),
            max_iterations: step.max_iterations.unwrap_or(1),
        });
    }
    if agents.is_empty() {
        return None;
    }

    Some(WorkflowPlan {
        task_description: raw.task_summary,
        workflow_type: parse_workflow_type(&raw.workflow_type),
        agents,
        success_criteria: raw.success_criteria,
        estimated_duration: raw.estimated_duration,
        complexity: parse_complexity(&raw.complexity),
        requires_human_approval: raw.requires_human_approval,
    })
}

fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn parse_condition(condition: Option<&str>) -> StepCondition {
    match condition {
        Some("if_success") => StepCondition::IfSuccess,
        Some("if_failure") => StepCondition::IfFailure,
        Some("if_quality_low") => StepCondition::IfQualityLow,
        Some("parallel") => StepCondition::Parallel,
        _ => StepCondition::Always,
    }
}

fn parse_workflow_type(value: &str) -> WorkflowType {
    match value.to_uppercase().as_str() {
        "CREATE" => WorkflowType::Create,
        "FIX" => WorkflowType::Fix,
        "EXPLAIN" => WorkflowType::Explain,
        "REFACTOR" => WorkflowType::Refactor,
        _ => WorkflowType::Custom,
    }
}

fn parse_complexity(value: &str) -> Complexity {
    match value.to_lowercase().as_str() {
        "simple" => Complexity::Simple,
        "complex" => Complexity::Complex,
        _ => Complexity::Moderate,
    }
}

// ============================================================================
// Fallback & validation
// ============================================================================

/// The canonical CREATE pipeline, used whenever planning fails.
pub fn fallback_plan(user_query: &str) -> WorkflowPlan {
    WorkflowPlan {
        task_description: user_query.to_string(),
        workflow_type: WorkflowType::Create,
        agents: vec![
            PlannedAgent {
                agent: AgentKind::Research,
                description: "Analyze requirements and gather information".to_string(),
                condition: StepCondition::Always,
                max_iterations: 1,
            },
            PlannedAgent {
                agent: AgentKind::Architect,
                description: "Design system architecture".to_string(),
                condition: StepCondition::Always,
                max_iterations: 1,
            },
            PlannedAgent {
                agent: AgentKind::Codesmith,
                description: "Generate code".to_string(),
                condition: StepCondition::Always,
                max_iterations: 1,
            },
            PlannedAgent {
                agent: AgentKind::Reviewfix,
                description: "Review and fix code".to_string(),
                condition: StepCondition::IfSuccess,
                max_iterations: 3,
            },
        ],
        success_criteria: vec![
            "All files generated".to_string(),
            "No syntax errors".to_string(),
            "Quality score > 0.80".to_string(),
        ],
        estimated_duration: "3-5 minutes".to_string(),
        complexity: Complexity::Moderate,
        requires_human_approval: false,
    }
}

/// Validate a plan. Returns `(ok, issues)`; an invalid plan is replaced by
/// the fallback at the call site.
pub fn validate_plan(plan: &WorkflowPlan) -> (bool, Vec<String>) {
    let mut issues = Vec::new();

    let mut seen = Vec::new();
    for step in &plan.agents {
        if seen.contains(&step.agent) && step.condition != StepCondition::Parallel {
            issues.push(format!("potential circular dependency: {}", step.agent));
        }
        seen.push(step.agent);

        if step.max_iterations > 10 {
            issues.push(format!(
                "excessive iterations for {}: {}",
                step.agent, step.max_iterations
            ));
        }
    }

    if plan.workflow_type == WorkflowType::Create
        && !plan.agents.iter().any(|s| s.agent == AgentKind::Codesmith)
    {
        issues.push("CREATE workflow missing codesmith agent".to_string());
    }

    (issues.is_empty(), issues)
}
