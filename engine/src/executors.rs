// Reference agent executors
// Thin implementations driving the MCP surface: research searches the web,
// architect designs, codesmith generates and writes files under the LLM
// lock, reviewfix validates the build and scores the result.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use ensemble_core::{CreditTracker, EnsembleError, Result};
use ensemble_mcp::McpClient;
use ensemble_orchestrator::{
    AgentExecutor, ExecutionContext, ExecutorRegistry, StateDelta, WorkflowState,
};
use ensemble_types::{AgentKind, ErrorSeverity, WorkflowError};

const LLM_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

pub fn build_executors(mcp: Arc<McpClient>, credit: Arc<CreditTracker>) -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    registry.register(
        AgentKind::Research,
        Arc::new(ResearchExecutor {
            mcp: mcp.clone(),
            credit: credit.clone(),
        }),
    );
    registry.register(
        AgentKind::Architect,
        Arc::new(ArchitectExecutor {
            mcp: mcp.clone(),
            credit: credit.clone(),
        }),
    );
    registry.register(
        AgentKind::Codesmith,
        Arc::new(CodesmithExecutor {
            mcp: mcp.clone(),
            credit: credit.clone(),
        }),
    );
    registry.register(
        AgentKind::Reviewfix,
        Arc::new(ReviewfixExecutor { mcp, credit }),
    );
    registry
}

fn mcp_err(e: ensemble_mcp::McpError) -> EnsembleError {
    EnsembleError::Mcp(e.to_string())
}

// Rough token estimate for credit accounting until servers report usage.
fn estimate_tokens(text: &str) -> u64 {
    (text.len() / 4) as u64
}

fn response_text(result: &Value) -> String {
    result
        .get("content")
        .or_else(|| result.get("text"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| result.to_string())
}

// ============================================================================
// research
// ============================================================================

struct ResearchExecutor {
    mcp: Arc<McpClient>,
    credit: Arc<CreditTracker>,
}

#[async_trait]
impl AgentExecutor for ResearchExecutor {
    async fn execute(&self, _ctx: &ExecutionContext, state: &WorkflowState) -> Result<StateDelta> {
        let result = self
            .mcp
            .call(
                "perplexity",
                "search",
                json!({"query": state.user_query, "max_results": 5}),
                None,
            )
            .await
            .map_err(mcp_err)?;

        self.credit
            .track_api_call("research", "perplexity", 0, 0, false)
            .await?;

        let mut delta = StateDelta::default();
        delta
            .results
            .insert("research".to_string(), json!({"findings": result}));
        Ok(delta)
    }
}

// ============================================================================
// architect
// ============================================================================

struct ArchitectExecutor {
    mcp: Arc<McpClient>,
    credit: Arc<CreditTracker>,
}

#[async_trait]
impl AgentExecutor for ArchitectExecutor {
    async fn execute(&self, _ctx: &ExecutionContext, state: &WorkflowState) -> Result<StateDelta> {
        let findings = state
            .results
            .get("research")
            .cloned()
            .unwrap_or(Value::Null);
        let prompt = format!(
            "Design a system architecture for this task:\n{}\n\nResearch findings:\n{}\n\n\
             Respond with JSON: {{\"architecture\": \"...\", \"tech_stack\": [...], \
             \"dependencies\": [{{\"name\": \"...\", \"status\": \"resolved|missing\"}}]}}",
            state.user_query, findings
        );

        let result = self
            .mcp
            .call("claude", "generate", json!({"prompt": prompt}), None)
            .await
            .map_err(mcp_err)?;
        let text = response_text(&result);
        self.credit
            .track_api_call(
                "architect",
                "claude",
                estimate_tokens(&prompt),
                estimate_tokens(&text),
                false,
            )
            .await?;

        // Structured output when the model cooperated, raw text otherwise.
        let payload = serde_json::from_str::<Value>(&text)
            .unwrap_or_else(|_| json!({"architecture": text}));

        let mut delta = StateDelta::default();
        delta.results.insert("architect".to_string(), payload);
        Ok(delta)
    }
}

// ============================================================================
// codesmith
// ============================================================================

struct CodesmithExecutor {
    mcp: Arc<McpClient>,
    credit: Arc<CreditTracker>,
}

#[async_trait]
impl AgentExecutor for CodesmithExecutor {
    async fn execute(&self, _ctx: &ExecutionContext, state: &WorkflowState) -> Result<StateDelta> {
        if !self.credit.acquire_llm_lock(LLM_LOCK_TIMEOUT).await {
            return Err(EnsembleError::Orchestrator(
                "could not acquire code-generator LLM lock".to_string(),
            ));
        }
        let result = self.generate_and_write(state).await;
        self.credit.release_llm_lock().await;
        result
    }
}

impl CodesmithExecutor {
    async fn generate_and_write(&self, state: &WorkflowState) -> Result<StateDelta> {
        let architecture = state
            .results
            .get("architect")
            .cloned()
            .unwrap_or(Value::Null);
        let prompt = format!(
            "Generate the code for this task:\n{}\n\nArchitecture:\n{}\n\n\
             Respond with JSON: {{\"files\": [{{\"path\": \"relative/path\", \"content\": \"...\"}}]}}",
            state.user_query, architecture
        );

        let result = self
            .mcp
            .call(
                "claude",
                "generate",
                json!({"prompt": prompt}),
                Some(Duration::from_secs(120)),
            )
            .await
            .map_err(mcp_err)?;
        let text = response_text(&result);
        self.credit
            .track_api_call(
                "codesmith",
                "claude",
                estimate_tokens(&prompt),
                estimate_tokens(&text),
                false,
            )
            .await?;

        let mut delta = StateDelta::default();
        let files = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| v.get("files").and_then(Value::as_array).cloned())
            .unwrap_or_default();

        for file in &files {
            let (Some(path), Some(content)) = (
                file.get("path").and_then(Value::as_str),
                file.get("content").and_then(Value::as_str),
            ) else {
                continue;
            };
            self.mcp
                .call(
                    "file_tools",
                    "write_file",
                    json!({"path": path, "content": content}),
                    None,
                )
                .await
                .map_err(mcp_err)?;
            delta.files_generated.push(path.to_string());
        }

        delta.results.insert(
            "codesmith".to_string(),
            json!({"files_written": delta.files_generated.len()}),
        );
        Ok(delta)
    }
}

// ============================================================================
// reviewfix
// ============================================================================

struct ReviewfixExecutor {
    mcp: Arc<McpClient>,
    credit: Arc<CreditTracker>,
}

#[async_trait]
impl AgentExecutor for ReviewfixExecutor {
    async fn execute(&self, _ctx: &ExecutionContext, state: &WorkflowState) -> Result<StateDelta> {
        let validation = self
            .mcp
            .call("build_validation", "validate", json!({}), None)
            .await
            .map_err(mcp_err)?;
        let passed = validation
            .get("passed")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        let prompt = format!(
            "Review the generated files {:?} for task: {}\nValidation result: {}\n\
             Respond with JSON: {{\"quality_score\": 0.0, \"feedback\": \"...\"}}",
            state.files_generated, state.user_query, validation
        );
        let result = self
            .mcp
            .call("claude", "generate", json!({"prompt": prompt}), None)
            .await
            .map_err(mcp_err)?;
        let text = response_text(&result);
        self.credit
            .track_api_call(
                "reviewfix",
                "claude",
                estimate_tokens(&prompt),
                estimate_tokens(&text),
                false,
            )
            .await?;

        let quality = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| v.get("quality_score").and_then(Value::as_f64))
            .unwrap_or(if passed { 0.9 } else { 0.5 });

        let mut delta = StateDelta::default();
        delta
            .quality_scores
            .insert("reviewfix".to_string(), quality);
        if !passed {
            delta.errors.push(WorkflowError::from_agent(
                AgentKind::Reviewfix,
                format!("build validation failed: {validation}"),
                ErrorSeverity::Medium,
            ));
        }
        delta.results.insert(
            "reviewfix".to_string(),
            json!({"quality_score": quality, "validation_passed": passed}),
        );
        Ok(delta)
    }
}
