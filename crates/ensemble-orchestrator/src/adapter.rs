// Workflow Adapter
// Rule-based analysis of intermediate results into adaptation decisions.
// Analysis is a pure function of the context; the orchestrator owns all
// mutation and applies decisions through `apply`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};

use ensemble_types::{AgentKind, WorkflowError};

use crate::types::PlanStep;

// ============================================================================
// Decisions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdaptationType {
    InsertAgent,
    SkipAgent,
    RepeatAgent,
    ReorderAgents,
    ChangeParameters,
    AbortWorkflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdaptationReason {
    ErrorDetected,
    QualityIssue,
    MissingDependency,
    Optimization,
    UserFeedback,
    ResourceConstraint,
}

/// A structured instruction mutating the pending queue or metadata.
#[derive(Debug, Clone, Serialize)]
pub struct AdaptationDecision {
    pub adaptation: AdaptationType,
    pub reason: AdaptationReason,
    pub agent: Option<AgentKind>,
    pub details: Value,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

impl AdaptationDecision {
    fn new(
        adaptation: AdaptationType,
        reason: AdaptationReason,
        agent: Option<AgentKind>,
        details: Value,
        confidence: f64,
    ) -> Self {
        Self {
            adaptation,
            reason,
            agent,
            details,
            confidence,
            timestamp: Utc::now(),
        }
    }
}

// ============================================================================
// Context
// ============================================================================

/// Snapshot of live execution state handed to the adapter after a step.
#[derive(Debug, Clone)]
pub struct WorkflowContext {
    pub task_description: String,
    /// Name of the agent that just finished, or "start".
    pub current_phase: String,
    pub completed_agents: Vec<AgentKind>,
    pub pending_agents: Vec<AgentKind>,
    pub results: HashMap<String, Value>,
    pub errors: Vec<WorkflowError>,
    pub quality_scores: HashMap<String, f64>,
    pub metadata: Map<String, Value>,
    pub workspace_path: String,
    pub start_time: DateTime<Utc>,
}

// ============================================================================
// Learning seam
// ============================================================================

/// Optional collaborator supplying historical optimization suggestions.
///
/// Structured suggestions of shape `{"type":"skip_agent","agent":...,
/// "confidence":...}` generate skip decisions; plain strings are logged
/// only. Failures are swallowed with a warning.
#[async_trait]
pub trait LearningAdvisor: Send + Sync {
    async fn suggest_optimizations(
        &self,
        task_description: &str,
        project_type: Option<&str>,
    ) -> ensemble_core::Result<Vec<Value>>;
}

// ============================================================================
// Adapter
// ============================================================================

/// Statistics over the applied-decision log.
#[derive(Debug, Clone, Serialize)]
pub struct AdaptationStats {
    pub total_adaptations: usize,
    pub by_type: HashMap<String, usize>,
    pub by_reason: HashMap<String, usize>,
    pub recent: Vec<Value>,
}

pub struct WorkflowAdapter {
    advisor: Option<Arc<dyn LearningAdvisor>>,
    history: Vec<AdaptationDecision>,
}

impl WorkflowAdapter {
    pub fn new() -> Self {
        Self {
            advisor: None,
            history: Vec::new(),
        }
    }

    pub fn with_advisor(advisor: Arc<dyn LearningAdvisor>) -> Self {
        Self {
            advisor: Some(advisor),
            history: Vec::new(),
        }
    }

    /// Analyze the context and produce zero or more decisions.
    ///
    /// Check order matters: a critical error short-circuits into a single
    /// abort decision; the error/quality/dependency checks are independent
    /// and may all fire; learning suggestions come last so history never
    /// overrides concrete evidence.
    pub async fn analyze(&self, context: &WorkflowContext) -> Vec<AdaptationDecision> {
        tracing::debug!(
            phase = %context.current_phase,
            completed = context.completed_agents.len(),
            pending = context.pending_agents.len(),
            errors = context.errors.len(),
            "analyzing workflow"
        );

        if let Some(abort) = check_critical_errors(context) {
            return vec![abort];
        }

        let mut decisions = Vec::new();
        decisions.extend(check_persistent_errors(context));
        decisions.extend(check_quality(context));
        decisions.extend(check_dependencies(context));

        if let Some(advisor) = &self.advisor {
            decisions.extend(check_optimizations(advisor.as_ref(), context).await);
        }

        if !decisions.is_empty() {
            tracing::info!(count = decisions.len(), "generated adaptation decisions");
        }
        decisions
    }

    /// Apply one decision to the pending queue and metadata.
    ///
    /// The decision is appended to the history before any mutation. An
    /// `insert_before` target absent from pending falls through to
    /// head-of-pending insertion when `insert_after` is present: the step
    /// was decided right after its anchor finished, so it runs next.
    pub fn apply(
        &mut self,
        decision: AdaptationDecision,
        pending: &mut Vec<PlanStep>,
        metadata: &mut Map<String, Value>,
    ) {
        tracing::info!(adaptation = ?decision.adaptation, agent = ?decision.agent, "applying adaptation");
        self.history.push(decision.clone());

        match decision.adaptation {
            AdaptationType::InsertAgent => {
                let Some(agent) = decision.agent else {
                    tracing::warn!("insert_agent decision without an agent");
                    return;
                };
                let step = PlanStep::default_mode(agent);
                let before = decision
                    .details
                    .get("insert_before")
                    .and_then(Value::as_str)
                    .and_then(AgentKind::parse);
                let after = decision.details.get("insert_after").is_some();

                if let Some(position) = before.and_then(|target| {
                    pending.iter().position(|s| s.agent == target)
                }) {
                    pending.insert(position, step);
                } else if after {
                    pending.insert(0, step);
                } else {
                    pending.push(step);
                }
            }
            AdaptationType::SkipAgent => {
                let Some(agent) = decision.agent else { return };
                if let Some(position) = pending.iter().position(|s| s.agent == agent) {
                    pending.remove(position);
                } else {
                    tracing::warn!(agent = %agent, "skip target not in pending list");
                }
            }
            AdaptationType::RepeatAgent => {
                if let Some(agent) = decision.agent {
                    pending.insert(0, PlanStep::default_mode(agent));
                }
            }
            AdaptationType::ReorderAgents => {
                let order: Vec<AgentKind> = decision
                    .details
                    .get("order")
                    .and_then(Value::as_array)
                    .map(|names| {
                        names
                            .iter()
                            .filter_map(Value::as_str)
                            .filter_map(AgentKind::parse)
                            .collect()
                    })
                    .unwrap_or_default();
                if !order.is_empty() {
                    let mut old = std::mem::take(pending);
                    for agent in order {
                        // Keep the existing step (and its mode) when present.
                        match old.iter().position(|s| s.agent == agent) {
                            Some(position) => pending.push(old.remove(position)),
                            None => pending.push(PlanStep::default_mode(agent)),
                        }
                    }
                }
            }
            AdaptationType::AbortWorkflow => {
                metadata.insert("aborted".to_string(), Value::Bool(true));
                metadata.insert("abort_reason".to_string(), decision.details.clone());
            }
            AdaptationType::ChangeParameters => {
                metadata.insert("parameters".to_string(), decision.details.clone());
            }
        }
    }

    pub fn stats(&self) -> AdaptationStats {
        let mut by_type: HashMap<String, usize> = HashMap::new();
        let mut by_reason: HashMap<String, usize> = HashMap::new();
        for decision in &self.history {
            *by_type
                .entry(variant_name(&decision.adaptation))
                .or_insert(0) += 1;
            *by_reason
                .entry(variant_name(&decision.reason))
                .or_insert(0) += 1;
        }
        let recent = self
            .history
            .iter()
            .rev()
            .take(5)
            .rev()
            .map(|d| {
                json!({
                    "type": variant_name(&d.adaptation),
                    "reason": variant_name(&d.reason),
                    "agent": d.agent.map(|a| a.as_str()),
                    "timestamp": d.timestamp,
                })
            })
            .collect();
        AdaptationStats {
            total_adaptations: self.history.len(),
            by_type,
            by_reason,
            recent,
        }
    }

    pub fn history(&self) -> &[AdaptationDecision] {
        &self.history
    }
}

impl Default for WorkflowAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn variant_name<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

// ============================================================================
// Rules
// ============================================================================

fn check_critical_errors(context: &WorkflowContext) -> Option<AdaptationDecision> {
    let critical: Vec<&WorkflowError> =
        context.errors.iter().filter(|e| e.is_critical()).collect();
    if critical.is_empty() {
        return None;
    }
    tracing::warn!(count = critical.len(), "critical errors detected");
    Some(AdaptationDecision::new(
        AdaptationType::AbortWorkflow,
        AdaptationReason::ErrorDetected,
        None,
        json!({"errors": critical.iter().map(|e| &e.message).collect::<Vec<_>>()}),
        1.0,
    ))
}

fn check_persistent_errors(context: &WorkflowContext) -> Vec<AdaptationDecision> {
    let error_count = context.errors.len();
    if error_count <= 3 {
        return Vec::new();
    }
    let fixer_runs = context
        .completed_agents
        .iter()
        .filter(|a| **a == AgentKind::Fixer)
        .count();
    if fixer_runs == 0 || fixer_runs >= 2 {
        return Vec::new();
    }
    tracing::info!(error_count, fixer_runs, "persistent errors, repeating fixer");
    vec![AdaptationDecision::new(
        AdaptationType::RepeatAgent,
        AdaptationReason::ErrorDetected,
        Some(AgentKind::Fixer),
        json!({"error_count": error_count, "current_runs": fixer_runs}),
        0.9,
    )]
}

fn check_quality(context: &WorkflowContext) -> Vec<AdaptationDecision> {
    let Some(score) = context.quality_scores.get("codesmith").copied() else {
        return Vec::new();
    };
    if score >= 0.7 {
        return Vec::new();
    }
    let reviewer_scheduled = context.completed_agents.contains(&AgentKind::Reviewer)
        || context.pending_agents.contains(&AgentKind::Reviewer);
    if reviewer_scheduled {
        return Vec::new();
    }
    tracing::info!(score, "low code quality, inserting reviewer");
    vec![AdaptationDecision::new(
        AdaptationType::InsertAgent,
        AdaptationReason::QualityIssue,
        Some(AgentKind::Reviewer),
        json!({"quality_score": score, "insert_after": "codesmith"}),
        0.85,
    )]
}

fn check_dependencies(context: &WorkflowContext) -> Vec<AdaptationDecision> {
    let Some(architect) = context.results.get("architect") else {
        return Vec::new();
    };
    let missing: Vec<String> = architect
        .get("dependencies")
        .and_then(Value::as_array)
        .map(|deps| {
            deps.iter()
                .filter(|d| d.get("status").and_then(Value::as_str) == Some("missing"))
                .filter_map(|d| d.get("name").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if missing.is_empty() || context.completed_agents.contains(&AgentKind::Research) {
        return Vec::new();
    }
    tracing::info!(count = missing.len(), "missing dependencies, inserting research");
    vec![AdaptationDecision::new(
        AdaptationType::InsertAgent,
        AdaptationReason::MissingDependency,
        Some(AgentKind::Research),
        json!({"missing_dependencies": missing, "insert_before": "codesmith"}),
        0.95,
    )]
}

async fn check_optimizations(
    advisor: &dyn LearningAdvisor,
    context: &WorkflowContext,
) -> Vec<AdaptationDecision> {
    let project_type = context
        .metadata
        .get("project_type")
        .and_then(Value::as_str)
        .map(str::to_string);

    let suggestions = match advisor
        .suggest_optimizations(&context.task_description, project_type.as_deref())
        .await
    {
        Ok(suggestions) => suggestions,
        Err(e) => {
            tracing::warn!(error = %e, "failed to check optimizations");
            return Vec::new();
        }
    };

    let mut decisions = Vec::new();
    for suggestion in suggestions {
        if let Some(text) = suggestion.as_str() {
            tracing::debug!(suggestion = text, "optimization suggestion");
            continue;
        }
        if suggestion.get("type").and_then(Value::as_str) != Some("skip_agent") {
            continue;
        }
        let Some(agent) = suggestion
            .get("agent")
            .and_then(Value::as_str)
            .and_then(AgentKind::parse)
        else {
            continue;
        };
        if !context.pending_agents.contains(&agent) {
            continue;
        }
        let confidence = suggestion
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.7);
        tracing::info!(agent = %agent, "optimization: skipping agent");
        decisions.push(AdaptationDecision::new(
            AdaptationType::SkipAgent,
            AdaptationReason::Optimization,
            Some(agent),
            json!({"suggestion": suggestion}),
            confidence,
        ));
    }
    decisions
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use ensemble_types::ErrorSeverity;

    fn context() -> WorkflowContext {
        WorkflowContext {
            task_description: "Create a calculator".to_string(),
            current_phase: "start".to_string(),
            completed_agents: Vec::new(),
            pending_agents: Vec::new(),
            results: HashMap::new(),
            errors: Vec::new(),
            quality_scores: HashMap::new(),
            metadata: Map::new(),
            workspace_path: "/tmp/app".to_string(),
            start_time: Utc::now(),
        }
    }

    fn steps(agents: &[AgentKind]) -> Vec<PlanStep> {
        agents.iter().map(|a| PlanStep::default_mode(*a)).collect()
    }

    #[tokio::test]
    async fn critical_error_yields_single_abort() {
        let mut ctx = context();
        for i in 0..3 {
            ctx.errors
                .push(WorkflowError::new(format!("e{i}"), ErrorSeverity::Medium));
        }
        ctx.errors
            .push(WorkflowError::new("disk corrupted", ErrorSeverity::Critical));
        // Low quality would normally also fire, but critical short-circuits.
        ctx.quality_scores.insert("codesmith".into(), 0.1);

        let decisions = WorkflowAdapter::new().analyze(&ctx).await;
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].adaptation, AdaptationType::AbortWorkflow);
        assert_eq!(decisions[0].confidence, 1.0);
    }

    #[tokio::test]
    async fn persistent_errors_repeat_fixer_at_most_twice() {
        let mut ctx = context();
        for i in 0..4 {
            ctx.errors
                .push(WorkflowError::new(format!("e{i}"), ErrorSeverity::Medium));
        }
        ctx.completed_agents.push(AgentKind::Fixer);

        let decisions = WorkflowAdapter::new().analyze(&ctx).await;
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].adaptation, AdaptationType::RepeatAgent);
        assert_eq!(decisions[0].agent, Some(AgentKind::Fixer));
        assert_eq!(decisions[0].confidence, 0.9);

        // A second completed fixer run suppresses further repeats.
        ctx.completed_agents.push(AgentKind::Fixer);
        let decisions = WorkflowAdapter::new().analyze(&ctx).await;
        assert!(decisions.is_empty());
    }

    #[tokio::test]
    async fn low_quality_inserts_reviewer_once() {
        let mut ctx = context();
        ctx.quality_scores.insert("codesmith".into(), 0.6);

        let decisions = WorkflowAdapter::new().analyze(&ctx).await;
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].agent, Some(AgentKind::Reviewer));
        assert_eq!(decisions[0].details["insert_after"], "codesmith");

        // Reviewer already pending: no duplicate insertion.
        ctx.pending_agents.push(AgentKind::Reviewer);
        let decisions = WorkflowAdapter::new().analyze(&ctx).await;
        assert!(decisions.is_empty());
    }

    #[tokio::test]
    async fn missing_dependencies_insert_research_before_codesmith() {
        let mut ctx = context();
        ctx.results.insert(
            "architect".into(),
            json!({"dependencies": [
                {"name": "vite", "status": "missing"},
                {"name": "react", "status": "resolved"},
            ]}),
        );

        let decisions = WorkflowAdapter::new().analyze(&ctx).await;
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].agent, Some(AgentKind::Research));
        assert_eq!(decisions[0].details["insert_before"], "codesmith");
        assert_eq!(decisions[0].details["missing_dependencies"][0], "vite");
        assert_eq!(decisions[0].confidence, 0.95);

        // Research already completed: nothing to do.
        ctx.completed_agents.push(AgentKind::Research);
        let decisions = WorkflowAdapter::new().analyze(&ctx).await;
        assert!(decisions.is_empty());
    }

    struct StubAdvisor(Vec<Value>);

    #[async_trait]
    impl LearningAdvisor for StubAdvisor {
        async fn suggest_optimizations(
            &self,
            _task: &str,
            _project_type: Option<&str>,
        ) -> ensemble_core::Result<Vec<Value>> {
            Ok(self.0.clone())
        }
    }

    struct FailingAdvisor;

    #[async_trait]
    impl LearningAdvisor for FailingAdvisor {
        async fn suggest_optimizations(
            &self,
            _task: &str,
            _project_type: Option<&str>,
        ) -> ensemble_core::Result<Vec<Value>> {
            Err(ensemble_core::EnsembleError::NotFound(
                "history unavailable".to_string(),
            ))
        }
    }

    #[tokio::test]
    async fn structured_skip_suggestions_generate_decisions() {
        let advisor = StubAdvisor(vec![
            json!("consider skipping research"),
            json!({"type": "skip_agent", "agent": "research", "confidence": 0.8}),
            json!({"type": "skip_agent", "agent": "architect", "confidence": 0.8}),
        ]);
        let mut ctx = context();
        ctx.pending_agents.push(AgentKind::Research);

        let adapter = WorkflowAdapter::with_advisor(Arc::new(advisor));
        let decisions = adapter.analyze(&ctx).await;
        // The string is logged only; architect is not pending.
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].adaptation, AdaptationType::SkipAgent);
        assert_eq!(decisions[0].agent, Some(AgentKind::Research));
        assert_eq!(decisions[0].confidence, 0.8);
    }

    #[tokio::test]
    async fn advisor_failure_is_swallowed() {
        let adapter = WorkflowAdapter::with_advisor(Arc::new(FailingAdvisor));
        let decisions = adapter.analyze(&context()).await;
        assert!(decisions.is_empty());
    }

    #[test]
    fn apply_insert_before_present_target() {
        let mut adapter = WorkflowAdapter::new();
        let mut pending = steps(&[AgentKind::Codesmith, AgentKind::Reviewfix]);
        let mut metadata = Map::new();

        let decision = AdaptationDecision::new(
            AdaptationType::InsertAgent,
            AdaptationReason::MissingDependency,
            Some(AgentKind::Research),
            json!({"insert_before": "codesmith"}),
            0.95,
        );
        adapter.apply(decision, &mut pending, &mut metadata);

        let agents: Vec<AgentKind> = pending.iter().map(|s| s.agent).collect();
        assert_eq!(
            agents,
            vec![AgentKind::Research, AgentKind::Codesmith, AgentKind::Reviewfix]
        );
        assert_eq!(adapter.history().len(), 1);
    }

    #[test]
    fn apply_insert_after_falls_back_to_head() {
        let mut adapter = WorkflowAdapter::new();
        let mut pending = steps(&[AgentKind::Reviewfix]);
        let mut metadata = Map::new();

        // codesmith already ran, so insert_before misses and insert_after
        // puts the reviewer at the head of pending.
        let decision = AdaptationDecision::new(
            AdaptationType::InsertAgent,
            AdaptationReason::QualityIssue,
            Some(AgentKind::Reviewer),
            json!({"insert_after": "codesmith"}),
            0.85,
        );
        adapter.apply(decision, &mut pending, &mut metadata);

        let agents: Vec<AgentKind> = pending.iter().map(|s| s.agent).collect();
        assert_eq!(agents, vec![AgentKind::Reviewer, AgentKind::Reviewfix]);
    }

    #[test]
    fn apply_insert_without_position_appends() {
        let mut adapter = WorkflowAdapter::new();
        let mut pending = steps(&[AgentKind::Codesmith]);
        let mut metadata = Map::new();

        let decision = AdaptationDecision::new(
            AdaptationType::InsertAgent,
            AdaptationReason::UserFeedback,
            Some(AgentKind::Reviewfix),
            json!({}),
            0.5,
        );
        adapter.apply(decision, &mut pending, &mut metadata);
        assert_eq!(pending.last().unwrap().agent, AgentKind::Reviewfix);
    }

    #[test]
    fn apply_skip_and_repeat_and_reorder() {
        let mut adapter = WorkflowAdapter::new();
        let mut pending = steps(&[AgentKind::Research, AgentKind::Architect, AgentKind::Codesmith]);
        let mut metadata = Map::new();

        adapter.apply(
            AdaptationDecision::new(
                AdaptationType::SkipAgent,
                AdaptationReason::Optimization,
                Some(AgentKind::Architect),
                json!({}),
                0.7,
            ),
            &mut pending,
            &mut metadata,
        );
        assert_eq!(pending.len(), 2);

        adapter.apply(
            AdaptationDecision::new(
                AdaptationType::RepeatAgent,
                AdaptationReason::ErrorDetected,
                Some(AgentKind::Fixer),
                json!({}),
                0.9,
            ),
            &mut pending,
            &mut metadata,
        );
        assert_eq!(pending[0].agent, AgentKind::Fixer);

        adapter.apply(
            AdaptationDecision::new(
                AdaptationType::ReorderAgents,
                AdaptationReason::UserFeedback,
                None,
                json!({"order": ["codesmith", "research", "fixer"]}),
                0.6,
            ),
            &mut pending,
            &mut metadata,
        );
        let agents: Vec<AgentKind> = pending.iter().map(|s| s.agent).collect();
        assert_eq!(
            agents,
            vec![AgentKind::Codesmith, AgentKind::Research, AgentKind::Fixer]
        );
    }

    #[test]
    fn apply_abort_sets_metadata() {
        let mut adapter = WorkflowAdapter::new();
        let mut pending = Vec::new();
        let mut metadata = Map::new();

        adapter.apply(
            AdaptationDecision::new(
                AdaptationType::AbortWorkflow,
                AdaptationReason::ErrorDetected,
                None,
                json!({"errors": ["critical failure"]}),
                1.0,
            ),
            &mut pending,
            &mut metadata,
        );
        assert_eq!(metadata["aborted"], true);
        assert_eq!(metadata["abort_reason"]["errors"][0], "critical failure");
    }

    #[test]
    fn stats_count_by_type_and_reason() {
        let mut adapter = WorkflowAdapter::new();
        let mut pending = steps(&[AgentKind::Codesmith]);
        let mut metadata = Map::new();

        for _ in 0..2 {
            adapter.apply(
                AdaptationDecision::new(
                    AdaptationType::RepeatAgent,
                    AdaptationReason::ErrorDetected,
                    Some(AgentKind::Fixer),
                    json!({}),
                    0.9,
                ),
                &mut pending,
                &mut metadata,
            );
        }
        adapter.apply(
            AdaptationDecision::new(
                AdaptationType::AbortWorkflow,
                AdaptationReason::ResourceConstraint,
                None,
                json!({}),
                1.0,
            ),
            &mut pending,
            &mut metadata,
        );

        let stats = adapter.stats();
        assert_eq!(stats.total_adaptations, 3);
        assert_eq!(stats.by_type["repeat_agent"], 2);
        assert_eq!(stats.by_reason["resource_constraint"], 1);
        assert_eq!(stats.recent.len(), 3);
    }
}
