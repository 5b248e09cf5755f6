use std::fmt;

use serde::{Deserialize, Serialize};

/// Agent identities known to the system.
///
/// The four core identities are what the planner may schedule. `Reviewer`
/// and `Fixer` are specialist identities that only the workflow adapter
/// introduces mid-run (a read-only review pass and a targeted error-fixing
/// pass respectively).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Research,
    Architect,
    Codesmith,
    Reviewfix,
    Reviewer,
    Fixer,
}

impl AgentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentKind::Research => "research",
            AgentKind::Architect => "architect",
            AgentKind::Codesmith => "codesmith",
            AgentKind::Reviewfix => "reviewfix",
            AgentKind::Reviewer => "reviewer",
            AgentKind::Fixer => "fixer",
        }
    }

    /// Identities a plan is allowed to schedule directly.
    pub fn core_agents() -> [AgentKind; 4] {
        [
            AgentKind::Research,
            AgentKind::Architect,
            AgentKind::Codesmith,
            AgentKind::Reviewfix,
        ]
    }

    pub fn is_core(self) -> bool {
        !matches!(self, AgentKind::Reviewer | AgentKind::Fixer)
    }

    pub fn parse(name: &str) -> Option<AgentKind> {
        match name.trim().to_lowercase().as_str() {
            "research" => Some(AgentKind::Research),
            "architect" => Some(AgentKind::Architect),
            "codesmith" => Some(AgentKind::Codesmith),
            "reviewfix" => Some(AgentKind::Reviewfix),
            "reviewer" => Some(AgentKind::Reviewer),
            "fixer" => Some(AgentKind::Fixer),
            _ => None,
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Risk classification for an agent operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    ReadOnly,
    WritesFiles,
    Networked,
    Critical,
}

/// Severity attached to workflow errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// An error accumulated in workflow state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowError {
    pub message: String,
    pub severity: ErrorSeverity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_agent: Option<String>,
}

impl WorkflowError {
    pub fn new(message: impl Into<String>, severity: ErrorSeverity) -> Self {
        Self {
            message: message.into(),
            severity,
            source_agent: None,
        }
    }

    pub fn from_agent(
        agent: AgentKind,
        message: impl Into<String>,
        severity: ErrorSeverity,
    ) -> Self {
        Self {
            message: message.into(),
            severity,
            source_agent: Some(agent.as_str().to_string()),
        }
    }

    pub fn is_critical(&self) -> bool {
        self.severity == ErrorSeverity::Critical
    }
}
