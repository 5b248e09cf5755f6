// Capability Registry
// Static agent x mode table: cost/latency estimates, risk, approval flags

use ensemble_types::{AgentKind, RiskLevel};

// ============================================================================
// Definitions
// ============================================================================

/// A named operational profile of an agent.
#[derive(Debug, Clone, Copy)]
pub struct AgentModeSpec {
    pub name: &'static str,
    pub description: &'static str,
    /// Estimated cost per execution, USD.
    pub cost_estimate: f64,
    /// Estimated latency, seconds.
    pub latency_estimate: f64,
    pub risk_level: RiskLevel,
    pub requires_approval: bool,
}

/// Complete capability definition for one agent.
#[derive(Debug, Clone, Copy)]
pub struct AgentCapability {
    pub agent: AgentKind,
    pub description: &'static str,
    pub default_mode: &'static str,
    pub modes: &'static [AgentModeSpec],
}

const RESEARCH_MODES: &[AgentModeSpec] = &[
    AgentModeSpec {
        name: "research",
        description: "Web search for new information",
        cost_estimate: 0.02,
        latency_estimate: 5.0,
        risk_level: RiskLevel::Networked,
        requires_approval: false,
    },
    AgentModeSpec {
        name: "explain",
        description: "Analyze and explain existing codebase structure",
        cost_estimate: 0.01,
        latency_estimate: 3.0,
        risk_level: RiskLevel::ReadOnly,
        requires_approval: false,
    },
    AgentModeSpec {
        name: "analyze",
        description: "Deep code analysis, debugging, security scan",
        cost_estimate: 0.03,
        latency_estimate: 10.0,
        risk_level: RiskLevel::ReadOnly,
        requires_approval: false,
    },
    AgentModeSpec {
        name: "index",
        description: "Index codebase for semantic search",
        cost_estimate: 0.05,
        latency_estimate: 15.0,
        risk_level: RiskLevel::ReadOnly,
        requires_approval: false,
    },
];

const ARCHITECT_MODES: &[AgentModeSpec] = &[
    AgentModeSpec {
        name: "design",
        description: "Design new system architecture from requirements",
        cost_estimate: 0.04,
        latency_estimate: 8.0,
        risk_level: RiskLevel::WritesFiles,
        requires_approval: false,
    },
    AgentModeSpec {
        name: "scan",
        description: "Reverse-engineer architecture from existing code",
        cost_estimate: 0.03,
        latency_estimate: 6.0,
        risk_level: RiskLevel::WritesFiles,
        requires_approval: false,
    },
    AgentModeSpec {
        name: "post_build_scan",
        description: "Document generated code after creation",
        cost_estimate: 0.02,
        latency_estimate: 4.0,
        risk_level: RiskLevel::WritesFiles,
        requires_approval: false,
    },
    AgentModeSpec {
        name: "re_scan",
        description: "Update architecture after code modifications",
        cost_estimate: 0.02,
        latency_estimate: 3.0,
        risk_level: RiskLevel::WritesFiles,
        requires_approval: false,
    },
];

const CODESMITH_MODES: &[AgentModeSpec] = &[AgentModeSpec {
    name: "default",
    description: "Generate code from architecture and requirements",
    cost_estimate: 0.15,
    latency_estimate: 30.0,
    risk_level: RiskLevel::WritesFiles,
    requires_approval: true,
}];

const REVIEWFIX_MODES: &[AgentModeSpec] = &[AgentModeSpec {
    name: "default",
    description: "Review code quality, run validation, apply fixes",
    cost_estimate: 0.08,
    latency_estimate: 20.0,
    risk_level: RiskLevel::WritesFiles,
    requires_approval: false,
}];

const REVIEWER_MODES: &[AgentModeSpec] = &[AgentModeSpec {
    name: "review",
    description: "Read-only quality review of generated code",
    cost_estimate: 0.03,
    latency_estimate: 8.0,
    risk_level: RiskLevel::ReadOnly,
    requires_approval: false,
}];

const FIXER_MODES: &[AgentModeSpec] = &[AgentModeSpec {
    name: "fix",
    description: "Targeted fixing of accumulated errors",
    cost_estimate: 0.05,
    latency_estimate: 12.0,
    risk_level: RiskLevel::WritesFiles,
    requires_approval: false,
}];

const CAPABILITIES: &[AgentCapability] = &[
    AgentCapability {
        agent: AgentKind::Research,
        description: "Information gathering, codebase analysis, and debugging",
        default_mode: "research",
        modes: RESEARCH_MODES,
    },
    AgentCapability {
        agent: AgentKind::Architect,
        description: "System architecture design and documentation",
        default_mode: "design",
        modes: ARCHITECT_MODES,
    },
    AgentCapability {
        agent: AgentKind::Codesmith,
        description: "Code generation against the workspace",
        default_mode: "default",
        modes: CODESMITH_MODES,
    },
    AgentCapability {
        agent: AgentKind::Reviewfix,
        description: "Code review and iterative fixing",
        default_mode: "default",
        modes: REVIEWFIX_MODES,
    },
    AgentCapability {
        agent: AgentKind::Reviewer,
        description: "Standalone read-only review pass",
        default_mode: "review",
        modes: REVIEWER_MODES,
    },
    AgentCapability {
        agent: AgentKind::Fixer,
        description: "Standalone error-fixing pass",
        default_mode: "fix",
        modes: FIXER_MODES,
    },
];

// Keyword phrase table for task routing. First match in table order wins.
const TASK_KEYWORDS: &[(&str, AgentKind, &str)] = &[
    ("search", AgentKind::Research, "research"),
    ("find information", AgentKind::Research, "research"),
    ("research", AgentKind::Research, "research"),
    ("explain", AgentKind::Research, "explain"),
    ("what does", AgentKind::Research, "explain"),
    ("how does", AgentKind::Research, "explain"),
    ("analyze", AgentKind::Research, "analyze"),
    ("debug", AgentKind::Research, "analyze"),
    ("security", AgentKind::Research, "analyze"),
    ("design", AgentKind::Architect, "design"),
    ("architecture", AgentKind::Architect, "design"),
    ("plan", AgentKind::Architect, "design"),
    ("scan", AgentKind::Architect, "scan"),
    ("document", AgentKind::Architect, "scan"),
    ("reverse engineer", AgentKind::Architect, "scan"),
    ("create", AgentKind::Codesmith, "default"),
    ("build", AgentKind::Codesmith, "default"),
    ("generate", AgentKind::Codesmith, "default"),
    ("implement", AgentKind::Codesmith, "default"),
    ("develop", AgentKind::Codesmith, "default"),
    ("review", AgentKind::Reviewfix, "default"),
    ("fix", AgentKind::Reviewfix, "default"),
    ("improve", AgentKind::Reviewfix, "default"),
    ("test", AgentKind::Reviewfix, "default"),
];

// ============================================================================
// Registry
// ============================================================================

/// Read-only registry over the static capability table. Changes require a
/// code change; safe to consult from any context.
pub struct CapabilityRegistry;

impl CapabilityRegistry {
    pub fn get_capability(agent: AgentKind) -> Option<&'static AgentCapability> {
        CAPABILITIES.iter().find(|c| c.agent == agent)
    }

    /// Look up a mode; `None` selects the agent's default mode.
    pub fn get_mode(agent: AgentKind, mode: Option<&str>) -> Option<&'static AgentModeSpec> {
        let capability = Self::get_capability(agent)?;
        let name = mode.unwrap_or(capability.default_mode);
        capability.modes.iter().find(|m| m.name == name)
    }

    pub fn estimate_cost(agent: AgentKind, mode: Option<&str>) -> Option<f64> {
        Self::get_mode(agent, mode).map(|m| m.cost_estimate)
    }

    pub fn estimate_latency(agent: AgentKind, mode: Option<&str>) -> Option<f64> {
        Self::get_mode(agent, mode).map(|m| m.latency_estimate)
    }

    pub fn requires_approval(agent: AgentKind, mode: Option<&str>) -> bool {
        Self::get_mode(agent, mode).is_some_and(|m| m.requires_approval)
    }

    pub fn default_mode(agent: AgentKind) -> &'static str {
        Self::get_capability(agent).map_or("default", |c| c.default_mode)
    }

    pub fn list_agents() -> Vec<AgentKind> {
        CAPABILITIES.iter().map(|c| c.agent).collect()
    }

    pub fn list_modes(agent: AgentKind) -> Vec<&'static str> {
        Self::get_capability(agent)
            .map(|c| c.modes.iter().map(|m| m.name).collect())
            .unwrap_or_default()
    }

    /// Match a task description to an agent and mode via the keyword table.
    /// Falls back to `(research, explain)` when nothing matches.
    pub fn find_agent_for_task(
        task_description: &str,
        allowed: Option<&[AgentKind]>,
    ) -> (AgentKind, &'static str) {
        let task = task_description.to_lowercase();
        for (keyword, agent, mode) in TASK_KEYWORDS {
            let permitted = allowed.is_none_or(|list| list.contains(agent));
            if permitted && task.contains(keyword) {
                tracing::debug!(keyword, agent = %agent, mode, "matched task to agent");
                return (*agent, *mode);
            }
        }
        (AgentKind::Research, "explain")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_agent_has_a_valid_default_mode() {
        for capability in CAPABILITIES {
            assert!(
                capability
                    .modes
                    .iter()
                    .any(|m| m.name == capability.default_mode),
                "default mode missing for {}",
                capability.agent
            );
        }
    }

    #[test]
    fn default_mode_lookup() {
        let mode = CapabilityRegistry::get_mode(AgentKind::Architect, None).unwrap();
        assert_eq!(mode.name, "design");
        let mode = CapabilityRegistry::get_mode(AgentKind::Research, Some("analyze")).unwrap();
        assert_eq!(mode.risk_level, RiskLevel::ReadOnly);
        assert!(CapabilityRegistry::get_mode(AgentKind::Research, Some("unknown")).is_none());
    }

    #[test]
    fn codesmith_needs_approval() {
        assert!(CapabilityRegistry::requires_approval(
            AgentKind::Codesmith,
            None
        ));
        assert!(!CapabilityRegistry::requires_approval(
            AgentKind::Reviewfix,
            None
        ));
    }

    #[test]
    fn estimates_match_table() {
        assert_eq!(
            CapabilityRegistry::estimate_cost(AgentKind::Codesmith, None),
            Some(0.15)
        );
        assert_eq!(
            CapabilityRegistry::estimate_latency(AgentKind::Reviewfix, Some("default")),
            Some(20.0)
        );
    }

    #[test]
    fn task_matching_first_match_wins() {
        let (agent, mode) = CapabilityRegistry::find_agent_for_task("Create a calculator", None);
        assert_eq!((agent, mode), (AgentKind::Codesmith, "default"));

        let (agent, mode) =
            CapabilityRegistry::find_agent_for_task("how does the payment flow work", None);
        assert_eq!((agent, mode), (AgentKind::Research, "explain"));

        // No keyword at all falls back to research:explain.
        let (agent, mode) = CapabilityRegistry::find_agent_for_task("zzzz", None);
        assert_eq!((agent, mode), (AgentKind::Research, "explain"));
    }

    #[test]
    fn task_matching_respects_allowed_set() {
        let allowed = [AgentKind::Research];
        let (agent, _) =
            CapabilityRegistry::find_agent_for_task("create a calculator", Some(&allowed));
        // codesmith is excluded, so the match falls through to the default.
        assert_eq!(agent, AgentKind::Research);
    }
}
