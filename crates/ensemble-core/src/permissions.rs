// Permissions Manager
// Deny-by-default access control gating every side-effecting agent action.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{EnsembleError, Result};

const MAX_AUDIT_ENTRIES: usize = 10_000;

/// Permission tags an agent may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    CanReadFiles,
    CanWriteFiles,
    CanDeleteFiles,
    CanExecuteCode,
    CanWebSearch,
    CanInstallPackages,
    CanModifySystem,
}

impl Permission {
    pub fn as_str(self) -> &'static str {
        match self {
            Permission::CanReadFiles => "can_read_files",
            Permission::CanWriteFiles => "can_write_files",
            Permission::CanDeleteFiles => "can_delete_files",
            Permission::CanExecuteCode => "can_execute_code",
            Permission::CanWebSearch => "can_web_search",
            Permission::CanInstallPackages => "can_install_packages",
            Permission::CanModifySystem => "can_modify_system",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Check,
    Grant,
    Revoke,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    Granted,
    Denied,
    Success,
}

/// One entry in the bounded permission audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub agent: String,
    pub permission: Permission,
    pub action: AuditAction,
    pub result: AuditResult,
    pub metadata: Value,
}

/// Aggregated counts over the audit log.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PermissionStats {
    pub total_checks: u64,
    pub total_grants: u64,
    pub total_denials: u64,
    pub by_agent: HashMap<String, AgentPermissionStats>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentPermissionStats {
    pub checks: u64,
    pub grants: u64,
    pub denials: u64,
}

struct Inner {
    grants: HashMap<String, HashSet<Permission>>,
    audit: VecDeque<AuditEntry>,
    usage: HashMap<String, HashMap<Permission, u64>>,
}

/// Per-agent permission sets with an audit trail.
///
/// Policy is deny-by-default: an agent without an entry holds nothing.
/// Constructed per session so audit views stay isolated.
pub struct PermissionsManager {
    inner: Mutex<Inner>,
}

impl PermissionsManager {
    pub fn new() -> Self {
        let mut grants: HashMap<String, HashSet<Permission>> = HashMap::new();
        grants.insert(
            "research".into(),
            HashSet::from([Permission::CanWebSearch, Permission::CanReadFiles]),
        );
        // Architect writes are restricted to architecture-decision documents;
        // the path convention is enforced by the caller.
        grants.insert(
            "architect".into(),
            HashSet::from([Permission::CanWriteFiles, Permission::CanReadFiles]),
        );
        grants.insert(
            "codesmith".into(),
            HashSet::from([
                Permission::CanWriteFiles,
                Permission::CanReadFiles,
                Permission::CanExecuteCode,
            ]),
        );
        grants.insert(
            "reviewfix".into(),
            HashSet::from([Permission::CanWriteFiles, Permission::CanReadFiles]),
        );
        grants.insert(
            "fixer".into(),
            HashSet::from([Permission::CanWriteFiles, Permission::CanReadFiles]),
        );
        grants.insert(
            "reviewer".into(),
            HashSet::from([Permission::CanReadFiles]),
        );
        grants.insert(
            "supervisor".into(),
            HashSet::from([Permission::CanReadFiles]),
        );

        Self {
            inner: Mutex::new(Inner {
                grants,
                audit: VecDeque::new(),
                usage: HashMap::new(),
            }),
        }
    }

    /// Check whether `agent` holds `permission`. The check itself is audited.
    pub fn check(&self, agent: &str, permission: Permission) -> bool {
        let mut inner = self.inner.lock().expect("permissions lock poisoned");
        let allowed = inner
            .grants
            .get(agent)
            .is_some_and(|set| set.contains(&permission));
        let result = if allowed {
            AuditResult::Granted
        } else {
            AuditResult::Denied
        };
        log_audit(&mut inner, agent, permission, AuditAction::Check, result, json!({}));
        allowed
    }

    /// Grant a permission. A non-empty reason is mandatory.
    pub fn grant(
        &self,
        agent: &str,
        permission: Permission,
        reason: &str,
        granted_by: &str,
    ) -> Result<()> {
        if reason.trim().is_empty() {
            return Err(EnsembleError::Validation(
                "permission grant requires a reason".to_string(),
            ));
        }
        tracing::info!(agent, permission = permission.as_str(), reason, granted_by, "permission granted");

        let mut inner = self.inner.lock().expect("permissions lock poisoned");
        inner
            .grants
            .entry(agent.to_string())
            .or_default()
            .insert(permission);
        log_audit(
            &mut inner,
            agent,
            permission,
            AuditAction::Grant,
            AuditResult::Success,
            json!({"reason": reason, "granted_by": granted_by}),
        );
        Ok(())
    }

    /// Revoke a permission. Returns false when the agent did not hold it.
    pub fn revoke(&self, agent: &str, permission: Permission, reason: &str) -> bool {
        let mut inner = self.inner.lock().expect("permissions lock poisoned");
        let removed = inner
            .grants
            .get_mut(agent)
            .is_some_and(|set| set.remove(&permission));
        if removed {
            log_audit(
                &mut inner,
                agent,
                permission,
                AuditAction::Revoke,
                AuditResult::Success,
                json!({"reason": reason}),
            );
            tracing::info!(agent, permission = permission.as_str(), "permission revoked");
        }
        removed
    }

    /// Check and enforce in one step. With `raise_on_deny` a denial becomes
    /// a [`EnsembleError::PermissionDenied`]; otherwise `(false, message)`.
    pub fn check_and_enforce(
        &self,
        agent: &str,
        action: &str,
        permission: Permission,
        raise_on_deny: bool,
    ) -> Result<(bool, String)> {
        if self.check(agent, permission) {
            self.track_usage(agent, permission);
            return Ok((true, "Permission granted".to_string()));
        }

        tracing::warn!(agent, action, permission = permission.as_str(), "permission denied");
        if raise_on_deny {
            return Err(EnsembleError::PermissionDenied {
                agent: agent.to_string(),
                permission: permission.as_str().to_string(),
                action: action.to_string(),
            });
        }
        Ok((
            false,
            format!("Agent {agent} lacks permission: {}", permission.as_str()),
        ))
    }

    pub fn agent_permissions(&self, agent: &str) -> Vec<Permission> {
        let inner = self.inner.lock().expect("permissions lock poisoned");
        inner
            .grants
            .get(agent)
            .map(|set| {
                let mut perms: Vec<_> = set.iter().copied().collect();
                perms.sort_by_key(|p| p.as_str());
                perms
            })
            .unwrap_or_default()
    }

    pub fn all_agents(&self) -> Vec<(String, Vec<Permission>)> {
        let inner = self.inner.lock().expect("permissions lock poisoned");
        let mut agents: Vec<_> = inner
            .grants
            .iter()
            .map(|(agent, set)| {
                let mut perms: Vec<_> = set.iter().copied().collect();
                perms.sort_by_key(|p| p.as_str());
                (agent.clone(), perms)
            })
            .collect();
        agents.sort_by(|a, b| a.0.cmp(&b.0));
        agents
    }

    /// Audit log entries, optionally filtered by agent, newest last.
    pub fn audit_log(&self, agent: Option<&str>, limit: usize) -> Vec<AuditEntry> {
        let inner = self.inner.lock().expect("permissions lock poisoned");
        let entries: Vec<_> = inner
            .audit
            .iter()
            .filter(|e| agent.is_none_or(|a| e.agent == a))
            .cloned()
            .collect();
        let skip = entries.len().saturating_sub(limit);
        entries.into_iter().skip(skip).collect()
    }

    pub fn stats(&self) -> PermissionStats {
        let inner = self.inner.lock().expect("permissions lock poisoned");
        let mut stats = PermissionStats::default();
        for entry in &inner.audit {
            let agent = stats.by_agent.entry(entry.agent.clone()).or_default();
            match entry.action {
                AuditAction::Check => {
                    stats.total_checks += 1;
                    agent.checks += 1;
                    if entry.result == AuditResult::Denied {
                        stats.total_denials += 1;
                        agent.denials += 1;
                    }
                }
                AuditAction::Grant => {
                    stats.total_grants += 1;
                    agent.grants += 1;
                }
                AuditAction::Revoke => {}
            }
        }
        stats
    }

    fn track_usage(&self, agent: &str, permission: Permission) {
        let mut inner = self.inner.lock().expect("permissions lock poisoned");
        *inner
            .usage
            .entry(agent.to_string())
            .or_default()
            .entry(permission)
            .or_insert(0) += 1;
    }
}

impl Default for PermissionsManager {
    fn default() -> Self {
        Self::new()
    }
}

fn log_audit(
    inner: &mut Inner,
    agent: &str,
    permission: Permission,
    action: AuditAction,
    result: AuditResult,
    metadata: Value,
) {
    inner.audit.push_back(AuditEntry {
        timestamp: Utc::now(),
        agent: agent.to_string(),
        permission,
        action,
        result,
        metadata,
    });
    while inner.audit.len() > MAX_AUDIT_ENTRIES {
        inner.audit.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_grants_match_policy() {
        let manager = PermissionsManager::new();
        assert!(manager.check("research", Permission::CanWebSearch));
        assert!(!manager.check("research", Permission::CanWriteFiles));
        assert!(manager.check("codesmith", Permission::CanExecuteCode));
        assert!(manager.check("reviewer", Permission::CanReadFiles));
        assert!(!manager.check("reviewer", Permission::CanWriteFiles));
        // Unknown agents hold nothing.
        assert!(!manager.check("intruder", Permission::CanReadFiles));
    }

    #[test]
    fn grant_requires_reason() {
        let manager = PermissionsManager::new();
        let err = manager
            .grant("research", Permission::CanWriteFiles, "  ", "admin")
            .unwrap_err();
        assert!(matches!(err, EnsembleError::Validation(_)));
        assert!(!manager.check("research", Permission::CanWriteFiles));
    }

    #[test]
    fn grant_then_revoke_then_check_denied() {
        let manager = PermissionsManager::new();
        manager
            .grant(
                "research",
                Permission::CanWriteFiles,
                "needs to save findings",
                "admin",
            )
            .unwrap();
        assert!(manager.check("research", Permission::CanWriteFiles));
        assert!(manager.revoke("research", Permission::CanWriteFiles, "done"));
        assert!(!manager.check("research", Permission::CanWriteFiles));
        // Revoking again is a no-op.
        assert!(!manager.revoke("research", Permission::CanWriteFiles, "again"));
    }

    #[test]
    fn check_and_enforce_raises_on_deny() {
        let manager = PermissionsManager::new();
        let (ok, _) = manager
            .check_and_enforce(
                "codesmith",
                "write_file('src/main.py')",
                Permission::CanWriteFiles,
                false,
            )
            .unwrap();
        assert!(ok);

        let (ok, message) = manager
            .check_and_enforce(
                "research",
                "write_file('/tmp/x')",
                Permission::CanWriteFiles,
                false,
            )
            .unwrap();
        assert!(!ok);
        assert!(message.contains("can_write_files"));

        let err = manager
            .check_and_enforce(
                "research",
                "write_file('/tmp/x')",
                Permission::CanWriteFiles,
                true,
            )
            .unwrap_err();
        assert!(matches!(err, EnsembleError::PermissionDenied { .. }));
    }

    #[test]
    fn audit_log_records_checks_and_grants() {
        let manager = PermissionsManager::new();
        manager.check("research", Permission::CanWebSearch);
        manager.check("research", Permission::CanWriteFiles);
        manager
            .grant("research", Permission::CanWriteFiles, "findings", "admin")
            .unwrap();

        let log = manager.audit_log(Some("research"), 10);
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].action, AuditAction::Check);
        assert_eq!(log[1].result, AuditResult::Denied);
        assert_eq!(log[2].action, AuditAction::Grant);
        // Every grant carries its reason.
        assert_eq!(log[2].metadata["reason"], "findings");

        let stats = manager.stats();
        assert_eq!(stats.total_checks, 2);
        assert_eq!(stats.total_grants, 1);
        assert_eq!(stats.total_denials, 1);
    }

    #[test]
    fn audit_log_is_bounded() {
        let manager = PermissionsManager::new();
        for _ in 0..MAX_AUDIT_ENTRIES + 50 {
            manager.check("research", Permission::CanReadFiles);
        }
        let log = manager.audit_log(None, usize::MAX);
        assert_eq!(log.len(), MAX_AUDIT_ENTRIES);
    }
}
