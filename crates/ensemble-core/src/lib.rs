pub mod capabilities;
pub mod config;
pub mod credit;
pub mod error;
pub mod permissions;

pub use capabilities::{AgentCapability, AgentModeSpec, CapabilityRegistry};
pub use config::EngineConfig;
pub use credit::{CreditLimits, CreditTracker, UsageInfo, UsageSummary};
pub use error::{EnsembleError, Result};
pub use permissions::{AuditEntry, Permission, PermissionStats, PermissionsManager};
