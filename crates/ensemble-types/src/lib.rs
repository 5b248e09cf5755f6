pub mod agent;
pub mod events;
pub mod wire;

pub use agent::{AgentKind, ErrorSeverity, RiskLevel, WorkflowError};
pub use events::WorkflowEvent;
pub use wire::{ClientFrame, ServerFrame};
