use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::RiskLevel;

/// Frames a client may send over the session WebSocket.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Required first message: binds the session to a workspace.
    Init { workspace_path: String },
    /// A user query or follow-up instruction.
    Chat { content: String },
    /// Reply to an outstanding approval request. Without `approval_id`
    /// the most recent outstanding request is resolved.
    ApprovalResponse {
        approved: bool,
        #[serde(default)]
        approval_id: Option<String>,
    },
    Ping,
}

/// Frames the session layer sends to the client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Connection {
        session_id: String,
        version: String,
        requires_init: bool,
    },
    Initialized {
        session_id: String,
        workspace_path: String,
    },
    Status {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        phase: Option<String>,
    },
    AgentEvent {
        agent: String,
        event_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Progress {
        node: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        fraction: Option<f64>,
    },
    ApprovalRequest {
        approval_id: String,
        agent: String,
        mode: String,
        description: String,
        risk_level: RiskLevel,
    },
    ModelSelection {
        model: String,
        reason: String,
    },
    Result {
        success: bool,
        execution_time: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        quality_score: Option<f64>,
        agents_completed: Vec<String>,
        files_generated: Vec<String>,
        errors: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        adaptations: Option<Value>,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frames_deserialize_by_type_tag() {
        let init: ClientFrame =
            serde_json::from_str(r#"{"type":"init","workspace_path":"/tmp/app"}"#).unwrap();
        assert!(matches!(init, ClientFrame::Init { workspace_path } if workspace_path == "/tmp/app"));

        let approval: ClientFrame =
            serde_json::from_str(r#"{"type":"approval_response","approved":true}"#).unwrap();
        assert!(matches!(
            approval,
            ClientFrame::ApprovalResponse {
                approved: true,
                approval_id: None
            }
        ));

        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"bogus"}"#).is_err());
    }

    #[test]
    fn result_frame_omits_empty_options() {
        let frame = ServerFrame::Result {
            success: true,
            execution_time: 1.5,
            quality_score: None,
            agents_completed: vec!["research".into()],
            files_generated: vec![],
            errors: vec![],
            adaptations: None,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "result");
        assert!(json.get("quality_score").is_none());
        assert!(json.get("adaptations").is_none());
    }
}
