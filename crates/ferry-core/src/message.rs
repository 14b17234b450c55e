use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Coarse activity state of the agent child process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Starting,
    Running,
    Idle,
    Error,
    Stopped,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Idle => "idle",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Flat message stream emitted by the backend after normalizing ACP traffic.
///
/// This is the only surface the session manager and runner consume; raw ACP
/// notification shapes never leave the backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum AgentMessage {
    Status {
        status: AgentStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    ModelOutput {
        #[serde(rename = "textDelta")]
        text_delta: String,
    },
    ToolCall {
        #[serde(rename = "callId")]
        call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        args: Value,
    },
    ToolResult {
        #[serde(rename = "callId")]
        call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        result: Value,
    },
    /// Carrier for `thinking`, `plan`, `available_commands`,
    /// `config_options_update`, `modes_update`, `current_mode_update` and
    /// `models_update` payloads.
    Event {
        name: String,
        payload: Value,
    },
    PermissionRequest {
        id: String,
        reason: String,
        payload: Value,
    },
    PermissionResponse {
        id: String,
        approved: bool,
    },
    TokenCount {
        total: u64,
    },
    FsEdit {
        payload: Value,
    },
    TerminalOutput {
        payload: Value,
    },
}

impl AgentMessage {
    pub fn status(status: AgentStatus) -> Self {
        Self::Status {
            status,
            detail: None,
        }
    }

    pub fn status_with_detail(status: AgentStatus, detail: impl Into<String>) -> Self {
        Self::Status {
            status,
            detail: Some(detail.into()),
        }
    }

    pub fn event(name: impl Into<String>, payload: Value) -> Self {
        Self::Event {
            name: name.into(),
            payload,
        }
    }
}

/// Well-known `Event` names.
pub mod events {
    pub const THINKING: &str = "thinking";
    pub const PLAN: &str = "plan";
    pub const AVAILABLE_COMMANDS: &str = "available_commands";
    pub const CONFIG_OPTIONS_UPDATE: &str = "config_options_update";
    pub const MODES_UPDATE: &str = "modes_update";
    pub const CURRENT_MODE_UPDATE: &str = "current_mode_update";
    pub const MODELS_UPDATE: &str = "models_update";
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_serializes_lowercase_kind_tag() {
        let msg = AgentMessage::status(AgentStatus::Idle);
        let value = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(value["kind"], "status");
        assert_eq!(value["status"], "idle");
        assert!(value.get("detail").is_none());
    }

    #[test]
    fn test_tool_call_round_trips_camel_case_fields() {
        let msg = AgentMessage::ToolCall {
            call_id: "acp-1".into(),
            tool_name: "ReadFile".into(),
            args: json!({"path": "README.md"}),
        };
        let value = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(value["kind"], "tool-call");
        assert_eq!(value["callId"], "acp-1");
        assert_eq!(value["toolName"], "ReadFile");

        let back: AgentMessage = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, msg);
    }

    #[test]
    fn test_event_constructor() {
        let msg = AgentMessage::event(events::PLAN, json!({"entries": []}));
        match msg {
            AgentMessage::Event { name, payload } => {
                assert_eq!(name, "plan");
                assert_eq!(payload, json!({"entries": []}));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
