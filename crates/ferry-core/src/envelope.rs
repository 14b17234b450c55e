use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of a closed turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    Completed,
    Failed,
    Cancelled,
}

impl TurnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Event payload of a [`SessionEnvelope`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EnvelopeEvent {
    TurnStart,
    TurnEnd {
        status: TurnStatus,
    },
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "is_false")]
        thinking: bool,
    },
    ToolCallStart {
        call: String,
        name: String,
        title: String,
        description: String,
        args: Value,
    },
    ToolCallEnd {
        call: String,
    },
}

/// Time-ordered unit delivered to the relay.
///
/// `id` is unique within a process; `time` strictly increases across every
/// envelope emitted by one session manager; `turn` binds the envelope to the
/// turn that was active when it was produced (None only for content flushed
/// after the turn already closed).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionEnvelope {
    pub id: String,
    pub time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn: Option<String>,
    pub ev: EnvelopeEvent,
}
