pub mod envelope;
pub mod message;
pub mod metadata;

pub use envelope::{EnvelopeEvent, SessionEnvelope, TurnStatus};
pub use message::{AgentMessage, AgentStatus};
pub use metadata::{
    CapabilitySnapshot, MetadataOption, SessionMetadata, extract_config_options_from_payload,
    extract_current_mode_id, extract_mode_state, extract_model_state, merge_capability_snapshot,
};
