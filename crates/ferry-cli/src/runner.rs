//! Wires backend, session mapper and relay into one running bridge.
//!
//! Startup order: relay first (the caller hands it in established), then the
//! backend with the resolved invocation, then the mapper.  After that the
//! runner is a single loop multiplexing agent-messages against inbound relay
//! events until the session dies or the relay asks to kill it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use ferry_acp::{AcpBackend, BackendConfig, DefaultTransport};
use ferry_core::message::events;
use ferry_core::{
    AgentMessage, AgentStatus, CapabilitySnapshot, SessionEnvelope, SessionMetadata, TurnStatus,
    extract_config_options_from_payload, extract_current_mode_id, extract_mode_state,
    extract_model_state, merge_capability_snapshot,
};
use ferry_session::SessionMapper;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::agents::AgentInvocation;
use crate::relay::{InboundMessage, RelayEvent, RelaySession};

/// Environment variable carrying the tools-bridge URL into the child.
const BRIDGE_URL_ENV: &str = "FERRY_BRIDGE_URL";

pub struct RunnerOptions {
    pub invocation: AgentInvocation,
    pub working_dir: PathBuf,
    pub verbose: bool,
    pub bridge_url: Option<String>,
}

/// Drive one agent session to completion.  Returns the process exit code:
/// 0 on clean shutdown, 1 on startup failure, the child's exit code when it
/// died on its own.
pub async fn run(relay: Arc<dyn RelaySession>, options: RunnerOptions) -> Result<i32> {
    let mut env = HashMap::new();
    if let Some(url) = &options.bridge_url {
        env.insert(BRIDGE_URL_ENV.to_string(), url.clone());
    }

    let mut config = BackendConfig::new(
        options.invocation.command.clone(),
        options.invocation.args.clone(),
        options.working_dir.clone(),
    );
    config.env = env;
    config.mcp_servers = options.invocation.mcp_servers.clone();

    let (backend, mut messages) = AcpBackend::launch(config, Arc::new(DefaultTransport), None);
    let mut mapper = SessionMapper::new();

    let session_id = match backend.start_session(None).await {
        Ok(session_id) => session_id,
        Err(error) => {
            warn!(%error, "agent startup failed");
            relay.close().await;
            backend.dispose().await;
            return Ok(1);
        }
    };
    info!(session_id = %session_id, agent = %options.invocation.command, "bridge running");

    let mut snapshot = CapabilitySnapshot::default();
    let mut metadata = SessionMetadata::default();

    let fallback_code = loop {
        tokio::select! {
            message = messages.recv() => match message {
                Some(message) => {
                    if options.verbose {
                        println!(
                            "{}",
                            serde_json::json!({"type": "agent-message", "message": &message})
                        );
                    }
                    process_message(
                        message,
                        &mut mapper,
                        &mut snapshot,
                        &mut metadata,
                        &relay,
                    )
                    .await?;
                }
                // Backend gone: the child died or the actor stopped.
                None => break 1,
            },
            event = relay.next_event() => match event {
                Some(RelayEvent::Message(message)) => {
                    dispatch_user_message(
                        &message,
                        &backend,
                        &mut mapper,
                        &metadata,
                        &session_id,
                        &relay,
                    )
                    .await?;
                }
                Some(RelayEvent::Abort) => {
                    if let Err(error) = backend.cancel(&session_id).await {
                        warn!(%error, "abort failed");
                    }
                }
                Some(RelayEvent::Kill) | None => break 0,
            },
        }
    };

    relay.close().await;
    let child_code = backend.dispose().await;
    Ok(child_code.unwrap_or(fallback_code))
}

/// Map a backend status to the turn outcome it closes, if any.
fn turn_status_for(status: AgentStatus) -> Option<TurnStatus> {
    match status {
        AgentStatus::Idle => Some(TurnStatus::Completed),
        AgentStatus::Stopped => Some(TurnStatus::Cancelled),
        AgentStatus::Error => Some(TurnStatus::Failed),
        AgentStatus::Starting | AgentStatus::Running => None,
    }
}

fn is_capability_event(name: &str) -> bool {
    matches!(
        name,
        events::CONFIG_OPTIONS_UPDATE
            | events::MODES_UPDATE
            | events::MODELS_UPDATE
            | events::CURRENT_MODE_UPDATE
    )
}

/// Fold a capability event into the accumulated snapshot.
fn apply_capability_event(snapshot: &mut CapabilitySnapshot, name: &str, payload: &Value) {
    match name {
        events::CONFIG_OPTIONS_UPDATE => {
            if let Some(options) = extract_config_options_from_payload(payload) {
                snapshot.config_options = Some(options);
                snapshot.current_mode_id = None;
            }
        }
        events::MODES_UPDATE => {
            if let Some(state) = extract_mode_state(payload) {
                snapshot.modes = Some(state);
                snapshot.current_mode_id = None;
            }
        }
        events::MODELS_UPDATE => {
            if let Some(state) = extract_model_state(payload) {
                snapshot.models = Some(state);
            }
        }
        events::CURRENT_MODE_UPDATE => {
            if let Some(mode_id) = extract_current_mode_id(payload) {
                snapshot.current_mode_id = Some(mode_id);
            }
        }
        _ => {}
    }
}

async fn process_message(
    message: AgentMessage,
    mapper: &mut SessionMapper,
    snapshot: &mut CapabilitySnapshot,
    metadata: &mut SessionMetadata,
    relay: &Arc<dyn RelaySession>,
) -> Result<()> {
    match &message {
        AgentMessage::Event { name, payload } if is_capability_event(name) => {
            apply_capability_event(snapshot, name, payload);
            let next = merge_capability_snapshot(metadata.clone(), snapshot);
            if next != *metadata {
                *metadata = next.clone();
                relay.update_metadata(&next).await?;
            }
            Ok(())
        }
        AgentMessage::Status { status, detail } => {
            if let Some(detail) = detail {
                debug!(status = %status, detail = %detail, "backend status");
            }
            match turn_status_for(*status) {
                Some(turn_status) => send_envelopes(relay, mapper.end_turn(turn_status)).await,
                None => Ok(()),
            }
        }
        _ => send_envelopes(relay, mapper.map_message(&message)).await,
    }
}

async fn dispatch_user_message(
    message: &InboundMessage,
    backend: &AcpBackend,
    mapper: &mut SessionMapper,
    metadata: &SessionMetadata,
    session_id: &str,
    relay: &Arc<dyn RelaySession>,
) -> Result<()> {
    if let Some(meta) = &message.meta {
        // Selections are validated against the last seen capability state;
        // anything the agent never advertised is ignored.  The config-option
        // path is preferred, with the legacy setter as fallback.
        if let Some(mode) = &meta.permission_mode {
            if SessionMetadata::find_option(&metadata.operating_modes, mode).is_some() {
                if !backend.set_session_config_option("mode", mode).await {
                    backend.set_session_mode(mode).await;
                }
            } else {
                debug!(mode = %mode, "ignoring unadvertised permission mode");
            }
        }
        if let Some(model) = &meta.model {
            if SessionMetadata::find_option(&metadata.models, model).is_some() {
                if !backend.set_session_config_option("model", model).await {
                    backend.set_session_model(model).await;
                }
            } else {
                debug!(model = %model, "ignoring unadvertised model");
            }
        }
    }

    match backend.send_prompt(session_id, &message.text).await {
        Ok(()) => send_envelopes(relay, mapper.start_turn()).await,
        Err(error) => {
            warn!(%error, "prompt dispatch failed");
            Ok(())
        }
    }
}

async fn send_envelopes(
    relay: &Arc<dyn RelaySession>,
    envelopes: Vec<SessionEnvelope>,
) -> Result<()> {
    for envelope in envelopes {
        relay.send_envelope(&envelope).await?;
    }
    Ok(())
}
