//! Projection of the backend's agent-message stream into turn-scoped
//! session envelopes.
//!
//! The mapper owns no I/O.  Callers drive it with [`SessionMapper::map_message`]
//! for each agent-message and with [`SessionMapper::start_turn`] /
//! [`SessionMapper::end_turn`] for the turn lifecycle, forwarding every
//! returned envelope to the relay in order.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use ferry_core::message::events;
use ferry_core::{AgentMessage, EnvelopeEvent, SessionEnvelope, TurnStatus};
use serde_json::Value;
use ulid::Ulid;

pub struct SessionMapper {
    current_turn: Option<String>,
    pending_text: String,
    pending_thinking: String,
    call_ids: HashMap<String, String>,
    time_counter: u64,
}

impl Default for SessionMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMapper {
    pub fn new() -> Self {
        Self {
            current_turn: None,
            pending_text: String::new(),
            pending_thinking: String::new(),
            call_ids: HashMap::new(),
            time_counter: 0,
        }
    }

    pub fn current_turn(&self) -> Option<&str> {
        self.current_turn.as_deref()
    }

    /// Open a turn.  A no-op while a turn is already active.
    pub fn start_turn(&mut self) -> Vec<SessionEnvelope> {
        if self.current_turn.is_some() {
            return Vec::new();
        }
        self.current_turn = Some(Ulid::new().to_string());
        vec![self.envelope(EnvelopeEvent::TurnStart)]
    }

    /// Close the active turn, flushing any buffered text and thinking first.
    ///
    /// Flushing also happens when no turn is active, so output arriving after
    /// the turn closed is still observable (with a null turn id) rather than
    /// silently dropped.
    pub fn end_turn(&mut self, status: TurnStatus) -> Vec<SessionEnvelope> {
        let mut out = self.flush_pending();
        if self.current_turn.is_some() {
            out.push(self.envelope(EnvelopeEvent::TurnEnd { status }));
            self.current_turn = None;
        }
        out
    }

    /// Map one agent-message into zero or more envelopes.
    pub fn map_message(&mut self, message: &AgentMessage) -> Vec<SessionEnvelope> {
        match message {
            // Turn lifecycle is owned by the caller; status never maps.
            AgentMessage::Status { .. } => Vec::new(),
            AgentMessage::PermissionRequest { .. }
            | AgentMessage::PermissionResponse { .. }
            | AgentMessage::TokenCount { .. }
            | AgentMessage::FsEdit { .. }
            | AgentMessage::TerminalOutput { .. } => Vec::new(),

            AgentMessage::ModelOutput { text_delta } => self.on_model_output(text_delta),

            AgentMessage::Event { name, payload } if name == events::THINKING => {
                self.on_thinking(payload)
            }
            AgentMessage::Event { .. } => Vec::new(),

            AgentMessage::ToolCall {
                call_id,
                tool_name,
                args,
            } => self.on_tool_call(call_id, tool_name, args),

            AgentMessage::ToolResult { call_id, .. } => self.on_tool_result(call_id),
        }
    }

    fn on_model_output(&mut self, text_delta: &str) -> Vec<SessionEnvelope> {
        if text_delta.is_empty() {
            return Vec::new();
        }
        let mut out = Vec::new();
        // Opposing kind arriving: close out the streamed thinking run first.
        if !self.pending_thinking.is_empty() {
            let text = std::mem::take(&mut self.pending_thinking);
            out.push(self.text_envelope(text, true));
        }
        self.pending_text.push_str(text_delta);
        out
    }

    fn on_thinking(&mut self, payload: &Value) -> Vec<SessionEnvelope> {
        let Some(text) = payload.get("text").and_then(Value::as_str) else {
            return Vec::new();
        };
        if text.is_empty() {
            return Vec::new();
        }
        let streaming = payload
            .get("streaming")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if streaming {
            let mut out = Vec::new();
            if !self.pending_text.is_empty() {
                let flushed = std::mem::take(&mut self.pending_text);
                out.push(self.text_envelope(flushed, false));
            }
            self.pending_thinking.push_str(text);
            out
        } else {
            let mut out = self.flush_pending();
            let text = text.to_string();
            out.push(self.text_envelope(text, true));
            out
        }
    }

    fn on_tool_call(
        &mut self,
        call_id: &str,
        tool_name: &str,
        args: &Value,
    ) -> Vec<SessionEnvelope> {
        let mut out = self.flush_pending();
        let our_call_id = Ulid::new().to_string();
        self.call_ids
            .insert(call_id.to_string(), our_call_id.clone());
        out.push(self.envelope(EnvelopeEvent::ToolCallStart {
            call: our_call_id,
            name: tool_name.to_string(),
            title: tool_name.to_string(),
            description: tool_name.to_string(),
            args: args.clone(),
        }));
        out
    }

    fn on_tool_result(&mut self, call_id: &str) -> Vec<SessionEnvelope> {
        // An unknown call id still gets an end envelope so every result is
        // observable.  Removing the mapping keeps call values single-use.
        let our_call_id = self
            .call_ids
            .remove(call_id)
            .unwrap_or_else(|| Ulid::new().to_string());
        // Text is NOT flushed here: results interleave with streaming output.
        vec![self.envelope(EnvelopeEvent::ToolCallEnd { call: our_call_id })]
    }

    /// Flush buffered text, then buffered thinking.  At most one of the two
    /// buffers is ever non-empty because each flushes the other on arrival.
    fn flush_pending(&mut self) -> Vec<SessionEnvelope> {
        let mut out = Vec::new();
        if !self.pending_text.is_empty() {
            let text = std::mem::take(&mut self.pending_text);
            out.push(self.text_envelope(text, false));
        }
        if !self.pending_thinking.is_empty() {
            let text = std::mem::take(&mut self.pending_thinking);
            out.push(self.text_envelope(text, true));
        }
        out
    }

    fn text_envelope(&mut self, text: String, thinking: bool) -> SessionEnvelope {
        self.envelope(EnvelopeEvent::Text { text, thinking })
    }

    fn envelope(&mut self, ev: EnvelopeEvent) -> SessionEnvelope {
        // Strictly increasing, clamped above wall-clock millis so envelope
        // times stay comparable to timestamps taken elsewhere.
        self.time_counter = (self.time_counter + 1).max(wall_clock_millis());
        SessionEnvelope {
            id: Ulid::new().to_string(),
            time: self.time_counter,
            turn: self.current_turn.clone(),
            ev,
        }
    }
}

fn wall_clock_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
