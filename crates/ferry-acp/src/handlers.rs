//! Reducers for inbound `session/update` notifications.
//!
//! Each handler mutates the dispatch context (active tool calls, timers,
//! id-to-name map) and pushes normalized agent-messages through the emit
//! channel.  The backend owns the context; handlers stay free functions so
//! the per-kind behavior is testable without a child process.

use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Instant;

use ferry_core::message::events;
use ferry_core::{AgentMessage, AgentStatus};
use regex::Regex;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::Instant as TokioInstant;
use tracing::{debug, warn};

use crate::hooks::{INVESTIGATION_TIMEOUT_FACTOR, PromptContext, TransportHooks};

/// Gemini streams section headers like `**Analyzing the request**\n` inside
/// regular message chunks; those are thinking, not output.
static THINKING_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\*\*[^*]+\*\*\n").expect("thinking header regex"));

const ERROR_DETAIL_MAX: usize = 500;

/// One tracked tool call, from start until a terminal status or timeout.
#[derive(Debug)]
pub struct ActiveToolCall {
    pub tool_name: String,
    pub started: Instant,
    pub deadline: TokioInstant,
    pub investigation: bool,
}

/// Mutable state the dispatcher lends to each handler.
pub struct HandlerCtx<'a> {
    pub hooks: &'a dyn TransportHooks,
    pub emit: &'a mpsc::UnboundedSender<AgentMessage>,
    pub active: &'a mut HashMap<String, ActiveToolCall>,
    pub tool_names: &'a mut HashMap<String, String>,
    pub idle_deadline: &'a mut Option<TokioInstant>,
    pub prompt: PromptContext,
}

impl HandlerCtx<'_> {
    fn emit(&self, message: AgentMessage) {
        let _ = self.emit.send(message);
    }

    fn arm_idle_timer(&mut self) {
        *self.idle_deadline = Some(TokioInstant::now() + self.hooks.idle_timeout());
    }

    /// Clear the idle timer and emit `idle` once the active set drains.
    fn emit_idle_if_drained(&mut self) {
        if self.active.is_empty() {
            *self.idle_deadline = None;
            self.emit(AgentMessage::status(AgentStatus::Idle));
        }
    }
}

/// Dispatch outcome; a `Some` count replaces `toolCallCountSincePrompt`.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Handled {
    pub handled: bool,
    pub tool_call_count_since_prompt: Option<u32>,
}

impl Handled {
    fn done() -> Self {
        Self {
            handled: true,
            tool_call_count_since_prompt: None,
        }
    }

    fn ignored() -> Self {
        Self::default()
    }

    fn with_count(count: u32) -> Self {
        Self {
            handled: true,
            tool_call_count_since_prompt: Some(count),
        }
    }
}

pub fn dispatch_session_update(ctx: &mut HandlerCtx<'_>, params: &Value) -> Handled {
    let update = params.get("update").unwrap_or(params);
    let kind = update
        .get("sessionUpdate")
        .and_then(Value::as_str)
        .unwrap_or("");

    match kind {
        "agent_message_chunk" => handle_agent_message_chunk(ctx, update),
        "agent_thought_chunk" => handle_agent_thought_chunk(ctx, update),
        "tool_call" => handle_tool_call(ctx, update),
        "tool_call_update" => handle_tool_call_update(ctx, update),
        "available_commands_update" => {
            ctx.emit(AgentMessage::event(
                events::AVAILABLE_COMMANDS,
                update.clone(),
            ));
            Handled::done()
        }
        "config_options_update" | "config_option_update" => {
            ctx.emit(AgentMessage::event(
                events::CONFIG_OPTIONS_UPDATE,
                update.clone(),
            ));
            Handled::done()
        }
        "current_mode_update" => {
            ctx.emit(AgentMessage::event(
                events::CURRENT_MODE_UPDATE,
                update.clone(),
            ));
            Handled::done()
        }
        "models_update" => {
            ctx.emit(AgentMessage::event(events::MODELS_UPDATE, update.clone()));
            Handled::done()
        }
        "plan" => {
            ctx.emit(AgentMessage::event(events::PLAN, update.clone()));
            Handled::done()
        }
        "thinking" => {
            ctx.emit(AgentMessage::event(events::THINKING, update.clone()));
            Handled::done()
        }
        // Legacy streaming shape predating agent_message_chunk.
        "messageChunk" => handle_legacy_message_chunk(ctx, update),
        "usage_update" => handle_usage_update(ctx, update),
        other => {
            debug!(kind = other, "ignoring unknown session update");
            Handled::ignored()
        }
    }
}

fn handle_agent_message_chunk(ctx: &mut HandlerCtx<'_>, update: &Value) -> Handled {
    let Some(text) = chunk_text(update) else {
        return Handled::ignored();
    };
    if THINKING_HEADER.is_match(&text) {
        ctx.emit(AgentMessage::event(
            events::THINKING,
            json!({"text": text, "streaming": true}),
        ));
        return Handled::done();
    }
    ctx.emit(AgentMessage::ModelOutput { text_delta: text });
    ctx.arm_idle_timer();
    Handled::done()
}

fn handle_agent_thought_chunk(ctx: &mut HandlerCtx<'_>, update: &Value) -> Handled {
    let Some(text) = chunk_text(update) else {
        return Handled::ignored();
    };
    ctx.emit(AgentMessage::event(
        events::THINKING,
        json!({"text": text, "streaming": true}),
    ));
    Handled::done()
}

fn handle_legacy_message_chunk(ctx: &mut HandlerCtx<'_>, update: &Value) -> Handled {
    let delta = update
        .get("textDelta")
        .or_else(|| {
            update
                .get("messageChunk")
                .and_then(|chunk| chunk.get("textDelta"))
        })
        .and_then(Value::as_str);
    let Some(delta) = delta else {
        return Handled::ignored();
    };
    ctx.emit(AgentMessage::ModelOutput {
        text_delta: delta.to_string(),
    });
    ctx.arm_idle_timer();
    Handled::done()
}

fn handle_usage_update(ctx: &mut HandlerCtx<'_>, update: &Value) -> Handled {
    let total = update
        .get("total")
        .or_else(|| update.get("usedTokens"))
        .or_else(|| update.get("tokens").and_then(|tokens| tokens.get("total")))
        .and_then(Value::as_u64);
    let Some(total) = total else {
        return Handled::ignored();
    };
    ctx.emit(AgentMessage::TokenCount { total });
    Handled::done()
}

fn handle_tool_call(ctx: &mut HandlerCtx<'_>, update: &Value) -> Handled {
    let Some(call_id) = tool_call_id(update) else {
        return Handled::ignored();
    };
    if start_tool_call(ctx, &call_id, update) {
        Handled::with_count(ctx.prompt.tool_call_count_since_prompt + 1)
    } else {
        Handled::done()
    }
}

fn handle_tool_call_update(ctx: &mut HandlerCtx<'_>, update: &Value) -> Handled {
    let Some(call_id) = tool_call_id(update) else {
        return Handled::ignored();
    };
    let status = update.get("status").and_then(Value::as_str).unwrap_or("");
    match status {
        "pending" | "in_progress" => {
            start_tool_call(ctx, &call_id, update);
            Handled::done()
        }
        "completed" => {
            complete_tool_call(ctx, &call_id, update);
            Handled::done()
        }
        "failed" | "cancelled" => {
            fail_tool_call(ctx, &call_id, update, status);
            Handled::done()
        }
        other => {
            debug!(call_id = %call_id, status = other, "ignoring tool call update");
            Handled::ignored()
        }
    }
}

/// Start tracking a tool call.  Returns false when the call is already
/// active (duplicate `tool_call` or a late `in_progress`).
fn start_tool_call(ctx: &mut HandlerCtx<'_>, call_id: &str, update: &Value) -> bool {
    if ctx.active.contains_key(call_id) {
        return false;
    }

    let kind = update.get("kind").and_then(Value::as_str).unwrap_or("other");
    let args = parse_tool_args(update);
    let tool_name = resolve_tool_name(ctx, call_id, kind, &args);

    let investigation = ctx.hooks.is_investigation_tool(call_id, kind);
    let mut timeout = ctx.hooks.tool_call_timeout(call_id, kind);
    if investigation {
        timeout *= INVESTIGATION_TIMEOUT_FACTOR;
    }

    ctx.active.insert(
        call_id.to_string(),
        ActiveToolCall {
            tool_name: tool_name.clone(),
            started: Instant::now(),
            deadline: TokioInstant::now() + timeout,
            investigation,
        },
    );
    ctx.tool_names.insert(call_id.to_string(), tool_name.clone());

    // A running status must be observable before the tool-call itself.
    ctx.emit(AgentMessage::status(AgentStatus::Running));
    ctx.emit(AgentMessage::ToolCall {
        call_id: call_id.to_string(),
        tool_name,
        args,
    });
    true
}

fn complete_tool_call(ctx: &mut HandlerCtx<'_>, call_id: &str, update: &Value) {
    let tool_name = match ctx.active.remove(call_id) {
        Some(call) => {
            log_tool_duration(&call, call_id, "tool call completed");
            call.tool_name
        }
        // Terminal update for a call we never tracked; still surface it.
        None => lookup_tool_name(ctx, call_id),
    };

    let mut result = json!({"status": "completed"});
    if let Some(content) = update.get("content") {
        result["content"] = content.clone();
    }
    ctx.emit(AgentMessage::ToolResult {
        call_id: call_id.to_string(),
        tool_name,
        result,
    });
    ctx.emit_idle_if_drained();
}

fn fail_tool_call(ctx: &mut HandlerCtx<'_>, call_id: &str, update: &Value, status: &str) {
    let detail = extract_error_detail(update, status);
    let tool_name = match ctx.active.remove(call_id) {
        Some(call) => {
            let elapsed = call.started.elapsed().as_secs_f64();
            warn!(
                call_id = %call_id,
                tool = %call.tool_name,
                elapsed = format!("{elapsed:.2}s"),
                status,
                detail = %detail,
                "tool call failed"
            );
            call.tool_name
        }
        None => lookup_tool_name(ctx, call_id),
    };

    ctx.emit(AgentMessage::ToolResult {
        call_id: call_id.to_string(),
        tool_name,
        result: json!({"error": detail, "status": status}),
    });
    ctx.emit_idle_if_drained();
}

/// Drop tool calls whose deadline passed.  Timed-out calls get no
/// tool-result; they simply stop occupying the active set, and the agent
/// going quiet afterwards surfaces as `idle`.
pub fn expire_tool_calls(ctx: &mut HandlerCtx<'_>, now: TokioInstant) {
    let expired: Vec<String> = ctx
        .active
        .iter()
        .filter(|(_, call)| call.deadline <= now)
        .map(|(call_id, _)| call_id.clone())
        .collect();
    if expired.is_empty() {
        return;
    }

    for call_id in expired {
        if let Some(call) = ctx.active.remove(&call_id) {
            log_tool_duration(&call, &call_id, "tool call timed out");
        }
    }
    ctx.emit_idle_if_drained();
}

fn log_tool_duration(call: &ActiveToolCall, call_id: &str, message: &'static str) {
    let elapsed = call.started.elapsed().as_secs_f64();
    if call.investigation {
        debug!(
            call_id = %call_id,
            tool = %call.tool_name,
            elapsed = format!("{elapsed:.2}s ({:.2}min)", elapsed / 60.0),
            investigation = true,
            "{message}"
        );
    } else {
        debug!(
            call_id = %call_id,
            tool = %call.tool_name,
            elapsed = format!("{elapsed:.2}s"),
            "{message}"
        );
    }
}

fn resolve_tool_name(ctx: &HandlerCtx<'_>, call_id: &str, kind: &str, input: &Value) -> String {
    if let Some(name) = ctx.hooks.extract_tool_name_from_id(call_id) {
        return name;
    }
    ctx.hooks
        .determine_tool_name(kind, call_id, input, ctx.prompt)
}

fn lookup_tool_name(ctx: &HandlerCtx<'_>, call_id: &str) -> String {
    ctx.tool_names
        .get(call_id)
        .cloned()
        .unwrap_or_else(|| "other".to_string())
}

fn tool_call_id(update: &Value) -> Option<String> {
    update
        .get("toolCallId")
        .or_else(|| update.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn chunk_text(update: &Value) -> Option<String> {
    match update.get("content") {
        Some(Value::String(text)) => Some(text.clone()),
        Some(content) => content
            .get("text")
            .and_then(Value::as_str)
            .map(str::to_string),
        None => None,
    }
}

/// Tool args: `content` array wrapped as `items`, object passed through,
/// with `locations` merged in when present.
fn parse_tool_args(update: &Value) -> Value {
    let mut args = match update.get("content") {
        Some(Value::Array(items)) => json!({"items": items}),
        Some(Value::Object(map)) => Value::Object(map.clone()),
        _ => json!({}),
    };
    if let Some(locations) = update.get("locations") {
        if let Some(object) = args.as_object_mut() {
            object.insert("locations".to_string(), locations.clone());
        }
    }
    args
}

/// Best human-readable failure detail, in preference order.
fn extract_error_detail(update: &Value, status: &str) -> String {
    if let Some(content) = update.get("content") {
        if let Some(message) = content
            .get("error")
            .and_then(|error| error.get("message"))
            .and_then(Value::as_str)
        {
            return message.to_string();
        }
        if let Some(error) = content.get("error").and_then(Value::as_str) {
            return error.to_string();
        }
        if let Some(message) = content.get("message").and_then(Value::as_str) {
            return message.to_string();
        }
    }
    if let Some(reason) = update.get("reason").and_then(Value::as_str) {
        return reason.to_string();
    }
    if !status.is_empty() {
        return status.to_string();
    }
    truncate_owned(update.to_string(), ERROR_DETAIL_MAX)
}

fn truncate_owned(mut text: String, max: usize) -> String {
    if text.len() > max {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::DefaultTransport;
    use std::time::Duration;

    struct Fixture {
        active: HashMap<String, ActiveToolCall>,
        tool_names: HashMap<String, String>,
        idle_deadline: Option<TokioInstant>,
        tx: mpsc::UnboundedSender<AgentMessage>,
        rx: mpsc::UnboundedReceiver<AgentMessage>,
    }

    impl Fixture {
        fn new() -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                active: HashMap::new(),
                tool_names: HashMap::new(),
                idle_deadline: None,
                tx,
                rx,
            }
        }

        fn dispatch(&mut self, hooks: &dyn TransportHooks, params: &Value) -> Handled {
            let mut ctx = HandlerCtx {
                hooks,
                emit: &self.tx,
                active: &mut self.active,
                tool_names: &mut self.tool_names,
                idle_deadline: &mut self.idle_deadline,
                prompt: PromptContext::default(),
            };
            dispatch_session_update(&mut ctx, params)
        }

        fn drain(&mut self) -> Vec<AgentMessage> {
            let mut out = Vec::new();
            while let Ok(message) = self.rx.try_recv() {
                out.push(message);
            }
            out
        }
    }

    fn update(inner: Value) -> Value {
        json!({"sessionId": "s1", "update": inner})
    }

    #[tokio::test]
    async fn test_message_chunk_emits_model_output_and_arms_idle() {
        let mut fixture = Fixture::new();
        let handled = fixture.dispatch(
            &DefaultTransport,
            &update(json!({
                "sessionUpdate": "agent_message_chunk",
                "content": {"type": "text", "text": "hello"}
            })),
        );

        assert!(handled.handled);
        assert!(fixture.idle_deadline.is_some());
        assert_eq!(
            fixture.drain(),
            vec![AgentMessage::ModelOutput {
                text_delta: "hello".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_bold_header_chunk_becomes_streaming_thinking() {
        let mut fixture = Fixture::new();
        fixture.dispatch(
            &DefaultTransport,
            &update(json!({
                "sessionUpdate": "agent_message_chunk",
                "content": {"type": "text", "text": "**Analyzing the request**\nnow"}
            })),
        );

        let messages = fixture.drain();
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            AgentMessage::Event { name, payload } => {
                assert_eq!(name, "thinking");
                assert_eq!(payload["streaming"], true);
                assert_eq!(payload["text"], "**Analyzing the request**\nnow");
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(
            fixture.idle_deadline.is_none(),
            "thinking must not arm the idle timer"
        );
    }

    #[tokio::test]
    async fn test_thought_chunk_is_streaming_thinking() {
        let mut fixture = Fixture::new();
        fixture.dispatch(
            &DefaultTransport,
            &update(json!({
                "sessionUpdate": "agent_thought_chunk",
                "content": {"type": "text", "text": "hmm"}
            })),
        );

        match &fixture.drain()[0] {
            AgentMessage::Event { name, payload } => {
                assert_eq!(name, "thinking");
                assert_eq!(payload["text"], "hmm");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tool_call_starts_tracking_and_emits_running() {
        let mut fixture = Fixture::new();
        let handled = fixture.dispatch(
            &DefaultTransport,
            &update(json!({
                "sessionUpdate": "tool_call",
                "toolCallId": "t1",
                "kind": "execute",
                "content": {"command": "ls"},
                "locations": [{"path": "/tmp"}]
            })),
        );

        assert_eq!(handled.tool_call_count_since_prompt, Some(1));
        assert!(fixture.active.contains_key("t1"));
        let messages = fixture.drain();
        assert_eq!(
            messages[0],
            AgentMessage::status(AgentStatus::Running)
        );
        match &messages[1] {
            AgentMessage::ToolCall {
                call_id,
                tool_name,
                args,
            } => {
                assert_eq!(call_id, "t1");
                assert_eq!(tool_name, "execute");
                assert_eq!(args["command"], "ls");
                assert_eq!(args["locations"][0]["path"], "/tmp");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_duplicate_tool_call_does_not_restart() {
        let mut fixture = Fixture::new();
        let call = update(json!({
            "sessionUpdate": "tool_call",
            "toolCallId": "t1",
            "kind": "read"
        }));
        fixture.dispatch(&DefaultTransport, &call);
        fixture.drain();

        let handled = fixture.dispatch(&DefaultTransport, &call);
        assert!(handled.handled);
        assert!(handled.tool_call_count_since_prompt.is_none());
        assert!(fixture.drain().is_empty());
    }

    #[tokio::test]
    async fn test_array_content_is_wrapped_as_items() {
        let mut fixture = Fixture::new();
        fixture.dispatch(
            &DefaultTransport,
            &update(json!({
                "sessionUpdate": "tool_call",
                "toolCallId": "t2",
                "kind": "edit",
                "content": [{"type": "diff", "path": "a.rs"}]
            })),
        );

        let messages = fixture.drain();
        match &messages[1] {
            AgentMessage::ToolCall { args, .. } => {
                assert_eq!(args["items"][0]["path"], "a.rs");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_completion_emits_result_and_idle_when_drained() {
        let mut fixture = Fixture::new();
        fixture.dispatch(
            &DefaultTransport,
            &update(json!({
                "sessionUpdate": "tool_call",
                "toolCallId": "t1",
                "kind": "execute"
            })),
        );
        fixture.drain();

        fixture.dispatch(
            &DefaultTransport,
            &update(json!({
                "sessionUpdate": "tool_call_update",
                "toolCallId": "t1",
                "status": "completed",
                "content": {"type": "text", "text": "done"}
            })),
        );

        let messages = fixture.drain();
        assert_eq!(messages.len(), 2);
        match &messages[0] {
            AgentMessage::ToolResult {
                call_id,
                tool_name,
                result,
            } => {
                assert_eq!(call_id, "t1");
                assert_eq!(tool_name, "execute");
                assert_eq!(result["status"], "completed");
                assert_eq!(result["content"]["text"], "done");
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert_eq!(messages[1], AgentMessage::status(AgentStatus::Idle));
        assert!(fixture.active.is_empty());
        assert!(fixture.idle_deadline.is_none());
    }

    #[tokio::test]
    async fn test_idle_waits_for_remaining_tool_calls() {
        let mut fixture = Fixture::new();
        for id in ["t1", "t2"] {
            fixture.dispatch(
                &DefaultTransport,
                &update(json!({
                    "sessionUpdate": "tool_call",
                    "toolCallId": id,
                    "kind": "execute"
                })),
            );
        }
        fixture.drain();

        fixture.dispatch(
            &DefaultTransport,
            &update(json!({
                "sessionUpdate": "tool_call_update",
                "toolCallId": "t1",
                "status": "completed"
            })),
        );

        let messages = fixture.drain();
        assert_eq!(messages.len(), 1, "no idle while t2 is active");
        assert!(matches!(messages[0], AgentMessage::ToolResult { .. }));
    }

    #[tokio::test]
    async fn test_failure_extracts_error_detail_chain() {
        let mut fixture = Fixture::new();
        fixture.dispatch(
            &DefaultTransport,
            &update(json!({
                "sessionUpdate": "tool_call",
                "toolCallId": "t1",
                "kind": "execute"
            })),
        );
        fixture.drain();

        fixture.dispatch(
            &DefaultTransport,
            &update(json!({
                "sessionUpdate": "tool_call_update",
                "toolCallId": "t1",
                "status": "failed",
                "content": {"error": {"message": "command not found"}}
            })),
        );

        let messages = fixture.drain();
        match &messages[0] {
            AgentMessage::ToolResult { result, .. } => {
                assert_eq!(result["error"], "command not found");
                assert_eq!(result["status"], "failed");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_error_detail_preference_order() {
        let status = "failed";
        assert_eq!(
            extract_error_detail(
                &json!({"content": {"error": {"message": "m1"}}}),
                status
            ),
            "m1"
        );
        assert_eq!(
            extract_error_detail(&json!({"content": {"error": "e1"}}), status),
            "e1"
        );
        assert_eq!(
            extract_error_detail(&json!({"content": {"message": "m2"}}), status),
            "m2"
        );
        assert_eq!(
            extract_error_detail(&json!({"reason": "denied"}), status),
            "denied"
        );
        assert_eq!(extract_error_detail(&json!({}), status), "failed");

        let huge = json!({"payload": "x".repeat(2000)});
        let detail = extract_error_detail(&huge, "");
        assert_eq!(detail.len(), 500);
    }

    #[tokio::test]
    async fn test_orphan_completion_still_emits_result() {
        let mut fixture = Fixture::new();
        fixture.dispatch(
            &DefaultTransport,
            &update(json!({
                "sessionUpdate": "tool_call_update",
                "toolCallId": "ghost",
                "status": "completed"
            })),
        );

        let messages = fixture.drain();
        match &messages[0] {
            AgentMessage::ToolResult {
                call_id, tool_name, ..
            } => {
                assert_eq!(call_id, "ghost");
                assert_eq!(tool_name, "other");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_pending_update_starts_tracking() {
        let mut fixture = Fixture::new();
        fixture.dispatch(
            &DefaultTransport,
            &update(json!({
                "sessionUpdate": "tool_call_update",
                "toolCallId": "t9",
                "status": "in_progress",
                "kind": "fetch"
            })),
        );

        assert!(fixture.active.contains_key("t9"));
        let messages = fixture.drain();
        assert_eq!(messages[0], AgentMessage::status(AgentStatus::Running));
    }

    #[tokio::test]
    async fn test_expired_tool_calls_drop_and_emit_idle() {
        let mut fixture = Fixture::new();
        fixture.dispatch(
            &DefaultTransport,
            &update(json!({
                "sessionUpdate": "tool_call",
                "toolCallId": "slow",
                "kind": "execute"
            })),
        );
        fixture.drain();

        let far_future = TokioInstant::now() + Duration::from_secs(600);
        let mut ctx = HandlerCtx {
            hooks: &DefaultTransport,
            emit: &fixture.tx,
            active: &mut fixture.active,
            tool_names: &mut fixture.tool_names,
            idle_deadline: &mut fixture.idle_deadline,
            prompt: PromptContext::default(),
        };
        expire_tool_calls(&mut ctx, far_future);

        assert!(fixture.active.is_empty());
        let messages = fixture.drain();
        assert_eq!(messages, vec![AgentMessage::status(AgentStatus::Idle)]);
    }

    #[tokio::test]
    async fn test_investigation_tool_gets_extended_deadline() {
        struct Investigative;
        impl TransportHooks for Investigative {
            fn is_investigation_tool(&self, _id: &str, kind: &str) -> bool {
                kind == "search"
            }
        }

        let mut fixture = Fixture::new();
        fixture.dispatch(
            &Investigative,
            &update(json!({
                "sessionUpdate": "tool_call",
                "toolCallId": "deep",
                "kind": "search"
            })),
        );

        let call = fixture.active.get("deep").expect("tracked");
        assert!(call.investigation);
        let remaining = call.deadline - TokioInstant::now();
        assert!(
            remaining > Duration::from_secs(500),
            "expected extended deadline, got {remaining:?}"
        );
    }

    #[tokio::test]
    async fn test_hook_overrides_tool_name() {
        struct NameFromId;
        impl TransportHooks for NameFromId {
            fn extract_tool_name_from_id(&self, id: &str) -> Option<String> {
                id.split_once('-').map(|(name, _)| name.to_string())
            }
        }

        let mut fixture = Fixture::new();
        fixture.dispatch(
            &NameFromId,
            &update(json!({
                "sessionUpdate": "tool_call",
                "toolCallId": "grep-42",
                "kind": "other"
            })),
        );

        let messages = fixture.drain();
        match &messages[1] {
            AgentMessage::ToolCall { tool_name, .. } => assert_eq!(tool_name, "grep"),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_config_and_mode_updates_forward_as_events() {
        let mut fixture = Fixture::new();
        for (kind, expected) in [
            ("config_options_update", "config_options_update"),
            ("config_option_update", "config_options_update"),
            ("current_mode_update", "current_mode_update"),
            ("available_commands_update", "available_commands"),
            ("models_update", "models_update"),
            ("plan", "plan"),
        ] {
            fixture.dispatch(&DefaultTransport, &update(json!({"sessionUpdate": kind})));
            let messages = fixture.drain();
            match &messages[0] {
                AgentMessage::Event { name, .. } => assert_eq!(name, expected),
                other => panic!("unexpected message for {kind}: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_legacy_message_chunk_text_delta() {
        let mut fixture = Fixture::new();
        fixture.dispatch(
            &DefaultTransport,
            &update(json!({"sessionUpdate": "messageChunk", "textDelta": "old style"})),
        );

        assert_eq!(
            fixture.drain(),
            vec![AgentMessage::ModelOutput {
                text_delta: "old style".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_unknown_update_is_dropped() {
        let mut fixture = Fixture::new();
        let handled = fixture.dispatch(
            &DefaultTransport,
            &update(json!({"sessionUpdate": "galaxy_brain"})),
        );

        assert!(!handled.handled);
        assert!(fixture.drain().is_empty());
    }

    #[tokio::test]
    async fn test_usage_update_emits_token_count() {
        let mut fixture = Fixture::new();
        fixture.dispatch(
            &DefaultTransport,
            &update(json!({"sessionUpdate": "usage_update", "usedTokens": 1234})),
        );

        assert_eq!(
            fixture.drain(),
            vec![AgentMessage::TokenCount { total: 1234 }]
        );
    }
}
