//! Child-process supervisor and ACP protocol driver.
//!
//! All mutable state lives in one actor task; the [`AcpBackend`] handle
//! issues commands over a bounded channel and the normalized agent-message
//! stream comes back on the receiver returned by [`AcpBackend::launch`].
//! Nothing outside the actor touches the child, the connection or the
//! tracking maps.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use ferry_core::message::events;
use ferry_core::{
    AgentMessage, AgentStatus, extract_config_options_from_payload, extract_current_mode_id,
    extract_mode_state, extract_model_state,
};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant as TokioInstant;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::error::{BackendError, BackendResult};
use crate::handlers::{self, ActiveToolCall, HandlerCtx};
use crate::hooks::{PromptContext, TransportHooks};
use crate::jsonrpc::{Connection, Inbound};
use crate::permission::{self, PermissionDecision, PermissionHandler};

const HANDSHAKE_ATTEMPTS: u32 = 3;
const BACKOFF_CLAMP: Duration = Duration::from_secs(5);
const TERMINATION_GRACE: Duration = Duration::from_secs(1);
const DISPOSE_CANCEL_TIMEOUT: Duration = Duration::from_secs(2);
const SETTER_TIMEOUT: Duration = Duration::from_secs(10);
const STDERR_TAIL_MAX: usize = 8 * 1024;
const COMMAND_CAPACITY: usize = 16;

/// Callback evaluated against each outgoing prompt; feeds
/// `recent_prompt_had_change_title` in [`PromptContext`].
pub type ChangeTitleProbe = Arc<dyn Fn(&str) -> bool + Send + Sync>;

pub struct BackendConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Extra environment on top of the inherited one.
    pub env: HashMap<String, String>,
    /// Forwarded verbatim as `mcpServers` in `session/new`.
    pub mcp_servers: Vec<Value>,
    pub change_title_probe: Option<ChangeTitleProbe>,
}

impl BackendConfig {
    pub fn new(command: impl Into<String>, args: Vec<String>, working_dir: PathBuf) -> Self {
        Self {
            command: command.into(),
            args,
            working_dir,
            env: HashMap::new(),
            mcp_servers: Vec::new(),
            change_title_probe: None,
        }
    }
}

enum BackendCommand {
    StartSession {
        initial_prompt: Option<String>,
        reply: oneshot::Sender<BackendResult<String>>,
    },
    SendPrompt {
        session_id: String,
        text: String,
        reply: oneshot::Sender<BackendResult<()>>,
    },
    Cancel {
        session_id: String,
        reply: oneshot::Sender<BackendResult<()>>,
    },
    SetMode {
        mode_id: String,
        reply: oneshot::Sender<bool>,
    },
    SetModel {
        model_id: String,
        reply: oneshot::Sender<bool>,
    },
    SetConfigOption {
        config_id: String,
        value: String,
        reply: oneshot::Sender<bool>,
    },
    RespondToPermission {
        id: String,
        approved: bool,
    },
    Dispose {
        reply: oneshot::Sender<()>,
    },
}

enum InternalEvent {
    PromptFinished { ok: bool },
}

/// Handle to a running backend actor.  Cheap to clone.
#[derive(Clone)]
pub struct AcpBackend {
    cmd_tx: mpsc::Sender<BackendCommand>,
    exit_code: Arc<StdMutex<Option<i32>>>,
}

impl AcpBackend {
    /// Spawn the backend actor.  The receiver carries every agent-message
    /// the backend emits, in arrival order.
    pub fn launch(
        config: BackendConfig,
        hooks: Arc<dyn TransportHooks>,
        permission_handler: Option<Arc<dyn PermissionHandler>>,
    ) -> (Self, mpsc::UnboundedReceiver<AgentMessage>) {
        let (emit_tx, emit_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (internal_tx, internal_rx) = mpsc::channel(COMMAND_CAPACITY);
        let exit_code = Arc::new(StdMutex::new(None));

        let actor = BackendActor {
            config,
            hooks,
            permission_handler,
            emit_tx,
            cmd_rx,
            internal_tx,
            internal_rx,
            child: None,
            conn: None,
            inbound_rx: None,
            session_id: None,
            active: HashMap::new(),
            tool_names: HashMap::new(),
            idle_deadline: None,
            tool_call_count_since_prompt: 0,
            recent_prompt_had_change_title: false,
            config_options_cache: None,
            stderr_tail: Arc::new(StdMutex::new(String::new())),
            exit_code: exit_code.clone(),
            disposed: false,
        };
        tokio::spawn(actor.run());

        (Self { cmd_tx, exit_code }, emit_rx)
    }

    /// Spawn the child, run the handshake and return the ACP session id.
    pub async fn start_session(&self, initial_prompt: Option<String>) -> BackendResult<String> {
        let (tx, rx) = oneshot::channel();
        self.send(BackendCommand::StartSession {
            initial_prompt,
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| BackendError::Disposed)?
    }

    /// Dispatch a prompt.  The reply confirms dispatch; protocol failures
    /// during the turn surface as `status=error` agent-messages.
    pub async fn send_prompt(&self, session_id: &str, text: &str) -> BackendResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(BackendCommand::SendPrompt {
            session_id: session_id.to_string(),
            text: text.to_string(),
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| BackendError::Disposed)?
    }

    /// Ask the agent to stop the current turn.  Does not kill the child.
    pub async fn cancel(&self, session_id: &str) -> BackendResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(BackendCommand::Cancel {
            session_id: session_id.to_string(),
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| BackendError::Disposed)?
    }

    pub async fn set_session_mode(&self, mode_id: &str) -> bool {
        let (tx, rx) = oneshot::channel();
        let sent = self
            .send(BackendCommand::SetMode {
                mode_id: mode_id.to_string(),
                reply: tx,
            })
            .await
            .is_ok();
        sent && rx.await.unwrap_or(false)
    }

    pub async fn set_session_model(&self, model_id: &str) -> bool {
        let (tx, rx) = oneshot::channel();
        let sent = self
            .send(BackendCommand::SetModel {
                model_id: model_id.to_string(),
                reply: tx,
            })
            .await
            .is_ok();
        sent && rx.await.unwrap_or(false)
    }

    pub async fn set_session_config_option(&self, config_id: &str, value: &str) -> bool {
        let (tx, rx) = oneshot::channel();
        let sent = self
            .send(BackendCommand::SetConfigOption {
                config_id: config_id.to_string(),
                value: value.to_string(),
                reply: tx,
            })
            .await
            .is_ok();
        sent && rx.await.unwrap_or(false)
    }

    /// Surface a UI permission reply on the stream.  ACP permissions are
    /// answered synchronously inside the RPC, so nothing is transmitted.
    pub async fn respond_to_permission(&self, id: &str, approved: bool) {
        let _ = self
            .send(BackendCommand::RespondToPermission {
                id: id.to_string(),
                approved,
            })
            .await;
    }

    /// Tear the backend down.  Idempotent.  Returns the child's exit code
    /// when it had already exited on its own.
    pub async fn dispose(&self) -> Option<i32> {
        let (tx, rx) = oneshot::channel();
        if self
            .send(BackendCommand::Dispose { reply: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
        self.exit_code.lock().ok().and_then(|slot| *slot)
    }

    async fn send(&self, command: BackendCommand) -> BackendResult<()> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| BackendError::Disposed)
    }
}

struct BackendActor {
    config: BackendConfig,
    hooks: Arc<dyn TransportHooks>,
    permission_handler: Option<Arc<dyn PermissionHandler>>,
    emit_tx: mpsc::UnboundedSender<AgentMessage>,
    cmd_rx: mpsc::Receiver<BackendCommand>,
    internal_tx: mpsc::Sender<InternalEvent>,
    internal_rx: mpsc::Receiver<InternalEvent>,
    child: Option<Child>,
    conn: Option<Connection>,
    inbound_rx: Option<mpsc::Receiver<Inbound>>,
    session_id: Option<String>,
    active: HashMap<String, ActiveToolCall>,
    tool_names: HashMap<String, String>,
    idle_deadline: Option<TokioInstant>,
    tool_call_count_since_prompt: u32,
    recent_prompt_had_change_title: bool,
    config_options_cache: Option<Vec<Value>>,
    stderr_tail: Arc<StdMutex<String>>,
    exit_code: Arc<StdMutex<Option<i32>>>,
    disposed: bool,
}

enum Wake {
    Command(Option<BackendCommand>),
    Inbound(Option<Inbound>),
    Internal(Option<InternalEvent>),
    IdleTimer,
    ToolDeadline,
}

impl BackendActor {
    async fn run(mut self) {
        loop {
            let idle_at = self.idle_deadline;
            let tool_at = self.next_tool_deadline();
            let wake = {
                let cmd_rx = &mut self.cmd_rx;
                let inbound_rx = &mut self.inbound_rx;
                let internal_rx = &mut self.internal_rx;
                tokio::select! {
                    command = cmd_rx.recv() => Wake::Command(command),
                    inbound = recv_inbound(inbound_rx) => Wake::Inbound(inbound),
                    internal = internal_rx.recv() => Wake::Internal(internal),
                    _ = sleep_until_or_pending(idle_at) => Wake::IdleTimer,
                    _ = sleep_until_or_pending(tool_at) => Wake::ToolDeadline,
                }
            };

            match wake {
                Wake::Command(Some(command)) => {
                    if self.handle_command(command).await {
                        break;
                    }
                }
                Wake::Command(None) => {
                    // Every handle dropped; clean up and stop.
                    self.handle_dispose().await;
                    break;
                }
                Wake::Inbound(Some(inbound)) => self.handle_inbound(inbound).await,
                Wake::Inbound(None) => {
                    if self.on_child_stream_closed().await {
                        break;
                    }
                }
                Wake::Internal(Some(event)) => self.handle_internal(event),
                Wake::Internal(None) => {}
                Wake::IdleTimer => self.on_idle_timer(),
                Wake::ToolDeadline => self.on_tool_deadline(),
            }
        }
    }

    fn emit(&self, message: AgentMessage) {
        let _ = self.emit_tx.send(message);
    }

    fn prompt_context(&self) -> PromptContext {
        PromptContext {
            tool_call_count_since_prompt: self.tool_call_count_since_prompt,
            recent_prompt_had_change_title: self.recent_prompt_had_change_title,
        }
    }

    fn next_tool_deadline(&self) -> Option<TokioInstant> {
        self.active.values().map(|call| call.deadline).min()
    }

    async fn handle_command(&mut self, command: BackendCommand) -> bool {
        match command {
            BackendCommand::StartSession {
                initial_prompt,
                reply,
            } => {
                let result = self.handle_start_session(initial_prompt).await;
                let _ = reply.send(result);
                false
            }
            BackendCommand::SendPrompt {
                session_id,
                text,
                reply,
            } => {
                let result = self.handle_send_prompt(&session_id, text);
                let _ = reply.send(result);
                false
            }
            BackendCommand::Cancel { session_id, reply } => {
                let result = self.handle_cancel(&session_id).await;
                let _ = reply.send(result);
                false
            }
            BackendCommand::SetMode { mode_id, reply } => {
                let _ = reply.send(self.handle_set_mode(&mode_id).await);
                false
            }
            BackendCommand::SetModel { model_id, reply } => {
                let _ = reply.send(self.handle_set_model(&model_id).await);
                false
            }
            BackendCommand::SetConfigOption {
                config_id,
                value,
                reply,
            } => {
                let _ = reply.send(self.handle_set_config_option(&config_id, &value).await);
                false
            }
            BackendCommand::RespondToPermission { id, approved } => {
                self.emit(AgentMessage::PermissionResponse { id, approved });
                false
            }
            BackendCommand::Dispose { reply } => {
                self.handle_dispose().await;
                let _ = reply.send(());
                true
            }
        }
    }

    async fn handle_start_session(
        &mut self,
        initial_prompt: Option<String>,
    ) -> BackendResult<String> {
        if let Some(session_id) = self.session_id.clone() {
            return Ok(session_id);
        }
        if self.disposed {
            return Err(BackendError::Disposed);
        }

        self.emit(AgentMessage::status(AgentStatus::Starting));

        match self.start_session_inner().await {
            Ok(session_id) => {
                self.emit(AgentMessage::status(AgentStatus::Idle));
                if let Some(text) = initial_prompt {
                    self.handle_send_prompt(&session_id, text)?;
                }
                Ok(session_id)
            }
            Err(error) => {
                self.emit(AgentMessage::status_with_detail(
                    AgentStatus::Error,
                    error.detail_string(),
                ));
                if let BackendError::ChildExited { code, .. } = &error {
                    if let Ok(mut slot) = self.exit_code.lock() {
                        *slot = *code;
                    }
                }
                if let Some(mut child) = self.child.take() {
                    kill_child(&mut child).await;
                }
                self.conn = None;
                self.inbound_rx = None;
                Err(error)
            }
        }
    }

    async fn start_session_inner(&mut self) -> BackendResult<String> {
        let mut child = build_command(&self.config)
            .spawn()
            .map_err(BackendError::Spawn)?;
        debug!(
            command = %self.config.command,
            pid = child.id(),
            "agent process spawned"
        );

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BackendError::Protocol("missing child stdin pipe".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Protocol("missing child stdout pipe".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BackendError::Protocol("missing child stderr pipe".into()))?;

        spawn_stderr_task(
            stderr,
            self.hooks.clone(),
            self.emit_tx.clone(),
            self.stderr_tail.clone(),
        );

        let filter_hooks = self.hooks.clone();
        let (conn, inbound_rx) =
            Connection::new(stdout, stdin, move |line| filter_hooks.filter_stdout_line(line));
        self.child = Some(child);
        self.conn = Some(conn);
        self.inbound_rx = Some(inbound_rx);

        let response = self.handshake().await?;
        let session_id = response
            .get("sessionId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| BackendError::Protocol("session/new response lacks sessionId".into()))?;
        info!(session_id = %session_id, "agent session established");
        self.session_id = Some(session_id.clone());

        self.emit_initial_metadata(&response);
        Ok(session_id)
    }

    async fn handshake(&mut self) -> BackendResult<Value> {
        let init_timeout = self.hooks.init_timeout();
        let mut attempt = 0_u32;
        loop {
            attempt += 1;
            match self.handshake_attempt(init_timeout).await {
                Ok(response) => return Ok(response),
                Err(error) => {
                    if attempt >= HANDSHAKE_ATTEMPTS || !error.is_retryable() {
                        return Err(error);
                    }
                    let backoff = backoff_delay(attempt);
                    warn!(attempt, %error, ?backoff, "agent handshake failed; retrying");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    async fn handshake_attempt(&mut self, init_timeout: Duration) -> BackendResult<Value> {
        let Some(conn) = self.conn.clone() else {
            return Err(BackendError::ConnectionClosed);
        };
        let init_params = json!({
            "protocolVersion": 1,
            "clientInfo": {"name": "ferry", "version": env!("CARGO_PKG_VERSION")},
            "clientCapabilities": {"fs": {"readTextFile": false, "writeTextFile": false}},
        });
        let session_params = json!({
            "cwd": self.config.working_dir,
            "mcpServers": self.config.mcp_servers,
        });
        let stderr_tail = self.stderr_tail.clone();
        let Some(child) = self.child.as_mut() else {
            return Err(BackendError::ConnectionClosed);
        };

        let rpc = async {
            conn.request("initialize", init_params).await?;
            conn.request("session/new", session_params).await
        };
        tokio::select! {
            outcome = tokio::time::timeout(init_timeout, rpc) => match outcome {
                Ok(result) => result,
                Err(_) => Err(BackendError::HandshakeTimeout(init_timeout)),
            },
            // Child death aborts the attempt immediately instead of letting
            // the retry loop wait out its timeout.
            status = child.wait() => {
                let code = status.ok().and_then(|status| status.code());
                let stderr = stderr_tail.lock().map(|tail| tail.clone()).unwrap_or_default();
                Err(BackendError::ChildExited { code, stderr })
            }
        }
    }

    fn emit_initial_metadata(&mut self, response: &Value) {
        if let Some(options) = extract_config_options_from_payload(response) {
            self.config_options_cache = Some(options.clone());
            self.emit(AgentMessage::event(
                events::CONFIG_OPTIONS_UPDATE,
                Value::Array(options),
            ));
        }
        if let Some(modes) = response.get("modes").and_then(extract_mode_state) {
            self.emit(AgentMessage::event(events::MODES_UPDATE, modes));
        }
        if let Some(models) = response.get("models").and_then(extract_model_state) {
            self.emit(AgentMessage::event(events::MODELS_UPDATE, models));
        }
        if let Some(mode_id) = extract_current_mode_id(response) {
            self.emit(AgentMessage::event(
                events::CURRENT_MODE_UPDATE,
                json!({"currentModeId": mode_id}),
            ));
        }
    }

    fn handle_send_prompt(&mut self, session_id: &str, text: String) -> BackendResult<()> {
        let conn = self.require_session(session_id)?;

        self.tool_call_count_since_prompt = 0;
        self.recent_prompt_had_change_title = self
            .config
            .change_title_probe
            .as_ref()
            .map(|probe| probe(&text))
            .unwrap_or(false);
        self.emit(AgentMessage::status(AgentStatus::Running));

        let params = json!({
            "sessionId": session_id,
            "prompt": [{"type": "text", "text": text}],
        });
        let emit = self.emit_tx.clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = conn.request("session/prompt", params).await;
            match &result {
                Ok(response) => {
                    debug!(stop_reason = ?response.get("stopReason"), "prompt turn finished");
                }
                Err(error) => {
                    warn!(%error, "prompt rpc failed");
                    let _ = emit.send(AgentMessage::status_with_detail(
                        AgentStatus::Error,
                        error.detail_string(),
                    ));
                }
            }
            let _ = internal
                .send(InternalEvent::PromptFinished {
                    ok: result.is_ok(),
                })
                .await;
        });
        Ok(())
    }

    async fn handle_cancel(&mut self, session_id: &str) -> BackendResult<()> {
        let conn = self.require_session(session_id)?;
        if let Err(error) = conn
            .notify("session/cancel", json!({"sessionId": session_id}))
            .await
        {
            warn!(%error, "session/cancel failed");
        }
        self.emit(AgentMessage::status(AgentStatus::Stopped));
        Ok(())
    }

    async fn handle_set_mode(&mut self, mode_id: &str) -> bool {
        let Some((conn, session_id)) = self.conn_and_session() else {
            return false;
        };
        let params = json!({"sessionId": session_id, "modeId": mode_id});
        match tokio::time::timeout(SETTER_TIMEOUT, conn.request("session/set_mode", params)).await {
            Ok(Ok(_)) => {
                // Some agents do not echo the switch; synthesize the update
                // so downstream projections observe it either way.
                self.emit(AgentMessage::event(
                    events::CURRENT_MODE_UPDATE,
                    json!({"currentModeId": mode_id}),
                ));
                true
            }
            Ok(Err(error)) => {
                debug!(%error, mode_id, "session/set_mode failed");
                false
            }
            Err(_) => {
                debug!(mode_id, "session/set_mode timed out");
                false
            }
        }
    }

    async fn handle_set_model(&mut self, model_id: &str) -> bool {
        let Some((conn, session_id)) = self.conn_and_session() else {
            return false;
        };
        let params = json!({"sessionId": session_id, "modelId": model_id});
        match tokio::time::timeout(SETTER_TIMEOUT, conn.request("session/set_model", params)).await
        {
            Ok(Ok(_)) => true,
            Ok(Err(error)) => {
                debug!(%error, model_id, "session/set_model failed");
                false
            }
            Err(_) => {
                debug!(model_id, "session/set_model timed out");
                false
            }
        }
    }

    async fn handle_set_config_option(&mut self, config_id: &str, value: &str) -> bool {
        let Some((conn, session_id)) = self.conn_and_session() else {
            return false;
        };
        let params = json!({"sessionId": session_id, "configId": config_id, "value": value});
        let outcome =
            tokio::time::timeout(SETTER_TIMEOUT, conn.request("session/set_config_option", params))
                .await;
        match outcome {
            Ok(Ok(_)) => {
                if let Some(options) = self.config_options_cache.as_mut() {
                    for entry in options.iter_mut() {
                        if entry.get("id").and_then(Value::as_str) == Some(config_id) {
                            entry["currentValue"] = Value::String(value.to_string());
                        }
                    }
                    let snapshot = options.clone();
                    self.emit(AgentMessage::event(
                        events::CONFIG_OPTIONS_UPDATE,
                        Value::Array(snapshot),
                    ));
                }
                true
            }
            Ok(Err(error)) => {
                debug!(%error, config_id, "session/set_config_option failed");
                false
            }
            Err(_) => {
                debug!(config_id, "session/set_config_option timed out");
                false
            }
        }
    }

    async fn handle_dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        if let (Some(conn), Some(session_id)) = (self.conn.as_ref(), self.session_id.as_ref()) {
            let _ = tokio::time::timeout(
                DISPOSE_CANCEL_TIMEOUT,
                conn.notify("session/cancel", json!({"sessionId": session_id})),
            )
            .await;
        }
        if let Some(conn) = self.conn.as_ref() {
            let dropped = conn.dropped_lines();
            if dropped > 0 {
                info!(dropped, "stdout lines dropped by filter during session");
            }
        }

        if let Some(mut child) = self.child.take() {
            if let Some(code) = kill_child(&mut child).await {
                if let Ok(mut slot) = self.exit_code.lock() {
                    slot.get_or_insert(code);
                }
            }
        }

        self.active.clear();
        self.tool_names.clear();
        self.idle_deadline = None;
        self.conn = None;
        self.inbound_rx = None;
    }

    async fn handle_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Notification { method, params } => match method.as_str() {
                "session/update" => self.on_session_update(&params),
                other => debug!(method = other, "ignoring agent notification"),
            },
            Inbound::Request { id, method, params } => match method.as_str() {
                "session/request_permission" => self.on_permission_request(id, params).await,
                other => {
                    warn!(method = other, "rejecting unsupported agent request");
                    if let Some(conn) = self.conn.clone() {
                        let _ = conn.respond_error(id, -32601, "method not supported").await;
                    }
                }
            },
        }
    }

    fn on_session_update(&mut self, params: &Value) {
        let prompt = self.prompt_context();
        let hooks = self.hooks.clone();
        let mut ctx = HandlerCtx {
            hooks: hooks.as_ref(),
            emit: &self.emit_tx,
            active: &mut self.active,
            tool_names: &mut self.tool_names,
            idle_deadline: &mut self.idle_deadline,
            prompt,
        };
        let handled = handlers::dispatch_session_update(&mut ctx, params);
        if let Some(count) = handled.tool_call_count_since_prompt {
            self.tool_call_count_since_prompt = count;
        }
    }

    async fn on_permission_request(&mut self, id: Value, params: Value) {
        let tool_call = params.get("toolCall");
        let call_id = tool_call
            .and_then(|tc| tc.get("id").or_else(|| tc.get("toolCallId")))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Ulid::new().to_string());
        let input = tool_call
            .and_then(|tc| tc.get("rawInput").or_else(|| tc.get("input")))
            .cloned()
            .unwrap_or(Value::Null);
        let tool_name = tool_call
            .and_then(|tc| tc.get("kind").or_else(|| tc.get("toolName")))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| {
                params
                    .get("kind")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| {
                self.hooks
                    .determine_tool_name("other", &call_id, &input, self.prompt_context())
            });
        let options = permission::normalize_options(params.get("options"));

        // The tool-call id doubles as the permission id so the UI's reply is
        // correlatable without an auxiliary map.
        self.emit(AgentMessage::PermissionRequest {
            id: call_id.clone(),
            reason: tool_name.clone(),
            payload: json!({
                "toolName": tool_name.clone(),
                "options": options.clone(),
                "input": input.clone(),
            }),
        });

        let Some(conn) = self.conn.clone() else {
            return;
        };

        match self.permission_handler.clone() {
            Some(handler) => {
                let emit = self.emit_tx.clone();
                tokio::spawn(async move {
                    let decision = match handler.decide(&call_id, &tool_name, &input).await {
                        Ok(decision) => decision,
                        Err(error) => {
                            warn!(%error, "permission handler failed; cancelling");
                            PermissionDecision::Abort
                        }
                    };
                    let option_id = permission::select_option_id(decision, &options);
                    let _ = conn.respond(id, selection_outcome(option_id.as_deref())).await;

                    // Synthetic result so UIs can close their countdown.
                    let status = if decision.is_approval() {
                        "approved"
                    } else {
                        "denied"
                    };
                    let _ = emit.send(AgentMessage::ToolResult {
                        call_id,
                        tool_name,
                        result: json!({"status": status, "decision": decision.as_str()}),
                    });
                });
            }
            None => {
                let option_id = permission::select_option_id(PermissionDecision::Approved, &options);
                let _ = conn.respond(id, selection_outcome(option_id.as_deref())).await;
            }
        }
    }

    async fn on_child_stream_closed(&mut self) -> bool {
        self.inbound_rx = None;
        if self.disposed {
            return false;
        }
        let code = match self.child.as_mut() {
            Some(child) => child.try_wait().ok().flatten().and_then(|status| status.code()),
            None => None,
        };
        if let Ok(mut slot) = self.exit_code.lock() {
            *slot = code;
        }
        let stderr = self
            .stderr_tail
            .lock()
            .map(|tail| tail.clone())
            .unwrap_or_default();
        let error = BackendError::ChildExited { code, stderr };
        warn!(%error, "agent stdout closed");
        self.emit(AgentMessage::status_with_detail(
            AgentStatus::Error,
            error.detail_string(),
        ));
        self.handle_dispose().await;
        true
    }

    fn handle_internal(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::PromptFinished { ok } => {
                // A turn that produced no chunks would otherwise never go
                // idle; arm the timer once the rpc settles.
                if ok && self.active.is_empty() {
                    self.idle_deadline =
                        Some(TokioInstant::now() + self.hooks.idle_timeout());
                }
            }
        }
    }

    fn on_idle_timer(&mut self) {
        self.idle_deadline = None;
        if self.active.is_empty() {
            self.emit(AgentMessage::status(AgentStatus::Idle));
        }
    }

    fn on_tool_deadline(&mut self) {
        let prompt = self.prompt_context();
        let hooks = self.hooks.clone();
        let mut ctx = HandlerCtx {
            hooks: hooks.as_ref(),
            emit: &self.emit_tx,
            active: &mut self.active,
            tool_names: &mut self.tool_names,
            idle_deadline: &mut self.idle_deadline,
            prompt,
        };
        handlers::expire_tool_calls(&mut ctx, TokioInstant::now());
    }

    fn require_session(&self, session_id: &str) -> BackendResult<Connection> {
        if self.session_id.as_deref() != Some(session_id) {
            return Err(BackendError::NoSession);
        }
        self.conn.clone().ok_or(BackendError::ConnectionClosed)
    }

    fn conn_and_session(&self) -> Option<(Connection, String)> {
        Some((self.conn.clone()?, self.session_id.clone()?))
    }
}

fn selection_outcome(option_id: Option<&str>) -> Value {
    match option_id {
        Some(option_id) => json!({"outcome": {"outcome": "selected", "optionId": option_id}}),
        None => json!({"outcome": {"outcome": "cancelled"}}),
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1_u64 << (attempt - 1).min(8)).min(BACKOFF_CLAMP)
}

/// Build the child command.  The environment is inherited verbatim plus the
/// configured extras; Windows resolves script shims through the system
/// command interpreter.
fn build_command(config: &BackendConfig) -> Command {
    #[cfg(windows)]
    let mut cmd = {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(&config.command);
        cmd.args(&config.args);
        cmd
    };
    #[cfg(not(windows))]
    let mut cmd = {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);
        cmd
    };

    cmd.current_dir(&config.working_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // Safety net if the actor dies without running dispose; the explicit
    // SIGTERM/SIGKILL escalation is the primary shutdown path.
    cmd.kill_on_drop(true);

    for (key, value) in &config.env {
        cmd.env(key, value);
    }

    // Own process group so the kill escalation reaches the whole subtree.
    // SAFETY: setsid() is async-signal-safe and runs before exec.
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }

    cmd
}

/// SIGTERM the process group, wait out the grace period, then SIGKILL.
/// Returns the exit code when the child had already exited before us.
async fn kill_child(child: &mut Child) -> Option<i32> {
    if let Ok(Some(status)) = child.try_wait() {
        return status.code();
    }

    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: kill() is async-signal-safe; negative pid targets the group.
        unsafe {
            libc::kill(-(pid as i32), libc::SIGTERM);
        }
        tokio::time::sleep(TERMINATION_GRACE).await;
        if let Ok(Some(_)) = child.try_wait() {
            return None;
        }
        // SAFETY: as above.
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }

    let _ = child.start_kill();
    let _ = child.wait().await;
    None
}

fn spawn_stderr_task(
    stderr: tokio::process::ChildStderr,
    hooks: Arc<dyn TransportHooks>,
    emit: mpsc::UnboundedSender<AgentMessage>,
    tail: Arc<StdMutex<String>>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "ferry::agent_stderr", "{line}");
            if let Ok(mut tail) = tail.lock() {
                tail.push_str(&line);
                tail.push('\n');
                if tail.len() > STDERR_TAIL_MAX {
                    let keep = tail.len() - STDERR_TAIL_MAX;
                    let boundary = (keep..tail.len())
                        .find(|index| tail.is_char_boundary(*index))
                        .unwrap_or(tail.len());
                    tail.drain(..boundary);
                }
            }
            if let Some(message) = hooks.handle_stderr(&line) {
                let _ = emit.send(message);
            }
        }
    });
}

async fn recv_inbound(rx: &mut Option<mpsc::Receiver<Inbound>>) -> Option<Inbound> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_or_pending(deadline: Option<TokioInstant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
