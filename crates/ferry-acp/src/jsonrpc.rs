//! Bidirectional JSON-RPC 2.0 over framed ndJSON.
//!
//! One writer task owns the child's stdin; one reader task owns stdout and
//! routes frames three ways: responses resolve the pending-request map,
//! server-bound requests and notifications land on the inbound channel for
//! the backend to serve.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{BackendError, BackendResult};
use crate::framing::{LineDisposition, LineReader};

const INBOUND_CAPACITY: usize = 256;
const WRITER_CAPACITY: usize = 64;

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// Traffic initiated by the agent.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>>>;

#[derive(Clone)]
pub struct Connection {
    writer_tx: mpsc::Sender<String>,
    pending: Pending,
    next_id: Arc<AtomicU64>,
    dropped_lines: Arc<AtomicU64>,
}

impl Connection {
    /// Attach a connection to a framed byte stream pair.
    ///
    /// `filter` sees every complete stdout line before JSON parsing.
    pub fn new<R, W, F>(reader: R, writer: W, filter: F) -> (Self, mpsc::Receiver<Inbound>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
        F: Fn(&str) -> LineDisposition + Send + 'static,
    {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let dropped_lines = Arc::new(AtomicU64::new(0));
        let (writer_tx, writer_rx) = mpsc::channel(WRITER_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);

        tokio::spawn(write_loop(writer, writer_rx, pending.clone()));
        tokio::spawn(read_loop(
            reader,
            filter,
            pending.clone(),
            inbound_tx,
            dropped_lines.clone(),
        ));

        (
            Self {
                writer_tx,
                pending,
                next_id: Arc::new(AtomicU64::new(1)),
                dropped_lines,
            },
            inbound_rx,
        )
    }

    /// Issue a request and await the agent's reply.
    pub async fn request(&self, method: &str, params: Value) -> BackendResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let frame =
            json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}).to_string();
        if self.writer_tx.send(frame).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(BackendError::ConnectionClosed);
        }

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(error)) => Err(BackendError::Rpc {
                code: error.code,
                message: error.message,
            }),
            Err(_) => Err(BackendError::ConnectionClosed),
        }
    }

    /// Fire a notification (no reply expected).
    pub async fn notify(&self, method: &str, params: Value) -> BackendResult<()> {
        let frame = json!({"jsonrpc": "2.0", "method": method, "params": params}).to_string();
        self.writer_tx
            .send(frame)
            .await
            .map_err(|_| BackendError::ConnectionClosed)
    }

    /// Reply to a request the agent sent us.
    pub async fn respond(&self, id: Value, result: Value) -> BackendResult<()> {
        let frame = json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string();
        self.writer_tx
            .send(frame)
            .await
            .map_err(|_| BackendError::ConnectionClosed)
    }

    /// Reply to an agent request with an error.
    pub async fn respond_error(&self, id: Value, code: i64, message: &str) -> BackendResult<()> {
        let frame =
            json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
                .to_string();
        self.writer_tx
            .send(frame)
            .await
            .map_err(|_| BackendError::ConnectionClosed)
    }

    /// Lines removed by the stdout filter or rejected as non-JSON noise.
    pub fn dropped_lines(&self) -> u64 {
        self.dropped_lines.load(Ordering::Relaxed)
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut rx: mpsc::Receiver<String>,
    pending: Pending,
) {
    while let Some(line) = rx.recv().await {
        let result = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;
        if let Err(error) = result {
            warn!(%error, "agent stdin write failed");
            break;
        }
    }
    // Writers gone: callers awaiting a reply must fail, not hang.
    pending.lock().await.clear();
}

async fn read_loop<R, F>(
    reader: R,
    filter: F,
    pending: Pending,
    inbound_tx: mpsc::Sender<Inbound>,
    dropped: Arc<AtomicU64>,
) where
    R: AsyncRead + Unpin,
    F: Fn(&str) -> LineDisposition,
{
    let mut lines = LineReader::new(reader);
    loop {
        let raw = match lines.next_line().await {
            Ok(Some(raw)) => raw,
            Ok(None) => break,
            Err(error) => {
                warn!(%error, "agent stdout read failed");
                break;
            }
        };

        let line = match filter(&raw) {
            LineDisposition::Forward => raw,
            LineDisposition::Drop => {
                dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            LineDisposition::Replace(replacement) => replacement,
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let frame: Value = match serde_json::from_str(trimmed) {
            Ok(value) => value,
            Err(_) => {
                dropped.fetch_add(1, Ordering::Relaxed);
                debug!(line = %truncate(trimmed, 200), "dropping non-JSON stdout line");
                continue;
            }
        };

        dispatch_frame(frame, &pending, &inbound_tx).await;
    }

    // EOF: fail every outstanding request immediately rather than letting
    // callers wait out their timeouts.
    pending.lock().await.clear();
}

async fn dispatch_frame(frame: Value, pending: &Pending, inbound_tx: &mpsc::Sender<Inbound>) {
    if let Some(method) = frame.get("method").and_then(Value::as_str) {
        let method = method.to_string();
        let params = frame.get("params").cloned().unwrap_or(Value::Null);
        let inbound = match frame.get("id") {
            Some(id) if !id.is_null() => Inbound::Request {
                id: id.clone(),
                method,
                params,
            },
            _ => Inbound::Notification { method, params },
        };
        if inbound_tx.send(inbound).await.is_err() {
            debug!("inbound channel closed; dropping agent frame");
        }
        return;
    }

    if let Some(id) = frame.get("id").and_then(Value::as_u64) {
        let responder = pending.lock().await.remove(&id);
        let Some(responder) = responder else {
            debug!(id, "response for unknown request id");
            return;
        };
        let reply = match frame.get("error") {
            Some(error) => Err(serde_json::from_value(error.clone()).unwrap_or(RpcError {
                code: -32603,
                message: error.to_string(),
                data: None,
            })),
            None => Ok(frame.get("result").cloned().unwrap_or(Value::Null)),
        };
        let _ = responder.send(reply);
        return;
    }

    debug!("agent frame is neither request, notification nor response");
}

fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn forward(_line: &str) -> LineDisposition {
        LineDisposition::Forward
    }

    #[tokio::test]
    async fn test_request_resolves_on_response() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client);
        let (conn, _inbound) = Connection::new(client_read, client_write, forward);

        let (server_read, mut server_write) = tokio::io::split(server);
        let server_task = tokio::spawn(async move {
            let mut lines = BufReader::new(server_read).lines();
            let line = lines.next_line().await.expect("read").expect("line");
            let frame: Value = serde_json::from_str(&line).expect("json");
            assert_eq!(frame["method"], "initialize");
            let id = frame["id"].clone();
            let reply = json!({"jsonrpc": "2.0", "id": id, "result": {"protocolVersion": 1}});
            server_write
                .write_all(format!("{reply}\n").as_bytes())
                .await
                .expect("write");
        });

        let result = conn
            .request("initialize", json!({"protocolVersion": 1}))
            .await
            .expect("rpc");
        assert_eq!(result["protocolVersion"], 1);
        server_task.await.expect("server");
    }

    #[tokio::test]
    async fn test_error_response_maps_to_rpc_error() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client);
        let (conn, _inbound) = Connection::new(client_read, client_write, forward);

        let (server_read, mut server_write) = tokio::io::split(server);
        tokio::spawn(async move {
            let mut lines = BufReader::new(server_read).lines();
            let line = lines.next_line().await.expect("read").expect("line");
            let frame: Value = serde_json::from_str(&line).expect("json");
            let reply = json!({
                "jsonrpc": "2.0",
                "id": frame["id"],
                "error": {"code": -32601, "message": "method not found"}
            });
            server_write
                .write_all(format!("{reply}\n").as_bytes())
                .await
                .expect("write");
        });

        let err = conn
            .request("session/set_model", json!({}))
            .await
            .expect_err("should fail");
        match err {
            BackendError::Rpc { code, message } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "method not found");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_inbound_notification_and_request_dispatch() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client);
        let (conn, mut inbound) = Connection::new(client_read, client_write, forward);

        let (server_read, mut server_write) = tokio::io::split(server);
        let notification = json!({
            "jsonrpc": "2.0",
            "method": "session/update",
            "params": {"sessionId": "s1", "update": {"sessionUpdate": "plan"}}
        });
        let request = json!({
            "jsonrpc": "2.0",
            "id": 9,
            "method": "session/request_permission",
            "params": {"options": []}
        });
        server_write
            .write_all(format!("{notification}\n{request}\n").as_bytes())
            .await
            .expect("write");

        match inbound.recv().await.expect("notification") {
            Inbound::Notification { method, params } => {
                assert_eq!(method, "session/update");
                assert_eq!(params["sessionId"], "s1");
            }
            other => panic!("unexpected inbound: {other:?}"),
        }
        let id = match inbound.recv().await.expect("request") {
            Inbound::Request { id, method, .. } => {
                assert_eq!(method, "session/request_permission");
                id
            }
            other => panic!("unexpected inbound: {other:?}"),
        };

        conn.respond(id, json!({"outcome": {"outcome": "cancelled"}}))
            .await
            .expect("respond");
        let mut lines = BufReader::new(server_read).lines();
        let line = lines.next_line().await.expect("read").expect("line");
        let frame: Value = serde_json::from_str(&line).expect("json");
        assert_eq!(frame["id"], 9);
        assert_eq!(frame["result"]["outcome"]["outcome"], "cancelled");
    }

    #[tokio::test]
    async fn test_filter_and_noise_are_counted() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client);
        let (conn, mut inbound) = Connection::new(client_read, client_write, |line: &str| {
            if line.starts_with("LOG ") {
                LineDisposition::Drop
            } else if let Some(rest) = line.strip_prefix("WRAP ") {
                LineDisposition::Replace(rest.to_string())
            } else {
                LineDisposition::Forward
            }
        });

        let (_server_read, mut server_write) = tokio::io::split(server);
        server_write
            .write_all(
                b"LOG starting up\n\
                  plain banner text\n\
                  WRAP {\"jsonrpc\":\"2.0\",\"method\":\"session/update\",\"params\":{}}\n",
            )
            .await
            .expect("write");
        server_write.shutdown().await.expect("shutdown");
        drop(server_write);

        match inbound.recv().await.expect("wrapped frame") {
            Inbound::Notification { method, .. } => assert_eq!(method, "session/update"),
            other => panic!("unexpected inbound: {other:?}"),
        }
        assert!(inbound.recv().await.is_none(), "stream closed");
        // One filtered log line plus one non-JSON banner.
        assert_eq!(conn.dropped_lines(), 2);
    }

    #[tokio::test]
    async fn test_eof_fails_outstanding_requests() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client);
        let (conn, _inbound) = Connection::new(client_read, client_write, forward);

        drop(server);
        let err = conn
            .request("initialize", json!({}))
            .await
            .expect_err("must fail");
        assert!(matches!(err, BackendError::ConnectionClosed));
    }
}
