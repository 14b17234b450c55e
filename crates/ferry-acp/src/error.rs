use std::time::Duration;

use serde_json::{Value, json};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("agent spawn failed: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("agent connection closed")]
    ConnectionClosed,
    #[error("agent handshake timed out after {}s", .0.as_secs())]
    HandshakeTimeout(Duration),
    #[error("agent process exited: code {code:?}{}", format_stderr_tail(stderr))]
    ChildExited { code: Option<i32>, stderr: String },
    #[error("agent rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("no active session")]
    NoSession,
    #[error("backend disposed")]
    Disposed,
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// Whether a handshake attempt that failed this way is worth retrying.
    ///
    /// Spawn/environment failures and child exits are final; so is a closed
    /// connection (the child is gone).  Timeouts and transient rpc errors
    /// get another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::HandshakeTimeout(_) | Self::Rpc { .. } | Self::Protocol(_) => true,
            Self::Spawn(_)
            | Self::ChildExited { .. }
            | Self::ConnectionClosed
            | Self::NoSession
            | Self::Disposed => false,
            Self::Io(err) => !matches!(
                err.kind(),
                std::io::ErrorKind::NotFound
                    | std::io::ErrorKind::PermissionDenied
                    | std::io::ErrorKind::BrokenPipe
            ),
        }
    }

    /// Structured detail for `status=error` emissions: `{code, message}` when
    /// the failure carries an rpc code, plain `{message}` otherwise.
    pub fn structured_detail(&self) -> Value {
        match self {
            Self::Rpc { code, message } => json!({"code": code, "message": message}),
            other => json!({"message": other.to_string()}),
        }
    }

    pub fn detail_string(&self) -> String {
        self.structured_detail().to_string()
    }
}

/// Format captured stderr for inclusion in `ChildExited` display.
///
/// Returns last 10 lines prefixed with `"; stderr:\n..."` or empty if no
/// stderr was captured.
fn format_stderr_tail(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        let last_lines: String = trimmed
            .lines()
            .rev()
            .take(10)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join("\n");
        format!("; stderr:\n{last_lines}")
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;
