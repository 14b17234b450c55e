//! Relay collaborator contract plus a line-oriented local implementation.
//!
//! The real remote relay transport lives outside this binary; `LocalRelay`
//! gives the runner a usable surface over the parent process stdio:
//! envelopes and metadata go out as ndJSON lines, user prompts come in as
//! plain text or JSON lines, `/abort` and `/kill` map to the control RPCs.

use async_trait::async_trait;
use ferry_core::{SessionEnvelope, SessionMetadata};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{Mutex, mpsc};

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct MessageMeta {
    #[serde(default, rename = "permissionMode")]
    pub permission_mode: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct InboundMessage {
    pub text: String,
    #[serde(default)]
    pub meta: Option<MessageMeta>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayEvent {
    Message(InboundMessage),
    Abort,
    Kill,
}

#[async_trait]
pub trait RelaySession: Send + Sync {
    async fn send_envelope(&self, envelope: &SessionEnvelope) -> anyhow::Result<()>;
    async fn update_metadata(&self, metadata: &SessionMetadata) -> anyhow::Result<()>;
    /// Next inbound user message or control RPC; `None` once the relay is
    /// gone.
    async fn next_event(&self) -> Option<RelayEvent>;
    async fn close(&self);
}

pub struct LocalRelay {
    events: Mutex<mpsc::Receiver<RelayEvent>>,
}

impl LocalRelay {
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(event) = parse_input_line(&line) {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(None) => {
                        let _ = tx.send(RelayEvent::Kill).await;
                        break;
                    }
                    Err(_) => break,
                }
            }
        });
        Self {
            events: Mutex::new(rx),
        }
    }
}

fn parse_input_line(line: &str) -> Option<RelayEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed {
        "/abort" => return Some(RelayEvent::Abort),
        "/kill" | "/quit" => return Some(RelayEvent::Kill),
        _ => {}
    }
    if trimmed.starts_with('{') {
        if let Ok(message) = serde_json::from_str::<InboundMessage>(trimmed) {
            return Some(RelayEvent::Message(message));
        }
    }
    Some(RelayEvent::Message(InboundMessage {
        text: trimmed.to_string(),
        meta: None,
    }))
}

#[async_trait]
impl RelaySession for LocalRelay {
    async fn send_envelope(&self, envelope: &SessionEnvelope) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string(envelope)?);
        Ok(())
    }

    async fn update_metadata(&self, metadata: &SessionMetadata) -> anyhow::Result<()> {
        let line = serde_json::json!({"type": "metadata", "metadata": metadata});
        println!("{line}");
        Ok(())
    }

    async fn next_event(&self) -> Option<RelayEvent> {
        self.events.lock().await.recv().await
    }

    async fn close(&self) {}
}
