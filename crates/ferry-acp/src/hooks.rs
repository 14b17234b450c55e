//! Per-agent transport tuning.
//!
//! Vendor quirks (noisy stdout, slow startup, long-running research tools)
//! are absorbed here instead of leaking into the backend.  Every hook has a
//! default, so `DefaultTransport` works for a well-behaved agent out of the
//! box.

use std::time::Duration;

use ferry_core::AgentMessage;
use serde_json::Value;

use crate::framing::LineDisposition;

/// Per-prompt flags handed to [`TransportHooks::determine_tool_name`].
#[derive(Clone, Copy, Debug, Default)]
pub struct PromptContext {
    pub tool_call_count_since_prompt: u32,
    pub recent_prompt_had_change_title: bool,
}

/// Multiplier applied to [`TransportHooks::tool_call_timeout`] for tools the
/// transport marks as investigation tools.
pub const INVESTIGATION_TIMEOUT_FACTOR: u32 = 5;

pub trait TransportHooks: Send + Sync {
    /// Timeout for `initialize` / `session/new`.
    fn init_timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    /// Quiet interval after the last text chunk before `idle` is emitted.
    fn idle_timeout(&self) -> Duration {
        Duration::from_millis(500)
    }

    /// Max lifetime of a tool call before it is dropped from tracking.
    fn tool_call_timeout(&self, _id: &str, _kind: &str) -> Duration {
        Duration::from_secs(120)
    }

    /// Investigation tools get [`INVESTIGATION_TIMEOUT_FACTOR`]x the timeout
    /// and minute-granularity duration logging.
    fn is_investigation_tool(&self, _id: &str, _kind: &str) -> bool {
        false
    }

    /// Override an unreliable `kind` by parsing the tool-call id.
    fn extract_tool_name_from_id(&self, _id: &str) -> Option<String> {
        None
    }

    /// Resolve generic kinds (`other`, `Unknown`) into a concrete tool name.
    fn determine_tool_name(
        &self,
        kind: &str,
        _id: &str,
        _input: &Value,
        _ctx: PromptContext,
    ) -> String {
        kind.to_string()
    }

    /// Inspect one raw stdout line before JSON parsing.
    fn filter_stdout_line(&self, _line: &str) -> LineDisposition {
        LineDisposition::Forward
    }

    /// Optionally synthesize an agent-message from a stderr line.
    fn handle_stderr(&self, _text: &str) -> Option<AgentMessage> {
        None
    }
}

/// All-defaults transport for agents that speak clean ACP.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultTransport;

impl TransportHooks for DefaultTransport {}
