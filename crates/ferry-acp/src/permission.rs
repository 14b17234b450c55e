//! Permission collaborator contract and option selection.
//!
//! ACP permission requests are synchronous: the reply must go back inside
//! the `session/request_permission` RPC.  The handler is therefore modelled
//! as an awaited collaborator whose decision is mapped onto one of the
//! option ids the agent advertised.

use async_trait::async_trait;
use serde_json::Value;

/// Decision returned by a permission collaborator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PermissionDecision {
    Approved,
    ApprovedForSession,
    Denied,
    Abort,
}

impl PermissionDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::ApprovedForSession => "approved_for_session",
            Self::Denied => "denied",
            Self::Abort => "abort",
        }
    }

    pub fn is_approval(&self) -> bool {
        matches!(self, Self::Approved | Self::ApprovedForSession)
    }
}

#[async_trait]
pub trait PermissionHandler: Send + Sync {
    /// Decide on a pending tool permission.  Must be resolvable from outside
    /// the backend's reactor; the RPC reply waits on it.
    async fn decide(
        &self,
        tool_call_id: &str,
        tool_name: &str,
        input: &Value,
    ) -> anyhow::Result<PermissionDecision>;
}

fn option_id(option: &Value) -> Option<&str> {
    option
        .get("optionId")
        .or_else(|| option.get("id"))
        .and_then(Value::as_str)
}

fn option_name(option: &Value) -> &str {
    option.get("name").and_then(Value::as_str).unwrap_or("")
}

fn find_by_id<'a>(options: &'a [Value], wanted: &str) -> Option<&'a Value> {
    options.iter().find(|option| option_id(option) == Some(wanted))
}

fn find_by_keyword<'a>(options: &'a [Value], keyword: &str) -> Option<&'a Value> {
    options.iter().find(|option| {
        option_id(option)
            .map(|id| id.to_ascii_lowercase().contains(keyword))
            .unwrap_or(false)
            || option_name(option).to_ascii_lowercase().contains(keyword)
    })
}

/// Map a decision onto one of the advertised option ids.
///
/// `None` means no option fits and the RPC should report a cancelled
/// outcome instead of a selection.
pub fn select_option_id(decision: PermissionDecision, options: &[Value]) -> Option<String> {
    let chosen = match decision {
        PermissionDecision::Approved => find_by_id(options, "proceed_once")
            .or_else(|| find_by_keyword(options, "once"))
            .or_else(|| options.first()),
        PermissionDecision::ApprovedForSession => find_by_id(options, "proceed_always")
            .or_else(|| find_by_keyword(options, "always"))
            .or_else(|| find_by_id(options, "proceed_once"))
            .or_else(|| options.first()),
        PermissionDecision::Denied | PermissionDecision::Abort => {
            find_by_id(options, "cancel").or_else(|| find_by_keyword(options, "cancel"))
        }
    };
    chosen.and_then(option_id).map(str::to_string)
}

/// Normalize heterogeneous option shapes to `{optionId, name, kind?}`.
pub fn normalize_options(raw: Option<&Value>) -> Vec<Value> {
    let Some(Value::Array(options)) = raw else {
        return Vec::new();
    };
    options
        .iter()
        .filter_map(|option| {
            let id = option_id(option)?;
            let mut normalized = serde_json::Map::new();
            normalized.insert("optionId".into(), Value::String(id.to_string()));
            let name = option_name(option);
            normalized.insert(
                "name".into(),
                Value::String(if name.is_empty() { id.to_string() } else { name.to_string() }),
            );
            if let Some(kind) = option.get("kind") {
                normalized.insert("kind".into(), kind.clone());
            }
            Some(Value::Object(normalized))
        })
        .collect()
}
