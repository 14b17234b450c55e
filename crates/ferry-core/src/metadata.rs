//! Canonical projection of the agent's overlapping capability surfaces.
//!
//! ACP advertises models and operating modes through up to three shapes at
//! once: the newer `configOptions` list, the legacy `modes` state and the
//! legacy `models` state.  Callers accumulate the latest of each shape in a
//! [`CapabilitySnapshot`] and project the whole snapshot with
//! [`merge_capability_snapshot`]; the canonical [`SessionMetadata`] record is
//! the only shape stored or shipped downstream.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One selectable entry of a metadata category.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataOption {
    pub code: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Canonical snapshot of agent capabilities shipped to the relay.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<MetadataOption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_model_code: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operating_modes: Vec<MetadataOption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_operating_mode_code: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub thought_levels: Vec<MetadataOption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_thought_level_code: Option<String>,
}

impl SessionMetadata {
    /// Look up an option by code within a category list.
    pub fn find_option<'a>(
        options: &'a [MetadataOption],
        code: &str,
    ) -> Option<&'a MetadataOption> {
        options.iter().find(|option| option.code == code)
    }
}

/// Accumulated capability state, one field per ACP source shape.
///
/// Updated in place as `config_options_update` / `modes_update` /
/// `models_update` / `current_mode_update` events arrive.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CapabilitySnapshot {
    pub config_options: Option<Vec<Value>>,
    pub modes: Option<Value>,
    pub models: Option<Value>,
    pub current_mode_id: Option<String>,
}

struct SelectGroup {
    options: Vec<MetadataOption>,
    current: Option<String>,
}

/// Collect the flattened `select` options of one category across all
/// `configOptions` entries.  Grouped entries contribute their nested
/// `options[].options`; flat entries contribute `options` directly.
fn select_group(config_options: &[Value], category: &str) -> Option<SelectGroup> {
    let mut options = Vec::new();
    let mut current = None;
    let mut found = false;

    for entry in config_options {
        if entry.get("type").and_then(Value::as_str) != Some("select") {
            continue;
        }
        if entry.get("category").and_then(Value::as_str) != Some(category) {
            continue;
        }
        found = true;
        if let Some(raw_options) = entry.get("options").and_then(Value::as_array) {
            for raw_option in raw_options {
                if let Some(nested) = raw_option.get("options").and_then(Value::as_array) {
                    options.extend(nested.iter().filter_map(option_from_config_value));
                } else if let Some(option) = option_from_config_value(raw_option) {
                    options.push(option);
                }
            }
        }
        if current.is_none() {
            current = entry
                .get("currentValue")
                .and_then(Value::as_str)
                .map(str::to_string);
        }
    }

    found.then_some(SelectGroup { options, current })
}

fn option_from_config_value(raw: &Value) -> Option<MetadataOption> {
    let code = raw.get("value").and_then(Value::as_str)?.to_string();
    let value = raw
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or(&code)
        .to_string();
    Some(MetadataOption {
        code,
        value,
        description: raw
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

fn legacy_mode_option(raw: &Value) -> Option<MetadataOption> {
    let code = raw.get("id").and_then(Value::as_str)?.to_string();
    let value = raw
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or(&code)
        .to_string();
    Some(MetadataOption {
        code,
        value,
        description: raw
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

fn legacy_model_option(raw: &Value) -> Option<MetadataOption> {
    let code = raw.get("modelId").and_then(Value::as_str)?.to_string();
    let value = raw
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or(&code)
        .to_string();
    Some(MetadataOption {
        code,
        value,
        description: None,
    })
}

/// Project a capability snapshot into canonical metadata.
///
/// Rules, in order:
/// 1. `configOptions` entries with `type == "select"` and a known category
///    win over the legacy shape of the same category.
/// 2. `mode` falls back to legacy `modes.availableModes` + `currentModeId`,
///    `model` falls back to legacy `models.availableModels` +
///    `currentModelId`; `thought_level` has no legacy fallback.
/// 3. A category absent from both sources is deleted from the result.
/// 4. A bare `currentModeId` on the snapshot overrides the current operating
///    mode last.
///
/// Projecting the same snapshot twice is a fixed point.
pub fn merge_capability_snapshot(
    _prev: SessionMetadata,
    snapshot: &CapabilitySnapshot,
) -> SessionMetadata {
    let config_options = snapshot.config_options.as_deref();
    let mut next = SessionMetadata::default();

    match config_options.and_then(|options| select_group(options, "mode")) {
        Some(group) => {
            next.operating_modes = group.options;
            next.current_operating_mode_code = group.current;
        }
        None => {
            if let Some(modes) = snapshot.modes.as_ref() {
                next.operating_modes = modes
                    .get("availableModes")
                    .and_then(Value::as_array)
                    .map(|raw| raw.iter().filter_map(legacy_mode_option).collect())
                    .unwrap_or_default();
                next.current_operating_mode_code = modes
                    .get("currentModeId")
                    .and_then(Value::as_str)
                    .map(str::to_string);
            }
        }
    }

    match config_options.and_then(|options| select_group(options, "model")) {
        Some(group) => {
            next.models = group.options;
            next.current_model_code = group.current;
        }
        None => {
            if let Some(models) = snapshot.models.as_ref() {
                next.models = models
                    .get("availableModels")
                    .and_then(Value::as_array)
                    .map(|raw| raw.iter().filter_map(legacy_model_option).collect())
                    .unwrap_or_default();
                next.current_model_code = models
                    .get("currentModelId")
                    .and_then(Value::as_str)
                    .map(str::to_string);
            }
        }
    }

    if let Some(group) = config_options.and_then(|options| select_group(options, "thought_level")) {
        next.thought_levels = group.options;
        next.current_thought_level_code = group.current;
    }

    if let Some(current) = snapshot.current_mode_id.clone() {
        next.current_operating_mode_code = Some(current);
    }

    next
}

/// Accept either a bare array or `{configOptions: [...]}`.
pub fn extract_config_options_from_payload(payload: &Value) -> Option<Vec<Value>> {
    match payload {
        Value::Array(items) => Some(items.clone()),
        Value::Object(map) => map
            .get("configOptions")
            .and_then(Value::as_array)
            .cloned(),
        _ => None,
    }
}

/// Validate and return a legacy mode state (`availableModes` required).
pub fn extract_mode_state(payload: &Value) -> Option<Value> {
    payload
        .get("availableModes")
        .and_then(Value::as_array)
        .map(|_| payload.clone())
}

/// Validate and return a legacy model state (`availableModels` required).
pub fn extract_model_state(payload: &Value) -> Option<Value> {
    payload
        .get("availableModels")
        .and_then(Value::as_array)
        .map(|_| payload.clone())
}

/// Pull the current mode id out of a `current_mode_update` payload.
pub fn extract_current_mode_id(payload: &Value) -> Option<String> {
    payload
        .get("currentModeId")
        .or_else(|| payload.get("modeId"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot_with_config(options: Value) -> CapabilitySnapshot {
        CapabilitySnapshot {
            config_options: options.as_array().cloned(),
            ..CapabilitySnapshot::default()
        }
    }

    #[test]
    fn test_merge_config_options_mode_and_model() {
        let snapshot = snapshot_with_config(json!([
            {
                "type": "select",
                "category": "mode",
                "currentValue": "code",
                "options": [
                    {"value": "ask", "name": "Ask"},
                    {"value": "code", "name": "Code", "description": "Edit files"}
                ]
            },
            {
                "type": "select",
                "category": "model",
                "currentValue": "opus",
                "options": [
                    {"value": "sonnet", "name": "Sonnet"},
                    {"value": "opus", "name": "Opus"}
                ]
            }
        ]));

        let metadata = merge_capability_snapshot(SessionMetadata::default(), &snapshot);

        assert_eq!(
            metadata
                .operating_modes
                .iter()
                .map(|o| o.code.as_str())
                .collect::<Vec<_>>(),
            vec!["ask", "code"]
        );
        assert_eq!(metadata.current_operating_mode_code.as_deref(), Some("code"));
        assert_eq!(
            metadata
                .models
                .iter()
                .map(|o| o.code.as_str())
                .collect::<Vec<_>>(),
            vec!["sonnet", "opus"]
        );
        assert_eq!(metadata.current_model_code.as_deref(), Some("opus"));
        assert_eq!(
            metadata.operating_modes[1].description.as_deref(),
            Some("Edit files")
        );
    }

    #[test]
    fn test_config_options_win_over_legacy_modes() {
        let mut snapshot = snapshot_with_config(json!([
            {
                "type": "select",
                "category": "mode",
                "currentValue": "code",
                "options": [{"value": "code", "name": "Code"}]
            }
        ]));
        snapshot.modes = Some(json!({
            "availableModes": [{"id": "ask", "name": "Ask"}],
            "currentModeId": "ask"
        }));

        let metadata = merge_capability_snapshot(SessionMetadata::default(), &snapshot);

        assert_eq!(
            metadata
                .operating_modes
                .iter()
                .map(|o| o.code.as_str())
                .collect::<Vec<_>>(),
            vec!["code"]
        );
        assert_eq!(metadata.current_operating_mode_code.as_deref(), Some("code"));
    }

    #[test]
    fn test_legacy_fallbacks_apply_without_config_options() {
        let snapshot = CapabilitySnapshot {
            modes: Some(json!({
                "availableModes": [
                    {"id": "ask", "name": "Ask", "description": "Read only"},
                    {"id": "code", "name": "Code"}
                ],
                "currentModeId": "ask"
            })),
            models: Some(json!({
                "availableModels": [{"modelId": "gemini-2.5-pro", "name": "Gemini 2.5 Pro"}],
                "currentModelId": "gemini-2.5-pro"
            })),
            ..CapabilitySnapshot::default()
        };

        let metadata = merge_capability_snapshot(SessionMetadata::default(), &snapshot);

        assert_eq!(metadata.operating_modes.len(), 2);
        assert_eq!(
            metadata.operating_modes[0].description.as_deref(),
            Some("Read only")
        );
        assert_eq!(metadata.current_operating_mode_code.as_deref(), Some("ask"));
        assert_eq!(metadata.models[0].code, "gemini-2.5-pro");
        assert_eq!(metadata.models[0].value, "Gemini 2.5 Pro");
        assert_eq!(
            metadata.current_model_code.as_deref(),
            Some("gemini-2.5-pro")
        );
    }

    #[test]
    fn test_grouped_options_are_flattened() {
        let snapshot = snapshot_with_config(json!([
            {
                "type": "select",
                "category": "model",
                "currentValue": "o3",
                "options": [
                    {
                        "name": "OpenAI",
                        "options": [
                            {"value": "o3", "name": "o3"},
                            {"value": "o4-mini", "name": "o4 mini"}
                        ]
                    },
                    {"value": "local", "name": "Local"}
                ]
            }
        ]));

        let metadata = merge_capability_snapshot(SessionMetadata::default(), &snapshot);

        assert_eq!(
            metadata
                .models
                .iter()
                .map(|o| o.code.as_str())
                .collect::<Vec<_>>(),
            vec!["o3", "o4-mini", "local"]
        );
    }

    #[test]
    fn test_non_select_and_unknown_categories_are_ignored() {
        let snapshot = snapshot_with_config(json!([
            {"type": "toggle", "category": "mode", "options": [{"value": "x"}]},
            {
                "type": "select",
                "category": "verbosity",
                "options": [{"value": "high"}]
            },
            {
                "type": "select",
                "category": "thought_level",
                "currentValue": "deep",
                "options": [{"value": "shallow"}, {"value": "deep"}]
            }
        ]));

        let metadata = merge_capability_snapshot(SessionMetadata::default(), &snapshot);

        assert!(metadata.operating_modes.is_empty());
        assert!(metadata.models.is_empty());
        assert_eq!(
            metadata
                .thought_levels
                .iter()
                .map(|o| o.code.as_str())
                .collect::<Vec<_>>(),
            vec!["shallow", "deep"]
        );
        assert_eq!(metadata.current_thought_level_code.as_deref(), Some("deep"));
    }

    #[test]
    fn test_absent_categories_are_deleted() {
        let prev = SessionMetadata {
            thought_levels: vec![MetadataOption {
                code: "deep".into(),
                value: "Deep".into(),
                description: None,
            }],
            current_thought_level_code: Some("deep".into()),
            ..SessionMetadata::default()
        };
        let snapshot = snapshot_with_config(json!([
            {
                "type": "select",
                "category": "mode",
                "currentValue": "ask",
                "options": [{"value": "ask", "name": "Ask"}]
            }
        ]));

        let metadata = merge_capability_snapshot(prev, &snapshot);

        assert!(metadata.thought_levels.is_empty());
        assert!(metadata.current_thought_level_code.is_none());
        assert!(metadata.models.is_empty());
    }

    #[test]
    fn test_bare_current_mode_id_overrides_last() {
        let mut snapshot = snapshot_with_config(json!([
            {
                "type": "select",
                "category": "mode",
                "currentValue": "code",
                "options": [
                    {"value": "ask", "name": "Ask"},
                    {"value": "code", "name": "Code"}
                ]
            }
        ]));
        snapshot.current_mode_id = Some("ask".into());

        let metadata = merge_capability_snapshot(SessionMetadata::default(), &snapshot);

        assert_eq!(metadata.current_operating_mode_code.as_deref(), Some("ask"));
    }

    #[test]
    fn test_merge_twice_is_fixed_point() {
        let mut snapshot = snapshot_with_config(json!([
            {
                "type": "select",
                "category": "model",
                "currentValue": "opus",
                "options": [{"value": "sonnet"}, {"value": "opus"}]
            }
        ]));
        snapshot.modes = Some(json!({
            "availableModes": [{"id": "ask", "name": "Ask"}],
            "currentModeId": "ask"
        }));

        let once = merge_capability_snapshot(SessionMetadata::default(), &snapshot);
        let twice = merge_capability_snapshot(once.clone(), &snapshot);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_extract_config_options_from_array_and_wrapper() {
        let bare = json!([{"type": "select"}]);
        let wrapped = json!({"configOptions": [{"type": "select"}]});
        let invalid = json!("nope");

        assert_eq!(
            extract_config_options_from_payload(&bare).map(|v| v.len()),
            Some(1)
        );
        assert_eq!(
            extract_config_options_from_payload(&wrapped).map(|v| v.len()),
            Some(1)
        );
        assert!(extract_config_options_from_payload(&invalid).is_none());
    }

    #[test]
    fn test_state_extractors_validate_required_fields() {
        assert!(extract_mode_state(&json!({"availableModes": []})).is_some());
        assert!(extract_mode_state(&json!({"modes": []})).is_none());
        assert!(extract_model_state(&json!({"availableModels": []})).is_some());
        assert!(extract_model_state(&json!({"availableModes": []})).is_none());
        assert_eq!(
            extract_current_mode_id(&json!({"currentModeId": "plan"})).as_deref(),
            Some("plan")
        );
        assert_eq!(
            extract_current_mode_id(&json!({"modeId": "ask"})).as_deref(),
            Some("ask")
        );
        assert!(extract_current_mode_id(&json!({})).is_none());
    }
}
