//! Helpers for working with loosely-typed JSON records.
//!
//! Static records, patches and metadata fragments arrive as free-form JSON.
//! These helpers implement the merge rules shared by the merge engine, the
//! storyline resolver and the pacing tower.

use serde_json::{Map, Value};

/// Returns true for values that carry no information: null, empty strings
/// (after trimming), empty arrays and empty objects.
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Find the first non-empty value across a list of fragments, trying each
/// aliased key in order within every fragment.
pub fn first_non_empty<'a>(fragments: &[&'a Value], aliases: &[&str]) -> Option<&'a Value> {
    fragments.iter().find_map(|fragment| {
        aliases
            .iter()
            .filter_map(|key| fragment.get(*key))
            .find(|v| !is_empty_value(v))
    })
}

/// Like [`first_non_empty`] but only accepts string values.
pub fn first_non_empty_str<'a>(fragments: &[&'a Value], aliases: &[&str]) -> Option<&'a str> {
    fragments.iter().find_map(|fragment| {
        aliases
            .iter()
            .filter_map(|key| fragment.get(*key).and_then(Value::as_str))
            .find(|s| !s.trim().is_empty())
    })
}

/// Detect the legacy `{"operation": "append", "values": [...]}` wrapper.
pub fn legacy_append_values(value: &Value) -> Option<&Vec<Value>> {
    let obj = value.as_object()?;
    if obj.get("operation").and_then(Value::as_str) != Some("append") {
        return None;
    }
    obj.get("values").and_then(Value::as_array)
}

/// Recursively merge `patch` into `target`. Objects merge key by key; every
/// other value in the patch replaces the target value. A legacy append wrapper
/// anywhere in the patch is converted into a concatenation with the existing
/// array before being written.
pub fn deep_merge(target: &mut Value, patch: &Value) {
    if let Some(values) = legacy_append_values(patch) {
        let mut combined = target.as_array().cloned().unwrap_or_default();
        combined.extend(values.iter().cloned());
        *target = Value::Array(combined);
        return;
    }

    let Some(patch_obj) = patch.as_object() else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Some(target_obj) = target.as_object_mut() {
        deep_merge_map(target_obj, patch_obj);
    }
}

/// Merge `patch` into the object map `target` (see [`deep_merge`]).
pub fn deep_merge_map(target: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, patch_value) in patch {
        let slot = target.entry(key.clone()).or_insert(Value::Null);
        deep_merge(slot, patch_value);
    }
}

/// Set the value at a dotted path (`"a.b.c"`), creating intermediate objects
/// as needed. Non-object intermediates are replaced by objects. Returns false
/// only for an empty path.
pub fn set_path(target: &mut Value, path: &str, value: Value) -> bool {
    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    let Some((last, parents)) = segments.split_last() else {
        return false;
    };

    let mut cursor = target;
    for segment in parents {
        if !cursor.is_object() {
            *cursor = Value::Object(Map::new());
        }
        let Some(obj) = cursor.as_object_mut() else {
            return false;
        };
        cursor = obj
            .entry((*segment).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    if !cursor.is_object() {
        *cursor = Value::Object(Map::new());
    }
    match cursor.as_object_mut() {
        Some(obj) => {
            obj.insert((*last).to_string(), value);
            true
        }
        None => false,
    }
}

/// Read the value at a dotted path.
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|s| !s.is_empty())
        .try_fold(value, |cursor, segment| cursor.get(segment))
}

/// Replace every occurrence of `token` inside string values (and object keys)
/// with `replacement`, recursively.
pub fn substitute_token(value: &mut Value, token: &str, replacement: &str) {
    match value {
        Value::String(s) if s.contains(token) => {
            *s = s.replace(token, replacement);
        }
        Value::Array(items) => {
            for item in items {
                substitute_token(item, token, replacement);
            }
        }
        Value::Object(obj) => {
            let keys: Vec<String> = obj.keys().filter(|k| k.contains(token)).cloned().collect();
            for key in keys {
                if let Some(v) = obj.remove(&key) {
                    obj.insert(key.replace(token, replacement), v);
                }
            }
            for v in obj.values_mut() {
                substitute_token(v, token, replacement);
            }
        }
        _ => {}
    }
}

/// Truncate on a character boundary.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        let truncated: String = text.chars().take(max_chars).collect();
        format!("{truncated}...")
    } else {
        text.to_string()
    }
}

/// Extract a JSON payload from text that may wrap it in markdown fences or
/// surround it with prose.
pub fn extract_json(text: &str) -> &str {
    let text = text.trim();

    if let Some(start) = text.find("```json") {
        let content_start = start + 7;
        if let Some(end) = text[content_start..].find("```") {
            return text[content_start..content_start + end].trim();
        }
    }

    if let Some(start) = text.find("```") {
        let content_start = start + 3;
        if let Some(end) = text[content_start..].find("```") {
            return text[content_start..content_start + end].trim();
        }
    }

    // Prose around a bare object
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            return &text[start..=end];
        }
    }

    text
}
