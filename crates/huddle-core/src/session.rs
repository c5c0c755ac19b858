//! Group session patching.
//!
//! Session patches use JSON merge-patch rules:
//! - Objects are merged recursively (patch overrides target per-key)
//! - `null` in the patch removes the key from the target
//! - Arrays and primitives replace the target entirely
//!
//! A `groupSessionPatches` field may carry one patch or an array of patches,
//! applied in order.

use serde_json::{Map, Value};

/// Apply one merge patch to `target` in place.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                let _ = target_map.remove(key);
            } else {
                merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// Apply the patches carried by a `groupSessionPatches` field.
///
/// An array is treated as a sequence of patches; anything else is a single
/// patch. A missing target starts out as an empty object.
pub fn apply_session_patches(data: Option<Value>, patches: &Value) -> Value {
    let mut target = data.unwrap_or_else(|| Value::Object(Map::new()));
    match patches {
        Value::Array(list) => {
            for patch in list {
                merge_patch(&mut target, patch);
            }
        }
        single => merge_patch(&mut target, single),
    }
    target
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_overrides_and_keeps() {
        let mut target = json!({"a": 1, "b": 2});
        merge_patch(&mut target, &json!({"a": 10}));
        assert_eq!(target, json!({"a": 10, "b": 2}));
    }

    #[test]
    fn merge_nested() {
        let mut target = json!({"round": {"n": 1, "winner": "x"}});
        merge_patch(&mut target, &json!({"round": {"n": 2}}));
        assert_eq!(target, json!({"round": {"n": 2, "winner": "x"}}));
    }

    #[test]
    fn null_removes_key() {
        let mut target = json!({"a": 1, "b": 2});
        merge_patch(&mut target, &json!({"b": null}));
        assert_eq!(target, json!({"a": 1}));
    }

    #[test]
    fn array_replaces() {
        let mut target = json!({"list": [1, 2, 3]});
        merge_patch(&mut target, &json!({"list": [4]}));
        assert_eq!(target, json!({"list": [4]}));
    }

    #[test]
    fn non_object_patch_replaces_whole_value() {
        let mut target = json!({"a": 1});
        merge_patch(&mut target, &json!("reset"));
        assert_eq!(target, json!("reset"));
    }

    #[test]
    fn object_patch_over_primitive_starts_fresh() {
        let mut target = json!(5);
        merge_patch(&mut target, &json!({"a": 1}));
        assert_eq!(target, json!({"a": 1}));
    }

    #[test]
    fn patch_sequence_applies_in_order() {
        let data = Some(json!({"count": 0}));
        let patched = apply_session_patches(data, &json!([{"count": 1}, {"count": 2, "done": true}]));
        assert_eq!(patched, json!({"count": 2, "done": true}));
    }

    #[test]
    fn missing_data_starts_empty() {
        let patched = apply_session_patches(None, &json!({"k": "v"}));
        assert_eq!(patched, json!({"k": "v"}));
    }
}
