//! Merge-patch template engine.
//!
//! Shallow field mapping with RFC 7386 semantics: template fields override
//! the request, `null` removes a field, nested objects merge recursively.

use serde_json::Value;

/// Apply `patch` over `base`.
pub fn merge_patch(base: &Value, patch: &Value) -> Value {
    match patch {
        Value::Null => base.clone(),
        Value::Object(patch_map) => {
            let mut out = match base {
                Value::Object(m) => m.clone(),
                _ => serde_json::Map::new(),
            };
            for (k, v) in patch_map {
                match v {
                    Value::Null => {
                        out.remove(k);
                    }
                    Value::Object(_) => {
                        let merged = merge_patch(out.get(k).unwrap_or(&Value::Null), v);
                        out.insert(k.clone(), merged);
                    }
                    other => {
                        out.insert(k.clone(), other.clone());
                    }
                }
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn null_override_removes_field() {
        let base = json!({"model": "gpt-image-1", "response_format": "url"});
        let patch = json!({"response_format": null});
        let out = merge_patch(&base, &patch);
        assert!(out.get("response_format").is_none());
        assert_eq!(out["model"], "gpt-image-1");
    }

    #[test]
    fn values_override_and_objects_merge() {
        let base = json!({"a": 1, "nested": {"x": 1, "y": 2}});
        let patch = json!({"a": 9, "nested": {"y": 3}, "b": true});
        let out = merge_patch(&base, &patch);
        assert_eq!(out, json!({"a": 9, "b": true, "nested": {"x": 1, "y": 3}}));
    }

    #[test]
    fn null_patch_is_identity() {
        let base = json!({"keep": "me"});
        assert_eq!(merge_patch(&base, &Value::Null), base);
    }
}
