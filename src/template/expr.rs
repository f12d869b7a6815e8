//! `{{ var.path }}` expression rendering.
//!
//! Walks a template value; any string containing `{{ path }}` markers is
//! substituted from the variable tree. A string that is exactly one marker
//! keeps the referenced value's JSON type; mixed strings interpolate.

use serde_json::Value;

use crate::error::{GatewayError, GatewayResult};

fn lookup<'a>(vars: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cursor = vars;
    for seg in path.split('.') {
        cursor = match cursor {
            Value::Object(map) => map.get(seg)?,
            Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cursor)
}

fn render_string(s: &str, vars: &Value) -> GatewayResult<Value> {
    let trimmed = s.trim();
    // Whole-string marker: keep the referenced type.
    if trimmed.starts_with("{{") && trimmed.ends_with("}}") && trimmed.matches("{{").count() == 1 {
        let path = trimmed[2..trimmed.len() - 2].trim();
        return lookup(vars, path)
            .cloned()
            .ok_or_else(|| GatewayError::TemplateRenderFailed(format!("unknown variable {path}")));
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 2..];
        let Some(end) = tail.find("}}") else {
            return Err(GatewayError::TemplateRenderFailed(format!(
                "unterminated expression in template string: {s}"
            )));
        };
        let path = tail[..end].trim();
        let value = lookup(vars, path).ok_or_else(|| {
            GatewayError::TemplateRenderFailed(format!("unknown variable {path}"))
        })?;
        match value {
            Value::String(v) => out.push_str(v),
            other => out.push_str(&other.to_string()),
        }
        rest = &tail[end + 2..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

/// Render every string in `template` against `vars`.
pub fn render_expressions(template: &Value, vars: &Value) -> GatewayResult<Value> {
    match template {
        Value::String(s) => render_string(s, vars),
        Value::Array(items) => items
            .iter()
            .map(|item| render_expressions(item, vars))
            .collect::<GatewayResult<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), render_expressions(v, vars)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}
