//! Placeholder resolution for action params.
//!
//! Params may reference the triggering event with `{{payload.x.y}}` and
//! `{{event.id}}` / `{{event.type}}` / `{{event.tenant_id}}` /
//! `{{event.correlation_id}}`. Resolution is total: a reference to a
//! missing field is a defined error, not a crash, and fails the rule
//! before any job is enqueued.

use cascade_core::{CascadeError, Result};
use serde_json::Value;

use crate::condition::lookup;
use crate::event::Event;

/// Resolve all placeholders in `params` against the triggering event.
///
/// A string that is exactly one placeholder resolves to the referenced
/// value with its JSON type preserved; placeholders embedded in longer
/// strings are rendered as text.
pub fn resolve(params: &Value, event: &Event) -> Result<Value> {
    match params {
        Value::String(s) => resolve_string(s, event),
        Value::Array(items) => {
            let resolved: Result<Vec<Value>> = items.iter().map(|v| resolve(v, event)).collect();
            Ok(Value::Array(resolved?))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve(v, event)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_string(s: &str, event: &Event) -> Result<Value> {
    // Whole-string placeholder keeps the JSON type.
    if let Some(path) = as_sole_placeholder(s) {
        return resolve_path(path, event);
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        let Some(end) = rest[start..].find("}}") else {
            return Err(CascadeError::Template(format!(
                "unterminated placeholder in '{s}'"
            )));
        };
        out.push_str(&rest[..start]);
        let path = rest[start + 2..start + end].trim();
        out.push_str(&render_text(&resolve_path(path, event)?));
        rest = &rest[start + end + 2..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

fn as_sole_placeholder(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("{{")?.strip_suffix("}}")?;
    let inner = inner.trim();
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner)
}

fn resolve_path(path: &str, event: &Event) -> Result<Value> {
    if let Some(field) = path.strip_prefix("payload.") {
        return lookup(&event.payload, field).cloned().ok_or_else(|| {
            CascadeError::Template(format!("payload field '{field}' not found"))
        });
    }
    match path {
        "payload" => Ok(event.payload.clone()),
        "event.id" => Ok(Value::String(event.id.clone())),
        "event.type" => Ok(Value::String(event.event_type.clone())),
        "event.tenant_id" => Ok(Value::String(event.tenant_id.clone())),
        "event.occurred_at" => Ok(Value::String(event.occurred_at.to_rfc3339())),
        "event.correlation_id" => Ok(event
            .correlation_id
            .as_ref()
            .map(|c| Value::String(c.clone()))
            .unwrap_or(Value::Null)),
        _ => Err(CascadeError::Template(format!(
            "unknown placeholder '{{{{{path}}}}}'"
        ))),
    }
}

fn render_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
