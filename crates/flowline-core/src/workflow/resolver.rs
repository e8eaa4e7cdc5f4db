//! `${...}` template resolution against the run context.
//!
//! Supports two reference families inside string leaves:
//! - `${outputs.<node_id>[.segment...]}` -- a completed node's output,
//!   optionally traversing into its object tree by key.
//! - `${variables.<name>[.segment...]}` -- a run variable.
//!
//! Resolution is applied recursively through arrays and maps; non-string
//! scalars pass through unchanged. Unresolvable templates (missing node,
//! missing key, traversal into a non-object) are preserved verbatim, which
//! also makes resolution idempotent. Nested braces are not supported.

use serde_json::Value;

use super::context::RunContext;

/// Resolve all templates in a value of arbitrary shape, preserving the
/// container structure.
pub fn resolve_value(value: &Value, ctx: &RunContext) -> Value {
    match value {
        Value::String(s) => Value::String(resolve_str(s, ctx)),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| resolve_value(v, ctx)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Resolve all templates in a single string.
pub fn resolve_str(input: &str, ctx: &RunContext) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        match after.find('}') {
            Some(end) => {
                let expr = &after[..end];
                match lookup(expr, ctx) {
                    Some(value) => out.push_str(&value_to_string(&value)),
                    // Unknown reference: keep the literal template.
                    None => {
                        out.push_str("${");
                        out.push_str(expr);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            // Unterminated template: keep the tail verbatim.
            None => {
                out.push_str(&rest[start..]);
                rest = "";
                break;
            }
        }
    }

    out.push_str(rest);
    out
}

/// Look up a dotted reference expression against the context.
fn lookup(expr: &str, ctx: &RunContext) -> Option<Value> {
    let mut segments = expr.split('.');
    let root = match segments.next()? {
        "outputs" => ctx.outputs.get(segments.next()?)?,
        "variables" => ctx.variables.get(segments.next()?)?,
        _ => return None,
    };

    let mut current = root;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current.clone())
}

/// Convert a JSON value to a display string for template substitution.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // For objects/arrays, substitute compact JSON
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
