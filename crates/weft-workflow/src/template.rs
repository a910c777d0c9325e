//! `{{ .path }}` template resolution against a JSON scope.
//!
//! A string consisting of exactly one placeholder resolves to the typed
//! value at that path; placeholders embedded in longer text are rendered
//! as text. Missing paths resolve to `null`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use weft_core::Payload;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*\.([A-Za-z0-9_\-#\.]*)\s*\}\}").expect("placeholder pattern is valid")
});

fn placeholder() -> &'static Regex {
    &PLACEHOLDER
}

/// Look up a dot path (`tasks.fetch.output.items.0`) in a JSON value
pub fn lookup<'a>(scope: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(scope);
    }
    path.split('.').try_fold(scope, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn render_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Resolve a single template string
pub fn resolve_str(template: &str, scope: &Value) -> Value {
    let re = placeholder();
    let trimmed = template.trim();
    if let Some(caps) = re.captures(trimmed) {
        if let Some(whole) = caps.get(0) {
            if whole.start() == 0 && whole.end() == trimmed.len() {
                let path = caps.get(1).map(|m| m.as_str()).unwrap_or("");
                return lookup(scope, path).cloned().unwrap_or(Value::Null);
            }
        }
    } else {
        return Value::String(template.to_string());
    }

    let rendered = re.replace_all(template, |caps: &regex::Captures<'_>| {
        let path = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        lookup(scope, path).map(render_text).unwrap_or_default()
    });
    Value::String(rendered.into_owned())
}

/// Resolve every string inside a JSON value
pub fn resolve_value(value: &Value, scope: &Value) -> Value {
    match value {
        Value::String(s) => resolve_str(s, scope),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, scope)).collect()),
        Value::Object(map) => Value::Object(resolve_map(map, scope)),
        other => other.clone(),
    }
}

pub fn resolve_map(map: &Map<String, Value>, scope: &Value) -> Payload {
    map.iter()
        .map(|(k, v)| (k.clone(), resolve_value(v, scope)))
        .collect()
}

/// `null`, `false`, `0`, `""`, `[]` and `{}` are false
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Evaluate a condition: a template, optionally compared with `==` or `!=`
pub fn evaluate_condition(expr: &str, scope: &Value) -> bool {
    for (op, negate) in [("!=", true), ("==", false)] {
        if let Some((lhs, rhs)) = expr.split_once(op) {
            let left = operand(lhs, scope);
            let right = operand(rhs, scope);
            return (left == right) != negate;
        }
    }
    is_truthy(&resolve_str(expr, scope))
}

fn operand(raw: &str, scope: &Value) -> Value {
    let raw = raw.trim();
    if placeholder().is_match(raw) {
        return resolve_str(raw, scope);
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Key a resolved value selects in a routing table
pub fn route_key(value: &Value) -> String {
    render_text(value)
}
