// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Lenient tool-argument parsing.
//!
//! Models truncate, wrap arguments in code fences, leave dangling commas, and
//! emit raw control characters.  Recovery order: strip fences → direct parse →
//! scrub control characters → balance brackets → take the leading JSON value
//! and drop trailing garbage.  Anything that still fails, or parses to a
//! non-object, becomes `{}` — a malformed argument string must never abort
//! the loop.

use serde_json::Value;
use tracing::warn;

const CODE_FENCE_PREFIXES: [&str; 3] = ["```json", "```JSON", "```"];

fn strip_code_fences(raw: &str) -> String {
    let mut text = raw.trim().to_string();
    for prefix in CODE_FENCE_PREFIXES {
        if text.starts_with(prefix) {
            let lines: Vec<&str> = text.lines().collect();
            if lines.len() >= 2 {
                text = lines[1..].join("\n");
            }
            break;
        }
    }
    if text.trim_end().ends_with("```") {
        let trimmed = text.trim_end();
        text = trimmed[..trimmed.len() - 3].to_string();
    }
    text.trim().to_string()
}

fn scrub_control_chars(raw: &str) -> String {
    raw.replace(['\r', '\n', '\t'], " ").trim().to_string()
}

/// Append missing closers and drop dangling trailing commas.
fn repair_json_like(raw: &str) -> String {
    let mut text = raw.trim().to_string();
    while text.ends_with(',') || text.ends_with(' ') {
        text.pop();
        text = text.trim_end().to_string();
    }
    let open_braces = text.matches('{').count() as i64 - text.matches('}').count() as i64;
    for _ in 0..open_braces.max(0) {
        text.push('}');
    }
    let open_brackets = text.matches('[').count() as i64 - text.matches(']').count() as i64;
    for _ in 0..open_brackets.max(0) {
        text.push(']');
    }
    text
}

/// Take the first complete JSON value from the front of the string, ignoring
/// any trailing garbage.
fn leading_value(raw: &str) -> Option<Value> {
    let mut stream = serde_json::Deserializer::from_str(raw).into_iter::<Value>();
    stream.next()?.ok()
}

fn as_object(value: Value, tool_name: &str) -> Option<Value> {
    if value.is_object() {
        Some(value)
    } else {
        warn!(
            tool = tool_name,
            kind = value_kind(&value),
            "tool arguments parsed to a non-object; substituting {{}}"
        );
        None
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Parse a raw argument string into a JSON object, leniently.
pub fn parse_tool_arguments(raw: &str, tool_name: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Default::default());
    }
    let cleaned = strip_code_fences(raw);

    if let Ok(value) = serde_json::from_str::<Value>(&cleaned) {
        return as_object(value, tool_name).unwrap_or_else(|| Value::Object(Default::default()));
    }

    let scrubbed = scrub_control_chars(&cleaned);
    if scrubbed != cleaned {
        if let Ok(value) = serde_json::from_str::<Value>(&scrubbed) {
            warn!(tool = tool_name, "tool arguments contained control characters; scrubbed");
            if let Some(obj) = as_object(value, tool_name) {
                return obj;
            }
            return Value::Object(Default::default());
        }
    }

    let repaired = repair_json_like(&scrubbed);
    if repaired != scrubbed {
        if let Ok(value) = serde_json::from_str::<Value>(&repaired) {
            warn!(tool = tool_name, "tool arguments were truncated; repaired");
            if let Some(obj) = as_object(value, tool_name) {
                return obj;
            }
            return Value::Object(Default::default());
        }
    }

    if let Some(value) = leading_value(&scrubbed) {
        warn!(tool = tool_name, "tool arguments had trailing content; truncated");
        if let Some(obj) = as_object(value, tool_name) {
            return obj;
        }
        return Value::Object(Default::default());
    }

    warn!(tool = tool_name, raw = %raw, "tool argument parsing failed; substituting {{}}");
    Value::Object(Default::default())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
