// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tool-name sanitization for model APIs.
//!
//! Providers restrict tool names (typically `[a-zA-Z0-9_-]`).  Internal skill
//! names may carry dots or other punctuation (`scheduler.call_self`), so the
//! requester rewrites names before sending and exposes the inverse map via
//! [`crate::ChatResponse::tool_name_map`].  The mapping must stay a bijection:
//! colliding sanitized names get numeric suffixes.

use std::collections::HashMap;

use crate::{ToolNameMap, ToolSchema};

/// Sanitize one tool name for the wire: lowercase, collapse every character
/// outside `[a-z0-9_-]` to `_`.
pub fn sanitize_tool_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-' {
            out.push(c);
        } else {
            out.push('_');
        }
    }
    if out.is_empty() {
        out.push('_');
    }
    out
}

/// Rewrite schema names for the wire and return the inverse mapping.
///
/// The returned schemas are in the same order as the input; `map` resolves
/// every wire name back to exactly one internal name.
pub fn sanitize_tool_schemas(tools: &[ToolSchema]) -> (Vec<ToolSchema>, ToolNameMap) {
    let mut used: HashMap<String, u32> = HashMap::new();
    let mut api_to_internal = HashMap::new();
    let mut sanitized = Vec::with_capacity(tools.len());

    for tool in tools {
        let internal = tool.function.name.clone();
        let base = sanitize_tool_name(&internal);
        let count = used.entry(base.clone()).or_insert(0);
        let api = if *count == 0 {
            base.clone()
        } else {
            format!("{base}_{}", *count + 1)
        };
        *count += 1;

        api_to_internal.insert(api.clone(), internal);
        let mut t = tool.clone();
        t.function.name = api;
        sanitized.push(t);
    }

    (sanitized, ToolNameMap { api_to_internal })
}

/// The wire name a forced tool-choice should use, given the computed map.
pub fn api_name_for(map: &ToolNameMap, internal: &str) -> Option<String> {
    map.api_to_internal
        .iter()
        .find(|(_, v)| v.as_str() == internal)
        .map(|(k, _)| k.clone())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(name: &str) -> ToolSchema {
        ToolSchema::function(name, "d", serde_json::json!({"type": "object"}))
    }

    #[test]
    fn sanitize_lowercases_and_collapses() {
        assert_eq!(sanitize_tool_name("Get Time"), "get_time");
        assert_eq!(sanitize_tool_name("scheduler.call_self"), "scheduler_call_self");
        assert_eq!(sanitize_tool_name("a-b_c9"), "a-b_c9");
    }

    #[test]
    fn sanitize_empty_yields_placeholder() {
        assert_eq!(sanitize_tool_name(""), "_");
    }

    #[test]
    fn schemas_keep_order_and_map_back() {
        let (out, map) = sanitize_tool_schemas(&[schema("A.b"), schema("get_time")]);
        assert_eq!(out[0].name(), "a_b");
        assert_eq!(out[1].name(), "get_time");
        assert_eq!(map.internal_name("a_b"), "A.b");
        assert_eq!(map.internal_name("get_time"), "get_time");
    }

    #[test]
    fn collisions_get_numeric_suffixes() {
        let (out, map) = sanitize_tool_schemas(&[schema("a.b"), schema("a_b"), schema("a b")]);
        let names: Vec<&str> = out.iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["a_b", "a_b_2", "a_b_3"]);
        // Bijection: three distinct wire names, three distinct internals.
        assert_eq!(map.api_to_internal.len(), 3);
        assert_eq!(map.internal_name("a_b"), "a.b");
        assert_eq!(map.internal_name("a_b_2"), "a_b");
        assert_eq!(map.internal_name("a_b_3"), "a b");
    }

    #[test]
    fn api_name_lookup_inverts_map() {
        let (_, map) = sanitize_tool_schemas(&[schema("My.Tool")]);
        assert_eq!(api_name_for(&map, "My.Tool").as_deref(), Some("my_tool"));
        assert!(api_name_for(&map, "unknown").is_none());
    }
}
