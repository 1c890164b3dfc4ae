// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Best-effort token estimation, used when a provider omits `usage`.

use crate::{ChatMessage, ResponseMessage};

/// chars/4 heuristic; close enough for accounting and budget warnings.
pub fn approx_token_count(text: &str) -> u64 {
    ((text.chars().count() + 3) / 4) as u64
}

/// Estimate `(prompt, completion, total)` for a request/response pair.
///
/// The prompt estimate serializes every message (role + content + tool
/// calls); the completion estimate covers text content and, when the model
/// answered with tool calls only, their serialized form.
pub fn estimate_usage(messages: &[ChatMessage], response: &ResponseMessage) -> (u64, u64, u64) {
    let prompt_text: String = messages
        .iter()
        .map(|m| serde_json::to_string(m).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("\n");
    let prompt = approx_token_count(&prompt_text);

    let mut completion_text = response.content.clone().unwrap_or_default();
    if completion_text.is_empty() {
        if let Some(calls) = &response.tool_calls {
            completion_text = serde_json::to_string(calls).unwrap_or_default();
        }
    }
    let completion = if completion_text.is_empty() {
        0
    } else {
        approx_token_count(&completion_text)
    };

    (prompt, completion, prompt + completion)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
