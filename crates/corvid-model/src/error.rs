// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

/// Failure modes of one model call.  All are local to a single LLM-loop
/// iteration; the enclosing request catches, logs and degrades.
#[derive(Debug, Error)]
pub enum ModelError {
    /// The HTTP request never produced a response (DNS, connect, timeout).
    #[error("model transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The provider answered with a non-success status.
    #[error("model API error: status={status} body={body}")]
    Api { status: u16, body: String },

    /// The response body could not be decoded into the expected shape.
    #[error("model response decoding error: {0}")]
    Decoding(String),
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_displays_status_and_body() {
        let e = ModelError::Api {
            status: 429,
            body: "rate limited".into(),
        };
        let text = e.to_string();
        assert!(text.contains("429"));
        assert!(text.contains("rate limited"));
    }

    #[test]
    fn decoding_error_displays_reason() {
        let e = ModelError::Decoding("missing choices".into());
        assert!(e.to_string().contains("missing choices"));
    }
}
