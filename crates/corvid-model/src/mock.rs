// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Scripted mock requester for tests.
//!
//! Each call pops the next canned response from the front of the queue, so a
//! test can specify exact multi-round conversations — including tool calls
//! and failures — without network access.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use corvid_config::ModelEndpoint;

use crate::{
    sanitize, ChatRequest, ChatResponse, ModelError, ModelRequester, ToolCallPayload, ToolNameMap,
};

enum Script {
    Reply(ChatResponse),
    ApiError { status: u16, body: String },
}

/// A pre-scripted [`ModelRequester`].  Also records every observed request so
/// tests can assert on what was sent.
pub struct ScriptedRequester {
    scripts: Mutex<VecDeque<Script>>,
    pub requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedRequester {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue a canned response.
    pub fn push(&self, response: ChatResponse) -> &Self {
        self.lock_scripts().push_back(Script::Reply(response));
        self
    }

    /// Queue a text-only reply.
    pub fn push_text(&self, text: impl Into<String>) -> &Self {
        self.push(ChatResponse::text(text))
    }

    /// Queue a tool-call reply; `calls` are `(id, name, arguments_json)`.
    pub fn push_tool_calls(&self, calls: Vec<(&str, &str, &str)>) -> &Self {
        let payloads = calls
            .into_iter()
            .map(|(id, name, args)| ToolCallPayload::new(id, name, args))
            .collect();
        self.push(ChatResponse::tool_calls(payloads))
    }

    /// Queue an API error.
    pub fn push_api_error(&self, status: u16, body: impl Into<String>) -> &Self {
        self.lock_scripts().push_back(Script::ApiError {
            status,
            body: body.into(),
        });
        self
    }

    /// Number of calls observed so far.
    pub fn call_count(&self) -> usize {
        self.lock_requests().len()
    }

    /// The call types observed, in order.
    pub fn call_types(&self) -> Vec<String> {
        self.lock_requests()
            .iter()
            .map(|r| r.call_type.clone())
            .collect()
    }

    fn lock_scripts(&self) -> std::sync::MutexGuard<'_, VecDeque<Script>> {
        match self.scripts.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_requests(&self) -> std::sync::MutexGuard<'_, Vec<ChatRequest>> {
        match self.requests.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for ScriptedRequester {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelRequester for ScriptedRequester {
    async fn request(
        &self,
        _model: &ModelEndpoint,
        req: ChatRequest,
    ) -> Result<ChatResponse, ModelError> {
        // Mirror the real requester's name-map behavior so loop code under
        // test exercises the api→internal resolution path.
        let name_map: Option<ToolNameMap> = req
            .tools
            .as_ref()
            .map(|tools| sanitize::sanitize_tool_schemas(tools).1);

        self.lock_requests().push(req);

        let script = self.lock_scripts().pop_front();
        match script {
            Some(Script::Reply(mut resp)) => {
                if resp.tool_name_map.is_none() {
                    resp.tool_name_map = name_map;
                }
                Ok(resp)
            }
            Some(Script::ApiError { status, body }) => Err(ModelError::Api { status, body }),
            None => Ok(ChatResponse::text("[no more scripts]")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> ModelEndpoint {
        ModelEndpoint::default()
    }

    #[tokio::test]
    async fn scripted_replies_in_order() {
        let mock = ScriptedRequester::new();
        mock.push_text("first").push_text("second");
        let r1 = mock
            .request(&endpoint(), ChatRequest::new("chat", vec![]))
            .await
            .unwrap();
        let r2 = mock
            .request(&endpoint(), ChatRequest::new("chat", vec![]))
            .await
            .unwrap();
        assert_eq!(r1.message().content.as_deref(), Some("first"));
        assert_eq!(r2.message().content.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn scripted_error_surfaces() {
        let mock = ScriptedRequester::new();
        mock.push_api_error(500, "boom");
        let err = mock
            .request(&endpoint(), ChatRequest::new("chat", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::Api { status: 500, .. }));
    }

    #[tokio::test]
    async fn fallback_after_exhaustion() {
        let mock = ScriptedRequester::new();
        let r = mock
            .request(&endpoint(), ChatRequest::new("chat", vec![]))
            .await
            .unwrap();
        assert!(r.message().content.unwrap().contains("no more scripts"));
    }

    #[tokio::test]
    async fn records_observed_requests() {
        let mock = ScriptedRequester::new();
        mock.push_text("x");
        let _ = mock
            .request(&endpoint(), ChatRequest::new("security", vec![]))
            .await;
        assert_eq!(mock.call_types(), vec!["security"]);
    }

    #[tokio::test]
    async fn attaches_name_map_when_tools_present() {
        let mock = ScriptedRequester::new();
        mock.push_tool_calls(vec![("c1", "a_b", "{}")]);
        let tools = vec![crate::ToolSchema::function(
            "a.b",
            "",
            serde_json::json!({"type": "object"}),
        )];
        let resp = mock
            .request(
                &endpoint(),
                ChatRequest::new("chat", vec![]).with_tools(tools),
            )
            .await
            .unwrap();
        let map = resp.tool_name_map.unwrap();
        assert_eq!(map.internal_name("a_b"), "a.b");
    }
}
