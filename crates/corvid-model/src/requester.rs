// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The model-call seam.
//!
//! [`ModelRequester`] is the only way the core talks to an LLM.  The HTTP
//! implementation speaks the OpenAI chat-completions wire format against any
//! compatible endpoint, normalizes the response (usage always present, tool
//! names mapped back to internal names), and records token usage without
//! blocking the reply.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use corvid_config::ModelEndpoint;

use crate::{
    sanitize, tokens, ChatRequest, ChatResponse, ModelError, TokenUsageRecord, TokenUsageStore,
    ToolChoice,
};

/// Sends one chat-completion request and returns the normalized response.
#[async_trait]
pub trait ModelRequester: Send + Sync {
    async fn request(
        &self,
        model: &ModelEndpoint,
        req: ChatRequest,
    ) -> Result<ChatResponse, ModelError>;
}

/// Reqwest-backed requester for OpenAI-compatible endpoints.
pub struct HttpRequester {
    client: reqwest::Client,
    usage_store: Arc<TokenUsageStore>,
}

impl HttpRequester {
    pub fn new(client: reqwest::Client, usage_store: Arc<TokenUsageStore>) -> Self {
        Self {
            client,
            usage_store,
        }
    }

    fn record(&self, model: &ModelEndpoint, req: &ChatRequest, usage: (u64, u64, u64), started: Instant, success: bool) {
        self.usage_store.record(TokenUsageRecord {
            timestamp: chrono::Utc::now().to_rfc3339(),
            model_name: model.model_name.clone(),
            call_type: req.call_type.clone(),
            prompt_tokens: usage.0,
            completion_tokens: usage.1,
            total_tokens: usage.2,
            duration_seconds: started.elapsed().as_secs_f64(),
            success,
        });
    }
}

/// Normalize a configured API URL into the chat-completions endpoint.
///
/// A legacy URL already ending in `/chat/completions` is tolerated; otherwise
/// the suffix is appended to the trimmed base.
pub fn chat_completions_url(api_url: &str) -> String {
    let trimmed = api_url.trim_end_matches('/');
    if trimmed.ends_with("/chat/completions") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/chat/completions")
    }
}

/// Build the request body in the OpenAI wire format.
///
/// Tools are passed already sanitized; the thinking block is attached only
/// when the endpoint enables it.
pub fn build_request_body(
    model: &ModelEndpoint,
    req: &ChatRequest,
    wire_tools: Option<&[crate::ToolSchema]>,
    wire_tool_choice: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut body = serde_json::json!({
        "model": model.model_name,
        "messages": req.messages,
        "max_tokens": req.max_tokens,
    });
    if let Some(t) = model.temperature {
        body["temperature"] = serde_json::json!(t);
    }
    if model.thinking_enabled {
        body["thinking"] = serde_json::json!({
            "type": "enabled",
            "budget_tokens": model.thinking_budget_tokens,
        });
    }
    if let Some(tools) = wire_tools {
        if !tools.is_empty() {
            body["tools"] = serde_json::json!(tools);
            if let Some(choice) = wire_tool_choice {
                body["tool_choice"] = choice;
            }
        }
    }
    body
}

#[async_trait]
impl ModelRequester for HttpRequester {
    async fn request(
        &self,
        model: &ModelEndpoint,
        req: ChatRequest,
    ) -> Result<ChatResponse, ModelError> {
        let started = Instant::now();

        // Sanitize tool names for the wire and keep the inverse map.
        let (wire_tools, name_map) = match &req.tools {
            Some(tools) => {
                let (sanitized, map) = sanitize::sanitize_tool_schemas(tools);
                (Some(sanitized), Some(map))
            }
            None => (None, None),
        };
        let wire_choice = match (&req.tool_choice, &name_map) {
            (ToolChoice::Function(internal), Some(map)) => {
                let api = sanitize::api_name_for(map, internal);
                Some(req.tool_choice.to_wire(api.as_deref()))
            }
            (choice, _) => Some(choice.to_wire(None)),
        };

        let url = chat_completions_url(&model.api_url);
        let body = build_request_body(model, &req, wire_tools.as_deref(), wire_choice);

        debug!(
            call_type = %req.call_type,
            model = %model.model_name,
            messages = req.messages.len(),
            tools = wire_tools.as_ref().map(|t| t.len()).unwrap_or(0),
            "model request"
        );

        let result = async {
            let response = self
                .client
                .post(&url)
                .bearer_auth(&model.api_key)
                .json(&body)
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(ModelError::Api {
                    status: status.as_u16(),
                    body,
                });
            }

            let mut parsed: ChatResponse = response
                .json()
                .await
                .map_err(|e| ModelError::Decoding(e.to_string()))?;
            parsed.tool_name_map = name_map.clone();
            Ok(parsed)
        }
        .await;

        match result {
            Ok(mut resp) => {
                // Usage normalization: never return without a usage field.
                let u = &mut resp.usage;
                if u.total_tokens == 0 && (u.prompt_tokens > 0 || u.completion_tokens > 0) {
                    u.total_tokens = u.prompt_tokens + u.completion_tokens;
                }
                if u.total_tokens == 0 {
                    let message = resp.message();
                    let (p, c, t) = tokens::estimate_usage(&req.messages, &message);
                    resp.usage = crate::Usage {
                        prompt_tokens: p,
                        completion_tokens: c,
                        total_tokens: t,
                    };
                    debug!(
                        call_type = %req.call_type,
                        total = t,
                        "usage missing from response; estimated"
                    );
                }
                info!(
                    call_type = %req.call_type,
                    model = %model.model_name,
                    duration_s = format!("{:.2}", started.elapsed().as_secs_f64()),
                    total_tokens = resp.usage.total_tokens,
                    "model response"
                );
                let usage = (
                    resp.usage.prompt_tokens,
                    resp.usage.completion_tokens,
                    resp.usage.total_tokens,
                );
                self.record(model, &req, usage, started, true);
                Ok(resp)
            }
            Err(e) => {
                warn!(call_type = %req.call_type, model = %model.model_name, "model call failed: {e}");
                self.record(model, &req, (0, 0, 0), started, false);
                Err(e)
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChatMessage, ToolSchema};

    fn endpoint() -> ModelEndpoint {
        ModelEndpoint {
            api_url: "http://localhost:9999/v1".into(),
            api_key: "k".into(),
            model_name: "test-model".into(),
            max_tokens: 4096,
            temperature: Some(0.7),
            thinking_enabled: false,
            thinking_budget_tokens: 4096,
        }
    }

    #[test]
    fn url_appends_chat_completions() {
        assert_eq!(
            chat_completions_url("http://x/v1"),
            "http://x/v1/chat/completions"
        );
        assert_eq!(
            chat_completions_url("http://x/v1/"),
            "http://x/v1/chat/completions"
        );
    }

    #[test]
    fn url_tolerates_legacy_suffix() {
        assert_eq!(
            chat_completions_url("http://x/v1/chat/completions"),
            "http://x/v1/chat/completions"
        );
    }

    #[test]
    fn body_includes_model_and_temperature() {
        let req = ChatRequest::new("chat", vec![ChatMessage::user("hi")]);
        let body = build_request_body(&endpoint(), &req, None, None);
        assert_eq!(body["model"], "test-model");
        assert_eq!(body["max_tokens"], 8192);
        assert!((body["temperature"].as_f64().unwrap() - 0.7).abs() < 1e-6);
        assert!(body.get("thinking").is_none());
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn body_includes_thinking_when_enabled() {
        let mut ep = endpoint();
        ep.thinking_enabled = true;
        ep.thinking_budget_tokens = 1024;
        let req = ChatRequest::new("chat", vec![ChatMessage::user("hi")]);
        let body = build_request_body(&ep, &req, None, None);
        assert_eq!(body["thinking"]["type"], "enabled");
        assert_eq!(body["thinking"]["budget_tokens"], 1024);
    }

    #[test]
    fn body_includes_tools_and_choice() {
        let req = ChatRequest::new("chat", vec![ChatMessage::user("hi")]);
        let tools = vec![ToolSchema::function(
            "get_time",
            "time",
            serde_json::json!({"type": "object"}),
        )];
        let body = build_request_body(
            &endpoint(),
            &req,
            Some(&tools),
            Some(serde_json::json!("auto")),
        );
        assert_eq!(body["tools"][0]["function"]["name"], "get_time");
        assert_eq!(body["tool_choice"], "auto");
    }

    #[tokio::test]
    async fn transport_error_is_reported_and_recorded() {
        // Nothing listens on this port; the call must fail with Transport and
        // still record a failed usage entry.
        let store = TokenUsageStore::memory();
        let requester = HttpRequester::new(reqwest::Client::new(), store.clone());
        let req = ChatRequest::new("chat", vec![ChatMessage::user("hi")]);
        let mut ep = endpoint();
        ep.api_url = "http://127.0.0.1:1/v1".into();
        let err = requester.request(&ep, req).await.unwrap_err();
        assert!(matches!(err, ModelError::Transport(_)));
        let records = store.records();
        assert_eq!(records.len(), 1);
        assert!(!records[0].success);
    }
}
