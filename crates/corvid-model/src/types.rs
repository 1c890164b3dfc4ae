// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ─── Message types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single message in the conversation sent to the model.
///
/// Mirrors the OpenAI chat-completions shape.  `reasoning_content` is carried
/// verbatim for thinking-mode models: when the assistant turn contains tool
/// calls, omitting it from the echo-back causes a 400-class error on the next
/// request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallPayload>>,
    /// Set on `tool` role messages: the id of the call being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Set on `tool` role messages: the (wire) name of the tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self::plain(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::plain(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, text)
    }

    fn plain(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: text.into(),
            reasoning_content: None,
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    /// An assistant turn carrying tool calls (content is usually empty).
    pub fn assistant_tool_calls(
        content: impl Into<String>,
        tool_calls: Vec<ToolCallPayload>,
        reasoning_content: Option<String>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            reasoning_content,
            tool_calls: Some(tool_calls),
            tool_call_id: None,
            name: None,
        }
    }

    /// A `tool` role result message for one call.
    pub fn tool_result(
        call_id: impl Into<String>,
        api_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            reasoning_content: None,
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
            name: Some(api_name.into()),
        }
    }
}

/// One tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallPayload {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: FunctionCall,
}

fn function_kind() -> String {
    "function".into()
}

impl ToolCallPayload {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: function_kind(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded argument object (possibly malformed — parse leniently).
    #[serde(default)]
    pub arguments: String,
}

// ─── Tool schema ──────────────────────────────────────────────────────────────

/// An OpenAI-format tool definition advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSchema {
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: FunctionDef,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema of the parameters object.
    #[serde(default = "empty_object_schema")]
    pub parameters: serde_json::Value,
}

fn empty_object_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

impl ToolSchema {
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            kind: function_kind(),
            function: FunctionDef {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }
}

/// How the model is allowed to pick tools.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ToolChoice {
    #[default]
    Auto,
    None,
    /// Force one specific tool by (internal) name.
    Function(String),
}

impl ToolChoice {
    /// Wire form, with the forced function name already sanitized.
    pub fn to_wire(&self, api_name: Option<&str>) -> serde_json::Value {
        match self {
            Self::Auto => serde_json::Value::String("auto".into()),
            Self::None => serde_json::Value::String("none".into()),
            Self::Function(name) => serde_json::json!({
                "type": "function",
                "function": { "name": api_name.unwrap_or(name) },
            }),
        }
    }
}

// ─── Request / response ───────────────────────────────────────────────────────

/// One chat-completion request as the core sees it (internal tool names).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    /// Short tag for token accounting, schema merging and prefetch de-dup:
    /// `chat`, `security`, `agent:<name>`, `historian_rewrite`, …
    pub call_type: String,
    pub tools: Option<Vec<ToolSchema>>,
    pub tool_choice: ToolChoice,
}

impl ChatRequest {
    pub fn new(call_type: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            max_tokens: 8192,
            call_type: call_type.into(),
            tools: None,
            tool_choice: ToolChoice::Auto,
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolSchema>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = choice;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub reasoning_content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCallPayload>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Choice {
    #[serde(default)]
    pub message: ResponseMessage,
}

/// Bijection between internal tool names and the sanitized wire names.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolNameMap {
    pub api_to_internal: HashMap<String, String>,
}

impl ToolNameMap {
    /// Resolve a wire name back to the internal canonical name.
    /// Unknown names pass through unchanged.
    pub fn internal_name<'a>(&'a self, api_name: &'a str) -> &'a str {
        self.api_to_internal
            .get(api_name)
            .map(String::as_str)
            .unwrap_or(api_name)
    }
}

/// Normalized chat-completion response.
///
/// `usage` is always populated — the requester estimates when the provider
/// omits it.  `tool_name_map` maps wire tool names back to internal names;
/// the loop must use it for all tool executions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChatResponse {
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Usage,
    #[serde(skip)]
    pub tool_name_map: Option<ToolNameMap>,
}

impl ChatResponse {
    /// The first choice's message, or a default when the provider returned an
    /// empty choices list.
    pub fn message(&self) -> ResponseMessage {
        self.choices
            .first()
            .map(|c| c.message.clone())
            .unwrap_or_default()
    }

    /// Convenience for building a text-only response (tests, canned replies).
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            choices: vec![Choice {
                message: ResponseMessage {
                    content: Some(content.into()),
                    reasoning_content: None,
                    tool_calls: None,
                },
            }],
            usage: Usage::default(),
            tool_name_map: None,
        }
    }

    /// Convenience for building a tool-call response (tests, canned replies).
    pub fn tool_calls(calls: Vec<ToolCallPayload>) -> Self {
        Self {
            choices: vec![Choice {
                message: ResponseMessage {
                    content: None,
                    reasoning_content: None,
                    tool_calls: Some(calls),
                },
            }],
            usage: Usage::default(),
            tool_name_map: None,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
