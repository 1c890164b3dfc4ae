// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The tool-using LLM loop.
//!
//! One admitted request gets one [`AiClient::ask`] call, which drives up to
//! `max_iterations` rounds of: model call → inspect → execute tool calls
//! concurrently → append results in emission order → repeat.  The loop never
//! lets a model or tool failure escape: model errors degrade to an apology
//! string, tool errors become the tool message content.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use corvid_config::{ConfigManager, ModelEndpoint};
use corvid_context::{spawn_scoped, RequestContext};
use corvid_model::{
    ChatMessage, ChatRequest, ChatResponse, ModelError, ModelRequester, ModelSelector, ToolChoice,
    ToolNameMap, ToolSchema,
};
use corvid_skills::SkillContext;

use crate::{args::parse_tool_arguments, PromptBuilder, ToolManager};

/// Synthetic tool result for an `end` call deferred because other tools ran
/// in the same round.
const END_DEFERRED_NOTE: &str =
    "end 在本轮与其他工具同时出现，已跳过执行；其他工具完成后如仍需结束请再次调用 end";

/// Synthetic tool result for a duplicate `tool_call_id` within one round.
const DUPLICATE_CALL_NOTE: &str = "error: duplicate tool_call_id, execution skipped";

/// Per-request inputs for [`AiClient::ask`].
#[derive(Debug, Clone, Default)]
pub struct AskOptions {
    /// Text used to query the cognitive memory (usually the raw user text).
    pub memory_query: String,
    pub group_id: Option<i64>,
    pub user_id: Option<i64>,
    pub sender_name: Option<String>,
    pub group_name: Option<String>,
    /// Pre-rendered recent-history block.
    pub history_block: Option<String>,
}

pub struct AiClient {
    config: Arc<ConfigManager>,
    requester: Arc<dyn ModelRequester>,
    tool_manager: Arc<ToolManager>,
    prompt_builder: Arc<PromptBuilder>,
    selector: Option<Arc<ModelSelector>>,
}

impl AiClient {
    pub fn new(
        config: Arc<ConfigManager>,
        requester: Arc<dyn ModelRequester>,
        tool_manager: Arc<ToolManager>,
        prompt_builder: Arc<PromptBuilder>,
        selector: Option<Arc<ModelSelector>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            requester,
            tool_manager,
            prompt_builder,
            selector,
        })
    }

    pub fn tool_manager(&self) -> &Arc<ToolManager> {
        &self.tool_manager
    }

    pub fn requester(&self) -> &dyn ModelRequester {
        self.requester.as_ref()
    }

    pub fn selector(&self) -> Option<&Arc<ModelSelector>> {
        self.selector.as_ref()
    }

    /// One model call with the standard decorations: agent-MCP schema merge
    /// for `agent:<name>` call types, and the prefetch pass (once per
    /// `(request, call_type)`).
    pub async fn request_model(
        &self,
        model: &ModelEndpoint,
        messages: Vec<ChatMessage>,
        call_type: &str,
        tools: Option<Vec<ToolSchema>>,
        tool_choice: ToolChoice,
    ) -> Result<ChatResponse, ModelError> {
        let config = self.config.current();
        let tools = self.tool_manager.maybe_merge_agent_tools(call_type, tools);
        let (messages, tools) = self
            .tool_manager
            .maybe_prefetch_tools(
                messages,
                tools,
                call_type,
                &config.skills.prefetch_tools,
                config.skills.prefetch_tools_hide,
            )
            .await;

        let mut request =
            ChatRequest::new(call_type, messages).with_max_tokens(model.max_tokens);
        if let Some(tools) = tools {
            request = request.with_tools(tools).with_tool_choice(tool_choice);
        }
        self.requester.request(model, request).await
    }

    /// Pick the chat endpoint for this request (model pool aware).
    fn select_chat_model(&self, opts: &AskOptions) -> ModelEndpoint {
        let config = self.config.current();
        match &self.selector {
            Some(selector) => selector.select_chat_config(
                &config.models.chat,
                opts.group_id,
                opts.user_id,
                config.model_pool.enabled,
            ),
            None => config.models.chat.clone(),
        }
    }

    /// Drive the loop for one request.  Returns the model's final content
    /// (empty on silent end).
    pub async fn ask(&self, question: &str, opts: AskOptions) -> String {
        let chat_model = self.select_chat_model(&opts);
        let mut messages = self
            .prompt_builder
            .build_messages(
                question,
                &opts.memory_query,
                opts.group_id.map(|g| g.to_string()).as_deref(),
                opts.user_id.map(|u| u.to_string()).as_deref(),
                opts.sender_name.as_deref(),
                opts.group_name.as_deref(),
                opts.history_block.clone(),
            )
            .await;
        let tools = self.tool_manager.get_openai_tools();
        let max_iterations = self.config.current().llm_loop.max_iterations;
        debug!(
            messages = messages.len(),
            tools = tools.len(),
            question_len = question.chars().count(),
            "loop input assembled"
        );

        for iteration in 1..=max_iterations {
            info!(iteration, "llm loop iteration");

            let response = match self
                .request_model(
                    &chat_model,
                    messages.clone(),
                    "chat",
                    Some(tools.clone()),
                    ToolChoice::Auto,
                )
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    warn!(iteration, "model call failed, abandoning request: {e}");
                    return format!("处理失败: {e}");
                }
            };

            let name_map = response.tool_name_map.clone().unwrap_or_default();
            let message = response.message();
            let mut content = message.content.clone().unwrap_or_default();
            let tool_calls = message.tool_calls.clone().unwrap_or_default();

            if !tool_calls.is_empty() && !content.trim().is_empty() {
                // Policy: tool calls win; stray content alongside them is
                // dropped rather than sent.
                debug!(
                    iteration,
                    content_len = content.chars().count(),
                    "content alongside tool calls dropped"
                );
                content.clear();
            }

            if tool_calls.is_empty() {
                info!(
                    iteration,
                    content_len = content.chars().count(),
                    "loop finished with final content"
                );
                return content;
            }

            // Thinking-mode models require the reasoning trace to be echoed
            // back with the tool-call turn; omitting it yields a 400 on the
            // next request.
            let reasoning = if chat_model.thinking_enabled {
                message.reasoning_content.clone()
            } else {
                None
            };
            messages.push(ChatMessage::assistant_tool_calls(
                content,
                tool_calls.clone(),
                reasoning,
            ));

            messages = self
                .run_tool_round(messages, &tool_calls, &name_map, iteration)
                .await;

            let ended = RequestContext::current()
                .map(|ctx| ctx.conversation_ended())
                .unwrap_or(false);
            if ended {
                info!(iteration, "conversation ended by tool");
                return String::new();
            }
        }

        warn!(max_iterations, "iteration limit reached");
        "max iterations reached".to_string()
    }

    /// Execute one round of tool calls concurrently and append one tool
    /// message per call, in the model's emission order.
    async fn run_tool_round(
        &self,
        mut messages: Vec<ChatMessage>,
        tool_calls: &[corvid_model::ToolCallPayload],
        name_map: &ToolNameMap,
        iteration: u32,
    ) -> Vec<ChatMessage> {
        enum Planned {
            Task(tokio::task::JoinHandle<Result<String, corvid_skills::SkillError>>),
            Ready(String),
        }

        let internal_names: Vec<String> = tool_calls
            .iter()
            .map(|c| name_map.internal_name(&c.function.name).to_string())
            .collect();
        let has_non_end = internal_names.iter().any(|n| n != "end");

        let mut seen_ids: HashSet<String> = HashSet::new();
        let mut planned: Vec<Planned> = Vec::with_capacity(tool_calls.len());
        for (call, internal) in tool_calls.iter().zip(&internal_names) {
            if !seen_ids.insert(call.id.clone()) {
                warn!(call_id = %call.id, tool = %internal, "duplicate tool_call_id in round");
                planned.push(Planned::Ready(DUPLICATE_CALL_NOTE.to_string()));
                continue;
            }
            if internal == "end" && has_non_end {
                // `end` never runs alongside other tools; the model re-emits
                // it next round if it still wants to stop.
                info!(call_id = %call.id, "end deferred: other tools in same round");
                planned.push(Planned::Ready(END_DEFERRED_NOTE.to_string()));
                continue;
            }
            let args = parse_tool_arguments(&call.function.arguments, internal);
            info!(tool = %internal, call_id = %call.id, iteration, "executing tool");
            let tool_manager = self.tool_manager.clone();
            let name = internal.clone();
            planned.push(Planned::Task(spawn_scoped(async move {
                tool_manager
                    .execute_tool(&name, args, SkillContext::new())
                    .await
            })));
        }

        // Await in emission order; a failure never cancels siblings.
        for (call, plan) in tool_calls.iter().zip(planned) {
            let content = match plan {
                Planned::Ready(text) => text,
                Planned::Task(handle) => match handle.await {
                    Ok(Ok(text)) => text,
                    Ok(Err(e)) => format!("error: {e}"),
                    Err(e) => format!("error: tool panicked: {e}"),
                },
            };
            messages.push(ChatMessage::tool_result(
                &call.id,
                &call.function.name,
                content,
            ));
        }
        messages
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
