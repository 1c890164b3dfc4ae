// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tool and agent execution management.
//!
//! Merges the tool and agent schemas (agents never shadow tools), attaches
//! per-agent MCP toolsets for the duration of one agent call, maintains the
//! per-request agent conversation memory, and runs the prefetch pass before
//! the first model call of a request.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tracing::{debug, info, warn};

use corvid_context::RequestContext;
use corvid_model::{ChatMessage, Role, ToolSchema};
use corvid_skills::{McpToolset, SkillContext, SkillError, SkillKind, SkillRegistry};

/// Per-request agent conversation memory: agent name → (prompt, reply) pairs.
pub type AgentHistories = StdMutex<HashMap<String, Vec<(String, String)>>>;

pub struct ToolManager {
    tools: Arc<SkillRegistry>,
    agents: Arc<SkillRegistry>,
    http: reqwest::Client,
    /// Agent name → live MCP toolset, present only while that agent runs.
    active_mcp: StdMutex<HashMap<String, Arc<McpToolset>>>,
}

impl ToolManager {
    pub fn new(tools: Arc<SkillRegistry>, agents: Arc<SkillRegistry>) -> Arc<Self> {
        debug_assert_eq!(tools.kind(), SkillKind::Tool);
        debug_assert_eq!(agents.kind(), SkillKind::Agent);
        Arc::new(Self {
            tools,
            agents,
            http: reqwest::Client::new(),
            active_mcp: StdMutex::new(HashMap::new()),
        })
    }

    pub fn tools(&self) -> &Arc<SkillRegistry> {
        &self.tools
    }

    pub fn agents(&self) -> &Arc<SkillRegistry> {
        &self.agents
    }

    /// Union of tool and agent schemas.  Agent names never shadow tool names.
    pub fn get_openai_tools(&self) -> Vec<ToolSchema> {
        merge_tools(self.tools.get_schema(), self.agents.get_schema())
    }

    /// For `call_type = "agent:<x>"`, append that agent's live MCP schema.
    /// Any other call type passes through unchanged.
    pub fn maybe_merge_agent_tools(
        &self,
        call_type: &str,
        tools: Option<Vec<ToolSchema>>,
    ) -> Option<Vec<ToolSchema>> {
        let Some(agent_name) = call_type.strip_prefix("agent:") else {
            return tools;
        };
        let Some(toolset) = self.active_mcp_for(agent_name) else {
            return tools;
        };
        let mcp_tools = toolset.get_tools_schema();
        if mcp_tools.is_empty() {
            return tools;
        }
        Some(merge_tools(tools.unwrap_or_default(), mcp_tools))
    }

    pub fn active_mcp_for(&self, agent_name: &str) -> Option<Arc<McpToolset>> {
        let active = match self.active_mcp.lock() {
            Ok(a) => a,
            Err(poisoned) => poisoned.into_inner(),
        };
        active.get(agent_name).cloned()
    }

    /// Execute a tool, agent, or live MCP tool by internal name.
    ///
    /// Ambient request resources are injected into the context before
    /// dispatch; the caller only supplies call-specific entries.
    pub async fn execute_tool(
        &self,
        name: &str,
        args: serde_json::Value,
        context: SkillContext,
    ) -> Result<String, SkillError> {
        let context = context.inherit_ambient();
        let started = std::time::Instant::now();

        let result = if self.agents.contains(name) {
            self.execute_agent(name, args, context).await
        } else if let Some(toolset) = self.find_mcp_owner(name) {
            toolset.execute(name, args).await
        } else {
            self.tools.execute_by_name(name, args, context).await
        };

        match &result {
            Ok(text) => {
                let summary: String = text.chars().take(100).collect();
                info!(
                    name,
                    duration_s = format!("{:.2}", started.elapsed().as_secs_f64()),
                    result = %summary,
                    "tool executed"
                );
            }
            Err(e) => warn!(
                name,
                duration_s = format!("{:.2}", started.elapsed().as_secs_f64()),
                "tool failed: {e}"
            ),
        }
        result
    }

    fn find_mcp_owner(&self, name: &str) -> Option<Arc<McpToolset>> {
        let active = match self.active_mcp.lock() {
            Ok(a) => a,
            Err(poisoned) => poisoned.into_inner(),
        };
        active.values().find(|set| set.contains(name)).cloned()
    }

    async fn execute_agent(
        &self,
        name: &str,
        args: serde_json::Value,
        mut context: SkillContext,
    ) -> Result<String, SkillError> {
        let descriptor = self
            .agents
            .resolve(name)
            .ok_or_else(|| SkillError::Execution(format!("unknown agent: {name}")))?;

        // Bring up the agent's private MCP toolset for this call only.
        let mut mounted_mcp = false;
        if let Some(mcp_path) = &descriptor.mcp_path {
            match McpToolset::initialize(mcp_path, self.http.clone()).await {
                Ok(toolset) => {
                    let count = toolset.get_tools_schema().len();
                    let mut active = match self.active_mcp.lock() {
                        Ok(a) => a,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    active.insert(name.to_string(), Arc::new(toolset));
                    mounted_mcp = true;
                    info!(agent = name, tools = count, "agent MCP toolset mounted");
                }
                Err(e) => warn!(agent = name, "agent MCP init failed: {e}"),
            }
        }

        // Attach this agent's prior exchanges from the request-scoped memory.
        let histories = RequestContext::current()
            .and_then(|ctx| ctx.get_resource::<AgentHistories>("agent_histories"));
        let prior: Vec<(String, String)> = histories
            .as_ref()
            .map(|h| {
                let map = match h.lock() {
                    Ok(m) => m,
                    Err(poisoned) => poisoned.into_inner(),
                };
                map.get(name).cloned().unwrap_or_default()
            })
            .unwrap_or_default();
        debug!(agent = name, history = prior.len(), "agent history attached");
        context.insert("agent_history", Arc::new(prior));
        context.insert("agent_name", Arc::new(name.to_string()));

        let prompt = args
            .get("prompt")
            .and_then(|p| p.as_str())
            .unwrap_or_default()
            .to_string();

        let result = self.agents.execute(&descriptor, args, context).await;

        if mounted_mcp {
            let mut active = match self.active_mcp.lock() {
                Ok(a) => a,
                Err(poisoned) => poisoned.into_inner(),
            };
            active.remove(name);
        }

        if let (Ok(reply), Some(histories)) = (&result, histories) {
            if !prompt.is_empty() && !reply.is_empty() {
                let mut map = match histories.lock() {
                    Ok(m) => m,
                    Err(poisoned) => poisoned.into_inner(),
                };
                let log = map.entry(name.to_string()).or_default();
                log.push((prompt, reply.clone()));
            }
        }
        result
    }

    /// Run configured prefetch tools once per `(request, call_type)` and
    /// prepend their results as a system message after the last leading
    /// system message.  Optionally hides prefetched tools from the schema.
    pub async fn maybe_prefetch_tools(
        &self,
        mut messages: Vec<ChatMessage>,
        mut tools: Option<Vec<ToolSchema>>,
        call_type: &str,
        prefetch_names: &[String],
        hide: bool,
    ) -> (Vec<ChatMessage>, Option<Vec<ToolSchema>>) {
        let Some(available) = tools.as_ref() else {
            return (messages, tools);
        };
        if prefetch_names.is_empty() {
            return (messages, tools);
        }
        let advertised: Vec<&str> = available.iter().map(|t| t.name()).collect();
        let targets: Vec<&String> = prefetch_names
            .iter()
            .filter(|n| advertised.contains(&n.as_str()))
            .collect();
        if targets.is_empty() {
            return (messages, tools);
        }

        // At most once per (request, call_type): the done-set lives in the
        // request context.
        let ctx = RequestContext::current();
        let cache = ctx.as_ref().map(|c| {
            c.get_resource::<StdMutex<HashMap<String, Vec<String>>>>("prefetch_tools")
                .unwrap_or_else(|| {
                    let fresh: Arc<StdMutex<HashMap<String, Vec<String>>>> =
                        Arc::new(StdMutex::new(HashMap::new()));
                    c.set_resource("prefetch_tools", fresh.clone());
                    fresh
                })
        });
        let mut done: Vec<String> = cache
            .as_ref()
            .map(|cache| {
                let map = match cache.lock() {
                    Ok(m) => m,
                    Err(poisoned) => poisoned.into_inner(),
                };
                map.get(call_type).cloned().unwrap_or_default()
            })
            .unwrap_or_default();

        let mut results: Vec<(String, String)> = Vec::new();
        for name in targets {
            if done.contains(name) {
                continue;
            }
            match self
                .execute_tool(name, serde_json::json!({}), SkillContext::new())
                .await
            {
                Ok(result) if is_missing_tool_result(&result) => {
                    warn!(tool = %name, "prefetch target missing, skipping");
                }
                Ok(result) => {
                    results.push((name.clone(), result));
                    done.push(name.clone());
                }
                Err(e) => warn!(tool = %name, "prefetch execution failed: {e}"),
            }
        }
        if results.is_empty() {
            return (messages, tools);
        }

        if let Some(cache) = cache {
            let mut map = match cache.lock() {
                Ok(m) => m,
                Err(poisoned) => poisoned.into_inner(),
            };
            done.sort();
            map.insert(call_type.to_string(), done.clone());
        }

        let mut lines = vec!["【预先工具结果】".to_string()];
        lines.extend(results.iter().map(|(n, r)| format!("- {n}: {r}")));
        let insert_idx = messages
            .iter()
            .position(|m| m.role != Role::System)
            .unwrap_or(messages.len());
        messages.insert(insert_idx, ChatMessage::system(lines.join("\n")));

        if hide {
            if let Some(list) = tools.take() {
                tools = Some(
                    list.into_iter()
                        .filter(|t| !done.contains(&t.name().to_string()))
                        .collect(),
                );
            }
        }
        (messages, tools)
    }
}

fn merge_tools(base: Vec<ToolSchema>, extra: Vec<ToolSchema>) -> Vec<ToolSchema> {
    let mut merged = base;
    let existing: Vec<String> = merged.iter().map(|t| t.name().to_string()).collect();
    for tool in extra {
        if !existing.contains(&tool.name().to_string()) {
            merged.push(tool);
        }
    }
    merged
}

fn is_missing_tool_result(result: &str) -> bool {
    result.starts_with("未找到工具") || result.starts_with("未找到 MCP 工具")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
