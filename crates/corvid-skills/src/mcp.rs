// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-agent MCP toolsets.
//!
//! An agent directory may carry an `mcp.json` naming HTTP MCP servers.  When
//! that agent is invoked, its toolset is initialized, the tool schemas are
//! merged into the advertised set for the call-type `agent:<name>` only, and
//! the toolset is torn down on return.
//!
//! Tool names are namespaced `"<server>.<tool>"`; the wire sanitizer maps the
//! dot for the model API.
//!
//! ```json
//! { "servers": { "files": { "url": "http://localhost:3100/mcp",
//!                           "tools": [{ "name": "read", "description": "…" }] } } }
//! ```
//!
//! Servers may declare their tools statically (offline-friendly) or leave the
//! list empty, in which case `tools/list` is fetched at initialization.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use corvid_model::ToolSchema;

use crate::SkillError;

#[derive(Debug, Deserialize)]
struct McpConfig {
    #[serde(default)]
    servers: HashMap<String, McpServer>,
}

#[derive(Debug, Deserialize)]
struct McpServer {
    url: String,
    #[serde(default)]
    tools: Vec<McpToolDecl>,
}

#[derive(Debug, Clone, Deserialize)]
struct McpToolDecl {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    parameters: Option<serde_json::Value>,
}

struct BoundTool {
    server: String,
    url: String,
    remote_name: String,
    schema: ToolSchema,
}

/// One agent's live MCP toolset.
pub struct McpToolset {
    client: reqwest::Client,
    tools: Vec<BoundTool>,
}

impl McpToolset {
    /// Parse `mcp.json` and resolve tool schemas.  Servers that fail to
    /// answer `tools/list` contribute only their statically declared tools.
    pub async fn initialize(config_path: &Path, client: reqwest::Client) -> Result<Self, SkillError> {
        let text = std::fs::read_to_string(config_path)
            .map_err(|e| SkillError::Config(format!("{}: {e}", config_path.display())))?;
        let config: McpConfig = serde_json::from_str(&text)
            .map_err(|e| SkillError::Config(format!("{}: {e}", config_path.display())))?;

        let mut tools = Vec::new();
        for (server_name, server) in &config.servers {
            let decls = if server.tools.is_empty() {
                match fetch_tool_list(&client, &server.url).await {
                    Ok(remote) => remote,
                    Err(e) => {
                        warn!(server = %server_name, "MCP tools/list failed: {e}");
                        Vec::new()
                    }
                }
            } else {
                server.tools.clone()
            };
            for decl in decls {
                let namespaced = format!("{server_name}.{}", decl.name);
                let parameters = decl
                    .parameters
                    .unwrap_or_else(|| json!({ "type": "object", "properties": {} }));
                tools.push(BoundTool {
                    server: server_name.clone(),
                    url: server.url.clone(),
                    remote_name: decl.name,
                    schema: ToolSchema::function(&namespaced, &decl.description, parameters),
                });
            }
        }
        info!(
            config = %config_path.display(),
            tools = tools.len(),
            "MCP toolset initialized"
        );
        Ok(Self { client, tools })
    }

    pub fn get_tools_schema(&self) -> Vec<ToolSchema> {
        self.tools.iter().map(|t| t.schema.clone()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.schema.name() == name)
    }

    /// Call a namespaced MCP tool via JSON-RPC `tools/call`.
    pub async fn execute(
        &self,
        name: &str,
        args: serde_json::Value,
    ) -> Result<String, SkillError> {
        let Some(tool) = self.tools.iter().find(|t| t.schema.name() == name) else {
            return Ok(format!("未找到 MCP 工具: {name}"));
        };

        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": { "name": tool.remote_name, "arguments": args },
        });
        let response = self
            .client
            .post(&tool.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| SkillError::Execution(format!("MCP {}: {e}", tool.server)))?;
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SkillError::Execution(format!("MCP {}: {e}", tool.server)))?;

        if let Some(err) = value.get("error") {
            return Err(SkillError::Execution(format!(
                "MCP {} returned error: {err}",
                tool.server
            )));
        }
        Ok(render_call_result(&value["result"]))
    }
}

async fn fetch_tool_list(
    client: &reqwest::Client,
    url: &str,
) -> Result<Vec<McpToolDecl>, SkillError> {
    let body = json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list" });
    let response = client
        .post(url)
        .json(&body)
        .send()
        .await
        .map_err(|e| SkillError::Execution(e.to_string()))?;
    let value: serde_json::Value = response
        .json()
        .await
        .map_err(|e| SkillError::Execution(e.to_string()))?;
    let tools = value["result"]["tools"]
        .as_array()
        .cloned()
        .unwrap_or_default();
    Ok(tools
        .into_iter()
        .filter_map(|t| {
            Some(McpToolDecl {
                name: t["name"].as_str()?.to_string(),
                description: t["description"].as_str().unwrap_or_default().to_string(),
                parameters: t.get("inputSchema").cloned(),
            })
        })
        .collect())
}

/// MCP call results carry `content: [{type: "text", text}]`; fall back to the
/// raw JSON for anything else.
fn render_call_result(result: &serde_json::Value) -> String {
    if let Some(items) = result.get("content").and_then(|c| c.as_array()) {
        let texts: Vec<&str> = items
            .iter()
            .filter(|i| i["type"] == "text")
            .filter_map(|i| i["text"].as_str())
            .collect();
        if !texts.is_empty() {
            return texts.join("\n");
        }
    }
    result.to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
