// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Skill descriptors and `config.json` parsing.
//!
//! All three kinds share one on-disk shape: a subdirectory holding a
//! `config.json` and a `handler.*` file.  Tool and agent configs carry the
//! OpenAI `function` block; commands carry top-level `name`/`description`
//! plus usage/example strings.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::SkillError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkillKind {
    Tool,
    Agent,
    Command,
}

impl SkillKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tool => "tool",
            Self::Agent => "agent",
            Self::Command => "command",
        }
    }

    /// Subdirectory name under the skills root.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Tool => "tools",
            Self::Agent => "agents",
            Self::Command => "commands",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    #[default]
    Public,
    Admin,
    Superadmin,
}

/// Per-role command cool-downs, in seconds.  0 means no limit.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
pub struct RateLimit {
    #[serde(default)]
    pub user: u64,
    #[serde(default)]
    pub admin: u64,
    #[serde(default)]
    pub superadmin: u64,
}

fn default_true() -> bool {
    true
}

fn default_order() -> i64 {
    100
}

/// Raw `config.json` shape shared by all kinds.
#[derive(Debug, Clone, Deserialize)]
struct RawConfig {
    #[serde(default)]
    function: Option<RawFunction>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    usage: Option<String>,
    #[serde(default)]
    example: Option<String>,
    #[serde(default)]
    permission: Permission,
    #[serde(default)]
    rate_limit: RateLimit,
    #[serde(default = "default_true")]
    show_in_help: bool,
    #[serde(default = "default_order")]
    order: i64,
    #[serde(default)]
    aliases: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawFunction {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    parameters: Option<serde_json::Value>,
}

/// One discovered skill.
#[derive(Debug, Clone)]
pub struct SkillDescriptor {
    pub name: String,
    pub kind: SkillKind,
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters: serde_json::Value,
    pub permission: Permission,
    pub rate_limit: RateLimit,
    pub show_in_help: bool,
    pub order: i64,
    pub aliases: Vec<String>,
    pub usage: Option<String>,
    pub example: Option<String>,
    /// Directory the skill was discovered in.
    pub dir: PathBuf,
    pub handler_path: PathBuf,
    /// `prompt.md` next to an agent handler, if present.
    pub prompt_path: Option<PathBuf>,
    /// `mcp.json` next to an agent handler, if present.
    pub mcp_path: Option<PathBuf>,
}

impl SkillDescriptor {
    /// Parse a skill directory.  `Ok(None)` means "not a skill" (no config or
    /// no handler); malformed configs are errors so the loader can log them.
    pub fn from_dir(kind: SkillKind, dir: &Path) -> Result<Option<Self>, SkillError> {
        let config_path = dir.join("config.json");
        let Some(handler_path) = find_handler(dir) else {
            return Ok(None);
        };
        if !config_path.is_file() {
            return Ok(None);
        }

        let text = std::fs::read_to_string(&config_path)
            .map_err(|e| SkillError::Config(format!("{}: {e}", config_path.display())))?;
        let raw: RawConfig = serde_json::from_str(&text)
            .map_err(|e| SkillError::Config(format!("{}: {e}", config_path.display())))?;

        let (name, description, parameters) = match (&raw.function, &raw.name) {
            (Some(f), _) => (
                f.name.clone(),
                f.description.clone(),
                f.parameters
                    .clone()
                    .unwrap_or_else(|| serde_json::json!({ "type": "object", "properties": {} })),
            ),
            (None, Some(n)) => (
                n.clone(),
                raw.description.clone().unwrap_or_default(),
                serde_json::json!({ "type": "object", "properties": {} }),
            ),
            (None, None) => {
                return Err(SkillError::Config(format!(
                    "{}: missing function.name / name",
                    config_path.display()
                )))
            }
        };

        let prompt_path = existing(dir.join("prompt.md"));
        let mcp_path = existing(dir.join("mcp.json"));

        Ok(Some(Self {
            name,
            kind,
            description,
            parameters,
            permission: raw.permission,
            rate_limit: raw.rate_limit,
            show_in_help: raw.show_in_help,
            order: raw.order,
            aliases: raw.aliases,
            usage: raw.usage,
            example: raw.example,
            dir: dir.to_path_buf(),
            handler_path,
            prompt_path,
            mcp_path,
        }))
    }
}

fn existing(path: PathBuf) -> Option<PathBuf> {
    path.is_file().then_some(path)
}

/// A skill directory must contain a `handler.*` file (the plug-in marker).
fn find_handler(dir: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file() {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if stem == "handler" {
                    return Some(path);
                }
            }
        }
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
