// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod descriptor;
mod handler;
mod mcp;
mod registry;

use thiserror::Error;

pub use descriptor::{Permission, RateLimit, SkillDescriptor, SkillKind};
pub use handler::{handler, HandlerFuture, HandlerTable, SkillContext, SkillHandler};
pub use mcp::McpToolset;
pub use registry::{FileStamps, SkillRegistry};

#[derive(Debug, Error)]
pub enum SkillError {
    /// `config.json` / `mcp.json` unreadable or malformed.
    #[error("skill config error: {0}")]
    Config(String),

    /// The handler body failed.  Becomes the textual content of the
    /// corresponding tool message; the loop continues.
    #[error("{0}")]
    Execution(String),

    /// Command issued by an insufficient role.
    #[error("permission denied: {0}")]
    Permission(String),

    /// Command cool-down not elapsed.
    #[error("rate limited: retry in {0}s")]
    RateLimit(u64),
}
