// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod sanitize;
pub mod tokens;
mod error;
mod mock;
mod pool;
mod requester;
mod types;
mod usage;

pub use error::ModelError;
pub use mock::ScriptedRequester;
pub use pool::ModelSelector;
pub use requester::{build_request_body, chat_completions_url, HttpRequester, ModelRequester};
pub use types::*;
pub use usage::{TokenUsageRecord, TokenUsageStore};
