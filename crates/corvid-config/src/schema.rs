// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so enabled-by-default fields need a named function.
fn default_true() -> bool {
    true
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_thinking_budget() -> u32 {
    4096
}

fn default_ai_request_interval_ms() -> u64 {
    1000
}

fn default_max_iterations() -> u32 {
    1000
}

fn default_skills_root() -> String {
    "skills".into()
}

fn default_hot_reload_interval_secs() -> u64 {
    5
}

fn default_hot_reload_debounce_secs() -> u64 {
    2
}

fn default_tasks_path() -> String {
    "data/scheduler/tasks.json".into()
}

fn default_task_retry_limit() -> u32 {
    2
}

fn default_cognitive_root() -> String {
    "data/cognitive".into()
}

fn default_poll_interval_secs() -> u64 {
    2
}

fn default_job_max_retries() -> u32 {
    3
}

fn default_rewrite_max_retry() -> u32 {
    2
}

fn default_stale_timeout_secs() -> u64 {
    600
}

fn default_failed_cleanup_interval() -> u32 {
    100
}

fn default_failed_max_age_days() -> u32 {
    14
}

fn default_failed_max_files() -> usize {
    200
}

fn default_auto_top_k() -> usize {
    5
}

fn default_revision_keep() -> usize {
    5
}

fn default_source_message_max_len() -> usize {
    800
}

fn default_recent_messages_inject_k() -> usize {
    12
}

fn default_recent_message_line_max_len() -> usize {
    240
}

fn default_max_end_summaries() -> usize {
    10
}

fn default_end_summary_path() -> String {
    "data/end_summaries.json".into()
}

fn default_token_usage_path() -> String {
    "data/token_usage.jsonl".into()
}

fn default_strategy() -> String {
    "round_robin".into()
}

fn default_compare_expire_secs() -> u64 {
    300
}

fn default_preferences_path() -> String {
    "data/model_preferences.json".into()
}

/// Top-level runtime configuration.  Loaded from layered TOML files; every
/// section defaults so a missing file still yields a usable snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub llm_loop: LlmLoopConfig,
    #[serde(default)]
    pub skills: SkillsConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub cognitive: CognitiveConfig,
    #[serde(default)]
    pub model_pool: ModelPoolConfig,
}

impl Config {
    pub fn is_superadmin(&self, user_id: i64) -> bool {
        user_id == self.bot.superadmin_id
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.is_superadmin(user_id) || self.bot.admin_ids.contains(&user_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BotConfig {
    /// The bot's own account id on the chat transport.
    #[serde(default)]
    pub self_id: i64,
    #[serde(default = "BotConfig::default_name")]
    pub name: String,
    #[serde(default)]
    pub superadmin_id: i64,
    #[serde(default)]
    pub admin_ids: Vec<i64>,
}

impl BotConfig {
    fn default_name() -> String {
        "corvid".into()
    }
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            self_id: 0,
            name: Self::default_name(),
            superadmin_id: 0,
            admin_ids: Vec::new(),
        }
    }
}

/// One model endpoint (OpenAI-compatible chat completions).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelEndpoint {
    /// Base URL of the API (a trailing `/chat/completions` is tolerated and
    /// trimmed by the requester).
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model_name: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Request the provider's thinking/reasoning mode.  When set, assistant
    /// messages carrying tool calls must echo `reasoning_content` back.
    #[serde(default)]
    pub thinking_enabled: bool,
    #[serde(default = "default_thinking_budget")]
    pub thinking_budget_tokens: u32,
}

impl Default for ModelEndpoint {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            api_key: String::new(),
            model_name: String::new(),
            max_tokens: default_max_tokens(),
            temperature: None,
            thinking_enabled: false,
            thinking_budget_tokens: default_thinking_budget(),
        }
    }
}

/// The model roles the runtime draws from.
///
/// Scalar fields stay ahead of the per-role tables so the snapshot
/// serializes back to TOML.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelsConfig {
    /// JSONL file that token-usage records are appended to.
    #[serde(default = "default_token_usage_path")]
    pub token_usage_path: String,
    #[serde(default)]
    pub chat: ModelEndpoint,
    #[serde(default)]
    pub vision: ModelEndpoint,
    #[serde(default)]
    pub agent: ModelEndpoint,
    #[serde(default)]
    pub security: ModelEndpoint,
    #[serde(default)]
    pub embedding: ModelEndpoint,
    #[serde(default)]
    pub rerank: ModelEndpoint,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            token_usage_path: default_token_usage_path(),
            chat: ModelEndpoint::default(),
            vision: ModelEndpoint::default(),
            agent: ModelEndpoint::default(),
            security: ModelEndpoint::default(),
            embedding: ModelEndpoint::default(),
            rerank: ModelEndpoint::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// Pause between dequeued items, to pace LLM calls.
    #[serde(default = "default_ai_request_interval_ms")]
    pub ai_request_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            ai_request_interval_ms: default_ai_request_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmLoopConfig {
    /// Hard cap on reasoning/acting rounds for one reply.  Permissive on
    /// purpose: it exists to stop runaway tool chains, not to pace them.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

impl Default for LlmLoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SkillsConfig {
    /// Root directory containing `tools/`, `agents/`, `commands/`.
    #[serde(default = "default_skills_root")]
    pub root: String,
    #[serde(default = "default_true")]
    pub hot_reload: bool,
    #[serde(default = "default_hot_reload_interval_secs")]
    pub hot_reload_interval_secs: u64,
    #[serde(default = "default_hot_reload_debounce_secs")]
    pub hot_reload_debounce_secs: u64,
    /// Tools executed once before the first LLM call of a request; their
    /// results are prepended as a system message.
    #[serde(default)]
    pub prefetch_tools: Vec<String>,
    /// Remove prefetched tools from the advertised schema for the request.
    #[serde(default)]
    pub prefetch_tools_hide: bool,
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            root: default_skills_root(),
            hot_reload: true,
            hot_reload_interval_secs: default_hot_reload_interval_secs(),
            hot_reload_debounce_secs: default_hot_reload_debounce_secs(),
            prefetch_tools: Vec::new(),
            prefetch_tools_hide: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecurityConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    #[serde(default = "default_tasks_path")]
    pub tasks_path: String,
    /// Attempts per tool step in a scheduled batch before it is reported
    /// failed.
    #[serde(default = "default_task_retry_limit")]
    pub task_retry_limit: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tasks_path: default_tasks_path(),
            task_retry_limit: default_task_retry_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CognitiveConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Root for `queue/`, `profiles/`, and the vector database.
    #[serde(default = "default_cognitive_root")]
    pub root: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_job_max_retries")]
    pub job_max_retries: u32,
    /// Extra rewrite attempts after the first when the absoluteness gate
    /// rejects a candidate.
    #[serde(default = "default_rewrite_max_retry")]
    pub rewrite_max_retry: u32,
    #[serde(default = "default_stale_timeout_secs")]
    pub stale_timeout_secs: u64,
    /// Prune `failed/` every N polls (0 disables).
    #[serde(default = "default_failed_cleanup_interval")]
    pub failed_cleanup_interval: u32,
    #[serde(default = "default_failed_max_age_days")]
    pub failed_max_age_days: u32,
    #[serde(default = "default_failed_max_files")]
    pub failed_max_files: usize,
    /// Events injected into the prompt memory block.
    #[serde(default = "default_auto_top_k")]
    pub auto_top_k: usize,
    /// Profile history snapshots kept per entity.
    #[serde(default = "default_revision_keep")]
    pub revision_keep: usize,
    #[serde(default = "default_source_message_max_len")]
    pub historian_source_message_max_len: usize,
    #[serde(default = "default_recent_messages_inject_k")]
    pub historian_recent_messages_inject_k: usize,
    #[serde(default = "default_recent_message_line_max_len")]
    pub historian_recent_message_line_max_len: usize,
    #[serde(default = "default_max_end_summaries")]
    pub max_end_summaries: usize,
    #[serde(default = "default_end_summary_path")]
    pub end_summary_path: String,
}

impl Default for CognitiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: default_cognitive_root(),
            poll_interval_secs: default_poll_interval_secs(),
            job_max_retries: default_job_max_retries(),
            rewrite_max_retry: default_rewrite_max_retry(),
            stale_timeout_secs: default_stale_timeout_secs(),
            failed_cleanup_interval: default_failed_cleanup_interval(),
            failed_max_age_days: default_failed_max_age_days(),
            failed_max_files: default_failed_max_files(),
            auto_top_k: default_auto_top_k(),
            revision_keep: default_revision_keep(),
            historian_source_message_max_len: default_source_message_max_len(),
            historian_recent_messages_inject_k: default_recent_messages_inject_k(),
            historian_recent_message_line_max_len: default_recent_message_line_max_len(),
            max_end_summaries: default_max_end_summaries(),
            end_summary_path: default_end_summary_path(),
        }
    }
}

/// Scalar fields stay ahead of the `models` array-of-tables so the snapshot
/// serializes back to TOML.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelPoolConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default = "default_compare_expire_secs")]
    pub compare_expire_secs: u64,
    #[serde(default = "default_preferences_path")]
    pub preferences_path: String,
    /// Extra chat models available for per-user selection, in addition to
    /// `models.chat`.
    #[serde(default)]
    pub models: Vec<ModelEndpoint>,
}

impl Default for ModelPoolConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            strategy: default_strategy(),
            compare_expire_secs: default_compare_expire_secs(),
            preferences_path: default_preferences_path(),
            models: Vec::new(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
