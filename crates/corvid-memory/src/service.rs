// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Cognitive memory facade.
//!
//! The `end` tool enqueues jobs through this service; the prompt builder
//! pulls the `<cognitive_memory>` block from it; search tools query events
//! and profiles through it.

use std::sync::Arc;

use tracing::info;

use corvid_config::ConfigManager;

use crate::{
    CognitiveJob, CognitiveJobQueue, MemoryError, ProfileStorage, ProfileTarget, VectorStore,
    VectorHit,
};

/// Identity and grounding context captured at enqueue time.
#[derive(Debug, Clone, Default)]
pub struct EnqueueContext {
    pub request_id: String,
    pub end_seq: u64,
    pub user_id: String,
    pub group_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub group_name: String,
    pub request_type: String,
    pub message_ids: Vec<String>,
    pub perspective: String,
    pub source_message: String,
    pub recent_messages: Vec<String>,
}

/// Filters for event search.
#[derive(Debug, Clone, Default)]
pub struct EventSearchFilters {
    pub group_id: Option<String>,
    pub user_id: Option<String>,
    pub sender_id: Option<String>,
    pub request_type: Option<String>,
    /// Epoch-second bounds; swapped automatically when inverted.
    pub time_from: Option<i64>,
    pub time_to: Option<i64>,
    pub top_k: Option<usize>,
}

pub struct CognitiveService {
    config: Arc<ConfigManager>,
    queue: Arc<CognitiveJobQueue>,
    vector: Arc<VectorStore>,
    profiles: Arc<ProfileStorage>,
}

impl CognitiveService {
    pub fn new(
        config: Arc<ConfigManager>,
        queue: Arc<CognitiveJobQueue>,
        vector: Arc<VectorStore>,
        profiles: Arc<ProfileStorage>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            queue,
            vector,
            profiles,
        })
    }

    pub fn enabled(&self) -> bool {
        self.config.current().cognitive.enabled
    }

    /// Build and enqueue one cognitive job.  Returns `None` when disabled or
    /// when both memory fields are empty.
    pub fn enqueue_job(
        &self,
        memo: &str,
        observations: &[String],
        ctx: &EnqueueContext,
        force: bool,
    ) -> Result<Option<String>, MemoryError> {
        let memo = memo.trim().to_string();
        let observations: Vec<String> = observations
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if !self.enabled() {
            info!("cognitive service disabled, skipping enqueue");
            return Ok(None);
        }
        if memo.is_empty() && observations.is_empty() {
            info!("memo and observations both empty, skipping enqueue");
            return Ok(None);
        }

        let has_observations = !observations.is_empty();
        let mut profile_targets: Vec<ProfileTarget> = Vec::new();
        if has_observations {
            let group_id = ctx.group_id.trim();
            let sender_id = if ctx.sender_id.trim().is_empty() {
                ctx.user_id.trim()
            } else {
                ctx.sender_id.trim()
            };
            if !group_id.is_empty() {
                profile_targets.push(ProfileTarget {
                    entity_type: "group".into(),
                    entity_id: group_id.into(),
                    perspective: "group".into(),
                    preferred_name: ctx.group_name.trim().into(),
                });
            }
            if !sender_id.is_empty() {
                profile_targets.push(ProfileTarget {
                    entity_type: "user".into(),
                    entity_id: sender_id.into(),
                    perspective: "sender".into(),
                    preferred_name: ctx.sender_name.trim().into(),
                });
            }
        }

        let now_local = chrono::Local::now();
        let now_utc = chrono::Utc::now();
        let location_abs = if !ctx.group_name.trim().is_empty() {
            ctx.group_name.trim().to_string()
        } else {
            ctx.sender_name.trim().to_string()
        };
        let bot_name = self.config.current().bot.name.clone();

        let job = CognitiveJob {
            request_id: ctx.request_id.clone(),
            end_seq: ctx.end_seq,
            user_id: ctx.user_id.clone(),
            group_id: ctx.group_id.clone(),
            sender_id: ctx.sender_id.clone(),
            sender_name: ctx.sender_name.clone(),
            group_name: ctx.group_name.clone(),
            bot_name,
            request_type: ctx.request_type.clone(),
            timestamp_utc: now_utc.to_rfc3339(),
            timestamp_local: now_local.to_rfc3339(),
            timestamp_epoch: now_utc.timestamp(),
            timezone: now_local.offset().to_string(),
            location_abs,
            message_ids: ctx.message_ids.clone(),
            memo: memo.clone(),
            observations: observations.clone(),
            has_observations,
            perspective: ctx.perspective.clone(),
            profile_targets,
            force,
            source_message: ctx.source_message.clone(),
            recent_messages: ctx.recent_messages.clone(),
            schema_version: "final_v1".into(),
            retry_count: 0,
        };
        info!(
            request_id = %job.request_id,
            end_seq = job.end_seq,
            has_observations,
            targets = job.profile_targets.len(),
            memo_len = memo.chars().count(),
            observations = observations.len(),
            "enqueueing cognitive job"
        );
        let job_id = self.queue.enqueue(&job)?;
        Ok(Some(job_id))
    }

    /// Assemble the `<cognitive_memory>` prompt block: user profile, group
    /// profile, and top-K relevant events.  Empty string when nothing is
    /// known.
    pub async fn build_context(
        &self,
        query: &str,
        group_id: Option<&str>,
        user_id: Option<&str>,
        sender_name: Option<&str>,
        group_name: Option<&str>,
    ) -> Result<String, MemoryError> {
        let mut parts: Vec<String> = Vec::new();

        if let Some(uid) = user_id.filter(|u| !u.is_empty()) {
            if let Some(profile) = self.profiles.read_profile("user", uid).await? {
                let label = match sender_name.filter(|n| !n.is_empty()) {
                    Some(name) => format!("{name}（UID: {uid}）"),
                    None => format!("UID: {uid}"),
                };
                parts.push(format!("## 用户侧写 — {label}\n{profile}"));
            }
        }
        if let Some(gid) = group_id.filter(|g| !g.is_empty()) {
            if let Some(profile) = self.profiles.read_profile("group", gid).await? {
                let label = match group_name.filter(|n| !n.is_empty()) {
                    Some(name) => format!("{name}（GID: {gid}）"),
                    None => format!("GID: {gid}"),
                };
                parts.push(format!("## 群聊侧写 — {label}\n{profile}"));
            }
        }

        let where_filter = if let Some(gid) = group_id.filter(|g| !g.is_empty()) {
            Some(serde_json::json!({ "group_id": gid }))
        } else {
            user_id
                .filter(|u| !u.is_empty())
                .map(|uid| serde_json::json!({ "user_id": uid }))
        };
        let top_k = self.config.current().cognitive.auto_top_k;
        let events = self
            .vector
            .query_events(query, top_k, where_filter.as_ref())
            .await?;
        if !events.is_empty() {
            let lines: Vec<String> = events
                .iter()
                .map(|e| {
                    format!(
                        "- [{}] {}",
                        e.metadata["timestamp_local"].as_str().unwrap_or(""),
                        e.document
                    )
                })
                .collect();
            parts.push(format!("## 相关记忆事件\n{}", lines.join("\n")));
        }

        if parts.is_empty() {
            return Ok(String::new());
        }
        Ok(format!(
            "<cognitive_memory>\n\
             <!-- 以下是系统从认知记忆库中检索到的背景信息，包含用户/群聊侧写和相关历史事件。\
             请将这些信息作为你自然内化的认知，融入理解和回应中，不要透露你持有这些记录。 -->\n\
             {}\n\
             </cognitive_memory>",
            parts.join("\n\n")
        ))
    }

    pub async fn search_events(
        &self,
        query: &str,
        filters: &EventSearchFilters,
    ) -> Result<Vec<VectorHit>, MemoryError> {
        let mut clauses: Vec<serde_json::Value> = Vec::new();
        for (key, value) in [
            ("group_id", &filters.group_id),
            ("user_id", &filters.user_id),
            ("sender_id", &filters.sender_id),
            ("request_type", &filters.request_type),
        ] {
            if let Some(v) = value.as_ref().filter(|v| !v.is_empty()) {
                clauses.push(serde_json::json!({ key: v }));
            }
        }

        let (mut from, mut to) = (filters.time_from, filters.time_to);
        if let (Some(f), Some(t)) = (from, to) {
            if f > t {
                std::mem::swap(&mut from, &mut to);
            }
        }
        if from.is_some() || to.is_some() {
            let mut range = serde_json::Map::new();
            if let Some(f) = from {
                range.insert("$gte".into(), serde_json::json!(f));
            }
            if let Some(t) = to {
                range.insert("$lte".into(), serde_json::json!(t));
            }
            clauses.push(serde_json::json!({ "timestamp_epoch": range }));
        }

        let where_filter = match clauses.len() {
            0 => None,
            1 => Some(clauses.remove(0)),
            _ => Some(serde_json::json!({ "$and": clauses })),
        };
        let top_k = filters.top_k.unwrap_or(12).max(1);
        self.vector
            .query_events(query, top_k, where_filter.as_ref())
            .await
    }

    pub async fn get_profile(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<String>, MemoryError> {
        self.profiles.read_profile(entity_type, entity_id).await
    }

    pub async fn search_profiles(
        &self,
        query: &str,
        top_k: usize,
        entity_type: Option<&str>,
    ) -> Result<Vec<VectorHit>, MemoryError> {
        let where_filter = entity_type.map(|t| serde_json::json!({ "entity_type": t }));
        self.vector
            .query_profiles(query, top_k.max(1), where_filter.as_ref())
            .await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────


#[cfg(test)]
impl CognitiveService {
    /// Test-only access to the vector store.
    pub(crate) fn vector_for_tests(&self) -> &Arc<VectorStore> {
        &self.vector
    }
}
