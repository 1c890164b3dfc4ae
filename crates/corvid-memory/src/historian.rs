// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The background historian.
//!
//! Polls the durable queue and, per job: rewrites each observation into an
//! absolute canonical event (bounded gate retries with categorized feedback),
//! upserts the events into the vector collection, and merges updated facts
//! into every profile target.  Any processing error requeues the job until
//! `job_max_retries`, then moves it to `failed/` with the payload intact.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use corvid_config::ConfigManager;
use corvid_model::{
    ChatMessage, ChatRequest, ChatResponse, ModelRequester, ToolChoice, ToolSchema,
};

use crate::{
    gate, profile, CognitiveJob, CognitiveJobQueue, MemoryError, ProfileStorage, ProfileTarget,
    VectorStore,
};

fn rewrite_tool() -> ToolSchema {
    ToolSchema::function(
        "submit_rewrite",
        "提交绝对化改写后的事件文本",
        serde_json::json!({
            "type": "object",
            "properties": {
                "text": { "type": "string", "description": "改写后的纯文本" }
            },
            "required": ["text"]
        }),
    )
}

fn profile_tool() -> ToolSchema {
    ToolSchema::function(
        "update_profile",
        "更新用户/群侧写",
        serde_json::json!({
            "type": "object",
            "properties": {
                "skip": { "type": "boolean", "description": "是否跳过更新；当新信息不稳定/不足时为 true" },
                "skip_reason": { "type": "string", "description": "跳过原因" },
                "name": { "type": "string", "description": "用户/群名称" },
                "tags": {
                    "type": "array",
                    "items": { "type": "string" },
                    "maxItems": 10,
                    "description": "身份级标签（角色/核心领域），最多 10 个，不写话题"
                },
                "summary": { "type": "string", "description": "侧写正文（Markdown）" }
            },
            "required": ["skip", "name", "tags", "summary"]
        }),
    )
}

fn preview(text: &str) -> String {
    let compact: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if compact.chars().count() <= 200 {
        compact
    } else {
        let clipped: String = compact.chars().take(200).collect();
        format!("{clipped}...")
    }
}

pub struct HistorianWorker {
    queue: Arc<CognitiveJobQueue>,
    vector: Arc<VectorStore>,
    profiles: Arc<ProfileStorage>,
    requester: Arc<dyn ModelRequester>,
    config: Arc<ConfigManager>,
}

/// Handle to a running worker; `stop` is cooperative (the current job
/// finishes first).
pub struct HistorianHandle {
    stop_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl HistorianHandle {
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.task.await;
    }
}

impl HistorianWorker {
    pub fn new(
        queue: Arc<CognitiveJobQueue>,
        vector: Arc<VectorStore>,
        profiles: Arc<ProfileStorage>,
        requester: Arc<dyn ModelRequester>,
        config: Arc<ConfigManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            vector,
            profiles,
            requester,
            config,
        })
    }

    /// Start the poll loop.
    pub fn spawn(self: &Arc<Self>) -> HistorianHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let worker = self.clone();
        let task = tokio::spawn(async move {
            worker.poll_loop(stop_rx).await;
        });
        info!("historian worker started");
        HistorianHandle { stop_tx, task }
    }

    async fn poll_loop(&self, mut stop_rx: watch::Receiver<bool>) {
        let mut poll_count: u64 = 0;
        let mut empty_streak: u32 = 0;
        loop {
            if *stop_rx.borrow() {
                break;
            }
            match self.run_once().await {
                Ok(true) => empty_streak = 0,
                Ok(false) => empty_streak = (empty_streak + 1).min(3),
                Err(e) => warn!("historian poll error: {e}"),
            }

            poll_count += 1;
            let cognitive = self.config.current().cognitive.clone();
            if cognitive.failed_cleanup_interval > 0
                && poll_count % u64::from(cognitive.failed_cleanup_interval) == 0
            {
                let max_age = Duration::from_secs(u64::from(cognitive.failed_max_age_days) * 86_400);
                match self.queue.cleanup_failed(max_age, cognitive.failed_max_files) {
                    Ok(removed) if removed > 0 => {
                        info!(removed, "failed queue pruned");
                    }
                    Ok(_) => {}
                    Err(e) => warn!("failed queue cleanup error: {e}"),
                }
            }

            // Exponential-capped idle backoff: 1x, 2x, 4x, 8x poll interval.
            let sleep = Duration::from_secs(cognitive.poll_interval_secs)
                * 2u32.saturating_pow(empty_streak);
            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = tokio::time::sleep(sleep) => {}
            }
        }
        info!("historian worker stopped");
    }

    /// Dequeue and process at most one job, applying the retry policy.
    /// Returns whether a job was handled.
    pub async fn run_once(&self) -> Result<bool, MemoryError> {
        let Some((job_id, job)) = self.queue.dequeue()? else {
            return Ok(false);
        };
        if let Err(e) = self.process_job(&job_id, &job).await {
            let max_retries = self.config.current().cognitive.job_max_retries;
            if job.retry_count < max_retries {
                warn!(
                    job_id = %job_id,
                    attempt = job.retry_count + 1,
                    max_retries,
                    "job processing failed, requeueing: {e}"
                );
                self.queue.requeue(&job_id, &e.to_string())?;
            } else {
                warn!(job_id = %job_id, max_retries, "job exhausted retries: {e}");
                self.queue.fail(&job_id, &e.to_string())?;
            }
        }
        Ok(true)
    }

    /// The per-job pipeline.  Completes the job on success; the caller maps
    /// errors to requeue/fail.
    pub async fn process_job(&self, job_id: &str, job: &CognitiveJob) -> Result<(), MemoryError> {
        info!(
            job_id = %job_id,
            user = %job.user_id,
            group = %job.group_id,
            sender = %job.sender_id,
            perspective = %job.perspective,
            has_observations = job.has_observations,
            profile_targets = job.profile_targets.len(),
            "processing cognitive job"
        );

        let items = job.observation_items();
        // A memo-only job still canonicalizes one virtual item so the action
        // itself is retrievable later.
        let work_items: Vec<Option<String>> = if !items.is_empty() {
            items.iter().cloned().map(Some).collect()
        } else if !job.memo.trim().is_empty() {
            vec![None]
        } else {
            Vec::new()
        };
        let multiple = work_items.len() > 1;

        let mut canonicals: Vec<String> = Vec::new();
        for (idx, observation) in work_items.iter().enumerate() {
            let event_id = if multiple {
                format!("{job_id}_{idx}")
            } else {
                job_id.to_string()
            };
            let obs_text = observation.as_deref().unwrap_or("");
            let (canonical, is_absolute) =
                self.rewrite_and_validate(job, obs_text, &event_id).await?;

            let metadata = serde_json::json!({
                "request_id": job.request_id,
                "end_seq": job.end_seq,
                "user_id": job.user_id,
                "group_id": job.group_id,
                "sender_id": job.sender_id,
                "request_type": job.request_type,
                "timestamp_utc": job.timestamp_utc,
                "timestamp_local": job.timestamp_local,
                "timestamp_epoch": job.resolve_timestamp_epoch(),
                "timezone": job.timezone,
                "location_abs": job.location_abs,
                "message_ids": job.message_ids,
                "perspective": job.perspective,
                "schema_version": job.schema_version,
                "has_observations": observation.is_some(),
                "is_absolute": is_absolute,
            });
            self.vector
                .upsert_event(&event_id, &canonical, metadata)
                .await?;
            info!(
                event_id = %event_id,
                index = idx + 1,
                total = work_items.len(),
                is_absolute,
                len = canonical.chars().count(),
                "event stored"
            );
            canonicals.push(canonical);
        }

        if job.has_observations && !items.is_empty() && !canonicals.is_empty() {
            let merged = canonicals.join("\n");
            self.merge_profiles(job, &merged, job_id).await;
        }

        self.queue.complete(job_id)?;
        info!(job_id = %job_id, "cognitive job complete");
        Ok(())
    }

    /// Rewrite one observation and run the absoluteness gate, retrying with
    /// feedback up to `rewrite_max_retry` extra attempts.
    /// Returns `(canonical_text, is_absolute)`.
    async fn rewrite_and_validate(
        &self,
        job: &CognitiveJob,
        observation: &str,
        event_id: &str,
    ) -> Result<(String, bool), MemoryError> {
        let rewrite_max_retry = self.config.current().cognitive.rewrite_max_retry;

        let mut identity: Vec<String> = vec![
            job.sender_id.clone(),
            job.user_id.clone(),
            job.group_id.clone(),
        ];
        identity.extend(job.message_ids.iter().cloned());
        let must_keep = gate::source_entity_ids(&job.memo, observation, &identity);

        let mut canonical = self
            .rewrite(job, observation, event_id, 1, &must_keep, None, None)
            .await?;
        let mut is_absolute = true;

        for attempt in 0..=rewrite_max_retry {
            let hits = gate::collect_regex_hits(&canonical);
            let drift = gate::entity_id_drift(&must_keep, &canonical);
            if hits.is_empty() && drift.is_empty() {
                break;
            }
            if job.force && !hits.is_empty() && drift.is_empty() {
                is_absolute = false;
                warn!(
                    event_id = %event_id,
                    ?hits,
                    preview = %preview(&canonical),
                    "force=true, bypassing regex gate"
                );
                break;
            }
            if attempt < rewrite_max_retry {
                let feedback = gate::build_gate_feedback(&hits, &drift, job.force);
                warn!(
                    event_id = %event_id,
                    attempt = attempt + 1,
                    max = rewrite_max_retry + 1,
                    ?hits,
                    ?drift,
                    preview = %preview(&canonical),
                    "absoluteness gate hit, retrying rewrite"
                );
                canonical = self
                    .rewrite(
                        job,
                        observation,
                        event_id,
                        attempt + 2,
                        &must_keep,
                        Some(&feedback),
                        Some(&canonical),
                    )
                    .await?;
            } else {
                is_absolute = false;
                warn!(
                    event_id = %event_id,
                    ?hits,
                    ?drift,
                    preview = %preview(&canonical),
                    "gate exhausted, storing degraded event"
                );
            }
        }
        Ok((canonical, is_absolute))
    }

    async fn rewrite(
        &self,
        job: &CognitiveJob,
        observation: &str,
        event_id: &str,
        attempt: u32,
        must_keep: &[String],
        gate_feedback: Option<&str>,
        previous: Option<&str>,
    ) -> Result<String, MemoryError> {
        debug!(
            event_id = %event_id,
            attempt,
            memo_len = job.memo.chars().count(),
            observation_len = observation.chars().count(),
            "requesting absolute rewrite"
        );
        let prompt = build_rewrite_prompt(job, observation, must_keep, gate_feedback, previous);
        let model = self.config.current().models.agent.clone();
        let req = ChatRequest::new("historian_rewrite", vec![ChatMessage::user(prompt)])
            .with_tools(vec![rewrite_tool()])
            .with_tool_choice(ToolChoice::Function("submit_rewrite".into()));
        let response = self.requester.request(&model, req).await?;
        let args =
            extract_required_tool_args(&response, "submit_rewrite", "historian_rewrite", event_id)?;
        let text = args["text"].as_str().unwrap_or("").trim().to_string();
        debug!(
            event_id = %event_id,
            attempt,
            len = text.chars().count(),
            preview = %preview(&text),
            "rewrite candidate received"
        );
        Ok(text)
    }

    async fn merge_profiles(&self, job: &CognitiveJob, canonical: &str, event_id: &str) {
        let targets = resolve_profile_targets(job);
        if targets.is_empty() {
            warn!(event_id = %event_id, "profile merge skipped: no targets");
            return;
        }
        info!(event_id = %event_id, targets = targets.len(), "merging profiles");
        let mut success = 0usize;
        for (index, target) in targets.iter().enumerate() {
            match self
                .merge_profile_target(job, canonical, event_id, target, index + 1, targets.len())
                .await
            {
                Ok(true) => success += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    event_id = %event_id,
                    target = %format!("{}:{}", target.entity_type, target.entity_id),
                    perspective = %target.perspective,
                    "profile target merge failed: {e}"
                ),
            }
        }
        info!(event_id = %event_id, success, total = targets.len(), "profile merge done");
    }

    async fn merge_profile_target(
        &self,
        job: &CognitiveJob,
        canonical: &str,
        event_id: &str,
        target: &ProfileTarget,
        target_index: usize,
        target_count: usize,
    ) -> Result<bool, MemoryError> {
        if !target.is_valid() {
            warn!(event_id = %event_id, ?target, "invalid profile target skipped");
            return Ok(false);
        }
        info!(
            event_id = %event_id,
            index = target_index,
            total = target_count,
            entity_type = %target.entity_type,
            entity_id = %target.entity_id,
            perspective = %target.perspective,
            "merging profile target"
        );

        let current = self
            .profiles
            .read_profile(&target.entity_type, &target.entity_id)
            .await?
            .unwrap_or_else(|| "（暂无侧写）".to_string());
        let effective_name = resolve_profile_name(target, &current);

        let prompt = build_profile_merge_prompt(job, canonical, target, &current, &effective_name, event_id);
        let model = self.config.current().models.agent.clone();
        let req = ChatRequest::new("historian_profile_merge", vec![ChatMessage::user(prompt)])
            .with_tools(vec![profile_tool()])
            .with_tool_choice(ToolChoice::Function("update_profile".into()));
        let response = self.requester.request(&model, req).await?;
        let args = extract_required_tool_args(
            &response,
            "update_profile",
            "historian_profile_merge",
            event_id,
        )?;

        if args["skip"].as_bool().unwrap_or(false) {
            info!(
                event_id = %event_id,
                entity = %format!("{}:{}", target.entity_type, target.entity_id),
                reason = %args["skip_reason"].as_str().unwrap_or("unspecified"),
                "profile update skipped by model"
            );
            return Ok(false);
        }
        let summary = args["summary"].as_str().unwrap_or("").trim().to_string();
        if summary.is_empty() {
            info!(
                event_id = %event_id,
                entity = %format!("{}:{}", target.entity_type, target.entity_id),
                "profile update skipped: empty summary"
            );
            return Ok(false);
        }

        let mut tags: Vec<String> = args["tags"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|t| t.as_str())
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        tags.truncate(10);

        // The model's returned name is observed but never written back.
        let llm_name = args["name"].as_str().unwrap_or("").trim();
        if !llm_name.is_empty() && llm_name != effective_name {
            info!(
                event_id = %event_id,
                llm_name,
                effective_name = %effective_name,
                "profile name locked to effective name"
            );
        }

        let frontmatter = profile::ProfileFrontmatter {
            entity_type: target.entity_type.clone(),
            entity_id: target.entity_id.clone(),
            name: effective_name.clone(),
            tags: tags.clone(),
            updated_at: chrono::Local::now().to_rfc3339(),
            source_event_id: event_id.to_string(),
        };
        let content = profile::compose_profile(&frontmatter, &summary);
        self.profiles
            .write_profile(&target.entity_type, &target.entity_id, &content)
            .await?;

        let profile_doc = if tags.is_empty() {
            summary.clone()
        } else {
            format!("标签: {}\n{summary}", tags.join(", "))
        };
        self.vector
            .upsert_profile(
                &format!("{}:{}", target.entity_type, target.entity_id),
                &profile_doc,
                serde_json::json!({
                    "entity_type": target.entity_type,
                    "entity_id": target.entity_id,
                    "name": effective_name,
                }),
            )
            .await?;
        info!(
            event_id = %event_id,
            entity = %format!("{}:{}", target.entity_type, target.entity_id),
            ?tags,
            "profile written"
        );
        Ok(true)
    }
}

/// Pull the forced tool call's arguments out of a response, validating the
/// expected shape.  Any mismatch is a validation error, which the retry
/// policy treats like any other processing failure.
fn extract_required_tool_args(
    response: &ChatResponse,
    expected_tool: &str,
    stage: &str,
    job_id: &str,
) -> Result<serde_json::Value, MemoryError> {
    let message = response.message();
    let calls = message
        .tool_calls
        .as_ref()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| {
            MemoryError::Validation(format!("{stage}: response missing tool_calls (job={job_id})"))
        })?;
    let call = &calls[0];
    let internal_name = response
        .tool_name_map
        .as_ref()
        .map(|m| m.internal_name(&call.function.name).to_string())
        .unwrap_or_else(|| call.function.name.clone());
    if internal_name != expected_tool {
        return Err(MemoryError::Validation(format!(
            "{stage}: tool name mismatch, expected {expected_tool}, got {internal_name} (job={job_id})"
        )));
    }
    let args: serde_json::Value = serde_json::from_str(&call.function.arguments).map_err(|e| {
        MemoryError::Validation(format!("{stage}: tool arguments not valid JSON: {e} (job={job_id})"))
    })?;
    if !args.is_object() {
        return Err(MemoryError::Validation(format!(
            "{stage}: tool arguments not an object (job={job_id})"
        )));
    }
    Ok(args)
}

/// Legacy jobs without explicit targets fall back to the single implicit
/// target (the group if any, else the sender/user).
fn resolve_profile_targets(job: &CognitiveJob) -> Vec<ProfileTarget> {
    let mut targets: Vec<ProfileTarget> = Vec::new();
    let mut seen: Vec<(String, String)> = Vec::new();
    for target in &job.profile_targets {
        if !target.is_valid() {
            continue;
        }
        let key = (target.entity_type.clone(), target.entity_id.clone());
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);
        targets.push(target.clone());
    }
    if !targets.is_empty() {
        return targets;
    }

    let (entity_type, entity_id) = if !job.group_id.trim().is_empty() {
        ("group", job.group_id.trim().to_string())
    } else {
        let id = if !job.user_id.trim().is_empty() {
            job.user_id.trim().to_string()
        } else {
            job.sender_id.trim().to_string()
        };
        ("user", id)
    };
    if entity_id.is_empty() {
        return Vec::new();
    }
    vec![ProfileTarget {
        entity_type: entity_type.into(),
        entity_id,
        perspective: "legacy".into(),
        preferred_name: String::new(),
    }]
}

/// Effective display name: `preferred_name` > frontmatter `name` >
/// synthesized `UID:`/`GID:` placeholder.
fn resolve_profile_name(target: &ProfileTarget, current_profile: &str) -> String {
    let preferred = target.preferred_name.trim();
    if !preferred.is_empty() {
        return preferred.to_string();
    }
    let current = profile::extract_frontmatter_name(current_profile);
    if !current.is_empty() {
        return current;
    }
    if target.entity_type == "group" {
        format!("GID:{}", target.entity_id)
    } else {
        format!("UID:{}", target.entity_id)
    }
}

fn build_rewrite_prompt(
    job: &CognitiveJob,
    observation: &str,
    must_keep: &[String],
    gate_feedback: Option<&str>,
    previous: Option<&str>,
) -> String {
    let message_ids = if job.message_ids.is_empty() {
        "[]".to_string()
    } else {
        job.message_ids.join(", ")
    };
    let targets = if job.profile_targets.is_empty() {
        "[]".to_string()
    } else {
        job.profile_targets
            .iter()
            .filter(|t| t.is_valid())
            .map(|t| {
                if t.perspective.is_empty() {
                    format!("{}:{}", t.entity_type, t.entity_id)
                } else {
                    format!("{}:{}({})", t.entity_type, t.entity_id, t.perspective)
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    };
    let recent = if job.recent_messages.is_empty() {
        "（无）".to_string()
    } else {
        job.recent_messages
            .iter()
            .map(|line| format!("- {line}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let source_message = if job.source_message.trim().is_empty() {
        "（无）"
    } else {
        job.source_message.trim()
    };

    let mut prompt = format!(
        "你是记忆史官，负责把对话中的行动摘要与新信息改写为【绝对化】的事件文本。\n\
         绝对化要求：不含任何代词（我/你/他/她/它/他们…），不含相对时间（今天/昨天/刚才…），\
         不含相对地点（这里/那边…）；所有人物用 昵称(数字ID) 表示，时间用完整的本地时间，\
         地点用群名(群号) 或 私聊对象名。原文中出现的数字ID必须原样保留。\n\n\
         【上下文】\n\
         - request_id: {request_id}\n\
         - end_seq: {end_seq}\n\
         - 本地时间: {timestamp_local}（时区 {timezone}）\n\
         - 机器人名称: {bot_name}\n\
         - user_id: {user_id}\n\
         - group_id: {group_id}\n\
         - sender_id: {sender_id}\n\
         - sender_name: {sender_name}\n\
         - group_name: {group_name}\n\
         - message_ids: {message_ids}\n\
         - perspective: {perspective}\n\
         - profile_targets: {targets}\n\
         - force: {force}\n\n\
         【行动摘要】\n{memo}\n\n\
         【新信息】\n{observation}\n\n\
         【触发消息】\n{source_message}\n\n\
         【近期消息】\n{recent}\n\n\
         请调用 submit_rewrite 工具提交改写后的纯文本。",
        request_id = job.request_id,
        end_seq = job.end_seq,
        timestamp_local = job.timestamp_local,
        timezone = if job.timezone.is_empty() {
            "Asia/Shanghai"
        } else {
            &job.timezone
        },
        bot_name = if job.bot_name.is_empty() {
            "corvid"
        } else {
            &job.bot_name
        },
        user_id = job.user_id,
        group_id = job.group_id,
        sender_id = job.sender_id,
        sender_name = job.sender_name,
        group_name = job.group_name,
        message_ids = message_ids,
        perspective = job.perspective,
        targets = targets,
        force = if job.force { "true" } else { "false" },
        memo = job.memo,
        observation = observation,
        source_message = source_message,
        recent = recent,
    );

    if !must_keep.is_empty() {
        prompt.push_str(&format!(
            "\n\n额外硬约束（本轮必须满足）：\n\
             - 以下实体ID在原始摘要中已显式出现，改写结果必须原样保留，不得改写为 sender_id 或其他ID：\n\
             - must_keep_entity_ids: {}\n\
             - 若无法判断昵称，请至少保留对应的数字ID。",
            must_keep.join(", ")
        ));
    }
    if let Some(feedback) = gate_feedback.filter(|f| !f.trim().is_empty()) {
        prompt.push_str(&format!(
            "\n\n上次提交被“绝对化闸门”拦截，原因如下（请在上次改写结果基础上逐项修正后再提交）：\n\
             {}\n\
             - 返回前请自检：不得包含代词/相对时间/相对地点；且不得丢失必须保留的实体ID。",
            feedback.trim()
        ));
        if let Some(prev) = previous.filter(|p| !p.trim().is_empty()) {
            prompt.push_str(&format!(
                "\n\n你上次的改写结果（请在此基础上修正，而非从头改写）：\n{}",
                prev.trim()
            ));
        }
    }
    prompt
}

fn build_profile_merge_prompt(
    job: &CognitiveJob,
    canonical: &str,
    target: &ProfileTarget,
    current_profile: &str,
    effective_name: &str,
    event_id: &str,
) -> String {
    let observations = job.observation_items().join("\n");
    format!(
        "你是记忆史官，负责把新确认的事实合并进实体侧写（Markdown）。\n\
         只记录稳定的身份级信息；临时话题、一次性事件不要写入。\
         如果新信息不足以更新侧写，调用 update_profile 时设 skip=true。\n\n\
         【目标实体】\n\
         - entity_type: {entity_type}\n\
         - entity_id: {entity_id}\n\
         - perspective: {perspective}\n\
         - 显示名称: {effective_name}\n\n\
         【当前侧写】\n{current_profile}\n\n\
         【本次canonical事件】\n{canonical}\n\n\
         【新信息】\n{observations}\n\n\
         【行动摘要】\n{memo}\n\n\
         【事件上下文】 request_id={request_id} event_id={event_id} \
         sender={sender_name}({sender_id}) group={group_name}({group_id}) \
         时间={timestamp_local}\n\n\
         请调用 update_profile 工具提交合并结果（summary 为完整的新侧写正文）。",
        entity_type = target.entity_type,
        entity_id = target.entity_id,
        perspective = target.perspective,
        effective_name = effective_name,
        current_profile = current_profile,
        canonical = canonical,
        observations = observations,
        memo = job.memo,
        request_id = job.request_id,
        event_id = event_id,
        sender_name = job.sender_name,
        sender_id = job.sender_id,
        group_name = job.group_name,
        group_id = job.group_id,
        timestamp_local = job.timestamp_local,
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
