// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Builtin skill handlers.
//!
//! The executable bodies behind the default skill tree.  Handlers pull their
//! collaborators from the [`SkillContext`] resource map (seeded by the
//! coordinator and the ambient request context) and fall back gracefully when
//! an entry is missing — skills are portable.

use std::sync::Arc;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use tracing::{info, warn};

use corvid_config::Config;
use corvid_context::RequestContext;
use corvid_memory::{
    CognitiveService, EndSummaryLocation, EndSummaryStorage, EnqueueContext, EventSearchFilters,
};
use corvid_scheduler::{ExecutionMode, ScheduledTask, TaskScheduler, ToolStep};
use corvid_skills::{handler, HandlerTable, SkillContext, SkillError};

use crate::{HistoryStore, Sender, SendOptions};

/// `Arc<dyn HistoryStore>` wrapped so it can live in the `Any`-typed
/// resource map.
pub struct HistoryResource(pub Arc<dyn HistoryStore>);

const END_REFUSAL: &str = "拒绝结束对话：你填写了 action_summary（本轮行动记录）但本轮未发送任何消息或媒体内容。\
请先发送消息给用户，或使用 force=true 强制结束。\
若本轮确实未做任何事，建议留空 action_summary 以避免记忆噪声。\
若你获取到了新信息，考虑填写 new_info 字段以保存这些信息，而不是放在 action_summary 里。";

// Historian reference-context limits (clamped config values).
const DEFAULT_SOURCE_LEN: usize = 800;
const MIN_SOURCE_LEN: usize = 16;
const MAX_SOURCE_LEN: usize = 4000;
const DEFAULT_RECENT_LINES: usize = 12;
const MAX_RECENT_LINES: usize = 50;
const DEFAULT_LINE_LEN: usize = 240;
const MIN_LINE_LEN: usize = 16;
const MAX_LINE_LEN: usize = 1000;

/// Lenient boolean parsing: `(parsed, recognized)`.
fn coerce_bool(value: &Value) -> (bool, bool) {
    match value {
        Value::Bool(b) => (*b, true),
        Value::Number(n) => (n.as_f64().map(|f| f != 0.0).unwrap_or(false), true),
        Value::String(s) => {
            let token = s.trim().to_lowercase();
            if ["1", "true", "yes", "y", "on"].contains(&token.as_str()) {
                (true, true)
            } else if ["0", "false", "no", "n", "off", ""].contains(&token.as_str()) {
                (false, true)
            } else {
                (false, false)
            }
        }
        Value::Null => (false, true),
        _ => (false, false),
    }
}

fn clip_chars(text: &str, max_len: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_len {
        return trimmed.to_string();
    }
    let clipped: String = trimmed.chars().take(max_len.saturating_sub(3)).collect();
    format!("{}...", clipped.trim_end())
}

fn content_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)<message\b[^>]*>\s*<content>(.*?)</content>\s*</message>")
            .expect("static regex")
    })
}

/// Extract the `<content>` of the triggering turn for historian grounding.
fn extract_source_message(question: &str, max_len: usize) -> String {
    let text = question.trim();
    if text.is_empty() {
        return String::new();
    }
    match content_tag_re().captures(text) {
        Some(caps) => clip_chars(caps.get(1).map(|m| m.as_str()).unwrap_or(""), max_len),
        None => clip_chars(text, max_len),
    }
}

fn historian_limits(config: Option<&Config>) -> (usize, usize, usize) {
    let (source, lines, line_len) = config
        .map(|c| {
            (
                c.cognitive.historian_source_message_max_len,
                c.cognitive.historian_recent_messages_inject_k,
                c.cognitive.historian_recent_message_line_max_len,
            )
        })
        .unwrap_or((DEFAULT_SOURCE_LEN, DEFAULT_RECENT_LINES, DEFAULT_LINE_LEN));
    (
        source.clamp(MIN_SOURCE_LEN, MAX_SOURCE_LEN),
        lines.min(MAX_RECENT_LINES),
        line_len.clamp(MIN_LINE_LEN, MAX_LINE_LEN),
    )
}

fn string_arg(args: &Value, key: &str) -> String {
    args.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .trim()
        .to_string()
}

/// `new_info` accepts a string or a list of strings.
fn string_list_arg(args: &Value, key: &str) -> Vec<String> {
    match args.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| match v {
                Value::String(s) => s.trim().to_string(),
                other => other.to_string(),
            })
            .filter(|s| !s.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

/// Register all builtin handlers into the shared table.
pub fn register_builtin_handlers(table: &HandlerTable) {
    table.register("get_time", handler(get_time));
    table.register("send_message", handler(send_message));
    table.register("end", handler(end_tool));
    table.register("create_schedule_task", handler(create_schedule_task));
    table.register("list_schedule_tasks", handler(list_schedule_tasks));
    table.register("remove_schedule_task", handler(remove_schedule_task));
    table.register("get_recent_messages", handler(get_recent_messages));
    table.register("search_memory_events", handler(search_memory_events));
    table.register("get_profile", handler(get_profile));
}

async fn get_time(_args: Value, _ctx: SkillContext) -> Result<String, SkillError> {
    Ok(chrono::Local::now().format("%Y-%m-%d %H:%M:%S %:z").to_string())
}

async fn send_message(args: Value, ctx: SkillContext) -> Result<String, SkillError> {
    let message = string_arg(&args, "message");
    if message.is_empty() {
        return Ok("message 参数不能为空".into());
    }
    let Some(sender) = ctx.get::<Sender>("sender") else {
        return Err(SkillError::Execution("sender 未在上下文中提供".into()));
    };

    let at_user = args.get("at_user").and_then(|v| v.as_i64());
    let result = if let Some(group_id) = ctx.group_id {
        let body = match at_user {
            Some(uid) => format!("[CQ:at,qq={uid}] {message}"),
            None => message.clone(),
        };
        sender
            .send_group(group_id, &body, SendOptions::default())
            .await
    } else if let Some(user_id) = ctx.user_id {
        sender
            .send_private(user_id, &message, SendOptions::default())
            .await
    } else {
        return Ok("当前上下文没有可用的发送目标".into());
    };

    match result {
        Ok(true) => Ok("消息已发送".into()),
        Ok(false) => Ok("消息与近期回复重复，已跳过发送".into()),
        Err(e) => Err(SkillError::Execution(format!("发送失败: {e}"))),
    }
}

async fn end_tool(args: Value, ctx: SkillContext) -> Result<String, SkillError> {
    let summary = {
        let primary = string_arg(&args, "action_summary");
        if primary.is_empty() {
            string_arg(&args, "summary")
        } else {
            primary
        }
    };
    let new_info = string_list_arg(&args, "new_info");
    let perspective = string_arg(&args, "perspective");
    let force_raw = args.get("force").cloned().unwrap_or(Value::Bool(false));
    let (force, force_recognized) = coerce_bool(&force_raw);
    if args.get("force").is_some() && !force_recognized {
        warn!(
            value = %force_raw,
            request_id = ctx.request_id.as_deref().unwrap_or("-"),
            "unrecognized force value treated as false"
        );
    }

    let ambient = RequestContext::current();

    // Lightweight per-request de-dup: the same record submitted twice in one
    // request is skipped.  Best-effort only; a restart may re-admit it.
    let record_key = format!(
        "{}|{}|{}|{}|{}|{}|{:?}",
        ctx.request_id.as_deref().unwrap_or(""),
        ctx.request_type.as_deref().unwrap_or(""),
        ctx.group_id.map(|g| g.to_string()).unwrap_or_default(),
        ctx.sender_id
            .or(ctx.user_id)
            .map(|s| s.to_string())
            .unwrap_or_default(),
        perspective,
        summary,
        new_info,
    );
    if let Some(ambient) = &ambient {
        let previous = ambient.get_resource::<String>("_end_last_record_key");
        if previous.as_deref().map(|p| p == &record_key).unwrap_or(false) {
            info!(
                request_id = ctx.request_id.as_deref().unwrap_or("-"),
                "duplicate end record skipped"
            );
            ambient.set_conversation_ended(true);
            return Ok("对话已结束（重复记录已跳过）".into());
        }
        ambient.set_resource("_end_last_record_key", Arc::new(record_key));
    }

    // Must-send-before-end: a non-empty summary claims an action happened;
    // without an outbound message this round that claim is refused.
    let message_sent = ambient
        .as_ref()
        .map(|c| c.message_sent_this_turn())
        .unwrap_or(false);
    if !summary.is_empty() && !force && !message_sent {
        warn!(
            request_id = ctx.request_id.as_deref().unwrap_or("-"),
            "end refused: no message sent this turn"
        );
        return Ok(END_REFUSAL.into());
    }

    let sender_name = ctx
        .get::<String>("sender_name")
        .map(|s| (*s).clone())
        .unwrap_or_default();
    let group_name = ctx
        .get::<String>("group_name")
        .map(|s| (*s).clone())
        .unwrap_or_default();

    if !summary.is_empty() {
        let location = match ctx.request_type.as_deref() {
            Some("group") => Some(EndSummaryLocation {
                kind: "group".into(),
                name: if group_name.is_empty() {
                    ctx.group_id
                        .map(|g| format!("群{g}"))
                        .unwrap_or_else(|| "未知群聊".into())
                } else {
                    group_name.clone()
                },
            }),
            Some("private") => Some(EndSummaryLocation {
                kind: "private".into(),
                name: if sender_name.is_empty() {
                    ctx.sender_id
                        .or(ctx.user_id)
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "未知用户".into())
                } else {
                    sender_name.clone()
                },
            }),
            _ => None,
        };
        if let Some(storage) = ctx.get::<EndSummaryStorage>("end_summary_storage") {
            let record = storage.append(&summary, location);
            info!(summary = %clip_chars(&record.summary, 50), "end summary recorded");
        }
    } else {
        info!("empty action_summary, recap write skipped");
    }

    // Feed the cognitive pipeline when anything memorable happened.
    if let Some(cognitive) = ctx.get::<CognitiveService>("cognitive_service") {
        if !summary.is_empty() || !new_info.is_empty() {
            let config = ctx.get::<Config>("runtime_config");
            let (source_len, recent_k, line_len) = historian_limits(config.as_deref());
            let source_message = ctx
                .get::<String>("current_question")
                .map(|q| extract_source_message(&q, source_len))
                .unwrap_or_default();

            let recent_messages = build_recent_lines(&ctx, recent_k, line_len).await;
            let enqueue_ctx = EnqueueContext {
                request_id: ctx.request_id.clone().unwrap_or_default(),
                end_seq: ambient.as_ref().map(|c| c.next_end_seq()).unwrap_or(0),
                user_id: ctx.user_id.map(|u| u.to_string()).unwrap_or_default(),
                group_id: ctx.group_id.map(|g| g.to_string()).unwrap_or_default(),
                sender_id: ctx
                    .sender_id
                    .or(ctx.user_id)
                    .map(|s| s.to_string())
                    .unwrap_or_default(),
                sender_name,
                group_name,
                request_type: ctx.request_type.clone().unwrap_or_default(),
                message_ids: ctx
                    .get::<Vec<String>>("message_ids")
                    .map(|m| (*m).clone())
                    .unwrap_or_default(),
                perspective,
                source_message,
                recent_messages,
            };
            match cognitive.enqueue_job(&summary, &new_info, &enqueue_ctx, force) {
                Ok(Some(job_id)) => info!(job_id = %job_id, "cognitive job submitted"),
                Ok(None) => info!("cognitive enqueue skipped"),
                Err(e) => warn!("cognitive enqueue failed: {e}"),
            }
        } else {
            info!("memory fields empty, cognitive enqueue skipped");
        }
    }

    if let Some(ambient) = &ambient {
        ambient.set_conversation_ended(true);
    }
    Ok("对话已结束".into())
}

async fn build_recent_lines(ctx: &SkillContext, recent_k: usize, line_len: usize) -> Vec<String> {
    if recent_k == 0 {
        return Vec::new();
    }
    let Some(history) = ctx.get::<HistoryResource>("history_manager") else {
        return Vec::new();
    };
    let (kind, chat_id) = match ctx.request_type.as_deref() {
        Some("group") => match ctx.group_id {
            Some(g) => ("group", g.to_string()),
            None => return Vec::new(),
        },
        Some("private") => match ctx.user_id.or(ctx.sender_id) {
            Some(u) => ("private", u.to_string()),
            None => return Vec::new(),
        },
        _ => return Vec::new(),
    };
    history
        .0
        .get_recent(kind, &chat_id, recent_k)
        .await
        .iter()
        .map(|entry| entry.render_line(line_len))
        .collect()
}

async fn create_schedule_task(args: Value, ctx: SkillContext) -> Result<String, SkillError> {
    let cron_expression = string_arg(&args, "cron_expression");
    if cron_expression.is_empty() {
        return Ok("cron_expression 参数不能为空".into());
    }

    let task_name = string_arg(&args, "task_name");
    let tool_name = string_arg(&args, "tool_name");
    let self_instruction = string_arg(&args, "self_instruction");
    let tools_raw = args.get("tools").and_then(|v| v.as_array()).cloned();
    let execution_mode = match string_arg(&args, "execution_mode").as_str() {
        "" | "serial" => ExecutionMode::Serial,
        "parallel" => ExecutionMode::Parallel,
        other => return Ok(format!("execution_mode 必须是 'serial' 或 'parallel'，收到: {other}")),
    };

    let has_single = !tool_name.is_empty();
    let has_multi = tools_raw.as_ref().map(|t| !t.is_empty()).unwrap_or(false);
    let has_self = args
        .get("self_instruction")
        .map(|v| !v.is_null())
        .unwrap_or(false);
    if has_self && self_instruction.is_empty() {
        return Ok("self_instruction 不能为空".into());
    }
    let mode_count = [has_single, has_multi, has_self].iter().filter(|b| **b).count();
    if mode_count == 0 {
        return Ok(
            "必须提供 tool_name（单工具模式）、tools（多工具模式）或 self_instruction（调用自己模式）参数"
                .into(),
        );
    }
    if mode_count > 1 {
        return Ok("tool_name、tools、self_instruction 不能同时使用，请选择其中一种模式".into());
    }

    let mut steps: Option<Vec<ToolStep>> = None;
    if let Some(raw) = tools_raw.filter(|t| !t.is_empty()) {
        let mut parsed = Vec::with_capacity(raw.len());
        for (i, item) in raw.iter().enumerate() {
            let Some(obj) = item.as_object() else {
                return Ok(format!("tools[{i}] 必须是对象"));
            };
            let Some(name) = obj.get("tool_name").and_then(|v| v.as_str()) else {
                return Ok(format!("tools[{i}] 缺少 tool_name 字段"));
            };
            let Some(step_args) = obj.get("tool_args") else {
                return Ok(format!("tools[{i}] 缺少 tool_args 字段"));
            };
            parsed.push(ToolStep {
                tool_name: name.to_string(),
                tool_args: step_args.clone(),
            });
        }
        steps = Some(parsed);
    }

    let max_executions = match args.get("max_executions") {
        None | Some(Value::Null) => None,
        Some(v) => match v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())) {
            Some(n) if n >= 1 => Some(n as u32),
            _ => return Ok("max_executions 必须是大于 0 的整数".into()),
        },
    };

    let Some(scheduler) = ctx.get::<TaskScheduler>("scheduler") else {
        return Ok("调度器未在上下文中提供".into());
    };

    let (target_id, target_type) = if let Some(group_id) = ctx.group_id {
        (Some(group_id), "group".to_string())
    } else if let Some(user_id) = ctx.user_id {
        (Some(user_id), "private".to_string())
    } else {
        (None, "group".to_string())
    };

    let task_id = ScheduledTask::generate_id(if task_name.is_empty() {
        None
    } else {
        Some(&task_name)
    });
    let task = ScheduledTask {
        task_id: task_id.clone(),
        cron: cron_expression.clone(),
        task_name: task_name.clone(),
        tool_name: if has_single { Some(tool_name.clone()) } else { None },
        tool_args: args.get("tool_args").cloned().unwrap_or(serde_json::json!({})),
        tools: steps.clone(),
        execution_mode,
        self_instruction: if has_self {
            Some(self_instruction.clone())
        } else {
            None
        },
        target_id,
        target_type,
        max_executions,
        current_executions: 0,
    };

    if let Err(e) = scheduler.add_task(task).await {
        return Ok(format!("添加定时任务失败: {e}"));
    }

    let name_info = if task_name.is_empty() {
        String::new()
    } else {
        format!(" '{task_name}'")
    };
    let max_info = max_executions
        .map(|m| format!("，最多执行 {m} 次"))
        .unwrap_or_default();
    if has_self {
        Ok(format!(
            "定时任务{name_info}已成功添加 (ID: {task_id})。\n将在 '{cron_expression}' 时间调用未来的自己，指令：{self_instruction}{max_info}。"
        ))
    } else if let Some(steps) = steps {
        let mode_info = match execution_mode {
            ExecutionMode::Parallel => "，执行模式：并行",
            ExecutionMode::Serial => "，执行模式：串行",
        };
        let tools_list: Vec<&str> = steps.iter().map(|s| s.tool_name.as_str()).collect();
        Ok(format!(
            "定时任务{name_info}已成功添加 (ID: {task_id})。\n将在 '{cron_expression}' 时间执行 {} 个工具：{}{mode_info}{max_info}。",
            tools_list.len(),
            tools_list.join(", ")
        ))
    } else {
        Ok(format!(
            "定时任务{name_info}已成功添加 (ID: {task_id})。\n将在 '{cron_expression}' 时间执行工具 '{tool_name}'{max_info}。"
        ))
    }
}

async fn list_schedule_tasks(_args: Value, ctx: SkillContext) -> Result<String, SkillError> {
    let Some(scheduler) = ctx.get::<TaskScheduler>("scheduler") else {
        return Ok("调度器未在上下文中提供".into());
    };
    let tasks = scheduler.list_tasks().await;
    if tasks.is_empty() {
        return Ok("当前没有定时任务".into());
    }
    let lines: Vec<String> = tasks
        .iter()
        .map(|t| {
            let what = if let Some(instruction) = &t.self_instruction {
                format!("调用自己：{instruction}")
            } else if let Some(steps) = &t.tools {
                format!(
                    "{} 个工具: {}",
                    steps.len(),
                    steps
                        .iter()
                        .map(|s| s.tool_name.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            } else {
                format!("工具 {}", t.tool_name.clone().unwrap_or_default())
            };
            let max = t
                .max_executions
                .map(|m| format!(" [{}/{m}]", t.current_executions))
                .unwrap_or_default();
            format!("- {} ({}): {what}{max}", t.task_id, t.cron)
        })
        .collect();
    Ok(format!("定时任务列表：\n{}", lines.join("\n")))
}

async fn remove_schedule_task(args: Value, ctx: SkillContext) -> Result<String, SkillError> {
    let task_id = string_arg(&args, "task_id");
    if task_id.is_empty() {
        return Ok("task_id 参数不能为空".into());
    }
    let Some(scheduler) = ctx.get::<TaskScheduler>("scheduler") else {
        return Ok("调度器未在上下文中提供".into());
    };
    match scheduler.remove_task(&task_id).await {
        Ok(true) => Ok(format!("定时任务 {task_id} 已移除")),
        Ok(false) => Ok(format!("定时任务 {task_id} 不存在")),
        Err(e) => Ok(format!("移除定时任务失败: {e}")),
    }
}

async fn get_recent_messages(args: Value, ctx: SkillContext) -> Result<String, SkillError> {
    let count = args
        .get("count")
        .and_then(|v| v.as_u64())
        .unwrap_or(20)
        .clamp(1, 100) as usize;
    let Some(history) = ctx.get::<HistoryResource>("history_manager") else {
        return Ok("历史记录不可用".into());
    };
    let (kind, chat_id) = match ctx.request_type.as_deref() {
        Some("group") => ("group", ctx.group_id.map(|g| g.to_string())),
        Some("private") => ("private", ctx.user_id.or(ctx.sender_id).map(|u| u.to_string())),
        _ => ("group", ctx.group_id.map(|g| g.to_string())),
    };
    let Some(chat_id) = chat_id else {
        return Ok("当前上下文没有可用的会话".into());
    };
    let entries = history.0.get_recent(kind, &chat_id, count).await;
    if entries.is_empty() {
        return Ok("暂无历史消息".into());
    }
    Ok(entries
        .iter()
        .map(|e| e.render_line(DEFAULT_LINE_LEN))
        .collect::<Vec<_>>()
        .join("\n"))
}

async fn search_memory_events(args: Value, ctx: SkillContext) -> Result<String, SkillError> {
    let query = string_arg(&args, "query");
    if query.is_empty() {
        return Ok("query 参数不能为空".into());
    }
    let Some(cognitive) = ctx.get::<CognitiveService>("cognitive_service") else {
        return Ok("认知记忆不可用".into());
    };
    let filters = EventSearchFilters {
        group_id: ctx.group_id.map(|g| g.to_string()),
        top_k: args.get("top_k").and_then(|v| v.as_u64()).map(|k| k as usize),
        ..EventSearchFilters::default()
    };
    let hits = cognitive
        .search_events(&query, &filters)
        .await
        .map_err(|e| SkillError::Execution(format!("记忆检索失败: {e}")))?;
    if hits.is_empty() {
        return Ok("没有找到相关记忆".into());
    }
    Ok(hits
        .iter()
        .map(|h| {
            format!(
                "- [{}] {}",
                h.metadata["timestamp_local"].as_str().unwrap_or(""),
                h.document
            )
        })
        .collect::<Vec<_>>()
        .join("\n"))
}

async fn get_profile(args: Value, ctx: SkillContext) -> Result<String, SkillError> {
    let entity_type = string_arg(&args, "entity_type");
    let entity_id = string_arg(&args, "entity_id");
    if !matches!(entity_type.as_str(), "user" | "group") || entity_id.is_empty() {
        return Ok("entity_type 必须是 user/group，且 entity_id 不能为空".into());
    }
    let Some(cognitive) = ctx.get::<CognitiveService>("cognitive_service") else {
        return Ok("认知记忆不可用".into());
    };
    match cognitive
        .get_profile(&entity_type, &entity_id)
        .await
        .map_err(|e| SkillError::Execution(format!("读取侧写失败: {e}")))?
    {
        Some(profile) => Ok(profile),
        None => Ok(format!("{entity_type}:{entity_id} 暂无侧写")),
    }
}

// ─── Default skill tree ───────────────────────────────────────────────────────

/// Scaffold the default skill directories when missing, so a fresh deployment
/// advertises the builtin set without manual setup.  Existing files are never
/// overwritten.
pub fn ensure_default_skills(root: &std::path::Path) -> std::io::Result<()> {
    let specs: Vec<(&str, &str, serde_json::Value)> = vec![
        (
            "tools",
            "send_message",
            serde_json::json!({
                "function": {
                    "name": "send_message",
                    "description": "发送一条消息到当前会话（群聊或私聊）。",
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "message": { "type": "string", "description": "要发送的内容" },
                            "at_user": { "type": "integer", "description": "可选：@某个用户" }
                        },
                        "required": ["message"]
                    }
                },
                "order": 1
            }),
        ),
        (
            "tools",
            "end",
            serde_json::json!({
                "function": {
                    "name": "end",
                    "description": "结束本轮对话。action_summary 记录本轮做了什么；new_info 记录获取到的新事实。",
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "action_summary": { "type": "string", "description": "本轮行动摘要（没做事就留空）" },
                            "new_info": {
                                "type": "array",
                                "items": { "type": "string" },
                                "description": "新获取的事实列表"
                            },
                            "perspective": { "type": "string", "description": "记忆视角标识" },
                            "force": { "type": "boolean", "description": "true 跳过发送检查与绝对化闸门的正则部分" }
                        }
                    }
                },
                "order": 2
            }),
        ),
        (
            "tools",
            "get_time",
            serde_json::json!({
                "function": {
                    "name": "get_time",
                    "description": "获取当前本地时间。",
                    "parameters": { "type": "object", "properties": {} }
                },
                "order": 10
            }),
        ),
        (
            "tools",
            "get_recent_messages",
            serde_json::json!({
                "function": {
                    "name": "get_recent_messages",
                    "description": "获取当前会话最近的聊天记录。",
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "count": { "type": "integer", "description": "条数，默认 20" }
                        }
                    }
                },
                "order": 11
            }),
        ),
        (
            "tools",
            "create_schedule_task",
            serde_json::json!({
                "function": {
                    "name": "create_schedule_task",
                    "description": "创建定时任务。支持单工具、多工具批量、或 self_instruction（定时提醒未来的自己）。",
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "task_name": { "type": "string" },
                            "cron_expression": { "type": "string", "description": "五段 crontab：分 时 日 月 周" },
                            "tool_name": { "type": "string" },
                            "tool_args": { "type": "object" },
                            "tools": {
                                "type": "array",
                                "items": {
                                    "type": "object",
                                    "properties": {
                                        "tool_name": { "type": "string" },
                                        "tool_args": { "type": "object" }
                                    }
                                }
                            },
                            "execution_mode": { "type": "string", "enum": ["serial", "parallel"] },
                            "self_instruction": { "type": "string" },
                            "max_executions": { "type": "integer" }
                        },
                        "required": ["cron_expression"]
                    }
                },
                "order": 20
            }),
        ),
        (
            "tools",
            "list_schedule_tasks",
            serde_json::json!({
                "function": {
                    "name": "list_schedule_tasks",
                    "description": "列出所有定时任务。",
                    "parameters": { "type": "object", "properties": {} }
                },
                "order": 21
            }),
        ),
        (
            "tools",
            "remove_schedule_task",
            serde_json::json!({
                "function": {
                    "name": "remove_schedule_task",
                    "description": "移除一个定时任务。",
                    "parameters": {
                        "type": "object",
                        "properties": { "task_id": { "type": "string" } },
                        "required": ["task_id"]
                    }
                },
                "order": 22
            }),
        ),
        (
            "tools",
            "search_memory_events",
            serde_json::json!({
                "function": {
                    "name": "search_memory_events",
                    "description": "在认知记忆库中检索相关历史事件。",
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "query": { "type": "string" },
                            "top_k": { "type": "integer" }
                        },
                        "required": ["query"]
                    }
                },
                "order": 30
            }),
        ),
        (
            "tools",
            "get_profile",
            serde_json::json!({
                "function": {
                    "name": "get_profile",
                    "description": "读取某个用户或群的长期侧写。",
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "entity_type": { "type": "string", "enum": ["user", "group"] },
                            "entity_id": { "type": "string" }
                        },
                        "required": ["entity_type", "entity_id"]
                    }
                },
                "order": 31
            }),
        ),
    ];

    for (kind, name, config) in specs {
        let dir = root.join(kind).join(name);
        std::fs::create_dir_all(&dir)?;
        let config_path = dir.join("config.json");
        if !config_path.exists() {
            std::fs::write(&config_path, serde_json::to_string_pretty(&config)?)?;
        }
        let handler_path = dir.join("handler.rs");
        if !handler_path.exists() {
            std::fs::write(
                &handler_path,
                "// Compiled-in handler; see corvid-core/src/tools.rs\n",
            )?;
        }
    }
    // Agents and commands roots exist even when empty, so hot reload watches
    // them from the start.
    std::fs::create_dir_all(root.join("agents"))?;
    std::fs::create_dir_all(root.join("commands"))?;
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryHistory, Sender};
    use corvid_config::ConfigManager;
    use corvid_memory::{CognitiveJobQueue, HashingEmbedder, ProfileStorage, VectorStore};
    use corvid_onebot::RecordingApi;

    fn ctx_with_sender() -> (Arc<RecordingApi>, SkillContext) {
        let api = RecordingApi::new();
        let history = Arc::new(MemoryHistory::new(50));
        let sender = Sender::new(api.clone(), history, "corvid");
        let mut ctx = SkillContext::new();
        ctx.insert("sender", sender);
        (api, ctx)
    }

    fn end_summary_ctx(dir: &std::path::Path) -> (SkillContext, Arc<EndSummaryStorage>) {
        let storage = Arc::new(EndSummaryStorage::new(dir.join("end.json"), 10));
        let mut ctx = SkillContext::new();
        ctx.insert("end_summary_storage", storage.clone());
        (ctx, storage)
    }

    fn cognitive_service(dir: &std::path::Path) -> Arc<CognitiveService> {
        let queue = Arc::new(CognitiveJobQueue::open(dir.join("queue")).unwrap());
        let vector =
            Arc::new(VectorStore::open_in_memory(Arc::new(HashingEmbedder::default())).unwrap());
        let profiles = Arc::new(ProfileStorage::new(dir.join("profiles"), 3));
        CognitiveService::new(
            ConfigManager::new(corvid_config::Config::default()),
            queue,
            vector,
            profiles,
        )
    }

    #[test]
    fn coerce_bool_accepts_loose_tokens() {
        assert_eq!(coerce_bool(&serde_json::json!(true)), (true, true));
        assert_eq!(coerce_bool(&serde_json::json!("YES")), (true, true));
        assert_eq!(coerce_bool(&serde_json::json!("off")), (false, true));
        assert_eq!(coerce_bool(&serde_json::json!(1)), (true, true));
        assert_eq!(coerce_bool(&serde_json::json!(0)), (false, true));
        assert_eq!(coerce_bool(&serde_json::json!("maybe")), (false, false));
    }

    #[test]
    fn source_message_extraction_prefers_content_tag() {
        let question = "前缀 <message sender=\"a\">\n <content>真正的内容</content>\n </message> 后缀";
        assert_eq!(extract_source_message(question, 100), "真正的内容");
        assert_eq!(extract_source_message("没有标签的问题", 100), "没有标签的问题");
        assert_eq!(extract_source_message("", 100), "");
    }

    #[tokio::test]
    async fn send_message_routes_by_request_type() {
        let (api, mut ctx) = ctx_with_sender();
        ctx.group_id = Some(10001);
        ctx.request_type = Some("group".into());
        let out = send_message(
            serde_json::json!({"message": "hi", "at_user": 2002}),
            ctx.clone(),
        )
        .await
        .unwrap();
        assert_eq!(out, "消息已发送");
        let sent = api.sent_messages();
        assert_eq!(sent[0].0, "group");
        assert_eq!(sent[0].2, "[CQ:at,qq=2002] hi");
    }

    #[tokio::test]
    async fn send_message_private_path() {
        let (api, mut ctx) = ctx_with_sender();
        ctx.user_id = Some(7);
        let out = send_message(serde_json::json!({"message": "dm"}), ctx)
            .await
            .unwrap();
        assert_eq!(out, "消息已发送");
        assert_eq!(api.sent_messages()[0].0, "private");
    }

    #[tokio::test]
    async fn end_refuses_summary_without_send() {
        // end(action_summary, force=false) with no prior send is refused
        // and does not end the conversation.
        let dir = tempfile::tempdir().unwrap();
        let (mut ctx, _) = end_summary_ctx(dir.path());
        ctx.request_type = Some("private".into());
        ctx.user_id = Some(7);
        let ambient = RequestContext::private(7);
        let out = ambient
            .scope(end_tool(
                serde_json::json!({"action_summary": "done", "force": false}),
                ctx,
            ))
            .await
            .unwrap();
        assert!(out.contains("拒绝结束对话"));
        assert!(!ambient.conversation_ended());
    }

    #[tokio::test]
    async fn end_force_bypasses_send_check() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ctx, storage) = end_summary_ctx(dir.path());
        ctx.request_type = Some("private".into());
        ctx.user_id = Some(7);
        let ambient = RequestContext::private(7);
        let out = ambient
            .scope(end_tool(
                serde_json::json!({"action_summary": "did it", "force": "true"}),
                ctx,
            ))
            .await
            .unwrap();
        assert_eq!(out, "对话已结束");
        assert!(ambient.conversation_ended());
        assert_eq!(storage.recent().len(), 1);
    }

    #[tokio::test]
    async fn end_after_send_records_summary_with_location() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ctx, storage) = end_summary_ctx(dir.path());
        ctx.request_type = Some("group".into());
        ctx.group_id = Some(100);
        ctx.insert("group_name", Arc::new("测试群".to_string()));
        let ambient = RequestContext::group(100, 7);
        ambient.set_message_sent_this_turn(true);
        let out = ambient
            .scope(end_tool(serde_json::json!({"action_summary": "回答了问题"}), ctx))
            .await
            .unwrap();
        assert_eq!(out, "对话已结束");
        let records = storage.recent();
        assert_eq!(records[0].location.as_ref().unwrap().name, "测试群");
    }

    #[tokio::test]
    async fn end_without_summary_ends_silently() {
        let ambient = RequestContext::private(7);
        let out = ambient
            .scope(end_tool(serde_json::json!({}), SkillContext::new()))
            .await
            .unwrap();
        assert_eq!(out, "对话已结束");
        assert!(ambient.conversation_ended());
    }

    #[tokio::test]
    async fn end_duplicate_record_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ctx, storage) = end_summary_ctx(dir.path());
        ctx.request_type = Some("private".into());
        ctx.user_id = Some(7);
        let ambient = RequestContext::private(7);
        ambient.set_message_sent_this_turn(true);
        let args = serde_json::json!({"action_summary": "same record"});
        let first = ambient
            .scope(end_tool(args.clone(), ctx.clone()))
            .await
            .unwrap();
        assert_eq!(first, "对话已结束");
        let second = ambient.scope(end_tool(args, ctx)).await.unwrap();
        assert!(second.contains("重复记录已跳过"));
        assert_eq!(storage.recent().len(), 1, "recap written once");
    }

    #[tokio::test]
    async fn end_enqueues_cognitive_job_with_grounding() {
        let dir = tempfile::tempdir().unwrap();
        let cognitive = cognitive_service(dir.path());
        let history: Arc<dyn HistoryStore> = Arc::new(MemoryHistory::new(50));
        history
            .add_message("group", "100", crate::HistoryEntry::now("7", "alice", "早上好"))
            .await;

        let mut ctx = SkillContext::new();
        ctx.request_type = Some("group".into());
        ctx.group_id = Some(100);
        ctx.user_id = Some(7);
        ctx.sender_id = Some(7);
        ctx.insert("cognitive_service", cognitive);
        ctx.insert("history_manager", Arc::new(HistoryResource(history)));
        ctx.insert(
            "current_question",
            Arc::new("<message sender=\"alice\">\n <content>记住我喜欢Rust</content>\n </message>".to_string()),
        );
        ctx.insert("sender_name", Arc::new("alice".to_string()));
        ctx.insert("group_name", Arc::new("测试群".to_string()));

        let ambient = RequestContext::group(100, 7);
        ambient.set_message_sent_this_turn(true);
        let out = ambient
            .scope(end_tool(
                serde_json::json!({
                    "action_summary": "记下了用户偏好",
                    "new_info": ["alice(7) 喜欢 Rust"]
                }),
                ctx,
            ))
            .await
            .unwrap();
        assert_eq!(out, "对话已结束");

        let queue = CognitiveJobQueue::open(dir.path().join("queue")).unwrap();
        let (_, job) = queue.dequeue().unwrap().unwrap();
        assert_eq!(job.memo, "记下了用户偏好");
        assert_eq!(job.observations, vec!["alice(7) 喜欢 Rust"]);
        assert_eq!(job.source_message, "记住我喜欢Rust");
        assert_eq!(job.recent_messages.len(), 1);
        assert!(job.recent_messages[0].contains("alice(7)"));
        assert_eq!(job.profile_targets.len(), 2);
    }

    #[tokio::test]
    async fn schedule_tools_round_trip() {
        let store = Arc::new(corvid_scheduler::MemoryTaskStore::new());
        struct NoopRunner;
        #[async_trait::async_trait]
        impl corvid_scheduler::TaskRunner for NoopRunner {
            async fn run_tool(
                &self,
                _t: &str,
                _a: &Value,
                _task: &ScheduledTask,
            ) -> Result<String, corvid_scheduler::SchedulerError> {
                Ok("ok".into())
            }
            async fn self_call(
                &self,
                _p: &str,
                _task: &ScheduledTask,
            ) -> Result<(), corvid_scheduler::SchedulerError> {
                Ok(())
            }
            async fn notify(&self, _task: &ScheduledTask, _m: &str) {}
        }
        let scheduler = TaskScheduler::new(store, Arc::new(NoopRunner), 1)
            .await
            .unwrap();
        let mut ctx = SkillContext::new();
        ctx.group_id = Some(100);
        ctx.insert("scheduler", scheduler.clone());

        let out = create_schedule_task(
            serde_json::json!({
                "task_name": "morning",
                "cron_expression": "0 8 * * *",
                "self_instruction": "列出待办前三项"
            }),
            ctx.clone(),
        )
        .await
        .unwrap();
        assert!(out.contains("已成功添加"));
        assert!(out.contains("调用未来的自己"));

        let listed = list_schedule_tasks(serde_json::json!({}), ctx.clone())
            .await
            .unwrap();
        assert!(listed.contains("列出待办前三项"));

        let task_id = scheduler.list_tasks().await[0].task_id.clone();
        let removed = remove_schedule_task(serde_json::json!({"task_id": task_id}), ctx)
            .await
            .unwrap();
        assert!(removed.contains("已移除"));
        assert!(scheduler.list_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn create_schedule_task_rejects_mixed_modes() {
        let mut ctx = SkillContext::new();
        ctx.group_id = Some(1);
        let out = create_schedule_task(
            serde_json::json!({
                "cron_expression": "* * * * *",
                "tool_name": "a",
                "self_instruction": "b"
            }),
            ctx,
        )
        .await
        .unwrap();
        assert!(out.contains("不能同时使用"));
    }

    #[test]
    fn default_skill_tree_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        ensure_default_skills(dir.path()).unwrap();
        let config = dir.path().join("tools/end/config.json");
        assert!(config.exists());
        let before = std::fs::read_to_string(&config).unwrap();
        // Second run must not overwrite.
        std::fs::write(&config, "{\"custom\": true}").unwrap();
        ensure_default_skills(dir.path()).unwrap();
        assert_eq!(std::fs::read_to_string(&config).unwrap(), "{\"custom\": true}");
        let _ = before;
        assert!(dir.path().join("agents").is_dir());
        assert!(dir.path().join("commands").is_dir());
    }
}
