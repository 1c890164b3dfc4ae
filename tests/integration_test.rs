// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! End-to-end pipeline test: inbound event → admission → fair-share worker →
//! tool-using loop → outbound message → cognitive job → historian.

use std::sync::Arc;
use std::time::Duration;

use corvid_config::{Config, ConfigManager};
use corvid_core::{
    ensure_default_skills, register_builtin_handlers, AICoordinator, AiClient, Lane,
    MemoryHistory, PromptBuilder, QueueManager, SecurityService, Sender, ToolManager,
};
use corvid_memory::{
    CognitiveJobQueue, CognitiveService, EndSummaryStorage, HashingEmbedder, HistorianWorker,
    ProfileStorage, VectorStore,
};
use corvid_model::{ChatResponse, ScriptedRequester, ToolCallPayload};
use corvid_onebot::{Event, RecordingApi};
use corvid_skills::{HandlerTable, SkillKind, SkillRegistry};

struct Runtime {
    _dir: tempfile::TempDir,
    api: Arc<RecordingApi>,
    chat_mock: Arc<ScriptedRequester>,
    historian_mock: Arc<ScriptedRequester>,
    queue: Arc<QueueManager>,
    coordinator: Arc<AICoordinator>,
    historian: Arc<HistorianWorker>,
    vector: Arc<VectorStore>,
    profiles: Arc<ProfileStorage>,
}

fn build_runtime() -> Runtime {
    let dir = tempfile::tempdir().unwrap();
    let skills_root = dir.path().join("skills");
    ensure_default_skills(&skills_root).unwrap();

    let mut config = Config::default();
    config.bot.self_id = 999;
    config.bot.name = "corvid".into();
    config.security.enabled = false;
    config.cognitive.rewrite_max_retry = 1;
    let config = ConfigManager::new(config);

    let handlers = HandlerTable::new();
    register_builtin_handlers(&handlers);
    let tools = SkillRegistry::new(skills_root.join("tools"), SkillKind::Tool, handlers.clone());
    let agents = SkillRegistry::new(skills_root.join("agents"), SkillKind::Agent, handlers.clone());
    let commands = SkillRegistry::new(
        skills_root.join("commands"),
        SkillKind::Command,
        handlers.clone(),
    );
    let tool_manager = ToolManager::new(tools, agents);

    let api = RecordingApi::new();
    let history = Arc::new(MemoryHistory::new(200));
    let sender = Sender::new(api.clone(), history.clone(), "corvid");

    let cognitive_queue = Arc::new(CognitiveJobQueue::open(dir.path().join("cog/queue")).unwrap());
    let vector =
        Arc::new(VectorStore::open_in_memory(Arc::new(HashingEmbedder::default())).unwrap());
    let profiles = Arc::new(ProfileStorage::new(dir.path().join("cog/profiles"), 5));
    let cognitive = CognitiveService::new(
        config.clone(),
        cognitive_queue.clone(),
        vector.clone(),
        profiles.clone(),
    );
    let end_summaries = Arc::new(EndSummaryStorage::new(dir.path().join("end.json"), 10));

    let chat_mock = Arc::new(ScriptedRequester::new());
    let prompt_builder =
        PromptBuilder::new(config.clone(), Some(cognitive.clone()), end_summaries.clone());
    let ai = AiClient::new(
        config.clone(),
        chat_mock.clone(),
        tool_manager,
        prompt_builder,
        None,
    );

    let security_mock = Arc::new(ScriptedRequester::new());
    let security = SecurityService::new(config.clone(), security_mock);

    let coordinator = AICoordinator::new(
        config.clone(),
        ai,
        history,
        sender,
        api.clone(),
        security,
        Some(cognitive),
        end_summaries,
        commands,
    );
    let queue = QueueManager::new(Duration::ZERO);
    coordinator.set_queue(queue.clone());

    let historian_mock = Arc::new(ScriptedRequester::new());
    let historian = HistorianWorker::new(
        cognitive_queue,
        vector.clone(),
        profiles.clone(),
        historian_mock.clone(),
        config,
    );

    Runtime {
        _dir: dir,
        api,
        chat_mock,
        historian_mock,
        queue,
        coordinator,
        historian,
        vector,
        profiles,
    }
}

fn group_event(group_id: i64, user_id: i64, text: &str, at_bot: bool) -> Event {
    let mut message = Vec::new();
    if at_bot {
        message.push(serde_json::json!({ "type": "at", "data": { "qq": "999" } }));
    }
    message.push(serde_json::json!({ "type": "text", "data": { "text": text } }));
    serde_json::from_value(serde_json::json!({
        "post_type": "message",
        "message_type": "group",
        "user_id": user_id,
        "group_id": group_id,
        "message_id": 555,
        "sender": { "nickname": "Null", "role": "member" },
        "message": message,
        "group_name": "bot测试群",
        "time": 1700000000
    }))
    .unwrap()
}

fn tool_call_response(id: &str, name: &str, args: serde_json::Value) -> ChatResponse {
    ChatResponse::tool_calls(vec![ToolCallPayload::new(id, name, args.to_string())])
}

#[tokio::test]
async fn at_mention_round_trip_through_historian() {
    let rt = build_runtime();

    // The chat model replies with one message, then ends with an observation.
    rt.chat_mock.push(tool_call_response(
        "c1",
        "send_message",
        serde_json::json!({ "message": "收到，我看一下这个问题" }),
    ));
    rt.chat_mock.push(tool_call_response(
        "c2",
        "end",
        serde_json::json!({
            "action_summary": "回应了 Null 关于 1708213363 的问题",
            "new_info": ["Null(120218451) 在群里提出了 1708213363 的问题"]
        }),
    ));

    // Admission: the event lands in the mention lane.
    let event = group_event(1017148870, 120218451, "帮我看看 1708213363 这个问题", true);
    rt.coordinator.handle_event(&event).await;
    assert_eq!(rt.queue.lane_len(Lane::GroupMention), 1);

    // Drain the queue through the fair-share worker.
    let handle = rt.queue.spawn_worker(rt.coordinator.clone());
    for _ in 0..200 {
        if !rt.api.sent_messages().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.stop(Duration::from_millis(500)).await;

    // Exactly one outbound message to the group.
    let sent = rt.api.sent_messages();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "group");
    assert_eq!(sent[0].1, 1017148870);
    assert_eq!(sent[0].2, "收到，我看一下这个问题");

    // The historian processes the enqueued job: one gate retry, then a
    // passing rewrite, then a profile merge for group + sender.
    rt.historian_mock.push(tool_call_response(
        "h1",
        "submit_rewrite",
        serde_json::json!({ "text": "他今天在这里提到了 1708213363 的问题" }),
    ));
    rt.historian_mock.push(tool_call_response(
        "h2",
        "submit_rewrite",
        serde_json::json!({
            "text": "Null(120218451)在2026-02-24 10:00于bot测试群(1017148870)提出了 1708213363 的问题"
        }),
    ));
    rt.historian_mock.push(tool_call_response(
        "h3",
        "update_profile",
        serde_json::json!({ "skip": true, "name": "", "tags": [], "summary": "" }),
    ));
    rt.historian_mock.push(tool_call_response(
        "h4",
        "update_profile",
        serde_json::json!({
            "skip": false,
            "name": "Null",
            "tags": ["提问者"],
            "summary": "Null 关注问题 1708213363。"
        }),
    ));

    assert!(rt.historian.run_once().await.unwrap(), "one job processed");
    assert!(!rt.historian.run_once().await.unwrap(), "queue drained");

    // The canonical event is stored and marked absolute after the retry.
    let events = rt.vector.query_events("1708213363", 5, None).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].metadata["is_absolute"], true);
    assert!(events[0].document.contains("Null(120218451)"));

    // The sender profile was merged and round-trips through frontmatter.
    let profile = rt
        .profiles
        .read_profile("user", "120218451")
        .await
        .unwrap()
        .expect("profile written");
    let (frontmatter, body) = corvid_memory::profile::parse_profile(&profile).unwrap();
    assert_eq!(frontmatter.entity_type, "user");
    assert_eq!(frontmatter.entity_id, "120218451");
    assert!(body.contains("1708213363"));
}

#[tokio::test]
async fn silent_end_produces_no_output() {
    let rt = build_runtime();
    rt.chat_mock
        .push(tool_call_response("c1", "end", serde_json::json!({})));

    let event = group_event(100, 7, "随便聊聊", false);
    rt.coordinator.handle_event(&event).await;
    assert_eq!(rt.queue.lane_len(Lane::GroupNormal), 1);

    let handle = rt.queue.spawn_worker(rt.coordinator.clone());
    for _ in 0..100 {
        if rt.chat_mock.call_count() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.stop(Duration::from_millis(500)).await;

    assert!(rt.api.sent_messages().is_empty(), "bot stayed quiet");
}
