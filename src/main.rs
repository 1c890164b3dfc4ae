// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;
mod transport;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use corvid_config::ConfigManager;
use corvid_core::{
    ensure_default_skills, register_builtin_handlers, AICoordinator, AiClient,
    CoordinatorTaskRunner, MemoryHistory, PromptBuilder, QueueManager, SecurityService, Sender,
    ToolManager,
};
use corvid_memory::{
    CognitiveJobQueue, CognitiveService, Embedder, EndSummaryStorage, HashingEmbedder,
    HistorianWorker, HttpEmbedder, ProfileStorage, VectorStore,
};
use corvid_model::{HttpRequester, ModelSelector, TokenUsageStore};
use corvid_scheduler::{JsonTaskStore, TaskScheduler};
use corvid_skills::{HandlerTable, SkillKind, SkillRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match &cli.command {
        Some(Commands::ShowConfig) => {
            let config = corvid_config::load(cli.config.as_deref())?;
            println!("{}", toml::to_string(&config)?);
            Ok(())
        }
        Some(Commands::ValidateConfig { file }) => {
            corvid_config::load_file(file)
                .with_context(|| format!("validating {}", file.display()))?;
            println!("ok: {}", file.display());
            Ok(())
        }
        Some(Commands::ListSkills) => {
            let config = corvid_config::load(cli.config.as_deref())?;
            list_skills(Path::new(&config.skills.root));
            Ok(())
        }
        Some(Commands::Run) | None => run(cli.config.as_deref()).await,
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("corvid={default_level},warn")));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn list_skills(root: &Path) {
    let table = HandlerTable::new();
    for (kind, label) in [
        (SkillKind::Tool, "tools"),
        (SkillKind::Agent, "agents"),
        (SkillKind::Command, "commands"),
    ] {
        let registry = SkillRegistry::new(root.join(kind.dir_name()), kind, table.clone());
        println!("{label}:");
        for descriptor in registry.descriptors() {
            let aliases = if descriptor.aliases.is_empty() {
                String::new()
            } else {
                format!("  (aliases: {})", descriptor.aliases.join(", "))
            };
            println!("  {:<28}{}{aliases}", descriptor.name, descriptor.description);
        }
    }
}

async fn run(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config_manager = match config_path {
        Some(path) => ConfigManager::from_file(path)?,
        None => ConfigManager::new(corvid_config::load(None)?),
    };
    let config = config_manager.current();
    tracing::info!(bot = %config.bot.name, "corvid starting");

    // ── Model layer ──────────────────────────────────────────────────────────
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .build()
        .context("building HTTP client")?;
    let usage_store = TokenUsageStore::file(&config.models.token_usage_path);
    let requester = Arc::new(HttpRequester::new(http.clone(), usage_store));
    let selector = config
        .model_pool
        .enabled
        .then(|| Arc::new(ModelSelector::new(&config.model_pool)));

    // ── Skills ───────────────────────────────────────────────────────────────
    let skills_root = PathBuf::from(&config.skills.root);
    ensure_default_skills(&skills_root).context("scaffolding default skills")?;
    let handlers = HandlerTable::new();
    register_builtin_handlers(&handlers);
    let tools = SkillRegistry::new(skills_root.join("tools"), SkillKind::Tool, handlers.clone());
    let agents = SkillRegistry::new(skills_root.join("agents"), SkillKind::Agent, handlers.clone());
    let commands = SkillRegistry::new(
        skills_root.join("commands"),
        SkillKind::Command,
        handlers.clone(),
    );
    let tool_manager = ToolManager::new(tools.clone(), agents.clone());

    let mut hot_reloads = Vec::new();
    if config.skills.hot_reload {
        let interval = Duration::from_secs(config.skills.hot_reload_interval_secs);
        let debounce = Duration::from_secs(config.skills.hot_reload_debounce_secs);
        for registry in [&tools, &agents, &commands] {
            hot_reloads.push(registry.start_hot_reload(interval, debounce));
        }
        if let Some(watch) = config_manager.watch(interval, debounce) {
            hot_reloads.push(watch);
        }
    }

    // ── Cognitive memory ─────────────────────────────────────────────────────
    let cog_root = PathBuf::from(&config.cognitive.root);
    let cognitive_queue =
        Arc::new(CognitiveJobQueue::open(cog_root.join("queue")).context("opening job queue")?);
    let recovered = cognitive_queue
        .recover_stale(Duration::from_secs(config.cognitive.stale_timeout_secs))
        .context("recovering stale jobs")?;
    if recovered > 0 {
        tracing::info!(recovered, "stale cognitive jobs re-admitted");
    }
    let embedder: Arc<dyn Embedder> = if config.models.embedding.api_url.is_empty() {
        tracing::warn!("no embedding model configured; using the offline hashing embedder");
        Arc::new(HashingEmbedder::default())
    } else {
        Arc::new(HttpEmbedder::new(http.clone(), config.models.embedding.clone()))
    };
    let vector = Arc::new(
        VectorStore::open(&cog_root.join("chroma/collections.sqlite3"), embedder)
            .context("opening vector store")?,
    );
    let profiles = Arc::new(ProfileStorage::new(
        cog_root.join("profiles"),
        config.cognitive.revision_keep,
    ));
    let cognitive = CognitiveService::new(
        config_manager.clone(),
        cognitive_queue.clone(),
        vector.clone(),
        profiles.clone(),
    );
    let end_summaries = Arc::new(EndSummaryStorage::new(
        &config.cognitive.end_summary_path,
        config.cognitive.max_end_summaries,
    ));

    let historian = HistorianWorker::new(
        cognitive_queue,
        vector,
        profiles,
        requester.clone(),
        config_manager.clone(),
    );
    let historian_handle = config.cognitive.enabled.then(|| historian.spawn());

    // ── Core fabric ──────────────────────────────────────────────────────────
    let api = transport::JsonLinesTransport::new();
    let history = Arc::new(MemoryHistory::default());
    let sender = Sender::new(api.clone(), history.clone(), config.bot.name.clone());
    let prompt_builder = PromptBuilder::new(
        config_manager.clone(),
        Some(cognitive.clone()),
        end_summaries.clone(),
    );
    let ai = AiClient::new(
        config_manager.clone(),
        requester.clone(),
        tool_manager,
        prompt_builder,
        selector,
    );
    let security = SecurityService::new(config_manager.clone(), requester.clone());

    let coordinator = AICoordinator::new(
        config_manager.clone(),
        ai,
        history,
        sender,
        api,
        security,
        Some(cognitive),
        end_summaries,
        commands,
    );

    let queue = QueueManager::new(Duration::from_millis(config.queue.ai_request_interval_ms));
    coordinator.set_queue(queue.clone());
    let queue_handle = queue.spawn_worker(coordinator.clone());

    let task_store = Arc::new(JsonTaskStore::new(&config.scheduler.tasks_path));
    let runner = CoordinatorTaskRunner::new(coordinator.clone());
    let scheduler = TaskScheduler::new(task_store, runner, config.scheduler.task_retry_limit)
        .await
        .context("loading scheduled tasks")?;
    coordinator.set_scheduler(scheduler.clone());
    let scheduler_handle = scheduler.spawn();

    tracing::info!("corvid ready");

    // ── Run until EOF or ctrl-c ──────────────────────────────────────────────
    tokio::select! {
        _ = transport::run_event_loop(coordinator.clone()) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    // Orderly shutdown: stop admitting, drain the in-flight request, let the
    // historian finish its current job, then stop the watchers.
    queue_handle.stop(Duration::from_secs(3)).await;
    scheduler_handle.stop().await;
    if let Some(handle) = historian_handle {
        handle.stop().await;
    }
    for watch in hot_reloads {
        watch.stop().await;
    }
    tracing::info!("corvid stopped");
    Ok(())
}
