// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The cron scheduler.
//!
//! Task execution is decoupled through [`TaskRunner`], which the core
//! implements at wiring time: `run_tool` routes through the skill dispatch,
//! `self_call` feeds the LLM loop as if the bot had received a user message,
//! and `notify` delivers result/failure messages to the task's target.
//!
//! Distinct tasks fire concurrently; a per-task running guard skips fires
//! that would overlap a still-running execution (missed fires are dropped).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::{ExecutionMode, ScheduledTask, SchedulerError, TaskMode, TaskStore, ToolStep};

/// Execution seam provided by the runtime.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Execute one tool on behalf of a scheduled task.
    async fn run_tool(
        &self,
        tool_name: &str,
        args: &serde_json::Value,
        task: &ScheduledTask,
    ) -> Result<String, SchedulerError>;

    /// Feed the LLM loop with a system-authored user message.
    async fn self_call(&self, prompt: &str, task: &ScheduledTask) -> Result<(), SchedulerError>;

    /// Deliver a message to the task's target (no-op when it has none).
    async fn notify(&self, task: &ScheduledTask, message: &str);
}

/// Patch for `update_task`; unset fields keep their current values.
#[derive(Debug, Default, Clone)]
pub struct TaskPatch {
    pub cron: Option<String>,
    pub tool_name: Option<String>,
    pub tool_args: Option<serde_json::Value>,
    pub task_name: Option<String>,
    pub max_executions: Option<u32>,
}

pub struct TaskScheduler {
    store: Arc<dyn TaskStore>,
    runner: Arc<dyn TaskRunner>,
    retry_limit: u32,
    tasks: Mutex<HashMap<String, ScheduledTask>>,
    running: Arc<StdMutex<HashSet<String>>>,
}

pub struct SchedulerHandle {
    stop_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl SchedulerHandle {
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.task.await;
    }
}

impl TaskScheduler {
    /// Create the scheduler and load persisted tasks.
    pub async fn new(
        store: Arc<dyn TaskStore>,
        runner: Arc<dyn TaskRunner>,
        retry_limit: u32,
    ) -> Result<Arc<Self>, SchedulerError> {
        let loaded = store.load().await?;
        let mut tasks = HashMap::new();
        for task in loaded {
            if let Err(e) = task.validate() {
                warn!(task_id = %task.task_id, "dropping invalid persisted task: {e}");
                continue;
            }
            tasks.insert(task.task_id.clone(), task);
        }
        info!(count = tasks.len(), "scheduler loaded persisted tasks");
        Ok(Arc::new(Self {
            store,
            runner,
            retry_limit: retry_limit.max(1),
            tasks: Mutex::new(tasks),
            running: Arc::new(StdMutex::new(HashSet::new())),
        }))
    }

    /// Add (or replace — idempotent by id) a task.
    pub async fn add_task(&self, task: ScheduledTask) -> Result<(), SchedulerError> {
        task.validate()?;
        let snapshot = {
            let mut tasks = self.tasks.lock().await;
            tasks.insert(task.task_id.clone(), task.clone());
            tasks.values().cloned().collect::<Vec<_>>()
        };
        self.store.save(&snapshot).await?;
        info!(task_id = %task.task_id, cron = %task.cron, "scheduled task added");
        Ok(())
    }

    /// Update fields of an existing task.  Unknown ids are an error.
    pub async fn update_task(&self, task_id: &str, patch: TaskPatch) -> Result<(), SchedulerError> {
        let snapshot = {
            let mut tasks = self.tasks.lock().await;
            let task = tasks
                .get_mut(task_id)
                .ok_or_else(|| SchedulerError::UnknownTask(task_id.to_string()))?;
            if let Some(cron) = patch.cron {
                crate::parse_cron(&cron)?;
                task.cron = cron;
            }
            if let Some(tool_name) = patch.tool_name {
                task.tool_name = Some(tool_name);
            }
            if let Some(tool_args) = patch.tool_args {
                task.tool_args = tool_args;
            }
            if let Some(task_name) = patch.task_name {
                task.task_name = task_name;
            }
            if let Some(max) = patch.max_executions {
                task.max_executions = Some(max);
            }
            task.validate()?;
            tasks.values().cloned().collect::<Vec<_>>()
        };
        self.store.save(&snapshot).await?;
        info!(task_id, "scheduled task updated");
        Ok(())
    }

    /// Remove a task.  Returns whether it existed.
    pub async fn remove_task(&self, task_id: &str) -> Result<bool, SchedulerError> {
        let (existed, snapshot) = {
            let mut tasks = self.tasks.lock().await;
            let existed = tasks.remove(task_id).is_some();
            (existed, tasks.values().cloned().collect::<Vec<_>>())
        };
        if existed {
            self.store.save(&snapshot).await?;
            info!(task_id, "scheduled task removed");
        }
        Ok(existed)
    }

    pub async fn list_tasks(&self) -> Vec<ScheduledTask> {
        let tasks = self.tasks.lock().await;
        let mut list: Vec<ScheduledTask> = tasks.values().cloned().collect();
        list.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        list
    }

    pub async fn get_task(&self, task_id: &str) -> Option<ScheduledTask> {
        self.tasks.lock().await.get(task_id).cloned()
    }

    /// Start the fire loop.
    pub fn spawn(self: &Arc<Self>) -> SchedulerHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let scheduler = self.clone();
        let task = tokio::spawn(async move {
            let mut next_fires: HashMap<String, chrono::DateTime<Local>> = HashMap::new();
            loop {
                if *stop_rx.borrow() {
                    break;
                }
                let now = Local::now();
                let tasks = scheduler.list_tasks().await;

                // Drop schedule entries of removed tasks.
                next_fires.retain(|id, _| tasks.iter().any(|t| t.task_id == *id));

                let mut earliest: Option<chrono::DateTime<Local>> = None;
                for task in &tasks {
                    let entry = next_fires.entry(task.task_id.clone()).or_insert_with(|| {
                        task.next_fire(now).unwrap_or(now + chrono::Duration::days(3650))
                    });
                    if *entry <= now {
                        // Recompute first: a slow execution drops missed fires.
                        *entry = task
                            .next_fire(now)
                            .unwrap_or(now + chrono::Duration::days(3650));
                        scheduler.spawn_fire(task.task_id.clone());
                    }
                    earliest = match earliest {
                        Some(e) if e <= *entry => Some(e),
                        _ => Some(*entry),
                    };
                }

                let sleep = earliest
                    .map(|e| (e - Local::now()).to_std().unwrap_or(Duration::from_millis(200)))
                    .unwrap_or(Duration::from_secs(5))
                    .clamp(Duration::from_millis(200), Duration::from_secs(30));
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = tokio::time::sleep(sleep) => {}
                }
            }
            info!("scheduler loop stopped");
        });
        info!("scheduler loop started");
        SchedulerHandle { stop_tx, task }
    }

    fn spawn_fire(self: &Arc<Self>, task_id: String) {
        {
            let mut running = match self.running.lock() {
                Ok(r) => r,
                Err(poisoned) => poisoned.into_inner(),
            };
            if !running.insert(task_id.clone()) {
                warn!(task_id = %task_id, "previous fire still running, dropping this fire");
                return;
            }
        }
        let scheduler = self.clone();
        tokio::spawn(async move {
            if let Err(e) = scheduler.fire_now(&task_id).await {
                warn!(task_id = %task_id, "task fire failed: {e}");
            }
            let mut running = match scheduler.running.lock() {
                Ok(r) => r,
                Err(poisoned) => poisoned.into_inner(),
            };
            running.remove(&task_id);
        });
    }

    /// Execute one task immediately (also the body of a scheduled fire).
    pub async fn fire_now(&self, task_id: &str) -> Result<(), SchedulerError> {
        let Some(task) = self.get_task(task_id).await else {
            return Err(SchedulerError::UnknownTask(task_id.to_string()));
        };
        info!(task_id, mode = ?task.mode(), "executing scheduled task");

        let outcome = match task.mode() {
            TaskMode::SelfCall => {
                let prompt = task.self_instruction.clone().unwrap_or_default();
                self.runner.self_call(&prompt, &task).await.map(|_| None)
            }
            TaskMode::Single => {
                let tool_name = task.tool_name.clone().unwrap_or_default();
                self.run_step_with_retries(&tool_name, &task.tool_args, &task)
                    .await
                    .map(Some)
            }
            TaskMode::Multi => self.run_batch(&task).await.map(Some),
        };

        match outcome {
            Ok(result) => {
                if let Some(text) = result.filter(|t| !t.is_empty()) {
                    if task.target_id.is_some() {
                        let label = task
                            .tool_name
                            .clone()
                            .unwrap_or_else(|| task.task_name.clone());
                        self.runner
                            .notify(
                                &task,
                                &format!("【定时任务执行结果】\n工具: {label}\n结果:\n{text}"),
                            )
                            .await;
                    }
                }
                self.record_execution(task_id).await?;
                info!(task_id, "scheduled task completed");
                Ok(())
            }
            Err(e) => {
                warn!(task_id, "scheduled task failed: {e}");
                if task.target_id.is_some() {
                    let label = task
                        .tool_name
                        .clone()
                        .unwrap_or_else(|| task.task_name.clone());
                    self.runner
                        .notify(
                            &task,
                            &format!("【定时任务执行失败】\n工具: {label}\n错误: {e}"),
                        )
                        .await;
                }
                // Failed fires never remove the task.
                Err(e)
            }
        }
    }

    async fn run_batch(&self, task: &ScheduledTask) -> Result<String, SchedulerError> {
        let steps: Vec<ToolStep> = task.tools.clone().unwrap_or_default();
        let mut results: Vec<String> = Vec::with_capacity(steps.len());
        match task.execution_mode {
            ExecutionMode::Serial => {
                for step in &steps {
                    let result = self
                        .run_step_with_retries(&step.tool_name, &step.tool_args, task)
                        .await?;
                    results.push(format!("{}: {result}", step.tool_name));
                }
            }
            ExecutionMode::Parallel => {
                let futures: Vec<_> = steps
                    .iter()
                    .map(|step| self.run_step_with_retries(&step.tool_name, &step.tool_args, task))
                    .collect();
                let outputs = futures::future::join_all(futures).await;
                for (step, output) in steps.iter().zip(outputs) {
                    results.push(format!("{}: {}", step.tool_name, output?));
                }
            }
        }
        Ok(results.join("\n"))
    }

    async fn run_step_with_retries(
        &self,
        tool_name: &str,
        args: &serde_json::Value,
        task: &ScheduledTask,
    ) -> Result<String, SchedulerError> {
        let mut last_err = None;
        for attempt in 1..=self.retry_limit {
            match self.runner.run_tool(tool_name, args, task).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    warn!(
                        task_id = %task.task_id,
                        tool = tool_name,
                        attempt,
                        limit = self.retry_limit,
                        "tool step failed: {e}"
                    );
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| SchedulerError::Invalid("no attempts made".into())))
    }

    /// Count one successful fire; retire the task at `max_executions`.
    async fn record_execution(&self, task_id: &str) -> Result<(), SchedulerError> {
        let (retire, snapshot) = {
            let mut tasks = self.tasks.lock().await;
            let Some(task) = tasks.get_mut(task_id) else {
                return Ok(());
            };
            task.current_executions += 1;
            let retire = task
                .max_executions
                .map(|max| task.current_executions >= max)
                .unwrap_or(false);
            if retire {
                tasks.remove(task_id);
            }
            (retire, tasks.values().cloned().collect::<Vec<_>>())
        };
        self.store.save(&snapshot).await?;
        if retire {
            info!(task_id, "task reached max executions, removed");
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryTaskStore;

    /// Records every runner interaction; failures are scripted by tool name.
    #[derive(Default)]
    struct RecordingRunner {
        tool_calls: StdMutex<Vec<(String, serde_json::Value)>>,
        self_calls: StdMutex<Vec<String>>,
        notifications: StdMutex<Vec<String>>,
        fail_tools: StdMutex<HashSet<String>>,
        fail_times: StdMutex<HashMap<String, u32>>,
    }

    impl RecordingRunner {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn fail_always(&self, tool: &str) {
            self.fail_tools.lock().unwrap().insert(tool.to_string());
        }

        fn fail_n_times(&self, tool: &str, n: u32) {
            self.fail_times.lock().unwrap().insert(tool.to_string(), n);
        }

        fn tool_calls(&self) -> Vec<(String, serde_json::Value)> {
            self.tool_calls.lock().unwrap().clone()
        }

        fn notifications(&self) -> Vec<String> {
            self.notifications.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TaskRunner for RecordingRunner {
        async fn run_tool(
            &self,
            tool_name: &str,
            args: &serde_json::Value,
            _task: &ScheduledTask,
        ) -> Result<String, SchedulerError> {
            self.tool_calls
                .lock()
                .unwrap()
                .push((tool_name.to_string(), args.clone()));
            if self.fail_tools.lock().unwrap().contains(tool_name) {
                return Err(SchedulerError::Execution(format!("{tool_name} broke")));
            }
            let mut fail_times = self.fail_times.lock().unwrap();
            if let Some(remaining) = fail_times.get_mut(tool_name) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(SchedulerError::Execution("transient".into()));
                }
            }
            Ok(format!("{tool_name} ok"))
        }

        async fn self_call(
            &self,
            prompt: &str,
            _task: &ScheduledTask,
        ) -> Result<(), SchedulerError> {
            self.self_calls.lock().unwrap().push(prompt.to_string());
            Ok(())
        }

        async fn notify(&self, _task: &ScheduledTask, message: &str) {
            self.notifications.lock().unwrap().push(message.to_string());
        }
    }

    fn single(id: &str, tool: &str) -> ScheduledTask {
        ScheduledTask {
            task_id: id.into(),
            cron: "* * * * *".into(),
            task_name: "test".into(),
            tool_name: Some(tool.into()),
            tool_args: serde_json::json!({"k": 1}),
            tools: None,
            execution_mode: ExecutionMode::Serial,
            self_instruction: None,
            target_id: Some(100),
            target_type: "group".into(),
            max_executions: None,
            current_executions: 0,
        }
    }

    async fn scheduler(runner: Arc<RecordingRunner>) -> Arc<TaskScheduler> {
        TaskScheduler::new(Arc::new(MemoryTaskStore::new()), runner, 2)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn add_is_idempotent_by_id() {
        let runner = RecordingRunner::new();
        let sched = scheduler(runner).await;
        sched.add_task(single("t1", "a")).await.unwrap();
        let mut replacement = single("t1", "b");
        replacement.task_name = "replaced".into();
        sched.add_task(replacement).await.unwrap();
        let tasks = sched.list_tasks().await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].tool_name.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn update_patches_fields() {
        let runner = RecordingRunner::new();
        let sched = scheduler(runner).await;
        sched.add_task(single("t1", "a")).await.unwrap();
        sched
            .update_task(
                "t1",
                TaskPatch {
                    cron: Some("30 8 * * *".into()),
                    max_executions: Some(5),
                    ..TaskPatch::default()
                },
            )
            .await
            .unwrap();
        let task = sched.get_task("t1").await.unwrap();
        assert_eq!(task.cron, "30 8 * * *");
        assert_eq!(task.max_executions, Some(5));
        // Unknown id errors.
        assert!(sched
            .update_task("nope", TaskPatch::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn remove_reports_existence() {
        let runner = RecordingRunner::new();
        let sched = scheduler(runner).await;
        sched.add_task(single("t1", "a")).await.unwrap();
        assert!(sched.remove_task("t1").await.unwrap());
        assert!(!sched.remove_task("t1").await.unwrap());
    }

    #[tokio::test]
    async fn fire_single_notifies_result_and_counts() {
        let runner = RecordingRunner::new();
        let sched = scheduler(runner.clone()).await;
        sched.add_task(single("t1", "get_time")).await.unwrap();
        sched.fire_now("t1").await.unwrap();
        assert_eq!(runner.tool_calls().len(), 1);
        let notes = runner.notifications();
        assert_eq!(notes.len(), 1);
        assert!(notes[0].contains("定时任务执行结果"));
        assert!(notes[0].contains("get_time ok"));
        assert_eq!(sched.get_task("t1").await.unwrap().current_executions, 1);
    }

    #[tokio::test]
    async fn max_executions_retires_task() {
        let runner = RecordingRunner::new();
        let sched = scheduler(runner).await;
        let mut task = single("t1", "a");
        task.max_executions = Some(2);
        sched.add_task(task).await.unwrap();
        sched.fire_now("t1").await.unwrap();
        assert!(sched.get_task("t1").await.is_some());
        sched.fire_now("t1").await.unwrap();
        assert!(sched.get_task("t1").await.is_none());
    }

    #[tokio::test]
    async fn failure_notifies_and_keeps_task() {
        let runner = RecordingRunner::new();
        runner.fail_always("broken");
        let sched = scheduler(runner.clone()).await;
        sched.add_task(single("t1", "broken")).await.unwrap();
        assert!(sched.fire_now("t1").await.is_err());
        let notes = runner.notifications();
        assert_eq!(notes.len(), 1);
        assert!(notes[0].contains("定时任务执行失败"));
        // Not removed, execution count unchanged.
        let task = sched.get_task("t1").await.unwrap();
        assert_eq!(task.current_executions, 0);
        // Retried up to the limit (2 attempts).
        assert_eq!(runner.tool_calls().len(), 2);
    }

    #[tokio::test]
    async fn transient_failure_succeeds_on_retry() {
        let runner = RecordingRunner::new();
        runner.fail_n_times("flaky", 1);
        let sched = scheduler(runner.clone()).await;
        sched.add_task(single("t1", "flaky")).await.unwrap();
        sched.fire_now("t1").await.unwrap();
        assert_eq!(runner.tool_calls().len(), 2);
        assert!(runner.notifications()[0].contains("flaky ok"));
    }

    #[tokio::test]
    async fn serial_batch_runs_in_order() {
        let runner = RecordingRunner::new();
        let sched = scheduler(runner.clone()).await;
        let mut task = single("t1", "unused");
        task.tool_name = None;
        task.tools = Some(vec![
            ToolStep {
                tool_name: "first".into(),
                tool_args: serde_json::json!({}),
            },
            ToolStep {
                tool_name: "second".into(),
                tool_args: serde_json::json!({}),
            },
        ]);
        sched.add_task(task).await.unwrap();
        sched.fire_now("t1").await.unwrap();
        let calls: Vec<String> = runner.tool_calls().into_iter().map(|(n, _)| n).collect();
        assert_eq!(calls, vec!["first", "second"]);
        let note = &runner.notifications()[0];
        assert!(note.contains("first: first ok"));
        assert!(note.contains("second: second ok"));
    }

    #[tokio::test]
    async fn parallel_batch_reports_all_steps() {
        let runner = RecordingRunner::new();
        let sched = scheduler(runner.clone()).await;
        let mut task = single("t1", "unused");
        task.tool_name = None;
        task.execution_mode = ExecutionMode::Parallel;
        task.tools = Some(vec![
            ToolStep {
                tool_name: "a".into(),
                tool_args: serde_json::json!({}),
            },
            ToolStep {
                tool_name: "b".into(),
                tool_args: serde_json::json!({}),
            },
        ]);
        sched.add_task(task).await.unwrap();
        sched.fire_now("t1").await.unwrap();
        assert_eq!(runner.tool_calls().len(), 2);
        // Report order follows step order regardless of completion order.
        let note = &runner.notifications()[0];
        let a_pos = note.find("a: a ok").unwrap();
        let b_pos = note.find("b: b ok").unwrap();
        assert!(a_pos < b_pos);
    }

    #[tokio::test]
    async fn self_call_reaches_runner_and_counts() {
        let runner = RecordingRunner::new();
        let sched = scheduler(runner.clone()).await;
        let mut task = single("t1", "unused");
        task.tool_name = None;
        task.self_instruction = Some("列出待办前三项".into());
        sched.add_task(task).await.unwrap();
        sched.fire_now("t1").await.unwrap();
        assert_eq!(
            runner.self_calls.lock().unwrap().clone(),
            vec!["列出待办前三项"]
        );
        // No result notification for self-call mode (the loop sends its own
        // messages), but the execution still counts.
        assert!(runner.notifications().is_empty());
        assert_eq!(sched.get_task("t1").await.unwrap().current_executions, 1);
    }

    #[tokio::test]
    async fn invalid_persisted_tasks_are_dropped_on_load() {
        let store = Arc::new(MemoryTaskStore::new());
        let mut bad = single("bad", "t");
        bad.cron = "nonsense".into();
        store.save(&[bad, single("good", "t")]).await.unwrap();
        let sched = TaskScheduler::new(store, RecordingRunner::new(), 1)
            .await
            .unwrap();
        let tasks = sched.list_tasks().await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_id, "good");
    }
}
