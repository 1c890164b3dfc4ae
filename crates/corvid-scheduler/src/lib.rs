// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod scheduler;
mod store;
mod task;

use thiserror::Error;

pub use scheduler::{SchedulerHandle, TaskPatch, TaskRunner, TaskScheduler};
pub use store::{JsonTaskStore, MemoryTaskStore, TaskStore};
pub use task::{parse_cron, ExecutionMode, ScheduledTask, TaskMode, ToolStep};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid task: {0}")]
    Invalid(String),

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("task storage error: {0}")]
    Storage(String),

    #[error("task execution error: {0}")]
    Execution(String),
}
