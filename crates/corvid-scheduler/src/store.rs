// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Pluggable task persistence.

use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::{ScheduledTask, SchedulerError};

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn load(&self) -> Result<Vec<ScheduledTask>, SchedulerError>;
    async fn save(&self, tasks: &[ScheduledTask]) -> Result<(), SchedulerError>;
}

/// Single-file JSON store with atomic replace.
pub struct JsonTaskStore {
    path: PathBuf,
}

impl JsonTaskStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TaskStore for JsonTaskStore {
    async fn load(&self) -> Result<Vec<ScheduledTask>, SchedulerError> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| SchedulerError::Storage(format!("{}: {e}", self.path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(SchedulerError::Storage(format!(
                "{}: {e}",
                self.path.display()
            ))),
        }
    }

    async fn save(&self, tasks: &[ScheduledTask]) -> Result<(), SchedulerError> {
        let map_err =
            |e: std::io::Error| SchedulerError::Storage(format!("{}: {e}", self.path.display()));
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(map_err)?;
        }
        let dir = self
            .path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        let body = serde_json::to_string_pretty(tasks)
            .map_err(|e| SchedulerError::Storage(e.to_string()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(map_err)?;
        tmp.write_all(body.as_bytes()).map_err(map_err)?;
        tmp.persist(&self.path)
            .map_err(|e| SchedulerError::Storage(format!("{}: {}", self.path.display(), e.error)))?;
        Ok(())
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: std::sync::Mutex<Vec<ScheduledTask>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn load(&self) -> Result<Vec<ScheduledTask>, SchedulerError> {
        let tasks = match self.tasks.lock() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(tasks.clone())
    }

    async fn save(&self, tasks: &[ScheduledTask]) -> Result<(), SchedulerError> {
        let mut slot = match self.tasks.lock() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = tasks.to_vec();
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
