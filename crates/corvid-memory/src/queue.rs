// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Durable on-disk cognitive job queue.
//!
//! Three sibling directories carry the lifecycle:
//! `pending/ → processing/ → (deleted | failed/)`.  Every transition is an
//! atomic rename, so a crash at any point leaves each job in exactly one
//! directory and `recover_stale` can re-admit interrupted work at boot.
//!
//! File names are job ids (`{YYYYMMDDHHMMSSffffff}_{uuid8}.json`), so the
//! lexicographically smallest pending file is the oldest — dequeue is FIFO.
//! Producers serialize through create-temp-then-rename; dequeue is
//! single-consumer.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{info, warn};

use crate::{CognitiveJob, MemoryError};

pub struct CognitiveJobQueue {
    pending: PathBuf,
    processing: PathBuf,
    failed: PathBuf,
}

impl CognitiveJobQueue {
    /// Open (and create) the queue under `queue_root`.
    pub fn open(queue_root: impl Into<PathBuf>) -> Result<Self, MemoryError> {
        let root = queue_root.into();
        let queue = Self {
            pending: root.join("pending"),
            processing: root.join("processing"),
            failed: root.join("failed"),
        };
        for dir in [&queue.pending, &queue.processing, &queue.failed] {
            std::fs::create_dir_all(dir).map_err(|e| MemoryError::io(dir, e))?;
        }
        Ok(queue)
    }

    pub fn failed_dir(&self) -> &Path {
        &self.failed
    }

    fn new_job_id() -> String {
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S%6f");
        let suffix = &uuid::Uuid::new_v4().simple().to_string()[..8];
        format!("{stamp}_{suffix}")
    }

    /// Write one job into `pending/` atomically.  Returns the job id.
    pub fn enqueue(&self, job: &CognitiveJob) -> Result<String, MemoryError> {
        let job_id = Self::new_job_id();
        let target = self.pending.join(format!("{job_id}.json"));
        let body = serde_json::to_string_pretty(job)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.pending)
            .map_err(|e| MemoryError::io(&self.pending, e))?;
        tmp.write_all(body.as_bytes())
            .map_err(|e| MemoryError::io(&target, e))?;
        tmp.persist(&target)
            .map_err(|e| MemoryError::io(&target, e.error))?;
        info!(job_id = %job_id, "cognitive job enqueued");
        Ok(job_id)
    }

    /// Claim the oldest pending job: move it to `processing/` and parse it.
    ///
    /// Unparseable files are moved to `failed/` and the next candidate is
    /// tried, so one corrupt file cannot wedge the queue.
    pub fn dequeue(&self) -> Result<Option<(String, CognitiveJob)>, MemoryError> {
        loop {
            let Some(name) = self.oldest_pending()? else {
                return Ok(None);
            };
            let job_id = name.trim_end_matches(".json").to_string();
            let from = self.pending.join(&name);
            let to = self.processing.join(&name);
            match std::fs::rename(&from, &to) {
                Ok(()) => {}
                // Lost a race with a concurrent recover/trim; try the next file.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(MemoryError::io(&from, e)),
            }
            let text = std::fs::read_to_string(&to).map_err(|e| MemoryError::io(&to, e))?;
            match serde_json::from_str::<CognitiveJob>(&text) {
                Ok(job) => return Ok(Some((job_id, job))),
                Err(e) => {
                    warn!(job_id = %job_id, "unparseable job moved to failed: {e}");
                    self.fail(&job_id, &format!("parse error: {e}"))?;
                }
            }
        }
    }

    fn oldest_pending(&self) -> Result<Option<String>, MemoryError> {
        let entries =
            std::fs::read_dir(&self.pending).map_err(|e| MemoryError::io(&self.pending, e))?;
        let mut names: Vec<String> = entries
            .flatten()
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|n| n.ends_with(".json"))
            .collect();
        names.sort();
        Ok(names.into_iter().next())
    }

    /// Move a processing job back to `pending/`, incrementing its retry
    /// counter.
    pub fn requeue(&self, job_id: &str, reason: &str) -> Result<(), MemoryError> {
        let name = format!("{job_id}.json");
        let from = self.processing.join(&name);
        let text = std::fs::read_to_string(&from).map_err(|e| MemoryError::io(&from, e))?;
        let mut job: CognitiveJob = serde_json::from_str(&text)?;
        job.retry_count += 1;
        warn!(job_id = %job_id, retry = job.retry_count, "cognitive job requeued: {reason}");

        let target = self.pending.join(&name);
        let mut tmp = tempfile::NamedTempFile::new_in(&self.pending)
            .map_err(|e| MemoryError::io(&self.pending, e))?;
        tmp.write_all(serde_json::to_string_pretty(&job)?.as_bytes())
            .map_err(|e| MemoryError::io(&target, e))?;
        tmp.persist(&target)
            .map_err(|e| MemoryError::io(&target, e.error))?;
        std::fs::remove_file(&from).map_err(|e| MemoryError::io(&from, e))?;
        Ok(())
    }

    /// Move a processing job to `failed/`, original JSON intact.
    pub fn fail(&self, job_id: &str, reason: &str) -> Result<(), MemoryError> {
        let name = format!("{job_id}.json");
        let from = self.processing.join(&name);
        let to = self.failed.join(&name);
        std::fs::rename(&from, &to).map_err(|e| MemoryError::io(&from, e))?;
        warn!(job_id = %job_id, "cognitive job failed: {reason}");
        Ok(())
    }

    /// Delete a completed job from `processing/`.
    pub fn complete(&self, job_id: &str) -> Result<(), MemoryError> {
        let path = self.processing.join(format!("{job_id}.json"));
        std::fs::remove_file(&path).map_err(|e| MemoryError::io(&path, e))
    }

    /// Move `processing/` files older than `timeout` back to `pending/`.
    /// Run at startup; returns the number of recovered jobs.
    pub fn recover_stale(&self, timeout: Duration) -> Result<usize, MemoryError> {
        let entries = std::fs::read_dir(&self.processing)
            .map_err(|e| MemoryError::io(&self.processing, e))?;
        let now = SystemTime::now();
        let mut recovered = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(meta) = entry.metadata() else { continue };
            let Ok(modified) = meta.modified() else { continue };
            let age = now.duration_since(modified).unwrap_or_default();
            if age >= timeout {
                let to = self.pending.join(entry.file_name());
                if let Err(e) = std::fs::rename(&path, &to) {
                    warn!(path = %path.display(), "stale recovery rename failed: {e}");
                } else {
                    recovered += 1;
                }
            }
        }
        if recovered > 0 {
            info!(recovered, "stale cognitive jobs recovered");
        }
        Ok(recovered)
    }

    /// Prune `failed/` by age and file-count caps.
    pub fn cleanup_failed(&self, max_age: Duration, max_files: usize) -> Result<usize, MemoryError> {
        let entries =
            std::fs::read_dir(&self.failed).map_err(|e| MemoryError::io(&self.failed, e))?;
        let now = SystemTime::now();
        let mut files: Vec<(PathBuf, SystemTime)> = entries
            .flatten()
            .filter_map(|e| {
                let modified = e.metadata().ok()?.modified().ok()?;
                Some((e.path(), modified))
            })
            .collect();

        let mut removed = 0;
        files.retain(|(path, modified)| {
            let age = now.duration_since(*modified).unwrap_or_default();
            if age >= max_age {
                if std::fs::remove_file(path).is_ok() {
                    removed += 1;
                }
                false
            } else {
                true
            }
        });

        if files.len() > max_files {
            // Oldest first.
            files.sort_by_key(|(_, modified)| *modified);
            let excess = files.len() - max_files;
            for (path, _) in files.into_iter().take(excess) {
                if std::fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Pending file count, for diagnostics.
    pub fn pending_len(&self) -> usize {
        std::fs::read_dir(&self.pending)
            .map(|entries| entries.flatten().count())
            .unwrap_or(0)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
