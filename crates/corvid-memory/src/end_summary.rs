// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Short-term recap layer: a bounded ring of `end` action summaries.

use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndSummaryLocation {
    /// `group` or `private`.
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndSummaryRecord {
    pub summary: String,
    #[serde(default)]
    pub location: Option<EndSummaryLocation>,
    pub timestamp: String,
}

/// Bounded ring of the most recent action summaries, persisted as one JSON
/// document.  Best-effort persistence: a failed write is logged, the
/// in-memory ring stays authoritative for the process lifetime.
pub struct EndSummaryStorage {
    path: PathBuf,
    max: usize,
    ring: Mutex<VecDeque<EndSummaryRecord>>,
}

impl EndSummaryStorage {
    pub fn new(path: impl Into<PathBuf>, max: usize) -> Self {
        let path = path.into();
        let ring = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str::<Vec<EndSummaryRecord>>(&text)
                .map(VecDeque::from)
                .unwrap_or_default(),
            Err(_) => VecDeque::new(),
        };
        Self {
            path,
            max: max.max(1),
            ring: Mutex::new(ring),
        }
    }

    pub fn make_record(summary: &str, location: Option<EndSummaryLocation>) -> EndSummaryRecord {
        EndSummaryRecord {
            summary: summary.trim().to_string(),
            location,
            timestamp: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }

    /// Append one record, evicting the oldest beyond the cap, and persist.
    pub fn append(&self, summary: &str, location: Option<EndSummaryLocation>) -> EndSummaryRecord {
        let record = Self::make_record(summary, location);
        let snapshot: Vec<EndSummaryRecord> = {
            let mut ring = self.lock_ring();
            ring.push_back(record.clone());
            while ring.len() > self.max {
                ring.pop_front();
            }
            ring.iter().cloned().collect()
        };
        if let Err(e) = self.persist(&snapshot) {
            warn!(path = %self.path.display(), "end summary persist failed: {e}");
        }
        record
    }

    /// Most-recent-last list of records.
    pub fn recent(&self) -> Vec<EndSummaryRecord> {
        self.lock_ring().iter().cloned().collect()
    }

    fn persist(&self, records: &[EndSummaryRecord]) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let dir = self
            .path
            .parent()
            .unwrap_or_else(|| std::path::Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(serde_json::to_string_pretty(records)?.as_bytes())?;
        tmp.persist(&self.path)?;
        Ok(())
    }

    fn lock_ring(&self) -> std::sync::MutexGuard<'_, VecDeque<EndSummaryRecord>> {
        match self.ring.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
