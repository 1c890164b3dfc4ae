// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Asynchronous token-usage recording.
//!
//! Every model call — successful or failed — produces one record.  Recording
//! must never block or fail the reply path, so records travel over an
//! unbounded channel to a background writer that appends JSONL.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::warn;

/// One recorded model call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenUsageRecord {
    pub timestamp: String,
    pub model_name: String,
    pub call_type: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub duration_seconds: f64,
    pub success: bool,
}

enum Sink {
    File(mpsc::UnboundedSender<TokenUsageRecord>),
    Memory(std::sync::Mutex<Vec<TokenUsageRecord>>),
    Disabled,
}

/// Fire-and-forget usage store.
pub struct TokenUsageStore {
    sink: Sink,
}

impl TokenUsageStore {
    /// Append records to a JSONL file via a background writer task.
    pub fn file(path: impl Into<PathBuf>) -> Arc<Self> {
        let path = path.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<TokenUsageRecord>();
        tokio::spawn(async move {
            if let Some(parent) = path.parent() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    warn!("token usage dir create failed: {e}");
                }
            }
            while let Some(record) = rx.recv().await {
                let line = match serde_json::to_string(&record) {
                    Ok(l) => l,
                    Err(e) => {
                        warn!("token usage serialize failed: {e}");
                        continue;
                    }
                };
                let result = async {
                    let mut file = tokio::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&path)
                        .await?;
                    file.write_all(line.as_bytes()).await?;
                    file.write_all(b"\n").await?;
                    Ok::<_, std::io::Error>(())
                }
                .await;
                if let Err(e) = result {
                    warn!(path = %path.display(), "token usage write failed: {e}");
                }
            }
        });
        Arc::new(Self {
            sink: Sink::File(tx),
        })
    }

    /// Keep records in memory (tests).
    pub fn memory() -> Arc<Self> {
        Arc::new(Self {
            sink: Sink::Memory(std::sync::Mutex::new(Vec::new())),
        })
    }

    /// Drop all records.
    pub fn disabled() -> Arc<Self> {
        Arc::new(Self {
            sink: Sink::Disabled,
        })
    }

    /// Record one call.  Never blocks.
    pub fn record(&self, record: TokenUsageRecord) {
        match &self.sink {
            Sink::File(tx) => {
                // The writer task only exits when the store is dropped.
                let _ = tx.send(record);
            }
            Sink::Memory(store) => {
                let mut v = match store.lock() {
                    Ok(v) => v,
                    Err(poisoned) => poisoned.into_inner(),
                };
                v.push(record);
            }
            Sink::Disabled => {}
        }
    }

    /// Recorded entries, for the in-memory sink only.
    pub fn records(&self) -> Vec<TokenUsageRecord> {
        match &self.sink {
            Sink::Memory(store) => match store.lock() {
                Ok(v) => v.clone(),
                Err(poisoned) => poisoned.into_inner().clone(),
            },
            _ => Vec::new(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(call_type: &str) -> TokenUsageRecord {
        TokenUsageRecord {
            timestamp: "2026-01-01T00:00:00Z".into(),
            model_name: "m".into(),
            call_type: call_type.into(),
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
            duration_seconds: 0.5,
            success: true,
        }
    }

    #[tokio::test]
    async fn memory_sink_collects_records() {
        let store = TokenUsageStore::memory();
        store.record(sample("chat"));
        store.record(sample("security"));
        let records = store.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].call_type, "security");
    }

    #[tokio::test]
    async fn disabled_sink_drops_records() {
        let store = TokenUsageStore::disabled();
        store.record(sample("chat"));
        assert!(store.records().is_empty());
    }

    #[tokio::test]
    async fn file_sink_appends_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.jsonl");
        let store = TokenUsageStore::file(&path);
        store.record(sample("chat"));
        store.record(sample("chat"));
        // The writer is asynchronous; poll briefly for both lines.
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if let Ok(text) = std::fs::read_to_string(&path) {
                if text.lines().count() == 2 {
                    let first: TokenUsageRecord =
                        serde_json::from_str(text.lines().next().unwrap()).unwrap();
                    assert_eq!(first.total_tokens, 15);
                    return;
                }
            }
        }
        panic!("usage file never reached 2 lines");
    }
}
