// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Chat history seam.
//!
//! Persistence of history is a storage capability outside the core; the
//! runtime depends on this trait and ships a bounded in-memory implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

/// One stored line of chat history.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub timestamp: String,
    pub user_id: String,
    pub display_name: String,
    pub message: String,
}

impl HistoryEntry {
    pub fn now(user_id: impl Into<String>, display_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            user_id: user_id.into(),
            display_name: display_name.into(),
            message: message.into(),
        }
    }

    /// `[time] name(id): text` line used in prompts and historian grounding.
    pub fn render_line(&self, max_len: usize) -> String {
        let mut message = self.message.trim().to_string();
        if message.chars().count() > max_len {
            let clipped: String = message.chars().take(max_len.saturating_sub(3)).collect();
            message = format!("{}...", clipped.trim_end());
        }
        let who = if self.display_name.is_empty() {
            format!("UID:{}", self.user_id)
        } else {
            self.display_name.clone()
        };
        let who = if self.user_id.is_empty() {
            who
        } else {
            format!("{who}({})", self.user_id)
        };
        if self.timestamp.is_empty() {
            format!("{who}: {message}")
        } else {
            format!("[{}] {who}: {message}", self.timestamp)
        }
    }
}

/// `kind` is `"group"` or `"private"`; `chat_id` the group or user id.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn add_message(&self, kind: &str, chat_id: &str, entry: HistoryEntry);
    /// The most recent `count` entries, oldest first.
    async fn get_recent(&self, kind: &str, chat_id: &str, count: usize) -> Vec<HistoryEntry>;
    /// Rewrite the text of the last message from `user_id` (injection
    /// placeholder).  Returns whether a message was found.
    async fn modify_last(&self, kind: &str, chat_id: &str, user_id: &str, new_text: &str) -> bool;
}

/// Bounded in-memory history, write-serialized per store.
pub struct MemoryHistory {
    cap: usize,
    chats: Mutex<HashMap<(String, String), Vec<HistoryEntry>>>,
}

impl MemoryHistory {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            chats: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryHistory {
    fn default() -> Self {
        Self::new(500)
    }
}

#[async_trait]
impl HistoryStore for MemoryHistory {
    async fn add_message(&self, kind: &str, chat_id: &str, entry: HistoryEntry) {
        let mut chats = self.chats.lock().await;
        let log = chats
            .entry((kind.to_string(), chat_id.to_string()))
            .or_default();
        log.push(entry);
        let excess = log.len().saturating_sub(self.cap);
        if excess > 0 {
            log.drain(..excess);
        }
    }

    async fn get_recent(&self, kind: &str, chat_id: &str, count: usize) -> Vec<HistoryEntry> {
        let chats = self.chats.lock().await;
        chats
            .get(&(kind.to_string(), chat_id.to_string()))
            .map(|log| {
                let start = log.len().saturating_sub(count);
                log[start..].to_vec()
            })
            .unwrap_or_default()
    }

    async fn modify_last(&self, kind: &str, chat_id: &str, user_id: &str, new_text: &str) -> bool {
        let mut chats = self.chats.lock().await;
        let Some(log) = chats.get_mut(&(kind.to_string(), chat_id.to_string())) else {
            return false;
        };
        for entry in log.iter_mut().rev() {
            if entry.user_id == user_id {
                entry.message = new_text.to_string();
                return true;
            }
        }
        false
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
