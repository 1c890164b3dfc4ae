// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Outbound message emission.
//!
//! Wraps the transport with history write-back, an opt-in recent-reply
//! de-dup ring, and the `message_sent_this_turn` flag the `end` tool checks.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use corvid_context::RequestContext;
use corvid_onebot::{OneBotApi, TransportError};

use crate::{HistoryEntry, HistoryStore};

const RECENT_REPLIES_CAP: usize = 50;

/// Per-send options.
#[derive(Debug, Clone, Copy)]
pub struct SendOptions {
    /// Skip the send when the identical body was sent recently.
    pub dedup: bool,
    /// Write the outbound message into history.
    pub auto_history: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            dedup: false,
            auto_history: true,
        }
    }
}

pub struct Sender {
    api: Arc<dyn OneBotApi>,
    history: Arc<dyn HistoryStore>,
    bot_name: String,
    recent: Mutex<VecDeque<String>>,
}

impl Sender {
    pub fn new(api: Arc<dyn OneBotApi>, history: Arc<dyn HistoryStore>, bot_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            api,
            history,
            bot_name: bot_name.into(),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_REPLIES_CAP)),
        })
    }

    /// Send to a group.  Returns `false` when de-dup suppressed the send.
    pub async fn send_group(
        &self,
        group_id: i64,
        text: &str,
        opts: SendOptions,
    ) -> Result<bool, TransportError> {
        if opts.dedup && self.is_recent_duplicate(text) {
            debug!(group_id, "duplicate reply suppressed");
            return Ok(false);
        }
        self.api.send_group_message(group_id, text).await?;
        self.after_send("group", &group_id.to_string(), text, opts).await;
        info!(group_id, len = text.chars().count(), "group message sent");
        Ok(true)
    }

    /// Send to a user.  Returns `false` when de-dup suppressed the send.
    pub async fn send_private(
        &self,
        user_id: i64,
        text: &str,
        opts: SendOptions,
    ) -> Result<bool, TransportError> {
        if opts.dedup && self.is_recent_duplicate(text) {
            debug!(user_id, "duplicate reply suppressed");
            return Ok(false);
        }
        self.api.send_private_message(user_id, text).await?;
        self.after_send("private", &user_id.to_string(), text, opts).await;
        info!(user_id, len = text.chars().count(), "private message sent");
        Ok(true)
    }

    async fn after_send(&self, kind: &str, chat_id: &str, text: &str, opts: SendOptions) {
        self.remember(text);
        if opts.auto_history {
            self.history
                .add_message(kind, chat_id, HistoryEntry::now("", self.bot_name.as_str(), text))
                .await;
        }
        if let Some(ctx) = RequestContext::current() {
            ctx.set_message_sent_this_turn(true);
        }
    }

    fn is_recent_duplicate(&self, text: &str) -> bool {
        let recent = match self.recent.lock() {
            Ok(r) => r,
            Err(poisoned) => poisoned.into_inner(),
        };
        recent.iter().any(|r| r == text)
    }

    fn remember(&self, text: &str) {
        let mut recent = match self.recent.lock() {
            Ok(r) => r,
            Err(poisoned) => poisoned.into_inner(),
        };
        recent.push_back(text.to_string());
        while recent.len() > RECENT_REPLIES_CAP {
            recent.pop_front();
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryHistory;
    use corvid_onebot::RecordingApi;

    fn sender() -> (Arc<RecordingApi>, Arc<MemoryHistory>, Arc<Sender>) {
        let api = RecordingApi::new();
        let history = Arc::new(MemoryHistory::new(10));
        let sender = Sender::new(api.clone(), history.clone(), "corvid");
        (api, history, sender)
    }

    #[tokio::test]
    async fn send_group_writes_history() {
        let (api, history, sender) = sender();
        sender
            .send_group(100, "hello", SendOptions::default())
            .await
            .unwrap();
        assert_eq!(api.sent_messages().len(), 1);
        let entries = history.get_recent("group", "100", 10).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "hello");
        assert_eq!(entries[0].display_name, "corvid");
    }

    #[tokio::test]
    async fn auto_history_false_skips_write_back() {
        let (_, history, sender) = sender();
        sender
            .send_private(
                7,
                "quiet",
                SendOptions {
                    auto_history: false,
                    ..SendOptions::default()
                },
            )
            .await
            .unwrap();
        assert!(history.get_recent("private", "7", 10).await.is_empty());
    }

    #[tokio::test]
    async fn dedup_suppresses_repeat_bodies() {
        let (api, _, sender) = sender();
        let opts = SendOptions {
            dedup: true,
            ..SendOptions::default()
        };
        assert!(sender.send_group(1, "same", opts).await.unwrap());
        assert!(!sender.send_group(1, "same", opts).await.unwrap());
        // Without dedup the repeat goes through.
        assert!(sender
            .send_group(1, "same", SendOptions::default())
            .await
            .unwrap());
        assert_eq!(api.sent_messages().len(), 2);
    }

    #[tokio::test]
    async fn send_sets_turn_flag_in_scope() {
        let (_, _, sender) = sender();
        let ctx = RequestContext::group(1, 2);
        ctx.scope(async {
            let cur = RequestContext::current().unwrap();
            assert!(!cur.message_sent_this_turn());
            sender
                .send_group(1, "reply", SendOptions::default())
                .await
                .unwrap();
            assert!(cur.message_sent_this_turn());
        })
        .await;
    }
}
