// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The narrow transport API the runtime calls.
//!
//! The concrete client (WebSocket framing, reconnection) lives outside this
//! workspace's scope; the runtime only depends on this trait.  Message bodies
//! are CQ-code strings, the form the transport accepts for mixed content.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport send failed: {0}")]
    Send(String),
    #[error("transport call failed: {0}")]
    Call(String),
}

/// One history entry returned by `get_group_msg_history`.
#[derive(Debug, Clone)]
pub struct HistoryMessage {
    pub message_id: i64,
    pub user_id: i64,
    pub nickname: String,
    pub content: String,
    pub time: i64,
}

#[async_trait]
pub trait OneBotApi: Send + Sync {
    async fn send_group_message(&self, group_id: i64, message: &str)
        -> Result<(), TransportError>;
    async fn send_private_message(&self, user_id: i64, message: &str)
        -> Result<(), TransportError>;
    async fn send_like(&self, user_id: i64, times: u32) -> Result<(), TransportError>;
    async fn get_group_msg_history(
        &self,
        group_id: i64,
        count: u32,
    ) -> Result<Vec<HistoryMessage>, TransportError>;
    /// Resolve an image file token to a fetchable URL.
    async fn get_image(&self, file: &str) -> Result<Option<String>, TransportError>;
    async fn get_msg(&self, message_id: i64) -> Result<Option<serde_json::Value>, TransportError>;
    async fn get_forward_msg(&self, id: &str) -> Result<Vec<serde_json::Value>, TransportError>;
    async fn send_group_poke(&self, group_id: i64, user_id: i64) -> Result<(), TransportError>;
    async fn send_private_poke(&self, user_id: i64) -> Result<(), TransportError>;
    async fn set_msg_emoji_like(
        &self,
        message_id: i64,
        emoji_id: &str,
    ) -> Result<(), TransportError>;
}

/// Recording stub used in tests and by the JSON-lines debug transport.
#[derive(Default)]
pub struct RecordingApi {
    pub sent: std::sync::Mutex<Vec<(String, i64, String)>>,
}

impl RecordingApi {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    /// `(kind, target_id, body)` tuples in send order.
    pub fn sent_messages(&self) -> Vec<(String, i64, String)> {
        match self.sent.lock() {
            Ok(v) => v.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn push(&self, kind: &str, id: i64, body: &str) {
        let mut v = match self.sent.lock() {
            Ok(v) => v,
            Err(poisoned) => poisoned.into_inner(),
        };
        v.push((kind.to_string(), id, body.to_string()));
    }
}

#[async_trait]
impl OneBotApi for RecordingApi {
    async fn send_group_message(
        &self,
        group_id: i64,
        message: &str,
    ) -> Result<(), TransportError> {
        self.push("group", group_id, message);
        Ok(())
    }

    async fn send_private_message(
        &self,
        user_id: i64,
        message: &str,
    ) -> Result<(), TransportError> {
        self.push("private", user_id, message);
        Ok(())
    }

    async fn send_like(&self, user_id: i64, _times: u32) -> Result<(), TransportError> {
        self.push("like", user_id, "");
        Ok(())
    }

    async fn get_group_msg_history(
        &self,
        _group_id: i64,
        _count: u32,
    ) -> Result<Vec<HistoryMessage>, TransportError> {
        Ok(Vec::new())
    }

    async fn get_image(&self, _file: &str) -> Result<Option<String>, TransportError> {
        Ok(None)
    }

    async fn get_msg(&self, _message_id: i64) -> Result<Option<serde_json::Value>, TransportError> {
        Ok(None)
    }

    async fn get_forward_msg(&self, _id: &str) -> Result<Vec<serde_json::Value>, TransportError> {
        Ok(Vec::new())
    }

    async fn send_group_poke(&self, group_id: i64, _user_id: i64) -> Result<(), TransportError> {
        self.push("poke", group_id, "");
        Ok(())
    }

    async fn send_private_poke(&self, user_id: i64) -> Result<(), TransportError> {
        self.push("poke", user_id, "");
        Ok(())
    }

    async fn set_msg_emoji_like(
        &self,
        message_id: i64,
        emoji_id: &str,
    ) -> Result<(), TransportError> {
        self.push("emoji", message_id, emoji_id);
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_api_captures_sends_in_order() {
        let api = RecordingApi::new();
        api.send_group_message(1, "a").await.unwrap();
        api.send_private_message(2, "b").await.unwrap();
        let sent = api.sent_messages();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], ("group".into(), 1, "a".into()));
        assert_eq!(sent[1], ("private".into(), 2, "b".into()));
    }
}
