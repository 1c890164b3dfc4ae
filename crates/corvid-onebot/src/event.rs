// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

use crate::segment::{message_to_segments, Segment};

/// Sender block attached to message events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sender {
    #[serde(default)]
    pub nickname: String,
    /// Group card (display name inside the group), may be empty.
    #[serde(default)]
    pub card: String,
    /// owner / admin / member
    #[serde(default)]
    pub role: String,
    /// Group-specific title.
    #[serde(default)]
    pub title: String,
}

impl Sender {
    /// The name the bot should address the sender by.
    pub fn display_name(&self) -> &str {
        if !self.card.is_empty() {
            &self.card
        } else {
            &self.nickname
        }
    }
}

/// One inbound transport event, as delivered by the peer.
///
/// `message` stays raw JSON so unknown segment types survive; use
/// [`Event::segments`] for the typed view.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub post_type: String,
    #[serde(default)]
    pub message_type: String,
    /// Notice subtype (poke etc.) for `post_type = "notice"`.
    #[serde(default)]
    pub sub_type: String,
    #[serde(default)]
    pub user_id: i64,
    #[serde(default)]
    pub group_id: Option<i64>,
    #[serde(default)]
    pub target_id: Option<i64>,
    #[serde(default)]
    pub message_id: Option<i64>,
    #[serde(default)]
    pub sender: Sender,
    #[serde(default)]
    pub message: serde_json::Value,
    #[serde(default)]
    pub time: i64,
    /// Extra fields the runtime does not interpret.
    #[serde(default)]
    pub group_name: Option<String>,
}

impl Event {
    pub fn is_message(&self) -> bool {
        self.post_type == "message"
    }

    pub fn is_group_message(&self) -> bool {
        self.is_message() && self.message_type == "group"
    }

    pub fn is_private_message(&self) -> bool {
        self.is_message() && self.message_type == "private"
    }

    /// A poke notice aimed at `self_id`.
    pub fn is_poke_at(&self, self_id: i64) -> bool {
        self.post_type == "notice" && self.sub_type == "poke" && self.target_id == Some(self_id)
    }

    pub fn segments(&self) -> Vec<Segment> {
        message_to_segments(&self.message)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_group_message_event() {
        let raw = serde_json::json!({
            "post_type": "message",
            "message_type": "group",
            "user_id": 2002,
            "group_id": 10001,
            "message_id": 555,
            "sender": { "nickname": "alice", "card": "A", "role": "member" },
            "message": [
                { "type": "at", "data": { "qq": "999" } },
                { "type": "text", "data": { "text": " hello" } }
            ],
            "time": 1700000000
        });
        let event: Event = serde_json::from_value(raw).unwrap();
        assert!(event.is_group_message());
        assert_eq!(event.group_id, Some(10001));
        assert_eq!(event.sender.display_name(), "A");
        let segs = event.segments();
        assert_eq!(segs.len(), 2);
        assert!(crate::segment::mentions(&segs, 999));
    }

    #[test]
    fn display_name_falls_back_to_nickname() {
        let s = Sender {
            nickname: "bob".into(),
            ..Sender::default()
        };
        assert_eq!(s.display_name(), "bob");
    }

    #[test]
    fn poke_notice_detection() {
        let raw = serde_json::json!({
            "post_type": "notice",
            "sub_type": "poke",
            "user_id": 2,
            "group_id": 1,
            "target_id": 999,
            "time": 0
        });
        let event: Event = serde_json::from_value(raw).unwrap();
        assert!(event.is_poke_at(999));
        assert!(!event.is_poke_at(1000));
        assert!(!event.is_message());
    }
}
