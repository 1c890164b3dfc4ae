// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! JSON-lines debug transport.
//!
//! The production WebSocket peer lives outside this workspace; for local runs
//! and tests the runtime speaks newline-delimited JSON on stdin/stdout.
//! Inbound lines are OneBot-style events; outbound actions mirror the wire
//! calls (`{"action": "send_group_msg", "params": {…}}`).

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use corvid_core::AICoordinator;
use corvid_onebot::{Event, HistoryMessage, OneBotApi, TransportError};

/// Writes outbound transport actions as JSON lines on stdout.
pub struct JsonLinesTransport;

impl JsonLinesTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }

    fn emit(&self, action: &str, params: serde_json::Value) -> Result<(), TransportError> {
        let line = serde_json::json!({ "action": action, "params": params });
        println!("{line}");
        Ok(())
    }
}

#[async_trait]
impl OneBotApi for JsonLinesTransport {
    async fn send_group_message(&self, group_id: i64, message: &str) -> Result<(), TransportError> {
        self.emit(
            "send_group_msg",
            serde_json::json!({ "group_id": group_id, "message": message }),
        )
    }

    async fn send_private_message(&self, user_id: i64, message: &str) -> Result<(), TransportError> {
        self.emit(
            "send_private_msg",
            serde_json::json!({ "user_id": user_id, "message": message }),
        )
    }

    async fn send_like(&self, user_id: i64, times: u32) -> Result<(), TransportError> {
        self.emit(
            "send_like",
            serde_json::json!({ "user_id": user_id, "times": times }),
        )
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

    async fn send_group_poke(&self, group_id: i64, user_id: i64) -> Result<(), TransportError> {
        self.emit(
            "group_poke",
            serde_json::json!({ "group_id": group_id, "user_id": user_id }),
        )
    }

    async fn send_private_poke(&self, user_id: i64) -> Result<(), TransportError> {
        self.emit("friend_poke", serde_json::json!({ "user_id": user_id }))
    }

    async fn set_msg_emoji_like(
        &self,
        message_id: i64,
        emoji_id: &str,
    ) -> Result<(), TransportError> {
        self.emit(
            "set_msg_emoji_like",
            serde_json::json!({ "message_id": message_id, "emoji_id": emoji_id }),
        )
    }
}

/// Read events from stdin until EOF or shutdown, feeding the coordinator.
pub async fn run_event_loop(coordinator: Arc<AICoordinator>) {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    info!("event loop reading JSON lines from stdin");
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Event>(line) {
                    Ok(event) => coordinator.handle_event(&event).await,
                    Err(e) => warn!("unparseable event line: {e}"),
                }
            }
            Ok(None) => {
                info!("stdin closed, event loop exiting");
                break;
            }
            Err(e) => {
                warn!("stdin read error: {e}");
                break;
            }
        }
    }
}
