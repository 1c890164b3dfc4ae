// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The cognitive job payload.
//!
//! Jobs serialize with the current field names (`memo`, `observations`,
//! `has_observations`); the legacy names (`action_summary`, `new_info`,
//! `has_new_info`) are accepted on read so queued files from older deployments
//! still process.

use serde::{Deserialize, Serialize};

/// A `(entity_type, entity_id, perspective)` tuple the historian maintains a
/// merged profile for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileTarget {
    pub entity_type: String,
    pub entity_id: String,
    #[serde(default)]
    pub perspective: String,
    #[serde(default)]
    pub preferred_name: String,
}

impl ProfileTarget {
    pub fn is_valid(&self) -> bool {
        matches!(self.entity_type.as_str(), "user" | "group") && !self.entity_id.is_empty()
    }
}

fn default_schema_version() -> String {
    "final_v1".into()
}

/// One unit of historian work, persisted as a JSON file in the durable queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CognitiveJob {
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub end_seq: u64,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub group_id: String,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: String,
    #[serde(default)]
    pub group_name: String,
    #[serde(default)]
    pub bot_name: String,
    #[serde(default)]
    pub request_type: String,
    #[serde(default)]
    pub timestamp_utc: String,
    #[serde(default)]
    pub timestamp_local: String,
    #[serde(default)]
    pub timestamp_epoch: i64,
    #[serde(default)]
    pub timezone: String,
    /// Absolute location label (group name or sender name).
    #[serde(default)]
    pub location_abs: String,
    #[serde(default)]
    pub message_ids: Vec<String>,
    /// Action summary for the recap layer.
    #[serde(default, alias = "action_summary")]
    pub memo: String,
    /// Ordered list of new facts to canonicalize.
    #[serde(default, alias = "new_info")]
    pub observations: Vec<String>,
    #[serde(default, alias = "has_new_info")]
    pub has_observations: bool,
    #[serde(default)]
    pub perspective: String,
    #[serde(default)]
    pub profile_targets: Vec<ProfileTarget>,
    /// Relax the regex gate (never the id-drift check).
    #[serde(default)]
    pub force: bool,
    /// The triggering message's content, clipped, for rewrite grounding.
    #[serde(default)]
    pub source_message: String,
    /// Recent history lines, clipped, for rewrite grounding.
    #[serde(default)]
    pub recent_messages: Vec<String>,
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    #[serde(default, rename = "_retry_count")]
    pub retry_count: u32,
}

impl CognitiveJob {
    /// Epoch seconds for event metadata, with fallbacks: explicit epoch, then
    /// the ISO timestamps, then now.
    pub fn resolve_timestamp_epoch(&self) -> i64 {
        if self.timestamp_epoch > 0 {
            return self.timestamp_epoch;
        }
        for raw in [&self.timestamp_utc, &self.timestamp_local] {
            if raw.is_empty() {
                continue;
            }
            if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(raw) {
                return parsed.timestamp();
            }
        }
        chrono::Utc::now().timestamp()
    }

    /// The observation texts, trimmed and de-emptied.
    pub fn observation_items(&self) -> Vec<String> {
        self.observations
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
