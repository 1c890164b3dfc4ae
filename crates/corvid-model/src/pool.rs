// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Optional per-user chat-model selection.
//!
//! The pool is `primary ⊕ model_pool.models` deduplicated by model name.  A
//! user with a persisted preference gets that model as long as it still
//! exists; otherwise the stale preference is cleared and the configured
//! strategy applies (`round_robin` over the pool with an atomic counter).
//!
//! The compare flow issues one prompt to every pool model in parallel, sends
//! truncated per-model previews, and parks a ticket keyed by
//! `(group_id, user_id)`; the next `选 <n>` message consumes the ticket and
//! records the preference.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{info, warn};

use corvid_config::{ModelEndpoint, ModelPoolConfig};

use crate::{ChatMessage, ChatRequest, ModelRequester};

const COMPARE_PREVIEW_MAX_LEN: usize = 300;

struct CompareTicket {
    /// Model names in the order previews were presented.
    options: Vec<String>,
    created: Instant,
}

/// Per-user model preference store + selection strategy.
pub struct ModelSelector {
    pool: Vec<ModelEndpoint>,
    strategy: String,
    compare_expire: Duration,
    prefs_path: PathBuf,
    prefs: Mutex<HashMap<String, String>>,
    rr_counter: AtomicUsize,
    tickets: Mutex<HashMap<(i64, i64), CompareTicket>>,
}

impl ModelSelector {
    pub fn new(config: &ModelPoolConfig) -> Self {
        let prefs_path = PathBuf::from(&config.preferences_path);
        let prefs = load_prefs(&prefs_path);
        Self {
            pool: config.models.clone(),
            strategy: config.strategy.clone(),
            compare_expire: Duration::from_secs(config.compare_expire_secs),
            prefs_path,
            prefs: Mutex::new(prefs),
            rr_counter: AtomicUsize::new(0),
            tickets: Mutex::new(HashMap::new()),
        }
    }

    /// All candidate endpoints: primary first, pool entries after, deduped by
    /// model name.
    pub fn candidates(&self, primary: &ModelEndpoint) -> Vec<ModelEndpoint> {
        let mut seen = vec![primary.model_name.clone()];
        let mut out = vec![primary.clone()];
        for m in &self.pool {
            if !seen.contains(&m.model_name) {
                seen.push(m.model_name.clone());
                out.push(m.clone());
            }
        }
        out
    }

    /// Pick the chat endpoint for one request.
    pub fn select_chat_config(
        &self,
        primary: &ModelEndpoint,
        _group_id: Option<i64>,
        user_id: Option<i64>,
        global_enabled: bool,
    ) -> ModelEndpoint {
        if !global_enabled {
            return primary.clone();
        }
        let candidates = self.candidates(primary);

        if let Some(uid) = user_id {
            let key = uid.to_string();
            let preferred = {
                let prefs = self.lock_prefs();
                prefs.get(&key).cloned()
            };
            if let Some(name) = preferred {
                if let Some(found) = candidates.iter().find(|m| m.model_name == name) {
                    return found.clone();
                }
                // Preference points at a model no longer in the pool.
                info!(user_id = uid, model = %name, "clearing stale model preference");
                self.lock_prefs().remove(&key);
                self.save_prefs();
            }
        }

        match self.strategy.as_str() {
            "round_robin" => {
                let idx = self.rr_counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
                candidates[idx].clone()
            }
            _ => primary.clone(),
        }
    }

    /// Record a user's model preference and persist it.
    pub fn set_preference(&self, user_id: i64, model_name: &str) {
        self.lock_prefs()
            .insert(user_id.to_string(), model_name.to_string());
        self.save_prefs();
    }

    pub fn preference(&self, user_id: i64) -> Option<String> {
        self.lock_prefs().get(&user_id.to_string()).cloned()
    }

    /// Issue `prompt` to every candidate in parallel; returns
    /// `(model_name, preview_or_error)` per model in pool order and parks a
    /// compare ticket for `(group_id, user_id)`.
    pub async fn run_compare(
        &self,
        requester: &dyn ModelRequester,
        primary: &ModelEndpoint,
        group_id: i64,
        user_id: i64,
        prompt: &str,
    ) -> Vec<(String, String)> {
        let candidates = self.candidates(primary);
        let futures: Vec<_> = candidates
            .iter()
            .map(|model| {
                let req = ChatRequest::new("compare", vec![ChatMessage::user(prompt)])
                    .with_max_tokens(1024);
                async move {
                    match requester.request(model, req).await {
                        Ok(resp) => {
                            let text = resp.message().content.unwrap_or_default();
                            clip(&text, COMPARE_PREVIEW_MAX_LEN)
                        }
                        Err(e) => format!("（调用失败: {e}）"),
                    }
                }
            })
            .collect();
        let previews = futures::future::join_all(futures).await;

        let results: Vec<(String, String)> = candidates
            .iter()
            .map(|m| m.model_name.clone())
            .zip(previews)
            .collect();

        let mut tickets = self.lock_tickets();
        tickets.insert(
            (group_id, user_id),
            CompareTicket {
                options: results.iter().map(|(n, _)| n.clone()).collect(),
                created: Instant::now(),
            },
        );
        results
    }

    /// Try to interpret `text` as a pending compare choice (`选 <n>`).
    /// On a hit the ticket is consumed, the preference recorded, and the
    /// chosen model name returned.
    pub fn try_consume_choice(&self, group_id: i64, user_id: i64, text: &str) -> Option<String> {
        let re = Regex::new(r"^选\s*(\d+)$").ok()?;
        let caps = re.captures(text.trim())?;
        let index: usize = caps.get(1)?.as_str().parse().ok()?;

        let mut tickets = self.lock_tickets();
        let ticket = tickets.get(&(group_id, user_id))?;
        if ticket.created.elapsed() > self.compare_expire {
            tickets.remove(&(group_id, user_id));
            info!(group_id, user_id, "compare ticket expired");
            return None;
        }
        if index == 0 || index > ticket.options.len() {
            return None;
        }
        let chosen = ticket.options[index - 1].clone();
        tickets.remove(&(group_id, user_id));
        drop(tickets);

        self.set_preference(user_id, &chosen);
        Some(chosen)
    }

    fn save_prefs(&self) {
        let snapshot = self.lock_prefs().clone();
        if let Err(e) = write_prefs(&self.prefs_path, &snapshot) {
            warn!(path = %self.prefs_path.display(), "saving model preferences failed: {e}");
        }
    }

    fn lock_prefs(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        match self.prefs.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_tickets(&self) -> std::sync::MutexGuard<'_, HashMap<(i64, i64), CompareTicket>> {
        match self.tickets.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn clip(text: &str, max_len: usize) -> String {
    let t = text.trim();
    if t.chars().count() <= max_len {
        return t.to_string();
    }
    let clipped: String = t.chars().take(max_len.saturating_sub(3)).collect();
    format!("{}...", clipped.trim_end())
}

fn load_prefs(path: &PathBuf) -> HashMap<String, String> {
    match std::fs::read_to_string(path) {
        Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
        Err(_) => HashMap::new(),
    }
}

fn write_prefs(path: &PathBuf, prefs: &HashMap<String, String>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(serde_json::to_string_pretty(prefs)?.as_bytes())?;
    tmp.persist(path)?;
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ScriptedRequester;

    fn endpoint(name: &str) -> ModelEndpoint {
        ModelEndpoint {
            model_name: name.into(),
            ..ModelEndpoint::default()
        }
    }

    fn config_with(dir: &tempfile::TempDir, models: Vec<ModelEndpoint>) -> ModelPoolConfig {
        ModelPoolConfig {
            enabled: true,
            models,
            strategy: "round_robin".into(),
            compare_expire_secs: 300,
            preferences_path: dir
                .path()
                .join("prefs.json")
                .to_string_lossy()
                .into_owned(),
        }
    }

    #[test]
    fn disabled_returns_primary() {
        let dir = tempfile::tempdir().unwrap();
        let sel = ModelSelector::new(&config_with(&dir, vec![endpoint("b")]));
        let picked = sel.select_chat_config(&endpoint("a"), None, Some(1), false);
        assert_eq!(picked.model_name, "a");
    }

    #[test]
    fn candidates_dedup_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let sel = ModelSelector::new(&config_with(&dir, vec![endpoint("a"), endpoint("b")]));
        let cands = sel.candidates(&endpoint("a"));
        let names: Vec<&str> = cands.iter().map(|m| m.model_name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn round_robin_cycles() {
        let dir = tempfile::tempdir().unwrap();
        let sel = ModelSelector::new(&config_with(&dir, vec![endpoint("b")]));
        let primary = endpoint("a");
        let first = sel.select_chat_config(&primary, None, None, true);
        let second = sel.select_chat_config(&primary, None, None, true);
        let third = sel.select_chat_config(&primary, None, None, true);
        assert_eq!(first.model_name, "a");
        assert_eq!(second.model_name, "b");
        assert_eq!(third.model_name, "a");
    }

    #[test]
    fn preference_wins_and_stale_is_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let sel = ModelSelector::new(&config_with(&dir, vec![endpoint("b")]));
        let primary = endpoint("a");
        sel.set_preference(7, "b");
        assert_eq!(
            sel.select_chat_config(&primary, None, Some(7), true).model_name,
            "b"
        );
        // Preference to a model no longer present: cleared, fallback applies.
        sel.set_preference(7, "gone");
        let picked = sel.select_chat_config(&primary, None, Some(7), true);
        assert_ne!(picked.model_name, "gone");
        assert!(sel.preference(7).is_none());
    }

    #[test]
    fn preferences_persist_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config_with(&dir, vec![endpoint("b")]);
        {
            let sel = ModelSelector::new(&cfg);
            sel.set_preference(9, "b");
        }
        let sel2 = ModelSelector::new(&cfg);
        assert_eq!(sel2.preference(9).as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn compare_sets_ticket_and_choice_consumes_it() {
        let dir = tempfile::tempdir().unwrap();
        let sel = ModelSelector::new(&config_with(&dir, vec![endpoint("b")]));
        let mock = ScriptedRequester::new();
        mock.push_text("answer from a").push_text("answer from b");

        let results = sel
            .run_compare(&mock, &endpoint("a"), 100, 7, "which is better?")
            .await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "a");

        // Unrelated text is not a choice.
        assert!(sel.try_consume_choice(100, 7, "hello").is_none());
        // Out-of-range index is rejected, ticket stays.
        assert!(sel.try_consume_choice(100, 7, "选 3").is_none());
        // A valid choice consumes the ticket and records the preference.
        assert_eq!(sel.try_consume_choice(100, 7, "选 2").as_deref(), Some("b"));
        assert_eq!(sel.preference(7).as_deref(), Some("b"));
        // Ticket is gone now.
        assert!(sel.try_consume_choice(100, 7, "选 1").is_none());
    }

    #[test]
    fn clip_truncates_long_text() {
        let long: String = "x".repeat(400);
        let clipped = clip(&long, 10);
        assert!(clipped.chars().count() <= 10);
        assert!(clipped.ends_with("..."));
    }
}
