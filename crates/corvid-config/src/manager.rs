// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Config snapshot holder with change subscriptions.
//!
//! Consumers keep an `Arc<ConfigManager>` and either read the current
//! snapshot per use or subscribe for `(new_config, changes)` callbacks.
//! Callbacks must be idempotent under repeated delivery.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{info, warn};

use crate::{loader, Config};

/// Dotted-path diff between two snapshots: `path → (old, new)`.
/// `None` on either side means the key was absent.
pub type Changes = BTreeMap<String, (Option<toml::Value>, Option<toml::Value>)>;

type Subscriber = Box<dyn Fn(Arc<Config>, &Changes) + Send + Sync>;

pub struct ConfigManager {
    path: Option<PathBuf>,
    snapshot: RwLock<Arc<Config>>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl ConfigManager {
    /// Wrap an already-loaded snapshot (no file backing; `reload` is a no-op).
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            path: None,
            snapshot: RwLock::new(Arc::new(config)),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Load from a file and remember the path for subsequent reloads.
    pub fn from_file(path: &Path) -> anyhow::Result<Arc<Self>> {
        let config = loader::load_file(path)?;
        Ok(Arc::new(Self {
            path: Some(path.to_path_buf()),
            snapshot: RwLock::new(Arc::new(config)),
            subscribers: Mutex::new(Vec::new()),
        }))
    }

    /// The current snapshot.  Cheap: clones an `Arc`.
    pub fn current(&self) -> Arc<Config> {
        match self.snapshot.read() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Register a change callback.  Invoked from the reloading task's context.
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(Arc<Config>, &Changes) + Send + Sync + 'static,
    {
        let mut subs = match self.subscribers.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        subs.push(Box::new(callback));
    }

    /// Re-read the backing file, swap the snapshot, and notify subscribers.
    /// Returns the computed change set (empty when nothing changed).
    pub fn reload(&self) -> anyhow::Result<Changes> {
        let Some(path) = &self.path else {
            return Ok(Changes::new());
        };
        let fresh = loader::load_file(path)?;
        Ok(self.apply(fresh))
    }

    /// Swap in a new snapshot directly (tests, programmatic reconfiguration).
    pub fn apply(&self, fresh: Config) -> Changes {
        let old = self.current();
        let changes = diff_configs(&old, &fresh);
        if changes.is_empty() {
            return changes;
        }
        let fresh = Arc::new(fresh);
        {
            let mut slot = match self.snapshot.write() {
                Ok(s) => s,
                Err(poisoned) => poisoned.into_inner(),
            };
            *slot = fresh.clone();
        }
        info!(changed = changes.len(), "configuration updated");
        let subs = match self.subscribers.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        for sub in subs.iter() {
            sub(fresh.clone(), &changes);
        }
        changes
    }

    /// Start a hot-reload poll loop watching the backing file.
    /// Returns `None` when this manager has no file backing.
    pub fn watch(
        self: &Arc<Self>,
        interval: std::time::Duration,
        debounce: std::time::Duration,
    ) -> Option<crate::HotReload> {
        let path = self.path.clone()?;
        let mgr = self.clone();
        Some(crate::HotReload::spawn(
            interval,
            debounce,
            move || file_stamp(&path),
            move |_| {
                if let Err(e) = mgr.reload() {
                    warn!("config reload failed: {e:#}");
                }
            },
        ))
    }
}

/// Snapshot key for the config watcher: (mtime, len), or None when unreadable.
fn file_stamp(path: &Path) -> Option<(std::time::SystemTime, u64)> {
    let meta = std::fs::metadata(path).ok()?;
    Some((meta.modified().ok()?, meta.len()))
}

/// Compute the dotted-path diff between two typed snapshots by comparing
/// their TOML value trees.
pub fn diff_configs(old: &Config, new: &Config) -> Changes {
    let old_v = toml::Value::try_from(old).unwrap_or(toml::Value::Table(Default::default()));
    let new_v = toml::Value::try_from(new).unwrap_or(toml::Value::Table(Default::default()));
    let mut old_flat = BTreeMap::new();
    let mut new_flat = BTreeMap::new();
    flatten(&old_v, "", &mut old_flat);
    flatten(&new_v, "", &mut new_flat);

    let mut changes = Changes::new();
    for (k, ov) in &old_flat {
        match new_flat.get(k) {
            Some(nv) if nv == ov => {}
            Some(nv) => {
                changes.insert(k.clone(), (Some(ov.clone()), Some(nv.clone())));
            }
            None => {
                changes.insert(k.clone(), (Some(ov.clone()), None));
            }
        }
    }
    for (k, nv) in &new_flat {
        if !old_flat.contains_key(k) {
            changes.insert(k.clone(), (None, Some(nv.clone())));
        }
    }
    changes
}

fn flatten(value: &toml::Value, prefix: &str, out: &mut BTreeMap<String, toml::Value>) {
    match value {
        toml::Value::Table(table) => {
            for (k, v) in table {
                let path = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{prefix}.{k}")
                };
                flatten(v, &path, out);
            }
        }
        other => {
            out.insert(prefix.to_string(), other.clone());
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn diff_reports_dotted_paths() {
        let old = Config::default();
        let mut new = Config::default();
        new.bot.self_id = 42;
        new.queue.ai_request_interval_ms = 500;
        let changes = diff_configs(&old, &new);
        assert!(changes.contains_key("bot.self_id"));
        assert!(changes.contains_key("queue.ai_request_interval_ms"));
        let (o, n) = &changes["bot.self_id"];
        assert_eq!(o.as_ref().and_then(|v| v.as_integer()), Some(0));
        assert_eq!(n.as_ref().and_then(|v| v.as_integer()), Some(42));
    }

    #[test]
    fn diff_of_equal_configs_is_empty() {
        let a = Config::default();
        let b = Config::default();
        assert!(diff_configs(&a, &b).is_empty());
    }

    #[test]
    fn apply_notifies_subscribers() {
        let mgr = ConfigManager::new(Config::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        mgr.subscribe(move |cfg, changes| {
            assert_eq!(cfg.bot.self_id, 9);
            assert!(changes.contains_key("bot.self_id"));
            c.fetch_add(1, Ordering::SeqCst);
        });
        let mut fresh = Config::default();
        fresh.bot.self_id = 9;
        mgr.apply(fresh);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.current().bot.self_id, 9);
    }

    #[test]
    fn apply_without_change_does_not_notify() {
        let mgr = ConfigManager::new(Config::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        mgr.subscribe(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        mgr.apply(Config::default());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reload_reads_backing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[bot]\nself_id = 1\n").unwrap();
        let mgr = ConfigManager::from_file(&path).unwrap();
        assert_eq!(mgr.current().bot.self_id, 1);
        std::fs::write(&path, "[bot]\nself_id = 2\n").unwrap();
        let changes = mgr.reload().unwrap();
        assert!(changes.contains_key("bot.self_id"));
        assert_eq!(mgr.current().bot.self_id, 2);
    }
}
