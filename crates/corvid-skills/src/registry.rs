// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Central registry for one skill kind.
//!
//! Readers see an immutable snapshot behind an `RwLock<Arc<…>>`; a reload
//! builds the whole replacement map first and swaps it in one write section,
//! so concurrent readers observe either the pre- or post-reload state, never
//! a partial merge.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use tracing::{debug, info, warn};

use corvid_model::ToolSchema;

use crate::{HandlerTable, SkillContext, SkillDescriptor, SkillError, SkillKind};

#[derive(Default)]
struct Snapshot {
    /// Lowercased canonical name → descriptor.
    by_name: HashMap<String, Arc<SkillDescriptor>>,
    /// Lowercased alias → lowercased canonical name.
    alias_to_name: HashMap<String, String>,
    /// Descriptors sorted by `(order, name)` for schema export.
    ordered: Vec<Arc<SkillDescriptor>>,
}

pub struct SkillRegistry {
    root: PathBuf,
    kind: SkillKind,
    handlers: Arc<HandlerTable>,
    snapshot: RwLock<Arc<Snapshot>>,
}

impl SkillRegistry {
    /// Create a registry over `root` (the kind-specific directory, e.g.
    /// `skills/tools`) and perform the initial scan.
    pub fn new(root: impl Into<PathBuf>, kind: SkillKind, handlers: Arc<HandlerTable>) -> Arc<Self> {
        let registry = Arc::new(Self {
            root: root.into(),
            kind,
            handlers,
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
        });
        registry.reload();
        registry
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn kind(&self) -> SkillKind {
        self.kind
    }

    /// Rescan the root directory and atomically swap in the fresh maps.
    pub fn reload(&self) {
        let mut by_name = HashMap::new();
        let mut alias_to_name = HashMap::new();
        let mut ordered: Vec<Arc<SkillDescriptor>> = Vec::new();

        let entries = match std::fs::read_dir(&self.root) {
            Ok(e) => e,
            Err(_) => {
                debug!(root = %self.root.display(), kind = self.kind.as_str(), "skill root missing");
                self.swap(Snapshot::default());
                return;
            }
        };

        let mut dirs: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| !n.starts_with('_') && !n.starts_with('.'))
                    .unwrap_or(false)
            })
            .collect();
        dirs.sort();

        for dir in dirs {
            match SkillDescriptor::from_dir(self.kind, &dir) {
                Ok(Some(descriptor)) => {
                    let key = descriptor.name.to_lowercase();
                    if by_name.contains_key(&key) {
                        warn!(
                            kind = self.kind.as_str(),
                            name = %descriptor.name,
                            dir = %dir.display(),
                            "duplicate skill name; keeping first-seen"
                        );
                        continue;
                    }
                    let descriptor = Arc::new(descriptor);
                    for alias in &descriptor.aliases {
                        let alias_key = alias.to_lowercase();
                        match alias_to_name.get(&alias_key) {
                            Some(existing) => warn!(
                                kind = self.kind.as_str(),
                                alias = %alias,
                                kept = %existing,
                                dropped = %descriptor.name,
                                "alias conflict; keeping first-seen"
                            ),
                            None => {
                                alias_to_name.insert(alias_key, key.clone());
                            }
                        }
                    }
                    by_name.insert(key, descriptor.clone());
                    ordered.push(descriptor);
                }
                Ok(None) => {}
                Err(e) => warn!(dir = %dir.display(), "skipping skill: {e}"),
            }
        }

        ordered.sort_by(|a, b| (a.order, &a.name).cmp(&(b.order, &b.name)));
        info!(
            kind = self.kind.as_str(),
            count = ordered.len(),
            root = %self.root.display(),
            "skills loaded"
        );
        self.swap(Snapshot {
            by_name,
            alias_to_name,
            ordered,
        });
    }

    fn swap(&self, fresh: Snapshot) {
        let mut slot = match self.snapshot.write() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Arc::new(fresh);
    }

    fn current(&self) -> Arc<Snapshot> {
        match self.snapshot.read() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Case-insensitive lookup by canonical name or alias.
    pub fn resolve(&self, name_or_alias: &str) -> Option<Arc<SkillDescriptor>> {
        let snapshot = self.current();
        let key = name_or_alias.to_lowercase();
        if let Some(d) = snapshot.by_name.get(&key) {
            return Some(d.clone());
        }
        let canonical = snapshot.alias_to_name.get(&key)?;
        snapshot.by_name.get(canonical).cloned()
    }

    /// All descriptors, sorted by `(order, name)`.
    pub fn descriptors(&self) -> Vec<Arc<SkillDescriptor>> {
        self.current().ordered.clone()
    }

    /// OpenAI-compatible tool schema list, sorted by `(order, name)`.
    pub fn get_schema(&self) -> Vec<ToolSchema> {
        self.current()
            .ordered
            .iter()
            .map(|d| ToolSchema::function(d.name.as_str(), d.description.as_str(), d.parameters.clone()))
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.current()
            .ordered
            .iter()
            .map(|d| d.name.clone())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }

    /// Execute a skill by descriptor.  The handler is resolved lazily from
    /// the shared table; a descriptor with no compiled body yields the
    /// unknown-tool result rather than an error.
    pub async fn execute(
        &self,
        descriptor: &SkillDescriptor,
        args: serde_json::Value,
        context: SkillContext,
    ) -> Result<String, SkillError> {
        match self.handlers.get(&descriptor.name) {
            Some(handler) => handler(args, context).await,
            None => {
                warn!(
                    kind = self.kind.as_str(),
                    name = %descriptor.name,
                    "no compiled handler bound for skill"
                );
                Ok(format!("未找到工具: {}", descriptor.name))
            }
        }
    }

    /// Execute by name or alias.
    pub async fn execute_by_name(
        &self,
        name_or_alias: &str,
        args: serde_json::Value,
        context: SkillContext,
    ) -> Result<String, SkillError> {
        match self.resolve(name_or_alias) {
            Some(descriptor) => self.execute(&descriptor, args, context).await,
            None => Ok(format!("未找到工具: {name_or_alias}")),
        }
    }

    /// Per-skill-dir `(config, handler, doc)` file stamps — mtime plus size,
    /// so rewrites within one mtime granule still register.  Fed to the
    /// shared hot-reload loop; any difference triggers a reload.
    pub fn scan_snapshot(&self) -> BTreeMap<PathBuf, FileStamps> {
        let mut out = BTreeMap::new();
        for entry in walkdir::WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .flatten()
        {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let stamps = FileStamps {
                config: stamp(&dir.join("config.json")),
                handler: handler_stamp(dir),
                doc: stamp(&dir.join("prompt.md")).or_else(|| stamp(&dir.join("README.md"))),
            };
            out.insert(dir.to_path_buf(), stamps);
        }
        out
    }

    /// Wire this registry to the shared hot-reload loop.
    pub fn start_hot_reload(
        self: &Arc<Self>,
        interval: std::time::Duration,
        debounce: std::time::Duration,
    ) -> corvid_config::HotReload {
        let scan = self.clone();
        let reload = self.clone();
        corvid_config::HotReload::spawn(
            interval,
            debounce,
            move || scan.scan_snapshot(),
            move |_| reload.reload(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStamps {
    pub config: Option<(SystemTime, u64)>,
    pub handler: Option<(SystemTime, u64)>,
    pub doc: Option<(SystemTime, u64)>,
}

fn stamp(path: &Path) -> Option<(SystemTime, u64)> {
    let meta = std::fs::metadata(path).ok()?;
    Some((meta.modified().ok()?, meta.len()))
}

fn handler_stamp(dir: &Path) -> Option<(SystemTime, u64)> {
    let entries = std::fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file()
            && path
                .file_stem()
                .and_then(|s| s.to_str())
                .map(|s| s == "handler")
                .unwrap_or(false)
        {
            return stamp(&path);
        }
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler;

    fn write_tool(root: &Path, name: &str, order: i64, aliases: &[&str]) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        let aliases_json = serde_json::to_string(aliases).unwrap();
        std::fs::write(
            dir.join("config.json"),
            format!(
                r#"{{
                    "function": {{ "name": "{name}", "description": "d", "parameters": {{ "type": "object" }} }},
                    "order": {order},
                    "aliases": {aliases_json}
                }}"#
            ),
        )
        .unwrap();
        std::fs::write(dir.join("handler.rs"), "// builtin").unwrap();
    }

    fn registry_with(root: &Path) -> (Arc<SkillRegistry>, Arc<HandlerTable>) {
        let table = HandlerTable::new();
        let reg = SkillRegistry::new(root, SkillKind::Tool, table.clone());
        (reg, table)
    }

    #[tokio::test]
    async fn schema_sorted_by_order_then_name() {
        let tmp = tempfile::tempdir().unwrap();
        write_tool(tmp.path(), "zeta", 1, &[]);
        write_tool(tmp.path(), "alpha", 2, &[]);
        write_tool(tmp.path(), "beta", 2, &[]);
        let (reg, _) = registry_with(tmp.path());
        let names: Vec<String> = reg.get_schema().iter().map(|s| s.name().to_string()).collect();
        assert_eq!(names, vec!["zeta", "alpha", "beta"]);
    }

    #[tokio::test]
    async fn resolve_is_case_insensitive_and_covers_aliases() {
        let tmp = tempfile::tempdir().unwrap();
        write_tool(tmp.path(), "get_time", 1, &["Time", "now"]);
        let (reg, _) = registry_with(tmp.path());
        assert!(reg.resolve("GET_TIME").is_some());
        assert!(reg.resolve("time").is_some());
        assert_eq!(reg.resolve("NOW").unwrap().name, "get_time");
        assert!(reg.resolve("nope").is_none());
    }

    #[tokio::test]
    async fn alias_conflict_keeps_first_seen() {
        let tmp = tempfile::tempdir().unwrap();
        // Directory scan order is sorted: "aardvark" loads before "zebra".
        write_tool(tmp.path(), "aardvark", 1, &["shared"]);
        write_tool(tmp.path(), "zebra", 1, &["shared"]);
        let (reg, _) = registry_with(tmp.path());
        assert_eq!(reg.resolve("shared").unwrap().name, "aardvark");
    }

    #[tokio::test]
    async fn execute_dispatches_to_bound_handler() {
        let tmp = tempfile::tempdir().unwrap();
        write_tool(tmp.path(), "echo", 1, &[]);
        let (reg, table) = registry_with(tmp.path());
        table.register(
            "echo",
            handler(|args: serde_json::Value, _| async move { Ok(format!("echo:{}", args["v"])) }),
        );
        let out = reg
            .execute_by_name("echo", serde_json::json!({"v": 3}), SkillContext::new())
            .await
            .unwrap();
        assert_eq!(out, "echo:3");
    }

    #[tokio::test]
    async fn execute_unbound_handler_reports_unknown() {
        let tmp = tempfile::tempdir().unwrap();
        write_tool(tmp.path(), "ghost", 1, &[]);
        let (reg, _) = registry_with(tmp.path());
        let out = reg
            .execute_by_name("ghost", serde_json::json!({}), SkillContext::new())
            .await
            .unwrap();
        assert!(out.contains("未找到工具"));
    }

    #[tokio::test]
    async fn reload_picks_up_new_skills() {
        let tmp = tempfile::tempdir().unwrap();
        write_tool(tmp.path(), "one", 1, &[]);
        let (reg, _) = registry_with(tmp.path());
        assert_eq!(reg.names(), vec!["one"]);
        write_tool(tmp.path(), "two", 1, &[]);
        reg.reload();
        assert_eq!(reg.names(), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn snapshot_changes_when_config_rewritten() {
        let tmp = tempfile::tempdir().unwrap();
        write_tool(tmp.path(), "one", 1, &[]);
        let (reg, _) = registry_with(tmp.path());
        let before = reg.scan_snapshot();
        // A different length guarantees a metadata change even on coarse
        // mtime filesystems.
        std::fs::write(
            tmp.path().join("one/config.json"),
            r#"{ "function": { "name": "one", "description": "longer description" } }"#,
        )
        .unwrap();
        let after = reg.scan_snapshot();
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn missing_root_yields_empty_registry() {
        let tmp = tempfile::tempdir().unwrap();
        let (reg, _) = registry_with(&tmp.path().join("does-not-exist"));
        assert!(reg.names().is_empty());
        assert!(reg.get_schema().is_empty());
    }
}
