// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Profile files: markdown bodies with YAML frontmatter.
//!
//! One file per `(entity_type, entity_id)` under `profiles/users/` or
//! `profiles/groups/`.  Writes are per-entity serialized and follow
//! backup → atomic write → prune, so a reader never sees a torn file and the
//! history ring stays bounded.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use crate::MemoryError;

/// Frontmatter carried by every profile file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileFrontmatter {
    pub entity_type: String,
    pub entity_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub source_event_id: String,
}

/// Render `---\n<yaml>---\n<body>`.
pub fn compose_profile(frontmatter: &ProfileFrontmatter, body: &str) -> String {
    let yaml = serde_yaml::to_string(frontmatter).unwrap_or_default();
    format!("---\n{yaml}---\n{body}")
}

/// Split a profile file back into frontmatter and body.
pub fn parse_profile(text: &str) -> Option<(ProfileFrontmatter, String)> {
    let rest = text.strip_prefix("---")?;
    let (yaml, body) = rest.split_once("---")?;
    let frontmatter: ProfileFrontmatter = serde_yaml::from_str(yaml).ok()?;
    Some((frontmatter, body.trim_start_matches('\n').to_string()))
}

/// Pull just the `name` field out of a profile's frontmatter.
pub fn extract_frontmatter_name(text: &str) -> String {
    parse_profile(text)
        .map(|(fm, _)| fm.name)
        .unwrap_or_default()
}

/// Strip a ```` ```markdown ```` wrapper the model sometimes adds.
pub fn strip_markdown_fence(content: &str) -> String {
    let stripped = content.trim();
    if !stripped.starts_with("```") {
        return stripped.to_string();
    }
    let lines: Vec<&str> = stripped.lines().collect();
    let closing = lines
        .iter()
        .enumerate()
        .skip(1)
        .rev()
        .find(|(_, l)| l.trim() == "```")
        .map(|(i, _)| i);
    match closing {
        Some(end) if end > 1 => lines[1..end].join("\n"),
        _ => stripped.to_string(),
    }
}

pub struct ProfileStorage {
    base: PathBuf,
    revision_keep: usize,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ProfileStorage {
    pub fn new(base: impl Into<PathBuf>, revision_keep: usize) -> Self {
        Self {
            base: base.into(),
            revision_keep,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn profile_path(&self, entity_type: &str, entity_id: &str) -> PathBuf {
        self.base
            .join(format!("{entity_type}s"))
            .join(format!("{entity_id}.md"))
    }

    fn history_dir(&self, entity_type: &str, entity_id: &str) -> PathBuf {
        self.base.join("history").join(entity_type).join(entity_id)
    }

    async fn entity_lock(&self, entity_type: &str, entity_id: &str) -> Arc<Mutex<()>> {
        let key = format!("{entity_type}:{entity_id}");
        let mut locks = self.locks.lock().await;
        locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn read_profile(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<String>, MemoryError> {
        let path = self.profile_path(entity_type, entity_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(MemoryError::io(&path, e)),
        }
    }

    /// Backup the current file into `history/`, write the new content
    /// atomically, then prune snapshots beyond `revision_keep`.
    pub async fn write_profile(
        &self,
        entity_type: &str,
        entity_id: &str,
        content: &str,
    ) -> Result<(), MemoryError> {
        let lock = self.entity_lock(entity_type, entity_id).await;
        let _guard = lock.lock().await;

        let path = self.profile_path(entity_type, entity_id);
        let hist_dir = self.history_dir(entity_type, entity_id);
        let content = content.to_string();
        let revision_keep = self.revision_keep;

        tokio::task::spawn_blocking(move || {
            write_profile_blocking(&path, &hist_dir, &content, revision_keep)
        })
        .await
        .map_err(|e| MemoryError::Internal(e.to_string()))?
    }

    pub async fn list_revisions(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<String>, MemoryError> {
        let dir = self.history_dir(entity_type, entity_id);
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(MemoryError::io(&dir, e)),
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Ok(name) = entry.file_name().into_string() {
                if name.ends_with(".md") {
                    names.push(name);
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

fn write_profile_blocking(
    path: &Path,
    hist_dir: &Path,
    content: &str,
    revision_keep: usize,
) -> Result<(), MemoryError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| MemoryError::io(parent, e))?;
    std::fs::create_dir_all(hist_dir).map_err(|e| MemoryError::io(hist_dir, e))?;

    // Backup the current version before replacing it.
    if path.exists() {
        let stamp = chrono::Local::now().format("%Y%m%d%H%M%S%6f");
        let backup = hist_dir.join(format!("{stamp}.md"));
        match std::fs::read_to_string(path) {
            Ok(existing) => {
                if let Err(e) = std::fs::write(&backup, existing) {
                    warn!(path = %backup.display(), "profile backup failed: {e}");
                }
            }
            Err(e) => warn!(path = %path.display(), "profile backup read failed: {e}"),
        }
    }

    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| MemoryError::io(parent, e))?;
    tmp.write_all(content.as_bytes())
        .map_err(|e| MemoryError::io(path, e))?;
    tmp.persist(path).map_err(|e| MemoryError::io(path, e.error))?;

    // Prune old snapshots.
    if let Ok(entries) = std::fs::read_dir(hist_dir) {
        let mut snapshots: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "md").unwrap_or(false))
            .collect();
        snapshots.sort();
        let excess = snapshots.len().saturating_sub(revision_keep);
        for old in snapshots.into_iter().take(excess) {
            if let Err(e) = std::fs::remove_file(&old) {
                warn!(path = %old.display(), "snapshot prune failed: {e}");
            }
        }
    }
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn frontmatter() -> ProfileFrontmatter {
        ProfileFrontmatter {
            entity_type: "user".into(),
            entity_id: "120218451".into(),
            name: "Null".into(),
            tags: vec!["developer".into()],
            updated_at: "2026-02-24T10:00:00".into(),
            source_event_id: "evt1".into(),
        }
    }

    #[test]
    fn compose_and_parse_round_trip() {
        // Written files parse back with matching identity fields.
        let text = compose_profile(&frontmatter(), "likes rust\n");
        let (fm, body) = parse_profile(&text).unwrap();
        assert_eq!(fm.entity_type, "user");
        assert_eq!(fm.entity_id, "120218451");
        assert_eq!(fm.tags, vec!["developer"]);
        assert_eq!(body, "likes rust\n");
    }

    #[test]
    fn parse_rejects_non_frontmatter_text() {
        assert!(parse_profile("just markdown").is_none());
    }

    #[test]
    fn extract_name_from_frontmatter() {
        let text = compose_profile(&frontmatter(), "body");
        assert_eq!(extract_frontmatter_name(&text), "Null");
        assert_eq!(extract_frontmatter_name("no frontmatter"), "");
    }

    #[test]
    fn fence_stripping() {
        let wrapped = "```markdown\n---\nx: 1\n---\nbody\n```";
        assert_eq!(strip_markdown_fence(wrapped), "---\nx: 1\n---\nbody");
        assert_eq!(strip_markdown_fence("plain"), "plain");
    }

    #[tokio::test]
    async fn read_missing_profile_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ProfileStorage::new(dir.path(), 3);
        assert!(storage.read_profile("user", "1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ProfileStorage::new(dir.path(), 3);
        let content = compose_profile(&frontmatter(), "body");
        storage.write_profile("user", "120218451", &content).await.unwrap();
        let read = storage.read_profile("user", "120218451").await.unwrap().unwrap();
        assert_eq!(read, content);
    }

    #[tokio::test]
    async fn rewrites_snapshot_history_and_prune() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ProfileStorage::new(dir.path(), 2);
        for i in 0..5 {
            storage
                .write_profile("user", "7", &format!("version {i}"))
                .await
                .unwrap();
        }
        // 4 backups were taken (first write had nothing to back up), capped at 2.
        let revisions = storage.list_revisions("user", "7").await.unwrap();
        assert_eq!(revisions.len(), 2);
        // Latest content survives.
        let current = storage.read_profile("user", "7").await.unwrap().unwrap();
        assert_eq!(current, "version 4");
    }

    #[tokio::test]
    async fn entities_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ProfileStorage::new(dir.path(), 2);
        storage.write_profile("user", "1", "u1").await.unwrap();
        storage.write_profile("group", "1", "g1").await.unwrap();
        assert_eq!(
            storage.read_profile("user", "1").await.unwrap().unwrap(),
            "u1"
        );
        assert_eq!(
            storage.read_profile("group", "1").await.unwrap().unwrap(),
            "g1"
        );
    }
}
