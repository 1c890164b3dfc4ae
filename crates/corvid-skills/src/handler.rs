// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The compiled handler seam.
//!
//! Skills are discovered from disk, but their executable bodies are compiled
//! into the binary and registered here by name.  A descriptor whose name has
//! no registered handler still appears in the schema (the model may see it),
//! and executing it reports an unknown-tool result — the same contract the
//! dynamic loader upstream exposes.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use corvid_context::{RequestContext, Resource};

use crate::SkillError;

/// Execution context handed to a skill handler.
///
/// Carries the request identity plus a string-keyed resource map.  The
/// dispatcher pre-fills it from the ambient [`RequestContext`]; handlers are
/// expected to fall back to defaults when entries are missing (skills are
/// portable).
#[derive(Clone, Default)]
pub struct SkillContext {
    pub request_type: Option<String>,
    pub request_id: Option<String>,
    pub group_id: Option<i64>,
    pub user_id: Option<i64>,
    pub sender_id: Option<i64>,
    values: HashMap<String, Resource>,
}

impl SkillContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed identity and resources from the ambient request context.
    /// Explicitly set entries win over inherited ones.
    pub fn inherit_ambient(mut self) -> Self {
        if let Some(ctx) = RequestContext::current() {
            self.request_type.get_or_insert(ctx.request_type.to_string());
            self.request_id.get_or_insert(ctx.request_id.clone());
            if self.group_id.is_none() {
                self.group_id = ctx.group_id;
            }
            if self.user_id.is_none() {
                self.user_id = ctx.user_id;
            }
            if self.sender_id.is_none() {
                self.sender_id = ctx.sender_id;
            }
            for key in ctx.resource_keys() {
                if !self.values.contains_key(&key) {
                    if let Some(value) = ctx.get_resource_raw(&key) {
                        self.values.insert(key, value);
                    }
                }
            }
        }
        self
    }

    pub fn insert<T: std::any::Any + Send + Sync>(&mut self, key: &str, value: Arc<T>) {
        self.values.insert(key.to_string(), value as Resource);
    }

    pub fn insert_raw(&mut self, key: &str, value: Resource) {
        self.values.insert(key.to_string(), value);
    }

    pub fn get<T: std::any::Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.values.get(key)?.clone().downcast::<T>().ok()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.values.keys().cloned().collect();
        keys.sort();
        keys
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<String, SkillError>> + Send>>;

/// A compiled skill body: `(args, context) → result string`.
pub type SkillHandler = Arc<dyn Fn(serde_json::Value, SkillContext) -> HandlerFuture + Send + Sync>;

/// Wrap an async fn into a [`SkillHandler`].
pub fn handler<F, Fut>(f: F) -> SkillHandler
where
    F: Fn(serde_json::Value, SkillContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, SkillError>> + Send + 'static,
{
    Arc::new(move |args, ctx| Box::pin(f(args, ctx)))
}

/// Name → handler registry shared by all skill registries.
#[derive(Default)]
pub struct HandlerTable {
    map: RwLock<HashMap<String, SkillHandler>>,
}

impl HandlerTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, name: &str, h: SkillHandler) {
        let mut map = match self.map.write() {
            Ok(m) => m,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.insert(name.to_string(), h);
    }

    pub fn get(&self, name: &str) -> Option<SkillHandler> {
        let map = match self.map.read() {
            Ok(m) => m,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let map = match self.map.read() {
            Ok(m) => m,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut names: Vec<String> = map.keys().cloned().collect();
        names.sort();
        names
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handler_wraps_async_fn() {
        let h = handler(|args: serde_json::Value, _ctx| async move {
            Ok(format!("got {}", args["x"]))
        });
        let out = h(serde_json::json!({"x": 1}), SkillContext::new())
            .await
            .unwrap();
        assert_eq!(out, "got 1");
    }

    #[tokio::test]
    async fn table_registers_and_resolves() {
        let table = HandlerTable::new();
        table.register("echo", handler(|_, _| async { Ok("ok".into()) }));
        assert!(table.get("echo").is_some());
        assert!(table.get("missing").is_none());
        assert_eq!(table.names(), vec!["echo"]);
    }

    #[tokio::test]
    async fn context_typed_roundtrip() {
        let mut ctx = SkillContext::new();
        ctx.insert("count", Arc::new(5u32));
        assert_eq!(*ctx.get::<u32>("count").unwrap(), 5);
        assert!(ctx.get::<String>("count").is_none());
    }

    #[tokio::test]
    async fn inherit_ambient_pulls_identity_and_resources() {
        let rc = RequestContext::group(11, 22);
        rc.set_resource("flavor", Arc::new("salt".to_string()));
        rc.scope(async {
            let ctx = SkillContext::new().inherit_ambient();
            assert_eq!(ctx.group_id, Some(11));
            assert_eq!(ctx.sender_id, Some(22));
            assert_eq!(ctx.request_type.as_deref(), Some("group"));
            assert_eq!(&*ctx.get::<String>("flavor").unwrap(), "salt");
        })
        .await;
    }

    #[tokio::test]
    async fn inherit_ambient_without_scope_is_noop() {
        let ctx = SkillContext::new().inherit_ambient();
        assert!(ctx.request_id.is_none());
        assert!(ctx.keys().is_empty());
    }

    #[tokio::test]
    async fn explicit_entries_win_over_ambient() {
        let rc = RequestContext::group(11, 22);
        rc.set_resource("k", Arc::new("ambient".to_string()));
        rc.scope(async {
            let mut ctx = SkillContext::new();
            ctx.insert("k", Arc::new("explicit".to_string()));
            let ctx = ctx.inherit_ambient();
            assert_eq!(&*ctx.get::<String>("k").unwrap(), "explicit");
        })
        .await;
    }
}
