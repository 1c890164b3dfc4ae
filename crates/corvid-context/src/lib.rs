// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Ambient per-request state.
//!
//! Every admitted request runs inside a [`RequestContext`] scope.  The context
//! carries the request identity (type, group/user/sender ids), a string-keyed
//! resource map that skills read their collaborators from, and the two turn
//! flags (`message_sent_this_turn`, `conversation_ended`) that the `end` tool
//! and the loop coordinate through.
//!
//! The context is *ambient*: code running on behalf of a request reaches it
//! via [`RequestContext::current`] without threading the value through every
//! signature.  Entering a scope is explicit ([`RequestContext::scope`]);
//! child tasks must be spawned with [`spawn_scoped`] to inherit the parent
//! scope, because a bare `tokio::spawn` does not propagate task-locals.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::warn;

/// Where a request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Group,
    Private,
    Scheduled,
}

impl RequestType {
    /// Wire/label form used in prompts, job payloads and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Group => "group",
            Self::Private => "private",
            Self::Scheduled => "scheduled",
        }
    }
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An opaque shared resource stored in the context map.
pub type Resource = Arc<dyn Any + Send + Sync>;

/// Per-request ambient state.
///
/// Created when a request is admitted, dropped when the loop returns.  All
/// fields except identity are interior-mutable so the context can be shared
/// (`Arc`) between the loop and concurrently executing tools.
pub struct RequestContext {
    pub request_type: RequestType,
    pub group_id: Option<i64>,
    pub user_id: Option<i64>,
    pub sender_id: Option<i64>,
    /// Monotonic within one process, random across restarts.
    pub request_id: String,

    resources: Mutex<HashMap<String, Resource>>,
    conversation_ended: AtomicBool,
    message_sent_this_turn: AtomicBool,
    /// Sequence number for `end` records within this request.
    end_seq: AtomicU64,
}

tokio::task_local! {
    static CURRENT: Arc<RequestContext>;
}

static REQUEST_SEQ: AtomicU64 = AtomicU64::new(0);

fn next_request_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let seq = REQUEST_SEQ.fetch_add(1, Ordering::Relaxed);
    let rand = &uuid::Uuid::new_v4().simple().to_string()[..8];
    format!("{millis}-{seq}-{rand}")
}

impl RequestContext {
    pub fn new(
        request_type: RequestType,
        group_id: Option<i64>,
        user_id: Option<i64>,
        sender_id: Option<i64>,
    ) -> Arc<Self> {
        Arc::new(Self {
            request_type,
            group_id,
            user_id,
            sender_id,
            request_id: next_request_id(),
            resources: Mutex::new(HashMap::new()),
            conversation_ended: AtomicBool::new(false),
            message_sent_this_turn: AtomicBool::new(false),
            end_seq: AtomicU64::new(0),
        })
    }

    /// Convenience constructor for a group request.
    pub fn group(group_id: i64, sender_id: i64) -> Arc<Self> {
        Self::new(
            RequestType::Group,
            Some(group_id),
            Some(sender_id),
            Some(sender_id),
        )
    }

    /// Convenience constructor for a private request.
    pub fn private(user_id: i64) -> Arc<Self> {
        Self::new(RequestType::Private, None, Some(user_id), Some(user_id))
    }

    /// Convenience constructor for a scheduler-originated request.
    pub fn scheduled(group_id: Option<i64>, user_id: Option<i64>) -> Arc<Self> {
        Self::new(RequestType::Scheduled, group_id, user_id, user_id)
    }

    /// The innermost active context, or `None` outside any scope.
    ///
    /// Core components treat `None` as a programming error and log it; skill
    /// handlers must fall back to their defaults (skills are portable).
    pub fn current() -> Option<Arc<RequestContext>> {
        CURRENT.try_with(|c| c.clone()).ok()
    }

    /// Run `fut` inside this context's scope.
    pub async fn scope<F: Future>(self: &Arc<Self>, fut: F) -> F::Output {
        CURRENT.scope(self.clone(), fut).await
    }

    /// Store a resource under `key`.  Last write wins within one scope.
    pub fn set_resource<T: Any + Send + Sync>(&self, key: &str, value: Arc<T>) {
        self.set_resource_raw(key, value as Resource);
    }

    pub fn set_resource_raw(&self, key: &str, value: Resource) {
        let mut map = match self.resources.lock() {
            Ok(m) => m,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.insert(key.to_string(), value);
    }

    /// Fetch a typed resource.  Returns `None` when the key is missing or the
    /// stored value has a different type.
    pub fn get_resource<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.get_resource_raw(key)
            .and_then(|r| r.downcast::<T>().ok())
    }

    pub fn get_resource_raw(&self, key: &str) -> Option<Resource> {
        let map = match self.resources.lock() {
            Ok(m) => m,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.get(key).cloned()
    }

    /// Snapshot of all resource keys, for diagnostics.
    pub fn resource_keys(&self) -> Vec<String> {
        let map = match self.resources.lock() {
            Ok(m) => m,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut keys: Vec<String> = map.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn conversation_ended(&self) -> bool {
        self.conversation_ended.load(Ordering::SeqCst)
    }

    pub fn set_conversation_ended(&self, value: bool) {
        self.conversation_ended.store(value, Ordering::SeqCst);
    }

    pub fn message_sent_this_turn(&self) -> bool {
        self.message_sent_this_turn.load(Ordering::SeqCst)
    }

    pub fn set_message_sent_this_turn(&self, value: bool) {
        self.message_sent_this_turn.store(value, Ordering::SeqCst);
    }

    /// Next sequence number for an `end` record within this request.
    pub fn next_end_seq(&self) -> u64 {
        self.end_seq.fetch_add(1, Ordering::SeqCst)
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_type", &self.request_type)
            .field("request_id", &self.request_id)
            .field("group_id", &self.group_id)
            .field("user_id", &self.user_id)
            .field("sender_id", &self.sender_id)
            .finish_non_exhaustive()
    }
}

/// Spawn a task that inherits the current context scope.
///
/// Falls back to a plain spawn (with a warning) when called outside any
/// scope — the spawned code then sees `current() == None`.
pub fn spawn_scoped<F>(fut: F) -> tokio::task::JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match RequestContext::current() {
        Some(ctx) => tokio::spawn(async move { ctx.scope(fut).await }),
        None => {
            warn!("spawn_scoped called outside a request context scope");
            tokio::spawn(fut)
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
