// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Request admission and the fair-share worker.
//!
//! Four priority lanes (superadmin, private, group-mention, group-normal)
//! drain round-robin with a burst of 2 per lane.  Every two lane rotations,
//! if the last rotation did not land on the normal lane, one normal item is
//! forcibly popped so sustained high-priority traffic cannot starve it.  The
//! normal lane is additionally trimmed on enqueue: beyond 10 queued items
//! only the newest 2 survive.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{info, warn};

const LANE_COUNT: usize = 4;
const BURST: usize = 2;
const TRIM_THRESHOLD: usize = 10;
const TRIM_TARGET: usize = 2;
const IDLE_SLEEP: Duration = Duration::from_millis(200);

/// The four priority lanes, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Superadmin,
    Private,
    GroupMention,
    GroupNormal,
}

impl Lane {
    fn index(self) -> usize {
        match self {
            Self::Superadmin => 0,
            Self::Private => 1,
            Self::GroupMention => 2,
            Self::GroupNormal => 3,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Superadmin => "superadmin",
            Self::Private => "private",
            Self::GroupMention => "group_mention",
            Self::GroupNormal => "group_normal",
        }
    }

    fn from_index(idx: usize) -> Self {
        match idx {
            0 => Self::Superadmin,
            1 => Self::Private,
            2 => Self::GroupMention,
            _ => Self::GroupNormal,
        }
    }
}

/// One admitted request waiting for execution.
#[derive(Debug, Clone)]
pub enum QueueRequest {
    AutoReply {
        group_id: i64,
        sender_id: i64,
        sender_name: String,
        group_name: String,
        text: String,
        full_question: String,
        is_at_bot: bool,
    },
    PrivateReply {
        user_id: i64,
        sender_name: String,
        text: String,
        full_question: String,
    },
    StatsAnalysis {
        group_id: i64,
        request_id: String,
        data_summary: String,
    },
    AgentIntroGeneration {
        request_id: String,
        agent_name: String,
    },
}

impl QueueRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AutoReply { .. } => "auto_reply",
            Self::PrivateReply { .. } => "private_reply",
            Self::StatsAnalysis { .. } => "stats_analysis",
            Self::AgentIntroGeneration { .. } => "agent_intro_generation",
        }
    }
}

/// The worker's execution seam, implemented by the coordinator.
/// Implementations catch their own errors; one request's failure must never
/// take the worker down.
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    async fn execute(&self, lane: Lane, request: QueueRequest);
}

pub struct QueueManager {
    lanes: [Mutex<VecDeque<QueueRequest>>; LANE_COUNT],
    interval: Duration,
}

pub struct QueueWorkerHandle {
    stop_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl QueueWorkerHandle {
    /// Stop dequeuing; the in-flight item gets `drain` to finish, then the
    /// worker is abandoned.
    pub async fn stop(self, drain: Duration) {
        let _ = self.stop_tx.send(true);
        if tokio::time::timeout(drain, self.task).await.is_err() {
            warn!("queue worker did not drain in time; abandoned");
        }
    }
}

impl QueueManager {
    pub fn new(interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            lanes: Default::default(),
            interval,
        })
    }

    /// Enqueue onto a lane.  The normal lane is trimmed first when it has
    /// grown past the threshold.
    pub fn enqueue(&self, lane: Lane, request: QueueRequest) {
        if lane == Lane::GroupNormal {
            self.trim_normal_if_needed();
        }
        let mut queue = self.lock_lane(lane.index());
        queue.push_back(request);
        info!(
            lane = lane.label(),
            depth = queue.len(),
            "request enqueued"
        );
    }

    pub fn lane_len(&self, lane: Lane) -> usize {
        self.lock_lane(lane.index()).len()
    }

    fn trim_normal_if_needed(&self) {
        let mut queue = self.lock_lane(Lane::GroupNormal.index());
        let len = queue.len();
        if len > TRIM_THRESHOLD {
            let dropped = len - TRIM_TARGET;
            queue.drain(..dropped);
            info!(
                before = len,
                after = queue.len(),
                "normal lane trimmed to newest entries"
            );
        }
    }

    fn pop(&self, lane: Lane) -> Option<QueueRequest> {
        self.lock_lane(lane.index()).pop_front()
    }

    fn all_empty(&self) -> bool {
        (0..LANE_COUNT).all(|i| self.lock_lane(i).is_empty())
    }

    fn lock_lane(&self, idx: usize) -> std::sync::MutexGuard<'_, VecDeque<QueueRequest>> {
        match self.lanes[idx].lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Start the fair-share worker.
    pub fn spawn_worker(
        self: &Arc<Self>,
        executor: Arc<dyn RequestExecutor>,
    ) -> QueueWorkerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let manager = self.clone();
        let task = tokio::spawn(async move {
            manager.worker_loop(executor, stop_rx).await;
        });
        info!("queue worker started");
        QueueWorkerHandle { stop_tx, task }
    }

    async fn worker_loop(
        &self,
        executor: Arc<dyn RequestExecutor>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let mut lane_idx = 0usize;
        let mut processed_in_lane = 0usize;
        let mut rotation_count = 0usize;
        let mut last_rotation_to_normal = false;

        loop {
            if *stop_rx.borrow() {
                break;
            }

            let lane = Lane::from_index(lane_idx);
            let Some(request) = self.pop(lane) else {
                if self.all_empty() {
                    tokio::select! {
                        _ = stop_rx.changed() => break,
                        _ = tokio::time::sleep(IDLE_SLEEP) => {}
                    }
                    continue;
                }
                lane_idx = (lane_idx + 1) % LANE_COUNT;
                processed_in_lane = 0;
                rotation_count += 1;
                continue;
            };

            info!(
                lane = lane.label(),
                kind = request.kind(),
                remaining = self.lane_len(lane),
                "processing request"
            );
            executor.execute(lane, request).await;
            processed_in_lane += 1;

            if processed_in_lane >= BURST {
                let next = (lane_idx + 1) % LANE_COUNT;
                last_rotation_to_normal = next == Lane::GroupNormal.index();
                lane_idx = next;
                processed_in_lane = 0;
                rotation_count += 1;
            }

            // Starvation guard: every two rotations that did not land on the
            // normal lane, force one normal item through.
            if rotation_count > 0 && rotation_count % 2 == 0 && !last_rotation_to_normal {
                if let Some(normal) = self.pop(Lane::GroupNormal) {
                    info!(kind = normal.kind(), "forced normal-lane pop");
                    executor.execute(Lane::GroupNormal, normal).await;
                }
                rotation_count = 0;
            }

            if !self.interval.is_zero() {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = tokio::time::sleep(self.interval) => {}
                }
            }
        }
        info!("queue worker exited");
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
