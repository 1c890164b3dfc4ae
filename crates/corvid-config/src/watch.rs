// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Shared filesystem-scan hot-reload loop.
//!
//! Used by the skill registries and the config manager.  The loop takes a
//! snapshot at each tick and fires `on_change` only after the new snapshot has
//! stayed stable for at least `debounce` (and one extra tick), so a half-saved
//! file never triggers a reload.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Handle to a running hot-reload loop.  Dropping the handle leaves the loop
/// running; call [`HotReload::stop`] for clean shutdown.
pub struct HotReload {
    stop: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
}

impl HotReload {
    /// Spawn a poll loop.
    ///
    /// `snapshot` is called once per `interval` tick; when its result differs
    /// from the last applied snapshot and has been stable for `debounce`,
    /// `on_change(&snapshot)` runs from the poller's task.
    pub fn spawn<S, F, G>(interval: Duration, debounce: Duration, snapshot: F, mut on_change: G) -> Self
    where
        S: PartialEq + Send + 'static,
        F: Fn() -> S + Send + 'static,
        G: FnMut(&S) + Send + 'static,
    {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let mut applied = snapshot();
            // The candidate change waiting out its debounce window.
            let mut pending: Option<(S, Instant)> = None;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // Consume the immediate first tick.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => {
                        debug!("hot-reload loop stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let current = snapshot();
                        if current == applied {
                            pending = None;
                            continue;
                        }
                        match pending.take() {
                            Some((candidate, first_seen))
                                if candidate == current
                                    && first_seen.elapsed() >= debounce =>
                            {
                                on_change(&current);
                                applied = current;
                            }
                            Some((candidate, first_seen)) if candidate == current => {
                                // Stable but still inside the debounce window.
                                pending = Some((candidate, first_seen));
                            }
                            _ => {
                                // New or still-churning change; restart the window.
                                pending = Some((current, Instant::now()));
                            }
                        }
                    }
                }
            }
        });
        Self {
            stop: Some(stop_tx),
            task,
        }
    }

    /// Stop the loop and wait for it to exit.
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            if !e.is_cancelled() {
                warn!("hot-reload task join error: {e}");
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn stable_change_fires_once() {
        let value = Arc::new(AtomicU32::new(0));
        let fired = Arc::new(AtomicU32::new(0));
        let v = value.clone();
        let f = fired.clone();
        let hr = HotReload::spawn(
            Duration::from_millis(100),
            Duration::from_millis(150),
            move || v.load(Ordering::SeqCst),
            move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            },
        );
        value.store(1, Ordering::SeqCst);
        // Enough ticks for detection + debounce + confirmation.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        hr.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn no_change_never_fires() {
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        let hr = HotReload::spawn(
            Duration::from_millis(50),
            Duration::from_millis(50),
            || 7u32,
            move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            },
        );
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        hr.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn churning_change_waits_for_stability() {
        let value = Arc::new(AtomicU32::new(0));
        let fired = Arc::new(AtomicU32::new(0));
        let v = value.clone();
        let f = fired.clone();
        let hr = HotReload::spawn(
            Duration::from_millis(100),
            Duration::from_millis(100),
            move || v.load(Ordering::SeqCst),
            move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            },
        );
        // Change the value every tick for a while: never stable, never fires.
        for i in 1..5u32 {
            value.store(i, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        // Now let it settle.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        hr.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_clean() {
        let hr = HotReload::spawn(
            Duration::from_millis(10),
            Duration::from_millis(10),
            || 0u32,
            |_| {},
        );
        hr.stop().await;
    }
}
