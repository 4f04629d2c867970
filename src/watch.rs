//! The watch loop: filesystem events in, debounced applies out.
//!
//! ```text
//! notify thread ──blocking_send──▶ bounded mpsc ──▶ consumer task
//!                                                  │
//!                 Idle → EventPending → Debouncing → Applying → Idle
//! ```
//!
//! The OS watcher ([`start_fs_watcher`]) only translates events and pushes
//! them into the queue. A single consumer task ([`spawn_watch_loop`])
//! keeps one deadline per pending path; every new event for a path pushes
//! its deadline out by the debounce interval. When a deadline passes, the
//! path is reclassified on its own (no full-tree diff) and applied.
//!
//! On start the loop runs one full sync to catch offline changes. On stop
//! it finishes the apply in progress, drops whatever is still pending
//! (the next start's full sync picks it up) and exits.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::sync::{Refresh, Synchronizer};

/// A change reported by the filesystem (or pushed by a caller).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// Created or modified.
    Upsert(PathBuf),
    Remove(PathBuf),
    /// Handled as `Remove(from)` plus `Upsert(to)`.
    Rename { from: PathBuf, to: PathBuf },
    /// Something changed that cannot be pinned to files (a directory was
    /// moved); run a full-tree sync.
    Rescan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WatchState {
    Idle,
    EventPending,
    Debouncing,
    Applying,
}

/// Counters reported when the loop exits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WatchSummary {
    pub applied: usize,
    pub touched: usize,
    /// Files with no indexable text.
    pub empty: usize,
    pub deferred: usize,
    pub failed: usize,
    pub rescans: usize,
}

/// Handle to a running watch loop.
pub struct WatchHandle {
    events: mpsc::Sender<WatchEvent>,
    state: watch::Receiver<WatchState>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<WatchSummary>,
}

impl WatchHandle {
    /// Sender for feeding events into the loop.
    pub fn sender(&self) -> mpsc::Sender<WatchEvent> {
        self.events.clone()
    }

    pub async fn push(&self, event: WatchEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .context("watch loop has stopped")
    }

    pub fn state(&self) -> WatchState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<WatchState> {
        self.state.clone()
    }

    /// Stop accepting events, let the current apply finish, and return
    /// the loop's counters.
    pub async fn stop(self) -> Result<WatchSummary> {
        let _ = self.shutdown.send(true);
        drop(self.events);
        self.task.await.context("watch loop panicked")
    }
}

/// Spawn the consumer task. It starts with a full sync, then handles
/// events from the returned handle's queue.
pub fn spawn_watch_loop(
    sync: Arc<Synchronizer>,
    debounce: Duration,
    queue_capacity: usize,
) -> WatchHandle {
    let (events_tx, events_rx) = mpsc::channel(queue_capacity.max(1));
    let (state_tx, state_rx) = watch::channel(WatchState::Applying);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let consumer = Consumer {
        sync,
        debounce,
        state: state_tx,
        pending: HashMap::new(),
        rescan_at: None,
        summary: WatchSummary::default(),
    };
    let task = tokio::spawn(consumer.run(events_rx, shutdown_rx));

    WatchHandle {
        events: events_tx,
        state: state_rx,
        shutdown: shutdown_tx,
        task,
    }
}

struct Consumer {
    sync: Arc<Synchronizer>,
    debounce: Duration,
    state: watch::Sender<WatchState>,
    pending: HashMap<PathBuf, Instant>,
    rescan_at: Option<Instant>,
    summary: WatchSummary,
}

impl Consumer {
    async fn run(
        mut self,
        mut events: mpsc::Receiver<WatchEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> WatchSummary {
        self.set_state(WatchState::Applying);
        self.full_sync().await;

        loop {
            let next = self.next_deadline();
            self.set_state(if next.is_some() {
                WatchState::Debouncing
            } else {
                WatchState::Idle
            });

            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                event = events.recv() => match event {
                    Some(event) => {
                        self.set_state(WatchState::EventPending);
                        self.enqueue(event);
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(next.unwrap_or_else(Instant::now)), if next.is_some() => {
                    self.set_state(WatchState::Applying);
                    self.apply_due().await;
                }
            }
        }

        if !self.pending.is_empty() {
            info!(
                pending = self.pending.len(),
                "watch stopped; pending paths will be caught by the next startup sync"
            );
        }
        self.set_state(WatchState::Idle);
        self.summary
    }

    fn set_state(&self, state: WatchState) {
        self.state.send_replace(state);
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .copied()
            .chain(self.rescan_at)
            .min()
    }

    fn enqueue(&mut self, event: WatchEvent) {
        let deadline = Instant::now() + self.debounce;
        debug!(?event, "watch event");
        match event {
            WatchEvent::Upsert(path) | WatchEvent::Remove(path) => {
                self.pending.insert(path, deadline);
            }
            WatchEvent::Rename { from, to } => {
                self.pending.insert(from, deadline);
                self.pending.insert(to, deadline);
            }
            WatchEvent::Rescan => self.rescan_at = Some(deadline),
        }
    }

    async fn apply_due(&mut self) {
        let now = Instant::now();

        if self.rescan_at.is_some_and(|t| t <= now) {
            self.rescan_at = None;
            // The full sync covers every pending path too.
            self.pending.clear();
            self.full_sync().await;
            return;
        }

        let mut due: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();
        due.sort();

        for path in due {
            self.pending.remove(&path);
            self.apply_path(&path).await;
        }
    }

    async fn apply_path(&mut self, path: &Path) {
        match self.sync.refresh_path(path).await {
            Ok(Refresh::Applied(outcome)) if outcome.empty => {
                self.summary.empty += 1;
                debug!(path = %outcome.path, "no indexable text");
            }
            Ok(Refresh::Applied(outcome)) => {
                self.summary.applied += 1;
                info!(
                    path = %outcome.path,
                    action = ?outcome.action,
                    chunks = outcome.chunks,
                    removed = outcome.removed,
                    "applied"
                );
            }
            Ok(Refresh::Touched) => self.summary.touched += 1,
            Ok(Refresh::Unchanged) => {}
            Ok(Refresh::Deferred(reason)) => {
                self.summary.deferred += 1;
                warn!(path = %path.display(), reason = %reason, "file unreadable; will retry on next event");
            }
            Err(e) => {
                self.summary.failed += 1;
                warn!(path = %path.display(), error = %e, "apply failed; previous revision kept");
            }
        }
    }

    async fn full_sync(&mut self) {
        self.summary.rescans += 1;
        match self.sync.sync_all().await {
            Ok(report) => {
                self.summary.applied += report.added + report.updated + report.deleted;
                self.summary.touched += report.touched;
                self.summary.empty += report.empty;
                self.summary.deferred += report.deferred.len();
                self.summary.failed += report.failures.len();
                info!(
                    added = report.added,
                    updated = report.updated,
                    deleted = report.deleted,
                    unchanged = report.unchanged,
                    failures = report.failures.len(),
                    "full sync finished"
                );
            }
            Err(e) => {
                self.summary.failed += 1;
                error!(error = %e, "full sync failed");
            }
        }
    }
}

/// Start the OS watcher on `root`, forwarding translated events into
/// `events`. Keep the returned watcher alive for as long as events are
/// wanted.
pub fn start_fs_watcher(root: &Path, events: mpsc::Sender<WatchEvent>) -> Result<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for ev in translate(&event) {
                    // Runs on notify's own thread, so blocking is fine;
                    // a full queue applies backpressure here.
                    if events.blocking_send(ev).is_err() {
                        return;
                    }
                }
            }
            Err(e) => warn!(error = %e, "filesystem watcher error"),
        },
        notify::Config::default(),
    )
    .context("Failed to create filesystem watcher")?;
    watcher
        .watch(root, RecursiveMode::Recursive)
        .with_context(|| format!("Failed to watch {}", root.display()))?;
    Ok(watcher)
}

/// Map a notify event onto watch events.
pub fn translate(event: &Event) -> Vec<WatchEvent> {
    let paths = &event.paths;
    match &event.kind {
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() == 2 => {
            let (from, to) = (&paths[0], &paths[1]);
            if to.is_dir() {
                vec![WatchEvent::Rescan]
            } else {
                vec![WatchEvent::Rename {
                    from: from.clone(),
                    to: to.clone(),
                }]
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) | EventKind::Remove(_) => {
            paths.iter().map(|p| removal(p)).collect()
        }
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any => {
            paths.iter().map(|p| upsert(p)).collect()
        }
        EventKind::Access(_) | EventKind::Other => Vec::new(),
    }
}

fn upsert(path: &Path) -> WatchEvent {
    if path.is_dir() {
        WatchEvent::Rescan
    } else {
        WatchEvent::Upsert(path.to_path_buf())
    }
}

/// A removed path without a document extension may have been a directory.
fn removal(path: &Path) -> WatchEvent {
    if path.extension().is_none() {
        WatchEvent::Rescan
    } else {
        WatchEvent::Remove(path.to_path_buf())
    }
}
