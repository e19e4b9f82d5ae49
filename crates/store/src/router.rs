//! Per-kind event router: FIFO intake, per-key serialization, cross-key fan-out.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use metrics::counter;
use mirra_core::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Events held back while their key's handler is still running.
/// A newer event for a key replaces the pending one: every write carries the
/// full object, so only the latest matters.
#[derive(Debug, Default)]
pub struct PendingQueue {
    map: FxHashMap<ObjectKey, WatchEvent>,
    coalesced: u64,
}

impl PendingQueue {
    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
    pub fn coalesced(&self) -> u64 { self.coalesced }

    /// Returns true when an older pending event was replaced.
    pub fn push(&mut self, key: ObjectKey, event: WatchEvent) -> bool {
        let replaced = self.map.insert(key, event).is_some();
        if replaced {
            self.coalesced += 1;
        }
        replaced
    }

    pub fn take(&mut self, key: &ObjectKey) -> Option<WatchEvent> { self.map.remove(key) }
}

/// Counters reported when a router exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub handled: u64,
    pub failed: u64,
    pub coalesced: u64,
}

type TaskOutput = (ObjectKey, std::thread::Result<MirrorResult<Outcome>>);

/// Hands a key back to the router if its task is dropped before reporting
/// (cancelled), so the key never stays marked in flight.
struct Release {
    key: Option<ObjectKey>,
    tx: mpsc::UnboundedSender<ObjectKey>,
}

impl Drop for Release {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let _ = self.tx.send(key);
        }
    }
}

pub struct EventRouter {
    kind: ResourceKind,
    handler: Arc<dyn Handler>,
    max_in_flight: usize,
}

impl EventRouter {
    pub fn new(kind: ResourceKind, handler: Arc<dyn Handler>, max_in_flight: usize) -> Self {
        Self { kind, handler, max_in_flight: max_in_flight.max(1) }
    }

    fn spawn(
        &self,
        tasks: &mut JoinSet<TaskOutput>,
        in_flight: &mut FxHashSet<ObjectKey>,
        released: &mpsc::UnboundedSender<ObjectKey>,
        key: ObjectKey,
        event: WatchEvent,
    ) {
        in_flight.insert(key.clone());
        let handler = Arc::clone(&self.handler);
        let mut release = Release { key: Some(key.clone()), tx: released.clone() };
        tasks.spawn(async move {
            let res = AssertUnwindSafe(handler.handle(event)).catch_unwind().await;
            release.key = None;
            (key, res)
        });
    }

    /// Consume `rx` until it closes (then drain) or the stop signal fires
    /// (then abort whatever is in flight).
    pub async fn run(self, mut rx: mpsc::Receiver<WatchEvent>, mut shutdown: watch::Receiver<bool>) -> RouterStats {
        let mut tasks: JoinSet<TaskOutput> = JoinSet::new();
        let mut in_flight: FxHashSet<ObjectKey> = FxHashSet::default();
        let mut pending = PendingQueue::default();
        let (released_tx, mut released_rx) = mpsc::unbounded_channel::<ObjectKey>();
        let mut stats = RouterStats::default();
        let mut open = true;
        let kind_label = self.kind.to_string();

        loop {
            if !open && tasks.is_empty() {
                break;
            }
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                Some(key) = released_rx.recv() => {
                    error!(kind = %self.kind, key = %key, "handler task cancelled");
                    in_flight.remove(&key);
                    stats.failed += 1;
                    if let Some(next) = pending.take(&key) {
                        self.spawn(&mut tasks, &mut in_flight, &released_tx, key, next);
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    let (key, res) = match joined {
                        Ok(done) => done,
                        Err(e) => {
                            // The task's Release guard reports the key.
                            error!(kind = %self.kind, error = %e, "handler task failed");
                            continue;
                        }
                    };
                    in_flight.remove(&key);
                    stats.handled += 1;
                    match res {
                        Ok(Ok(outcome)) => debug!(kind = %self.kind, key = %key, outcome = outcome.as_str(), "handled"),
                        Ok(Err(e)) => {
                            stats.failed += 1;
                            debug!(kind = %self.kind, key = %key, error = %e, "handler failed");
                        }
                        Err(_) => {
                            stats.failed += 1;
                            error!(kind = %self.kind, key = %key, "handler panicked");
                        }
                    }
                    if let Some(next) = pending.take(&key) {
                        self.spawn(&mut tasks, &mut in_flight, &released_tx, key, next);
                    }
                }
                maybe = rx.recv(), if open && tasks.len() < self.max_in_flight => match maybe {
                    Some(event) => {
                        let key = match event.key() {
                            Ok(key) => key,
                            Err(e) => {
                                warn!(kind = %self.kind, error = %e, "dropping event without key");
                                counter!("mirror_transform_errors_total", 1, "kind" => kind_label.clone());
                                continue;
                            }
                        };
                        if in_flight.contains(&key) {
                            if pending.push(key, event) {
                                counter!("router_coalesced_total", 1, "kind" => kind_label.clone());
                            }
                        } else {
                            self.spawn(&mut tasks, &mut in_flight, &released_tx, key, event);
                        }
                    }
                    None => open = false,
                },
            }
        }

        if !tasks.is_empty() || !pending.is_empty() {
            info!(kind = %self.kind, in_flight = tasks.len(), pending = pending.len(), "router stopping; abandoning in-flight work");
        }
        tasks.shutdown().await;
        stats.coalesced = pending.coalesced();
        stats
    }
}
