//! Mirra engine (in-process).
//!
//! Wires the pieces together: preflight checks, kind resolution, then one
//! reflector + router + reconciler pipeline per kind, all sharing a single
//! stop signal.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use mirra_apply::MirrorReconciler;
use mirra_core::prelude::*;
use mirra_store::{EventRouter, Reflector, RouterStats};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Per-kind counters collected when a pipeline exits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindReport {
    pub kind: String,
    pub handled: u64,
    pub failed: u64,
    pub coalesced: u64,
}

impl KindReport {
    fn new(kind: &ResourceKind, stats: RouterStats) -> Self {
        Self { kind: kind.to_string(), handled: stats.handled, failed: stats.failed, coalesced: stats.coalesced }
    }
}

enum TaskExit {
    Reflector,
    Router(ResourceKind, RouterStats),
}

pub struct Engine {
    cfg: MirrorConfig,
    plane: Arc<dyn ControlPlane>,
    source: Arc<dyn SourceApi>,
    dest: Arc<dyn DestinationApi>,
}

impl Engine {
    pub fn new(
        cfg: MirrorConfig,
        plane: Arc<dyn ControlPlane>,
        source: Arc<dyn SourceApi>,
        dest: Arc<dyn DestinationApi>,
    ) -> Self {
        Self { cfg, plane, source, dest }
    }

    pub fn config(&self) -> &MirrorConfig { &self.cfg }

    /// Kinds that `start` would mirror, without touching namespaces.
    pub async fn discover(&self) -> MirrorResult<Vec<ResourceKind>> {
        let t0 = Instant::now();
        let kinds = mirra_kubehub::resolve_kinds(self.plane.as_ref(), &self.cfg.selection).await?;
        info!(count = kinds.len(), took_ms = %t0.elapsed().as_millis(), "engine: discover ok");
        Ok(kinds)
    }

    /// Validate, preflight, resolve and spawn every pipeline.
    ///
    /// Errors here are fatal (invalid config, missing namespace, discovery
    /// failure). Once started, nothing short of the stop signal ends a pipeline.
    pub async fn start(self) -> MirrorResult<MirrorHandle> {
        self.cfg.validate()?;
        mirra_kubehub::ensure_namespaces(self.plane.as_ref(), &self.cfg).await?;
        let kinds = self.discover().await?;
        if kinds.is_empty() {
            warn!(from = %self.cfg.source_namespace, "no mirrorable kinds; nothing to do");
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();
        for kind in &kinds {
            let (tx, rx) = mpsc::channel(self.cfg.queue_cap);
            let reflector = Reflector::new(kind.clone(), Arc::clone(&self.source), &self.cfg, tx);
            let reconciler = MirrorReconciler::new(kind.clone(), &self.cfg, Arc::clone(&self.dest));
            let router = EventRouter::new(kind.clone(), Arc::new(reconciler), self.cfg.max_in_flight);

            let stop = stop_rx.clone();
            tasks.spawn(async move {
                reflector.run(stop).await;
                TaskExit::Reflector
            });
            let stop = stop_rx.clone();
            let k = kind.clone();
            tasks.spawn(async move {
                let stats = router.run(rx, stop).await;
                TaskExit::Router(k, stats)
            });
        }
        info!(
            from = %self.cfg.source_namespace,
            to = %self.cfg.destination_namespace,
            kinds = kinds.len(),
            "mirror started"
        );
        Ok(MirrorHandle { kinds, stop: stop_tx, tasks })
    }
}

/// Running mirror. Dropping the handle aborts every pipeline task.
pub struct MirrorHandle {
    kinds: Vec<ResourceKind>,
    stop: watch::Sender<bool>,
    tasks: JoinSet<TaskExit>,
}

impl MirrorHandle {
    pub fn kinds(&self) -> &[ResourceKind] { &self.kinds }

    /// Signal every reflector and router to stop.
    pub fn shutdown(&self) {
        info!("mirror stopping");
        let _ = self.stop.send(true);
    }

    /// Wait for every pipeline task; returns per-kind router counters sorted by kind.
    pub async fn join(mut self) -> Vec<KindReport> {
        let mut reports = Vec::with_capacity(self.kinds.len());
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(TaskExit::Router(kind, stats)) => reports.push(KindReport::new(&kind, stats)),
                Ok(TaskExit::Reflector) => {}
                Err(e) => warn!(error = %e, "pipeline task failed"),
            }
        }
        reports.sort_by(|a, b| a.kind.cmp(&b.kind));
        reports
    }

    /// Run until `signal` completes, then stop and wait.
    pub async fn run_until<F>(self, signal: F) -> Vec<KindReport>
    where
        F: std::future::Future<Output = ()>,
    {
        signal.await;
        self.shutdown();
        self.join().await
    }
}
