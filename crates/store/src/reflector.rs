//! Per-kind list-then-watch reflector with periodic resync.
//!
//! The reflector is an explicit state machine:
//!
//! ```text
//! Init → Listing → Watching ─(stream error / stall)→ Relisting → Watching → … → Stopped
//! ```
//!
//! Each transition is a public method ([`Reflector::list_pass`],
//! [`Reflector::apply_source_event`], [`Reflector::resync`]) so relist- and
//! resync-triggered re-delivery can be driven step by step; [`Reflector::run`]
//! strings them together for the process lifetime.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use metrics::counter;
use mirra_core::prelude::*;
use mirra_core::compare_resource_versions;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub const RELIST_BACKOFF_MIN: Duration = Duration::from_millis(500);
pub const RELIST_BACKOFF_MAX: Duration = Duration::from_secs(30);
/// A watch ending sooner than this without delivering anything counts as a failure.
pub const WATCH_MIN_LIFETIME: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Listing,
    Watching,
    Relisting,
    Stopped,
}

/// Checkpoint and cache, owned by exactly one reflector.
#[derive(Debug, Default)]
pub struct ReflectorState {
    pub last_resource_version: String,
    pub cache: FxHashMap<ObjectKey, ResourceObject>,
}

impl ReflectorState {
    /// Move the checkpoint forward. Numeric versions never go backwards;
    /// opaque ones are taken as given.
    fn advance(&mut self, rv: &str) {
        if rv.is_empty() {
            return;
        }
        if compare_resource_versions(rv, &self.last_resource_version) != Some(Ordering::Less) {
            self.last_resource_version = rv.to_string();
        }
    }
}

enum Step {
    Stop,
    Resync,
    Event(SourceEvent),
    Broken(String),
    Ended,
}

pub struct Reflector {
    kind: ResourceKind,
    namespace: String,
    selector: Option<String>,
    source: Arc<dyn SourceApi>,
    tx: mpsc::Sender<WatchEvent>,
    resync_interval: Duration,
    idle_timeout: Duration,
    backoff_min: Duration,
    backoff_max: Duration,
    state: ReflectorState,
    phase: Phase,
}

impl Reflector {
    pub fn new(kind: ResourceKind, source: Arc<dyn SourceApi>, cfg: &MirrorConfig, tx: mpsc::Sender<WatchEvent>) -> Self {
        Self {
            kind,
            namespace: cfg.source_namespace.clone(),
            selector: cfg.label_selector.clone(),
            source,
            tx,
            resync_interval: cfg.resync_interval,
            idle_timeout: cfg.watch_idle_timeout,
            backoff_min: RELIST_BACKOFF_MIN,
            backoff_max: RELIST_BACKOFF_MAX,
            state: ReflectorState::default(),
            phase: Phase::Init,
        }
    }

    pub fn with_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.backoff_min = min;
        self.backoff_max = max.max(min);
        self
    }

    pub fn kind(&self) -> &ResourceKind { &self.kind }
    pub fn phase(&self) -> Phase { self.phase }
    pub fn state(&self) -> &ReflectorState { &self.state }

    async fn emit(&mut self, event: WatchEvent) {
        if self.phase == Phase::Stopped {
            return;
        }
        counter!("mirror_events_total", 1, "kind" => self.kind.to_string(), "event" => event.kind.as_str());
        if self.tx.send(event).await.is_err() {
            debug!(kind = %self.kind, "router gone; stopping reflector");
            self.phase = Phase::Stopped;
        }
    }

    /// LISTING / RELISTING: replace the cache with a fresh list, emit Deleted
    /// for keys that vanished upstream and Added for every listed object, then
    /// move to Watching from the list checkpoint.
    pub async fn list_pass(&mut self) -> MirrorResult<()> {
        let relisting = self.phase == Phase::Relisting;
        let list = self.source.list(&self.kind, &self.namespace, self.selector.as_deref()).await?;
        let checkpoint = list.resource_version;

        let mut fresh: Vec<(ObjectKey, ResourceObject)> = Vec::with_capacity(list.items.len());
        for obj in list.items {
            match obj.key() {
                Ok(key) => fresh.push((key, obj)),
                Err(e) => warn!(kind = %self.kind, error = %e, "skipping listed object"),
            }
        }

        let present: FxHashSet<&ObjectKey> = fresh.iter().map(|(k, _)| k).collect();
        let mut vanished: Vec<ObjectKey> = self.state.cache.keys().filter(|k| !present.contains(k)).cloned().collect();
        drop(present);
        vanished.sort();
        for key in vanished {
            if let Some(object) = self.state.cache.remove(&key) {
                debug!(kind = %self.kind, key = %key, "object vanished during relist");
                self.emit(WatchEvent { kind: EventKind::Deleted, object, resource_version: checkpoint.clone() }).await;
            }
        }

        let count = fresh.len();
        for (key, object) in fresh {
            self.state.cache.insert(key, object.clone());
            self.emit(WatchEvent::added(object)).await;
        }
        self.state.last_resource_version = checkpoint;

        if relisting {
            counter!("reflector_relists_total", 1, "kind" => self.kind.to_string());
            info!(kind = %self.kind, ns = %self.namespace, count, rv = %self.state.last_resource_version, "relisted");
        } else {
            info!(kind = %self.kind, ns = %self.namespace, count, rv = %self.state.last_resource_version, "listed");
        }
        if self.phase != Phase::Stopped {
            self.phase = Phase::Watching;
        }
        Ok(())
    }

    /// WATCHING: fold one watch item into the cache and forward it.
    pub async fn apply_source_event(&mut self, event: SourceEvent) {
        let event = match event {
            SourceEvent::Bookmark(rv) => {
                self.state.advance(&rv);
                return;
            }
            SourceEvent::Change(event) => event,
        };
        let key = match event.key() {
            Ok(key) => key,
            Err(e) => {
                warn!(kind = %self.kind, error = %e, "dropping watch event");
                self.state.advance(&event.resource_version);
                return;
            }
        };
        if let Some(cached) = self.state.cache.get(&key) {
            if compare_resource_versions(&event.resource_version, cached.resource_version()) == Some(Ordering::Less) {
                debug!(kind = %self.kind, key = %key, rv = %event.resource_version, "dropping stale watch event");
                return;
            }
        }
        self.state.advance(&event.resource_version);
        match event.kind {
            EventKind::Deleted => {
                self.state.cache.remove(&key);
            }
            EventKind::Added | EventKind::Modified => {
                self.state.cache.insert(key, event.object.clone());
            }
        }
        self.emit(event).await;
    }

    /// Periodic resync: re-deliver every cached object as Modified.
    pub async fn resync(&mut self) {
        let mut objects: Vec<(ObjectKey, ResourceObject)> =
            self.state.cache.iter().map(|(k, o)| (k.clone(), o.clone())).collect();
        objects.sort_by(|a, b| a.0.cmp(&b.0));
        debug!(kind = %self.kind, count = objects.len(), "resync");
        counter!("reflector_resyncs_total", 1, "kind" => self.kind.to_string());
        for (_, object) in objects {
            self.emit(WatchEvent::modified(object)).await;
        }
    }

    /// Drive the state machine until the stop signal fires or the router goes away.
    ///
    /// One backoff covers failed lists, failed watch opens, watches that break
    /// before delivering anything and watches that end right after opening. It
    /// resets only once a watch proves healthy, so a source that lists fine but
    /// cannot be watched never turns into a relist loop.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(kind = %self.kind, ns = %self.namespace, resync = ?self.resync_interval, "reflector started");
        let mut backoff = self.backoff_min;
        let mut resync = interval_at(Instant::now() + self.resync_interval, self.resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        if self.phase == Phase::Init {
            self.phase = Phase::Listing;
        }

        while self.phase != Phase::Stopped {
            if *shutdown.borrow() {
                self.phase = Phase::Stopped;
                break;
            }
            match self.phase {
                Phase::Init | Phase::Stopped => break,
                Phase::Listing | Phase::Relisting => {
                    let listed = tokio::select! {
                        _ = shutdown.changed() => None,
                        res = self.list_pass() => Some(res),
                    };
                    match listed {
                        None => self.phase = Phase::Stopped,
                        Some(Ok(())) => {}
                        Some(Err(e)) => {
                            warn!(kind = %self.kind, error = %e, retry_in = ?backoff, "list failed");
                            if pause(&mut shutdown, &mut backoff, self.backoff_max).await {
                                self.phase = Phase::Stopped;
                            }
                        }
                    }
                }
                Phase::Watching => {
                    let from = self.state.last_resource_version.clone();
                    let opened = tokio::select! {
                        _ = shutdown.changed() => None,
                        res = self.source.watch(&self.kind, &self.namespace, self.selector.as_deref(), &from) => Some(res),
                    };
                    let mut stream = match opened {
                        None => {
                            self.phase = Phase::Stopped;
                            break;
                        }
                        Some(Err(e)) => {
                            warn!(kind = %self.kind, error = %e, retry_in = ?backoff, "watch failed; relisting");
                            self.phase = if pause(&mut shutdown, &mut backoff, self.backoff_max).await {
                                Phase::Stopped
                            } else {
                                Phase::Relisting
                            };
                            continue;
                        }
                        Some(Ok(stream)) => stream,
                    };
                    debug!(kind = %self.kind, rv = %from, "watching");
                    let opened_at = Instant::now();
                    let mut delivered = false;
                    // Pushed forward only by stream items; resync ticks do not count as activity.
                    let idle = sleep(self.idle_timeout);
                    tokio::pin!(idle);

                    while self.phase == Phase::Watching {
                        let step = tokio::select! {
                            _ = shutdown.changed() => Step::Stop,
                            _ = resync.tick() => Step::Resync,
                            _ = &mut idle => Step::Broken(format!("no watch activity for {:?}", self.idle_timeout)),
                            next = stream.next() => match next {
                                Some(Ok(event)) => Step::Event(event),
                                Some(Err(e)) => Step::Broken(e.to_string()),
                                None => Step::Ended,
                            },
                        };
                        match step {
                            Step::Stop => self.phase = Phase::Stopped,
                            Step::Resync => self.resync().await,
                            Step::Event(event) => {
                                if !delivered {
                                    delivered = true;
                                    backoff = self.backoff_min;
                                }
                                idle.as_mut().reset(Instant::now() + self.idle_timeout);
                                self.apply_source_event(event).await;
                            }
                            Step::Broken(reason) => {
                                warn!(kind = %self.kind, error = %reason, "watch stream broken; relisting");
                                self.phase = Phase::Relisting;
                                if !delivered && pause(&mut shutdown, &mut backoff, self.backoff_max).await {
                                    self.phase = Phase::Stopped;
                                }
                            }
                            Step::Ended => {
                                if delivered || opened_at.elapsed() >= WATCH_MIN_LIFETIME {
                                    backoff = self.backoff_min;
                                    debug!(kind = %self.kind, rv = %self.state.last_resource_version, "watch ended; reopening");
                                } else {
                                    debug!(kind = %self.kind, retry_in = ?backoff, "watch ended right after opening");
                                    if pause(&mut shutdown, &mut backoff, self.backoff_max).await {
                                        self.phase = Phase::Stopped;
                                    }
                                }
                                break;
                            }
                        }
                    }
                }
            }
        }
        info!(kind = %self.kind, "reflector stopped");
    }
}

/// Sleep for `backoff` (doubling it for next time) unless the stop signal
/// fires first. Returns true on stop.
async fn pause(shutdown: &mut watch::Receiver<bool>, backoff: &mut Duration, max: Duration) -> bool {
    let stop = tokio::select! {
        _ = shutdown.changed() => true,
        _ = sleep(*backoff) => false,
    };
    *backoff = (*backoff * 2).min(max);
    stop
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Mutex;

    use mirra_core::testing::{deployment, deployments, MemoryCluster};
    use tokio::time::timeout;

    fn setup() -> (Arc<MemoryCluster>, Reflector, mpsc::Receiver<WatchEvent>) {
        let cluster = Arc::new(MemoryCluster::with_namespaces(&["from", "to"]));
        let (tx, rx) = mpsc::channel(64);
        let cfg = MirrorConfig::new("from", "to");
        let r = Reflector::new(deployments(), cluster.clone(), &cfg, tx);
        (cluster, r, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<WatchEvent>) -> Vec<(EventKind, String)> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push((ev.kind, ev.object.name().to_string()));
        }
        out
    }

    #[tokio::test]
    async fn initial_list_emits_added_and_moves_to_watching() {
        let (cluster, mut r, mut rx) = setup();
        cluster.put(&deployments(), deployment("from", "web", 2));
        cluster.put(&deployments(), deployment("from", "api", 1));
        cluster.put(&deployments(), deployment("other", "ignored", 1));
        assert_eq!(r.phase(), Phase::Init);

        r.list_pass().await.unwrap();
        assert_eq!(r.phase(), Phase::Watching);
        assert_eq!(r.state().cache.len(), 2);
        assert_eq!(r.state().last_resource_version, "3");
        let evs = drain(&mut rx);
        assert_eq!(evs, [(EventKind::Added, "api".to_string()), (EventKind::Added, "web".to_string())]);
    }

    #[tokio::test]
    async fn relist_synthesizes_deleted_for_vanished_keys() {
        let (cluster, mut r, mut rx) = setup();
        let k = deployments();
        cluster.put(&k, deployment("from", "web", 2));
        cluster.put(&k, deployment("from", "old", 1));
        r.list_pass().await.unwrap();
        drain(&mut rx);

        cluster.remove(&k, "from", "old");
        r.phase = Phase::Relisting;
        r.list_pass().await.unwrap();
        let evs = drain(&mut rx);
        assert_eq!(evs, [(EventKind::Deleted, "old".to_string()), (EventKind::Added, "web".to_string())]);
        assert!(!r.state().cache.contains_key(&ObjectKey::new("from", "old")));
    }

    #[tokio::test]
    async fn watch_events_update_cache_and_checkpoint() {
        let (cluster, mut r, mut rx) = setup();
        let k = deployments();
        cluster.put(&k, deployment("from", "web", 2));
        r.list_pass().await.unwrap();
        drain(&mut rx);

        let updated = cluster.put(&k, deployment("from", "web", 5));
        r.apply_source_event(SourceEvent::Change(WatchEvent::modified(updated))).await;
        let cached = &r.state().cache[&ObjectKey::new("from", "web")];
        assert_eq!(cached.fields()["spec"]["replicas"], 5);
        assert_eq!(r.state().last_resource_version, "2");

        r.apply_source_event(SourceEvent::Bookmark("9".into())).await;
        assert_eq!(r.state().last_resource_version, "9");
        r.apply_source_event(SourceEvent::Bookmark("4".into())).await;
        assert_eq!(r.state().last_resource_version, "9", "checkpoint never moves backwards");

        let mut gone = deployment("from", "web", 5);
        gone.set_resource_version("10");
        r.apply_source_event(SourceEvent::Change(WatchEvent::deleted(gone))).await;
        assert!(r.state().cache.is_empty());
        assert_eq!(drain(&mut rx), [(EventKind::Modified, "web".to_string()), (EventKind::Deleted, "web".to_string())]);
    }

    #[tokio::test]
    async fn stale_watch_event_for_key_is_dropped() {
        let (cluster, mut r, mut rx) = setup();
        let k = deployments();
        let first = cluster.put(&k, deployment("from", "web", 1));
        cluster.put(&k, deployment("from", "web", 2));
        r.list_pass().await.unwrap();
        drain(&mut rx);

        r.apply_source_event(SourceEvent::Change(WatchEvent::modified(first))).await;
        assert!(drain(&mut rx).is_empty());
        assert_eq!(r.state().cache[&ObjectKey::new("from", "web")].fields()["spec"]["replicas"], 2);
    }

    #[tokio::test]
    async fn resync_re_emits_every_cached_object_as_modified() {
        let (cluster, mut r, mut rx) = setup();
        let k = deployments();
        cluster.put(&k, deployment("from", "b", 1));
        cluster.put(&k, deployment("from", "a", 1));
        r.list_pass().await.unwrap();
        drain(&mut rx);

        r.resync().await;
        assert_eq!(drain(&mut rx), [(EventKind::Modified, "a".to_string()), (EventKind::Modified, "b".to_string())]);
    }

    #[tokio::test]
    async fn dropped_receiver_stops_the_reflector() {
        let (cluster, mut r, rx) = setup();
        cluster.put(&deployments(), deployment("from", "web", 1));
        drop(rx);
        r.list_pass().await.unwrap();
        assert_eq!(r.phase(), Phase::Stopped);
    }

    #[tokio::test]
    async fn run_relists_after_broken_watch_and_stops_on_signal() {
        let (cluster, r, mut rx) = setup();
        let k = deployments();
        cluster.put(&k, deployment("from", "web", 2));
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(r.run(stop_rx));

        let first = rx.recv().await.unwrap();
        assert_eq!((first.kind, first.object.name()), (EventKind::Added, "web"));
        while cluster.active_watches() == 0 {
            sleep(Duration::from_millis(5)).await;
        }

        cluster.put(&k, deployment("from", "api", 1));
        let ev = rx.recv().await.unwrap();
        assert_eq!((ev.kind, ev.object.name()), (EventKind::Added, "api"));

        cluster.break_watches();
        let mut relisted = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        relisted.sort_by(|a, b| a.object.name().cmp(b.object.name()));
        assert!(relisted.iter().all(|e| e.kind == EventKind::Added));
        assert_eq!(relisted[0].object.name(), "api");
        assert_eq!(relisted[1].object.name(), "web");

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn run_retries_failed_lists() {
        let (cluster, r, mut rx) = setup();
        cluster.put(&deployments(), deployment("from", "web", 2));
        cluster.fail_lists(2);
        let r = r.with_backoff(Duration::from_millis(5), Duration::from_millis(20));
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(r.run(stop_rx));

        let ev = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!((ev.kind, ev.object.name()), (EventKind::Added, "web"));
        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[derive(Clone, Copy)]
    enum WatchMode {
        Delegate,
        Fail,
        Empty,
        Silent,
    }

    /// Lists from the cluster; watches per `mode`. Counts lists and records
    /// every watch checkpoint.
    struct Scripted {
        cluster: Arc<MemoryCluster>,
        mode: WatchMode,
        lists: AtomicUsize,
        froms: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(cluster: Arc<MemoryCluster>, mode: WatchMode) -> Arc<Self> {
            Arc::new(Self { cluster, mode, lists: AtomicUsize::new(0), froms: Mutex::new(Vec::new()) })
        }

        fn lists(&self) -> usize { self.lists.load(AtomicOrdering::SeqCst) }
        fn froms(&self) -> Vec<String> { self.froms.lock().unwrap().clone() }
    }

    #[async_trait::async_trait]
    impl SourceApi for Scripted {
        async fn list(&self, kind: &ResourceKind, namespace: &str, selector: Option<&str>) -> MirrorResult<ObjectList> {
            self.lists.fetch_add(1, AtomicOrdering::SeqCst);
            self.cluster.list(kind, namespace, selector).await
        }

        async fn watch(
            &self,
            kind: &ResourceKind,
            namespace: &str,
            selector: Option<&str>,
            from: &str,
        ) -> MirrorResult<mirra_core::SourceStream> {
            self.froms.lock().unwrap().push(from.to_string());
            match self.mode {
                WatchMode::Delegate => self.cluster.watch(kind, namespace, selector, from).await,
                WatchMode::Fail => Err(MirrorError::Stream("watch is forbidden".into())),
                WatchMode::Empty => Ok(futures::stream::empty().boxed()),
                WatchMode::Silent => Ok(futures::stream::pending().boxed()),
            }
        }
    }

    fn scripted(mode: WatchMode, cfg: &MirrorConfig) -> (Arc<MemoryCluster>, Arc<Scripted>, Reflector, mpsc::Receiver<WatchEvent>) {
        let cluster = Arc::new(MemoryCluster::with_namespaces(&["from", "to"]));
        cluster.put(&deployments(), deployment("from", "web", 1));
        let source = Scripted::new(cluster.clone(), mode);
        let (tx, rx) = mpsc::channel(256);
        let r = Reflector::new(deployments(), source.clone(), cfg, tx);
        (cluster, source, r, rx)
    }

    async fn eventually(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn failing_watch_opens_back_off_between_relists() {
        let (_cluster, source, r, mut rx) = scripted(WatchMode::Fail, &MirrorConfig::new("from", "to"));
        let r = r.with_backoff(Duration::from_millis(50), Duration::from_millis(200));
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(r.run(stop_rx));

        sleep(Duration::from_millis(300)).await;
        stop_tx.send(true).unwrap();
        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();

        let lists = source.lists();
        assert!((2..=4).contains(&lists), "lists = {}", lists);
        assert_eq!(drain(&mut rx).len(), lists, "one Added per list pass");
    }

    #[tokio::test]
    async fn watches_ending_immediately_do_not_spin() {
        let (_cluster, source, r, _rx) = scripted(WatchMode::Empty, &MirrorConfig::new("from", "to"));
        let r = r.with_backoff(Duration::from_millis(10), Duration::from_millis(40));
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(r.run(stop_rx));

        sleep(Duration::from_millis(300)).await;
        stop_tx.send(true).unwrap();
        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();

        assert_eq!(source.lists(), 1, "a clean end never relists");
        let froms = source.froms();
        assert!((2..=20).contains(&froms.len()), "watch opened {} times", froms.len());
        assert!(froms.iter().all(|rv| rv == "1"));
    }

    #[tokio::test]
    async fn stalled_watch_relists_even_when_resync_is_faster() {
        let mut cfg = MirrorConfig::new("from", "to");
        cfg.watch_idle_timeout = Duration::from_millis(100);
        cfg.resync_interval = Duration::from_millis(30);
        let (_cluster, source, r, _rx) = scripted(WatchMode::Silent, &cfg);
        let r = r.with_backoff(Duration::from_millis(5), Duration::from_millis(20));
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(r.run(stop_rx));

        sleep(Duration::from_millis(600)).await;
        stop_tx.send(true).unwrap();
        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();

        assert!(source.lists() >= 3, "lists = {}", source.lists());
    }

    #[tokio::test]
    async fn clean_watch_end_resumes_from_checkpoint_without_relist() {
        let (cluster, source, r, mut rx) = scripted(WatchMode::Delegate, &MirrorConfig::new("from", "to"));
        let r = r.with_backoff(Duration::from_millis(5), Duration::from_millis(20));
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(r.run(stop_rx));

        assert_eq!(rx.recv().await.unwrap().object.name(), "web");
        eventually(|| cluster.active_watches() > 0).await;
        cluster.end_watches();
        eventually(|| source.froms().len() >= 2).await;

        cluster.put(&deployments(), deployment("from", "api", 1));
        let ev = rx.recv().await.unwrap();
        assert_eq!((ev.kind, ev.object.name()), (EventKind::Added, "api"));
        assert_eq!(source.lists(), 1);
        assert_eq!(source.froms(), ["1", "1"]);

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn bookmark_on_live_watch_moves_resume_point() {
        let (cluster, source, r, mut rx) = scripted(WatchMode::Delegate, &MirrorConfig::new("from", "to"));
        let r = r.with_backoff(Duration::from_millis(5), Duration::from_millis(20));
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(r.run(stop_rx));

        rx.recv().await.unwrap();
        eventually(|| cluster.active_watches() > 0).await;
        // Unrelated change elsewhere advances the cluster version to 2.
        cluster.put(&deployments(), deployment("other", "x", 1));
        cluster.bookmark();
        cluster.end_watches();
        eventually(|| source.froms().len() >= 2).await;

        assert_eq!(source.froms(), ["1", "2"]);
        assert_eq!(source.lists(), 1);
        assert!(drain(&mut rx).is_empty(), "bookmarks carry no objects");

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
