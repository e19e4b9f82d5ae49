//! In-memory control plane implementing [`ControlPlane`], [`SourceApi`] and
//! [`DestinationApi`], with failure injection for tests.
//!
//! Every stored object gets a cluster-wide increasing resourceVersion and a
//! uid, like a real API server. Watches replay the change log after their
//! checkpoint and then follow live changes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use serde_json::Value as Json;

use crate::error::{MirrorError, MirrorResult, WriteError};
use crate::model::{EventKind, ObjectList, ResourceKind, ResourceObject, SourceEvent, WatchEvent};
use crate::{ControlPlane, DestinationApi, SourceApi, SourceStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Create,
    Update,
    Delete,
}

/// One destination write as seen by the cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub op: WriteOp,
    pub resource: String,
    pub namespace: String,
    pub name: String,
    pub result: Result<(), WriteError>,
}

type Slot = (String, String, String);

struct LogEntry {
    rv: u64,
    resource: String,
    namespace: String,
    event: WatchEvent,
}

struct WatchSub {
    resource: String,
    namespace: String,
    selector: Option<String>,
    tx: UnboundedSender<MirrorResult<SourceEvent>>,
}

struct Injected {
    op: WriteOp,
    remaining: usize,
    error: WriteError,
}

#[derive(Default)]
struct Inner {
    kinds: Vec<ResourceKind>,
    namespaces: BTreeSet<String>,
    objects: BTreeMap<Slot, ResourceObject>,
    rv: u64,
    next_uid: u64,
    log: Vec<LogEntry>,
    /// Watches starting before this resourceVersion are rejected as expired.
    compacted: u64,
    watchers: Vec<WatchSub>,
    injected: Vec<Injected>,
    writes: Vec<WriteRecord>,
    discovery_down: bool,
    list_failures: usize,
}

#[derive(Default)]
pub struct MemoryCluster {
    inner: Mutex<Inner>,
}

impl MemoryCluster {
    pub fn new() -> Self { Self::default() }

    pub fn with_namespaces(namespaces: &[&str]) -> Self {
        let me = Self::new();
        for ns in namespaces {
            me.add_namespace(ns);
        }
        me
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_namespace(&self, namespace: &str) {
        self.lock().namespaces.insert(namespace.to_string());
    }

    pub fn register_kind(&self, kind: ResourceKind) {
        self.lock().kinds.push(kind);
    }

    pub fn set_discovery_down(&self, down: bool) {
        self.lock().discovery_down = down;
    }

    /// Make the next `n` list calls fail.
    pub fn fail_lists(&self, n: usize) {
        self.lock().list_failures = n;
    }

    /// Make the next `n` destination writes of `op` fail with `error`.
    pub fn fail_writes(&self, op: WriteOp, n: usize, error: WriteError) {
        self.lock().injected.push(Injected { op, remaining: n, error });
    }

    /// Create or replace an object, as a client of the source namespace would.
    pub fn put(&self, kind: &ResourceKind, object: ResourceObject) -> ResourceObject {
        let mut inner = self.lock();
        let ns = object.namespace().to_string();
        inner.store(kind, &ns, object)
    }

    /// Delete an object; returns false when it did not exist.
    pub fn remove(&self, kind: &ResourceKind, namespace: &str, name: &str) -> bool {
        self.lock().erase(kind, namespace, name).is_some()
    }

    pub fn get(&self, kind: &ResourceKind, namespace: &str, name: &str) -> Option<ResourceObject> {
        self.lock().objects.get(&slot(kind, namespace, name)).cloned()
    }

    pub fn names(&self, kind: &ResourceKind, namespace: &str) -> Vec<String> {
        let resource = kind.to_string();
        self.lock()
            .objects
            .keys()
            .filter(|(r, ns, _)| *r == resource && ns == namespace)
            .map(|(_, _, name)| name.clone())
            .collect()
    }

    pub fn writes(&self) -> Vec<WriteRecord> { self.lock().writes.clone() }

    pub fn clear_writes(&self) { self.lock().writes.clear(); }

    pub fn active_watches(&self) -> usize {
        let mut inner = self.lock();
        inner.watchers.retain(|w| !w.tx.is_closed());
        inner.watchers.len()
    }

    /// Fail every open watch with a stream error (connection loss).
    pub fn break_watches(&self) {
        let mut inner = self.lock();
        for w in inner.watchers.drain(..) {
            let _ = w.tx.unbounded_send(Err(MirrorError::Stream("connection reset by peer".into())));
        }
    }

    /// End every open watch cleanly (server-side watch timeout).
    pub fn end_watches(&self) { self.lock().watchers.clear(); }

    /// Forget the change log; watches from older checkpoints now fail.
    pub fn compact(&self) {
        let mut inner = self.lock();
        inner.compacted = inner.rv;
        inner.log.clear();
    }

    /// Send a bookmark at the current resourceVersion to every open watch.
    pub fn bookmark(&self) {
        let inner = self.lock();
        let rv = inner.rv.to_string();
        for w in &inner.watchers {
            let _ = w.tx.unbounded_send(Ok(SourceEvent::Bookmark(rv.clone())));
        }
    }

    fn take_injected(&self, op: WriteOp) -> Option<WriteError> {
        let mut inner = self.lock();
        let hit = inner.injected.iter_mut().find(|i| i.op == op && i.remaining > 0)?;
        hit.remaining -= 1;
        Some(hit.error.clone())
    }

    fn record(&self, op: WriteOp, kind: &ResourceKind, namespace: &str, name: &str, result: Result<(), WriteError>) -> Result<(), WriteError> {
        self.lock().writes.push(WriteRecord {
            op,
            resource: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            result: result.clone(),
        });
        result
    }
}

fn slot(kind: &ResourceKind, namespace: &str, name: &str) -> Slot {
    (kind.to_string(), namespace.to_string(), name.to_string())
}

/// Equality-only selector: `k=v,k2=v2`.
fn selector_matches(object: &ResourceObject, selector: Option<&str>) -> bool {
    let Some(selector) = selector.filter(|s| !s.trim().is_empty()) else { return true };
    let labels = object.labels();
    selector.split(',').all(|term| match term.split_once('=') {
        Some((k, v)) => labels.and_then(|l| l.get(k.trim())).and_then(Json::as_str) == Some(v.trim()),
        None => false,
    })
}

impl Inner {
    fn bump(&mut self) -> u64 {
        self.rv += 1;
        self.rv
    }

    fn store(&mut self, kind: &ResourceKind, namespace: &str, mut object: ResourceObject) -> ResourceObject {
        let key = slot(kind, namespace, object.name());
        let rv = self.bump();
        let previous = self.objects.get(&key).map(|o| o.uid().to_string());
        let uid = match previous.clone() {
            Some(uid) => uid,
            None => {
                self.next_uid += 1;
                format!("00000000-0000-0000-0000-{:012}", self.next_uid)
            }
        };
        object.ensure_types(kind);
        object.set_namespace(namespace);
        object.set_resource_version(&rv.to_string());
        object.metadata_mut().insert("uid".into(), Json::String(uid));
        self.objects.insert(key, object.clone());
        let event_kind = if previous.is_some() { EventKind::Modified } else { EventKind::Added };
        self.publish(kind, namespace, rv, WatchEvent::new(event_kind, object.clone()));
        object
    }

    fn erase(&mut self, kind: &ResourceKind, namespace: &str, name: &str) -> Option<ResourceObject> {
        let mut object = self.objects.remove(&slot(kind, namespace, name))?;
        let rv = self.bump();
        object.set_resource_version(&rv.to_string());
        self.publish(kind, namespace, rv, WatchEvent::deleted(object.clone()));
        Some(object)
    }

    fn publish(&mut self, kind: &ResourceKind, namespace: &str, rv: u64, event: WatchEvent) {
        let resource = kind.to_string();
        self.watchers.retain(|w| {
            if w.resource != resource || w.namespace != namespace || !selector_matches(&event.object, w.selector.as_deref()) {
                return !w.tx.is_closed();
            }
            w.tx.unbounded_send(Ok(SourceEvent::Change(event.clone()))).is_ok()
        });
        self.log.push(LogEntry { rv, resource, namespace: namespace.to_string(), event });
    }
}

#[async_trait::async_trait]
impl ControlPlane for MemoryCluster {
    async fn list_resource_kinds(&self) -> MirrorResult<Vec<ResourceKind>> {
        let inner = self.lock();
        if inner.discovery_down {
            return Err(MirrorError::Discovery("discovery endpoint unreachable".into()));
        }
        Ok(inner.kinds.clone())
    }

    async fn namespace_exists(&self, namespace: &str) -> MirrorResult<bool> {
        Ok(self.lock().namespaces.contains(namespace))
    }
}

#[async_trait::async_trait]
impl SourceApi for MemoryCluster {
    async fn list(&self, kind: &ResourceKind, namespace: &str, selector: Option<&str>) -> MirrorResult<ObjectList> {
        let mut inner = self.lock();
        if inner.list_failures > 0 {
            inner.list_failures -= 1;
            return Err(MirrorError::Stream("list failed: service unavailable".into()));
        }
        let resource = kind.to_string();
        let items = inner
            .objects
            .iter()
            .filter(|((r, ns, _), o)| *r == resource && ns == namespace && selector_matches(o, selector))
            .map(|(_, o)| o.clone())
            .collect();
        Ok(ObjectList { items, resource_version: inner.rv.to_string() })
    }

    async fn watch(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        selector: Option<&str>,
        from: &str,
    ) -> MirrorResult<SourceStream> {
        let mut inner = self.lock();
        let from: u64 = from.parse().map_err(|_| MirrorError::Stream(format!("invalid resourceVersion {:?}", from)))?;
        if from < inner.compacted {
            return Err(MirrorError::Stream(format!("too old resource version: {} (410 Gone)", from)));
        }
        let resource = kind.to_string();
        let (tx, rx) = unbounded();
        for entry in inner.log.iter().filter(|e| e.rv > from && e.resource == resource && e.namespace == namespace) {
            if selector_matches(&entry.event.object, selector) {
                let _ = tx.unbounded_send(Ok(SourceEvent::Change(entry.event.clone())));
            }
        }
        inner.watchers.push(WatchSub {
            resource,
            namespace: namespace.to_string(),
            selector: selector.map(str::to_string),
            tx,
        });
        Ok(rx.boxed())
    }
}

#[async_trait::async_trait]
impl DestinationApi for MemoryCluster {
    async fn create(&self, kind: &ResourceKind, namespace: &str, object: &ResourceObject) -> Result<(), WriteError> {
        let result = match self.take_injected(WriteOp::Create) {
            Some(e) => Err(e),
            None => {
                let mut inner = self.lock();
                if inner.objects.contains_key(&slot(kind, namespace, object.name())) {
                    Err(WriteError::AlreadyExists)
                } else {
                    inner.store(kind, namespace, object.clone());
                    Ok(())
                }
            }
        };
        self.record(WriteOp::Create, kind, namespace, object.name(), result)
    }

    async fn update(&self, kind: &ResourceKind, namespace: &str, object: &ResourceObject) -> Result<(), WriteError> {
        let result = match self.take_injected(WriteOp::Update) {
            Some(e) => Err(e),
            None => {
                let mut inner = self.lock();
                if inner.objects.contains_key(&slot(kind, namespace, object.name())) {
                    inner.store(kind, namespace, object.clone());
                    Ok(())
                } else {
                    Err(WriteError::NotFound)
                }
            }
        };
        self.record(WriteOp::Update, kind, namespace, object.name(), result)
    }

    async fn delete(&self, kind: &ResourceKind, namespace: &str, name: &str) -> Result<(), WriteError> {
        let result = match self.take_injected(WriteOp::Delete) {
            Some(e) => Err(e),
            None => match self.lock().erase(kind, namespace, name) {
                Some(_) => Ok(()),
                None => Err(WriteError::NotFound),
            },
        };
        self.record(WriteOp::Delete, kind, namespace, name, result)
    }
}

/// A namespaced, watchable kind for tests.
pub fn namespaced_kind(group: &str, version: &str, resource: &str, kind: &str) -> ResourceKind {
    ResourceKind {
        group: group.to_string(),
        version: version.to_string(),
        resource: resource.to_string(),
        kind: kind.to_string(),
        namespaced: true,
        verbs: ["create", "delete", "get", "list", "update", "watch"].iter().map(|v| v.to_string()).collect(),
    }
}

pub fn deployments() -> ResourceKind { namespaced_kind("apps", "v1", "deployments", "Deployment") }

pub fn configmaps() -> ResourceKind { namespaced_kind("", "v1", "configmaps", "ConfigMap") }

/// Deployment with `spec.replicas` set.
pub fn deployment(namespace: &str, name: &str, replicas: i64) -> ResourceObject {
    ResourceObject::new("apps/v1", "Deployment", namespace, name)
        .with_field("spec", serde_json::json!({ "replicas": replicas }))
}
