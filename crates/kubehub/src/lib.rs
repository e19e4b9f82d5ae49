//! Mirra kubehub – discovery, list/watch and destination writes on kube-rs.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use futures::StreamExt;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams, WatchEvent as KubeWatchEvent, WatchParams},
    core::{ApiResource, DynamicObject, ErrorResponse},
    discovery::{ApiCapabilities, Discovery, Scope},
    Client,
};
use k8s_openapi::api::core::v1::Namespace;
use mirra_core::prelude::*;
use mirra_core::SourceStream;
use tracing::{debug, info};

pub mod resolve;

pub use resolve::{ensure_namespaces, resolve_kinds, select_kinds};

/// Server-side watch timeout; kube rejects anything at or above 295s.
const WATCH_TIMEOUT_SECS: u32 = 290;

pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client (in-cluster or kubeconfig)")
}

/// Control plane, source and destination backed by one kube client.
/// The client is cheap to clone and safe to share across kinds.
#[derive(Clone)]
pub struct KubeHub {
    client: Client,
}

impl KubeHub {
    pub fn new(client: Client) -> Self { Self { client } }

    pub async fn try_default() -> Result<Self> { Ok(Self::new(get_kube_client().await?)) }

    fn api(&self, kind: &ResourceKind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &api_resource(kind))
    }
}

pub fn api_resource(kind: &ResourceKind) -> ApiResource {
    ApiResource {
        group: kind.group.clone(),
        version: kind.version.clone(),
        api_version: kind.api_version(),
        kind: kind.kind.clone(),
        plural: kind.resource.clone(),
    }
}

fn to_kind(ar: &ApiResource, caps: &ApiCapabilities) -> ResourceKind {
    ResourceKind {
        group: ar.group.clone(),
        version: ar.version.clone(),
        resource: ar.plural.clone(),
        kind: ar.kind.clone(),
        namespaced: matches!(caps.scope, Scope::Namespaced),
        verbs: caps.operations.iter().cloned().collect(),
    }
}

/// Map kube API errors onto the write outcomes the reconciler understands.
pub fn classify(err: kube::Error) -> WriteError {
    match &err {
        kube::Error::Api(ErrorResponse { code: 409, reason, .. }) if reason == "AlreadyExists" => WriteError::AlreadyExists,
        kube::Error::Api(ErrorResponse { code: 404, .. }) => WriteError::NotFound,
        kube::Error::Api(ErrorResponse { code: 410, .. }) => WriteError::Gone,
        _ => WriteError::Other(err.to_string()),
    }
}

fn from_dynamic(obj: DynamicObject, kind: &ResourceKind) -> MirrorResult<ResourceObject> {
    let raw = serde_json::to_value(&obj).map_err(|e| MirrorError::Transform(format!("serializing DynamicObject: {}", e)))?;
    let mut out = ResourceObject::from_value(raw)?;
    out.ensure_types(kind);
    Ok(out)
}

fn to_dynamic(object: &ResourceObject) -> Result<DynamicObject, WriteError> {
    serde_json::from_value(object.clone().into_value()).map_err(|e| WriteError::Other(format!("encoding object: {}", e)))
}

fn to_source_event(item: kube::Result<KubeWatchEvent<DynamicObject>>, kind: &ResourceKind) -> MirrorResult<SourceEvent> {
    let change = |event_kind, obj| from_dynamic(obj, kind).map(|o| SourceEvent::Change(WatchEvent::new(event_kind, o)));
    match item {
        Ok(KubeWatchEvent::Added(o)) => change(EventKind::Added, o),
        Ok(KubeWatchEvent::Modified(o)) => change(EventKind::Modified, o),
        Ok(KubeWatchEvent::Deleted(o)) => change(EventKind::Deleted, o),
        Ok(KubeWatchEvent::Bookmark(b)) => Ok(SourceEvent::Bookmark(b.metadata.resource_version)),
        Ok(KubeWatchEvent::Error(e)) => Err(MirrorError::Stream(format!("watch error {} ({}): {}", e.code, e.reason, e.message))),
        Err(e) => Err(MirrorError::Stream(e.to_string())),
    }
}

#[async_trait::async_trait]
impl ControlPlane for KubeHub {
    async fn list_resource_kinds(&self) -> MirrorResult<Vec<ResourceKind>> {
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| MirrorError::Discovery(e.to_string()))?;
        let mut out = Vec::new();
        for group in discovery.groups() {
            // Preferred version only, so no object is mirrored under two versions.
            for (ar, caps) in group.recommended_resources() {
                let parent = to_kind(&ar, &caps);
                for (sub_ar, sub_caps) in caps.subresources.iter() {
                    let mut sub = to_kind(sub_ar, sub_caps);
                    let leaf = sub_ar.plural.rsplit('/').next().unwrap_or(&sub_ar.plural);
                    sub.resource = format!("{}/{}", parent.resource, leaf);
                    out.push(sub);
                }
                out.push(parent);
            }
        }
        info!(count = out.len(), "discovered resource kinds");
        Ok(out)
    }

    async fn namespace_exists(&self, namespace: &str) -> MirrorResult<bool> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.get_opt(namespace)
            .await
            .map(|ns| ns.is_some())
            .map_err(|e| MirrorError::Precondition(format!("getting namespace {:?}: {}", namespace, e)))
    }
}

#[async_trait::async_trait]
impl SourceApi for KubeHub {
    async fn list(&self, kind: &ResourceKind, namespace: &str, selector: Option<&str>) -> MirrorResult<ObjectList> {
        let mut lp = ListParams::default();
        if let Some(sel) = selector {
            lp = lp.labels(sel);
        }
        let list = self
            .api(kind, namespace)
            .list(&lp)
            .await
            .map_err(|e| MirrorError::Stream(format!("listing {}: {}", kind, e)))?;
        let resource_version = list.metadata.resource_version.clone().unwrap_or_default();
        let items = list
            .items
            .into_iter()
            .map(|o| from_dynamic(o, kind))
            .collect::<MirrorResult<Vec<_>>>()?;
        debug!(kind = %kind, ns = %namespace, count = items.len(), rv = %resource_version, "listed");
        Ok(ObjectList { items, resource_version })
    }

    async fn watch(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        selector: Option<&str>,
        from: &str,
    ) -> MirrorResult<SourceStream> {
        let mut wp = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        if let Some(sel) = selector {
            wp = wp.labels(sel);
        }
        let stream = self
            .api(kind, namespace)
            .watch(&wp, from)
            .await
            .map_err(|e| MirrorError::Stream(format!("watching {} from {}: {}", kind, from, e)))?;
        let kind = kind.clone();
        Ok(stream.map(move |item| to_source_event(item, &kind)).boxed())
    }
}

#[async_trait::async_trait]
impl DestinationApi for KubeHub {
    async fn create(&self, kind: &ResourceKind, namespace: &str, object: &ResourceObject) -> Result<(), WriteError> {
        let obj = to_dynamic(object)?;
        self.api(kind, namespace).create(&PostParams::default(), &obj).await.map(|_| ()).map_err(classify)
    }

    async fn update(&self, kind: &ResourceKind, namespace: &str, object: &ResourceObject) -> Result<(), WriteError> {
        let obj = to_dynamic(object)?;
        self.api(kind, namespace)
            .replace(object.name(), &PostParams::default(), &obj)
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn delete(&self, kind: &ResourceKind, namespace: &str, name: &str) -> Result<(), WriteError> {
        self.api(kind, namespace).delete(name, &DeleteParams::default()).await.map(|_| ()).map_err(classify)
    }
}
