//! Mirra core: data model, errors, configuration and the boundary traits the
//! mirror engine talks to.
//!
//! Kube-backed implementations of the traits live in `mirra-kubehub`; an
//! in-memory control plane for tests lives in [`testing`] (feature `testing`).

#![forbid(unsafe_code)]

use futures::stream::BoxStream;

pub mod config;
pub mod error;
pub mod model;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{KindSelection, MirrorConfig, ModifyStrategy};
pub use error::{MirrorError, MirrorResult, WriteError};
pub use model::{
    compare_resource_versions, EventKind, ObjectKey, ObjectList, Outcome, ResourceKind, ResourceObject, ResourceRef,
    SourceEvent, WatchEvent,
};

pub mod prelude {
    pub use super::{
        ControlPlane, DestinationApi, EventKind, Handler, MirrorConfig, MirrorError, MirrorResult, ObjectKey,
        ObjectList, Outcome, ResourceKind, ResourceObject, SourceApi, SourceEvent, WatchEvent, WriteError,
    };
}

/// Stream returned by [`SourceApi::watch`]. An `Err` item or the end of the
/// stream means the watch is over.
pub type SourceStream = BoxStream<'static, MirrorResult<SourceEvent>>;

/// Cluster-level queries needed before mirroring starts.
#[async_trait::async_trait]
pub trait ControlPlane: Send + Sync {
    /// Every kind the control plane serves, sub-resources included.
    async fn list_resource_kinds(&self) -> MirrorResult<Vec<ResourceKind>>;

    async fn namespace_exists(&self, namespace: &str) -> MirrorResult<bool>;
}

/// Read side: list-then-watch against the source namespace.
#[async_trait::async_trait]
pub trait SourceApi: Send + Sync {
    async fn list(&self, kind: &ResourceKind, namespace: &str, selector: Option<&str>) -> MirrorResult<ObjectList>;

    /// Watch changes strictly after `from`.
    async fn watch(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        selector: Option<&str>,
        from: &str,
    ) -> MirrorResult<SourceStream>;
}

/// Write side: blind writes into the destination namespace.
#[async_trait::async_trait]
pub trait DestinationApi: Send + Sync {
    async fn create(&self, kind: &ResourceKind, namespace: &str, object: &ResourceObject) -> Result<(), WriteError>;

    /// Unconditional replace (no resourceVersion precondition).
    async fn update(&self, kind: &ResourceKind, namespace: &str, object: &ResourceObject) -> Result<(), WriteError>;

    async fn delete(&self, kind: &ResourceKind, namespace: &str, name: &str) -> Result<(), WriteError>;
}

/// Per-kind event handler driven by the event router.
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    async fn on_added(&self, object: ResourceObject) -> MirrorResult<Outcome>;
    async fn on_modified(&self, object: ResourceObject) -> MirrorResult<Outcome>;
    async fn on_deleted(&self, object: ResourceObject) -> MirrorResult<Outcome>;

    async fn handle(&self, event: WatchEvent) -> MirrorResult<Outcome> {
        match event.kind {
            EventKind::Added => self.on_added(event.object).await,
            EventKind::Modified => self.on_modified(event.object).await,
            EventKind::Deleted => self.on_deleted(event.object).await,
        }
    }
}
