//! Replays source events into the destination namespace.
//!
//! Writes are blind and idempotent: Create falls back to Update on
//! AlreadyExists (and back to Create if the object vanished in between),
//! Delete treats NotFound/Gone as done. Other failures are logged and the
//! event is dropped; the next resync re-delivers it.

use std::sync::Arc;

use metrics::counter;
use mirra_core::prelude::*;
use mirra_core::ModifyStrategy;
use tracing::{debug, info, warn};

use crate::transform::transform;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Create,
    Update,
    Delete,
}

impl Op {
    fn as_str(self) -> &'static str {
        match self {
            Op::Create => "create",
            Op::Update => "update",
            Op::Delete => "delete",
        }
    }
}

fn result_label(res: &Result<(), WriteError>) -> &'static str {
    match res {
        Ok(()) => "ok",
        Err(WriteError::AlreadyExists) => "already_exists",
        Err(WriteError::NotFound) => "not_found",
        Err(WriteError::Gone) => "gone",
        Err(WriteError::Other(_)) => "error",
    }
}

pub struct MirrorReconciler {
    kind: ResourceKind,
    namespace: String,
    dest: Arc<dyn DestinationApi>,
    modify: ModifyStrategy,
}

impl MirrorReconciler {
    pub fn new(kind: ResourceKind, cfg: &MirrorConfig, dest: Arc<dyn DestinationApi>) -> Self {
        Self { kind, namespace: cfg.destination_namespace.clone(), dest, modify: cfg.modify_strategy }
    }

    pub fn destination_namespace(&self) -> &str { &self.namespace }

    async fn write(&self, op: Op, object: &ResourceObject) -> Result<(), WriteError> {
        let name = object.name();
        let key = format!("{}/{}", self.namespace, name);
        let res = match op {
            Op::Create => self.dest.create(&self.kind, &self.namespace, object).await,
            Op::Update => self.dest.update(&self.kind, &self.namespace, object).await,
            Op::Delete => self.dest.delete(&self.kind, &self.namespace, name).await,
        };
        counter!(
            "mirror_writes_total", 1,
            "kind" => self.kind.to_string(), "op" => op.as_str(), "result" => result_label(&res)
        );
        match &res {
            Ok(()) => info!(kind = %self.kind, key = %key, op = op.as_str(), "mirrored"),
            Err(e @ (WriteError::AlreadyExists | WriteError::NotFound | WriteError::Gone)) => {
                info!(kind = %self.kind, key = %key, op = op.as_str(), result = %e, "write missed")
            }
            Err(e) => warn!(kind = %self.kind, key = %key, op = op.as_str(), error = %e, "write failed"),
        }
        res
    }

    async fn create_first(&self, object: &ResourceObject) -> Result<Outcome, WriteError> {
        match self.write(Op::Create, object).await {
            Ok(()) => Ok(Outcome::Created),
            Err(WriteError::AlreadyExists) => match self.write(Op::Update, object).await {
                Ok(()) => Ok(Outcome::Updated),
                // Deleted between our Create and Update.
                Err(WriteError::NotFound) => self.write(Op::Create, object).await.map(|_| Outcome::Created),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    async fn update_first(&self, object: &ResourceObject) -> Result<Outcome, WriteError> {
        match self.write(Op::Update, object).await {
            Ok(()) => Ok(Outcome::Updated),
            Err(WriteError::NotFound) => match self.write(Op::Create, object).await {
                Ok(()) => Ok(Outcome::Created),
                // Created by someone else between our Update and Create.
                Err(WriteError::AlreadyExists) => self.write(Op::Update, object).await.map(|_| Outcome::Updated),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    /// Transform and write an Added/Modified object.
    pub async fn apply(&self, object: &ResourceObject, strategy: ModifyStrategy) -> MirrorResult<Outcome> {
        let mirrored = match transform(object, &self.namespace) {
            Ok(o) => o,
            Err(e) => {
                warn!(kind = %self.kind, name = object.name(), error = %e, "dropping malformed object");
                counter!("mirror_transform_errors_total", 1, "kind" => self.kind.to_string());
                return Err(e);
            }
        };
        let res = match strategy {
            ModifyStrategy::CreateFirst => self.create_first(&mirrored).await,
            ModifyStrategy::UpdateFirst => self.update_first(&mirrored).await,
        };
        res.map_err(MirrorError::from)
    }

    /// Delete by name in the destination; an absent object counts as deleted.
    pub async fn delete(&self, object: &ResourceObject) -> MirrorResult<Outcome> {
        if object.name().is_empty() {
            return Err(MirrorError::Transform("deleted object missing metadata.name".into()));
        }
        match self.write(Op::Delete, object).await {
            Ok(()) => Ok(Outcome::Deleted),
            Err(WriteError::NotFound | WriteError::Gone) => {
                debug!(kind = %self.kind, name = object.name(), "already absent in destination");
                Ok(Outcome::AlreadyAbsent)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait::async_trait]
impl Handler for MirrorReconciler {
    async fn on_added(&self, object: ResourceObject) -> MirrorResult<Outcome> {
        self.apply(&object, ModifyStrategy::CreateFirst).await
    }

    async fn on_modified(&self, object: ResourceObject) -> MirrorResult<Outcome> {
        self.apply(&object, self.modify).await
    }

    async fn on_deleted(&self, object: ResourceObject) -> MirrorResult<Outcome> {
        self.delete(&object).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirra_core::testing::{deployment, deployments, MemoryCluster, WriteOp};

    fn setup(strategy: ModifyStrategy) -> (Arc<MemoryCluster>, MirrorReconciler) {
        let cluster = Arc::new(MemoryCluster::with_namespaces(&["from", "to"]));
        let mut cfg = MirrorConfig::new("from", "to");
        cfg.modify_strategy = strategy;
        let rec = MirrorReconciler::new(deployments(), &cfg, cluster.clone());
        (cluster, rec)
    }

    fn replicas(cluster: &MemoryCluster, name: &str) -> Option<i64> {
        cluster.get(&deployments(), "to", name).and_then(|o| o.fields()["spec"]["replicas"].as_i64())
    }

    #[tokio::test]
    async fn added_creates_sanitized_copy() {
        let (cluster, rec) = setup(ModifyStrategy::CreateFirst);
        let src = cluster.put(&deployments(), deployment("from", "web", 2));
        assert!(!src.uid().is_empty());

        assert_eq!(rec.on_added(src.clone()).await.unwrap(), Outcome::Created);
        let mirrored = cluster.get(&deployments(), "to", "web").unwrap();
        assert_eq!(replicas(&cluster, "web"), Some(2));
        assert_ne!(mirrored.uid(), src.uid(), "destination assigns its own uid");
    }

    #[tokio::test]
    async fn added_twice_is_idempotent() {
        let (cluster, rec) = setup(ModifyStrategy::CreateFirst);
        rec.on_added(deployment("from", "web", 2)).await.unwrap();
        assert_eq!(rec.on_added(deployment("from", "web", 3)).await.unwrap(), Outcome::Updated);
        assert_eq!(cluster.names(&deployments(), "to"), ["web"]);
        assert_eq!(replicas(&cluster, "web"), Some(3));
    }

    #[tokio::test]
    async fn modified_updates_replicas() {
        let (cluster, rec) = setup(ModifyStrategy::CreateFirst);
        rec.on_added(deployment("from", "web", 2)).await.unwrap();
        rec.on_modified(deployment("from", "web", 5)).await.unwrap();
        assert_eq!(replicas(&cluster, "web"), Some(5));
    }

    #[tokio::test]
    async fn out_of_band_object_is_overwritten() {
        let (cluster, rec) = setup(ModifyStrategy::CreateFirst);
        cluster.put(&deployments(), deployment("to", "web", 9));
        assert_eq!(rec.on_added(deployment("from", "web", 2)).await.unwrap(), Outcome::Updated);
        assert_eq!(replicas(&cluster, "web"), Some(2));
        let ops: Vec<_> = cluster.writes().iter().map(|w| (w.op, w.result.clone())).collect();
        assert_eq!(ops, [(WriteOp::Create, Err(WriteError::AlreadyExists)), (WriteOp::Update, Ok(()))]);
    }

    #[tokio::test]
    async fn update_miss_after_conflict_recreates() {
        let (cluster, rec) = setup(ModifyStrategy::CreateFirst);
        cluster.fail_writes(WriteOp::Create, 1, WriteError::AlreadyExists);
        assert_eq!(rec.on_added(deployment("from", "web", 2)).await.unwrap(), Outcome::Created);
        assert_eq!(replicas(&cluster, "web"), Some(2));
    }

    #[tokio::test]
    async fn update_first_strategy_falls_back_to_create() {
        let (cluster, rec) = setup(ModifyStrategy::UpdateFirst);
        assert_eq!(rec.on_modified(deployment("from", "web", 4)).await.unwrap(), Outcome::Created);
        assert_eq!(rec.on_modified(deployment("from", "web", 6)).await.unwrap(), Outcome::Updated);
        assert_eq!(replicas(&cluster, "web"), Some(6));
        let ops: Vec<_> = cluster.writes().iter().map(|w| w.op).collect();
        assert_eq!(ops, [WriteOp::Update, WriteOp::Create, WriteOp::Update]);
    }

    #[tokio::test]
    async fn transient_errors_surface_without_retry() {
        let (cluster, rec) = setup(ModifyStrategy::CreateFirst);
        cluster.fail_writes(WriteOp::Create, 1, WriteError::Other("etcdserver: request timed out".into()));
        let err = rec.on_added(deployment("from", "web", 2)).await.unwrap_err();
        assert!(matches!(err, MirrorError::Write(WriteError::Other(_))));
        assert!(!err.is_fatal());
        assert_eq!(cluster.writes().len(), 1, "no immediate retry");
        assert_eq!(replicas(&cluster, "web"), None);

        // Next delivery (resync) succeeds.
        rec.on_modified(deployment("from", "web", 2)).await.unwrap();
        assert_eq!(replicas(&cluster, "web"), Some(2));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (cluster, rec) = setup(ModifyStrategy::CreateFirst);
        rec.on_added(deployment("from", "web", 2)).await.unwrap();
        assert_eq!(rec.on_deleted(deployment("from", "web", 2)).await.unwrap(), Outcome::Deleted);
        for _ in 0..3 {
            assert_eq!(rec.on_deleted(deployment("from", "web", 2)).await.unwrap(), Outcome::AlreadyAbsent);
        }
        cluster.fail_writes(WriteOp::Delete, 1, WriteError::Gone);
        assert_eq!(rec.on_deleted(deployment("from", "web", 2)).await.unwrap(), Outcome::AlreadyAbsent);
        assert!(cluster.names(&deployments(), "to").is_empty());
    }

    #[tokio::test]
    async fn malformed_object_is_dropped_without_writes() {
        let (cluster, rec) = setup(ModifyStrategy::CreateFirst);
        let bad = ResourceObject::from_value(serde_json::json!({ "kind": "Deployment", "metadata": { "name": "x" } })).unwrap();
        assert!(matches!(rec.on_added(bad).await, Err(MirrorError::Transform(_))));
        assert!(cluster.writes().is_empty());
    }
}
