//! Resource type resolution and namespace preflight.

use mirra_core::{ControlPlane, KindSelection, MirrorConfig, MirrorError, MirrorResult, ResourceKind};
use tracing::{debug, info};

/// Query the control plane and keep the kinds selected for mirroring.
/// Any failure here is a [`MirrorError::Discovery`] and aborts startup.
pub async fn resolve_kinds(plane: &dyn ControlPlane, selection: &KindSelection) -> MirrorResult<Vec<ResourceKind>> {
    let catalog = plane.list_resource_kinds().await.map_err(|e| match e {
        MirrorError::Discovery(_) => e,
        other => MirrorError::Discovery(other.to_string()),
    })?;
    let kinds = select_kinds(catalog, selection)?;
    info!(count = kinds.len(), kinds = ?kinds.iter().map(ToString::to_string).collect::<Vec<_>>(), "resolved kinds to mirror");
    Ok(kinds)
}

/// Pure selection over a discovery catalog.
///
/// - `Discover`: namespaced, watchable, non-sub-resource kinds minus excludes,
///   sorted by group, version, resource.
/// - `Fixed`: each requested kind must be served and mirrorable; operator order
///   is kept and duplicates dropped.
pub fn select_kinds(catalog: Vec<ResourceKind>, selection: &KindSelection) -> MirrorResult<Vec<ResourceKind>> {
    match selection {
        KindSelection::Discover { exclude } => {
            let mut out: Vec<ResourceKind> = catalog
                .into_iter()
                .filter(|k| {
                    let keep = k.is_mirrorable() && !exclude.iter().any(|r| k.matches(r));
                    if !keep {
                        debug!(kind = %k, namespaced = k.namespaced, watch = k.supports("watch"), "skipping kind");
                    }
                    keep
                })
                .collect();
            out.sort_by(|a, b| {
                a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.resource.cmp(&b.resource))
            });
            out.dedup_by(|a, b| a.group == b.group && a.version == b.version && a.resource == b.resource);
            Ok(out)
        }
        KindSelection::Fixed(wanted) => {
            let mut out: Vec<ResourceKind> = Vec::with_capacity(wanted.len());
            for r in wanted {
                if out.iter().any(|k| k.matches(r)) {
                    continue;
                }
                let found = catalog
                    .iter()
                    .find(|k| k.matches(r))
                    .ok_or_else(|| MirrorError::Discovery(format!("resource kind {} is not served", r)))?;
                if !found.is_mirrorable() {
                    return Err(MirrorError::Discovery(format!(
                        "resource kind {} cannot be mirrored (namespaced={}, watch={})",
                        r,
                        found.namespaced,
                        found.supports("watch")
                    )));
                }
                out.push(found.clone());
            }
            Ok(out)
        }
    }
}

/// Both namespaces must exist before any reflector starts.
pub async fn ensure_namespaces(plane: &dyn ControlPlane, cfg: &MirrorConfig) -> MirrorResult<()> {
    for ns in [&cfg.source_namespace, &cfg.destination_namespace] {
        if !plane.namespace_exists(ns).await? {
            return Err(MirrorError::Precondition(format!("namespace {:?} does not exist", ns)));
        }
    }
    Ok(())
}
