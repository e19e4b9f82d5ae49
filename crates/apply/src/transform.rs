//! Source object → destination-ready object.

use mirra_core::{MirrorError, MirrorResult, ResourceObject};

/// Metadata the source server assigned; meaningless (or harmful) in the destination.
pub const SERVER_ASSIGNED: &[&str] = &[
    "resourceVersion",
    "uid",
    "creationTimestamp",
    "managedFields",
    "selfLink",
    "generation",
    "deletionTimestamp",
    "deletionGracePeriodSeconds",
    // Owner UIDs point into the source namespace.
    "ownerReferences",
];

/// Deep copy of `object` with server-assigned metadata removed and the
/// namespace rewritten. Name, labels, annotations and payload are untouched.
pub fn transform(object: &ResourceObject, destination_namespace: &str) -> MirrorResult<ResourceObject> {
    if object.api_version().is_empty() {
        return Err(MirrorError::Transform("object missing apiVersion".into()));
    }
    if object.kind().is_empty() {
        return Err(MirrorError::Transform("object missing kind".into()));
    }
    if object.metadata().is_none() {
        return Err(MirrorError::Transform("object missing metadata".into()));
    }
    object.key()?;

    let mut out = object.clone();
    let meta = out.metadata_mut();
    meta.retain(|k, _| !SERVER_ASSIGNED.contains(&k.as_str()));
    out.set_namespace(destination_namespace);
    Ok(out)
}
