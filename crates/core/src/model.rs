//! Mirra data model: kinds, generic objects, keys and events.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::error::{MirrorError, MirrorResult};

/// A served resource kind, as reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    /// Plural resource name used in API paths (`deployments`); sub-resources carry a `/`.
    pub resource: String,
    /// Type name (`Deployment`).
    pub kind: String,
    pub namespaced: bool,
    pub verbs: BTreeSet<String>,
}

impl ResourceKind {
    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    pub fn supports(&self, verb: &str) -> bool { self.verbs.contains(verb) }

    pub fn is_subresource(&self) -> bool { self.resource.contains('/') }

    /// Namespaced, watchable, and not a sub-resource.
    pub fn is_mirrorable(&self) -> bool {
        self.namespaced && self.supports("watch") && !self.is_subresource()
    }

    pub fn matches(&self, r: &ResourceRef) -> bool {
        self.resource == r.resource && self.version == r.version && self.group == r.group
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}.{}", self.resource, self.version)
        } else {
            write!(f, "{}.{}.{}", self.resource, self.version, self.group)
        }
    }
}

/// Operator-supplied kind reference in `resource.version[.group]` form,
/// e.g. `deployments.v1.apps` or `configmaps.v1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub resource: String,
    pub version: String,
    pub group: String,
}

impl FromStr for ResourceRef {
    type Err = MirrorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().splitn(3, '.');
        let resource = parts.next().unwrap_or_default();
        let version = parts.next().unwrap_or_default();
        let group = parts.next().unwrap_or_default();
        if resource.is_empty() || version.is_empty() || (s.matches('.').count() >= 2 && group.is_empty()) {
            return Err(MirrorError::Precondition(format!(
                "invalid resource kind {:?} (expect resource.version or resource.version.group)",
                s
            )));
        }
        Ok(Self { resource: resource.to_string(), version: version.to_string(), group: group.to_string() })
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}.{}", self.resource, self.version)
        } else {
            write!(f, "{}.{}.{}", self.resource, self.version, self.group)
        }
    }
}

/// Identity of an object within a kind. Never includes resourceVersion or uid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// One instance of any kind, kept as an ordered JSON field map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceObject(Map<String, Json>);

impl ResourceObject {
    /// Minimal object with type and identity fields set.
    pub fn new(api_version: &str, kind: &str, namespace: &str, name: &str) -> Self {
        let mut fields = Map::new();
        fields.insert("apiVersion".into(), Json::String(api_version.to_string()));
        fields.insert("kind".into(), Json::String(kind.to_string()));
        let mut meta = Map::new();
        meta.insert("name".into(), Json::String(name.to_string()));
        meta.insert("namespace".into(), Json::String(namespace.to_string()));
        fields.insert("metadata".into(), Json::Object(meta));
        Self(fields)
    }

    pub fn from_value(v: Json) -> MirrorResult<Self> {
        match v {
            Json::Object(fields) => Ok(Self(fields)),
            other => Err(MirrorError::Transform(format!("expected a JSON object, got {}", json_type(&other)))),
        }
    }

    pub fn into_value(self) -> Json { Json::Object(self.0) }

    pub fn fields(&self) -> &Map<String, Json> { &self.0 }
    pub fn fields_mut(&mut self) -> &mut Map<String, Json> { &mut self.0 }

    /// Builder-style insert of a top-level field (`spec`, `data`, ...).
    pub fn with_field(mut self, key: &str, value: Json) -> Self {
        self.0.insert(key.to_string(), value);
        self
    }

    pub fn api_version(&self) -> &str { self.0.get("apiVersion").and_then(Json::as_str).unwrap_or("") }
    pub fn kind(&self) -> &str { self.0.get("kind").and_then(Json::as_str).unwrap_or("") }

    pub fn metadata(&self) -> Option<&Map<String, Json>> { self.0.get("metadata").and_then(Json::as_object) }

    /// Metadata map, created (or replaced if not an object) on demand.
    pub fn metadata_mut(&mut self) -> &mut Map<String, Json> {
        let slot = self.0.entry("metadata").or_insert_with(|| Json::Object(Map::new()));
        if !slot.is_object() {
            *slot = Json::Object(Map::new());
        }
        match slot {
            Json::Object(meta) => meta,
            _ => unreachable!("metadata slot was just set to an object"),
        }
    }

    fn meta_str(&self, field: &str) -> &str {
        self.metadata().and_then(|m| m.get(field)).and_then(Json::as_str).unwrap_or("")
    }

    pub fn name(&self) -> &str { self.meta_str("name") }
    pub fn namespace(&self) -> &str { self.meta_str("namespace") }
    pub fn resource_version(&self) -> &str { self.meta_str("resourceVersion") }
    pub fn uid(&self) -> &str { self.meta_str("uid") }

    pub fn labels(&self) -> Option<&Map<String, Json>> {
        self.metadata().and_then(|m| m.get("labels")).and_then(Json::as_object)
    }

    pub fn set_namespace(&mut self, namespace: &str) {
        self.metadata_mut().insert("namespace".into(), Json::String(namespace.to_string()));
    }

    pub fn set_resource_version(&mut self, rv: &str) {
        self.metadata_mut().insert("resourceVersion".into(), Json::String(rv.to_string()));
    }

    /// Fill apiVersion/kind when absent (list items usually omit them).
    pub fn ensure_types(&mut self, kind: &ResourceKind) {
        if self.api_version().is_empty() {
            self.0.insert("apiVersion".into(), Json::String(kind.api_version()));
        }
        if self.kind().is_empty() {
            self.0.insert("kind".into(), Json::String(kind.kind.clone()));
        }
    }

    pub fn key(&self) -> MirrorResult<ObjectKey> {
        let name = self.name();
        if name.is_empty() {
            return Err(MirrorError::Transform("object missing metadata.name".into()));
        }
        Ok(ObjectKey::new(self.namespace(), name))
    }
}

fn json_type(v: &Json) -> &'static str {
    match v {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

/// Compare two resourceVersions. They are opaque in general; only when both are
/// decimal integers is an ordering defined.
pub fn compare_resource_versions(a: &str, b: &str) -> Option<Ordering> {
    let a = a.parse::<u64>().ok()?;
    let b = b.parse::<u64>().ok()?;
    Some(a.cmp(&b))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Added => "added",
            EventKind::Modified => "modified",
            EventKind::Deleted => "deleted",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Normalized change emitted by a reflector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub object: ResourceObject,
    /// resourceVersion of the source object at the time of the event.
    pub resource_version: String,
}

impl WatchEvent {
    pub fn new(kind: EventKind, object: ResourceObject) -> Self {
        let resource_version = object.resource_version().to_string();
        Self { kind, object, resource_version }
    }

    pub fn added(object: ResourceObject) -> Self { Self::new(EventKind::Added, object) }
    pub fn modified(object: ResourceObject) -> Self { Self::new(EventKind::Modified, object) }
    pub fn deleted(object: ResourceObject) -> Self { Self::new(EventKind::Deleted, object) }

    pub fn key(&self) -> MirrorResult<ObjectKey> { self.object.key() }
}

/// Item of a source watch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    Change(WatchEvent),
    /// Progress marker: advances the checkpoint, carries no object.
    Bookmark(String),
}

/// Result of a source list call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectList {
    pub items: Vec<ResourceObject>,
    /// Checkpoint to watch from.
    pub resource_version: String,
}

/// What a handler did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Created,
    Updated,
    Deleted,
    /// Delete target was already absent.
    AlreadyAbsent,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Created => "created",
            Outcome::Updated => "updated",
            Outcome::Deleted => "deleted",
            Outcome::AlreadyAbsent => "already_absent",
        }
    }
}
