//! Mirror configuration record, passed explicitly to every component.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MirrorError, MirrorResult};
use crate::model::ResourceRef;

pub const DEFAULT_RESYNC: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_WATCH_IDLE: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_QUEUE_CAP: usize = 1024;
pub const DEFAULT_MAX_IN_FLIGHT: usize = 16;

/// Which kinds get mirrored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KindSelection {
    /// Exactly these kinds, in this order.
    Fixed(Vec<ResourceRef>),
    /// Every mirrorable kind the control plane serves, minus `exclude`.
    Discover { exclude: Vec<ResourceRef> },
}

impl Default for KindSelection {
    fn default() -> Self { KindSelection::Discover { exclude: Vec::new() } }
}

/// How a Modified event is written to the destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModifyStrategy {
    /// Create, falling back to Update on AlreadyExists.
    #[default]
    CreateFirst,
    /// Update, falling back to Create on NotFound.
    UpdateFirst,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorConfig {
    pub source_namespace: String,
    pub destination_namespace: String,
    pub selection: KindSelection,
    pub resync_interval: Duration,
    /// A watch with no frame for this long is treated as broken.
    pub watch_idle_timeout: Duration,
    /// Label selector applied to source list/watch.
    pub label_selector: Option<String>,
    /// Capacity of each reflector → router channel.
    pub queue_cap: usize,
    /// Concurrent handler invocations per kind (distinct keys only).
    pub max_in_flight: usize,
    pub modify_strategy: ModifyStrategy,
}

impl MirrorConfig {
    pub fn new(source_namespace: impl Into<String>, destination_namespace: impl Into<String>) -> Self {
        Self {
            source_namespace: source_namespace.into(),
            destination_namespace: destination_namespace.into(),
            selection: KindSelection::default(),
            resync_interval: DEFAULT_RESYNC,
            watch_idle_timeout: DEFAULT_WATCH_IDLE,
            label_selector: None,
            queue_cap: DEFAULT_QUEUE_CAP,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            modify_strategy: ModifyStrategy::default(),
        }
    }

    pub fn validate(&self) -> MirrorResult<()> {
        if self.source_namespace.is_empty() || self.destination_namespace.is_empty() {
            return Err(MirrorError::Precondition(format!(
                "source ({:?}) and destination ({:?}) namespaces must be provided",
                self.source_namespace, self.destination_namespace
            )));
        }
        if self.source_namespace == self.destination_namespace {
            return Err(MirrorError::Precondition(format!(
                "source and destination namespace are both {:?}",
                self.source_namespace
            )));
        }
        if self.resync_interval.is_zero() {
            return Err(MirrorError::Precondition("resync interval must be non-zero".into()));
        }
        if self.watch_idle_timeout.is_zero() {
            return Err(MirrorError::Precondition("watch idle timeout must be non-zero".into()));
        }
        if self.queue_cap == 0 || self.max_in_flight == 0 {
            return Err(MirrorError::Precondition("queue capacity and in-flight limit must be non-zero".into()));
        }
        if matches!(&self.selection, KindSelection::Fixed(kinds) if kinds.is_empty()) {
            return Err(MirrorError::Precondition("fixed kind selection is empty".into()));
        }
        Ok(())
    }
}
