//! Mirra apply: turns source objects into destination writes.

#![forbid(unsafe_code)]

pub mod reconciler;
pub mod transform;

pub use reconciler::MirrorReconciler;
pub use transform::{transform, SERVER_ASSIGNED};
