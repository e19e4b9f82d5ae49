//! Mirra store: per-kind reflector cache and the event router that feeds
//! the reconciler.

#![forbid(unsafe_code)]

pub mod reflector;
pub mod router;

pub use reflector::{Phase, Reflector, ReflectorState};
pub use router::{EventRouter, PendingQueue, RouterStats};
