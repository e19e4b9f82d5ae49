//! Error taxonomy shared by every mirra crate.

use serde::{Deserialize, Serialize};

/// Outcome of a failed destination write, classified so the reconciler can
/// pick its fallback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum WriteError {
    #[error("already exists")]
    AlreadyExists,
    #[error("not found")]
    NotFound,
    #[error("gone")]
    Gone,
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    /// Control plane could not enumerate kinds, or a requested kind is not mirrorable.
    #[error("discovery: {0}")]
    Discovery(String),
    /// Missing namespace or invalid configuration.
    #[error("precondition: {0}")]
    Precondition(String),
    /// Malformed source object.
    #[error("transform: {0}")]
    Transform(String),
    #[error("write: {0}")]
    Write(#[from] WriteError),
    /// List/watch failure; handled by relisting.
    #[error("stream: {0}")]
    Stream(String),
}

impl MirrorError {
    /// Only startup errors terminate the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MirrorError::Discovery(_) | MirrorError::Precondition(_))
    }
}

pub type MirrorResult<T> = Result<T, MirrorError>;
