//! Error types for the Celery operator

use thiserror::Error;

use crate::crd::{ChildKind, ChildType};

/// Main error type for Celery operator operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error (network failures, 5xx, timeouts)
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Validation error for CeleryApp specs
    #[error("validation error: {0}")]
    Validation(String),

    /// A child expected in status is missing, meaning the status document is corrupt
    #[error("child lookup error: no {kind}/{type_} child recorded in status")]
    ChildLookup {
        /// Kind of the missing child
        kind: ChildKind,
        /// Role of the missing child
        type_: ChildType,
    },

    /// A scale target cannot be evaluated
    #[error("invalid scale target: {0}")]
    InvalidScaleTarget(String),

    /// Flower monitoring endpoint could not be queried
    #[error("monitoring error: {0}")]
    Monitoring(String),

    /// A child name is already taken by an object this parent does not control
    #[error("ownership conflict: {0}")]
    Conflict(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a child lookup error for the given (kind, type) pair
    pub fn child_lookup(kind: ChildKind, type_: ChildType) -> Self {
        Self::ChildLookup { kind, type_ }
    }

    /// Create an invalid scale target error with the given message
    pub fn invalid_scale_target(msg: impl Into<String>) -> Self {
        Self::InvalidScaleTarget(msg.into())
    }

    /// Create a monitoring error with the given message
    pub fn monitoring(msg: impl Into<String>) -> Self {
        Self::Monitoring(msg.into())
    }

    /// Create an ownership conflict error with the given message
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Whether redelivering the triggering event can succeed without a spec change.
    ///
    /// Cluster and monitoring failures are transient. Everything else reflects
    /// user input or corrupted state and will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Kube(_) | Self::Monitoring(_))
    }
}
