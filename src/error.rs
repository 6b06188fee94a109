//! Error types for the sandbox operator
//!
//! The taxonomy mirrors how errors are handled, not where they occur:
//! conflicts are always retried transparently, capacity shortfalls are
//! retried with backoff and eventually surface as a degraded batch, patch
//! errors are scoped to a single replica ordinal, and task failures are
//! counters rather than errors.

use thiserror::Error;

/// Main error type for sandbox operator operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// A pool could not satisfy a claim
    #[error("insufficient capacity: requested {requested}, satisfiable {available}")]
    InsufficientCapacity {
        /// Number of units the claim asked for
        requested: u32,
        /// Number of units that could have been delivered
        available: u32,
    },

    /// Optimistic-concurrency version mismatch on a conditional write.
    /// Always retried transparently, never surfaced to the user.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The runtime adapter failed to create or ready a unit
    #[error("provisioning error: {0}")]
    Provisioning(String),

    /// A shard task patch could not be applied to the task template.
    /// Scoped to one replica ordinal; never aborts the batch.
    #[error("patch for ordinal {ordinal} could not be applied (patch: {patch}): {reason}")]
    PatchApplication {
        /// Replica ordinal the patch was destined for
        ordinal: usize,
        /// The raw patch document, for diagnostics
        patch: String,
        /// Why application failed
        reason: String,
    },

    /// The task executor sidecar rejected or failed an operation
    #[error("task executor error: {0}")]
    TaskExecutor(String),

    /// Validation error for CRD specs
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a provisioning error with the given message
    pub fn provisioning(msg: impl Into<String>) -> Self {
        Self::Provisioning(msg.into())
    }

    /// Create a conflict error with the given message
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a task executor error with the given message
    pub fn task_executor(msg: impl Into<String>) -> Self {
        Self::TaskExecutor(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// True if this error is a version conflict that should be retried
    /// without surfacing anywhere.
    ///
    /// Covers both our own [`Error::Conflict`] and a raw 409 from the
    /// Kubernetes API (conditional replace losing the race).
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict(_) => true,
            Self::Kube(kube::Error::Api(resp)) => resp.code == 409,
            _ => false,
        }
    }

    /// True if this error is a capacity shortfall from a pool claim
    pub fn is_insufficient_capacity(&self) -> bool {
        matches!(self, Self::InsufficientCapacity { .. })
    }
}
