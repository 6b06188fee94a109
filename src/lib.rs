//! Sandbox Operator - pooled, ephemeral execution sandboxes on Kubernetes
//!
//! The operator maintains warm pools of pre-provisioned sandbox units and
//! hands batches of them to workloads with a constant number of writes,
//! regardless of batch size. Two CRDs drive it:
//!
//! - `SandboxPool` keeps a buffer of ready units within capacity bounds
//! - `BatchSandbox` requests N replicas, optionally from a pool, optionally
//!   with a per-replica task to execute inside each unit
//!
//! The key design choice is the allocation table: a single JSON map stored
//! as an annotation on the pool, mutated only through optimistic-concurrency
//! conditional writes. Claiming N units is one conditional write to that
//! table plus one write to record the result on the batch - never N child
//! objects with N status updates.
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (SandboxPool, BatchSandbox)
//! - [`allocator`] - atomic batch claim/release against a pool
//! - [`controller`] - reconciliation loops for both CRDs
//! - [`strategy`] - pluggable per-replica task spec generation
//! - [`runtime`] - container-runtime adapter boundary (units as Pods)
//! - [`executor`] - task executor sidecar boundary (execd)
//! - [`retry`] - exponential backoff helper for transient failures
//! - [`error`] - error taxonomy

#![deny(missing_docs)]

pub mod allocator;
pub mod controller;
pub mod crd;
pub mod error;
pub mod executor;
pub mod retry;
pub mod runtime;
pub mod strategy;

#[cfg(test)]
pub(crate) mod testing;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// API group and well-known keys
// =============================================================================

/// API group for all operator CRDs
pub const API_GROUP: &str = "sandbox.dev";

/// Pool annotation holding the allocation table: a JSON map of
/// `batch name -> [unit names]`. This is the single shared record contended
/// by concurrent claims; it is only ever mutated via conditional writes.
pub const ALLOCATIONS_ANNOTATION: &str = "sandbox.dev/allocations";

/// Batch annotation holding the claimed unit names as a JSON list, in
/// ordinal order. Source of truth for which concrete units belong to a batch.
pub const ALLOCATION_ANNOTATION: &str = "sandbox.dev/allocation";

/// Batch annotation holding the JSON list of unit addresses once ready
pub const ENDPOINTS_ANNOTATION: &str = "sandbox.dev/endpoints";

/// Label placed on units owned by a pool
pub const POOL_LABEL: &str = "sandbox.dev/pool";

/// Label placed on units provisioned directly by a batch (non-pooled path)
pub const BATCH_LABEL: &str = "sandbox.dev/batch";

/// Finalizer guarding ordered teardown (stop tasks, then release units)
pub const TEARDOWN_FINALIZER: &str = "sandbox.dev/teardown";

/// Pool annotation that forces deletion even while units are allocated
pub const FORCE_DELETE_ANNOTATION: &str = "sandbox.dev/force-delete";

/// Field manager name used for server-side apply
pub const FIELD_MANAGER: &str = "sandbox-operator";

/// Container port the execd task executor listens on inside each unit
pub const DEFAULT_EXECD_PORT: u16 = 8080;
