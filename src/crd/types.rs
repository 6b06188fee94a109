//! Shared types used across the SandboxPool and BatchSandbox CRDs

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Capacity bounds for a pool.
///
/// `bufferMin`/`bufferMax` bound the standby portion (unallocated, ready
/// units kept warm); `poolMin`/`poolMax` bound the total units ever alive,
/// allocated or not. The buffer bounds are targets the reconciler drives
/// toward; `poolMax` is a hard ceiling that is never crossed, even when
/// `bufferMin` would demand more.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CapacitySpec {
    /// Minimum number of unallocated ready units kept on standby
    #[serde(default)]
    pub buffer_min: u32,

    /// Maximum number of unallocated ready units kept on standby
    #[serde(default)]
    pub buffer_max: u32,

    /// Minimum total units (allocated + unallocated)
    #[serde(default)]
    pub pool_min: u32,

    /// Maximum total units (allocated + unallocated). Hard invariant.
    #[serde(default)]
    pub pool_max: u32,
}

impl CapacitySpec {
    /// Validate internal consistency of the bounds
    pub fn validate(&self) -> Result<(), Error> {
        if self.buffer_min > self.buffer_max {
            return Err(Error::validation(format!(
                "bufferMin ({}) must not exceed bufferMax ({})",
                self.buffer_min, self.buffer_max
            )));
        }
        if self.pool_min > self.pool_max {
            return Err(Error::validation(format!(
                "poolMin ({}) must not exceed poolMax ({})",
                self.pool_min, self.pool_max
            )));
        }
        Ok(())
    }
}

/// Template for the units a pool (or a non-pooled batch) provisions.
///
/// This is deliberately a narrow projection of a pod template: the runtime
/// adapter owns the full mapping to pods (execd bootstrap volume, shared
/// process namespace, probes). Only the fields callers actually vary are
/// exposed here.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UnitTemplateSpec {
    /// The unit spec applied to every provisioned unit
    pub spec: UnitSpec,
}

/// Spec of a single sandbox unit
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UnitSpec {
    /// Containers to run in the unit. The first is the main sandbox
    /// container; the task executor sidecar is injected by the runtime.
    pub containers: Vec<ContainerSpec>,

    /// Share one process namespace between all containers in the unit.
    /// Required for process-based task execution; defaults to true.
    #[serde(default = "default_share_process_namespace")]
    pub share_process_namespace: bool,
}

fn default_share_process_namespace() -> bool {
    true
}

/// A container within a unit
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    /// Container name
    pub name: String,

    /// Container image
    pub image: String,

    /// Entrypoint command
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    /// Arguments to the entrypoint
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Environment variables
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Resource limits (also used as requests, for guaranteed QoS)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<String, String>,
}

/// Base template for the per-replica task.
///
/// Shard patches are applied against the JSON form of this type using
/// RFC 7396 merge-patch semantics: any field a patch sets fully replaces
/// the base field, and arrays are wholesale-replaced, never merged
/// element-wise.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskTemplateSpec {
    /// The task spec replicated (and optionally patched) per ordinal
    pub spec: TaskSpec,
}

/// Spec of a task executed inside a unit
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    /// Process-based execution, the only supported task kind
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessTask>,
}

/// An OS process run inside the unit's shared process namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessTask {
    /// Command to execute
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    /// Arguments to the command
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Environment variables for the process
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Working directory for the process
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

/// A concrete task dispatched to one unit's executor sidecar.
///
/// Never persisted as a Kubernetes object: the name is derived
/// deterministically as `{batchName}-{ordinal}`, so re-reconciliation
/// recomputes the identical task instead of creating duplicates.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Deterministic task name: `{batchName}-{ordinal}`
    pub name: String,

    /// The process to run; `None` means the ordinal has no work to do
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessTask>,
}

/// Lifecycle phase of a BatchSandbox
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub enum BatchPhase {
    /// Units are being claimed from the pool or provisioned inline
    #[default]
    Allocating,
    /// Units are allocated; tasks are being dispatched to executors
    TaskDispatching,
    /// Allocation complete (or accepted partial) and tasks dispatched
    Ready,
    /// Forward progress is impossible without intervention
    Degraded,
    /// Deletion in progress: stopping tasks, then releasing units
    Terminating,
    /// All tasks stopped and all units released or destroyed
    Terminated,
}

impl std::fmt::Display for BatchPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BatchPhase::Allocating => "Allocating",
            BatchPhase::TaskDispatching => "TaskDispatching",
            BatchPhase::Ready => "Ready",
            BatchPhase::Degraded => "Degraded",
            BatchPhase::Terminating => "Terminating",
            BatchPhase::Terminated => "Terminated",
        };
        write!(f, "{s}")
    }
}

/// Observed state of a dispatched task
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum TaskState {
    /// The process is running
    Running,
    /// The process exited successfully
    Succeeded,
    /// The process exited with a failure
    Failed,
    /// The executor does not know this task (not yet submitted, or lost)
    #[default]
    Unknown,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Running => "Running",
            TaskState::Succeeded => "Succeeded",
            TaskState::Failed => "Failed",
            TaskState::Unknown => "Unknown",
        };
        write!(f, "{s}")
    }
}

/// Policy for claims the pool cannot fully satisfy.
///
/// Under-fulfillment is never silent: `Strict` retries with backoff up to
/// the controller's budget and then surfaces Degraded; `BestEffort` accepts
/// whatever is free right away and reports `allocated < desired` in status.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum AllocationPolicy {
    /// The claim must deliver every requested unit or fail
    #[default]
    Strict,
    /// A partial claim is accepted and topped up on later reconciles
    BestEffort,
}
