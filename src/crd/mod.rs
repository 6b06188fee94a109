//! Custom Resource Definitions for the sandbox operator

mod batch;
mod pool;
mod types;

pub use batch::{BatchSandbox, BatchSandboxSpec, BatchSandboxStatus};
pub use pool::{AllocationTable, SandboxPool, SandboxPoolSpec, SandboxPoolStatus};
pub use types::{
    AllocationPolicy, BatchPhase, CapacitySpec, ContainerSpec, ProcessTask, Task, TaskSpec,
    TaskState, TaskTemplateSpec, UnitSpec, UnitTemplateSpec,
};
