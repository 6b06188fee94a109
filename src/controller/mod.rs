//! Reconcilers for the two custom resources.
//!
//! Both follow the same level-triggered shape: derive the live state,
//! converge one step toward the spec, record status only when it changed,
//! requeue. Neither caches anything between passes.

pub mod batch;
pub mod pool;

pub use batch::{BatchConfig, BatchContext, KubeBatchClient};
pub use pool::PoolContext;
