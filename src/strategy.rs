//! Task scheduling strategy.
//!
//! Decides whether a batch needs task execution at all and computes the
//! per-replica task specs. The default strategy is a template-presence
//! check plus RFC 7396 merge-patching of shard overlays; alternative
//! policies plug in by implementing the same two operations, never by
//! branching inside the reconciler.

use kube::ResourceExt;

use crate::crd::{BatchSandbox, Task, TaskTemplateSpec};
use crate::{Error, Result};

/// Pluggable policy for per-replica task scheduling
pub trait TaskSchedulingStrategy: Send + Sync {
    /// Whether the batch needs tasks dispatched at all
    fn need_task_scheduling(&self, batch: &BatchSandbox) -> bool;

    /// Compute one task spec per replica ordinal, independently.
    ///
    /// The slot for ordinal `idx` is `Err` only when that ordinal's shard
    /// patch cannot be applied; other ordinals are unaffected. One bad
    /// patch degrades one replica, never the batch.
    fn generate_task_specs(&self, batch: &BatchSandbox) -> Vec<Result<Task>>;
}

/// Default strategy: schedule tasks iff a task template is present, patch
/// each ordinal with its shard overlay if one exists.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultTaskSchedulingStrategy;

impl DefaultTaskSchedulingStrategy {
    /// Task spec for a single ordinal.
    ///
    /// Patch semantics are RFC 7396 JSON Merge Patch: a field the patch
    /// sets fully replaces the base field, and arrays are wholesale
    /// replaced. An ordinal beyond the patch list falls back to the
    /// unpatched template.
    fn task_spec(&self, batch: &BatchSandbox, idx: usize) -> Result<Task> {
        let name = format!("{}-{idx}", batch.name_any());
        let patches = &batch.spec.shard_task_patches;

        let process = if let (Some(template), Some(patch)) =
            (batch.spec.task_template.as_ref(), patches.get(idx))
        {
            let mut doc = serde_json::to_value(template).map_err(|e| {
                Error::serialization(format!("task template for {name}: {e}"))
            })?;
            json_patch::merge(&mut doc, patch);
            let patched: TaskTemplateSpec =
                serde_json::from_value(doc).map_err(|e| Error::PatchApplication {
                    ordinal: idx,
                    patch: patch.to_string(),
                    reason: e.to_string(),
                })?;
            patched.spec.process
        } else {
            batch
                .spec
                .task_template
                .as_ref()
                .and_then(|t| t.spec.process.clone())
        };

        Ok(Task { name, process })
    }
}

impl TaskSchedulingStrategy for DefaultTaskSchedulingStrategy {
    fn need_task_scheduling(&self, batch: &BatchSandbox) -> bool {
        batch.spec.task_template.is_some()
    }

    fn generate_task_specs(&self, batch: &BatchSandbox) -> Vec<Result<Task>> {
        (0..batch.spec.replicas as usize)
            .map(|idx| self.task_spec(batch, idx))
            .collect()
    }
}
