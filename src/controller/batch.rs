//! Reconciler for BatchSandbox: allocation, task dispatch, readiness
//! tracking, TTL expiry, and ordered teardown.
//!
//! A batch's claimed unit names live in an annotation on the batch object
//! itself (ordinal i -> element i of the JSON list), so a reconcile pass
//! after a crash re-reads its own allocation instead of re-claiming.
//! Everything else is derived live each pass: unit readiness from the
//! runtime, task states from the in-unit task endpoint.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{error, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::allocator::{self, ClaimRequest, PoolStore};
use crate::crd::{AllocationPolicy, BatchPhase, BatchSandbox, BatchSandboxStatus, TaskState};
use crate::executor::TaskExecutor;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::runtime::{Unit, UnitRuntime};
use crate::strategy::TaskSchedulingStrategy;
use crate::{
    Error, Result, ALLOCATION_ANNOTATION, BATCH_LABEL, ENDPOINTS_ANNOTATION, FIELD_MANAGER,
    POOL_LABEL, TEARDOWN_FINALIZER,
};

const REQUEUE_STEADY: Duration = Duration::from_secs(30);
const REQUEUE_CONVERGING: Duration = Duration::from_secs(5);
/// Back-off between allocation attempts when the pool is short
const REQUEUE_CAPACITY: Duration = Duration::from_secs(10);

/// Persistence operations for BatchSandbox objects.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BatchClient: Send + Sync {
    /// Patch the batch's status subresource
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &BatchSandboxStatus,
    ) -> Result<()>;

    /// Set (or overwrite) one annotation on the batch
    async fn set_annotation(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<()>;

    /// Ensure the teardown finalizer is present
    async fn add_finalizer(&self, namespace: &str, name: &str) -> Result<()>;

    /// Remove the teardown finalizer
    async fn remove_finalizer(&self, namespace: &str, name: &str) -> Result<()>;

    /// Request deletion of the batch object
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Tunables for the batch controller
#[derive(Clone, Debug)]
pub struct BatchConfig {
    /// Allocation attempts before a capacity-starved batch is marked
    /// Degraded instead of retrying forever
    pub claim_retry_budget: u32,
    /// How long after deletion a failing stop_task may keep blocking
    /// teardown before the release is forced
    pub teardown_grace: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            claim_retry_budget: 5,
            teardown_grace: Duration::from_secs(60),
        }
    }
}

/// Shared state for the batch controller
pub struct BatchContext {
    /// Batch persistence
    pub batches: Arc<dyn BatchClient>,
    /// Pool persistence, for claims against pooled sources
    pub pools: Arc<dyn PoolStore>,
    /// Unit lifecycle backend
    pub runtime: Arc<dyn UnitRuntime>,
    /// In-unit task endpoint client
    pub executor: Arc<dyn TaskExecutor>,
    /// Task generation strategy
    pub strategy: Arc<dyn TaskSchedulingStrategy>,
    /// Controller tunables
    pub config: BatchConfig,
}

/// Reconcile one BatchSandbox.
pub async fn reconcile(batch: Arc<BatchSandbox>, ctx: Arc<BatchContext>) -> Result<Action> {
    let namespace = batch
        .metadata
        .namespace
        .as_deref()
        .ok_or_else(|| Error::validation("batch has no namespace"))?;
    let name = batch.name_any();

    if batch.metadata.deletion_timestamp.is_some() {
        return teardown(&batch, namespace, &name, &ctx).await;
    }

    if let Err(e) = batch.spec.validate() {
        warn!(batch = %name, error = %e, "invalid batch spec");
        let status = BatchSandboxStatus {
            phase: BatchPhase::Degraded,
            desired: batch.spec.replicas,
            reason: Some(format!("invalid spec: {e}")),
            ..batch.status.clone().unwrap_or_default()
        };
        patch_status_if_changed(&ctx, &batch, namespace, &name, status).await?;
        return Ok(Action::await_change());
    }

    ctx.batches.add_finalizer(namespace, &name).await?;

    // TTL: an expired batch is deleted outright; teardown runs on the
    // deletion pass through the finalizer.
    if batch.spec.is_expired(Utc::now()) {
        info!(batch = %name, "expire time reached, deleting");
        ctx.batches.delete(namespace, &name).await?;
        return Ok(Action::requeue(REQUEUE_CONVERGING));
    }

    let prior = batch.status.clone().unwrap_or_default();
    let desired = batch.spec.replicas as usize;
    let mut status = BatchSandboxStatus {
        desired: batch.spec.replicas,
        expire_at: batch.spec.expire_time.clone(),
        allocation_attempts: prior.allocation_attempts,
        ..Default::default()
    };

    // ---- Allocation ---------------------------------------------------
    let mut allocation = batch.allocation()?;

    // Scale-down: the evicted ordinals' tasks stop before their units go
    // anywhere near the buffer. Same ordering rule as teardown - a unit
    // released with a live workload would leak it to the next claimant.
    if allocation.len() > desired {
        let units = lookup_units(&batch, namespace, &name, &ctx).await?;
        for (ordinal, unit_name) in allocation.iter().enumerate().skip(desired) {
            let Some(unit) = units.get(unit_name).filter(|u| u.address.is_some()) else {
                continue;
            };
            let task_name = format!("{name}-{ordinal}");
            ctx.executor.stop_task(unit, &task_name).await?;
            info!(batch = %name, task = %task_name, "stopped task on evicted unit");
        }
    }

    if allocation.len() != desired {
        match allocate(&batch, namespace, &name, desired, &ctx).await {
            Ok(names) => {
                if names != allocation {
                    ctx.batches
                        .set_annotation(
                            namespace,
                            &name,
                            ALLOCATION_ANNOTATION,
                            &serde_json::to_string(&names)
                                .map_err(|e| Error::serialization(e.to_string()))?,
                        )
                        .await?;
                }
                allocation = names;
            }
            Err(e) if e.is_insufficient_capacity() => {
                status.allocation_attempts = prior.allocation_attempts + 1;
                status.total = allocation.len() as u32;
                status.allocated = allocation.len() as u32;
                if status.allocation_attempts >= ctx.config.claim_retry_budget {
                    warn!(
                        batch = %name,
                        attempts = status.allocation_attempts,
                        "allocation budget exhausted"
                    );
                    status.phase = BatchPhase::Degraded;
                    status.reason = Some(format!("allocation failed: {e}"));
                    patch_status_if_changed(&ctx, &batch, namespace, &name, status).await?;
                    return Ok(Action::requeue(REQUEUE_STEADY));
                }
                status.phase = BatchPhase::Allocating;
                status.reason = Some(format!(
                    "waiting for capacity: {e} (attempt {}/{})",
                    status.allocation_attempts, ctx.config.claim_retry_budget
                ));
                patch_status_if_changed(&ctx, &batch, namespace, &name, status).await?;
                return Ok(Action::requeue(REQUEUE_CAPACITY));
            }
            Err(e) => return Err(e),
        }
    }
    status.total = allocation.len() as u32;
    status.allocated = allocation.len() as u32;
    if allocation.len() == desired {
        status.allocation_attempts = 0;
    }

    // Under BestEffort the recorded partial claim is the effective
    // replica set: those ordinals run, report Ready, and the shortfall
    // stays visible as allocated < desired while top-up passes continue.
    let effective = match batch.spec.allocation_policy {
        AllocationPolicy::Strict => desired,
        AllocationPolicy::BestEffort => allocation.len().min(desired),
    };

    // ---- Readiness ----------------------------------------------------
    let units = lookup_units(&batch, namespace, &name, &ctx).await?;
    let assigned: Vec<Option<&Unit>> = allocation.iter().map(|n| units.get(n.as_str())).collect();
    let ready = assigned
        .iter()
        .filter(|u| u.map(|u| u.ready).unwrap_or(false))
        .count();
    status.ready = ready as u32;
    let all_ready = allocation.len() == effective && ready == effective;

    if all_ready && effective > 0 {
        publish_endpoints(&batch, namespace, &name, &assigned, &ctx).await?;
    }

    // ---- Task dispatch ------------------------------------------------
    let needs_tasks = ctx.strategy.need_task_scheduling(&batch);
    let mut dispatch_pending = false;
    if all_ready && needs_tasks {
        let tasks = ctx.strategy.generate_task_specs(&batch);
        for (ordinal, task) in tasks.iter().enumerate().take(effective) {
            let task = match task {
                Ok(t) => t,
                Err(e) => {
                    warn!(batch = %name, ordinal, error = %e, "task generation failed");
                    status.task_failed += 1;
                    status.reason = Some(format!("task {ordinal}: {e}"));
                    continue;
                }
            };
            if task.process.is_none() {
                continue;
            }
            let Some(unit) = assigned.get(ordinal).copied().flatten() else {
                status.task_unknown += 1;
                dispatch_pending = true;
                continue;
            };
            if unit.address.is_none() {
                status.task_unknown += 1;
                dispatch_pending = true;
                continue;
            }

            match ctx.executor.get_task_status(unit, &task.name).await? {
                TaskState::Unknown => {
                    ctx.executor.submit_task(unit, task).await?;
                    info!(batch = %name, ordinal, unit = %unit.name, task = %task.name, "task submitted");
                    status.task_running += 1;
                }
                TaskState::Running => status.task_running += 1,
                TaskState::Succeeded => status.task_succeeded += 1,
                TaskState::Failed => {
                    status.task_failed += 1;
                    status.reason = Some(format!("task {} failed", task.name));
                }
            }
        }
    }

    // ---- Phase --------------------------------------------------------
    // Failed tasks stay in the counters and reason; partial success is a
    // normal outcome for a batch, not a degradation of the object.
    status.phase = if needs_tasks && (!all_ready || dispatch_pending) {
        // Allocation is done; dispatch waits on unit readiness.
        BatchPhase::TaskDispatching
    } else if !all_ready {
        BatchPhase::Allocating
    } else {
        BatchPhase::Ready
    };

    patch_status_if_changed(&ctx, &batch, namespace, &name, status.clone()).await?;

    // A Ready batch still short of desired keeps the fast requeue so
    // top-up claims retry promptly.
    let mut requeue = if status.phase == BatchPhase::Ready && allocation.len() == desired {
        REQUEUE_STEADY
    } else {
        REQUEUE_CONVERGING
    };
    if let Some(expire_at) = batch.spec.expire_at() {
        let until = (expire_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        requeue = requeue.min(until.max(Duration::from_secs(1)));
    }
    Ok(Action::requeue(requeue))
}

/// Materialize the batch's unit set, pooled or inline.
async fn allocate(
    batch: &BatchSandbox,
    namespace: &str,
    name: &str,
    desired: usize,
    ctx: &BatchContext,
) -> Result<Vec<String>> {
    if let Some(pool_ref) = &batch.spec.pool_ref {
        let req = ClaimRequest {
            namespace,
            pool: pool_ref.as_str(),
            batch: name,
            count: desired as u32,
            policy: batch.spec.allocation_policy.clone(),
        };
        return allocator::claim(ctx.pools.as_ref(), ctx.runtime.as_ref(), &req).await;
    }

    // Inline source: units are owned by the batch and named by ordinal.
    let template = batch
        .spec
        .template
        .as_ref()
        .ok_or_else(|| Error::validation("batch has neither poolRef nor template"))?;
    let existing = ctx
        .runtime
        .list_units(namespace, BATCH_LABEL, name)
        .await?;
    let labels: BTreeMap<String, String> = [(BATCH_LABEL.to_string(), name.to_string())].into();

    let mut names = Vec::with_capacity(desired);
    for ordinal in 0..desired {
        let unit_name = format!("{name}-{ordinal}");
        if !existing.iter().any(|u| u.name == unit_name) {
            retry_with_backoff(
                &RetryConfig::with_max_attempts(3),
                "create inline unit",
                || ctx.runtime.create_unit(namespace, &unit_name, &labels, template),
            )
            .await?;
        }
        names.push(unit_name);
    }
    // Shrink: ordinals past the new count are destroyed.
    for unit in existing.iter().filter(|u| !names.contains(&u.name)) {
        ctx.runtime.destroy_unit(namespace, &unit.name).await?;
    }
    Ok(names)
}

/// Fetch the units visible to this batch, keyed by name.
async fn lookup_units(
    batch: &BatchSandbox,
    namespace: &str,
    name: &str,
    ctx: &BatchContext,
) -> Result<BTreeMap<String, Unit>> {
    let units = match &batch.spec.pool_ref {
        Some(pool_ref) => {
            ctx.runtime
                .list_units(namespace, POOL_LABEL, pool_ref)
                .await?
        }
        None => ctx.runtime.list_units(namespace, BATCH_LABEL, name).await?,
    };
    Ok(units.into_iter().map(|u| (u.name.clone(), u)).collect())
}

/// Publish the ordinal-ordered unit addresses once the batch is fully
/// ready, so clients can connect without watching pods.
async fn publish_endpoints(
    batch: &BatchSandbox,
    namespace: &str,
    name: &str,
    assigned: &[Option<&Unit>],
    ctx: &BatchContext,
) -> Result<()> {
    let endpoints: Vec<&str> = assigned
        .iter()
        .filter_map(|u| u.and_then(|u| u.address.as_deref()))
        .collect();
    if endpoints.len() != assigned.len() {
        return Ok(());
    }
    let value =
        serde_json::to_string(&endpoints).map_err(|e| Error::serialization(e.to_string()))?;
    let current = batch
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ENDPOINTS_ANNOTATION));
    if current == Some(&value) {
        return Ok(());
    }
    ctx.batches
        .set_annotation(namespace, name, ENDPOINTS_ANNOTATION, &value)
        .await
}

/// Teardown, strictly ordered: every task is stopped before any unit is
/// released or destroyed. A unit returned to the buffer with a live
/// workload would leak that workload to the next claimant.
async fn teardown(
    batch: &BatchSandbox,
    namespace: &str,
    name: &str,
    ctx: &BatchContext,
) -> Result<Action> {
    let allocation = batch.allocation()?;
    info!(batch = %name, units = allocation.len(), "tearing down");

    let prior = batch.status.clone().unwrap_or_default();
    patch_status_if_changed(
        ctx,
        batch,
        namespace,
        name,
        BatchSandboxStatus {
            phase: BatchPhase::Terminating,
            ..prior.clone()
        },
    )
    .await?;

    let units = lookup_units(batch, namespace, name, ctx).await?;

    // Phase 1: stop all tasks. A failure aborts the pass and the next one
    // starts over, so no release can precede a stop - until the grace
    // window from the deletion timestamp runs out. Past that, a wedged
    // executor must not make the batch undeletable: the release is forced
    // and every skipped stop is logged.
    let grace_elapsed = batch
        .metadata
        .deletion_timestamp
        .as_ref()
        .map(|t| {
            Utc::now()
                .signed_duration_since(t.0)
                .to_std()
                .unwrap_or(Duration::ZERO)
                >= ctx.config.teardown_grace
        })
        .unwrap_or(false);
    for (ordinal, unit_name) in allocation.iter().enumerate() {
        let Some(unit) = units.get(unit_name).filter(|u| u.address.is_some()) else {
            continue; // unit gone or unreachable, nothing running
        };
        let task_name = format!("{name}-{ordinal}");
        if let Err(e) = ctx.executor.stop_task(unit, &task_name).await {
            if !grace_elapsed {
                return Err(e);
            }
            warn!(
                batch = %name,
                task = %task_name,
                unit = %unit.name,
                error = %e,
                "stop failed past the teardown grace window, forcing release"
            );
        }
    }

    // Phase 2: hand the units back.
    match &batch.spec.pool_ref {
        Some(pool_ref) => {
            allocator::release(ctx.pools.as_ref(), namespace, pool_ref, name).await?;
        }
        None => {
            for unit in units.values() {
                ctx.runtime.destroy_unit(namespace, &unit.name).await?;
            }
        }
    }

    patch_status_if_changed(
        ctx,
        batch,
        namespace,
        name,
        BatchSandboxStatus {
            phase: BatchPhase::Terminated,
            task_running: 0,
            task_unknown: 0,
            ..prior
        },
    )
    .await?;
    ctx.batches.remove_finalizer(namespace, name).await?;
    info!(batch = %name, "teardown complete");
    Ok(Action::await_change())
}

async fn patch_status_if_changed(
    ctx: &BatchContext,
    batch: &BatchSandbox,
    namespace: &str,
    name: &str,
    status: BatchSandboxStatus,
) -> Result<()> {
    if batch.status.as_ref() == Some(&status) {
        return Ok(());
    }
    ctx.batches.patch_status(namespace, name, &status).await
}

/// Requeue policy when a reconcile pass fails
pub fn error_policy(batch: Arc<BatchSandbox>, err: &Error, _ctx: Arc<BatchContext>) -> Action {
    error!(batch = %batch.name_any(), error = %err, "batch reconcile failed");
    Action::requeue(REQUEUE_CONVERGING)
}

// =============================================================================
// Kubernetes-backed client
// =============================================================================

/// Production [`BatchClient`] backed by the Kubernetes API.
pub struct KubeBatchClient {
    client: Client,
}

impl KubeBatchClient {
    /// Create a client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<BatchSandbox> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl BatchClient for KubeBatchClient {
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &BatchSandboxStatus,
    ) -> Result<()> {
        let patch = serde_json::json!({ "status": status });
        self.api(namespace)
            .patch_status(
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn set_annotation(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let patch = serde_json::json!({
            "metadata": { "annotations": { key: value } }
        });
        self.api(namespace)
            .patch(
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn add_finalizer(&self, namespace: &str, name: &str) -> Result<()> {
        let batch = self.api(namespace).get(name).await?;
        if batch
            .metadata
            .finalizers
            .as_ref()
            .map(|f| f.iter().any(|f| f == TEARDOWN_FINALIZER))
            .unwrap_or(false)
        {
            return Ok(());
        }
        let patch = serde_json::json!({
            "metadata": { "finalizers": [TEARDOWN_FINALIZER] }
        });
        self.api(namespace)
            .patch(
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn remove_finalizer(&self, namespace: &str, name: &str) -> Result<()> {
        let batch = self.api(namespace).get(name).await?;
        let Some(finalizers) = batch.metadata.finalizers else {
            return Ok(());
        };
        let remaining: Vec<String> = finalizers
            .into_iter()
            .filter(|f| f != TEARDOWN_FINALIZER)
            .collect();
        let patch = serde_json::json!({
            "metadata": { "finalizers": remaining }
        });
        self.api(namespace)
            .patch(
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .api(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
