//! Reconciler for SandboxPool: keeps a warm buffer of units within the
//! pool's capacity bounds.
//!
//! The reconciler is level-triggered and derives everything from live
//! state each pass: list the pool's units, compute total / allocated /
//! available, then converge toward the capacity spec. It never touches a
//! unit named in the allocation table - claims are owned by batches and
//! only released through the table.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{error, info, warn};

use crate::allocator::PoolStore;
use crate::crd::{SandboxPool, SandboxPoolStatus};
use crate::runtime::{Unit, UnitRuntime};
use crate::{Error, Result, POOL_LABEL};

/// Steady-state revisit interval
const REQUEUE_STEADY: Duration = Duration::from_secs(30);
/// Revisit interval while units are warming or converging
const REQUEUE_CONVERGING: Duration = Duration::from_secs(5);

/// Shared state for the pool controller
pub struct PoolContext {
    /// Pool persistence
    pub store: Arc<dyn PoolStore>,
    /// Unit lifecycle backend
    pub runtime: Arc<dyn UnitRuntime>,
}

/// Reconcile one SandboxPool toward its capacity spec.
pub async fn reconcile(pool: Arc<SandboxPool>, ctx: Arc<PoolContext>) -> Result<Action> {
    let namespace = pool
        .metadata
        .namespace
        .as_deref()
        .ok_or_else(|| Error::validation("pool has no namespace"))?;
    let name = pool.name_any();

    if pool.metadata.deletion_timestamp.is_some() {
        return teardown(&pool, namespace, &name, &ctx).await;
    }

    if let Err(e) = pool.spec.validate() {
        warn!(pool = %name, error = %e, "invalid pool spec");
        patch_status_if_changed(
            &ctx,
            &pool,
            namespace,
            &name,
            SandboxPoolStatus {
                reason: Some(format!("invalid spec: {e}")),
                ..pool.status.clone().unwrap_or_default()
            },
        )
        .await?;
        return Ok(Action::await_change());
    }

    ctx.store.add_finalizer(namespace, &name).await?;

    let units = ctx.runtime.list_units(namespace, POOL_LABEL, &name).await?;
    let allocated_names = pool.allocated_unit_names()?;

    // Failed units are replaced, not repaired: destroy now, recreate below.
    for unit in units.iter().filter(|u| u.failed) {
        warn!(pool = %name, unit = %unit.name, "destroying failed unit");
        ctx.runtime.destroy_unit(namespace, &unit.name).await?;
    }

    let live: Vec<&Unit> = units.iter().filter(|u| !u.failed).collect();
    let total = live.len();
    let allocated = live
        .iter()
        .filter(|u| allocated_names.contains(&u.name))
        .count();
    let available = live
        .iter()
        .filter(|u| u.ready && !allocated_names.contains(&u.name))
        .count();
    let warming = total - allocated - available;

    let capacity = &pool.spec.capacity;
    let mut converging = warming > 0;

    // Scale up: enough warm buffer, and never below the pool floor. New
    // units count toward the buffer once ready, so the deficit already
    // discounts ones still warming.
    let buffer_deficit = (capacity.buffer_min as usize).saturating_sub(available + warming);
    let floor_deficit = (capacity.pool_min as usize).saturating_sub(total);
    let headroom = (capacity.pool_max as usize).saturating_sub(total);
    let create = buffer_deficit.max(floor_deficit).min(headroom);
    if create > 0 {
        let taken: BTreeSet<String> = units.iter().map(|u| u.name.clone()).collect();
        let labels = [(POOL_LABEL.to_string(), name.clone())].into();
        for unit_name in crate::allocator::next_unit_names(&name, &taken, create) {
            info!(pool = %name, unit = %unit_name, "creating buffer unit");
            ctx.runtime
                .create_unit(namespace, &unit_name, &labels, &pool.spec.template)
                .await?;
        }
        converging = true;
    }

    // Scale down: trim free units past bufferMax, not-ready ones first,
    // and never below the pool floor. Allocated units are untouchable.
    let mut free: Vec<&&Unit> = live
        .iter()
        .filter(|u| !allocated_names.contains(&u.name))
        .collect();
    if create == 0 && free.len() > capacity.buffer_max as usize {
        let excess = free.len() - capacity.buffer_max as usize;
        let removable = total.saturating_sub(capacity.pool_min as usize);
        // Not-ready first, then highest name, so the stable low end of the
        // buffer survives trims.
        free.sort_by(|a, b| a.ready.cmp(&b.ready).then(b.name.cmp(&a.name)));
        for unit in free.iter().take(excess.min(removable)) {
            info!(pool = %name, unit = %unit.name, "trimming surplus unit");
            ctx.runtime.destroy_unit(namespace, &unit.name).await?;
        }
        converging = true;
    }

    patch_status_if_changed(
        &ctx,
        &pool,
        namespace,
        &name,
        SandboxPoolStatus {
            total: total as u32,
            allocated: allocated as u32,
            available: available as u32,
            reason: None,
        },
    )
    .await?;

    Ok(Action::requeue(if converging {
        REQUEUE_CONVERGING
    } else {
        REQUEUE_STEADY
    }))
}

/// Pool deletion: refused while claims are outstanding, unless the
/// force-delete annotation is set. Once clear, every unit is destroyed and
/// the finalizer released.
async fn teardown(
    pool: &SandboxPool,
    namespace: &str,
    name: &str,
    ctx: &PoolContext,
) -> Result<Action> {
    let table = pool.allocation_table()?;
    if !table.is_empty() && !pool.force_delete() {
        warn!(
            pool = %name,
            claims = table.len(),
            "pool deletion blocked by outstanding claims"
        );
        patch_status_if_changed(
            ctx,
            pool,
            namespace,
            name,
            SandboxPoolStatus {
                reason: Some(format!(
                    "deletion blocked: {} batch claim(s) outstanding",
                    table.len()
                )),
                ..pool.status.clone().unwrap_or_default()
            },
        )
        .await?;
        return Ok(Action::requeue(REQUEUE_CONVERGING));
    }

    let units = ctx.runtime.list_units(namespace, POOL_LABEL, name).await?;
    for unit in &units {
        ctx.runtime.destroy_unit(namespace, &unit.name).await?;
    }
    ctx.store.remove_finalizer(namespace, name).await?;
    info!(pool = %name, units = units.len(), "pool torn down");
    Ok(Action::await_change())
}

async fn patch_status_if_changed(
    ctx: &PoolContext,
    pool: &SandboxPool,
    namespace: &str,
    name: &str,
    status: SandboxPoolStatus,
) -> Result<()> {
    if pool.status.as_ref() == Some(&status) {
        return Ok(());
    }
    ctx.store.patch_status(namespace, name, &status).await
}

/// Requeue policy when a reconcile pass fails
pub fn error_policy(pool: Arc<SandboxPool>, err: &Error, _ctx: Arc<PoolContext>) -> Action {
    error!(pool = %pool.name_any(), error = %err, "pool reconcile failed");
    Action::requeue(REQUEUE_CONVERGING)
}
