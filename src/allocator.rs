//! Atomic batch claim/release against a pool's allocation table.
//!
//! The allocation bookkeeping is a single JSON map on the pool object
//! (batch name -> claimed unit names). Claiming N units is therefore one
//! conditional write to that table, independent of N - the O(1) path this
//! design exists for, versus creating N binding objects and updating each
//! one's status.
//!
//! Concurrency is handled with optimistic conditional writes, never a lock
//! service: every claim is computed against the exact pool version it
//! replaces, so two concurrent claims can never hand out overlapping unit
//! sets - the loser 409s and recomputes. A crashed claimer leaves no lock
//! to leak; its entry is either fully present (found again by batch name on
//! retry) or fully absent.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::crd::{AllocationPolicy, SandboxPool, SandboxPoolStatus};
use crate::retry::{retry_if, RetryConfig};
use crate::runtime::UnitRuntime;
use crate::{Error, Result, FIELD_MANAGER, POOL_LABEL, TEARDOWN_FINALIZER};

/// Persistence operations for SandboxPool objects.
///
/// `replace_pool` is the compare-and-swap primitive: it must fail with a
/// conflict when the stored object's version no longer matches the version
/// carried by the given pool.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PoolStore: Send + Sync {
    /// Fetch the current pool object, including its resource version
    async fn get_pool(&self, namespace: &str, name: &str) -> Result<SandboxPool>;

    /// Conditionally replace the pool object. Fails with a conflict if the
    /// stored version moved since this copy was read.
    async fn replace_pool(&self, pool: &SandboxPool) -> Result<SandboxPool>;

    /// Patch the pool's status subresource
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &SandboxPoolStatus,
    ) -> Result<()>;

    /// Ensure the teardown finalizer is present on the pool
    async fn add_finalizer(&self, namespace: &str, name: &str) -> Result<()>;

    /// Remove the teardown finalizer from the pool
    async fn remove_finalizer(&self, namespace: &str, name: &str) -> Result<()>;
}

/// A claim request against one pool
#[derive(Clone, Debug)]
pub struct ClaimRequest<'a> {
    /// Namespace holding the pool and its units
    pub namespace: &'a str,
    /// Pool to claim from
    pub pool: &'a str,
    /// Identity of the claiming batch; claims are keyed by it so a retry
    /// after a crash is a lookup, not a second claim
    pub batch: &'a str,
    /// Number of units the batch wants
    pub count: u32,
    /// What to do when the pool cannot deliver all of them
    pub policy: AllocationPolicy,
}

/// Claim `count` units from a pool for a batch.
///
/// Ready buffer units are taken first, in stable name order; if the buffer
/// is short, additional units are provisioned on demand up to the pool's
/// `poolMax` and counted as claimed immediately (the caller awaits their
/// readiness, exactly as it awaits the rest of the batch).
///
/// Exactly one conditional table write is issued per successful claim,
/// regardless of `count`. An already-satisfied claim (crash recovery,
/// re-reconciliation) issues zero writes. Version conflicts are retried
/// transparently; `InsufficientCapacity` propagates untouched.
///
/// Under `Strict`, nothing is written unless the full request is
/// satisfiable. Under `BestEffort` a partial set is claimed and later
/// claims top the entry up to `count`. A shrink (count below the recorded
/// entry) releases the tail back to the buffer.
pub async fn claim(
    store: &dyn PoolStore,
    runtime: &dyn UnitRuntime,
    req: &ClaimRequest<'_>,
) -> Result<Vec<String>> {
    retry_if(
        &RetryConfig::for_conflicts(),
        "pool claim",
        Error::is_conflict,
        || claim_once(store, runtime, req),
    )
    .await
}

async fn claim_once(
    store: &dyn PoolStore,
    runtime: &dyn UnitRuntime,
    req: &ClaimRequest<'_>,
) -> Result<Vec<String>> {
    let pool = store.get_pool(req.namespace, req.pool).await?;
    let units = runtime
        .list_units(req.namespace, POOL_LABEL, req.pool)
        .await?;

    let mut table = pool.allocation_table()?;
    let held = table.get(req.batch).cloned().unwrap_or_default();
    let count = req.count as usize;

    // Idempotent fast path: the claim already happened.
    if held.len() == count {
        debug!(batch = %req.batch, pool = %req.pool, "claim already satisfied");
        return Ok(held);
    }

    // Shrink: release the tail back to the buffer with one write.
    if held.len() > count {
        let keep = held[..count].to_vec();
        table.insert(req.batch.to_string(), keep.clone());
        store.replace_pool(&pool.with_allocation_table(&table)?).await?;
        info!(
            batch = %req.batch,
            pool = %req.pool,
            released = held.len() - count,
            "shrunk claim"
        );
        return Ok(keep);
    }

    let allocated = pool.allocated_unit_names()?;
    let mut free: Vec<String> = units
        .iter()
        .filter(|u| u.ready && !u.failed && !allocated.contains(&u.name))
        .map(|u| u.name.clone())
        .collect();
    free.sort();

    let need = count - held.len();
    let held_len = held.len();
    let mut claimed = held;
    let take = need.min(free.len());
    claimed.extend(free.into_iter().take(take));
    let mut deficit = need - take;

    // Adopt unallocated warming units before provisioning more. A prior
    // attempt that lost its conditional write may have created units that
    // never made it into the table; re-provisioning would strand them.
    if deficit > 0 {
        let mut warming: Vec<String> = units
            .iter()
            .filter(|u| !u.ready && !u.failed && !allocated.contains(&u.name))
            .map(|u| u.name.clone())
            .filter(|n| !claimed.contains(n))
            .collect();
        warming.sort();
        let adopt = deficit.min(warming.len());
        claimed.extend(warming.into_iter().take(adopt));
        deficit -= adopt;
    }

    // Buffer exhausted: provision on demand, bounded by poolMax.
    if deficit > 0 {
        let total_live = units.iter().filter(|u| !u.failed).count();
        let headroom = (pool.spec.capacity.pool_max as usize).saturating_sub(total_live);

        match req.policy {
            AllocationPolicy::Strict if deficit > headroom => {
                return Err(Error::InsufficientCapacity {
                    requested: req.count,
                    available: (claimed.len() + headroom) as u32,
                });
            }
            AllocationPolicy::BestEffort if claimed.is_empty() && headroom == 0 => {
                return Err(Error::InsufficientCapacity {
                    requested: req.count,
                    available: 0,
                });
            }
            _ => {}
        }

        let create = deficit.min(headroom);
        if create > 0 {
            let taken: BTreeSet<String> = units
                .iter()
                .map(|u| u.name.clone())
                .chain(claimed.iter().cloned())
                .collect();
            let labels: BTreeMap<String, String> =
                [(POOL_LABEL.to_string(), req.pool.to_string())].into();

            for name in next_unit_names(req.pool, &taken, create) {
                runtime
                    .create_unit(req.namespace, &name, &labels, &pool.spec.template)
                    .await?;
                claimed.push(name);
            }
            deficit -= create;
        }
    }

    // A starved BestEffort claim that gained nothing writes nothing.
    if claimed.len() == held_len {
        debug!(batch = %req.batch, pool = %req.pool, "no units gained, skipping write");
        return Ok(claimed);
    }

    table.insert(req.batch.to_string(), claimed.clone());
    store.replace_pool(&pool.with_allocation_table(&table)?).await?;

    info!(
        batch = %req.batch,
        pool = %req.pool,
        claimed = claimed.len(),
        requested = req.count,
        shortfall = deficit,
        "claimed units"
    );
    Ok(claimed)
}

/// Release a batch's claim back to the pool.
///
/// One conditional table write; no write at all if the batch holds
/// nothing (idempotent). The freed units become buffer again and the next
/// pool reconcile folds them in or trims past `bufferMax`.
pub async fn release(
    store: &dyn PoolStore,
    namespace: &str,
    pool_name: &str,
    batch: &str,
) -> Result<()> {
    retry_if(
        &RetryConfig::for_conflicts(),
        "pool release",
        Error::is_conflict,
        || async {
            let pool = store.get_pool(namespace, pool_name).await?;
            let mut table = pool.allocation_table()?;
            if table.remove(batch).is_none() {
                debug!(batch = %batch, pool = %pool_name, "nothing to release");
                return Ok(());
            }
            store.replace_pool(&pool.with_allocation_table(&table)?).await?;
            info!(batch = %batch, pool = %pool_name, "released claim");
            Ok(())
        },
    )
    .await
}

/// Pick `count` fresh unit names of the form `{pool}-u{n}`, skipping names
/// already in use. Deterministic, so a crashed-and-retried provisioning
/// pass converges instead of multiplying pods.
pub(crate) fn next_unit_names(
    pool: &str,
    taken: &BTreeSet<String>,
    count: usize,
) -> Vec<String> {
    let mut names = Vec::with_capacity(count);
    let mut ordinal = 0usize;
    while names.len() < count {
        let candidate = format!("{pool}-u{ordinal}");
        if !taken.contains(&candidate) {
            names.push(candidate);
        }
        ordinal += 1;
    }
    names
}

// =============================================================================
// Kubernetes-backed store
// =============================================================================

/// Production [`PoolStore`] backed by the Kubernetes API.
///
/// `replace_pool` relies on the API server's resourceVersion precondition:
/// replacing an object whose version moved returns 409, which surfaces
/// through [`Error::is_conflict`] and is retried by the claim loop.
pub struct KubePoolStore {
    client: Client,
}

impl KubePoolStore {
    /// Create a store using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<SandboxPool> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl PoolStore for KubePoolStore {
    async fn get_pool(&self, namespace: &str, name: &str) -> Result<SandboxPool> {
        Ok(self.api(namespace).get(name).await?)
    }

    async fn replace_pool(&self, pool: &SandboxPool) -> Result<SandboxPool> {
        let namespace = pool
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| Error::validation("pool has no namespace"))?;
        let name = pool
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::validation("pool has no name"))?;
        Ok(self
            .api(namespace)
            .replace(name, &PostParams::default(), pool)
            .await?)
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &SandboxPoolStatus,
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

    async fn add_finalizer(&self, namespace: &str, name: &str) -> Result<()> {
        let pool = self.get_pool(namespace, name).await?;
        let mut finalizers = pool.metadata.finalizers.clone().unwrap_or_default();
        if finalizers.iter().any(|f| f == TEARDOWN_FINALIZER) {
            return Ok(());
        }
        finalizers.push(TEARDOWN_FINALIZER.to_string());
        let mut updated = pool;
        updated.metadata.finalizers = Some(finalizers);
        self.replace_pool(&updated).await?;
        Ok(())
    }

    async fn remove_finalizer(&self, namespace: &str, name: &str) -> Result<()> {
        let pool = self.get_pool(namespace, name).await?;
        let Some(finalizers) = pool.metadata.finalizers.clone() else {
            return Ok(());
        };
        let remaining: Vec<String> = finalizers
            .into_iter()
            .filter(|f| f != TEARDOWN_FINALIZER)
            .collect();
        let mut updated = pool;
        updated.metadata.finalizers = if remaining.is_empty() {
            None
        } else {
            Some(remaining)
        };
        self.replace_pool(&updated).await?;
        Ok(())
    }
}
