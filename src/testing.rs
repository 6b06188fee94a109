//! In-memory cluster fake for integration-style tests.
//!
//! [`FakeCluster`] implements every backend trait against one mutex-guarded
//! state map, with real compare-and-swap semantics on pool replacement:
//! a replace carrying a stale version fails with a conflict exactly as the
//! API server would. That makes it honest enough to exercise claim
//! contention and full reconcile sequences without a cluster.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use kube::api::ObjectMeta;

use crate::allocator::PoolStore;
use crate::controller::batch::BatchClient;
use crate::crd::{
    BatchSandbox, BatchSandboxStatus, CapacitySpec, ContainerSpec, SandboxPool, SandboxPoolSpec,
    SandboxPoolStatus, Task, TaskState, UnitSpec, UnitTemplateSpec,
};
use crate::executor::TaskExecutor;
use crate::runtime::{Unit, UnitRuntime};
use crate::{Error, Result, TEARDOWN_FINALIZER};

#[derive(Clone)]
struct StoredUnit {
    unit: Unit,
    labels: BTreeMap<String, String>,
}

#[derive(Default)]
struct ClusterState {
    /// (namespace, name) -> pool; resourceVersion is authoritative here
    pools: BTreeMap<(String, String), SandboxPool>,
    units: BTreeMap<(String, String), StoredUnit>,
    batches: BTreeMap<(String, String), BatchSandbox>,
    /// unit name -> task name -> state
    tasks: BTreeMap<String, BTreeMap<String, TaskState>>,
}

/// One fake cluster shared by every backend trait.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
    versions: AtomicU64,
    pool_writes: AtomicU64,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> String {
        (self.versions.fetch_add(1, Ordering::SeqCst) + 2).to_string()
    }

    /// Successful conditional pool replacements so far
    pub fn pool_write_count(&self) -> u64 {
        self.pool_writes.load(Ordering::SeqCst)
    }

    pub fn seed_pool(&self, namespace: &str, name: &str, capacity: CapacitySpec) {
        let pool = SandboxPool {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                resource_version: Some("1".to_string()),
                finalizers: Some(vec![TEARDOWN_FINALIZER.to_string()]),
                ..Default::default()
            },
            spec: SandboxPoolSpec {
                template: UnitTemplateSpec {
                    spec: UnitSpec {
                        containers: vec![ContainerSpec {
                            name: "sandbox".into(),
                            image: "busybox:1.36".into(),
                            ..Default::default()
                        }],
                        share_process_namespace: true,
                    },
                },
                capacity,
            },
            status: None,
        };
        self.state
            .lock()
            .expect("lock")
            .pools
            .insert((namespace.to_string(), name.to_string()), pool);
    }

    pub fn seed_ready_unit(&self, namespace: &str, pool: &str, name: &str) {
        let mut state = self.state.lock().expect("lock");
        let ordinal = state.units.len();
        state.units.insert(
            (namespace.to_string(), name.to_string()),
            StoredUnit {
                unit: Unit {
                    name: name.to_string(),
                    ready: true,
                    failed: false,
                    address: Some(format!("10.1.0.{ordinal}")),
                },
                labels: [(crate::POOL_LABEL.to_string(), pool.to_string())].into(),
            },
        );
    }

    pub fn seed_batch(&self, batch: BatchSandbox) {
        let namespace = batch.metadata.namespace.clone().expect("namespace");
        let name = batch.metadata.name.clone().expect("name");
        self.state
            .lock()
            .expect("lock")
            .batches
            .insert((namespace, name), batch);
    }

    pub fn get_batch(&self, namespace: &str, name: &str) -> Option<BatchSandbox> {
        self.state
            .lock()
            .expect("lock")
            .batches
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn get_pool_object(&self, namespace: &str, name: &str) -> Option<SandboxPool> {
        self.state
            .lock()
            .expect("lock")
            .pools
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Flip every not-ready unit to ready and give it an address, as the
    /// kubelet eventually would.
    pub fn make_all_ready(&self) {
        let mut state = self.state.lock().expect("lock");
        let mut ordinal = 100;
        for stored in state.units.values_mut() {
            if !stored.unit.ready {
                stored.unit.ready = true;
                stored.unit.address = Some(format!("10.1.0.{ordinal}"));
                ordinal += 1;
            }
        }
    }

    pub fn unit_names(&self, namespace: &str) -> Vec<String> {
        self.state
            .lock()
            .expect("lock")
            .units
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn running_tasks(&self) -> usize {
        self.state
            .lock()
            .expect("lock")
            .tasks
            .values()
            .flat_map(|t| t.values())
            .filter(|s| **s == TaskState::Running)
            .count()
    }
}

#[async_trait]
impl PoolStore for FakeCluster {
    async fn get_pool(&self, namespace: &str, name: &str) -> Result<SandboxPool> {
        self.get_pool_object(namespace, name)
            .ok_or_else(|| Error::provisioning(format!("pool {namespace}/{name} not found")))
    }

    async fn replace_pool(&self, pool: &SandboxPool) -> Result<SandboxPool> {
        let key = (
            pool.metadata.namespace.clone().expect("namespace"),
            pool.metadata.name.clone().expect("name"),
        );
        let mut state = self.state.lock().expect("lock");
        let stored = state
            .pools
            .get_mut(&key)
            .ok_or_else(|| Error::provisioning(format!("pool {}/{} not found", key.0, key.1)))?;
        if stored.metadata.resource_version != pool.metadata.resource_version {
            return Err(Error::conflict(format!(
                "pool {}/{}: resourceVersion moved",
                key.0, key.1
            )));
        }
        let mut updated = pool.clone();
        updated.metadata.resource_version = Some(self.next_version());
        *stored = updated.clone();
        self.pool_writes.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &SandboxPoolStatus,
    ) -> Result<()> {
        let mut state = self.state.lock().expect("lock");
        if let Some(pool) = state
            .pools
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            pool.status = Some(status.clone());
        }
        Ok(())
    }

    async fn add_finalizer(&self, _namespace: &str, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn remove_finalizer(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().expect("lock");
        state
            .pools
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }
}

#[async_trait]
impl UnitRuntime for FakeCluster {
    async fn create_unit(
        &self,
        namespace: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
        _template: &UnitTemplateSpec,
    ) -> Result<Unit> {
        let mut state = self.state.lock().expect("lock");
        let key = (namespace.to_string(), name.to_string());
        if state.units.contains_key(&key) {
            return Err(Error::conflict(format!("unit {name} already exists")));
        }
        let unit = Unit {
            name: name.to_string(),
            ready: false,
            failed: false,
            address: None,
        };
        state.units.insert(
            key,
            StoredUnit {
                unit: unit.clone(),
                labels: labels.clone(),
            },
        );
        Ok(unit)
    }

    async fn destroy_unit(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().expect("lock");
        state
            .units
            .remove(&(namespace.to_string(), name.to_string()));
        state.tasks.remove(name);
        Ok(())
    }

    async fn list_units(
        &self,
        namespace: &str,
        label_key: &str,
        label_value: &str,
    ) -> Result<Vec<Unit>> {
        let state = self.state.lock().expect("lock");
        Ok(state
            .units
            .iter()
            .filter(|((ns, _), stored)| {
                ns == namespace && stored.labels.get(label_key).map(String::as_str) == Some(label_value)
            })
            .map(|(_, stored)| stored.unit.clone())
            .collect())
    }
}

#[async_trait]
impl TaskExecutor for FakeCluster {
    async fn submit_task(&self, unit: &Unit, task: &Task) -> Result<()> {
        if !unit.ready {
            return Err(Error::task_executor(format!("unit {} not ready", unit.name)));
        }
        let mut state = self.state.lock().expect("lock");
        state
            .tasks
            .entry(unit.name.clone())
            .or_default()
            .entry(task.name.clone())
            .or_insert(TaskState::Running);
        Ok(())
    }

    async fn get_task_status(&self, unit: &Unit, task_name: &str) -> Result<TaskState> {
        let state = self.state.lock().expect("lock");
        Ok(state
            .tasks
            .get(&unit.name)
            .and_then(|t| t.get(task_name))
            .cloned()
            .unwrap_or(TaskState::Unknown))
    }

    async fn stop_task(&self, unit: &Unit, task_name: &str) -> Result<()> {
        let mut state = self.state.lock().expect("lock");
        if let Some(tasks) = state.tasks.get_mut(&unit.name) {
            tasks.remove(task_name);
        }
        Ok(())
    }
}

#[async_trait]
impl BatchClient for FakeCluster {
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &BatchSandboxStatus,
    ) -> Result<()> {
        let mut state = self.state.lock().expect("lock");
        if let Some(batch) = state
            .batches
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            batch.status = Some(status.clone());
        }
        Ok(())
    }

    async fn set_annotation(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().expect("lock");
        if let Some(batch) = state
            .batches
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            batch
                .metadata
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .insert(key.to_string(), value.to_string());
        }
        Ok(())
    }

    async fn add_finalizer(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().expect("lock");
        if let Some(batch) = state
            .batches
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            let finalizers = batch.metadata.finalizers.get_or_insert_with(Vec::new);
            if !finalizers.iter().any(|f| f == TEARDOWN_FINALIZER) {
                finalizers.push(TEARDOWN_FINALIZER.to_string());
            }
        }
        Ok(())
    }

    async fn remove_finalizer(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().expect("lock");
        state
            .batches
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().expect("lock");
        if let Some(batch) = state
            .batches
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            batch.metadata.deletion_timestamp =
                Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                    chrono::Utc::now(),
                ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{batch, pool, BatchConfig, BatchContext, PoolContext};
    use crate::crd::{
        AllocationPolicy, BatchPhase, BatchSandboxSpec, ProcessTask, TaskSpec, TaskTemplateSpec,
    };
    use crate::strategy::DefaultTaskSchedulingStrategy;
    use std::sync::Arc;

    fn contexts(cluster: &Arc<FakeCluster>) -> (Arc<PoolContext>, Arc<BatchContext>) {
        let pool_ctx = Arc::new(PoolContext {
            store: cluster.clone(),
            runtime: cluster.clone(),
        });
        let batch_ctx = Arc::new(BatchContext {
            batches: cluster.clone(),
            pools: cluster.clone(),
            runtime: cluster.clone(),
            executor: cluster.clone(),
            strategy: Arc::new(DefaultTaskSchedulingStrategy),
            config: BatchConfig::default(),
        });
        (pool_ctx, batch_ctx)
    }

    fn scenario_batch() -> BatchSandbox {
        BatchSandbox {
            metadata: ObjectMeta {
                name: Some("batch-x".into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            spec: BatchSandboxSpec {
                replicas: 2,
                pool_ref: Some("pool-a".into()),
                task_template: Some(TaskTemplateSpec {
                    spec: TaskSpec {
                        process: Some(ProcessTask {
                            command: vec!["run.sh".into()],
                            ..Default::default()
                        }),
                    },
                }),
                allocation_policy: AllocationPolicy::Strict,
                ..Default::default()
            },
            status: None,
        }
    }

    async fn reconcile_batch(cluster: &Arc<FakeCluster>, ctx: &Arc<BatchContext>) {
        let current = cluster.get_batch("default", "batch-x").expect("batch");
        batch::reconcile(Arc::new(current), ctx.clone())
            .await
            .expect("batch reconcile");
    }

    async fn reconcile_pool(cluster: &Arc<FakeCluster>, ctx: &Arc<PoolContext>) {
        let current = cluster.get_pool_object("default", "pool-a").expect("pool");
        pool::reconcile(Arc::new(current), ctx.clone())
            .await
            .expect("pool reconcile");
    }

    /// Full lifecycle against one fake cluster: the pool warms a buffer,
    /// a 2-replica batch claims (provisioning the shortfall), tasks run
    /// once everything is ready, and deletion stops tasks and returns the
    /// units to the pool.
    #[tokio::test]
    async fn story_batch_lifecycle_end_to_end() {
        let cluster = Arc::new(FakeCluster::new());
        let (pool_ctx, batch_ctx) = contexts(&cluster);

        cluster.seed_pool(
            "default",
            "pool-a",
            CapacitySpec {
                buffer_min: 1,
                buffer_max: 3,
                pool_min: 0,
                pool_max: 5,
            },
        );

        // Pool warms its buffer of one.
        reconcile_pool(&cluster, &pool_ctx).await;
        assert_eq!(cluster.unit_names("default").len(), 1);
        cluster.make_all_ready();

        // Batch claims 2: one from the buffer, one provisioned on demand.
        cluster.seed_batch(scenario_batch());
        let writes_before = cluster.pool_write_count();
        reconcile_batch(&cluster, &batch_ctx).await;
        assert_eq!(cluster.pool_write_count(), writes_before + 1);

        let claimed = cluster
            .get_batch("default", "batch-x")
            .expect("batch")
            .allocation()
            .expect("allocation");
        assert_eq!(claimed.len(), 2);

        // Units turn ready; the next pass dispatches both tasks and the
        // batch reaches Ready with endpoints published.
        cluster.make_all_ready();
        reconcile_batch(&cluster, &batch_ctx).await;
        let settled = cluster.get_batch("default", "batch-x").expect("batch");
        let status = settled.status.clone().expect("status");
        assert_eq!(status.phase, BatchPhase::Ready);
        assert_eq!(status.ready, 2);
        assert_eq!(status.task_running, 2);
        assert_eq!(cluster.running_tasks(), 2);
        assert!(settled
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(crate::ENDPOINTS_ANNOTATION))
            .is_some());

        // Deletion: tasks stop, claim is released, batch object goes away.
        (&*cluster as &dyn BatchClient)
            .delete("default", "batch-x")
            .await
            .expect("delete");
        reconcile_batch(&cluster, &batch_ctx).await;
        assert_eq!(cluster.running_tasks(), 0);
        assert!(cluster.get_batch("default", "batch-x").is_none());
        let pool = cluster.get_pool_object("default", "pool-a").expect("pool");
        assert!(pool.allocation_table().expect("table").is_empty());

        // The freed units became buffer; the pool trims past bufferMax on
        // later passes without touching anything allocated.
        reconcile_pool(&cluster, &pool_ctx).await;
        assert!(cluster.unit_names("default").len() <= 3);
    }

    /// Story: a running 2-replica batch scales down to 1. The evicted
    /// ordinal's task is stopped before its unit goes back to the pool,
    /// so no released unit carries a live task.
    #[tokio::test]
    async fn story_scale_down_leaves_no_orphan_tasks() {
        let cluster = Arc::new(FakeCluster::new());
        let (_, batch_ctx) = contexts(&cluster);

        cluster.seed_pool(
            "default",
            "pool-a",
            CapacitySpec {
                buffer_min: 0,
                buffer_max: 3,
                pool_min: 0,
                pool_max: 5,
            },
        );
        cluster.seed_ready_unit("default", "pool-a", "pool-a-u0");
        cluster.seed_ready_unit("default", "pool-a", "pool-a-u1");
        cluster.seed_batch(scenario_batch());

        reconcile_batch(&cluster, &batch_ctx).await;
        assert_eq!(cluster.running_tasks(), 2);

        let mut shrunk = cluster.get_batch("default", "batch-x").expect("batch");
        shrunk.spec.replicas = 1;
        cluster.seed_batch(shrunk);
        reconcile_batch(&cluster, &batch_ctx).await;

        assert_eq!(cluster.running_tasks(), 1);
        let pool = cluster.get_pool_object("default", "pool-a").expect("pool");
        let table = pool.allocation_table().expect("table");
        assert_eq!(table.get("batch-x").map(Vec::len), Some(1));
    }

    /// Story: a BestEffort batch wants 2 but the pool tops out at 1. The
    /// single claimed unit runs its task and the batch reports Ready with
    /// the shortfall visible as allocated < desired.
    #[tokio::test]
    async fn story_best_effort_partial_batch_still_runs() {
        let cluster = Arc::new(FakeCluster::new());
        let (pool_ctx, batch_ctx) = contexts(&cluster);

        cluster.seed_pool(
            "default",
            "pool-a",
            CapacitySpec {
                buffer_min: 1,
                buffer_max: 1,
                pool_min: 0,
                pool_max: 1,
            },
        );
        reconcile_pool(&cluster, &pool_ctx).await;
        cluster.make_all_ready();

        let mut batch = scenario_batch();
        batch.spec.allocation_policy = AllocationPolicy::BestEffort;
        cluster.seed_batch(batch);

        reconcile_batch(&cluster, &batch_ctx).await;
        reconcile_batch(&cluster, &batch_ctx).await;

        let settled = cluster.get_batch("default", "batch-x").expect("batch");
        let status = settled.status.clone().expect("status");
        assert_eq!(status.phase, BatchPhase::Ready);
        assert_eq!(status.desired, 2);
        assert_eq!(status.allocated, 1);
        assert_eq!(cluster.running_tasks(), 1);
    }
}
