//! sandbox-operator entrypoint: runs the pool and batch controllers
//! against a cluster, or dumps the CRDs for offline installation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use futures::StreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::{watcher, Controller};
use kube::{Client, CustomResourceExt};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sandbox_operator::allocator::KubePoolStore;
use sandbox_operator::controller::{batch, pool, BatchConfig, BatchContext, KubeBatchClient, PoolContext};
use sandbox_operator::crd::{BatchSandbox, SandboxPool};
use sandbox_operator::executor::ExecdClient;
use sandbox_operator::runtime::PodUnitRuntime;
use sandbox_operator::strategy::DefaultTaskSchedulingStrategy;
use sandbox_operator::{DEFAULT_EXECD_PORT, FIELD_MANAGER};

/// Watch streams are re-established on this cadence so a silently dropped
/// connection never stalls reconciliation for long.
const WATCH_TIMEOUT_SECS: u32 = 25;

#[derive(Parser)]
#[command(
    name = "sandbox-operator",
    about = "Controller for pooled, ephemeral execution sandboxes"
)]
struct Cli {
    /// Print the CustomResourceDefinitions as YAML and exit
    #[arg(long)]
    crd: bool,

    /// Watch a single namespace instead of the whole cluster
    #[arg(long, env = "SANDBOX_NAMESPACE")]
    namespace: Option<String>,

    /// Skip applying the CRDs at startup
    #[arg(long)]
    skip_crd_install: bool,

    /// Image providing the task-executor binary installed into each unit
    #[arg(long, env = "SANDBOX_EXECD_IMAGE", default_value = "sandbox-execd:latest")]
    execd_image: String,

    /// Port the in-unit task executor listens on
    #[arg(long, env = "SANDBOX_EXECD_PORT", default_value_t = DEFAULT_EXECD_PORT)]
    execd_port: u16,

    /// Allocation attempts against a starved pool before a batch is
    /// marked Degraded
    #[arg(long, default_value_t = 5)]
    claim_retry_budget: u32,

    /// Seconds after deletion during which a failing task stop still
    /// blocks teardown; past this the release is forced
    #[arg(long, default_value_t = 60)]
    teardown_grace_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if cli.crd {
        print!("{}", serde_yaml::to_string(&SandboxPool::crd())?);
        println!("---");
        print!("{}", serde_yaml::to_string(&BatchSandbox::crd())?);
        return Ok(());
    }

    let client = Client::try_default()
        .await
        .context("building Kubernetes client")?;

    if !cli.skip_crd_install {
        install_crds(&client).await?;
    }

    let pool_ctx = Arc::new(PoolContext {
        store: Arc::new(KubePoolStore::new(client.clone())),
        runtime: Arc::new(PodUnitRuntime::new(client.clone(), cli.execd_image.clone())),
    });
    let batch_ctx = Arc::new(BatchContext {
        batches: Arc::new(KubeBatchClient::new(client.clone())),
        pools: Arc::new(KubePoolStore::new(client.clone())),
        runtime: Arc::new(PodUnitRuntime::new(client.clone(), cli.execd_image.clone())),
        executor: Arc::new(ExecdClient::new(cli.execd_port)),
        strategy: Arc::new(DefaultTaskSchedulingStrategy),
        config: BatchConfig {
            claim_retry_budget: cli.claim_retry_budget,
            teardown_grace: Duration::from_secs(cli.teardown_grace_secs),
        },
    });

    let (pools_api, batches_api): (Api<SandboxPool>, Api<BatchSandbox>) = match &cli.namespace {
        Some(ns) => (
            Api::namespaced(client.clone(), ns),
            Api::namespaced(client.clone(), ns),
        ),
        None => (Api::all(client.clone()), Api::all(client.clone())),
    };
    let watch = watcher::Config::default().timeout(WATCH_TIMEOUT_SECS);

    info!(
        namespace = cli.namespace.as_deref().unwrap_or("<all>"),
        "starting controllers"
    );

    let pool_controller = Controller::new(pools_api, watch.clone())
        .shutdown_on_signal()
        .run(pool::reconcile, pool::error_policy, pool_ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(pool = %obj, "reconciled"),
                Err(e) => warn!(error = %e, "pool reconcile error"),
            }
        });

    let batch_controller = Controller::new(batches_api, watch)
        .shutdown_on_signal()
        .run(batch::reconcile, batch::error_policy, batch_ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(batch = %obj, "reconciled"),
                Err(e) => warn!(error = %e, "batch reconcile error"),
            }
        });

    tokio::join!(pool_controller, batch_controller);
    info!("controllers stopped");
    Ok(())
}

/// Apply both CRDs with server-side apply so the operator can run against
/// a fresh cluster without a separate install step.
async fn install_crds(client: &Client) -> anyhow::Result<()> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    for crd in [SandboxPool::crd(), BatchSandbox::crd()] {
        let name = crd.metadata.name.clone().unwrap_or_default();
        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&crd),
        )
        .await
        .with_context(|| format!("applying CRD {name}"))?;
        info!(crd = %name, "applied CRD");
    }
    Ok(())
}
