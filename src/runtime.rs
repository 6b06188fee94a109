//! Container-runtime adapter boundary.
//!
//! The operator treats units as opaque allocatable resources behind the
//! [`UnitRuntime`] trait. The production implementation maps units to Pods;
//! per the system boundary, pod internals (execd bootstrap, probes) live
//! entirely on this side of the trait and are invisible to the controllers.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, Pod, PodSpec, ResourceRequirements, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams};
use kube::Client;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::crd::UnitTemplateSpec;
use crate::{Error, Result};

/// Mount path of the shared volume carrying the execd binary
const EXECD_MOUNT_PATH: &str = "/opt/sandbox/execd";

/// Name of the shared volume carrying the execd binary
const EXECD_VOLUME: &str = "sandbox-bin";

/// One allocatable compute unit as observed from the runtime
#[derive(Clone, Debug, PartialEq)]
pub struct Unit {
    /// Unit name (pod name in the Kubernetes runtime)
    pub name: String,
    /// The unit passes its readiness checks and can accept tasks
    pub ready: bool,
    /// The unit exceeded its retry budget and must never be claimed
    pub failed: bool,
    /// Routable address of the unit, once assigned
    pub address: Option<String>,
}

/// Operations the controllers need from a container runtime.
///
/// Implementations must be safe to call repeatedly with the same arguments:
/// reconciliation retries everything.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait UnitRuntime: Send + Sync {
    /// Create a unit from the template, labeled so `list_units` finds it.
    /// Creating a name that already exists is a conflict, not success.
    async fn create_unit(
        &self,
        namespace: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
        template: &UnitTemplateSpec,
    ) -> Result<Unit>;

    /// Destroy a unit. Destroying an already-gone unit is a no-op success.
    async fn destroy_unit(&self, namespace: &str, name: &str) -> Result<()>;

    /// List units carrying the given label, with live readiness/failure
    /// state. This is the source the controllers derive all counts from.
    async fn list_units(
        &self,
        namespace: &str,
        label_key: &str,
        label_value: &str,
    ) -> Result<Vec<Unit>>;
}

/// Production runtime mapping units onto Pods.
///
/// Every unit pod gets the execd task-executor bootstrap: an init container
/// copies the execd binary onto a shared emptyDir, the main container's
/// entrypoint is wrapped to start it, and the pod shares one process
/// namespace so execd can run and signal task processes.
pub struct PodUnitRuntime {
    client: Client,
    execd_image: String,
}

impl PodUnitRuntime {
    /// Create a runtime using the given client and execd sidecar image
    pub fn new(client: Client, execd_image: impl Into<String>) -> Self {
        Self {
            client,
            execd_image: execd_image.into(),
        }
    }

    fn build_pod(
        &self,
        namespace: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
        template: &UnitTemplateSpec,
    ) -> Pod {
        let containers = template
            .spec
            .containers
            .iter()
            .enumerate()
            .map(|(idx, c)| {
                let env: Vec<EnvVar> = c
                    .env
                    .iter()
                    .map(|(k, v)| EnvVar {
                        name: k.clone(),
                        value: Some(v.clone()),
                        ..Default::default()
                    })
                    .collect();

                let resources = if c.resources.is_empty() {
                    None
                } else {
                    let quantities: BTreeMap<String, Quantity> = c
                        .resources
                        .iter()
                        .map(|(k, v)| (k.clone(), Quantity(v.clone())))
                        .collect();
                    // requests = limits for guaranteed QoS
                    Some(ResourceRequirements {
                        limits: Some(quantities.clone()),
                        requests: Some(quantities),
                        ..Default::default()
                    })
                };

                // Only the first (main) container gets the execd bootstrap
                // wrapper; sidecars declared in the template run untouched.
                let command = if idx == 0 && !c.command.is_empty() {
                    let mut wrapped = vec![format!("{EXECD_MOUNT_PATH}/bootstrap.sh")];
                    wrapped.extend(c.command.iter().cloned());
                    Some(wrapped)
                } else if c.command.is_empty() {
                    None
                } else {
                    Some(c.command.clone())
                };

                Container {
                    name: c.name.clone(),
                    image: Some(c.image.clone()),
                    command,
                    args: if c.args.is_empty() {
                        None
                    } else {
                        Some(c.args.clone())
                    },
                    env: if env.is_empty() { None } else { Some(env) },
                    resources,
                    volume_mounts: Some(vec![VolumeMount {
                        name: EXECD_VOLUME.into(),
                        mount_path: EXECD_MOUNT_PATH.into(),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }
            })
            .collect();

        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                share_process_namespace: Some(template.spec.share_process_namespace),
                init_containers: Some(vec![self.execd_installer()]),
                containers,
                volumes: Some(vec![Volume {
                    name: EXECD_VOLUME.into(),
                    empty_dir: Some(EmptyDirVolumeSource::default()),
                    ..Default::default()
                }]),
                restart_policy: Some("Always".into()),
                ..Default::default()
            }),
            status: None,
        }
    }

    /// Init container that drops the execd binary and its bootstrap
    /// wrapper onto the shared volume
    fn execd_installer(&self) -> Container {
        let script = concat!(
            "cp ./execd /opt/sandbox/execd/execd && ",
            "chmod +x /opt/sandbox/execd/execd && ",
            "cat > /opt/sandbox/execd/bootstrap.sh << 'BOOTSTRAP_EOF'\n",
            "#!/bin/sh\n",
            "set -e\n",
            "/opt/sandbox/execd/execd >/tmp/execd.log 2>&1 &\n",
            "exec \"$@\"\n",
            "BOOTSTRAP_EOF\n",
            "chmod +x /opt/sandbox/execd/bootstrap.sh"
        );
        Container {
            name: "execd-installer".into(),
            image: Some(self.execd_image.clone()),
            command: Some(vec!["/bin/sh".into(), "-c".into()]),
            args: Some(vec![script.into()]),
            volume_mounts: Some(vec![VolumeMount {
                name: EXECD_VOLUME.into(),
                mount_path: EXECD_MOUNT_PATH.into(),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }

    fn unit_from_pod(pod: &Pod) -> Unit {
        let name = pod.metadata.name.clone().unwrap_or_default();
        let status = pod.status.as_ref();

        let ready = status
            .and_then(|s| s.conditions.as_ref())
            .map(|conds| {
                conds
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            })
            .unwrap_or(false);

        let failed = status
            .and_then(|s| s.phase.as_deref())
            .map(|p| p == "Failed")
            .unwrap_or(false);

        let address = status.and_then(|s| s.pod_ip.clone());

        Unit {
            name,
            ready,
            failed,
            address,
        }
    }
}

#[async_trait]
impl UnitRuntime for PodUnitRuntime {
    async fn create_unit(
        &self,
        namespace: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
        template: &UnitTemplateSpec,
    ) -> Result<Unit> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = self.build_pod(namespace, name, labels, template);

        info!(unit = %name, namespace = %namespace, "creating unit pod");
        let created = api.create(&PostParams::default(), &pod).await?;
        Ok(Self::unit_from_pod(&created))
    }

    async fn destroy_unit(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        info!(unit = %name, namespace = %namespace, "destroying unit pod");
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => {
                debug!(unit = %name, "unit already gone");
                Ok(())
            }
            Err(e) => Err(Error::Kube(e)),
        }
    }

    async fn list_units(
        &self,
        namespace: &str,
        label_key: &str,
        label_value: &str,
    ) -> Result<Vec<Unit>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&format!("{label_key}={label_value}"));
        let pods = api.list(&params).await?;
        Ok(pods.items.iter().map(Self::unit_from_pod).collect())
    }
}
