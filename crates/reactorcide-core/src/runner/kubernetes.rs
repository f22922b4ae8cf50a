//! Kubernetes-pods `ContainerRunner` variant, backed by `kube` +
//! `k8s-openapi` (grounded on those crates' use in
//! `other_examples/manifests/alfredjeanlab-oddjobs`, and pod-status
//! inspection patterns in
//! `other_examples/cc2ae14e_forkmeplease-engine__src-environment-action-deploy_job.rs.rs`).

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, LogParams, PostParams};
use kube::{Api, Client};
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tracing::{info, warn};

use super::{labels_for, security_profile_for, ContainerRunner, LogReader};
use crate::error::{Error, Result};
use crate::model::{parse_memory_limit, JobConfig};

/// Distinguished pod-level failure kinds, surfaced via error wrapping so
/// callers can detect them without string comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodStartupErrorKind {
    ImagePullBackOff,
    ErrImagePull,
    CreateContainerConfigError,
    CrashLoopBackOff,
}

impl PodStartupErrorKind {
    fn from_reason(reason: &str) -> Option<Self> {
        match reason {
            "ImagePullBackOff" => Some(Self::ImagePullBackOff),
            "ErrImagePull" => Some(Self::ErrImagePull),
            "CreateContainerConfigError" => Some(Self::CreateContainerConfigError),
            "CrashLoopBackOff" => Some(Self::CrashLoopBackOff),
            _ => None,
        }
    }
}

pub struct KubernetesRunner {
    client: Client,
    namespace: String,
}

impl KubernetesRunner {
    pub async fn connect(namespace: impl Into<String>) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::config_invalid(format!("kubernetes client init failed: {}", e)))?;
        Ok(Self { client, namespace: namespace.into() })
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pod_name(job_id: &str) -> String {
        format!("reactorcide-{}", job_id.to_lowercase())
    }

    /// Inspects container-status waiting reasons and surfaces a distinguished
    /// `PodStartupError` rather than a generic failure.
    async fn check_pod_startup_error(&self, pod_name: &str) -> Option<Error> {
        let pod = self.pods().get(pod_name).await.ok()?;
        let statuses = pod.status?.container_statuses?;
        for status in statuses {
            if let Some(waiting) = status.state.and_then(|s| s.waiting) {
                if let Some(reason) = waiting.reason.as_deref() {
                    if let Some(kind) = PodStartupErrorKind::from_reason(reason) {
                        return Some(Error::PodStartupError(format!("{:?}: {}", kind, waiting.message.unwrap_or_default())));
                    }
                }
            }
        }
        None
    }
}

#[async_trait]
impl ContainerRunner for KubernetesRunner {
    async fn spawn_job(&self, config: &JobConfig) -> Result<String> {
        config.validate()?;

        let profile = security_profile_for(&config.capabilities);
        let name = Self::pod_name(&config.job_id);
        let labels: BTreeMap<String, String> = labels_for(config).into_iter().collect();

        let env: Vec<k8s_openapi::api::core::v1::EnvVar> = config
            .env
            .iter()
            .map(|(k, v)| k8s_openapi::api::core::v1::EnvVar { name: k.clone(), value: Some(v.clone()), value_from: None })
            .collect();

        let resources = k8s_openapi::api::core::v1::ResourceRequirements {
            limits: Some(BTreeMap::from_iter(
                [
                    config.cpu_limit.as_ref().map(|c| ("cpu".to_string(), k8s_openapi::apimachinery::pkg::api::resource::Quantity(c.clone()))),
                    config.memory_limit.as_ref().and_then(|m| parse_memory_limit(m)).map(|b| ("memory".to_string(), k8s_openapi::apimachinery::pkg::api::resource::Quantity(b.to_string()))),
                ]
                .into_iter()
                .flatten(),
            )),
            ..Default::default()
        };

        let security_context = k8s_openapi::api::core::v1::SecurityContext {
            privileged: Some(profile.privileged),
            run_as_user: (!profile.privileged).then_some(profile.run_as_uid as i64),
            run_as_group: (!profile.privileged).then_some(profile.run_as_gid as i64),
            ..Default::default()
        };

        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(k8s_openapi::api::core::v1::PodSpec {
                restart_policy: Some("Never".to_string()),
                containers: vec![k8s_openapi::api::core::v1::Container {
                    name: "job".to_string(),
                    image: Some(config.image.clone()),
                    command: Some(config.command.clone()),
                    working_dir: Some(config.working_dir.clone()),
                    env: Some(env),
                    resources: Some(resources),
                    security_context: Some(security_context),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        };

        self.pods()
            .create(&PostParams::default(), &pod)
            .await
            .map_err(|e| Error::ContainerRuntime(e.to_string()))?;

        info!(pod = %name, job_id = %config.job_id, "created kubernetes pod");
        Ok(name)
    }

    async fn stream_logs(&self, container_id: &str) -> Result<(LogReader, LogReader)> {
        // Kubernetes multiplexes stdout/stderr into one pod log stream; the
        // second reader is empty, matching the "two independent streams"
        // contract with stderr simply never producing bytes here.
        let stream = self
            .pods()
            .log_stream(container_id, &LogParams { follow: true, ..Default::default() })
            .await
            .map_err(|e| Error::ContainerRuntime(e.to_string()))?
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));

        let stdout: LogReader = Box::new(stream.into_async_read().compat());
        let stderr: LogReader = Box::new(tokio::io::empty());
        Ok((stdout, stderr))
    }

    async fn wait_for_completion(
        &self,
        container_id: &str,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<i32> {
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            if let Some(startup_error) = self.check_pod_startup_error(container_id).await {
                return Err(startup_error);
            }

            let pod = self
                .pods()
                .get(container_id)
                .await
                .map_err(|e| Error::ContainerRuntime(e.to_string()))?;

            if let Some(status) = pod.status {
                match status.phase.as_deref() {
                    Some("Succeeded") => return Ok(0),
                    Some("Failed") => {
                        let exit_code = status
                            .container_statuses
                            .as_ref()
                            .and_then(|cs| cs.first())
                            .and_then(|cs| cs.state.as_ref())
                            .and_then(|s| s.terminated.as_ref())
                            .map(|t| t.exit_code)
                            .unwrap_or(1);
                        return Ok(exit_code);
                    }
                    _ => {}
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(2)) => {}
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }
    }

    async fn cleanup(&self, container_id: &str) -> Result<()> {
        match self.pods().delete(container_id, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => {
                warn!(pod = container_id, error = %e, "kubernetes cleanup failed");
                Ok(())
            }
        }
    }
}
