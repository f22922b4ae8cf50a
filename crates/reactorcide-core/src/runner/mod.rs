//! `ContainerRunner`: launches a container with workspace mount, env,
//! capabilities, resource limits; exposes stdout/stderr streams; waits for
//! exit; cleans up. Three variants per spec §9's "interface polymorphism via
//! a single variant type" redesign flag: `docker` (bollard), `containerd`
//! (CLI shell-out), `kubernetes` (kube + k8s-openapi).

pub mod containerd;
pub mod docker;
pub mod kubernetes;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::error::Result;
use crate::model::{Capability, JobConfig};

pub const LABEL_JOB_ID: &str = "reactorcide.job_id";
pub const LABEL_QUEUE: &str = "reactorcide.queue";
pub const LABEL_COMPONENT: &str = "reactorcide.component";
pub const COMPONENT_VALUE: &str = "job-container";

pub fn labels_for(config: &JobConfig) -> Vec<(String, String)> {
    vec![
        (LABEL_JOB_ID.to_string(), config.job_id.clone()),
        (LABEL_QUEUE.to_string(), config.queue_name.clone()),
        (LABEL_COMPONENT.to_string(), COMPONENT_VALUE.to_string()),
    ]
}

/// `docker` capability ⇒ privileged + root. `gpu` ⇒ reserved, accepted with
/// a warning, no-op. Absence of any capability ⇒ non-root UID/GID 1001.
/// Unknown capabilities are warned about and ignored by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityProfile {
    pub privileged: bool,
    pub run_as_uid: u32,
    pub run_as_gid: u32,
}

pub fn security_profile_for(capabilities: &std::collections::HashSet<Capability>) -> SecurityProfile {
    if capabilities.contains(&Capability::Docker) {
        SecurityProfile { privileged: true, run_as_uid: 0, run_as_gid: 0 }
    } else {
        SecurityProfile { privileged: false, run_as_uid: 1001, run_as_gid: 1001 }
    }
}

pub type LogReader = Box<dyn AsyncRead + Unpin + Send>;

#[async_trait]
pub trait ContainerRunner: Send + Sync {
    /// Validates `config`; fails with `ConfigInvalid` when any of
    /// `{image, command (non-empty), workspace_dir, job_id}` is missing.
    async fn spawn_job(&self, config: &JobConfig) -> Result<String>;

    /// Two independent readable byte streams for stdout/stderr. Closed when
    /// the corresponding container stream reaches EOF; subsequent reads
    /// return EOF cleanly.
    async fn stream_logs(&self, container_id: &str) -> Result<(LogReader, LogReader)>;

    /// Blocks until exit; returns the process exit code; returns
    /// `Error::Cancelled` if the context is cancelled first.
    async fn wait_for_completion(
        &self,
        container_id: &str,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<i32>;

    /// Forcibly removes the container and closes any held streams.
    /// Idempotent; never errors for "already gone".
    async fn cleanup(&self, container_id: &str) -> Result<()>;
}

/// Small factory that probes the environment: presence of in-cluster
/// Kubernetes config ⇒ kubernetes; otherwise docker (spec §9).
pub fn probe_auto_runner_kind() -> &'static str {
    if std::env::var("KUBERNETES_SERVICE_HOST").is_ok() {
        "kubernetes"
    } else {
        "docker"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docker_capability_runs_privileged_root() {
        let mut caps = std::collections::HashSet::new();
        caps.insert(Capability::Docker);
        let profile = security_profile_for(&caps);
        assert!(profile.privileged);
        assert_eq!(profile.run_as_uid, 0);
    }

    #[test]
    fn no_capabilities_runs_nonroot_1001() {
        let caps = std::collections::HashSet::new();
        let profile = security_profile_for(&caps);
        assert!(!profile.privileged);
        assert_eq!(profile.run_as_uid, 1001);
        assert_eq!(profile.run_as_gid, 1001);
    }
}
