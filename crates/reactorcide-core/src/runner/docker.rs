//! Docker-daemon `ContainerRunner` variant, backed by `bollard` (grounded on
//! `bollard` usage in `other_examples/manifests/aptos-labs-aptos-core` and
//! `other_examples/manifests/CortexLM-dataforge`).

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, LogsOptions, RemoveContainerOptions,
    WaitContainerOptions,
};
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use tokio::io::{AsyncRead, ReadBuf};
use tracing::{info, warn};

use super::{labels_for, security_profile_for, ContainerRunner, LogReader};
use crate::error::{Error, Result};
use crate::model::{parse_memory_limit, JobConfig};

pub struct DockerRunner {
    client: Docker,
}

impl DockerRunner {
    pub fn connect(socket_path: Option<&str>) -> Result<Self> {
        let client = match socket_path {
            Some(path) => Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| Error::config_invalid(format!("docker connect failed: {}", e)))?,
            None => Docker::connect_with_local_defaults()
                .map_err(|e| Error::config_invalid(format!("docker connect failed: {}", e)))?,
        };
        Ok(Self { client })
    }

    fn host_config(config: &JobConfig) -> HostConfig {
        let profile = security_profile_for(&config.capabilities);

        let mut binds = vec![format!("{}:/job", config.workspace_dir)];
        if let Some(source_dir) = &config.source_dir {
            binds.push(format!("{}:/job/src", source_dir));
        }

        HostConfig {
            binds: Some(binds),
            privileged: Some(profile.privileged),
            memory: config.memory_limit.as_deref().and_then(parse_memory_limit).map(|b| b as i64),
            nano_cpus: config
                .cpu_limit
                .as_deref()
                .and_then(|s| s.parse::<f64>().ok())
                .map(|cpu| (cpu * 1_000_000_000.0) as i64),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerRunner for DockerRunner {
    async fn spawn_job(&self, config: &JobConfig) -> Result<String> {
        config.validate()?;

        let profile = security_profile_for(&config.capabilities);
        let labels: HashMap<String, String> = labels_for(config).into_iter().collect();

        let env: Vec<String> = config.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        let user = if profile.privileged {
            None
        } else {
            Some(format!("{}:{}", profile.run_as_uid, profile.run_as_gid))
        };

        let container_config = ContainerConfig {
            image: Some(config.image.clone()),
            cmd: Some(config.command.clone()),
            env: Some(env),
            working_dir: Some(config.working_dir.clone()),
            labels: Some(labels),
            user,
            host_config: Some(Self::host_config(config)),
            ..Default::default()
        };

        let name = format!("reactorcide-{}", config.job_id);
        let created = self
            .client
            .create_container(Some(CreateContainerOptions { name: name.as_str(), platform: None }), container_config)
            .await
            .map_err(|e| Error::ContainerRuntime(e.to_string()))?;

        self.client
            .start_container::<String>(&created.id, None)
            .await
            .map_err(|e| Error::ContainerRuntime(e.to_string()))?;

        info!(container_id = %created.id, job_id = %config.job_id, "spawned docker container");
        Ok(created.id)
    }

    async fn stream_logs(&self, container_id: &str) -> Result<(LogReader, LogReader)> {
        let stdout_stream = self.client.logs(
            container_id,
            Some(LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: false,
                ..Default::default()
            }),
        );
        let stderr_stream = self.client.logs(
            container_id,
            Some(LogsOptions::<String> {
                follow: true,
                stdout: false,
                stderr: true,
                ..Default::default()
            }),
        );

        Ok((
            Box::new(LogStreamReader::new(stdout_stream)),
            Box::new(LogStreamReader::new(stderr_stream)),
        ))
    }

    async fn wait_for_completion(
        &self,
        container_id: &str,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<i32> {
        let mut wait_stream = self.client.wait_container(container_id, None::<WaitContainerOptions<String>>);

        tokio::select! {
            next = wait_stream.next() => {
                match next {
                    Some(Ok(response)) => Ok(response.status_code as i32),
                    Some(Err(e)) => Err(Error::ContainerRuntime(e.to_string())),
                    None => Err(Error::ContainerRuntime("wait stream closed unexpectedly".into())),
                }
            }
            _ = cancel.cancelled() => Err(Error::Cancelled),
        }
    }

    async fn cleanup(&self, container_id: &str) -> Result<()> {
        let result = self
            .client
            .remove_container(
                container_id,
                Some(RemoveContainerOptions { force: true, v: true, ..Default::default() }),
            )
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => {
                warn!(container_id, error = %e, "docker cleanup failed");
                Ok(())
            }
        }
    }
}

/// Adapts bollard's `LogOutput` stream into `AsyncRead` so it can feed the
/// same `LogShipper` line-scanning loop used by every runner variant.
struct LogStreamReader {
    inner: std::pin::Pin<Box<dyn futures::Stream<Item = std::result::Result<bollard::container::LogOutput, bollard::errors::Error>> + Send>>,
    pending: std::collections::VecDeque<u8>,
}

impl LogStreamReader {
    fn new(
        stream: impl futures::Stream<Item = std::result::Result<bollard::container::LogOutput, bollard::errors::Error>> + Send + 'static,
    ) -> Self {
        Self { inner: Box::pin(stream), pending: std::collections::VecDeque::new() }
    }
}

impl AsyncRead for LogStreamReader {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        use std::task::Poll;

        if self.pending.is_empty() {
            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    self.pending.extend(chunk.into_bytes());
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Err(std::io::Error::new(std::io::ErrorKind::Other, e)));
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }

        let to_copy = buf.remaining().min(self.pending.len());
        for _ in 0..to_copy {
            if let Some(byte) = self.pending.pop_front() {
                buf.put_slice(&[byte]);
            }
        }
        Poll::Ready(Ok(()))
    }
}
