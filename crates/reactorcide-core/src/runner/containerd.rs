//! containerd-via-CLI `ContainerRunner` variant (spec §9: "containerd has no
//! first-class stable Rust client; shell out to the `ctr`/`nerdctl` CLI").

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use super::{security_profile_for, ContainerRunner, LogReader};
use crate::error::{Error, Result};
use crate::model::JobConfig;

pub struct ContainerdRunner {
    /// Path to the `ctr`/`nerdctl`-compatible binary.
    cli_binary: String,
    namespace: String,
}

impl ContainerdRunner {
    pub fn new(cli_binary: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self { cli_binary: cli_binary.into(), namespace: namespace.into() }
    }

    fn container_name(job_id: &str) -> String {
        format!("reactorcide-{}", job_id)
    }
}

#[async_trait]
impl ContainerRunner for ContainerdRunner {
    async fn spawn_job(&self, config: &JobConfig) -> Result<String> {
        config.validate()?;
        let profile = security_profile_for(&config.capabilities);
        let name = Self::container_name(&config.job_id);

        let mut args: Vec<String> = vec![
            "-n".into(), self.namespace.clone(),
            "run".into(), "-d".into(),
            "--rm".into(),
            "--cwd".into(), config.working_dir.clone(),
            "--mount".into(), format!("type=bind,src={},dst=/job,options=rbind:rw", config.workspace_dir),
        ];

        if let Some(source_dir) = &config.source_dir {
            args.push("--mount".into());
            args.push(format!("type=bind,src={},dst=/job/src,options=rbind:rw", source_dir));
        }

        for (k, v) in &config.env {
            args.push("--env".into());
            args.push(format!("{}={}", k, v));
        }

        if profile.privileged {
            args.push("--privileged".into());
        } else {
            args.push("--user".into());
            args.push(format!("{}:{}", profile.run_as_uid, profile.run_as_gid));
        }

        args.push(config.image.clone());
        args.push(name.clone());
        args.extend(config.command.iter().cloned());

        let output = Command::new(&self.cli_binary)
            .args(&args)
            .output()
            .await
            .map_err(|e| Error::ContainerRuntime(format!("failed to invoke {}: {}", self.cli_binary, e)))?;

        if !output.status.success() {
            return Err(Error::ContainerRuntime(format!(
                "{} run failed: {}",
                self.cli_binary,
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        info!(container_name = %name, job_id = %config.job_id, "spawned containerd task");
        Ok(name)
    }

    async fn stream_logs(&self, container_id: &str) -> Result<(LogReader, LogReader)> {
        let mut child = Command::new(&self.cli_binary)
            .args(["-n", &self.namespace, "task", "attach", container_id])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::ContainerRuntime(e.to_string()))?;

        let stdout = child.stdout.take().ok_or_else(|| Error::ContainerRuntime("no stdout handle".into()))?;
        let stderr = child.stderr.take().ok_or_else(|| Error::ContainerRuntime("no stderr handle".into()))?;

        // Detach — the child outlives this call; its stdio handles are the
        // readers we return. Best-effort: leaked on cleanup failure.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });

        Ok((Box::new(stdout) as LogReader, Box::new(stderr) as LogReader))
    }

    async fn wait_for_completion(
        &self,
        container_id: &str,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<i32> {
        let wait = Command::new(&self.cli_binary)
            .args(["-n", &self.namespace, "task", "wait", container_id])
            .output();

        tokio::select! {
            result = wait => {
                let output = result.map_err(|e| Error::ContainerRuntime(e.to_string()))?;
                let text = String::from_utf8_lossy(&output.stdout);
                text.trim()
                    .parse::<i32>()
                    .map_err(|_| Error::ContainerRuntime(format!("unparseable exit status: {}", text)))
            }
            _ = cancel.cancelled() => Err(Error::Cancelled),
        }
    }

    async fn cleanup(&self, container_id: &str) -> Result<()> {
        let _ = Command::new(&self.cli_binary)
            .args(["-n", &self.namespace, "task", "kill", "-s", "SIGKILL", container_id])
            .output()
            .await;

        let result = Command::new(&self.cli_binary)
            .args(["-n", &self.namespace, "container", "rm", container_id])
            .output()
            .await;

        if let Err(e) = result {
            warn!(container_id, error = %e, "containerd cleanup failed");
        }
        Ok(())
    }
}
