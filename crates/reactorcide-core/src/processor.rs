//! `JobProcessor`: orchestrates one job execution — validate, build config,
//! acquire workspace, spawn container, stream logs, wait, classify result,
//! return it (spec §4.7.2).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{instrument, warn};

use crate::config::SecretsStorageKind;
use crate::error::{Error, Result};
use crate::logshipper::{InMemoryObjectStore, LogShipper, LogStream, ObjectStore, SecretMasker};
use crate::model::{Job, JobConfig, SourceType};
use crate::retry::{classify_execution_error, retry_with_backoff, RetryConfig};
use crate::runner::ContainerRunner;

/// `(path, key) -> value | error` — the secrets manager's narrow interface
/// (only `Get(path, key) -> value` is consumed here).
#[async_trait::async_trait]
pub trait SecretsProvider: Send + Sync {
    async fn get(&self, path: &str, key: &str) -> Result<String>;
}

pub struct NoSecretsProvider;

#[async_trait::async_trait]
impl SecretsProvider for NoSecretsProvider {
    async fn get(&self, path: &str, key: &str) -> Result<String> {
        Err(Error::SecretUnresolvable(format!("no secrets provider configured ({}:{})", path, key)))
    }
}

/// `SecretsStorageKind::Local`: secrets are files on disk, one file per key,
/// under `{local_path}/{path}/{key}`. File contents are used verbatim save
/// for a single trailing newline, matching how mounted secret volumes are
/// usually populated.
pub struct LocalSecretsProvider {
    root: std::path::PathBuf,
}

impl LocalSecretsProvider {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait::async_trait]
impl SecretsProvider for LocalSecretsProvider {
    async fn get(&self, path: &str, key: &str) -> Result<String> {
        let file = self.root.join(path).join(key);
        let contents = tokio::fs::read_to_string(&file)
            .await
            .map_err(|e| Error::SecretUnresolvable(format!("{}:{} ({})", path, key, e)))?;
        Ok(contents.trim_end_matches('\n').to_string())
    }
}

/// `SecretsStorageKind::Database`: the relational secrets store lives outside
/// this core (spec §1 non-goal), so secrets are fetched over the same plain
/// JSON-over-HTTP convention `HttpJobStore`/`HttpTaskBrokerClient` use for
/// their own external stores. A user with no org encryption key provisioned
/// fails resolution per spec §4.7.2 step 6, surfaced here as a 404/422 from
/// the secrets endpoint folding to `SecretUnresolvable`.
pub struct DatabaseSecretsProvider {
    client: reqwest::Client,
    base_url: String,
}

impl DatabaseSecretsProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build secrets http client"),
            base_url: base_url.into(),
        }
    }
}

#[async_trait::async_trait]
impl SecretsProvider for DatabaseSecretsProvider {
    async fn get(&self, path: &str, key: &str) -> Result<String> {
        #[derive(serde::Deserialize)]
        struct SecretValue {
            value: String,
        }

        let url = format!("{}/secrets/{}/{}", self.base_url.trim_end_matches('/'), path, key);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::SecretUnresolvable(format!("{}:{} ({})", path, key, e)))?;

        if !response.status().is_success() {
            return Err(Error::SecretUnresolvable(format!("{}:{} (status {})", path, key, response.status())));
        }

        response
            .json::<SecretValue>()
            .await
            .map(|v| v.value)
            .map_err(|e| Error::SecretUnresolvable(format!("{}:{} ({})", path, key, e)))
    }
}

#[derive(Debug, Clone)]
pub struct JobResult {
    pub exit_code: i32,
    pub workspace_dir: String,
    pub logs_object_key: Option<String>,
    pub artifacts_object_key: Option<String>,
    pub duration: Duration,
    pub retry_count: u32,
}

pub struct ProcessorConfig {
    pub default_runner_image: String,
    pub secrets_storage: SecretsStorageKind,
    pub dry_run: bool,
    pub retry: RetryConfig,
}

pub struct JobProcessor {
    runner: Arc<dyn ContainerRunner>,
    object_store: Option<Arc<dyn ObjectStore>>,
    secrets: Arc<dyn SecretsProvider>,
    config: ProcessorConfig,
}

/// Ensures the container is removed even if a later step in this job's
/// execution returns early; runs detached since `Drop` cannot be async.
struct CleanupGuard {
    runner: Arc<dyn ContainerRunner>,
    container_id: String,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let runner = self.runner.clone();
        let container_id = std::mem::take(&mut self.container_id);
        tokio::spawn(async move {
            let _ = runner.cleanup(&container_id).await;
        });
    }
}

impl JobProcessor {
    pub fn new(
        runner: Arc<dyn ContainerRunner>,
        object_store: Option<Arc<dyn ObjectStore>>,
        secrets: Arc<dyn SecretsProvider>,
        config: ProcessorConfig,
    ) -> Self {
        Self { runner, object_store, secrets, config }
    }

    fn validate_job(job: &Job) -> Result<()> {
        if job.job_command.trim().is_empty() {
            return Err(Error::config_invalid("job_command is required"));
        }
        match job.source_type {
            Some(SourceType::Git) => {
                if job.source_url.as_deref().unwrap_or("").is_empty() {
                    return Err(Error::config_invalid("source_url is required for git source"));
                }
            }
            Some(SourceType::Copy) => {
                if job.source_path.as_deref().unwrap_or("").is_empty() {
                    return Err(Error::config_invalid("source_path is required for copy source"));
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn build_job_config(job: &Job, workspace_dir: &str, default_image: &str, resolved_env: HashMap<String, String>) -> JobConfig {
        let image = job
            .container_image
            .clone()
            .or_else(|| job.runner_image.clone())
            .unwrap_or_else(|| default_image.to_string());

        let mut env = resolved_env;
        env.insert("REACTORCIDE_JOB_ID".to_string(), job.job_id.clone());
        env.insert("REACTORCIDE_QUEUE".to_string(), job.queue_name.clone().unwrap_or_default());

        if let Some(source_url) = &job.source_url {
            env.insert("REACTORCIDE_SOURCE_URL".to_string(), source_url.clone());
        }
        if let Some(ci_source_url) = &job.ci_source_url {
            env.insert("REACTORCIDE_CI_SOURCE_URL".to_string(), ci_source_url.clone());
        }

        JobConfig {
            image,
            command: crate::jobspec::parse_command_with_prefix(None, &job.job_command),
            env,
            workspace_dir: workspace_dir.to_string(),
            working_dir: job.code_dir.clone().unwrap_or_else(|| "/job".to_string()),
            source_dir: None,
            capabilities: job.capabilities.clone(),
            timeout_seconds: job.timeout_seconds.unwrap_or(3600),
            cpu_limit: None,
            memory_limit: None,
            job_id: job.job_id.clone(),
            queue_name: job.queue_name.clone().unwrap_or_default(),
        }
    }

    /// Resolves `${env:...}` then `${secret:...}` references in `env`,
    /// seeding `masker` with every secret value encountered so log shipping
    /// redacts it. With secrets storage disabled, any remaining
    /// `${secret:...}` reference is an error rather than passed through.
    async fn resolve_secrets(&self, env: &mut HashMap<String, String>, masker: &mut SecretMasker) -> Result<()> {
        for value in env.values_mut() {
            *value = crate::jobspec::resolve_env_refs(value);
        }

        if self.config.secrets_storage == SecretsStorageKind::None {
            if env.values().any(|v| v.starts_with("${secret:")) {
                return Err(Error::SecretUnresolvable("secrets storage is disabled".into()));
            }
            return Ok(());
        }

        let mut secret_values = Vec::new();
        for value in env.values_mut() {
            if let Some((path, key)) = crate::jobspec::parse_secret_ref(value) {
                let secret = self.secrets.get(&path, &key).await?;
                secret_values.push(secret.clone());
                *value = secret;
            }
        }
        masker.register_many(secret_values);
        Ok(())
    }

    #[instrument(skip(self, job, heartbeat), fields(job_id = %job.job_id))]
    pub async fn process_job_with_context(
        &self,
        job: &Job,
        cancel: &tokio_util::sync::CancellationToken,
        heartbeat: Option<Arc<dyn Fn() + Send + Sync>>,
    ) -> Result<JobResult> {
        Self::validate_job(job)?;

        if self.config.dry_run {
            return Ok(JobResult {
                exit_code: 0,
                workspace_dir: String::new(),
                logs_object_key: None,
                artifacts_object_key: None,
                duration: Duration::ZERO,
                retry_count: 0,
            });
        }

        let mut masker = SecretMasker::new();
        for value in job.job_env_vars.values() {
            if let Some(s) = value.as_str() {
                masker.register(s);
            }
        }

        let workspace_dir = tempfile::Builder::new()
            .prefix(&format!("reactorcide-job-{}-", job.job_id))
            .tempdir()
            .map_err(|e| Error::WorkspaceSetup(e.to_string()))?;
        let workspace_path = workspace_dir.path().to_string_lossy().to_string();

        let started = Instant::now();
        let retry_cfg = self.config.retry;
        let last_attempt = std::sync::atomic::AtomicU32::new(0);

        let result = retry_with_backoff(cancel, &retry_cfg, "process_job", |attempt| {
            last_attempt.store(attempt, std::sync::atomic::Ordering::SeqCst);
            let workspace_path = workspace_path.clone();
            let masker = masker.clone();
            let heartbeat = heartbeat.clone();
            async move { self.execute_once(job, &workspace_path, masker, cancel, heartbeat).await }
        })
        .await;

        // `workspace_dir` removes the directory tree on drop; explicit here
        // since the happy path never otherwise touches this binding again.
        drop(workspace_dir);

        let retry_count = last_attempt.load(std::sync::atomic::Ordering::SeqCst);
        result.map(|(exit_code, logs_key)| JobResult {
            exit_code,
            workspace_dir: workspace_path.clone(),
            logs_object_key: logs_key,
            artifacts_object_key: None,
            duration: started.elapsed(),
            retry_count,
        })
    }

    async fn execute_once(
        &self,
        job: &Job,
        workspace_path: &str,
        mut masker: SecretMasker,
        cancel: &tokio_util::sync::CancellationToken,
        heartbeat: Option<Arc<dyn Fn() + Send + Sync>>,
    ) -> Result<(i32, Option<String>)> {
        let mut resolved_env: HashMap<String, String> = job
            .job_env_vars
            .iter()
            .map(|(k, v)| (k.clone(), v.as_str().map(|s| s.to_string()).unwrap_or_else(|| v.to_string())))
            .collect();
        self.resolve_secrets(&mut resolved_env, &mut masker).await?;

        let config = Self::build_job_config(job, workspace_path, &self.config.default_runner_image, resolved_env);
        config.validate()?;

        let container_id = self.runner.spawn_job(&config).await?;
        let _cleanup = CleanupGuard { runner: self.runner.clone(), container_id: container_id.clone() };

        let heartbeat_task = heartbeat.map(|hb| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(30));
                loop {
                    tokio::select! {
                        _ = interval.tick() => hb(),
                        _ = cancel.cancelled() => break,
                    }
                }
            })
        });

        let (stdout, stderr) = self.runner.stream_logs(&container_id).await?;

        let object_store = self
            .object_store
            .clone()
            .unwrap_or_else(|| Arc::new(InMemoryObjectStore::new()) as Arc<dyn ObjectStore>);

        let stdout_shipper = Arc::new(LogShipper::new(&job.job_id, LogStream::Stdout, object_store.clone(), masker.clone()));
        let stderr_shipper = Arc::new(LogShipper::new(&job.job_id, LogStream::Stderr, object_store, masker));

        let stdout_cancel = cancel.clone();
        let stderr_cancel = cancel.clone();
        let stdout_task = tokio::spawn(async move { stdout_shipper.stream_and_ship(stdout, LogStream::Stdout, stdout_cancel, |_, _| {}).await });
        let stderr_task = tokio::spawn(async move { stderr_shipper.stream_and_ship(stderr, LogStream::Stderr, stderr_cancel, |_, _| {}).await });

        let exit_code = self.runner.wait_for_completion(&container_id, cancel).await?;

        if let Some(task) = heartbeat_task {
            task.abort();
        }

        let stdout_result = stdout_task.await.map_err(|e| Error::other(e.to_string()))??;
        let _stderr_result = stderr_task.await.map_err(|e| Error::other(e.to_string()))??;

        if let Some(classified) = classify_execution_error(None, Some(exit_code)) {
            if classified.retryable {
                return Err(classified.error);
            }
            if exit_code != 0 {
                warn!(job_id = %job.job_id, exit_code, "job finished with non-retryable failure");
            }
        }

        Ok((exit_code, Some(stdout_result.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Capability, JobStatus};
    use async_trait::async_trait;
    use std::collections::HashSet;

    struct FakeRunner;

    #[async_trait]
    impl ContainerRunner for FakeRunner {
        async fn spawn_job(&self, _config: &JobConfig) -> Result<String> {
            Ok("fake-container".to_string())
        }

        async fn stream_logs(&self, _container_id: &str) -> Result<(crate::runner::LogReader, crate::runner::LogReader)> {
            Ok((Box::new(tokio::io::empty()), Box::new(tokio::io::empty())))
        }

        async fn wait_for_completion(&self, _container_id: &str, _cancel: &tokio_util::sync::CancellationToken) -> Result<i32> {
            Ok(0)
        }

        async fn cleanup(&self, _container_id: &str) -> Result<()> {
            Ok(())
        }
    }

    struct FailingRunner(i32);

    #[async_trait]
    impl ContainerRunner for FailingRunner {
        async fn spawn_job(&self, _config: &JobConfig) -> Result<String> {
            Ok("fake-container".to_string())
        }

        async fn stream_logs(&self, _container_id: &str) -> Result<(crate::runner::LogReader, crate::runner::LogReader)> {
            Ok((Box::new(tokio::io::empty()), Box::new(tokio::io::empty())))
        }

        async fn wait_for_completion(&self, _container_id: &str, _cancel: &tokio_util::sync::CancellationToken) -> Result<i32> {
            Ok(self.0)
        }

        async fn cleanup(&self, _container_id: &str) -> Result<()> {
            Ok(())
        }
    }

    fn sample_job() -> Job {
        Job {
            job_id: "j1".into(),
            user_id: "u1".into(),
            project_id: None,
            parent_job_id: None,
            source_type: None,
            source_url: None,
            source_ref: None,
            source_path: None,
            ci_source_type: None,
            ci_source_url: None,
            ci_source_ref: None,
            ci_source_path: None,
            runner_image: None,
            container_image: Some("alpine".into()),
            job_command: "echo hi".into(),
            code_dir: None,
            job_dir: None,
            job_env_vars: HashMap::new(),
            job_env_file: None,
            timeout_seconds: Some(60),
            priority: None,
            capabilities: HashSet::new(),
            status: JobStatus::Submitted,
            queue_name: Some("normal".into()),
            auto_target_state: None,
            corndogs_task_id: None,
            started_at: None,
            completed_at: None,
            exit_code: None,
            worker_id: None,
            retry_count: 0,
            last_error: None,
            logs_object_key: None,
            artifacts_object_key: None,
            notes: Value::Null,
            name: None,
            description: None,
        }
    }

    fn processor_with(runner: Arc<dyn ContainerRunner>) -> JobProcessor {
        JobProcessor::new(
            runner,
            None,
            Arc::new(NoSecretsProvider),
            ProcessorConfig {
                default_runner_image: "alpine".into(),
                secrets_storage: SecretsStorageKind::None,
                dry_run: false,
                retry: RetryConfig { max_retries: 0, ..RetryConfig::default() },
            },
        )
    }

    #[tokio::test]
    async fn validate_rejects_empty_command() {
        let mut job = sample_job();
        job.job_command = "".into();
        assert!(JobProcessor::validate_job(&job).is_err());
    }

    #[tokio::test]
    async fn validate_requires_source_url_for_git() {
        let mut job = sample_job();
        job.source_type = Some(SourceType::Git);
        assert!(JobProcessor::validate_job(&job).is_err());
        job.source_url = Some("https://example.com/repo.git".into());
        assert!(JobProcessor::validate_job(&job).is_ok());
    }

    #[tokio::test]
    async fn successful_run_returns_exit_code_zero() {
        let processor = processor_with(Arc::new(FakeRunner));
        let job = sample_job();
        let cancel = tokio_util::sync::CancellationToken::new();
        let result = processor.process_job_with_context(&job, &cancel, None).await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(result.logs_object_key.is_some());
    }

    #[tokio::test]
    async fn dry_run_short_circuits_with_synthetic_success() {
        let mut processor = processor_with(Arc::new(FakeRunner));
        processor.config.dry_run = true;
        let job = sample_job();
        let cancel = tokio_util::sync::CancellationToken::new();
        let result = processor.process_job_with_context(&job, &cancel, None).await.unwrap();
        assert_eq!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn secrets_disabled_rejects_secret_reference() {
        let processor = processor_with(Arc::new(FakeRunner));
        let mut job = sample_job();
        job.job_env_vars.insert("TOKEN".into(), Value::String("${secret:vault:token}".into()));
        let cancel = tokio_util::sync::CancellationToken::new();
        let result = processor.process_job_with_context(&job, &cancel, None).await;
        assert!(matches!(result, Err(Error::SecretUnresolvable(_))));
    }

    #[tokio::test]
    async fn non_retryable_exit_code_is_returned_not_retried() {
        let processor = processor_with(Arc::new(FailingRunner(126)));
        let job = sample_job();
        let cancel = tokio_util::sync::CancellationToken::new();
        let result = processor.process_job_with_context(&job, &cancel, None).await.unwrap();
        assert_eq!(result.exit_code, 126);
    }
}
