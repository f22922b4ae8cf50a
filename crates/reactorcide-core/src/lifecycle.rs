//! `LifecycleManager`: persists authoritative job state across restarts and
//! coordinates graceful shutdown under signal (spec §5). Grounded on the
//! teacher's `Worker` start/pause/stop state machine, generalised from one
//! worker's lifecycle to the whole pool's.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};

use crate::broker::{JobFilters, JobStore};
use crate::error::Result;
use crate::model::JobStatus;
use crate::worker::WorkerPool;

const SHUTDOWN_NOTE: &str = "terminated due to worker shutdown";

pub struct LifecycleManagerConfig {
    pub shutdown_timeout: Duration,
    pub cleanup_timeout: Duration,
}

impl Default for LifecycleManagerConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(60),
            cleanup_timeout: Duration::from_secs(30),
        }
    }
}

pub struct LifecycleManager {
    worker_id: String,
    store: Arc<dyn JobStore>,
    pool: Arc<WorkerPool>,
    config: LifecycleManagerConfig,
}

impl LifecycleManager {
    pub fn new(worker_id: String, store: Arc<dyn JobStore>, pool: Arc<WorkerPool>, config: LifecycleManagerConfig) -> Self {
        Self { worker_id, store, pool, config }
    }

    /// On startup: every `Job` with `status=running AND worker_id=self` is
    /// reset to `submitted`. A worker whose ID differs from a previous
    /// incarnation's recovers nothing here — the broker's own task timeout
    /// re-delivers those tasks instead.
    pub async fn recover_orphaned_jobs(&self) -> Result<u32> {
        let filters = JobFilters {
            status: Some(JobStatus::Running),
            worker_id: Some(self.worker_id.clone()),
            queue_name: None,
        };

        let orphaned = self.store.list_jobs(filters, u32::MAX, 0).await?;
        let mut recovered = 0u32;

        for mut job in orphaned {
            job.status = JobStatus::Submitted;
            job.started_at = None;
            job.completed_at = Some(Utc::now());
            append_note(&mut job.notes, "recovered_after_restart", Value::Bool(true));

            match self.store.update_job(job.clone()).await {
                Ok(_) => {
                    recovered += 1;
                    info!(job_id = %job.job_id, "recovered orphaned running job to submitted");
                }
                Err(e) => warn!(job_id = %job.job_id, error = %e, "failed to recover orphaned job"),
            }
        }

        Ok(recovered)
    }

    /// Implements the five-step shutdown sequence from spec §5: stop
    /// accepting new work, cancel in-flight contexts, wait for a graceful
    /// drain, force-fail whatever is still active past the deadline, then
    /// wait a further bounded period for detached cleanup tasks.
    pub async fn graceful_shutdown(&self) -> Result<()> {
        info!("beginning graceful shutdown");
        self.pool.stop().await;
        self.pool.cancel_all().await;

        let drained = self.wait_for_drain(self.config.shutdown_timeout).await;
        if !drained {
            warn!("shutdown_timeout elapsed with jobs still active, forcing cleanup");
            self.force_fail_remaining().await?;
        }

        tokio::time::sleep(self.config.cleanup_timeout).await;
        info!("graceful shutdown complete");
        Ok(())
    }

    async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.pool.active_job_ids().await.is_empty() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    async fn force_fail_remaining(&self) -> Result<()> {
        for job_id in self.pool.active_job_ids().await {
            let job = match self.store.get_job_by_id(&job_id).await {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "failed to load job for forced shutdown");
                    continue;
                }
            };

            let mut job = job;
            job.status = JobStatus::Failed;
            job.completed_at = Some(Utc::now());
            job.last_error = Some(SHUTDOWN_NOTE.to_string());
            append_note(&mut job.notes, "shutdown_reason", Value::String(SHUTDOWN_NOTE.to_string()));

            if let Err(e) = self.store.update_job(job).await {
                warn!(job_id = %job_id, error = %e, "failed to persist forced-shutdown job state");
            }
        }
        Ok(())
    }
}

fn append_note(notes: &mut Value, key: &str, value: Value) {
    if !notes.is_object() {
        *notes = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(map) = notes {
        map.insert(key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockTaskBrokerClient;
    use crate::model::Job;
    use crate::config::SecretsStorageKind;
    use crate::processor::{JobProcessor, NoSecretsProvider, ProcessorConfig};
    use crate::retry::RetryConfig;
    use crate::runner::{ContainerRunner, LogReader};
    use crate::trigger::TriggerProcessor;
    use crate::worker::{WorkerPool, WorkerPoolConfig};
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    struct InMemoryJobStore {
        jobs: Mutex<Vec<Job>>,
    }

    #[async_trait]
    impl JobStore for InMemoryJobStore {
        async fn get_job_by_id(&self, job_id: &str) -> Result<Option<Job>> {
            Ok(self.jobs.lock().unwrap().iter().find(|j| j.job_id == job_id).cloned())
        }

        async fn create_job(&self, job: Job) -> Result<Job> {
            self.jobs.lock().unwrap().push(job.clone());
            Ok(job)
        }

        async fn update_job(&self, job: Job) -> Result<Job> {
            let mut jobs = self.jobs.lock().unwrap();
            if let Some(existing) = jobs.iter_mut().find(|j| j.job_id == job.job_id) {
                *existing = job.clone();
            }
            Ok(job)
        }

        async fn list_jobs(&self, filters: JobFilters, _limit: u32, _offset: u32) -> Result<Vec<Job>> {
            Ok(self
                .jobs
                .lock()
                .unwrap()
                .iter()
                .filter(|j| filters.status.map_or(true, |s| j.status == s))
                .filter(|j| filters.worker_id.as_ref().map_or(true, |w| j.worker_id.as_deref() == Some(w.as_str())))
                .cloned()
                .collect())
        }

        async fn try_claim(&self, _job_id: &str, _expected_status: JobStatus, _worker_id: &str) -> Result<bool> {
            Ok(true)
        }
    }

    struct NoopRunner;

    #[async_trait]
    impl ContainerRunner for NoopRunner {
        async fn spawn_job(&self, _config: &crate::model::JobConfig) -> Result<String> {
            Ok("c".into())
        }
        async fn stream_logs(&self, _container_id: &str) -> Result<(LogReader, LogReader)> {
            Ok((Box::new(tokio::io::empty()), Box::new(tokio::io::empty())))
        }
        async fn wait_for_completion(&self, _container_id: &str, _cancel: &tokio_util::sync::CancellationToken) -> Result<i32> {
            Ok(0)
        }
        async fn cleanup(&self, _container_id: &str) -> Result<()> {
            Ok(())
        }
    }

    fn running_job(worker_id: &str) -> Job {
        Job {
            job_id: uuid::Uuid::new_v4().to_string(),
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
            timeout_seconds: None,
            priority: None,
            capabilities: HashSet::new(),
            status: JobStatus::Running,
            queue_name: Some("normal".into()),
            auto_target_state: None,
            corndogs_task_id: None,
            started_at: Some(Utc::now()),
            completed_at: None,
            exit_code: None,
            worker_id: Some(worker_id.to_string()),
            retry_count: 0,
            last_error: None,
            logs_object_key: None,
            artifacts_object_key: None,
            notes: Value::Null,
            name: None,
            description: None,
        }
    }

    fn build_pool(store: Arc<dyn JobStore>) -> Arc<WorkerPool> {
        let broker = Arc::new(MockTaskBrokerClient::new());
        let processor = Arc::new(JobProcessor::new(
            Arc::new(NoopRunner),
            None,
            Arc::new(NoSecretsProvider),
            ProcessorConfig {
                default_runner_image: "alpine".into(),
                secrets_storage: SecretsStorageKind::None,
                dry_run: true,
                retry: RetryConfig::default(),
            },
        ));
        let scheduler = Arc::new(crate::scheduler::PriorityScheduler::new(broker.clone()));
        let metrics = crate::metrics::Metrics::new(&prometheus::Registry::new()).unwrap();
        let trigger_processor = Arc::new(TriggerProcessor::new(store.clone(), scheduler, metrics.clone()));
        Arc::new(WorkerPool::new(
            WorkerPoolConfig {
                queue: "normal".into(),
                concurrency: 2,
                poll_interval: Duration::from_millis(50),
                heartbeat_extension_seconds: 30,
            },
            broker,
            store,
            processor,
            trigger_processor,
            metrics,
        ))
    }

    #[tokio::test]
    async fn recovers_only_jobs_owned_by_this_worker() {
        let store = Arc::new(InMemoryJobStore { jobs: Mutex::new(vec![running_job("worker-a"), running_job("worker-b")]) });
        let pool = build_pool(store.clone());
        let manager = LifecycleManager::new("worker-a".into(), store.clone(), pool, LifecycleManagerConfig::default());

        let recovered = manager.recover_orphaned_jobs().await.unwrap();
        assert_eq!(recovered, 1);

        let jobs = store.jobs.lock().unwrap();
        let a = jobs.iter().find(|j| j.worker_id.as_deref() == Some("worker-a")).unwrap();
        assert_eq!(a.status, JobStatus::Submitted);
        assert!(a.started_at.is_none());

        let b = jobs.iter().find(|j| j.worker_id.as_deref() == Some("worker-b")).unwrap();
        assert_eq!(b.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn graceful_shutdown_completes_with_no_active_jobs() {
        let store = Arc::new(InMemoryJobStore { jobs: Mutex::new(vec![]) });
        let pool = build_pool(store.clone());
        let manager = LifecycleManager::new(
            "worker-a".into(),
            store,
            pool,
            LifecycleManagerConfig { shutdown_timeout: Duration::from_millis(50), cleanup_timeout: Duration::from_millis(10) },
        );
        manager.graceful_shutdown().await.unwrap();
    }
}
