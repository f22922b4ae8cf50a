//! `WorkerPool`: N concurrent pollers pulling from the task broker,
//! claiming the matching `Job` row, running it through `JobProcessor`, and
//! fanning out triggers on success. Grounded on the teacher's
//! `jobs::worker::Worker` state/stats shape, generalised from one job queue
//! to broker polling plus optimistic claim (spec §4.7.1).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::broker::{states, JobStore, TaskBrokerClient};
use crate::error::Result;
use crate::metrics::Metrics;
use crate::model::JobStatus;
use crate::processor::JobProcessor;
use crate::trigger::TriggerProcessor;

pub type WorkerId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

pub struct WorkerPoolConfig {
    pub queue: String,
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub heartbeat_extension_seconds: u64,
}

pub struct WorkerPool {
    id: WorkerId,
    config: WorkerPoolConfig,
    broker: Arc<dyn TaskBrokerClient>,
    store: Arc<dyn JobStore>,
    processor: Arc<JobProcessor>,
    trigger_processor: Arc<TriggerProcessor>,
    metrics: Arc<Metrics>,
    state: Arc<RwLock<WorkerState>>,
    semaphore: Arc<Semaphore>,
    jobs_processed: AtomicU64,
    jobs_succeeded: AtomicU64,
    jobs_failed: AtomicU64,
    active_cancellations: Arc<tokio::sync::Mutex<HashMap<String, tokio_util::sync::CancellationToken>>>,
}

#[derive(Debug, Clone)]
pub struct WorkerPoolStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_active: usize,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        broker: Arc<dyn TaskBrokerClient>,
        store: Arc<dyn JobStore>,
        processor: Arc<JobProcessor>,
        trigger_processor: Arc<TriggerProcessor>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let concurrency = config.concurrency.max(1);
        Self {
            id: WorkerId::new_v4(),
            config,
            broker,
            store,
            processor,
            trigger_processor,
            metrics,
            state: Arc::new(RwLock::new(WorkerState::Starting)),
            semaphore: Arc::new(Semaphore::new(concurrency)),
            jobs_processed: AtomicU64::new(0),
            jobs_succeeded: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            active_cancellations: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Spawns `concurrency` poller tasks, each independently polling the
    /// broker with the same `WorkerId`, gated by one shared `Semaphore` so
    /// total in-flight executions never exceed `concurrency`.
    pub fn start(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let concurrency = self.semaphore.available_permits();
        self.metrics.workers_active.with_label_values(&[&self.config.queue]).set(concurrency as i64);
        let mut handles = Vec::with_capacity(concurrency);
        for poller_index in 0..concurrency {
            let pool = self.clone();
            handles.push(tokio::spawn(async move {
                pool.poll_loop(poller_index).await;
            }));
        }
        handles
    }

    pub async fn stop(&self) {
        *self.state.write().await = WorkerState::Stopping;
    }

    /// Cancels every in-flight job's token; used by the lifecycle manager
    /// during graceful shutdown.
    pub async fn cancel_all(&self) {
        let cancellations = self.active_cancellations.lock().await;
        for token in cancellations.values() {
            token.cancel();
        }
    }

    pub async fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            jobs_processed: self.jobs_processed.load(Ordering::SeqCst),
            jobs_succeeded: self.jobs_succeeded.load(Ordering::SeqCst),
            jobs_failed: self.jobs_failed.load(Ordering::SeqCst),
            jobs_active: self.active_cancellations.lock().await.len(),
        }
    }

    pub async fn active_job_ids(&self) -> Vec<String> {
        self.active_cancellations.lock().await.keys().cloned().collect()
    }

    async fn poll_loop(&self, poller_index: usize) {
        *self.state.write().await = WorkerState::Running;
        info!(worker_id = %self.id, poller_index, queue = %self.config.queue, "poller started");

        loop {
            if *self.state.read().await == WorkerState::Stopping {
                break;
            }

            let _permit = match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    tokio::time::sleep(self.config.poll_interval).await;
                    continue;
                }
            };

            match self.broker.get_next_task(&self.config.queue, states::SUBMITTED, None).await {
                Ok(Some(task)) => {
                    self.metrics.corndogs_task_polls_total.with_label_values(&[&self.config.queue, "ok"]).inc();
                    self.process_task(task).await;
                }
                Ok(None) => {
                    self.metrics.corndogs_task_polls_total.with_label_values(&[&self.config.queue, "empty"]).inc();
                    if poller_index == 0 {
                        self.sample_queue_depth().await;
                    }
                    drop(_permit);
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                Err(e) => {
                    self.metrics.corndogs_task_polls_total.with_label_values(&[&self.config.queue, "error"]).inc();
                    warn!(worker_id = %self.id, error = %e, "broker poll failed, backing off");
                    drop(_permit);
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }

        *self.state.write().await = WorkerState::Stopped;
        info!(worker_id = %self.id, poller_index, "poller stopped");
    }

    /// Best-effort `queue_depth{queue,status}` sample; broker errors are
    /// logged and otherwise ignored since this is observability, not control
    /// flow.
    async fn sample_queue_depth(&self) {
        match self.broker.get_task_state_counts(&self.config.queue).await {
            Ok((_total, by_state)) => {
                for (state, count) in by_state {
                    self.metrics
                        .queue_depth
                        .with_label_values(&[&self.config.queue, &state])
                        .set(count as i64);
                }
            }
            Err(e) => warn!(queue = %self.config.queue, error = %e, "failed to sample queue depth"),
        }
    }

    async fn process_task(&self, task: crate::model::Task) {
        let payload = match task.decode_payload() {
            Ok(p) => p,
            Err(e) => {
                error!(uuid = %task.uuid, error = %e, "undecodable task payload, marking failed");
                let _ = self.broker.update_task(&task.uuid, &task.current_state, states::FAILED, None).await;
                return;
            }
        };

        let job = match self.store.get_job_by_id(&payload.job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                error!(job_id = %payload.job_id, "task references unknown job, marking failed");
                let _ = self.broker.update_task(&task.uuid, &task.current_state, states::FAILED, None).await;
                return;
            }
            Err(e) => {
                error!(job_id = %payload.job_id, error = %e, "job lookup failed");
                return;
            }
        };

        match self.store.try_claim(&job.job_id, JobStatus::Submitted, &self.id.to_string()).await {
            Ok(true) => {}
            Ok(false) => {
                info!(job_id = %job.job_id, "job already claimed by another worker, skipping");
                return;
            }
            Err(e) => {
                error!(job_id = %job.job_id, error = %e, "claim failed");
                return;
            }
        }

        if let Err(e) = self.broker.update_task(&task.uuid, &task.current_state, states::PROCESSING, None).await {
            warn!(job_id = %job.job_id, error = %e, "failed to mark task processing, continuing anyway");
        }

        let cancel = tokio_util::sync::CancellationToken::new();
        self.active_cancellations.lock().await.insert(job.job_id.clone(), cancel.clone());
        self.metrics
            .worker_jobs_active
            .with_label_values(&[&self.id.to_string()])
            .set(self.active_cancellations.lock().await.len() as i64);

        let broker = self.broker.clone();
        let heartbeat_uuid = task.uuid.clone();
        let heartbeat_extension = self.config.heartbeat_extension_seconds;
        let heartbeat_fn: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
            let broker = broker.clone();
            let uuid = heartbeat_uuid.clone();
            tokio::spawn(async move {
                let _ = broker.send_heartbeat(&uuid, states::PROCESSING, heartbeat_extension).await;
            });
        });

        let call_started = Instant::now();
        let result = self.processor.process_job_with_context(&job, &cancel, Some(heartbeat_fn)).await;
        self.active_cancellations.lock().await.remove(&job.job_id);
        self.metrics
            .worker_jobs_active
            .with_label_values(&[&self.id.to_string()])
            .set(self.active_cancellations.lock().await.len() as i64);
        self.jobs_processed.fetch_add(1, Ordering::SeqCst);

        let mut job = job;
        let queue = job.queue_name.clone().unwrap_or_default();
        let worker_id = self.id.to_string();

        match result {
            Ok(job_result) => {
                job.exit_code = Some(job_result.exit_code);
                job.completed_at = Some(Utc::now());
                job.logs_object_key = job_result.logs_object_key.clone();
                job.artifacts_object_key = job_result.artifacts_object_key.clone();

                let status_label = if job_result.exit_code == 0 {
                    self.jobs_succeeded.fetch_add(1, Ordering::SeqCst);
                    job.status = JobStatus::Completed;
                    let _ = self.broker.complete_task(&task.uuid, states::PROCESSING).await;
                    if let Err(e) = self.trigger_processor.process_triggers(&job, &job_result.workspace_dir).await {
                        warn!(job_id = %job.job_id, error = %e, "trigger processing failed");
                    }
                    "completed"
                } else {
                    self.jobs_failed.fetch_add(1, Ordering::SeqCst);
                    job.status = JobStatus::Failed;
                    job.last_error = Some(format!("job exited with code {}", job_result.exit_code));
                    let _ = self.broker.update_task(&task.uuid, states::PROCESSING, states::FAILED, None).await;
                    "failed"
                };

                self.metrics.jobs_processed_total.with_label_values(&[&queue, status_label, &worker_id]).inc();
                self.metrics
                    .job_duration_seconds
                    .with_label_values(&[&queue, status_label])
                    .observe(job_result.duration.as_secs_f64());
                if job_result.retry_count > 0 {
                    job.retry_count = job_result.retry_count;
                    self.metrics
                        .job_retries_total
                        .with_label_values(&[&queue, &worker_id])
                        .inc_by(job_result.retry_count as u64);
                }

                info!(job_id = %job.job_id, exit_code = job_result.exit_code, "job finished");
            }
            Err(e) => {
                self.jobs_failed.fetch_add(1, Ordering::SeqCst);
                error!(job_id = %job.job_id, error = %e, category = e.category(), "job execution failed");
                let _ = self.broker.update_task(&task.uuid, states::PROCESSING, states::FAILED, None).await;

                job.status = JobStatus::Failed;
                job.completed_at = Some(Utc::now());
                job.last_error = Some(e.to_string());

                self.metrics.jobs_processed_total.with_label_values(&[&queue, "failed", &worker_id]).inc();
                self.metrics
                    .job_duration_seconds
                    .with_label_values(&[&queue, "failed"])
                    .observe(call_started.elapsed().as_secs_f64());
                self.metrics
                    .job_errors_total
                    .with_label_values(&[&queue, e.category(), &e.retryable().to_string()])
                    .inc();
            }
        }

        if let Err(e) = self.store.update_job(job.clone()).await {
            error!(job_id = %job.job_id, error = %e, "failed to persist final job state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_start_at_zero() {
        // Smoke test for the plain struct shape; behavior is exercised
        // end-to-end by the processor/trigger/broker test suites.
        let stats = WorkerPoolStats {
            jobs_processed: 0,
            jobs_succeeded: 0,
            jobs_failed: 0,
            jobs_active: 0,
        };
        assert_eq!(stats.jobs_processed, 0);
    }
}
