//! Metrics sink: the named Prometheus series from spec §4.7.4. The teacher
//! keeps its own job metrics in Redis counters (`jobs::metrics::JobMetrics`);
//! that shape doesn't fit a pull-based Prometheus sink, so this is grounded
//! on the `prometheus` crate usage in the `golemcloud-golem` pack repo
//! instead, registered once into a process-wide `Registry`.

use std::sync::Arc;

use prometheus::{
    exponential_buckets, HistogramVec, IntCounterVec, IntGaugeVec, Registry,
};

pub struct Metrics {
    pub jobs_submitted_total: IntCounterVec,
    pub jobs_processed_total: IntCounterVec,
    pub job_duration_seconds: HistogramVec,
    pub job_retries_total: IntCounterVec,
    pub job_errors_total: IntCounterVec,
    pub queue_depth: IntGaugeVec,
    pub workers_active: IntGaugeVec,
    pub worker_jobs_active: IntGaugeVec,
    pub worker_cpu_usage_percent: IntGaugeVec,
    pub worker_memory_usage_bytes: IntGaugeVec,
    pub corndogs_task_submissions_total: IntCounterVec,
    pub corndogs_task_polls_total: IntCounterVec,
}

impl Metrics {
    /// Registers every series into `registry`. Buckets for
    /// `job_duration_seconds` span roughly 1 second to 8 hours, per spec.
    pub fn new(registry: &Registry) -> prometheus::Result<Arc<Self>> {
        let jobs_submitted_total = IntCounterVec::new(
            prometheus::Opts::new("reactorcide_jobs_submitted_total", "total jobs submitted"),
            &["queue", "source_type"],
        )?;
        let jobs_processed_total = IntCounterVec::new(
            prometheus::Opts::new("reactorcide_jobs_processed_total", "total jobs finished processing"),
            &["queue", "status", "worker_id"],
        )?;
        let job_duration_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new("reactorcide_job_duration_seconds", "job execution duration")
                .buckets(exponential_buckets(1.0, 2.0, 16)?),
            &["queue", "status"],
        )?;
        let job_retries_total = IntCounterVec::new(
            prometheus::Opts::new("reactorcide_job_retries_total", "total job retry attempts"),
            &["queue", "worker_id"],
        )?;
        let job_errors_total = IntCounterVec::new(
            prometheus::Opts::new("reactorcide_job_errors_total", "total job execution errors"),
            &["queue", "error_type", "retryable"],
        )?;
        let queue_depth = IntGaugeVec::new(
            prometheus::Opts::new("reactorcide_queue_depth", "current depth of each queue"),
            &["queue", "status"],
        )?;
        let workers_active = IntGaugeVec::new(
            prometheus::Opts::new("reactorcide_workers_active", "active worker pollers per queue"),
            &["queue"],
        )?;
        let worker_jobs_active = IntGaugeVec::new(
            prometheus::Opts::new("reactorcide_worker_jobs_active", "jobs currently executing per worker"),
            &["worker_id"],
        )?;
        let worker_cpu_usage_percent = IntGaugeVec::new(
            prometheus::Opts::new("reactorcide_worker_cpu_usage_percent", "worker process CPU usage"),
            &["worker_id"],
        )?;
        let worker_memory_usage_bytes = IntGaugeVec::new(
            prometheus::Opts::new("reactorcide_worker_memory_usage_bytes", "worker process resident memory"),
            &["worker_id"],
        )?;
        let corndogs_task_submissions_total = IntCounterVec::new(
            prometheus::Opts::new("reactorcide_corndogs_task_submissions_total", "task broker submissions"),
            &["queue", "result"],
        )?;
        let corndogs_task_polls_total = IntCounterVec::new(
            prometheus::Opts::new("reactorcide_corndogs_task_polls_total", "task broker polls"),
            &["queue", "result"],
        )?;

        registry.register(Box::new(jobs_submitted_total.clone()))?;
        registry.register(Box::new(jobs_processed_total.clone()))?;
        registry.register(Box::new(job_duration_seconds.clone()))?;
        registry.register(Box::new(job_retries_total.clone()))?;
        registry.register(Box::new(job_errors_total.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(workers_active.clone()))?;
        registry.register(Box::new(worker_jobs_active.clone()))?;
        registry.register(Box::new(worker_cpu_usage_percent.clone()))?;
        registry.register(Box::new(worker_memory_usage_bytes.clone()))?;
        registry.register(Box::new(corndogs_task_submissions_total.clone()))?;
        registry.register(Box::new(corndogs_task_polls_total.clone()))?;

        Ok(Arc::new(Self {
            jobs_submitted_total,
            jobs_processed_total,
            job_duration_seconds,
            job_retries_total,
            job_errors_total,
            queue_depth,
            workers_active,
            worker_jobs_active,
            worker_cpu_usage_percent,
            worker_memory_usage_bytes,
            corndogs_task_submissions_total,
            corndogs_task_polls_total,
        }))
    }

    pub fn record_worker_resources(&self, worker_id: &str, usage: &crate::monitor::WorkerResourceUsage) {
        self.worker_cpu_usage_percent
            .with_label_values(&[worker_id])
            .set(usage.cpu_usage_percent as i64);
        self.worker_memory_usage_bytes
            .with_label_values(&[worker_id])
            .set(usage.memory_usage_bytes as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_every_named_series_without_collision() {
        let registry = Registry::new();
        let metrics = Metrics::new(&registry).unwrap();
        metrics.jobs_submitted_total.with_label_values(&["normal", "git"]).inc();
        metrics.job_duration_seconds.with_label_values(&["normal", "completed"]).observe(12.5);
        assert!(!registry.gather().is_empty());
    }

    #[test]
    fn record_worker_resources_sets_gauges() {
        let registry = Registry::new();
        let metrics = Metrics::new(&registry).unwrap();
        let usage = crate::monitor::WorkerResourceUsage {
            cpu_usage_percent: 42.0,
            memory_usage_bytes: 1024,
            virtual_memory_bytes: 2048,
        };
        metrics.record_worker_resources("worker-a", &usage);
        assert_eq!(metrics.worker_cpu_usage_percent.with_label_values(&["worker-a"]).get(), 42);
    }
}
