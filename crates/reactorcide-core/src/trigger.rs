//! `TriggerProcessor`: after a job completes, reads
//! `{workspace}/triggers.json` and fans out child jobs (spec §4.7.3). A
//! missing trigger file is a silent no-op; one trigger's failure never
//! blocks its siblings, grounded on the teacher's per-item try/continue
//! shape in `jobs::worker`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};
use uuid::Uuid;

use crate::broker::JobStore;
use crate::error::{Error, Result};
use crate::jobspec::JobSpec;
use crate::metrics::Metrics;
use crate::model::{Job, JobStatus, SourceType};
use crate::scheduler::PriorityScheduler;

/// One entry of `triggers.json`'s `jobs` array (spec §6). `job_file`, when
/// present, is relative to `{workspace}/src/`; every other inline field
/// overlays the loaded base spec (or stands alone with no `job_file`).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TriggerDefinition {
    pub job_file: Option<String>,
    pub job_name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, Value>,
    #[serde(default)]
    pub source_type: Option<SourceType>,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub source_ref: Option<String>,
    #[serde(default)]
    pub ci_source_type: Option<SourceType>,
    #[serde(default)]
    pub ci_source_url: Option<String>,
    #[serde(default)]
    pub ci_source_ref: Option<String>,
    #[serde(default)]
    pub container_image: Option<String>,
    #[serde(default)]
    pub job_command: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TriggersFile {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub jobs: Vec<TriggerDefinition>,
}

pub struct TriggerProcessor {
    store: Arc<dyn JobStore>,
    scheduler: Arc<PriorityScheduler>,
    metrics: Arc<Metrics>,
}

#[derive(Debug, Clone, Default)]
pub struct TriggerOutcome {
    pub submitted: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl TriggerProcessor {
    pub fn new(store: Arc<dyn JobStore>, scheduler: Arc<PriorityScheduler>, metrics: Arc<Metrics>) -> Self {
        Self { store, scheduler, metrics }
    }

    /// Reads `{workspace}/triggers.json`; absent file returns an empty,
    /// successful outcome rather than an error. Any `type` other than
    /// `"trigger_job"` is rejected (spec §4.7.3).
    pub async fn process_triggers(&self, parent: &Job, workspace_dir: &str) -> Result<TriggerOutcome> {
        let triggers_path = Path::new(workspace_dir).join("triggers.json");
        let contents = match tokio::fs::read_to_string(&triggers_path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(TriggerOutcome::default()),
            Err(e) => return Err(e.into()),
        };

        let file: TriggersFile = serde_json::from_str(&contents)?;
        if file.kind != "trigger_job" {
            return Err(Error::config_invalid(format!("unsupported triggers.json type {:?}", file.kind)));
        }

        let mut outcome = TriggerOutcome::default();

        for trigger in file.jobs {
            match self.process_one(parent, workspace_dir, &trigger).await {
                Ok(job_id) => outcome.submitted.push(job_id),
                Err(e) => {
                    error!(job_name = %trigger.job_name, parent_job_id = %parent.job_id, error = %e, "trigger failed, continuing with siblings");
                    outcome.failed.push((trigger.job_name.clone(), e.to_string()));
                }
            }
        }

        Ok(outcome)
    }

    async fn process_one(&self, parent: &Job, workspace_dir: &str, trigger: &TriggerDefinition) -> Result<String> {
        let spec = match &trigger.job_file {
            Some(job_file) => {
                let job_path = Path::new(workspace_dir).join("src").join(job_file);
                let default_basename = job_file.trim_end_matches(".yaml").trim_end_matches(".yml").trim_end_matches(".json");
                JobSpec::load(&job_path, default_basename)?
            }
            None => JobSpec { name: trigger.job_name.clone(), ..JobSpec::default() },
        };

        // Merge env: parent's job_env_vars first, then the spec's own
        // environment, then the trigger's inline `env` wins per key.
        let mut env = parent.job_env_vars.clone();
        for (k, v) in &spec.environment {
            env.insert(k.clone(), v.clone());
        }
        for (k, v) in &trigger.env {
            env.insert(k.clone(), v.clone());
        }

        // Children inherit the parent's notes envelope; if it parses as VCS
        // metadata, clear is_eval and point status_context at this trigger's
        // job_name so each child reports a distinct status check.
        let mut notes = parent.notes.clone();
        if let Value::Object(map) = &mut notes {
            map.insert("triggered_by".to_string(), Value::String(parent.job_id.clone()));
            if map.contains_key("is_eval") {
                map.insert("is_eval".to_string(), Value::Bool(false));
            }
            map.insert("status_context".to_string(), Value::String(trigger.job_name.clone()));
        }

        let container_image = trigger.container_image.clone().or(spec.image.clone());
        let job_command = if let Some(cmd) = &trigger.job_command { cmd.clone() } else { spec.command.clone() };
        let timeout_seconds = trigger.timeout.or(spec.timeout_seconds);
        let capabilities: std::collections::HashSet<crate::model::Capability> = if !trigger.capabilities.is_empty() {
            &trigger.capabilities
        } else {
            &spec.capabilities
        }
        .iter()
        .filter_map(|c| match c.as_str() {
            "docker" => Some(crate::model::Capability::Docker),
            "gpu" => Some(crate::model::Capability::Gpu),
            _ => None,
        })
        .collect();

        let child = Job {
            job_id: Uuid::new_v4().to_string(),
            user_id: parent.user_id.clone(),
            project_id: parent.project_id.clone(),
            parent_job_id: Some(parent.job_id.clone()),
            source_type: trigger.source_type.or(parent.source_type),
            source_url: trigger.source_url.clone().or_else(|| parent.source_url.clone()),
            source_ref: trigger.source_ref.clone().or_else(|| parent.source_ref.clone()),
            source_path: parent.source_path.clone(),
            ci_source_type: trigger.ci_source_type.or(parent.ci_source_type),
            ci_source_url: trigger.ci_source_url.clone().or_else(|| parent.ci_source_url.clone()),
            ci_source_ref: trigger.ci_source_ref.clone().or_else(|| parent.ci_source_ref.clone()),
            ci_source_path: parent.ci_source_path.clone(),
            runner_image: container_image.clone(),
            container_image,
            job_command,
            code_dir: None,
            job_dir: None,
            job_env_vars: env,
            job_env_file: None,
            timeout_seconds,
            priority: trigger.priority,
            capabilities,
            status: JobStatus::Submitted,
            queue_name: parent.queue_name.clone(),
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
            notes,
            name: Some(trigger.job_name.clone()),
            description: Some(format!("Triggered by eval job {}", parent.job_id)),
        };

        let persisted = self.store.create_job(child).await?;

        let mut metadata: HashMap<String, Value> = HashMap::new();
        if let Some(priority) = persisted.priority {
            metadata.insert("priority".to_string(), Value::from(priority));
        }
        if let Some(queue) = &persisted.queue_name {
            metadata.insert("queue".to_string(), Value::String(queue.clone()));
        }

        let payload = crate::model::TaskPayload {
            job_id: persisted.job_id.clone(),
            job_type: persisted.name.clone(),
            ..Default::default()
        };

        let queue_label = persisted.queue_name.clone().unwrap_or_default();
        let source_label = persisted.source_type.map(|s| format!("{:?}", s).to_lowercase()).unwrap_or_else(|| "none".into());

        match self.scheduler.submit_job(payload, metadata).await {
            Ok(_) => {
                self.metrics.jobs_submitted_total.with_label_values(&[&queue_label, &source_label]).inc();
                self.metrics.corndogs_task_submissions_total.with_label_values(&[&queue_label, "ok"]).inc();
                info!(job_id = %persisted.job_id, parent_job_id = %parent.job_id, "trigger submitted child job");
                Ok(persisted.job_id)
            }
            Err(e) => {
                self.metrics.corndogs_task_submissions_total.with_label_values(&[&queue_label, "error"]).inc();
                let mut failed = persisted.clone();
                failed.status = JobStatus::Failed;
                failed.last_error = Some(e.to_string());
                if let Err(persist_err) = self.store.update_job(failed).await {
                    error!(job_id = %persisted.job_id, error = %persist_err, "failed to persist submission-failed child job");
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{JobFilters, MockTaskBrokerClient};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct InMemoryJobStore {
        jobs: Mutex<Vec<Job>>,
    }

    impl InMemoryJobStore {
        fn new() -> Self {
            Self { jobs: Mutex::new(Vec::new()) }
        }
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

        async fn list_jobs(&self, _filters: JobFilters, _limit: u32, _offset: u32) -> Result<Vec<Job>> {
            Ok(self.jobs.lock().unwrap().clone())
        }

        async fn try_claim(&self, _job_id: &str, _expected_status: JobStatus, _worker_id: &str) -> Result<bool> {
            Ok(true)
        }
    }

    fn parent_job() -> Job {
        Job {
            job_id: "parent-1".into(),
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
            container_image: None,
            job_command: "echo parent".into(),
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
            started_at: None,
            completed_at: None,
            exit_code: None,
            worker_id: None,
            retry_count: 0,
            last_error: None,
            logs_object_key: None,
            artifacts_object_key: None,
            notes: Value::Object(serde_json::Map::new()),
            name: None,
            description: None,
        }
    }

    fn build_processor(store: Arc<dyn JobStore>) -> TriggerProcessor {
        let broker = Arc::new(MockTaskBrokerClient::new());
        let scheduler = Arc::new(PriorityScheduler::new(broker));
        let metrics = Metrics::new(&prometheus::Registry::new()).unwrap();
        TriggerProcessor::new(store, scheduler, metrics)
    }

    #[tokio::test]
    async fn missing_triggers_file_is_silent_noop() {
        let store = Arc::new(InMemoryJobStore::new());
        let processor = build_processor(store);

        let dir = tempdir().unwrap();
        let outcome = processor.process_triggers(&parent_job(), dir.path().to_str().unwrap()).await.unwrap();
        assert!(outcome.submitted.is_empty());
        assert!(outcome.failed.is_empty());
    }

    #[tokio::test]
    async fn unsupported_triggers_type_is_rejected() {
        let store = Arc::new(InMemoryJobStore::new());
        let processor = build_processor(store);

        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("triggers.json"), r#"{"type": "something_else", "jobs": []}"#).unwrap();

        let err = processor.process_triggers(&parent_job(), dir.path().to_str().unwrap()).await.unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
    }

    #[tokio::test]
    async fn one_missing_job_file_does_not_block_siblings() {
        let store = Arc::new(InMemoryJobStore::new());
        let processor = build_processor(store.clone());

        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(
            dir.path().join("src").join("good.json"),
            r#"{"name": "good", "command": "echo good"}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("triggers.json"),
            r#"{"type": "trigger_job", "jobs": [{"job_file": "missing.json", "job_name": "missing"}, {"job_file": "good.json", "job_name": "good"}]}"#,
        )
        .unwrap();

        let outcome = processor.process_triggers(&parent_job(), dir.path().to_str().unwrap()).await.unwrap();
        assert_eq!(outcome.submitted.len(), 1);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(store.jobs.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn child_job_inherits_parent_source_and_notes() {
        let store = Arc::new(InMemoryJobStore::new());
        let processor = build_processor(store.clone());

        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(
            dir.path().join("src").join("child.json"),
            r#"{"name": "child", "command": "echo child"}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("triggers.json"),
            r#"{"type": "trigger_job", "jobs": [{"job_file": "child.json", "job_name": "child"}]}"#,
        )
        .unwrap();

        let mut parent = parent_job();
        parent.source_url = Some("https://example.com/repo.git".into());
        processor.process_triggers(&parent, dir.path().to_str().unwrap()).await.unwrap();

        let jobs = store.jobs.lock().unwrap();
        let child = &jobs[0];
        assert_eq!(child.parent_job_id.as_deref(), Some("parent-1"));
        assert_eq!(child.source_url.as_deref(), Some("https://example.com/repo.git"));
        assert_eq!(child.notes["triggered_by"], Value::String("parent-1".into()));
    }

    #[tokio::test]
    async fn submission_failure_marks_child_failed_instead_of_propagating_silently() {
        let store = Arc::new(InMemoryJobStore::new());
        let broker = Arc::new(MockTaskBrokerClient::new());
        *broker.submit_task_override.lock().unwrap() = Some(Box::new(|| Err(Error::BrokerTransient("unreachable".into()))));
        let scheduler = Arc::new(PriorityScheduler::new(broker));
        let metrics = Metrics::new(&prometheus::Registry::new()).unwrap();
        let processor = TriggerProcessor::new(store.clone(), scheduler, metrics);

        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(
            dir.path().join("src").join("child.json"),
            r#"{"name": "child", "command": "echo child"}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("triggers.json"),
            r#"{"type": "trigger_job", "jobs": [{"job_file": "child.json", "job_name": "child"}]}"#,
        )
        .unwrap();

        let outcome = processor.process_triggers(&parent_job(), dir.path().to_str().unwrap()).await.unwrap();
        assert!(outcome.submitted.is_empty());
        assert_eq!(outcome.failed.len(), 1);

        let jobs = store.jobs.lock().unwrap();
        assert_eq!(jobs[0].status, JobStatus::Failed);
        assert!(jobs[0].last_error.is_some());
    }
}
