//! `TaskBrokerClient`: a thin typed client over the external task broker, and
//! `JobStore`: the narrow repository interface the core consumes for the
//! relational store. Both are external collaborators per spec §1 — only the
//! interfaces live here, grounded on the teacher's `Repository<T, ID>`
//! pattern (`traits.rs`).

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::model::{Job, Task, TaskPayload};

/// Broker task-state names used by the core.
pub mod states {
    pub const SUBMITTED: &str = "submitted";
    pub const SUBMITTED_WORKING: &str = "submitted-working";
    pub const PROCESSING: &str = "processing";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
    pub const CANCELLED: &str = "cancelled";
}

#[async_trait]
pub trait TaskBrokerClient: Send + Sync {
    async fn submit_task(&self, queue: &str, payload: &TaskPayload, priority: i32) -> Result<Task>;

    /// `Ok(None)` is the normal "no work" signal — never surfaced as an
    /// error, per the typed discriminator called for in spec §9's open
    /// question about the broker's `NotFound`.
    async fn get_next_task(
        &self,
        queue: &str,
        current_state: &str,
        override_timeout: Option<DateTime<Utc>>,
    ) -> Result<Option<Task>>;

    async fn update_task(
        &self,
        uuid: &str,
        current_state: &str,
        new_state: &str,
        payload: Option<&TaskPayload>,
    ) -> Result<Task>;

    async fn complete_task(&self, uuid: &str, current_state: &str) -> Result<Task>;

    async fn cancel_task(&self, uuid: &str, current_state: &str) -> Result<Task>;

    async fn get_task_by_id(&self, uuid: &str) -> Result<Task>;

    async fn clean_up_timed_out(&self, queue: &str, at_time: DateTime<Utc>) -> Result<u64>;

    async fn get_queues(&self) -> Result<(Vec<String>, u64)>;

    async fn get_queue_task_counts(&self) -> Result<(HashMap<String, u64>, u64)>;

    async fn get_task_state_counts(&self, queue: &str) -> Result<(u64, HashMap<String, u64>)>;

    /// Semantically `update_task` with `new_state == current_state` and a
    /// fresh timeout — no payload change.
    async fn send_heartbeat(
        &self,
        uuid: &str,
        current_state: &str,
        timeout_extension_seconds: u64,
    ) -> Result<Task>;
}

/// Repository interface the core consumes for the relational store.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get_job_by_id(&self, job_id: &str) -> Result<Option<Job>>;
    async fn create_job(&self, job: Job) -> Result<Job>;
    async fn update_job(&self, job: Job) -> Result<Job>;
    async fn list_jobs(&self, filters: JobFilters, limit: u32, offset: u32) -> Result<Vec<Job>>;

    /// Optimistic-locking claim: succeeds only if the stored job's `status`
    /// still equals `expected_status`; otherwise returns `Ok(false)` so the
    /// caller skips the task rather than failing it (spec §4.7.1, §9).
    async fn try_claim(&self, job_id: &str, expected_status: crate::model::JobStatus, worker_id: &str)
        -> Result<bool>;
}

#[derive(Debug, Clone, Default)]
pub struct JobFilters {
    pub status: Option<crate::model::JobStatus>,
    pub worker_id: Option<String>,
    pub queue_name: Option<String>,
}

/// Call-log entry recorded for every `TaskBrokerClient` invocation.
#[derive(Debug, Clone)]
pub enum RecordedCall {
    SubmitTask { queue: String, priority: i32 },
    GetNextTask { queue: String, current_state: String },
    UpdateTask { uuid: String, current_state: String, new_state: String },
    CompleteTask { uuid: String, current_state: String },
    CancelTask { uuid: String, current_state: String },
    GetTaskById { uuid: String },
    CleanUpTimedOut { queue: String },
    GetQueues,
    GetQueueTaskCounts,
    GetTaskStateCounts { queue: String },
    SendHeartbeat { uuid: String, current_state: String },
}

type OverrideFn<T> = Box<dyn Fn() -> Result<T> + Send + Sync>;

/// Test double with per-method override hooks and a single-mutex-protected
/// call log, per spec §4.1's "Test double" requirement.
#[derive(Default)]
pub struct MockTaskBrokerClient {
    pub calls: Mutex<Vec<RecordedCall>>,
    pub submit_task_override: Mutex<Option<OverrideFn<Task>>>,
    pub get_next_task_override: Mutex<Option<OverrideFn<Option<Task>>>>,
    pub update_task_override: Mutex<Option<OverrideFn<Task>>>,
}

impl MockTaskBrokerClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("mock mutex poisoned").clone()
    }

    fn record(&self, call: RecordedCall) {
        self.calls.lock().expect("mock mutex poisoned").push(call);
    }

    fn default_task(&self, queue: &str, current_state: &str, priority: i32) -> Task {
        Task {
            uuid: uuid::Uuid::new_v4().to_string(),
            queue: queue.to_string(),
            current_state: current_state.to_string(),
            auto_target_state: states::SUBMITTED_WORKING.to_string(),
            payload: Vec::new(),
            timeout: Utc::now() + chrono::Duration::seconds(300),
            priority,
            submit_time: Utc::now(),
            update_time: Utc::now(),
        }
    }
}

impl Clone for RecordedCall {
    fn clone(&self) -> Self {
        match self {
            RecordedCall::SubmitTask { queue, priority } => RecordedCall::SubmitTask {
                queue: queue.clone(),
                priority: *priority,
            },
            RecordedCall::GetNextTask { queue, current_state } => RecordedCall::GetNextTask {
                queue: queue.clone(),
                current_state: current_state.clone(),
            },
            RecordedCall::UpdateTask { uuid, current_state, new_state } => RecordedCall::UpdateTask {
                uuid: uuid.clone(),
                current_state: current_state.clone(),
                new_state: new_state.clone(),
            },
            RecordedCall::CompleteTask { uuid, current_state } => RecordedCall::CompleteTask {
                uuid: uuid.clone(),
                current_state: current_state.clone(),
            },
            RecordedCall::CancelTask { uuid, current_state } => RecordedCall::CancelTask {
                uuid: uuid.clone(),
                current_state: current_state.clone(),
            },
            RecordedCall::GetTaskById { uuid } => RecordedCall::GetTaskById { uuid: uuid.clone() },
            RecordedCall::CleanUpTimedOut { queue } => RecordedCall::CleanUpTimedOut { queue: queue.clone() },
            RecordedCall::GetQueues => RecordedCall::GetQueues,
            RecordedCall::GetQueueTaskCounts => RecordedCall::GetQueueTaskCounts,
            RecordedCall::GetTaskStateCounts { queue } => RecordedCall::GetTaskStateCounts { queue: queue.clone() },
            RecordedCall::SendHeartbeat { uuid, current_state } => RecordedCall::SendHeartbeat {
                uuid: uuid.clone(),
                current_state: current_state.clone(),
            },
        }
    }
}

#[async_trait]
impl TaskBrokerClient for MockTaskBrokerClient {
    async fn submit_task(&self, queue: &str, _payload: &TaskPayload, priority: i32) -> Result<Task> {
        self.record(RecordedCall::SubmitTask { queue: queue.to_string(), priority });
        if let Some(f) = self.submit_task_override.lock().expect("poisoned").as_ref() {
            return f();
        }
        Ok(self.default_task(queue, states::SUBMITTED, priority))
    }

    async fn get_next_task(
        &self,
        queue: &str,
        current_state: &str,
        _override_timeout: Option<DateTime<Utc>>,
    ) -> Result<Option<Task>> {
        self.record(RecordedCall::GetNextTask {
            queue: queue.to_string(),
            current_state: current_state.to_string(),
        });
        if let Some(f) = self.get_next_task_override.lock().expect("poisoned").as_ref() {
            return f();
        }
        Ok(None)
    }

    async fn update_task(
        &self,
        uuid: &str,
        current_state: &str,
        new_state: &str,
        _payload: Option<&TaskPayload>,
    ) -> Result<Task> {
        self.record(RecordedCall::UpdateTask {
            uuid: uuid.to_string(),
            current_state: current_state.to_string(),
            new_state: new_state.to_string(),
        });
        if let Some(f) = self.update_task_override.lock().expect("poisoned").as_ref() {
            return f();
        }
        Ok(self.default_task("default", new_state, 0))
    }

    async fn complete_task(&self, uuid: &str, current_state: &str) -> Result<Task> {
        self.record(RecordedCall::CompleteTask {
            uuid: uuid.to_string(),
            current_state: current_state.to_string(),
        });
        Ok(self.default_task("default", states::COMPLETED, 0))
    }

    async fn cancel_task(&self, uuid: &str, current_state: &str) -> Result<Task> {
        self.record(RecordedCall::CancelTask {
            uuid: uuid.to_string(),
            current_state: current_state.to_string(),
        });
        Ok(self.default_task("default", states::CANCELLED, 0))
    }

    async fn get_task_by_id(&self, uuid: &str) -> Result<Task> {
        self.record(RecordedCall::GetTaskById { uuid: uuid.to_string() });
        Ok(self.default_task("default", states::SUBMITTED, 0))
    }

    async fn clean_up_timed_out(&self, queue: &str, _at_time: DateTime<Utc>) -> Result<u64> {
        self.record(RecordedCall::CleanUpTimedOut { queue: queue.to_string() });
        Ok(0)
    }

    async fn get_queues(&self) -> Result<(Vec<String>, u64)> {
        self.record(RecordedCall::GetQueues);
        Ok((vec![], 0))
    }

    async fn get_queue_task_counts(&self) -> Result<(HashMap<String, u64>, u64)> {
        self.record(RecordedCall::GetQueueTaskCounts);
        Ok((HashMap::new(), 0))
    }

    async fn get_task_state_counts(&self, queue: &str) -> Result<(u64, HashMap<String, u64>)> {
        self.record(RecordedCall::GetTaskStateCounts { queue: queue.to_string() });
        Ok((0, HashMap::new()))
    }

    async fn send_heartbeat(
        &self,
        uuid: &str,
        current_state: &str,
        _timeout_extension_seconds: u64,
    ) -> Result<Task> {
        self.record(RecordedCall::SendHeartbeat {
            uuid: uuid.to_string(),
            current_state: current_state.to_string(),
        });
        Ok(self.default_task("default", current_state, 0))
    }
}

/// Maps a broker transport failure onto `Error::BrokerTransient`, distinct
/// from the `Ok(None)` "no work" signal.
pub fn wrap_transport_error(context: &str, err: impl std::fmt::Display) -> Error {
    Error::broker_transient(format!("{}: {}", context, err))
}

/// Production `TaskBrokerClient`, grounded on the teacher's
/// `reqwest`-backed gateway clients (`tax/providers.rs`'s `AvalaraProvider`):
/// a `reqwest::Client` plus a base URL, one method per RPC, transport errors
/// wrapped via `wrap_transport_error`. The broker's wire format isn't
/// prescribed, so this speaks a plain JSON-over-HTTP convention.
pub struct HttpTaskBrokerClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTaskBrokerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("failed to build broker http client"),
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn send<T: serde::de::DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> Result<T> {
        let response = req.send().await.map_err(|e| wrap_transport_error("broker request", e))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(wrap_transport_error("broker response", format!("{}: {}", status, body)));
        }
        response.json().await.map_err(|e| wrap_transport_error("broker response decode", e))
    }
}

#[derive(serde::Serialize)]
struct UpdateTaskBody<'a> {
    new_state: &'a str,
    payload: Option<&'a TaskPayload>,
}

#[async_trait]
impl TaskBrokerClient for HttpTaskBrokerClient {
    async fn submit_task(&self, queue: &str, payload: &TaskPayload, priority: i32) -> Result<Task> {
        #[derive(serde::Serialize)]
        struct Body<'a> {
            priority: i32,
            payload: &'a TaskPayload,
        }
        self.send(
            self.client
                .post(self.url(&format!("/queues/{}/tasks", queue)))
                .json(&Body { priority, payload }),
        )
        .await
    }

    async fn get_next_task(
        &self,
        queue: &str,
        current_state: &str,
        override_timeout: Option<DateTime<Utc>>,
    ) -> Result<Option<Task>> {
        let mut req = self
            .client
            .get(self.url(&format!("/queues/{}/tasks/next", queue)))
            .query(&[("current_state", current_state)]);
        if let Some(timeout) = override_timeout {
            req = req.query(&[("override_timeout", timeout.to_rfc3339())]);
        }
        let response = req.send().await.map_err(|e| wrap_transport_error("get_next_task", e))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(wrap_transport_error("get_next_task", format!("{}: {}", status, body)));
        }
        Ok(Some(response.json().await.map_err(|e| wrap_transport_error("get_next_task decode", e))?))
    }

    async fn update_task(
        &self,
        uuid: &str,
        current_state: &str,
        new_state: &str,
        payload: Option<&TaskPayload>,
    ) -> Result<Task> {
        self.send(
            self.client
                .patch(self.url(&format!("/tasks/{}", uuid)))
                .query(&[("current_state", current_state)])
                .json(&UpdateTaskBody { new_state, payload }),
        )
        .await
    }

    async fn complete_task(&self, uuid: &str, current_state: &str) -> Result<Task> {
        self.send(
            self.client
                .post(self.url(&format!("/tasks/{}/complete", uuid)))
                .query(&[("current_state", current_state)]),
        )
        .await
    }

    async fn cancel_task(&self, uuid: &str, current_state: &str) -> Result<Task> {
        self.send(
            self.client
                .post(self.url(&format!("/tasks/{}/cancel", uuid)))
                .query(&[("current_state", current_state)]),
        )
        .await
    }

    async fn get_task_by_id(&self, uuid: &str) -> Result<Task> {
        self.send(self.client.get(self.url(&format!("/tasks/{}", uuid)))).await
    }

    async fn clean_up_timed_out(&self, queue: &str, at_time: DateTime<Utc>) -> Result<u64> {
        #[derive(serde::Deserialize)]
        struct Resp {
            cleaned: u64,
        }
        let resp: Resp = self
            .send(
                self.client
                    .post(self.url(&format!("/queues/{}/tasks/clean-up-timed-out", queue)))
                    .query(&[("at_time", at_time.to_rfc3339())]),
            )
            .await?;
        Ok(resp.cleaned)
    }

    async fn get_queues(&self) -> Result<(Vec<String>, u64)> {
        #[derive(serde::Deserialize)]
        struct Resp {
            queues: Vec<String>,
            total: u64,
        }
        let resp: Resp = self.send(self.client.get(self.url("/queues"))).await?;
        Ok((resp.queues, resp.total))
    }

    async fn get_queue_task_counts(&self) -> Result<(HashMap<String, u64>, u64)> {
        #[derive(serde::Deserialize)]
        struct Resp {
            counts: HashMap<String, u64>,
            total: u64,
        }
        let resp: Resp = self.send(self.client.get(self.url("/queues/task-counts"))).await?;
        Ok((resp.counts, resp.total))
    }

    async fn get_task_state_counts(&self, queue: &str) -> Result<(u64, HashMap<String, u64>)> {
        #[derive(serde::Deserialize)]
        struct Resp {
            total: u64,
            by_state: HashMap<String, u64>,
        }
        let resp: Resp = self
            .send(self.client.get(self.url(&format!("/queues/{}/state-counts", queue))))
            .await?;
        Ok((resp.total, resp.by_state))
    }

    async fn send_heartbeat(&self, uuid: &str, current_state: &str, timeout_extension_seconds: u64) -> Result<Task> {
        self.send(
            self.client
                .post(self.url(&format!("/tasks/{}/heartbeat", uuid)))
                .query(&[("current_state", current_state), ("extend_seconds", &timeout_extension_seconds.to_string())]),
        )
        .await
    }
}

/// Production `JobStore`, speaking to the same coordinator service as
/// `HttpTaskBrokerClient` (the relational store's schema is the deploying
/// org's to define; this client only needs the narrow shape the core reads
/// and writes). `try_claim` is a single conditional-update call so the
/// compare-and-swap described in spec §9 happens server-side, atomically.
pub struct HttpJobStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpJobStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("failed to build job store http client"),
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn send<T: serde::de::DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> Result<T> {
        let response = req.send().await.map_err(|e| wrap_transport_error("job store request", e))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(wrap_transport_error("job store response", format!("{}: {}", status, body)));
        }
        response.json().await.map_err(|e| wrap_transport_error("job store response decode", e))
    }
}

#[async_trait]
impl JobStore for HttpJobStore {
    async fn get_job_by_id(&self, job_id: &str) -> Result<Option<crate::model::Job>> {
        let response = self
            .client
            .get(self.url(&format!("/jobs/{}", job_id)))
            .send()
            .await
            .map_err(|e| wrap_transport_error("get_job_by_id", e))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(wrap_transport_error("get_job_by_id", format!("{}: {}", status, body)));
        }
        Ok(Some(response.json().await.map_err(|e| wrap_transport_error("get_job_by_id decode", e))?))
    }

    async fn create_job(&self, job: crate::model::Job) -> Result<crate::model::Job> {
        let response = self
            .client
            .post(self.url("/jobs"))
            .json(&job)
            .send()
            .await
            .map_err(|e| wrap_transport_error("create_job", e))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(wrap_transport_error("create_job", format!("{}: {}", status, body)));
        }
        response.json().await.map_err(|e| wrap_transport_error("create_job decode", e))
    }

    async fn update_job(&self, job: crate::model::Job) -> Result<crate::model::Job> {
        let response = self
            .client
            .put(self.url(&format!("/jobs/{}", job.job_id)))
            .json(&job)
            .send()
            .await
            .map_err(|e| wrap_transport_error("update_job", e))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(wrap_transport_error("update_job", format!("{}: {}", status, body)));
        }
        response.json().await.map_err(|e| wrap_transport_error("update_job decode", e))
    }

    async fn list_jobs(&self, filters: JobFilters, limit: u32, offset: u32) -> Result<Vec<crate::model::Job>> {
        let mut query = vec![("limit", limit.to_string()), ("offset", offset.to_string())];
        if let Some(status) = filters.status {
            query.push(("status", status.to_string()));
        }
        if let Some(worker_id) = filters.worker_id {
            query.push(("worker_id", worker_id));
        }
        if let Some(queue_name) = filters.queue_name {
            query.push(("queue_name", queue_name));
        }
        self.send(self.client.get(self.url("/jobs")).query(&query)).await
    }

    async fn try_claim(&self, job_id: &str, expected_status: crate::model::JobStatus, worker_id: &str) -> Result<bool> {
        #[derive(serde::Serialize)]
        struct Body<'a> {
            expected_status: String,
            worker_id: &'a str,
        }
        #[derive(serde::Deserialize)]
        struct Resp {
            claimed: bool,
        }
        let response = self
            .client
            .post(self.url(&format!("/jobs/{}/claim", job_id)))
            .json(&Body { expected_status: expected_status.to_string(), worker_id })
            .send()
            .await
            .map_err(|e| wrap_transport_error("try_claim", e))?;
        if response.status() == reqwest::StatusCode::CONFLICT {
            return Ok(false);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(wrap_transport_error("try_claim", format!("{}: {}", status, body)));
        }
        let resp: Resp = response.json().await.map_err(|e| wrap_transport_error("try_claim decode", e))?;
        Ok(resp.claimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_records_calls_in_order() {
        let mock = MockTaskBrokerClient::new();
        let _ = mock.get_next_task("critical", states::SUBMITTED, None).await;
        let _ = mock.get_next_task("critical", states::SUBMITTED, None).await;
        assert_eq!(mock.calls().len(), 2);
    }

    #[tokio::test]
    async fn mock_default_get_next_task_is_none() {
        let mock = MockTaskBrokerClient::new();
        let result = mock.get_next_task("normal", states::SUBMITTED, None).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn mock_override_hook_takes_precedence() {
        let mock = MockTaskBrokerClient::new();
        *mock.submit_task_override.lock().unwrap() = Some(Box::new(|| {
            Err(Error::broker_transient("boom"))
        }));
        let payload = TaskPayload {
            job_id: "j1".into(),
            ..Default::default()
        };
        let result = mock.submit_task("critical", &payload, 90).await;
        assert!(result.is_err());
    }
}
