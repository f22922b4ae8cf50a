//! Core data model: `Job`, `Project`, broker-side `Task`/`TaskPayload`,
//! scheduler `QueueConfig`/`RoutingRule`, and the `JobConfig` handed to
//! `ContainerRunner`.

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// `status` transitions are monotonic except `running -> submitted` (restart
/// recovery) and an explicit cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Submitted,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Timeout
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Submitted => "submitted",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Timeout => "timeout",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Git,
    Copy,
    None,
}

/// Declarative capability a job container needs; runner-specific effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Docker,
    Gpu,
}

/// Authoritative execution record, persisted by the store this core
/// consumes through a repository interface (see `broker::JobStore`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub user_id: String,
    pub project_id: Option<String>,
    pub parent_job_id: Option<String>,

    pub source_type: Option<SourceType>,
    pub source_url: Option<String>,
    pub source_ref: Option<String>,
    pub source_path: Option<String>,

    pub ci_source_type: Option<SourceType>,
    pub ci_source_url: Option<String>,
    pub ci_source_ref: Option<String>,
    pub ci_source_path: Option<String>,

    pub runner_image: Option<String>,
    pub container_image: Option<String>,
    pub job_command: String,
    pub code_dir: Option<String>,
    pub job_dir: Option<String>,
    pub job_env_vars: HashMap<String, Value>,
    pub job_env_file: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub priority: Option<i32>,
    pub capabilities: HashSet<Capability>,

    pub status: JobStatus,

    pub queue_name: Option<String>,
    pub auto_target_state: Option<String>,
    pub corndogs_task_id: Option<String>,

    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub worker_id: Option<String>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub logs_object_key: Option<String>,
    pub artifacts_object_key: Option<String>,
    pub notes: Value,

    pub name: Option<String>,
    pub description: Option<String>,
}

impl Job {
    /// `exit_code` is set iff `status ∈ {completed, failed, timeout}`;
    /// `started_at ≤ completed_at` when both present.
    pub fn invariants_hold(&self) -> bool {
        let exit_code_ok = match self.status {
            JobStatus::Completed | JobStatus::Failed | JobStatus::Timeout => {
                self.exit_code.is_some()
            }
            _ => true,
        };
        let ordering_ok = match (self.started_at, self.completed_at) {
            (Some(s), Some(c)) => s <= c,
            _ => true,
        };
        exit_code_ok && ordering_ok
    }
}

/// VCS repository configuration: which branches/event types this project
/// accepts webhook-triggered jobs for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub project_id: String,
    pub target_branches: Vec<String>,
    pub allowed_event_types: HashSet<String>,
    pub enabled: bool,
}

impl Project {
    /// `enabled ∧ type ∈ allowed ∧ (target_branches = ∅ ∨ branch ∈ target_branches)`,
    /// case-sensitive.
    pub fn should_process_event(&self, event_type: &str, branch: &str) -> bool {
        if !self.enabled {
            return false;
        }
        if !self.allowed_event_types.contains(event_type) {
            return false;
        }
        self.target_branches.is_empty() || self.target_branches.iter().any(|b| b == branch)
    }
}

/// Broker-side work unit. Not persisted by the core — the broker owns it for
/// the duration of the task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub uuid: String,
    pub queue: String,
    pub current_state: String,
    pub auto_target_state: String,
    pub payload: Vec<u8>,
    pub timeout: DateTime<Utc>,
    pub priority: i32,
    pub submit_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl Task {
    pub fn decode_payload(&self) -> crate::error::Result<TaskPayload> {
        serde_json::from_slice(&self.payload).map_err(crate::error::Error::from)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskConfig {
    pub image: Option<String>,
    pub command: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub timeout: Option<u64>,
    pub code_dir: Option<String>,
    pub job_dir: Option<String>,
    #[serde(default)]
    pub environment: HashMap<String, Value>,
    #[serde(default)]
    pub resource_limits: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSource {
    #[serde(rename = "type")]
    pub source_type: Option<SourceType>,
    pub url: Option<String>,
    #[serde(rename = "ref")]
    pub source_ref: Option<String>,
    pub source_path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub user_id: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub queue: Option<String>,
    pub priority: Option<i32>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// The JSON envelope transported through the broker. This is the
/// broker-level contract — distinct from `Job`, the persistence-level one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPayload {
    pub job_id: String,
    pub job_type: Option<String>,
    #[serde(default)]
    pub config: TaskConfig,
    #[serde(default)]
    pub source: TaskSource,
    #[serde(default)]
    pub metadata: TaskMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Exponential,
    Linear,
    Fixed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PriorityRange {
    pub min: i32,
    pub max: i32,
}

impl PriorityRange {
    pub fn clamp(&self, value: i32) -> i32 {
        value.clamp(self.min, self.max)
    }

    pub fn midpoint(&self) -> i32 {
        (self.min + self.max) / 2
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    pub max_retries: u32,
    pub backoff_strategy: BackoffStrategy,
    pub initial_delay_seconds: u64,
    pub max_delay_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub max_cpu: String,
    pub max_memory: String,
    pub max_disk: String,
}

/// Per-queue design parameters — four defaults are seeded by the scheduler:
/// `critical [90,100]`, `high-priority [70,89]`, `normal [30,69]`,
/// `low-priority [0,29]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    pub priority_range: PriorityRange,
    pub max_concurrency: u32,
    pub timeout_seconds: u64,
    pub retry_policy: RetryPolicyConfig,
    pub resource_limits: ResourceLimits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionOperator {
    Equals,
    Contains,
    Matches,
    In,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: ConditionOperator,
    pub value: Value,
}

/// An ordered matcher. Routing rules are kept sorted by `priority` descending
/// (ties broken by insertion order); the first fully-matching rule wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub name: String,
    pub priority: i32,
    pub conditions: Vec<Condition>,
    pub target_queue: String,
}

/// Ephemeral structure the `JobProcessor` hands to the `ContainerRunner`.
#[derive(Debug, Clone, Default)]
pub struct JobConfig {
    pub image: String,
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    pub workspace_dir: String,
    pub working_dir: String,
    pub source_dir: Option<String>,
    pub capabilities: HashSet<Capability>,
    pub timeout_seconds: u64,
    pub cpu_limit: Option<String>,
    pub memory_limit: Option<String>,
    pub job_id: String,
    pub queue_name: String,
}

impl JobConfig {
    /// `SpawnJob` fails with `ConfigInvalid` when any of these is missing.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.image.is_empty() {
            return Err(crate::error::Error::config_invalid("image is required"));
        }
        if self.command.is_empty() {
            return Err(crate::error::Error::config_invalid("command must be non-empty"));
        }
        if self.workspace_dir.is_empty() {
            return Err(crate::error::Error::config_invalid("workspace_dir is required"));
        }
        if self.job_id.is_empty() {
            return Err(crate::error::Error::config_invalid("job_id is required"));
        }
        Ok(())
    }
}

/// Parsed memory limit, supporting kubernetes-style binary (Ki/Mi/Gi/Ti) and
/// decimal (K/M/G/T) suffixes; suffix-less is bytes.
pub fn parse_memory_limit(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (num_part, multiplier): (&str, u64) = if let Some(n) = s.strip_suffix("Ki") {
        (n, 1024)
    } else if let Some(n) = s.strip_suffix("Mi") {
        (n, 1024 * 1024)
    } else if let Some(n) = s.strip_suffix("Gi") {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix("Ti") {
        (n, 1024 * 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('K') {
        (n, 1_000)
    } else if let Some(n) = s.strip_suffix('M') {
        (n, 1_000_000)
    } else if let Some(n) = s.strip_suffix('G') {
        (n, 1_000_000_000)
    } else if let Some(n) = s.strip_suffix('T') {
        (n, 1_000_000_000_000)
    } else {
        (s, 1)
    };
    num_part.trim().parse::<u64>().ok().map(|n| n * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_invariants() {
        let mut job = sample_job();
        job.status = JobStatus::Completed;
        job.exit_code = None;
        assert!(!job.invariants_hold());
        job.exit_code = Some(0);
        assert!(job.invariants_hold());
    }

    #[test]
    fn project_should_process_event_empty_branches_allows_any() {
        let p = Project {
            project_id: "p1".into(),
            target_branches: vec![],
            allowed_event_types: ["push".to_string()].into_iter().collect(),
            enabled: true,
        };
        assert!(p.should_process_event("push", "anything"));
        assert!(!p.should_process_event("pull_request", "anything"));
    }

    #[test]
    fn project_branch_matching_is_case_sensitive() {
        let p = Project {
            project_id: "p1".into(),
            target_branches: vec!["main".to_string()],
            allowed_event_types: ["push".to_string()].into_iter().collect(),
            enabled: true,
        };
        assert!(p.should_process_event("push", "main"));
        assert!(!p.should_process_event("push", "Main"));
    }

    #[test]
    fn priority_range_clamps() {
        let r = PriorityRange { min: 30, max: 69 };
        assert_eq!(r.clamp(1000), 69);
        assert_eq!(r.clamp(-1000), 30);
        assert_eq!(r.clamp(50), 50);
    }

    #[test]
    fn memory_limit_parsing() {
        assert_eq!(parse_memory_limit("512Mi"), Some(512 * 1024 * 1024));
        assert_eq!(parse_memory_limit("1Gi"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_memory_limit("2G"), Some(2_000_000_000));
        assert_eq!(parse_memory_limit("100"), Some(100));
        assert_eq!(parse_memory_limit(""), None);
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
            container_image: None,
            job_command: "echo hi".into(),
            code_dir: None,
            job_dir: None,
            job_env_vars: HashMap::new(),
            job_env_file: None,
            timeout_seconds: None,
            priority: None,
            capabilities: HashSet::new(),
            status: JobStatus::Submitted,
            queue_name: None,
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
}
