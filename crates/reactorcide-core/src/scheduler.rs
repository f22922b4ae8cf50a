//! `PriorityScheduler`: matches job metadata against ordered routing rules,
//! picks a queue, computes a clamped priority, and submits through
//! `TaskBrokerClient`. Grounded on the teacher's `jobs::queue`/`jobs::config`
//! default-queue seeding shape, generalised to routing-rule evaluation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use regex::Regex;
use serde_json::Value;
use tracing::warn;

use crate::broker::TaskBrokerClient;
use crate::error::Result;
use crate::model::{
    BackoffStrategy, Condition, ConditionOperator, PriorityRange, QueueConfig, ResourceLimits,
    RetryPolicyConfig, RoutingRule, Task, TaskPayload,
};

fn default_queue_configs() -> HashMap<String, QueueConfig> {
    let mut map = HashMap::new();
    map.insert(
        "critical".to_string(),
        QueueConfig {
            name: "critical".into(),
            priority_range: PriorityRange { min: 90, max: 100 },
            max_concurrency: 20,
            timeout_seconds: 1800,
            retry_policy: RetryPolicyConfig {
                max_retries: 5,
                backoff_strategy: BackoffStrategy::Exponential,
                initial_delay_seconds: 1,
                max_delay_seconds: 30,
            },
            resource_limits: ResourceLimits {
                max_cpu: "4.0".into(),
                max_memory: "8Gi".into(),
                max_disk: "20Gi".into(),
            },
        },
    );
    map.insert(
        "high-priority".to_string(),
        QueueConfig {
            name: "high-priority".into(),
            priority_range: PriorityRange { min: 70, max: 89 },
            max_concurrency: 15,
            timeout_seconds: 3600,
            retry_policy: RetryPolicyConfig {
                max_retries: 3,
                backoff_strategy: BackoffStrategy::Exponential,
                initial_delay_seconds: 1,
                max_delay_seconds: 60,
            },
            resource_limits: ResourceLimits {
                max_cpu: "2.0".into(),
                max_memory: "4Gi".into(),
                max_disk: "10Gi".into(),
            },
        },
    );
    map.insert(
        "normal".to_string(),
        QueueConfig {
            name: "normal".into(),
            priority_range: PriorityRange { min: 30, max: 69 },
            max_concurrency: 10,
            timeout_seconds: 3600,
            retry_policy: RetryPolicyConfig {
                max_retries: 3,
                backoff_strategy: BackoffStrategy::Exponential,
                initial_delay_seconds: 2,
                max_delay_seconds: 120,
            },
            resource_limits: ResourceLimits {
                max_cpu: "1.0".into(),
                max_memory: "2Gi".into(),
                max_disk: "5Gi".into(),
            },
        },
    );
    map.insert(
        "low-priority".to_string(),
        QueueConfig {
            name: "low-priority".into(),
            priority_range: PriorityRange { min: 0, max: 29 },
            max_concurrency: 5,
            timeout_seconds: 7200,
            retry_policy: RetryPolicyConfig {
                max_retries: 2,
                backoff_strategy: BackoffStrategy::Linear,
                initial_delay_seconds: 5,
                max_delay_seconds: 300,
            },
            resource_limits: ResourceLimits {
                max_cpu: "0.5".into(),
                max_memory: "1Gi".into(),
                max_disk: "2Gi".into(),
            },
        },
    );
    map
}

pub struct PriorityScheduler {
    queue_configs: RwLock<HashMap<String, QueueConfig>>,
    routing_rules: RwLock<Vec<RoutingRule>>,
    broker: Arc<dyn TaskBrokerClient>,
}

impl PriorityScheduler {
    pub fn new(broker: Arc<dyn TaskBrokerClient>) -> Self {
        Self {
            queue_configs: RwLock::new(default_queue_configs()),
            routing_rules: RwLock::new(Vec::new()),
            broker,
        }
    }

    /// Insertion re-sorts by `priority` descending; ties keep insertion
    /// order (a stable sort preserves relative order of equal-priority
    /// rules already present).
    pub fn add_routing_rule(&self, rule: RoutingRule) {
        let mut rules = self.routing_rules.write().expect("lock poisoned");
        rules.push(rule);
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    pub fn upsert_queue_config(&self, config: QueueConfig) {
        self.queue_configs.write().expect("lock poisoned").insert(config.name.clone(), config);
    }

    fn resolve_queue(&self, metadata: &HashMap<String, Value>) -> String {
        let rules = self.routing_rules.read().expect("lock poisoned");
        for rule in rules.iter() {
            if rule.conditions.iter().all(|c| evaluate_condition(c, metadata)) {
                return rule.target_queue.clone();
            }
        }
        "normal".to_string()
    }

    fn compute_priority(queue: &QueueConfig, metadata: &HashMap<String, Value>) -> i32 {
        if let Some(explicit) = metadata.get("priority").and_then(|v| v.as_i64()) {
            return queue.priority_range.clamp(explicit as i32);
        }

        let mut priority = queue.priority_range.midpoint();

        if let Some(job_type) = metadata.get("job_type").and_then(|v| v.as_str()) {
            priority += match job_type {
                "rollback" => 20,
                "hotfix" => 15,
                "deploy" => 10,
                "build" => 5,
                "test" => 0,
                "cleanup" => -10,
                _ => 0,
            };
        }

        if let Some(environment) = metadata.get("environment").and_then(|v| v.as_str()) {
            priority += match environment {
                "production" => 10,
                "staging" => 5,
                "development" => -5,
                _ => 0,
            };
        }

        queue.priority_range.clamp(priority)
    }

    /// `SubmitJob(payload, metadata)` from spec §4.6.
    pub async fn submit_job(&self, mut payload: TaskPayload, metadata: HashMap<String, Value>) -> Result<Task> {
        let queue_name = self.resolve_queue(&metadata);

        let queue = {
            let configs = self.queue_configs.read().expect("lock poisoned");
            configs
                .get(&queue_name)
                .or_else(|| configs.get("normal"))
                .cloned()
                .expect("normal queue config always present")
        };

        let priority = Self::compute_priority(&queue, &metadata);

        payload.metadata.queue = Some(queue.name.clone());
        payload.metadata.priority = Some(priority);

        if payload.config.timeout.unwrap_or(0) == 0 {
            payload.config.timeout = Some(queue.timeout_seconds);
        }

        payload.config.resource_limits.insert("cpu".to_string(), Value::String(queue.resource_limits.max_cpu.clone()));
        payload.config.resource_limits.insert("memory".to_string(), Value::String(queue.resource_limits.max_memory.clone()));
        payload.config.resource_limits.insert("disk".to_string(), Value::String(queue.resource_limits.max_disk.clone()));

        self.broker.submit_task(&queue.name, &payload, priority).await
    }
}

impl Clone for QueueConfig {
    fn clone(&self) -> Self {
        QueueConfig {
            name: self.name.clone(),
            priority_range: self.priority_range,
            max_concurrency: self.max_concurrency,
            timeout_seconds: self.timeout_seconds,
            retry_policy: self.retry_policy.clone(),
            resource_limits: self.resource_limits.clone(),
        }
    }
}

impl Clone for ResourceLimits {
    fn clone(&self) -> Self {
        ResourceLimits {
            max_cpu: self.max_cpu.clone(),
            max_memory: self.max_memory.clone(),
            max_disk: self.max_disk.clone(),
        }
    }
}

impl Clone for RetryPolicyConfig {
    fn clone(&self) -> Self {
        RetryPolicyConfig {
            max_retries: self.max_retries,
            backoff_strategy: self.backoff_strategy,
            initial_delay_seconds: self.initial_delay_seconds,
            max_delay_seconds: self.max_delay_seconds,
        }
    }
}

/// Field lookup uses the raw metadata map; missing field ⇒ condition false.
fn evaluate_condition(condition: &Condition, metadata: &HashMap<String, Value>) -> bool {
    let field_value = match metadata.get(&condition.field) {
        Some(v) => v,
        None => return false,
    };
    let field_str = stringify(field_value);

    match condition.operator {
        ConditionOperator::Equals => field_str == stringify(&condition.value),
        ConditionOperator::Contains => {
            let needle = stringify(&condition.value);
            field_str.contains(&needle)
        }
        ConditionOperator::Matches => {
            let pattern = stringify(&condition.value);
            match Regex::new(&pattern) {
                Ok(re) => re.is_match(&field_str),
                Err(e) => {
                    warn!(pattern = %pattern, error = %e, "invalid routing-rule regex");
                    false
                }
            }
        }
        ConditionOperator::In => match condition.value.as_array() {
            Some(values) => values.iter().any(|v| stringify(v) == field_str),
            None => false,
        },
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockTaskBrokerClient;
    use serde_json::json;

    fn metadata(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[tokio::test]
    async fn scenario_a_production_deploy_routes_high_priority() {
        let broker = Arc::new(MockTaskBrokerClient::new());
        let scheduler = PriorityScheduler::new(broker.clone());
        scheduler.add_routing_rule(RoutingRule {
            name: "deploy-to-high".into(),
            priority: 50,
            conditions: vec![Condition {
                field: "job_type".into(),
                operator: ConditionOperator::Equals,
                value: json!("deploy"),
            }],
            target_queue: "high-priority".into(),
        });

        let md = metadata(&[("job_type", json!("deploy")), ("environment", json!("production"))]);
        let task = scheduler.submit_job(TaskPayload::default(), md).await.unwrap();
        assert_eq!(task.queue, "high-priority");
    }

    #[tokio::test]
    async fn scenario_a_priority_value() {
        let queue = default_queue_configs().remove("high-priority").unwrap();
        let md = metadata(&[("job_type", json!("deploy")), ("environment", json!("production"))]);
        let priority = PriorityScheduler::compute_priority(&queue, &md);
        assert_eq!(priority, 89); // midpoint(70,89)=79 +10 +10 -> clamp to 89
    }

    #[tokio::test]
    async fn scenario_b_feature_branch_build_falls_back_to_normal() {
        let broker = Arc::new(MockTaskBrokerClient::new());
        let scheduler = PriorityScheduler::new(broker);
        let md = metadata(&[("job_type", json!("build")), ("branch", json!("feature/new-x"))]);
        let task = scheduler.submit_job(TaskPayload::default(), md).await.unwrap();
        assert_eq!(task.queue, "normal");
    }

    #[tokio::test]
    async fn scenario_c_rollback_escalates_via_contains_rule() {
        let broker = Arc::new(MockTaskBrokerClient::new());
        let scheduler = PriorityScheduler::new(broker);
        scheduler.add_routing_rule(RoutingRule {
            name: "rollback-escalation".into(),
            priority: 110,
            conditions: vec![Condition {
                field: "job_type".into(),
                operator: ConditionOperator::Contains,
                value: json!("rollback"),
            }],
            target_queue: "critical".into(),
        });

        let md = metadata(&[("job_type", json!("rollback"))]);
        let task = scheduler.submit_job(TaskPayload::default(), md.clone()).await.unwrap();
        assert_eq!(task.queue, "critical");

        let queue = default_queue_configs().remove("critical").unwrap();
        let priority = PriorityScheduler::compute_priority(&queue, &md);
        assert_eq!(priority, 100); // midpoint(90,100)=95 +20 -> clamp to 100
    }

    #[test]
    fn priority_extremes_clamp_to_range() {
        let queue = default_queue_configs().remove("normal").unwrap();
        let md = metadata(&[("priority", json!(i64::MAX))]);
        assert_eq!(PriorityScheduler::compute_priority(&queue, &md), 69);
        let md = metadata(&[("priority", json!(i64::MIN))]);
        assert_eq!(PriorityScheduler::compute_priority(&queue, &md), 30);
    }

    #[test]
    fn routing_rules_evaluated_in_priority_desc_order() {
        let broker = Arc::new(MockTaskBrokerClient::new());
        let scheduler = PriorityScheduler::new(broker);
        scheduler.add_routing_rule(RoutingRule {
            name: "low".into(),
            priority: 10,
            conditions: vec![],
            target_queue: "low-priority".into(),
        });
        scheduler.add_routing_rule(RoutingRule {
            name: "high".into(),
            priority: 100,
            conditions: vec![],
            target_queue: "critical".into(),
        });
        let resolved = scheduler.resolve_queue(&HashMap::new());
        assert_eq!(resolved, "critical");
    }
}
