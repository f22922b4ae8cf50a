pub mod broker;
pub mod config;
pub mod error;
pub mod jobspec;
pub mod lifecycle;
pub mod logshipper;
pub mod metrics;
pub mod model;
pub mod monitor;
pub mod processor;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod trigger;
pub mod worker;

pub use broker::{JobFilters, JobStore, MockTaskBrokerClient, TaskBrokerClient};
pub use config::Config;
pub use error::{Error, Result};
pub use lifecycle::{LifecycleManager, LifecycleManagerConfig};
pub use metrics::Metrics;
pub use model::{Capability, Job, JobConfig, JobStatus, Project, SourceType, Task, TaskPayload};
pub use monitor::{ResourceMonitor, WorkerResourceUsage};
pub use processor::{
    DatabaseSecretsProvider, JobProcessor, JobResult, LocalSecretsProvider, NoSecretsProvider, ProcessorConfig, SecretsProvider,
};
pub use scheduler::PriorityScheduler;
pub use trigger::{TriggerOutcome, TriggerProcessor};
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerPoolStats};

/// Current version of reactorcide
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_available() {
        assert!(!VERSION.is_empty());
    }
}
