use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::Error;

/// Root configuration for a reactorcide worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub runner: ContainerRunnerConfig,

    #[serde(default)]
    pub object_store: ObjectStoreConfig,

    #[serde(default)]
    pub secrets: SecretsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            broker: BrokerConfig::default(),
            runner: ContainerRunnerConfig::default(),
            object_store: ObjectStoreConfig::default(),
            secrets: SecretsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Loads TOML from `path`, then layers `REACTORCIDE_*` environment
    /// overrides on top via the `config` crate before validating.
    pub fn load(path: &str) -> Result<Self, Error> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("REACTORCIDE").separator("__"));

        let settings = builder.build().map_err(|e| Error::config_invalid(format!("failed to build config: {}", e)))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| Error::config_invalid(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self, Error> {
        if let Ok(config_path) = std::env::var("REACTORCIDE_CONFIG") {
            return Self::load(&config_path);
        }

        let default_paths = ["./config/default.toml", "./config/production.toml", "/etc/reactorcide/config.toml"];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.worker.concurrency == 0 {
            return Err(Error::config_invalid("worker.concurrency must be > 0"));
        }
        if self.broker.endpoint.is_empty() {
            return Err(Error::config_invalid("broker.endpoint is required"));
        }
        if matches!(self.secrets.storage, SecretsStorageKind::Local) && self.secrets.local_path.is_none() {
            return Err(Error::config_invalid("secrets.local_path is required when secrets.storage = \"local\""));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_heartbeat_interval_seconds")]
    pub heartbeat_interval_seconds: u64,

    #[serde(default = "default_shutdown_timeout_seconds")]
    pub shutdown_timeout_seconds: u64,

    #[serde(default = "default_cleanup_timeout_seconds")]
    pub cleanup_timeout_seconds: u64,

    #[serde(default = "default_runner_image")]
    pub default_runner_image: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            heartbeat_interval_seconds: default_heartbeat_interval_seconds(),
            shutdown_timeout_seconds: default_shutdown_timeout_seconds(),
            cleanup_timeout_seconds: default_cleanup_timeout_seconds(),
            default_runner_image: default_runner_image(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_heartbeat_interval_seconds() -> u64 {
    30
}

fn default_shutdown_timeout_seconds() -> u64 {
    60
}

fn default_cleanup_timeout_seconds() -> u64 {
    30
}

fn default_runner_image() -> String {
    "alpine:latest".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_queue_name")]
    pub queue_name: String,

    #[serde(default = "default_poll_deadline_ms")]
    pub poll_deadline_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            endpoint: default_broker_endpoint(),
            queue_name: default_queue_name(),
            poll_deadline_ms: default_poll_deadline_ms(),
        }
    }
}

fn default_broker_endpoint() -> String {
    "http://localhost:9090".to_string()
}

fn default_queue_name() -> String {
    "normal".to_string()
}

fn default_poll_deadline_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContainerRunnerKind {
    Docker,
    Containerd,
    Kubernetes,
    Auto,
}

impl Default for ContainerRunnerKind {
    fn default() -> Self {
        ContainerRunnerKind::Auto
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRunnerConfig {
    #[serde(default)]
    pub kind: ContainerRunnerKind,

    #[serde(default = "default_docker_socket")]
    pub docker_socket_path: String,

    #[serde(default = "default_kubernetes_namespace")]
    pub kubernetes_namespace: String,

    #[serde(default = "default_containerd_binary")]
    pub containerd_binary_path: String,
}

impl Default for ContainerRunnerConfig {
    fn default() -> Self {
        Self {
            kind: ContainerRunnerKind::default(),
            docker_socket_path: default_docker_socket(),
            kubernetes_namespace: default_kubernetes_namespace(),
            containerd_binary_path: default_containerd_binary(),
        }
    }
}

fn default_docker_socket() -> String {
    "unix:///var/run/docker.sock".to_string()
}

fn default_kubernetes_namespace() -> String {
    "default".to_string()
}

fn default_containerd_binary() -> String {
    "ctr".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    pub bucket: Option<String>,

    #[serde(default = "default_s3_region")]
    pub region: String,

    pub endpoint: Option<String>,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self { bucket: None, region: default_s3_region(), endpoint: None }
    }
}

fn default_s3_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SecretsStorageKind {
    None,
    Local,
    Database,
}

impl Default for SecretsStorageKind {
    fn default() -> Self {
        SecretsStorageKind::None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsConfig {
    #[serde(default)]
    pub storage: SecretsStorageKind,

    pub local_path: Option<String>,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self { storage: SecretsStorageKind::default(), local_path: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: LogFormat,

    #[serde(default)]
    pub file: Option<FileLogConfig>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), format: default_log_format(), file: None }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    Text,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileLogConfig {
    pub path: String,
    pub rotation: LogRotation,
    #[serde(default)]
    pub max_size_mb: Option<u64>,
    #[serde(default)]
    pub max_files: Option<u32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogRotation {
    Daily,
    Hourly,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.worker.concurrency, 4);
        assert_eq!(config.runner.kind, ContainerRunnerKind::Auto);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut config = Config::default();
        config.worker.concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn local_secrets_without_path_is_rejected() {
        let mut config = Config::default();
        config.secrets.storage = SecretsStorageKind::Local;
        assert!(config.validate().is_err());
        config.secrets.local_path = Some("/etc/reactorcide/secrets.json".to_string());
        assert!(config.validate().is_ok());
    }
}
