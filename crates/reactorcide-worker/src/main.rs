use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use reactorcide_core::config::{Config, ContainerRunnerConfig, ContainerRunnerKind, SecretsStorageKind};
use reactorcide_core::runner;
use reactorcide_core::{
    retry::RetryConfig, DatabaseSecretsProvider, JobProcessor, LifecycleManager, LifecycleManagerConfig,
    LocalSecretsProvider, Metrics, NoSecretsProvider, PriorityScheduler, ProcessorConfig, SecretsProvider,
    TriggerProcessor, WorkerPool, WorkerPoolConfig,
};
use reactorcide_core::broker::{HttpJobStore, HttpTaskBrokerClient};
use reactorcide_core::logshipper::{InMemoryObjectStore, ObjectStore, S3ObjectStore};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "reactorcide-worker", about = "reactorcide CI job execution worker", version)]
struct Cli {
    #[arg(short, long, value_name = "FILE", help = "Configuration file path")]
    config: Option<String>,

    #[arg(short, long, help = "Enable verbose logging")]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker pool until shut down (the default if no subcommand is given)
    Run,

    /// Validate and print the effective configuration
    Config {
        #[arg(short, long, help = "Print the full configuration")]
        show: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    info!("starting reactorcide-worker v{}", reactorcide_core::VERSION);

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env()?,
    };
    config.validate()?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Config { show } => {
            info!("configuration is valid");
            if show {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Run => run_worker(config).await?,
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let log_directive = if verbose { "reactorcide=debug" } else { "reactorcide=info" };

    tracing_subscriber::fmt()
        .with_env_filter(log_directive)
        .with_target(false)
        .init();
}

async fn build_runner(config: &ContainerRunnerConfig) -> anyhow::Result<Arc<dyn runner::ContainerRunner>> {
    let kind = match config.kind {
        ContainerRunnerKind::Auto => match runner::probe_auto_runner_kind() {
            "kubernetes" => ContainerRunnerKind::Kubernetes,
            _ => ContainerRunnerKind::Docker,
        },
        other => other,
    };

    Ok(match kind {
        ContainerRunnerKind::Docker => Arc::new(runner::docker::DockerRunner::connect(Some(&config.docker_socket_path))?),
        ContainerRunnerKind::Kubernetes => {
            Arc::new(runner::kubernetes::KubernetesRunner::connect(config.kubernetes_namespace.clone()).await?)
        }
        ContainerRunnerKind::Containerd => {
            Arc::new(runner::containerd::ContainerdRunner::new(config.containerd_binary_path.clone(), "default"))
        }
        ContainerRunnerKind::Auto => unreachable!("auto resolved above"),
    })
}

fn build_secrets_provider(config: &reactorcide_core::config::SecretsConfig, broker_endpoint: &str) -> Arc<dyn SecretsProvider> {
    match config.storage {
        SecretsStorageKind::None => Arc::new(NoSecretsProvider),
        SecretsStorageKind::Local => {
            let root = config.local_path.clone().expect("config.validate() requires local_path when storage=local");
            Arc::new(LocalSecretsProvider::new(root))
        }
        SecretsStorageKind::Database => Arc::new(DatabaseSecretsProvider::new(broker_endpoint)),
    }
}

async fn build_object_store(config: &reactorcide_core::config::ObjectStoreConfig) -> Arc<dyn ObjectStore> {
    match &config.bucket {
        Some(bucket) => Arc::new(S3ObjectStore::connect(bucket.clone(), config.region.clone(), config.endpoint.as_deref()).await),
        None => {
            info!("no object_store.bucket configured, log chunks stay in an in-memory buffer");
            Arc::new(InMemoryObjectStore::new())
        }
    }
}

async fn run_worker(config: Config) -> anyhow::Result<()> {
    let broker = Arc::new(HttpTaskBrokerClient::new(config.broker.endpoint.clone()));
    let store: Arc<dyn reactorcide_core::JobStore> = Arc::new(HttpJobStore::new(config.broker.endpoint.clone()));
    let container_runner = build_runner(&config.runner).await?;
    let object_store = build_object_store(&config.object_store).await;

    let registry = prometheus::Registry::new();
    let metrics = Metrics::new(&registry)?;

    let secrets = build_secrets_provider(&config.secrets, &config.broker.endpoint);

    let processor = Arc::new(JobProcessor::new(
        container_runner,
        Some(object_store),
        secrets,
        ProcessorConfig {
            default_runner_image: config.worker.default_runner_image.clone(),
            secrets_storage: config.secrets.storage,
            dry_run: false,
            retry: RetryConfig::default(),
        },
    ));

    let scheduler = Arc::new(PriorityScheduler::new(broker.clone()));
    let trigger_processor = Arc::new(TriggerProcessor::new(store.clone(), scheduler, metrics.clone()));

    let pool = Arc::new(WorkerPool::new(
        WorkerPoolConfig {
            queue: config.broker.queue_name.clone(),
            concurrency: config.worker.concurrency,
            poll_interval: Duration::from_millis(config.worker.poll_interval_ms),
            heartbeat_extension_seconds: config.worker.heartbeat_interval_seconds,
        },
        broker,
        store.clone(),
        processor,
        trigger_processor,
        metrics,
    ));

    let worker_id = pool.id().to_string();
    let lifecycle = LifecycleManager::new(
        worker_id.clone(),
        store,
        pool.clone(),
        LifecycleManagerConfig {
            shutdown_timeout: Duration::from_secs(config.worker.shutdown_timeout_seconds),
            cleanup_timeout: Duration::from_secs(config.worker.cleanup_timeout_seconds),
        },
    );

    let recovered = lifecycle.recover_orphaned_jobs().await?;
    if recovered > 0 {
        info!(recovered, worker_id = %worker_id, "recovered orphaned jobs owned by this worker id");
    }

    info!(worker_id = %worker_id, concurrency = config.worker.concurrency, queue = %config.broker.queue_name, "worker pool starting");
    let _handles = pool.clone().start();

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");

    if let Err(e) = lifecycle.graceful_shutdown().await {
        error!(error = %e, "graceful shutdown did not complete cleanly");
    }

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
