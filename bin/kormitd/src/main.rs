//! ---
//! kormit_section: "01-core-functionality"
//! kormit_subsection: "binary"
//! kormit_type: "source"
//! kormit_scope: "code"
//! kormit_description: "Binary entrypoint for the Kormit daemon."
//! kormit_version: "v0.0.0-prealpha"
//! kormit_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kormit_api::{spawn_api_server, ApiServer, ApiState};
use kormit_common::config::{AppConfig, EngineKind};
use kormit_common::logging::init_tracing;
use kormit_core::{Reconciler, ReconcilerSettings};
use kormit_metrics::{
    new_registry, spawn_http_server, DaemonMetrics, ReconcilerMetrics, SharedRegistry,
};
use kormit_registry::ContainerRegistry;
use kormit_runtime::{RetryPolicy, RuntimeClient, SimulatedRuntime};
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    version = concat!("Kormit ", env!("CARGO_PKG_VERSION")),
    about = "Kormit container orchestration daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, help = "Override the configured container engine")]
    engine: Option<CliEngine>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliEngine {
    Docker,
    Simulated,
}

impl From<CliEngine> for EngineKind {
    fn from(value: CliEngine) -> Self {
        match value {
            CliEngine::Docker => EngineKind::Docker,
            CliEngine::Simulated => EngineKind::Simulated,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the control plane")]
    Run,
    #[command(about = "Connect to the container engine, list containers and exit")]
    CheckEngine,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("config/kormit.toml"));
    candidates.push(PathBuf::from("config/app.toml"));

    let load_started = Instant::now();
    let loaded_config = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded_config.config;
    let load_duration = load_started.elapsed();
    if let Some(engine) = cli.engine {
        config.runtime.engine = engine.into();
    }

    init_tracing("kormitd", &config.logging)?;
    match &loaded_config.source {
        Some(path) => info!(config_path = %path.display(), "configuration loaded"),
        None => info!("running with default configuration"),
    }

    let metrics_registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(metrics_registry.clone())?;
    daemon_metrics.observe_config_load(load_duration.as_secs_f64());

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            daemon_metrics.inc_start();
            run_daemon(config, metrics_registry, daemon_metrics).await?
        }
        Commands::CheckEngine => check_engine(&config).await?,
    }

    Ok(())
}

async fn run_daemon(
    config: AppConfig,
    metrics_registry: SharedRegistry,
    daemon_metrics: DaemonMetrics,
) -> Result<()> {
    let runtime = connect_engine(&config).await?;
    daemon_metrics.set_build_info(env!("CARGO_PKG_VERSION"), runtime.engine());

    let metrics = if config.metrics.enabled {
        Some(ReconcilerMetrics::new(metrics_registry.clone())?)
    } else {
        None
    };
    let retry = RetryPolicy::from_config(&config.runtime.retry);
    let registry_retry = match &metrics {
        Some(m) => retry.clone().with_metrics(m.clone()),
        None => retry.clone(),
    };
    let mut registry = ContainerRegistry::new(runtime.clone(), registry_retry);
    if let Some(m) = &metrics {
        registry = registry.with_metrics(m.clone());
    }
    let registry = Arc::new(registry);

    let mut reconciler = Reconciler::new(
        runtime.clone(),
        registry.clone(),
        ReconcilerSettings::from(&config.reconciler),
    )
    .with_retry(retry);
    if let Some(m) = metrics {
        reconciler = reconciler.with_metrics(m);
    }
    let reconciler = Arc::new(reconciler);

    let initial = registry
        .refresh()
        .await
        .context("initial container refresh failed")?;
    info!(containers = initial.containers.len(), "container registry primed");

    let (shutdown_tx, shutdown_rx) = broadcast::channel(4);
    let drift_task = spawn_drift_loop(
        reconciler.clone(),
        config.reconciler.drift_interval,
        shutdown_rx,
    );

    let metrics_server = if config.metrics.enabled {
        info!(address = %config.metrics.listen, "metrics exporter enabled");
        Some(spawn_http_server(metrics_registry, config.metrics.listen)?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let mut api_server: Option<ApiServer> = None;
    if config.api.enabled {
        let state = Arc::new(ApiState::new(reconciler.clone()));
        match spawn_api_server(state, config.api.listen, &config.api.cors_origins) {
            Ok(server) => api_server = Some(server),
            Err(err) => warn!(error = %err, "failed to start api server"),
        }
    } else {
        info!("api server disabled by configuration");
    }

    info!(engine = runtime.engine(), "daemon running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");

    let _ = shutdown_tx.send(());
    if let Err(err) = drift_task.await {
        warn!(error = %err, "drift loop terminated abnormally");
    }

    if let Some(server) = api_server {
        server.shutdown().await?;
    }

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }

    info!("shutdown complete");
    Ok(())
}

async fn check_engine(config: &AppConfig) -> Result<()> {
    let runtime = connect_engine(config).await?;
    let containers = runtime
        .list_containers()
        .await
        .context("failed to list containers")?;
    println!(
        "Engine: {}\nContainers: {}",
        runtime.engine(),
        containers.len()
    );
    for container in containers {
        println!(
            "  {:<16} {:<10} {:<24} {}",
            container.id,
            container.status.as_str(),
            container.name,
            container.image
        );
    }
    Ok(())
}

/// Build the configured runtime client and wait until the engine answers.
async fn connect_engine(config: &AppConfig) -> Result<Arc<dyn RuntimeClient>> {
    let runtime = build_runtime(config)?;
    RetryPolicy::from_config(&config.runtime.retry)
        .run("ping", || runtime.ping())
        .await
        .with_context(|| format!("{} engine is not reachable", runtime.engine()))?;
    info!(engine = runtime.engine(), "container engine reachable");
    Ok(runtime)
}

fn build_runtime(config: &AppConfig) -> Result<Arc<dyn RuntimeClient>> {
    match config.runtime.engine {
        EngineKind::Simulated => {
            warn!("using the simulated engine; no real containers will be started");
            Ok(Arc::new(SimulatedRuntime::new()))
        }
        #[cfg(feature = "docker")]
        EngineKind::Docker => {
            let docker = kormit_runtime::DockerRuntime::connect(
                config.runtime.docker_host.as_deref(),
                config.runtime.label_scope.clone(),
            )
            .context("failed to configure docker client")?;
            Ok(Arc::new(docker))
        }
        #[cfg(not(feature = "docker"))]
        EngineKind::Docker => {
            anyhow::bail!("kormitd was built without docker support; use --engine simulated")
        }
    }
}

fn spawn_drift_loop(
    reconciler: Arc<Reconciler>,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The registry was primed at startup.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("drift loop shutdown");
                    break;
                }
                _ = interval.tick() => {
                    match reconciler.reconcile_drift().await {
                        Ok(summary) if !summary.degraded.is_empty() => {
                            warn!(degraded = ?summary.degraded, events = summary.events, "drift degraded deployments");
                        }
                        Ok(summary) => {
                            debug!(containers = summary.containers, events = summary.events, busy = summary.busy.len(), "drift pass complete");
                        }
                        Err(err) => {
                            error!(error = %err, "drift pass failed");
                        }
                    }
                }
            }
        }
    })
}
