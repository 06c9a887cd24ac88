//! ---
//! kormit_section: "03-observability"
//! kormit_subsection: "module"
//! kormit_type: "source"
//! kormit_scope: "code"
//! kormit_description: "Metrics collection and export utilities."
//! kormit_version: "v0.0.0-prealpha"
//! kormit_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{
    GaugeVec, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec,
    Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across services.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %addr, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

/// Render every metric family in the registry using the text exposition format.
pub fn render(registry: &Registry) -> Result<String> {
    let families = registry.gather();
    TextEncoder::new()
        .encode_to_string(&families)
        .context("failed to encode metrics")
}

async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    match render(&registry) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                String::from("metrics encoding error"),
            )
                .into_response()
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Return the bound address for convenience.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Metrics recorded by the daemon process itself.
#[derive(Clone)]
pub struct DaemonMetrics {
    registry: SharedRegistry,
    starts_total: IntCounter,
    config_load_seconds: Histogram,
    build_info: GaugeVec,
}

impl DaemonMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let starts_total = IntCounter::with_opts(Opts::new(
            "kormitd_starts_total",
            "Total number of times the Kormit daemon has initialised",
        ))?;
        registry.register(Box::new(starts_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.001, 2.0, 16)
            .context("failed to construct histogram buckets")?;
        let config_load_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "kormitd_config_load_seconds",
                "Time spent loading and validating configuration",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(config_load_seconds.clone()))?;

        let build_info = GaugeVec::new(
            Opts::new(
                "kormitd_build_info",
                "Build metadata for the running daemon binary",
            ),
            &["version", "engine"],
        )?;
        registry.register(Box::new(build_info.clone()))?;

        Ok(Self {
            registry,
            starts_total,
            config_load_seconds,
            build_info,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn observe_config_load(&self, seconds: f64) {
        self.config_load_seconds.observe(seconds);
    }

    pub fn set_build_info(&self, version: &str, engine: &str) {
        self.build_info
            .with_label_values(&[version, engine])
            .set(1.0);
    }
}

/// Metric families covering the runtime client, registry and reconciler.
#[derive(Clone, Debug)]
pub struct ReconcilerMetrics {
    registry: SharedRegistry,
    deployments: IntGaugeVec,
    runtime_ops: IntCounterVec,
    runtime_retries: IntCounterVec,
    drift_events: IntCounterVec,
    refreshes: IntCounterVec,
    operation_seconds: HistogramVec,
}

impl ReconcilerMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let deployments = IntGaugeVec::new(
            Opts::new(
                "kormit_deployments",
                "Number of deployments currently in each lifecycle status",
            ),
            &["status"],
        )?;
        registry.register(Box::new(deployments.clone()))?;

        let runtime_ops = IntCounterVec::new(
            Opts::new(
                "kormit_runtime_operations_total",
                "Container engine calls by operation and outcome",
            ),
            &["op", "outcome"],
        )?;
        registry.register(Box::new(runtime_ops.clone()))?;

        let runtime_retries = IntCounterVec::new(
            Opts::new(
                "kormit_runtime_retries_total",
                "Engine calls retried after the engine was unreachable",
            ),
            &["op"],
        )?;
        registry.register(Box::new(runtime_retries.clone()))?;

        let drift_events = IntCounterVec::new(
            Opts::new(
                "kormit_drift_events_total",
                "Divergences between cached and engine-reported container state",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(drift_events.clone()))?;

        let refreshes = IntCounterVec::new(
            Opts::new(
                "kormit_registry_refreshes_total",
                "Registry refresh requests, split into engine queries and coalesced joins",
            ),
            &["mode"],
        )?;
        registry.register(Box::new(refreshes.clone()))?;

        let buckets = prometheus::exponential_buckets(0.005, 2.0, 14)
            .context("failed to construct histogram buckets")?;
        let operation_seconds = HistogramVec::new(
            HistogramOpts::new(
                "kormit_deployment_operation_seconds",
                "Wall time spent inside deployment lifecycle operations",
            )
            .buckets(buckets),
            &["operation"],
        )?;
        registry.register(Box::new(operation_seconds.clone()))?;

        Ok(Self {
            registry,
            deployments,
            runtime_ops,
            runtime_retries,
            drift_events,
            refreshes,
            operation_seconds,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn set_deployments(&self, status: &str, count: usize) {
        self.deployments
            .with_label_values(&[status])
            .set(count as i64);
    }

    pub fn record_runtime_op(&self, op: &str, success: bool) {
        let outcome = if success { "ok" } else { "error" };
        self.runtime_ops.with_label_values(&[op, outcome]).inc();
    }

    pub fn record_retry(&self, op: &str) {
        self.runtime_retries.with_label_values(&[op]).inc();
    }

    pub fn record_drift(&self, kind: &str) {
        self.drift_events.with_label_values(&[kind]).inc();
    }

    pub fn record_refresh(&self, coalesced: bool) {
        let mode = if coalesced { "coalesced" } else { "query" };
        self.refreshes.with_label_values(&[mode]).inc();
    }

    pub fn observe_operation(&self, operation: &str, seconds: f64) {
        self.operation_seconds
            .with_label_values(&[operation])
            .observe(seconds);
    }
}

pub use prometheus;
