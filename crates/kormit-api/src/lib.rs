//! ---
//! kormit_section: "05-networking-external-interfaces"
//! kormit_subsection: "module"
//! kormit_type: "source"
//! kormit_scope: "code"
//! kormit_description: "REST API over deployments and containers."
//! kormit_version: "v0.0.0-prealpha"
//! kormit_owner: "tbd"
//! ---

mod error;

use std::collections::VecDeque;
use std::future::Future;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderName, HeaderValue, Method, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use kormit_core::{Deployment, DeploymentSpec, Reconciler};
use kormit_runtime::{Container, ContainerSpec, LogStream, RuntimeError};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub use error::ApiError;

const DEFAULT_LOG_TAIL: usize = 100;
const MAX_LOG_TAIL: usize = 5_000;
/// A running container's log stream never ends; collection stops once it
/// has been quiet this long.
const LOG_IDLE: Duration = Duration::from_millis(500);
const LOG_DEADLINE: Duration = Duration::from_secs(5);

/// Shared API state exposed to handlers.
#[derive(Debug, Clone)]
pub struct ApiState {
    reconciler: Arc<Reconciler>,
}

impl ApiState {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self { reconciler }
    }
}

pub struct ApiServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl ApiServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(err.into()),
        }
    }
}

/// Build the router with tracing and CORS for `cors_origins`.
pub fn router(state: Arc<ApiState>, cors_origins: &[String]) -> Result<Router> {
    let origins = cors_origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin)
                .with_context(|| format!("invalid CORS origin `{origin}`"))
        })
        .collect::<Result<Vec<_>>>()?;
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::ACCEPT,
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static("x-csrf-token"),
        ])
        .allow_credentials(true);

    let api = Router::new()
        .route("/", get(root))
        .route(
            "/api/deployments",
            get(list_deployments).post(create_deployment),
        )
        .route(
            "/api/deployments/:id",
            get(get_deployment).delete(delete_deployment),
        )
        .route("/api/deployments/:id/restart", post(restart_deployment))
        .route("/api/deployments/:id/scale", post(scale_deployment))
        .route("/api/deployments/:id/activate", post(activate_deployment))
        .route(
            "/api/deployments/:id/deactivate",
            post(deactivate_deployment),
        )
        .route("/api/containers", get(list_containers).post(create_container))
        .route(
            "/api/containers/:id",
            get(get_container).delete(delete_container),
        )
        .route("/api/containers/:id/start", post(start_container))
        .route("/api/containers/:id/stop", post(stop_container))
        .route("/api/containers/:id/logs", get(container_logs))
        .with_state(state);

    Ok(api.layer(cors).layer(TraceLayer::new_for_http()))
}

/// Spawn the REST API.
pub fn spawn_api_server(
    state: Arc<ApiState>,
    addr: SocketAddr,
    cors_origins: &[String],
) -> Result<ApiServer> {
    let router = router(state, cors_origins)?;

    let listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind API listener {addr}"))?;
    listener
        .set_nonblocking(true)
        .context("failed to configure API listener as non-blocking")?;
    let tcp_listener =
        TcpListener::from_std(listener).context("failed to create tokio listener")?;
    let addr = tcp_listener
        .local_addr()
        .context("failed to read API listener address")?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        info!(address = %addr, "api server listening");
        if let Err(err) = axum::serve(tcp_listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
        {
            error!(address = %addr, error = %err, "api server exited with error");
            return Err(err.into());
        }
        Ok(())
    });

    Ok(ApiServer {
        addr,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

#[derive(Debug, Serialize)]
struct RootResponse {
    status: &'static str,
    message: &'static str,
}

#[derive(Debug, Deserialize)]
struct ScaleRequest {
    replicas: i64,
}

#[derive(Debug, Deserialize)]
struct CreateContainerRequest {
    name: String,
    image: String,
    #[serde(default)]
    env: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    tail: Option<usize>,
}

#[derive(Debug, Serialize)]
struct LogsResponse {
    id: String,
    logs: Vec<String>,
}

/// Run a mutating operation on its own task so a dropped connection does
/// not cancel a reconciliation halfway.
async fn detached<T, F>(operation: F) -> Result<T, ApiError>
where
    F: Future<Output = kormit_core::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(operation)
        .await
        .map_err(|err| {
            ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("operation task failed: {err}"),
            )
        })?
        .map_err(ApiError::from)
}

async fn root() -> Json<RootResponse> {
    Json(RootResponse {
        status: "ok",
        message: "Kormit API running",
    })
}

async fn list_deployments(State(state): State<Arc<ApiState>>) -> Json<Vec<Deployment>> {
    Json(state.reconciler.list_deployments())
}

async fn create_deployment(
    State(state): State<Arc<ApiState>>,
    Json(spec): Json<DeploymentSpec>,
) -> Result<(StatusCode, Json<Deployment>), ApiError> {
    let reconciler = state.reconciler.clone();
    let deployment = detached(async move { reconciler.create_deployment(spec).await }).await?;
    Ok((StatusCode::CREATED, Json(deployment)))
}

async fn get_deployment(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<Deployment>, ApiError> {
    Ok(Json(state.reconciler.get_deployment(&id)?))
}

async fn delete_deployment(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let reconciler = state.reconciler.clone();
    detached(async move { reconciler.delete_deployment(&id).await }).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn restart_deployment(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<Deployment>, ApiError> {
    let reconciler = state.reconciler.clone();
    detached(async move { reconciler.restart_deployment(&id).await })
        .await
        .map(Json)
}

async fn scale_deployment(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(request): Json<ScaleRequest>,
) -> Result<Json<Deployment>, ApiError> {
    let reconciler = state.reconciler.clone();
    detached(async move { reconciler.scale_deployment(&id, request.replicas).await })
        .await
        .map(Json)
}

async fn activate_deployment(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<Deployment>, ApiError> {
    let reconciler = state.reconciler.clone();
    detached(async move { reconciler.activate_deployment(&id).await })
        .await
        .map(Json)
}

async fn deactivate_deployment(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<Deployment>, ApiError> {
    let reconciler = state.reconciler.clone();
    detached(async move { reconciler.deactivate_deployment(&id).await })
        .await
        .map(Json)
}

async fn list_containers(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<Vec<Container>>, ApiError> {
    Ok(Json(state.reconciler.list_containers().await?))
}

async fn create_container(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<CreateContainerRequest>,
) -> Result<(StatusCode, Json<Container>), ApiError> {
    let spec = ContainerSpec::new(request.name, request.image).with_env(request.env);
    let reconciler = state.reconciler.clone();
    let container = detached(async move { reconciler.create_container(spec).await }).await?;
    Ok((StatusCode::CREATED, Json(container)))
}

async fn get_container(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<Container>, ApiError> {
    Ok(Json(state.reconciler.get_container(&id)?))
}

async fn delete_container(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let reconciler = state.reconciler.clone();
    detached(async move { reconciler.delete_container(&id).await }).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_container(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<Container>, ApiError> {
    let reconciler = state.reconciler.clone();
    detached(async move { reconciler.start_container(&id).await })
        .await
        .map(Json)
}

async fn stop_container(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<Container>, ApiError> {
    let reconciler = state.reconciler.clone();
    detached(async move { reconciler.stop_container(&id).await })
        .await
        .map(Json)
}

async fn container_logs(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<LogsResponse>, ApiError> {
    let tail = query.tail.unwrap_or(DEFAULT_LOG_TAIL).min(MAX_LOG_TAIL);
    let stream = state.reconciler.container_logs(&id).await?;
    let logs = collect_tail(stream, tail, LOG_IDLE, LOG_DEADLINE)
        .await
        .map_err(|err| ApiError::from(kormit_core::CoreError::from(err)))?;
    Ok(Json(LogsResponse { id, logs }))
}

/// Keep the last `tail` lines of `stream`, stopping at its end, after `idle`
/// without output, or once `deadline` has passed.
async fn collect_tail(
    mut stream: LogStream,
    tail: usize,
    idle: Duration,
    deadline: Duration,
) -> Result<Vec<String>, RuntimeError> {
    let mut ring: VecDeque<String> = VecDeque::with_capacity(tail.min(DEFAULT_LOG_TAIL));
    let cutoff = Instant::now() + deadline;
    loop {
        let wait = idle.min(cutoff.saturating_duration_since(Instant::now()));
        if wait.is_zero() {
            break;
        }
        match tokio::time::timeout(wait, stream.next()).await {
            Ok(Some(Ok(line))) => {
                if tail == 0 {
                    continue;
                }
                if ring.len() == tail {
                    ring.pop_front();
                }
                ring.push_back(line);
            }
            Ok(Some(Err(err))) => return Err(err),
            Ok(None) | Err(_) => break,
        }
    }
    Ok(ring.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn tail_keeps_last_lines_of_finite_stream() {
        let lines = (1..=5).map(|n| Ok(format!("line {n}")));
        let logs = collect_tail(
            stream::iter(lines).boxed(),
            2,
            Duration::from_millis(50),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(logs, vec!["line 4".to_owned(), "line 5".to_owned()]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_stream_stops_collection() {
        let endless = stream::iter(vec![Ok("hello".to_owned())]).chain(stream::pending());
        let logs = collect_tail(
            endless.boxed(),
            10,
            Duration::from_millis(50),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(logs, vec!["hello".to_owned()]);
    }

    #[tokio::test]
    async fn stream_errors_are_returned() {
        let failing = stream::iter(vec![Err(RuntimeError::unavailable("gone"))]);
        let err = collect_tail(
            failing.boxed(),
            10,
            Duration::from_millis(50),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(err.is_retryable());
    }
}
