//! ---
//! kormit_section: "02-runtime-integration"
//! kormit_subsection: "module"
//! kormit_type: "source"
//! kormit_scope: "code"
//! kormit_description: "Docker Engine API implementation of the runtime client."
//! kormit_version: "v0.0.0-prealpha"
//! kormit_owner: "tbd"
//! ---
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerInspectResponse, ContainerSummary};
use bollard::{Docker, API_DEFAULT_VERSION};
use chrono::{DateTime, TimeZone, Utc};
use futures::stream::{self, StreamExt};
use indexmap::IndexSet;
use parking_lot::Mutex;
use tracing::{debug, info, instrument};

use crate::client::RuntimeClient;
use crate::error::{Result, RuntimeError};
use crate::model::{Container, ContainerSpec, ContainerStatus, LogStream};

const CONNECT_TIMEOUT_SECS: u64 = 120;
const KNOWN_IDS_CAPACITY: usize = 4096;

/// Bounded record of container ids seen through the client, oldest evicted
/// first.
#[derive(Debug)]
struct KnownIds {
    ids: Mutex<IndexSet<String>>,
    capacity: usize,
}

impl KnownIds {
    fn new(capacity: usize) -> Self {
        Self {
            ids: Mutex::new(IndexSet::new()),
            capacity,
        }
    }

    fn remember(&self, id: &str) {
        self.extend([id]);
    }

    fn extend<'a>(&self, seen: impl IntoIterator<Item = &'a str>) {
        let mut ids = self.ids.lock();
        for id in seen {
            // Re-inserting moves the id to the young end.
            ids.shift_remove(id);
            ids.insert(id.to_owned());
        }
        while ids.len() > self.capacity {
            ids.shift_remove_index(0);
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.lock().contains(id)
    }
}

/// Runtime client speaking the Docker Engine API over the local socket or TCP.
#[derive(Debug)]
pub struct DockerRuntime {
    docker: Docker,
    label_scope: Option<String>,
    /// Ids observed through this client; removal of a known id that the
    /// engine no longer has is reported as success.
    known: KnownIds,
}

impl DockerRuntime {
    /// Connect to `host` (a `unix://`, `npipe://`, `tcp://` or `http://` URL),
    /// or to the platform default socket when `host` is `None`.
    ///
    /// `label_scope` (`key=value`) restricts listings to matching containers.
    pub fn connect(host: Option<&str>, label_scope: Option<String>) -> Result<Self> {
        let docker = match host {
            None => Docker::connect_with_local_defaults(),
            Some(addr) if addr.starts_with("tcp://") || addr.starts_with("http://") => {
                Docker::connect_with_http(addr, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
            Some(addr) => {
                Docker::connect_with_socket(addr, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
        }
        .map_err(|err| RuntimeError::unavailable(err.to_string()))?;
        info!(host = host.unwrap_or("local-default"), label_scope = ?label_scope, "docker client configured");
        Ok(Self {
            docker,
            label_scope,
            known: KnownIds::new(KNOWN_IDS_CAPACITY),
        })
    }

    async fn inspect(&self, id: &str) -> Result<Container> {
        let response = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|err| classify(err, id))?;
        let container = from_inspect(response, id);
        self.known.remember(&container.id);
        Ok(container)
    }
}

#[async_trait]
impl RuntimeClient for DockerRuntime {
    fn engine(&self) -> &'static str {
        "docker"
    }

    async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|err| RuntimeError::unavailable(err.to_string()))
    }

    #[instrument(skip(self), level = "debug")]
    async fn list_containers(&self) -> Result<Vec<Container>> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        if let Some(scope) = &self.label_scope {
            filters.insert("label".to_owned(), vec![scope.clone()]);
        }
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };
        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|err| classify(err, "list"))?;
        let containers: Vec<Container> = summaries.into_iter().filter_map(from_summary).collect();
        self.known.extend(containers.iter().map(|c| c.id.as_str()));
        debug!(count = containers.len(), "listed docker containers");
        Ok(containers)
    }

    async fn inspect_container(&self, id: &str) -> Result<Container> {
        self.inspect(id).await
    }

    #[instrument(skip(self, spec), fields(name = %spec.name, image = %spec.image))]
    async fn create_container(&self, spec: &ContainerSpec) -> Result<Container> {
        spec.validate()?;
        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            labels: Some(
                spec.labels
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<HashMap<_, _>>(),
            ),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|err| classify(err, &spec.image))?;
        self.known.remember(&response.id);
        info!(id = %response.id, "created container");
        self.inspect(&response.id).await
    }

    async fn start_container(&self, id: &str) -> Result<Container> {
        match self
            .docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => {}
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => debug!(id, "container already running"),
            Err(err) => return Err(classify(err, id)),
        }
        self.inspect(id).await
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<Container> {
        // The engine delivers SIGKILL itself once `t` seconds pass.
        let options = StopContainerOptions {
            t: grace.as_secs().max(1) as i64,
        };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => {}
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => debug!(id, "container already stopped"),
            Err(err) => return Err(classify(err, id)),
        }
        self.inspect(id).await
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => {
                self.known.remember(id);
                info!(id, "removed container");
                Ok(())
            }
            Err(err) => match classify(err, id) {
                RuntimeError::NotFound(_) if self.known.contains(id) => {
                    debug!(id, "container already removed");
                    Ok(())
                }
                // Removal already in progress on the engine side.
                RuntimeError::Conflict(message) if message.contains("in progress") => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn stream_logs(&self, id: &str) -> Result<LogStream> {
        // Fail fast on unknown ids instead of surfacing the error mid-stream.
        self.inspect(id).await?;
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            tail: "all".to_owned(),
            ..Default::default()
        };
        let subject = id.to_owned();
        let lines = self
            .docker
            .logs(id, Some(options))
            .flat_map(move |chunk| {
                let items: Vec<Result<String>> = match chunk {
                    Ok(output) => output
                        .to_string()
                        .lines()
                        .map(|line| Ok(line.to_owned()))
                        .collect(),
                    Err(err) => vec![Err(classify(err, &subject))],
                };
                stream::iter(items)
            });
        Ok(lines.boxed())
    }
}

/// Translate a bollard error into the runtime taxonomy.
///
/// Anything that is not an HTTP response from the engine means the engine
/// could not be reached.
fn classify(err: BollardError, subject: &str) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => classify_response(status_code, message, subject),
        BollardError::RequestTimeoutError => RuntimeError::unavailable("engine request timed out"),
        other => RuntimeError::unavailable(other.to_string()),
    }
}

fn classify_response(status_code: u16, message: String, subject: &str) -> RuntimeError {
    let lowered = message.to_ascii_lowercase();
    match status_code {
        404 if lowered.contains("no such image") => RuntimeError::ImageNotFound(subject.to_owned()),
        404 => RuntimeError::not_found(subject),
        400 => RuntimeError::InvalidSpec(message),
        409 => RuntimeError::Conflict(message),
        500 if lowered.contains("no space left") || lowered.contains("cannot allocate memory") => {
            RuntimeError::ResourceExhausted(message)
        }
        502..=504 => RuntimeError::unavailable(message),
        _ => RuntimeError::Engine(format!("{status_code}: {message}")),
    }
}

fn from_summary(summary: ContainerSummary) -> Option<Container> {
    let id = summary.id?;
    let name = summary
        .names
        .and_then(|names| names.into_iter().next())
        .map(|name| name.trim_start_matches('/').to_owned())
        .unwrap_or_else(|| id.clone());
    let created_at = summary
        .created
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or_default();
    Some(Container {
        name,
        image: summary.image.unwrap_or_default(),
        status: summary
            .state
            .as_deref()
            .map(ContainerStatus::from_engine_state)
            .unwrap_or(ContainerStatus::Created),
        created_at,
        labels: summary
            .labels
            .unwrap_or_default()
            .into_iter()
            .collect::<BTreeMap<_, _>>(),
        id,
    })
}

fn from_inspect(response: ContainerInspectResponse, requested: &str) -> Container {
    let status = match &response.state {
        Some(state) if state.running == Some(true) => ContainerStatus::Running,
        Some(state) => state
            .status
            .as_ref()
            .map(|status| ContainerStatus::from_engine_state(&status.to_string()))
            .unwrap_or(ContainerStatus::Created),
        None => ContainerStatus::Created,
    };
    let (image, labels) = match response.config {
        Some(config) => (
            config.image.unwrap_or_default(),
            config.labels.unwrap_or_default().into_iter().collect(),
        ),
        None => (String::new(), BTreeMap::new()),
    };
    let created_at = response
        .created
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or_default();
    let id = response.id.unwrap_or_else(|| requested.to_owned());
    Container {
        name: response
            .name
            .map(|name| name.trim_start_matches('/').to_owned())
            .unwrap_or_else(|| id.clone()),
        id,
        image,
        status,
        created_at,
        labels,
    }
}
