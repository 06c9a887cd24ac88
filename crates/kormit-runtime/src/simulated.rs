//! ---
//! kormit_section: "02-runtime-integration"
//! kormit_subsection: "module"
//! kormit_type: "source"
//! kormit_scope: "code"
//! kormit_description: "Deterministic in-memory engine with fault injection."
//! kormit_version: "v0.0.0-prealpha"
//! kormit_owner: "tbd"
//! ---
//! In-memory container engine.
//!
//! Lifecycle transitions are immediate unless latency is injected, and every
//! failure mode the reconciler must survive can be switched on per container
//! or per image. Out-of-band helpers (`kill_externally`, `stop_externally`,
//! `spawn_external`) mutate engine state without going through the client
//! API, which is how drift is produced in tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use indexmap::IndexMap;
use kormit_common::{Clock, IdGenerator, SequentialIdGenerator, SystemClock};
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

use crate::client::RuntimeClient;
use crate::error::{Result, RuntimeError};
use crate::model::{Container, ContainerSpec, ContainerStatus, LogStream};

const LOG_BUFFER: usize = 256;

/// Client operations counted by the simulated engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    Ping,
    List,
    Inspect,
    Create,
    Start,
    Stop,
    Remove,
    Logs,
}

#[derive(Debug)]
pub struct SimulatedRuntime {
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    state: Mutex<SimState>,
}

#[derive(Debug, Default)]
struct SimState {
    containers: IndexMap<String, SimContainer>,
    removed: HashSet<String>,
    outage: u32,
    denied_images: HashSet<String>,
    capacity: Option<usize>,
    failing_starts: HashSet<String>,
    crashing: HashSet<String>,
    stubborn: HashSet<String>,
    latency: HashMap<SimOp, Duration>,
    calls: HashMap<SimOp, u64>,
}

#[derive(Debug)]
struct SimContainer {
    container: Container,
    output: Vec<String>,
    live: Option<broadcast::Sender<String>>,
}

impl SimContainer {
    fn emit(&mut self, line: impl Into<String>) {
        let line = line.into();
        if let Some(tx) = &self.live {
            let _ = tx.send(line.clone());
        }
        self.output.push(line);
    }

    fn mark_running(&mut self) {
        let (tx, _) = broadcast::channel(LOG_BUFFER);
        self.live = Some(tx);
        self.container.status = ContainerStatus::Running;
    }

    fn mark_stopped(&mut self) {
        self.container.status = ContainerStatus::Stopped;
        // Dropping the sender ends every live log stream.
        self.live = None;
    }
}

impl Default for SimulatedRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedRuntime {
    pub fn new() -> Self {
        Self::with_parts(
            Arc::new(SequentialIdGenerator::new("sim")),
            Arc::new(SystemClock),
        )
    }

    pub fn with_parts(ids: Arc<dyn IdGenerator>, clock: Arc<dyn Clock>) -> Self {
        Self {
            ids,
            clock,
            state: Mutex::new(SimState::default()),
        }
    }

    /// Fail the next `calls` client operations with `Unavailable`.
    pub fn set_unavailable_for(&self, calls: u32) {
        self.state.lock().outage = calls;
    }

    /// Creations from `image` fail with `ImageNotFound`.
    pub fn deny_image(&self, image: impl Into<String>) {
        self.state.lock().denied_images.insert(image.into());
    }

    /// Limit the number of containers the engine will hold.
    pub fn set_capacity(&self, capacity: Option<usize>) {
        self.state.lock().capacity = capacity;
    }

    /// Starting `id` fails with an engine error until cleared.
    pub fn fail_start(&self, id: &str) {
        self.state.lock().failing_starts.insert(id.to_owned());
    }

    pub fn allow_start(&self, id: &str) {
        self.state.lock().failing_starts.remove(id);
    }

    /// Starting `id` succeeds but the process exits immediately.
    pub fn crash_on_start(&self, id: &str) {
        self.state.lock().crashing.insert(id.to_owned());
    }

    /// `id` ignores the graceful signal and is only killed after the grace period.
    pub fn ignore_graceful_stop(&self, id: &str) {
        self.state.lock().stubborn.insert(id.to_owned());
    }

    pub fn set_latency(&self, op: SimOp, latency: Duration) {
        self.state.lock().latency.insert(op, latency);
    }

    /// Append a line to the container output. Returns false for unknown ids.
    pub fn push_log(&self, id: &str, line: impl Into<String>) -> bool {
        match self.state.lock().containers.get_mut(id) {
            Some(entry) => {
                entry.emit(line);
                true
            }
            None => false,
        }
    }

    /// Remove a container behind the client's back.
    pub fn kill_externally(&self, id: &str) -> bool {
        let mut state = self.state.lock();
        if state.containers.shift_remove(id).is_some() {
            state.removed.insert(id.to_owned());
            true
        } else {
            false
        }
    }

    /// Stop a container behind the client's back.
    pub fn stop_externally(&self, id: &str) -> bool {
        match self.state.lock().containers.get_mut(id) {
            Some(entry) => {
                entry.emit("killed by an external actor");
                entry.mark_stopped();
                true
            }
            None => false,
        }
    }

    /// Run a container that was never created through the client.
    pub fn spawn_external(&self, name: &str, image: &str) -> Container {
        let spec = ContainerSpec::new(name, image);
        let mut entry = self.build(&spec);
        entry.mark_running();
        let container = entry.container.clone();
        self.state
            .lock()
            .containers
            .insert(container.id.clone(), entry);
        container
    }

    pub fn calls(&self, op: SimOp) -> u64 {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Creations, starts, stops and removals issued so far.
    pub fn mutation_calls(&self) -> u64 {
        let state = self.state.lock();
        [SimOp::Create, SimOp::Start, SimOp::Stop, SimOp::Remove]
            .iter()
            .map(|op| state.calls.get(op).copied().unwrap_or(0))
            .sum()
    }

    pub fn snapshot(&self, id: &str) -> Option<Container> {
        self.state
            .lock()
            .containers
            .get(id)
            .map(|entry| entry.container.clone())
    }

    pub fn container_count(&self) -> usize {
        self.state.lock().containers.len()
    }

    pub fn running_count(&self) -> usize {
        self.state
            .lock()
            .containers
            .values()
            .filter(|entry| entry.container.is_running())
            .count()
    }

    fn build(&self, spec: &ContainerSpec) -> SimContainer {
        let container = Container {
            id: self.ids.next_id(),
            name: spec.name.clone(),
            image: spec.image.clone(),
            status: ContainerStatus::Created,
            created_at: self.clock.now(),
            labels: spec.labels.clone(),
        };
        SimContainer {
            output: vec![format!("container {} created from {}", spec.name, spec.image)],
            container,
            live: None,
        }
    }

    async fn enter(&self, op: SimOp) -> Result<()> {
        let latency = {
            let mut state = self.state.lock();
            *state.calls.entry(op).or_insert(0) += 1;
            if state.outage > 0 {
                state.outage -= 1;
                debug!(?op, remaining = state.outage, "simulated engine outage");
                return Err(RuntimeError::unavailable("simulated engine outage"));
            }
            state.latency.get(&op).copied().unwrap_or_default()
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }
}

#[async_trait]
impl RuntimeClient for SimulatedRuntime {
    fn engine(&self) -> &'static str {
        "simulated"
    }

    async fn ping(&self) -> Result<()> {
        self.enter(SimOp::Ping).await
    }

    async fn list_containers(&self) -> Result<Vec<Container>> {
        self.enter(SimOp::List).await?;
        Ok(self
            .state
            .lock()
            .containers
            .values()
            .map(|entry| entry.container.clone())
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<Container> {
        self.enter(SimOp::Inspect).await?;
        self.snapshot(id).ok_or_else(|| RuntimeError::not_found(id))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<Container> {
        self.enter(SimOp::Create).await?;
        spec.validate()?;
        let mut state = self.state.lock();
        if state.denied_images.contains(&spec.image) {
            return Err(RuntimeError::ImageNotFound(spec.image.clone()));
        }
        if let Some(capacity) = state.capacity {
            if state.containers.len() >= capacity {
                return Err(RuntimeError::ResourceExhausted(format!(
                    "engine holds its limit of {capacity} containers"
                )));
            }
        }
        if state
            .containers
            .values()
            .any(|entry| entry.container.name == spec.name)
        {
            return Err(RuntimeError::Conflict(format!(
                "container name {} already in use",
                spec.name
            )));
        }
        let entry = self.build(spec);
        let container = entry.container.clone();
        state.containers.insert(container.id.clone(), entry);
        Ok(container)
    }

    async fn start_container(&self, id: &str) -> Result<Container> {
        self.enter(SimOp::Start).await?;
        let mut state = self.state.lock();
        let failing = state.failing_starts.contains(id);
        let crashing = state.crashing.contains(id);
        let entry = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::not_found(id))?;
        if entry.container.is_running() {
            return Ok(entry.container.clone());
        }
        if failing {
            entry.emit("failed to start: simulated engine fault");
            return Err(RuntimeError::Engine(format!("simulated start failure for {id}")));
        }
        entry.mark_running();
        entry.emit("started");
        if crashing {
            entry.emit("process exited with code 1");
            entry.mark_stopped();
        }
        Ok(entry.container.clone())
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<Container> {
        self.enter(SimOp::Stop).await?;
        let stubborn = {
            let state = self.state.lock();
            let entry = state
                .containers
                .get(id)
                .ok_or_else(|| RuntimeError::not_found(id))?;
            if !entry.container.is_running() {
                return Ok(entry.container.clone());
            }
            state.stubborn.contains(id)
        };
        if stubborn {
            tokio::time::sleep(grace).await;
        }
        let mut state = self.state.lock();
        let entry = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::not_found(id))?;
        if entry.container.is_running() {
            if stubborn {
                entry.emit("grace period elapsed; killed");
            } else {
                entry.emit("received stop signal; exiting");
            }
            entry.mark_stopped();
        }
        Ok(entry.container.clone())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.enter(SimOp::Remove).await?;
        let mut state = self.state.lock();
        if state.containers.shift_remove(id).is_some() {
            state.removed.insert(id.to_owned());
            Ok(())
        } else if state.removed.contains(id) {
            Ok(())
        } else {
            Err(RuntimeError::not_found(id))
        }
    }

    async fn stream_logs(&self, id: &str) -> Result<LogStream> {
        self.enter(SimOp::Logs).await?;
        // Backlog and subscription are taken under one lock so no line is
        // lost or repeated between them.
        let (backlog, receiver) = {
            let state = self.state.lock();
            let entry = state
                .containers
                .get(id)
                .ok_or_else(|| RuntimeError::not_found(id))?;
            (
                entry.output.clone(),
                entry.live.as_ref().map(|tx| tx.subscribe()),
            )
        };
        let history = stream::iter(backlog.into_iter().map(Ok));
        let Some(receiver) = receiver else {
            return Ok(history.boxed());
        };
        let live = stream::unfold(receiver, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(line) => return Some((Ok(line), rx)),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return None,
                }
            }
        });
        Ok(history.chain(live).boxed())
    }
}
