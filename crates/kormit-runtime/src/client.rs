//! ---
//! kormit_section: "02-runtime-integration"
//! kormit_subsection: "module"
//! kormit_type: "source"
//! kormit_scope: "code"
//! kormit_description: "Capability trait implemented by every container engine."
//! kormit_version: "v0.0.0-prealpha"
//! kormit_owner: "tbd"
//! ---
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Container, ContainerSpec, LogStream};

/// Boundary through which every container engine operation flows.
///
/// Implementations serialise their own internal state; callers may share a
/// single client across tasks behind an `Arc`.
#[async_trait]
pub trait RuntimeClient: Send + Sync + Debug {
    /// Short engine name used in logs and build info.
    fn engine(&self) -> &'static str;

    /// Confirm the engine is reachable.
    async fn ping(&self) -> Result<()>;

    /// Snapshot of every container visible to this client, in engine order.
    async fn list_containers(&self) -> Result<Vec<Container>>;

    async fn inspect_container(&self, id: &str) -> Result<Container>;

    /// Create (but do not start) a container.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<Container>;

    /// Start a container. Starting a running container returns its current state.
    async fn start_container(&self, id: &str) -> Result<Container>;

    /// Ask the container to exit, forcibly terminating it once `grace` elapses.
    /// Stopping a stopped container returns its current state.
    async fn stop_container(&self, id: &str, grace: Duration) -> Result<Container>;

    /// Remove a container. Only ids the client has never seen yield `NotFound`.
    async fn remove_container(&self, id: &str) -> Result<()>;

    /// Fresh log stream from the beginning of the container's output. The
    /// stream ends once the container has exited and its output is drained.
    async fn stream_logs(&self, id: &str) -> Result<LogStream>;
}
