//! ---
//! kormit_section: "02-runtime-integration"
//! kormit_subsection: "module"
//! kormit_type: "source"
//! kormit_scope: "code"
//! kormit_description: "Container engine abstraction with Docker and simulated engines."
//! kormit_version: "v0.0.0-prealpha"
//! kormit_owner: "tbd"
//! ---
//! Runtime client for Kormit.
//!
//! Everything above this crate talks to a container engine through the
//! [`RuntimeClient`] trait. Two engines ship with it: [`DockerRuntime`]
//! (Docker Engine API, behind the `docker` feature) and [`SimulatedRuntime`],
//! a deterministic in-memory engine used by tests and the `simulated` engine
//! mode of the daemon.

pub mod client;
#[cfg(feature = "docker")]
pub mod docker;
pub mod error;
pub mod model;
pub mod retry;
pub mod simulated;

pub use client::RuntimeClient;
#[cfg(feature = "docker")]
pub use docker::DockerRuntime;
pub use error::{Result, RuntimeError};
pub use model::{
    sanitize_name, Container, ContainerSpec, ContainerStatus, LogStream, DEPLOYMENT_LABEL,
    MANAGED_LABEL,
};
pub use retry::RetryPolicy;
pub use simulated::{SimOp, SimulatedRuntime};
