//! ---
//! kormit_section: "01-core-functionality"
//! kormit_subsection: "module"
//! kormit_type: "source"
//! kormit_scope: "code"
//! kormit_description: "Deployment reconciler and container operations."
//! kormit_version: "v0.0.0-prealpha"
//! kormit_owner: "tbd"
//! ---
//! Orchestration core for Kormit.
//!
//! [`Reconciler`] owns deployments and converges them through a
//! [`RuntimeClient`](kormit_runtime::RuntimeClient), reading container state
//! from a [`ContainerRegistry`](kormit_registry::ContainerRegistry). It opens
//! no ports and reads no files; ids and timestamps come from injected
//! generators.

mod containers;
mod convergence;
pub mod deployment;
pub mod drift;
pub mod error;
pub mod reconciler;

pub use deployment::{validate_replicas, Deployment, DeploymentSpec, DeploymentStatus};
pub use drift::DriftSummary;
pub use error::{CoreError, EntityKind, Result};
pub use reconciler::{Reconciler, ReconcilerSettings};
