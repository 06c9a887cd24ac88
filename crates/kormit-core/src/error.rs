//! ---
//! kormit_section: "01-core-functionality"
//! kormit_subsection: "module"
//! kormit_type: "source"
//! kormit_scope: "code"
//! kormit_description: "Error taxonomy surfaced by the orchestration core."
//! kormit_version: "v0.0.0-prealpha"
//! kormit_owner: "tbd"
//! ---
use std::fmt;

use kormit_registry::RegistryError;
use kormit_runtime::RuntimeError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Deployment,
    Container,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deployment => f.write_str("deployment"),
            Self::Container => f.write_str("container"),
        }
    }
}

/// Failures returned to callers of the reconciler.
///
/// Partial convergence is not an error: it is recorded as a `degraded`
/// deployment status.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("container engine unavailable: {0}")]
    RuntimeUnavailable(String),
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },
    #[error("invalid spec: {0}")]
    InvalidSpec(String),
    #[error("replica {id} did not become ready: {reason}")]
    ReplicaNotReady { id: String, reason: String },
    #[error(transparent)]
    Runtime(RuntimeError),
}

impl CoreError {
    pub fn deployment_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: EntityKind::Deployment,
            id: id.into(),
        }
    }

    pub fn container_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: EntityKind::Container,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::RuntimeUnavailable(_))
    }
}

impl From<RuntimeError> for CoreError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Unavailable(detail) => Self::RuntimeUnavailable(detail),
            RuntimeError::NotFound(id) => Self::container_not_found(id),
            RuntimeError::InvalidSpec(detail) => Self::InvalidSpec(detail),
            other => Self::Runtime(other),
        }
    }
}

impl From<RegistryError> for CoreError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(id) => Self::container_not_found(id),
            RegistryError::Runtime(err) => err.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_errors_map_onto_core_taxonomy() {
        assert!(CoreError::from(RuntimeError::unavailable("down")).is_unavailable());
        assert_eq!(
            CoreError::from(RuntimeError::not_found("c-1")),
            CoreError::container_not_found("c-1")
        );
        assert!(matches!(
            CoreError::from(RuntimeError::ImageNotFound("x".into())),
            CoreError::Runtime(RuntimeError::ImageNotFound(_))
        ));
        assert_eq!(
            CoreError::deployment_not_found("d-9").to_string(),
            "deployment not found: d-9"
        );
    }
}
