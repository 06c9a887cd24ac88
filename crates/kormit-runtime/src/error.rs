//! ---
//! kormit_section: "02-runtime-integration"
//! kormit_subsection: "module"
//! kormit_type: "source"
//! kormit_scope: "code"
//! kormit_description: "Failure taxonomy reported by container engines."
//! kormit_version: "v0.0.0-prealpha"
//! kormit_owner: "tbd"
//! ---
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Failures surfaced by a [`RuntimeClient`](crate::RuntimeClient).
///
/// The type is `Clone` so a single engine result can be handed to every
/// caller joined on a coalesced registry refresh.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("container engine unavailable: {0}")]
    Unavailable(String),
    #[error("container not found: {0}")]
    NotFound(String),
    #[error("image not found: {0}")]
    ImageNotFound(String),
    #[error("engine resources exhausted: {0}")]
    ResourceExhausted(String),
    #[error("invalid container spec: {0}")]
    InvalidSpec(String),
    #[error("engine conflict: {0}")]
    Conflict(String),
    #[error("engine error: {0}")]
    Engine(String),
}

impl RuntimeError {
    pub fn unavailable(detail: impl Into<String>) -> Self {
        Self::Unavailable(detail.into())
    }

    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }

    /// Only engine unreachability is transient; every other failure is a
    /// definitive answer from the engine.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Stable label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::NotFound(_) => "not_found",
            Self::ImageNotFound(_) => "image_not_found",
            Self::ResourceExhausted(_) => "resource_exhausted",
            Self::InvalidSpec(_) => "invalid_spec",
            Self::Conflict(_) => "conflict",
            Self::Engine(_) => "engine",
        }
    }
}
