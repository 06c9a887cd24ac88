//! ---
//! kormit_section: "01-core-functionality"
//! kormit_subsection: "module"
//! kormit_type: "source"
//! kormit_scope: "code"
//! kormit_description: "Deployment entity, lifecycle status and creation spec."
//! kormit_version: "v0.0.0-prealpha"
//! kormit_owner: "tbd"
//! ---
use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    /// Accepted, no replica requested yet.
    Pending,
    /// Convergence in progress.
    Scaling,
    /// Every desired replica exists and is running.
    Running,
    /// Convergence failed or drift was observed; members are left as they are.
    Degraded,
    /// Deactivated; replicas exist but are stopped.
    Stopped,
}

impl DeploymentStatus {
    pub const ALL: [DeploymentStatus; 5] = [
        Self::Pending,
        Self::Scaling,
        Self::Running,
        Self::Degraded,
        Self::Stopped,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scaling => "scaling",
            Self::Running => "running",
            Self::Degraded => "degraded",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named group of replicas sharing one image.
///
/// Only `id, name, description, status, replicas, createdAt` are part of the
/// serialised shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub id: String,
    pub name: String,
    pub description: String,
    pub status: DeploymentStatus,
    #[serde(rename = "replicas")]
    pub desired_replicas: u32,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub image: String,
    #[serde(skip)]
    pub env: Vec<String>,
    #[serde(skip)]
    pub members: IndexSet<String>,
}

impl Deployment {
    pub(crate) fn new(id: String, spec: DeploymentSpec, replicas: u32, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: spec.name,
            description: spec.description,
            status: DeploymentStatus::Pending,
            desired_replicas: replicas,
            created_at: now,
            image: spec.image,
            env: spec.env,
            members: IndexSet::new(),
        }
    }

    /// Member count matches the desired count and the last operation settled cleanly.
    pub fn is_converged(&self) -> bool {
        self.members.len() == self.desired_replicas as usize
            && matches!(
                self.status,
                DeploymentStatus::Running | DeploymentStatus::Stopped
            )
    }
}

/// Request body for creating a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(alias = "desiredReplicas")]
    pub replicas: i64,
    pub image: String,
    #[serde(default)]
    pub env: Vec<String>,
}

impl DeploymentSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>, replicas: i64) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            replicas,
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Validate the request and return the desired replica count.
    pub fn validate(&self) -> Result<u32> {
        if self.name.trim().is_empty() {
            return Err(CoreError::InvalidSpec("name must not be empty".into()));
        }
        if self.image.trim().is_empty() {
            return Err(CoreError::InvalidSpec("image must not be empty".into()));
        }
        if let Some(bad) = self.env.iter().find(|entry| !entry.contains('=')) {
            return Err(CoreError::InvalidSpec(format!(
                "environment entry `{bad}` is not KEY=VALUE"
            )));
        }
        validate_replicas(self.replicas)
    }
}

pub fn validate_replicas(replicas: i64) -> Result<u32> {
    u32::try_from(replicas).map_err(|_| {
        CoreError::InvalidSpec(format!(
            "replica count must be between 0 and {}, got {replicas}",
            u32::MAX
        ))
    })
}
