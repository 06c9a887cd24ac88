//! ---
//! kormit_section: "02-runtime-integration"
//! kormit_subsection: "module"
//! kormit_type: "source"
//! kormit_scope: "code"
//! kormit_description: "Container model shared by engines, registry and reconciler."
//! kormit_version: "v0.0.0-prealpha"
//! kormit_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};

/// Label attached to every container created through Kormit.
pub const MANAGED_LABEL: &str = "io.kormit.managed";
/// Label carrying the owning deployment id on replica containers.
pub const DEPLOYMENT_LABEL: &str = "io.kormit.deployment";

/// Lazily produced, possibly unbounded sequence of log lines.
pub type LogStream = BoxStream<'static, Result<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Stopped,
    Removed,
}

impl ContainerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Removed => "removed",
        }
    }

    /// Map an engine state string onto the lifecycle kept by Kormit.
    ///
    /// Paused and restarting containers still hold their process, so they
    /// count as running; anything that exited counts as stopped.
    pub fn from_engine_state(state: &str) -> Self {
        match state.trim().to_ascii_lowercase().as_str() {
            "running" | "restarting" | "paused" => Self::Running,
            "exited" | "dead" => Self::Stopped,
            "removing" => Self::Removed,
            _ => Self::Created,
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine view of a single container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: ContainerStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub labels: BTreeMap<String, String>,
}

impl Container {
    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }

    /// Deployment id carried in the replica label, if any.
    pub fn deployment(&self) -> Option<&str> {
        self.labels.get(DEPLOYMENT_LABEL).map(String::as_str)
    }
}

/// Creation request handed to an engine.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(MANAGED_LABEL.to_owned(), "true".to_owned());
        Self {
            name: name.into(),
            image: image.into(),
            env: Vec::new(),
            labels,
        }
    }

    pub fn with_env(mut self, env: impl IntoIterator<Item = String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(RuntimeError::InvalidSpec("image must not be empty".into()));
        }
        if self.name.trim().is_empty() {
            return Err(RuntimeError::InvalidSpec("name must not be empty".into()));
        }
        if let Some(bad) = self.env.iter().find(|entry| !entry.contains('=')) {
            return Err(RuntimeError::InvalidSpec(format!(
                "environment entry `{bad}` is not KEY=VALUE"
            )));
        }
        Ok(())
    }
}

/// Reduce a human supplied name to the character set engines accept for
/// container names.
pub fn sanitize_name(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches(|c: char| !c.is_ascii_alphanumeric());
    if trimmed.is_empty() {
        "kormit".to_owned()
    } else {
        trimmed.to_owned()
    }
}
