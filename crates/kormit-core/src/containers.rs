//! ---
//! kormit_section: "01-core-functionality"
//! kormit_subsection: "module"
//! kormit_type: "source"
//! kormit_scope: "code"
//! kormit_description: "Direct container operations exposed next to deployments."
//! kormit_version: "v0.0.0-prealpha"
//! kormit_owner: "tbd"
//! ---
//! Container operations.
//!
//! Operations on a container that belongs to a deployment take that
//! deployment's exclusive section, so they never interleave with a scale or
//! restart of the same deployment, and re-derive its status afterwards.

use std::sync::Arc;

use kormit_runtime::{Container, ContainerSpec, LogStream};
use tracing::{info, instrument};

use crate::convergence::DeploymentSlot;
use crate::error::Result;
use crate::reconciler::Reconciler;

impl Reconciler {
    pub fn get_container(&self, id: &str) -> Result<Container> {
        Ok(self.registry.get(id)?)
    }

    /// Refresh the registry and return every known container.
    pub async fn list_containers(&self) -> Result<Vec<Container>> {
        self.registry.refresh().await?;
        Ok(self.registry.list())
    }

    /// Create a standalone container that belongs to no deployment.
    #[instrument(skip(self, spec), fields(name = %spec.name, image = %spec.image))]
    pub async fn create_container(&self, spec: ContainerSpec) -> Result<Container> {
        spec.validate()?;
        let created = self
            .retry
            .run("create", || self.runtime.create_container(&spec))
            .await?;
        self.registry.record_created(created.clone());
        info!(container = %created.id, "standalone container created");
        Ok(created)
    }

    #[instrument(skip(self))]
    pub async fn start_container(&self, id: &str) -> Result<Container> {
        let owner = self.owner_of(id);
        let _gate = match &owner {
            Some(slot) => Some(slot.acquire_any().await),
            None => None,
        };
        let container = self
            .retry
            .run("start", || self.runtime.start_container(id))
            .await?;
        self.registry.record_updated(container.clone());
        if let Some(slot) = &owner {
            self.resettle(slot);
        }
        Ok(container)
    }

    #[instrument(skip(self))]
    pub async fn stop_container(&self, id: &str) -> Result<Container> {
        let owner = self.owner_of(id);
        let _gate = match &owner {
            Some(slot) => Some(slot.acquire_any().await),
            None => None,
        };
        let container = self.stop_replica(id).await?;
        if let Some(slot) = &owner {
            self.resettle(slot);
        }
        Ok(container)
    }

    /// Stop and remove a container. Removing an unknown or already removed
    /// container succeeds. A removed member leaves its deployment `degraded`
    /// until it is scaled back up.
    #[instrument(skip(self))]
    pub async fn delete_container(&self, id: &str) -> Result<()> {
        let owner = self.owner_of(id);
        let _gate = match &owner {
            Some(slot) => Some(slot.acquire_any().await),
            None => None,
        };
        self.retire_replica(id).await?;
        if let Some(slot) = &owner {
            slot.update(|d| d.members.shift_remove(id));
            self.resettle(slot);
        }
        info!(container = %id, "container deleted");
        Ok(())
    }

    /// Fresh log stream for the container.
    pub async fn container_logs(&self, id: &str) -> Result<LogStream> {
        Ok(self
            .retry
            .run("logs", || self.runtime.stream_logs(id))
            .await?)
    }

    fn owner_of(&self, container_id: &str) -> Option<Arc<DeploymentSlot>> {
        self.slots()
            .into_iter()
            .find(|slot| !slot.is_retired() && slot.has_member(container_id))
    }
}
