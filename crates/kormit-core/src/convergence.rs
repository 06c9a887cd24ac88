//! ---
//! kormit_section: "01-core-functionality"
//! kormit_subsection: "module"
//! kormit_type: "source"
//! kormit_scope: "code"
//! kormit_description: "Per-deployment exclusion, status settlement and replica primitives."
//! kormit_version: "v0.0.0-prealpha"
//! kormit_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, Ordering};

use kormit_runtime::{
    sanitize_name, Container, ContainerSpec, ContainerStatus, RuntimeError, DEPLOYMENT_LABEL,
};
use parking_lot::RwLock;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::deployment::{Deployment, DeploymentStatus};
use crate::error::{CoreError, Result};
use crate::reconciler::Reconciler;

/// Record plus exclusive section for one deployment.
#[derive(Debug)]
pub(crate) struct DeploymentSlot {
    gate: Mutex<()>,
    record: RwLock<Deployment>,
    retired: AtomicBool,
}

impl DeploymentSlot {
    pub(crate) fn new(deployment: Deployment) -> Self {
        Self {
            gate: Mutex::new(()),
            record: RwLock::new(deployment),
            retired: AtomicBool::new(false),
        }
    }

    /// Enter the exclusive section. Fails once the deployment has been deleted
    /// by an operation that held the section before us.
    pub(crate) async fn acquire(&self) -> Result<MutexGuard<'_, ()>> {
        let guard = self.gate.lock().await;
        if self.is_retired() {
            return Err(CoreError::deployment_not_found(self.id()));
        }
        Ok(guard)
    }

    pub(crate) async fn acquire_any(&self) -> MutexGuard<'_, ()> {
        self.gate.lock().await
    }

    pub(crate) fn try_acquire(&self) -> Option<MutexGuard<'_, ()>> {
        self.gate.try_lock().ok()
    }

    pub(crate) fn id(&self) -> String {
        self.record.read().id.clone()
    }

    pub(crate) fn snapshot(&self) -> Deployment {
        self.record.read().clone()
    }

    pub(crate) fn status(&self) -> DeploymentStatus {
        self.record.read().status
    }

    pub(crate) fn members(&self) -> Vec<String> {
        self.record.read().members.iter().cloned().collect()
    }

    pub(crate) fn has_member(&self, id: &str) -> bool {
        self.record.read().members.contains(id)
    }

    pub(crate) fn update<R>(&self, apply: impl FnOnce(&mut Deployment) -> R) -> R {
        apply(&mut self.record.write())
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }
}

/// Final status once an operation stops touching a deployment.
pub(crate) fn settle_status(
    deployment: &Deployment,
    target: DeploymentStatus,
    failed: bool,
) -> DeploymentStatus {
    if failed || deployment.members.len() != deployment.desired_replicas as usize {
        DeploymentStatus::Degraded
    } else {
        target
    }
}

/// Tracks one mutating operation on a deployment.
///
/// The deployment is `scaling` while the operation runs. Dropping the value
/// without calling [`Convergence::settle`] (the operation future was
/// cancelled) leaves the deployment `degraded`.
pub(crate) struct Convergence<'a> {
    slot: &'a DeploymentSlot,
    operation: &'static str,
    target: DeploymentStatus,
    failed: bool,
    done: bool,
}

impl<'a> Convergence<'a> {
    pub(crate) fn begin(
        slot: &'a DeploymentSlot,
        operation: &'static str,
        target: DeploymentStatus,
    ) -> Self {
        slot.update(|d| d.status = DeploymentStatus::Scaling);
        debug!(deployment = %slot.id(), operation, %target, "convergence started");
        Self {
            slot,
            operation,
            target,
            failed: false,
            done: false,
        }
    }

    pub(crate) fn fail(&mut self) {
        self.failed = true;
    }

    pub(crate) fn settle(mut self) -> Deployment {
        self.done = true;
        let (target, failed) = (self.target, self.failed);
        let deployment = self.slot.update(|d| {
            d.status = settle_status(d, target, failed);
            d.clone()
        });
        info!(
            deployment = %deployment.id,
            operation = self.operation,
            status = %deployment.status,
            members = deployment.members.len(),
            desired = deployment.desired_replicas,
            "convergence settled"
        );
        deployment
    }

    /// Finish without touching the status (the record is going away).
    pub(crate) fn dismiss(mut self) {
        self.done = true;
    }
}

impl Drop for Convergence<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.slot
                .update(|d| d.status = DeploymentStatus::Degraded);
            warn!(
                deployment = %self.slot.id(),
                operation = self.operation,
                "operation interrupted; deployment left degraded"
            );
        }
    }
}

impl Reconciler {
    /// Create one replica for `template` and, when `start` is set, bring it
    /// to `running`. The replica is a member from the moment the engine holds
    /// it, so an interrupted launch leaves it owned by the deployment. A
    /// replica that fails to become ready is discarded.
    pub(crate) async fn launch_replica(
        &self,
        slot: &DeploymentSlot,
        template: &Deployment,
        start: bool,
    ) -> Result<Container> {
        let name = format!("{}-{}", sanitize_name(&template.name), self.ids.next_id());
        let spec = ContainerSpec::new(name, template.image.clone())
            .with_env(template.env.iter().cloned())
            .with_label(DEPLOYMENT_LABEL, template.id.clone());

        let created = self
            .retry
            .run("create", || self.runtime.create_container(&spec))
            .await?;
        self.registry.record_created(created.clone());
        slot.update(|d| d.members.insert(created.id.clone()));
        debug!(deployment = %template.id, container = %created.id, "replica created");
        if !start {
            return Ok(created);
        }

        match self.start_and_await(&created.id).await {
            Ok(running) => Ok(running),
            Err(err) => {
                match self.retire_replica(&created.id).await {
                    Ok(()) => {
                        slot.update(|d| d.members.shift_remove(&created.id));
                    }
                    Err(cleanup) => warn!(
                        container = %created.id,
                        error = %cleanup,
                        "failed to discard replica that never became ready; kept as member"
                    ),
                }
                Err(err)
            }
        }
    }

    pub(crate) async fn start_and_await(&self, id: &str) -> Result<Container> {
        let started = self
            .retry
            .run("start", || self.runtime.start_container(id))
            .await?;
        self.registry.record_updated(started.clone());
        self.await_ready(started).await
    }

    async fn await_ready(&self, mut current: Container) -> Result<Container> {
        let deadline = Instant::now() + self.settings.ready_timeout;
        loop {
            match current.status {
                ContainerStatus::Running => return Ok(current),
                ContainerStatus::Stopped | ContainerStatus::Removed => {
                    return Err(CoreError::ReplicaNotReady {
                        id: current.id,
                        reason: format!("container is {} after start", current.status),
                    })
                }
                ContainerStatus::Created => {}
            }
            if Instant::now() >= deadline {
                return Err(CoreError::ReplicaNotReady {
                    id: current.id,
                    reason: format!(
                        "not running within {:?}",
                        self.settings.ready_timeout
                    ),
                });
            }
            tokio::time::sleep(self.settings.ready_poll_interval).await;
            let id = current.id.clone();
            current = self
                .retry
                .run("inspect", || self.runtime.inspect_container(&id))
                .await?;
            self.registry.record_updated(current.clone());
        }
    }

    pub(crate) async fn stop_replica(&self, id: &str) -> Result<Container> {
        let grace = self.settings.stop_grace_period;
        let stopped = self
            .retry
            .run("stop", || self.runtime.stop_container(id, grace))
            .await?;
        self.registry.record_updated(stopped.clone());
        Ok(stopped)
    }

    /// Stop and remove a container; a container that is already gone counts
    /// as removed.
    pub(crate) async fn retire_replica(&self, id: &str) -> Result<()> {
        match self.stop_replica(id).await {
            Ok(_) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
        match self
            .retry
            .run("remove", || self.runtime.remove_container(id))
            .await
        {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {
                self.registry.record_removed(id);
                debug!(container = %id, "replica removed");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Add `count` replicas, stopping at the first failure.
    pub(crate) async fn grow(&self, slot: &DeploymentSlot, count: usize, start: bool) -> Result<()> {
        let template = slot.snapshot();
        for _ in 0..count {
            if let Err(err) = self.launch_replica(slot, &template, start).await {
                warn!(deployment = %template.id, error = %err, "replica creation failed");
                return Err(err);
            }
        }
        Ok(())
    }

    /// Remove `count` replicas from the tail of the member set. Failures other
    /// than an unreachable engine are reported after the remaining victims
    /// have been attempted.
    pub(crate) async fn shrink(&self, slot: &DeploymentSlot, count: usize) -> Result<()> {
        let victims: Vec<String> = slot.members().into_iter().rev().take(count).collect();
        let mut first_failure = None;
        for id in victims {
            match self.retire_replica(&id).await {
                Ok(()) => {
                    slot.update(|d| d.members.shift_remove(&id));
                }
                Err(err) if err.is_unavailable() => return Err(err),
                Err(err) => {
                    warn!(container = %id, error = %err, "replica removal failed");
                    first_failure.get_or_insert(err);
                }
            }
        }
        first_failure.map_or(Ok(()), Err)
    }

    /// Start every member that is not known to be running.
    pub(crate) async fn revive(&self, slot: &DeploymentSlot) -> Result<()> {
        let mut first_failure = None;
        for id in slot.members() {
            if self.registry.get(&id).is_ok_and(|c| c.is_running()) {
                continue;
            }
            match self.start_and_await(&id).await {
                Ok(_) => {}
                Err(err) if err.is_unavailable() => return Err(err),
                Err(err) => {
                    warn!(container = %id, error = %err, "replica failed to start");
                    first_failure.get_or_insert(err);
                }
            }
        }
        first_failure.map_or(Ok(()), Err)
    }

    /// Drop members the registry no longer knows about.
    pub(crate) fn prune(&self, slot: &DeploymentSlot) -> usize {
        let gone: Vec<String> = slot
            .members()
            .into_iter()
            .filter(|id| self.registry.get(id).is_err())
            .collect();
        if !gone.is_empty() {
            slot.update(|d| d.members.retain(|id| !gone.contains(id)));
            info!(deployment = %slot.id(), pruned = gone.len(), "dropped vanished members");
        }
        gone.len()
    }

    /// Derive the status from member state after a direct container operation.
    pub(crate) fn resettle(&self, slot: &DeploymentSlot) {
        let statuses: Vec<Option<ContainerStatus>> = slot
            .members()
            .iter()
            .map(|id| self.registry.get(id).ok().map(|c| c.status))
            .collect();
        slot.update(|d| {
            let all_running = statuses
                .iter()
                .all(|s| *s == Some(ContainerStatus::Running));
            let all_stopped = statuses.iter().all(|s| {
                matches!(
                    s,
                    Some(ContainerStatus::Stopped) | Some(ContainerStatus::Created)
                )
            });
            d.status = if d.members.len() != d.desired_replicas as usize {
                DeploymentStatus::Degraded
            } else if all_running {
                DeploymentStatus::Running
            } else if all_stopped {
                DeploymentStatus::Stopped
            } else {
                DeploymentStatus::Degraded
            };
        });
    }
}
