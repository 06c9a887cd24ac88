//! ---
//! kormit_section: "01-core-functionality"
//! kormit_subsection: "module"
//! kormit_type: "source"
//! kormit_scope: "code"
//! kormit_description: "Deployment lifecycle state machine and its operations."
//! kormit_version: "v0.0.0-prealpha"
//! kormit_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use kormit_common::{Clock, IdGenerator, ReconcilerConfig, SystemClock, UuidIdGenerator};
use kormit_metrics::ReconcilerMetrics;
use kormit_registry::ContainerRegistry;
use kormit_runtime::{RetryPolicy, RuntimeClient};
use parking_lot::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::convergence::{Convergence, DeploymentSlot};
use crate::deployment::{validate_replicas, Deployment, DeploymentSpec, DeploymentStatus};
use crate::error::{CoreError, Result};

/// Timing knobs for convergence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerSettings {
    /// Grace period handed to the engine before a stop escalates to a kill.
    pub stop_grace_period: Duration,
    /// How long a started replica may take to report `running`.
    pub ready_timeout: Duration,
    pub ready_poll_interval: Duration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self::from(&ReconcilerConfig::default())
    }
}

impl From<&ReconcilerConfig> for ReconcilerSettings {
    fn from(config: &ReconcilerConfig) -> Self {
        Self {
            stop_grace_period: config.stop_grace_period,
            ready_timeout: config.ready_timeout,
            ready_poll_interval: config.ready_poll_interval,
        }
    }
}

/// Orchestration core: owns every deployment and drives the runtime client
/// to converge actual container state onto each deployment's desired state.
///
/// Mutating operations on one deployment are serialised; operations on
/// different deployments proceed independently.
#[derive(Debug)]
pub struct Reconciler {
    pub(crate) runtime: Arc<dyn RuntimeClient>,
    pub(crate) registry: Arc<ContainerRegistry>,
    pub(crate) deployments: RwLock<IndexMap<String, Arc<DeploymentSlot>>>,
    pub(crate) ids: Arc<dyn IdGenerator>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) settings: ReconcilerSettings,
    pub(crate) retry: RetryPolicy,
    pub(crate) metrics: Option<ReconcilerMetrics>,
}

impl Reconciler {
    pub fn new(
        runtime: Arc<dyn RuntimeClient>,
        registry: Arc<ContainerRegistry>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            runtime,
            registry,
            deployments: RwLock::new(IndexMap::new()),
            ids: Arc::new(UuidIdGenerator),
            clock: Arc::new(SystemClock),
            settings,
            retry: RetryPolicy::default(),
            metrics: None,
        }
    }

    pub fn with_ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_metrics(mut self, metrics: ReconcilerMetrics) -> Self {
        self.retry = self.retry.with_metrics(metrics.clone());
        self.metrics = Some(metrics);
        self
    }

    pub fn registry(&self) -> &Arc<ContainerRegistry> {
        &self.registry
    }

    pub fn runtime(&self) -> &Arc<dyn RuntimeClient> {
        &self.runtime
    }

    pub fn get_deployment(&self, id: &str) -> Result<Deployment> {
        Ok(self.slot(id)?.snapshot())
    }

    pub fn list_deployments(&self) -> Vec<Deployment> {
        self.slots().iter().map(|slot| slot.snapshot()).collect()
    }

    #[instrument(skip(self, spec), fields(name = %spec.name, replicas = spec.replicas))]
    pub async fn create_deployment(&self, spec: DeploymentSpec) -> Result<Deployment> {
        let replicas = spec.validate()?;
        let started = Instant::now();
        let deployment = Deployment::new(self.ids.next_id(), spec, replicas, self.clock.now());
        let id = deployment.id.clone();
        let slot = Arc::new(DeploymentSlot::new(deployment));
        // Held before the record becomes visible so no other operation can
        // interleave with the initial convergence.
        let _gate = slot.acquire().await?;
        self.deployments.write().insert(id.clone(), slot.clone());
        info!(deployment = %id, replicas, "deployment accepted");

        let run = Convergence::begin(&slot, "create", DeploymentStatus::Running);
        match self.grow(&slot, replicas as usize, true).await {
            // Nothing reached the engine, so no record is kept.
            Err(err) if err.is_unavailable() && slot.members().is_empty() => {
                slot.retire();
                self.deployments.write().shift_remove(&id);
                run.dismiss();
                self.observe("create", started);
                warn!(deployment = %id, error = %err, "engine unreachable; deployment discarded");
                Err(err)
            }
            outcome => self.conclude("create", started, run, outcome),
        }
    }

    #[instrument(skip(self))]
    pub async fn scale_deployment(&self, id: &str, replicas: i64) -> Result<Deployment> {
        let desired = validate_replicas(replicas)?;
        let slot = self.slot(id)?;
        let _gate = slot.acquire().await?;

        let current = slot.snapshot();
        if current.desired_replicas == desired {
            debug!(deployment = %id, desired, status = %current.status, "replica count unchanged; nothing to do");
            return Ok(current);
        }

        let started = Instant::now();
        let target = if current.status == DeploymentStatus::Stopped {
            DeploymentStatus::Stopped
        } else {
            DeploymentStatus::Running
        };
        info!(
            deployment = %id,
            from = current.desired_replicas,
            to = desired,
            members = current.members.len(),
            "scaling deployment"
        );
        slot.update(|d| d.desired_replicas = desired);
        let run = Convergence::begin(&slot, "scale", target);
        let outcome = self
            .converge_members(&slot, desired as usize, target == DeploymentStatus::Running)
            .await;
        self.conclude("scale", started, run, outcome)
    }

    async fn converge_members(&self, slot: &DeploymentSlot, desired: usize, running: bool) -> Result<()> {
        self.prune(slot);
        let members = slot.members().len();
        if desired > members {
            self.grow(slot, desired - members, running).await?;
        } else if desired < members {
            self.shrink(slot, members - desired).await?;
        }
        if running {
            self.revive(slot).await?;
        }
        Ok(())
    }

    /// Rolling restart, one member at a time, stopping at the first member
    /// that does not come back.
    #[instrument(skip(self))]
    pub async fn restart_deployment(&self, id: &str) -> Result<Deployment> {
        let slot = self.slot(id)?;
        let _gate = slot.acquire().await?;
        let started = Instant::now();
        let run = Convergence::begin(&slot, "restart", DeploymentStatus::Running);
        let outcome = self.roll(&slot).await;
        self.conclude("restart", started, run, outcome)
    }

    async fn roll(&self, slot: &DeploymentSlot) -> Result<()> {
        for member in slot.members() {
            info!(deployment = %slot.id(), container = %member, "restarting replica");
            self.stop_replica(&member).await?;
            self.start_and_await(&member).await?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn activate_deployment(&self, id: &str) -> Result<Deployment> {
        let slot = self.slot(id)?;
        let _gate = slot.acquire().await?;
        let current = slot.snapshot();
        if current.status == DeploymentStatus::Running && current.is_converged() {
            return Ok(current);
        }
        let started = Instant::now();
        let run = Convergence::begin(&slot, "activate", DeploymentStatus::Running);
        let outcome = self.revive(&slot).await;
        self.conclude("activate", started, run, outcome)
    }

    #[instrument(skip(self))]
    pub async fn deactivate_deployment(&self, id: &str) -> Result<Deployment> {
        let slot = self.slot(id)?;
        let _gate = slot.acquire().await?;
        let current = slot.snapshot();
        if current.status == DeploymentStatus::Stopped {
            return Ok(current);
        }
        let started = Instant::now();
        let run = Convergence::begin(&slot, "deactivate", DeploymentStatus::Stopped);
        let outcome = self.halt(&slot).await;
        self.conclude("deactivate", started, run, outcome)
    }

    async fn halt(&self, slot: &DeploymentSlot) -> Result<()> {
        let mut first_failure = None;
        for member in slot.members() {
            match self.stop_replica(&member).await {
                Ok(_) => {}
                Err(err) if err.is_unavailable() => return Err(err),
                Err(err) => {
                    warn!(container = %member, error = %err, "replica failed to stop");
                    first_failure.get_or_insert(err);
                }
            }
        }
        first_failure.map_or(Ok(()), Err)
    }

    /// Stop and remove every member, then forget the deployment. Deleting an
    /// unknown id succeeds.
    #[instrument(skip(self))]
    pub async fn delete_deployment(&self, id: &str) -> Result<()> {
        let Some(slot) = self.deployments.read().get(id).cloned() else {
            debug!(deployment = %id, "delete of unknown deployment; nothing to do");
            return Ok(());
        };
        let _gate = slot.acquire_any().await;
        if slot.is_retired() {
            return Ok(());
        }

        let started = Instant::now();
        let mut run = Convergence::begin(&slot, "delete", DeploymentStatus::Stopped);
        for member in slot.members() {
            if let Err(err) = self.retire_replica(&member).await {
                warn!(deployment = %id, container = %member, error = %err, "delete interrupted");
                run.fail();
                run.settle();
                self.observe("delete", started);
                return Err(err);
            }
            slot.update(|d| d.members.shift_remove(&member));
        }

        slot.retire();
        self.deployments.write().shift_remove(id);
        run.dismiss();
        self.observe("delete", started);
        info!(deployment = %id, "deployment deleted");
        Ok(())
    }

    pub(crate) fn slot(&self, id: &str) -> Result<Arc<DeploymentSlot>> {
        self.deployments
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::deployment_not_found(id))
    }

    pub(crate) fn slots(&self) -> Vec<Arc<DeploymentSlot>> {
        self.deployments.read().values().cloned().collect()
    }

    /// Settle the operation and decide what reaches the caller. Partial
    /// convergence is reported through the `degraded` status; only an
    /// unreachable engine is returned as an error.
    fn conclude(
        &self,
        operation: &'static str,
        started: Instant,
        mut run: Convergence<'_>,
        outcome: Result<()>,
    ) -> Result<Deployment> {
        if outcome.is_err() {
            run.fail();
        }
        let deployment = run.settle();
        self.observe(operation, started);
        match outcome {
            Ok(()) => Ok(deployment),
            Err(err) if err.is_unavailable() => Err(err),
            Err(err) => {
                warn!(
                    deployment = %deployment.id,
                    operation,
                    error = %err,
                    status = %deployment.status,
                    "partial convergence recorded"
                );
                Ok(deployment)
            }
        }
    }

    pub(crate) fn observe(&self, operation: &str, started: Instant) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        metrics.observe_operation(operation, started.elapsed().as_secs_f64());
        let deployments = self.list_deployments();
        for status in DeploymentStatus::ALL {
            let count = deployments.iter().filter(|d| d.status == status).count();
            metrics.set_deployments(status.as_str(), count);
        }
    }
}
