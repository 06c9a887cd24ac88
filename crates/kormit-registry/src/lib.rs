//! ---
//! kormit_section: "01-core-functionality"
//! kormit_subsection: "module"
//! kormit_type: "source"
//! kormit_scope: "code"
//! kormit_description: "Cached container view with coalesced refresh and drift detection."
//! kormit_version: "v0.0.0-prealpha"
//! kormit_owner: "tbd"
//! ---
//! Container registry.
//!
//! The registry is the single read path for container state. It only reads
//! from the engine (`refresh`); mutations arrive through the `record_*`
//! entry points after the reconciler has completed an engine call.
//!
//! Every recorded mutation bumps an epoch. A refresh remembers the epoch at
//! which its listing started and never overwrites entries touched after that
//! point, so a slow listing cannot resurrect or roll back newer local state.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use indexmap::IndexMap;
use kormit_metrics::ReconcilerMetrics;
use kormit_runtime::{Container, ContainerStatus, RetryPolicy, RuntimeClient, RuntimeError};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("container not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// One divergence between the cache and the engine found by a refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Drift {
    pub id: String,
    pub name: String,
    pub deployment: Option<String>,
    pub kind: DriftKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriftKind {
    /// The engine reports a different status than the cache held.
    StatusChanged {
        from: ContainerStatus,
        to: ContainerStatus,
    },
    /// The container disappeared from the engine; it was marked removed and evicted.
    Vanished,
    /// The engine holds a container the cache did not know about.
    Discovered,
}

impl DriftKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::StatusChanged { .. } => "status_changed",
            Self::Vanished => "vanished",
            Self::Discovered => "discovered",
        }
    }
}

/// Outcome of a refresh, shared by every caller joined on it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    /// Cache contents right after the merge.
    pub containers: Vec<Container>,
    pub drift: Vec<Drift>,
}

impl RefreshReport {
    pub fn is_clean(&self) -> bool {
        self.drift.is_empty()
    }

    /// Ids that vanished from the engine or stopped without a local request.
    pub fn lost_ids(&self) -> HashSet<&str> {
        self.drift
            .iter()
            .filter(|drift| match drift.kind {
                DriftKind::Vanished => true,
                DriftKind::StatusChanged { from, to } => {
                    from == ContainerStatus::Running && to != ContainerStatus::Running
                }
                DriftKind::Discovered => false,
            })
            .map(|drift| drift.id.as_str())
            .collect()
    }
}

type RefreshFlight = Shared<BoxFuture<'static, Result<Arc<RefreshReport>, RuntimeError>>>;

#[derive(Debug, Clone)]
struct Entry {
    container: Container,
    touched: u64,
}

#[derive(Debug, Default)]
struct RegistryState {
    entries: IndexMap<String, Entry>,
    /// Epoch at which locally removed ids were evicted.
    tombstones: HashMap<String, u64>,
    epoch: u64,
}

impl RegistryState {
    fn bump(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    fn merge(&mut self, listing: Vec<Container>, since: u64) -> RefreshReport {
        let mut drift = Vec::new();
        let mut seen = HashSet::new();

        for container in listing {
            if container.status == ContainerStatus::Removed {
                continue;
            }
            if self
                .tombstones
                .get(&container.id)
                .is_some_and(|removed_at| *removed_at > since)
            {
                continue;
            }
            seen.insert(container.id.clone());
            match self.entries.get_mut(&container.id) {
                Some(entry) if entry.touched > since => {}
                Some(entry) => {
                    if entry.container.status != container.status {
                        drift.push(drift_of(
                            &container,
                            DriftKind::StatusChanged {
                                from: entry.container.status,
                                to: container.status,
                            },
                        ));
                    }
                    entry.container = container;
                }
                None => {
                    drift.push(drift_of(&container, DriftKind::Discovered));
                    self.entries.insert(
                        container.id.clone(),
                        Entry {
                            container,
                            touched: since,
                        },
                    );
                }
            }
        }

        let vanished: Vec<String> = self
            .entries
            .iter()
            .filter(|(id, entry)| !seen.contains(*id) && entry.touched <= since)
            .map(|(id, _)| id.clone())
            .collect();
        for id in vanished {
            if let Some(mut entry) = self.entries.shift_remove(&id) {
                entry.container.status = ContainerStatus::Removed;
                drift.push(drift_of(&entry.container, DriftKind::Vanished));
            }
        }

        self.tombstones.retain(|_, removed_at| *removed_at > since);

        RefreshReport {
            containers: self
                .entries
                .values()
                .map(|entry| entry.container.clone())
                .collect(),
            drift,
        }
    }
}

fn drift_of(container: &Container, kind: DriftKind) -> Drift {
    Drift {
        id: container.id.clone(),
        name: container.name.clone(),
        deployment: container.deployment().map(str::to_owned),
        kind,
    }
}

pub struct ContainerRegistry {
    runtime: Arc<dyn RuntimeClient>,
    retry: RetryPolicy,
    state: Arc<RwLock<RegistryState>>,
    in_flight: Mutex<Option<RefreshFlight>>,
    metrics: Option<ReconcilerMetrics>,
}

impl fmt::Debug for ContainerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerRegistry")
            .field("engine", &self.runtime.engine())
            .field("containers", &self.len())
            .field("refresh_in_flight", &self.in_flight.lock().is_some())
            .finish()
    }
}

impl ContainerRegistry {
    pub fn new(runtime: Arc<dyn RuntimeClient>, retry: RetryPolicy) -> Self {
        Self {
            runtime,
            retry,
            state: Arc::new(RwLock::new(RegistryState::default())),
            in_flight: Mutex::new(None),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ReconcilerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn get(&self, id: &str) -> Result<Container, RegistryError> {
        self.state
            .read()
            .entries
            .get(id)
            .map(|entry| entry.container.clone())
            .ok_or_else(|| RegistryError::NotFound(id.to_owned()))
    }

    pub fn list(&self) -> Vec<Container> {
        self.state
            .read()
            .entries
            .values()
            .map(|entry| entry.container.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pull the engine listing and merge it into the cache.
    ///
    /// Callers arriving while a refresh is in flight join it and receive its
    /// result instead of issuing another listing.
    pub async fn refresh(&self) -> Result<Arc<RefreshReport>, RegistryError> {
        let (flight, coalesced) = {
            let mut slot = self.in_flight.lock();
            match slot.as_ref() {
                Some(flight) => (flight.clone(), true),
                None => {
                    let flight = Self::query(
                        self.runtime.clone(),
                        self.retry.clone(),
                        self.state.clone(),
                        self.metrics.clone(),
                    )
                    .boxed()
                    .shared();
                    *slot = Some(flight.clone());
                    (flight, false)
                }
            }
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_refresh(coalesced);
        }
        debug!(coalesced, "registry refresh");

        let outcome = flight.clone().await;

        let mut slot = self.in_flight.lock();
        if slot
            .as_ref()
            .is_some_and(|current| current.ptr_eq(&flight))
        {
            *slot = None;
        }
        drop(slot);

        outcome.map_err(RegistryError::from)
    }

    async fn query(
        runtime: Arc<dyn RuntimeClient>,
        retry: RetryPolicy,
        state: Arc<RwLock<RegistryState>>,
        metrics: Option<ReconcilerMetrics>,
    ) -> Result<Arc<RefreshReport>, RuntimeError> {
        let since = state.read().epoch;
        let listing = retry.run("list", || runtime.list_containers()).await?;
        let report = state.write().merge(listing, since);

        for drift in &report.drift {
            if let Some(metrics) = &metrics {
                metrics.record_drift(drift.kind.label());
            }
            match drift.kind {
                DriftKind::Vanished => warn!(
                    id = %drift.id,
                    name = %drift.name,
                    deployment = ?drift.deployment,
                    "container vanished from engine"
                ),
                DriftKind::StatusChanged { from, to } => info!(
                    id = %drift.id,
                    name = %drift.name,
                    %from,
                    %to,
                    "container status changed outside kormit"
                ),
                DriftKind::Discovered => debug!(
                    id = %drift.id,
                    name = %drift.name,
                    "discovered container"
                ),
            }
        }
        Ok(Arc::new(report))
    }

    pub fn record_created(&self, container: Container) {
        self.upsert(container);
    }

    pub fn record_updated(&self, container: Container) {
        self.upsert(container);
    }

    pub fn record_removed(&self, id: &str) {
        let mut state = self.state.write();
        let epoch = state.bump();
        state.entries.shift_remove(id);
        state.tombstones.insert(id.to_owned(), epoch);
    }

    fn upsert(&self, container: Container) {
        if container.status == ContainerStatus::Removed {
            self.record_removed(&container.id);
            return;
        }
        let mut state = self.state.write();
        let epoch = state.bump();
        state.tombstones.remove(&container.id);
        state.entries.insert(
            container.id.clone(),
            Entry {
                container,
                touched: epoch,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kormit_runtime::ContainerSpec;
    use std::collections::BTreeMap;

    fn container(id: &str, status: ContainerStatus) -> Container {
        Container {
            id: id.to_owned(),
            name: format!("{id}-name"),
            image: "nginx".to_owned(),
            status,
            created_at: Default::default(),
            labels: BTreeMap::new(),
        }
    }

    #[test]
    fn runtime_state_wins_for_untouched_entries() {
        let mut state = RegistryState::default();
        state.entries.insert(
            "a".into(),
            Entry {
                container: container("a", ContainerStatus::Running),
                touched: 0,
            },
        );
        let report = state.merge(vec![container("a", ContainerStatus::Stopped)], 0);
        assert_eq!(state.entries["a"].container.status, ContainerStatus::Stopped);
        assert_eq!(
            report.drift[0].kind,
            DriftKind::StatusChanged {
                from: ContainerStatus::Running,
                to: ContainerStatus::Stopped
            }
        );
        assert!(report.lost_ids().contains("a"));
    }

    #[test]
    fn entries_touched_after_listing_started_are_kept() {
        let mut state = RegistryState::default();
        let epoch = state.bump();
        state.entries.insert(
            "fresh".into(),
            Entry {
                container: container("fresh", ContainerStatus::Running),
                touched: epoch,
            },
        );
        let report = state.merge(Vec::new(), 0);
        assert!(state.entries.contains_key("fresh"));
        assert!(report.is_clean());
    }

    #[test]
    fn tombstones_block_stale_resurrection() {
        let mut state = RegistryState::default();
        let epoch = state.bump();
        state.tombstones.insert("gone".into(), epoch);
        let report = state.merge(vec![container("gone", ContainerStatus::Running)], 0);
        assert!(!state.entries.contains_key("gone"));
        assert!(report.is_clean());
        assert!(state.tombstones.contains_key("gone"));

        state.merge(Vec::new(), epoch);
        assert!(state.tombstones.is_empty());
    }

    #[test]
    fn drift_carries_deployment_label() {
        let spec = ContainerSpec::new("web-1", "nginx").with_label(kormit_runtime::DEPLOYMENT_LABEL, "d-1");
        let mut discovered = container("x", ContainerStatus::Running);
        discovered.labels = spec.labels;
        let mut state = RegistryState::default();
        let report = state.merge(vec![discovered], 0);
        assert_eq!(report.drift[0].deployment.as_deref(), Some("d-1"));
        assert_eq!(report.drift[0].kind, DriftKind::Discovered);
    }
}
