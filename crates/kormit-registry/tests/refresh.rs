//! ---
//! kormit_section: "01-core-functionality"
//! kormit_subsection: "tests"
//! kormit_type: "test"
//! kormit_scope: "code"
//! kormit_description: "Refresh coalescing and drift resolution against the simulated engine."
//! kormit_version: "v0.0.0-prealpha"
//! kormit_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use kormit_registry::{ContainerRegistry, DriftKind, RegistryError};
use kormit_runtime::{
    ContainerSpec, ContainerStatus, RetryPolicy, RuntimeClient, RuntimeError, SimOp,
    SimulatedRuntime,
};

fn quick_retry() -> RetryPolicy {
    RetryPolicy::new(
        2,
        Duration::from_millis(1),
        Duration::from_millis(2),
        Duration::ZERO,
    )
}

fn setup() -> (Arc<SimulatedRuntime>, Arc<ContainerRegistry>) {
    let engine = Arc::new(SimulatedRuntime::new());
    let registry = Arc::new(ContainerRegistry::new(engine.clone(), quick_retry()));
    (engine, registry)
}

#[tokio::test]
async fn concurrent_refreshes_share_one_listing() {
    let (engine, registry) = setup();
    engine.spawn_external("web", "nginx");
    engine.set_latency(SimOp::List, Duration::from_millis(50));

    let results = join_all((0..5).map(|_| registry.refresh())).await;
    let reports: Vec<_> = results.into_iter().map(|r| r.expect("refresh")).collect();

    assert_eq!(engine.calls(SimOp::List), 1);
    assert!(reports.iter().all(|r| Arc::ptr_eq(r, &reports[0])));
    assert_eq!(reports[0].containers.len(), 1);

    // Once settled, the next refresh queries again.
    registry.refresh().await.expect("refresh");
    assert_eq!(engine.calls(SimOp::List), 2);
}

#[tokio::test]
async fn externally_killed_container_is_evicted() {
    let (engine, registry) = setup();
    let external = engine.spawn_external("web", "nginx");
    let first = registry.refresh().await.unwrap();
    assert_eq!(first.drift[0].kind, DriftKind::Discovered);
    assert!(registry.get(&external.id).is_ok());

    engine.kill_externally(&external.id);
    let report = registry.refresh().await.unwrap();
    assert_eq!(report.drift.len(), 1);
    assert_eq!(report.drift[0].kind, DriftKind::Vanished);
    assert_eq!(
        registry.get(&external.id),
        Err(RegistryError::NotFound(external.id.clone()))
    );
}

#[tokio::test]
async fn externally_stopped_container_reports_status_change() {
    let (engine, registry) = setup();
    let external = engine.spawn_external("web", "nginx");
    registry.refresh().await.unwrap();

    engine.stop_externally(&external.id);
    let report = registry.refresh().await.unwrap();
    assert_eq!(
        report.drift[0].kind,
        DriftKind::StatusChanged {
            from: ContainerStatus::Running,
            to: ContainerStatus::Stopped,
        }
    );
    assert!(report.lost_ids().contains(external.id.as_str()));
    assert_eq!(
        registry.get(&external.id).unwrap().status,
        ContainerStatus::Stopped
    );
}

#[tokio::test]
async fn unreachable_engine_surfaces_after_retries() {
    let (engine, registry) = setup();
    engine.set_unavailable_for(10);
    let err = registry.refresh().await.unwrap_err();
    assert!(matches!(
        err,
        RegistryError::Runtime(RuntimeError::Unavailable(_))
    ));
    assert_eq!(engine.calls(SimOp::List), 2);
}

#[tokio::test(start_paused = true)]
async fn local_record_during_refresh_is_not_overwritten() {
    let (engine, registry) = setup();
    let created = engine
        .create_container(&ContainerSpec::new("web", "nginx"))
        .await
        .unwrap();
    registry.record_created(created.clone());
    engine.set_latency(SimOp::List, Duration::from_millis(100));

    let background = tokio::spawn({
        let registry = registry.clone();
        async move { registry.refresh().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let mut stopped = created.clone();
    stopped.status = ContainerStatus::Stopped;
    registry.record_updated(stopped);

    let report = background.await.unwrap().unwrap();
    assert!(report.is_clean());
    assert_eq!(
        registry.get(&created.id).unwrap().status,
        ContainerStatus::Stopped
    );
}

#[tokio::test]
async fn record_removed_evicts_immediately() {
    let (engine, registry) = setup();
    let created = engine
        .create_container(&ContainerSpec::new("web", "nginx"))
        .await
        .unwrap();
    registry.record_created(created.clone());
    assert_eq!(registry.len(), 1);
    registry.record_removed(&created.id);
    assert!(registry.is_empty());
    assert!(registry.list().is_empty());
}
