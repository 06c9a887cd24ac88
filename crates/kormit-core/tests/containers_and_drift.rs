//! ---
//! kormit_section: "01-core-functionality"
//! kormit_subsection: "tests"
//! kormit_type: "test"
//! kormit_scope: "code"
//! kormit_description: "Direct container operations and drift reconciliation."
//! kormit_version: "v0.0.0-prealpha"
//! kormit_owner: "tbd"
//! ---
mod common;

use common::{harness, web};
use futures::StreamExt;
use kormit_core::{CoreError, DeploymentStatus, EntityKind};
use kormit_runtime::{ContainerSpec, ContainerStatus};

#[tokio::test]
async fn standalone_container_lifecycle() {
    let h = harness();
    let created = h
        .reconciler
        .create_container(ContainerSpec::new("redis", "redis:7"))
        .await
        .unwrap();
    assert_eq!(created.status, ContainerStatus::Created);
    assert_eq!(h.reconciler.get_container(&created.id).unwrap(), created);

    let started = h.reconciler.start_container(&created.id).await.unwrap();
    assert_eq!(started.status, ContainerStatus::Running);
    let stopped = h.reconciler.stop_container(&created.id).await.unwrap();
    assert_eq!(stopped.status, ContainerStatus::Stopped);

    h.reconciler.delete_container(&created.id).await.unwrap();
    h.reconciler.delete_container(&created.id).await.unwrap();
    assert!(matches!(
        h.reconciler.get_container(&created.id),
        Err(CoreError::NotFound {
            kind: EntityKind::Container,
            ..
        })
    ));
}

#[tokio::test]
async fn list_containers_includes_external_ones() {
    let h = harness();
    h.reconciler.create_deployment(web(2)).await.unwrap();
    h.engine.spawn_external("sidecar", "busybox");

    let listed = h.reconciler.list_containers().await.unwrap();
    assert_eq!(listed.len(), 3);
    assert!(listed.iter().any(|c| c.name == "sidecar"));
}

#[tokio::test]
async fn starting_unknown_container_is_not_found() {
    let h = harness();
    let err = h.reconciler.start_container("ghost").await.unwrap_err();
    assert_eq!(err, CoreError::container_not_found("ghost"));
}

#[tokio::test]
async fn stopping_a_member_degrades_and_starting_restores() {
    let h = harness();
    let created = h.reconciler.create_deployment(web(2)).await.unwrap();
    let member = created.members.first().unwrap().clone();

    h.reconciler.stop_container(&member).await.unwrap();
    assert_eq!(
        h.reconciler.get_deployment(&created.id).unwrap().status,
        DeploymentStatus::Degraded
    );

    h.reconciler.start_container(&member).await.unwrap();
    assert_eq!(
        h.reconciler.get_deployment(&created.id).unwrap().status,
        DeploymentStatus::Running
    );
}

#[tokio::test]
async fn deleting_a_member_shrinks_membership() {
    let h = harness();
    let created = h.reconciler.create_deployment(web(3)).await.unwrap();
    let member = created.members.last().unwrap().clone();

    h.reconciler.delete_container(&member).await.unwrap();
    let after = h.reconciler.get_deployment(&created.id).unwrap();
    assert_eq!(after.members.len(), 2);
    assert_eq!(after.desired_replicas, 3);
    assert_eq!(after.status, DeploymentStatus::Degraded);

    let unchanged = h.reconciler.scale_deployment(&created.id, 3).await.unwrap();
    assert_eq!(unchanged.status, DeploymentStatus::Degraded);
    assert_eq!(unchanged.members.len(), 2);

    let healed = h.reconciler.scale_deployment(&created.id, 2).await.unwrap();
    assert_eq!(healed.status, DeploymentStatus::Running);
    assert_eq!(healed.members.len(), 2);
}

#[tokio::test]
async fn container_logs_replay_history() {
    let h = harness();
    let created = h.reconciler.create_deployment(web(1)).await.unwrap();
    let member = created.members.first().unwrap().clone();
    h.reconciler.stop_container(&member).await.unwrap();

    let lines: Vec<String> = h
        .reconciler
        .container_logs(&member)
        .await
        .unwrap()
        .map(|line| line.unwrap())
        .collect()
        .await;
    assert!(lines.iter().any(|line| line == "started"));
    assert!(h.reconciler.container_logs("ghost").await.is_err());
}

#[tokio::test]
async fn externally_killed_member_degrades_deployment() {
    let h = harness();
    let created = h.reconciler.create_deployment(web(3)).await.unwrap();
    let victim = created.members.first().unwrap().clone();
    h.engine.kill_externally(&victim);

    let summary = h.reconciler.reconcile_drift().await.unwrap();
    assert_eq!(summary.degraded, vec![created.id.clone()]);
    assert_eq!(summary.containers, 2);

    let after = h.reconciler.get_deployment(&created.id).unwrap();
    assert_eq!(after.status, DeploymentStatus::Degraded);
    assert_eq!(after.members.len(), 2);
    assert!(!after.members.contains(&victim));

    let healed = h.reconciler.scale_deployment(&created.id, 4).await.unwrap();
    assert_eq!(healed.status, DeploymentStatus::Running);
    assert_eq!(healed.members.len(), 4);
    assert_eq!(h.engine.running_count(), 4);
}

#[tokio::test]
async fn externally_stopped_member_is_revived_by_activate() {
    let h = harness();
    let created = h.reconciler.create_deployment(web(2)).await.unwrap();
    let victim = created.members.first().unwrap().clone();
    h.engine.stop_externally(&victim);

    let summary = h.reconciler.reconcile_drift().await.unwrap();
    assert_eq!(summary.degraded, vec![created.id.clone()]);
    assert_eq!(
        h.reconciler.get_deployment(&created.id).unwrap().members.len(),
        2
    );

    let revived = h.reconciler.activate_deployment(&created.id).await.unwrap();
    assert_eq!(revived.status, DeploymentStatus::Running);
    assert_eq!(h.engine.running_count(), 2);
}

#[tokio::test]
async fn quiet_drift_pass_changes_nothing() {
    let h = harness();
    let created = h.reconciler.create_deployment(web(2)).await.unwrap();
    let summary = h.reconciler.reconcile_drift().await.unwrap();
    assert!(summary.degraded.is_empty());
    assert_eq!(summary.events, 0);
    assert_eq!(
        h.reconciler.get_deployment(&created.id).unwrap().status,
        DeploymentStatus::Running
    );
}
