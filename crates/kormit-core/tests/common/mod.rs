//! ---
//! kormit_section: "01-core-functionality"
//! kormit_subsection: "tests"
//! kormit_type: "test"
//! kormit_scope: "code"
//! kormit_description: "Shared harness wiring the reconciler to the simulated engine."
//! kormit_version: "v0.0.0-prealpha"
//! kormit_owner: "tbd"
//! ---
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use kormit_common::{ManualClock, SequentialIdGenerator};
use kormit_core::{DeploymentSpec, Reconciler, ReconcilerSettings};
use kormit_registry::ContainerRegistry;
use kormit_runtime::{RetryPolicy, SimulatedRuntime};

pub struct Harness {
    pub engine: Arc<SimulatedRuntime>,
    pub registry: Arc<ContainerRegistry>,
    pub reconciler: Arc<Reconciler>,
}

pub fn harness() -> Harness {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
    ));
    let engine = Arc::new(SimulatedRuntime::with_parts(
        Arc::new(SequentialIdGenerator::new("c")),
        clock.clone(),
    ));
    let retry = RetryPolicy::new(
        3,
        Duration::from_millis(1),
        Duration::from_millis(4),
        Duration::ZERO,
    );
    let registry = Arc::new(ContainerRegistry::new(engine.clone(), retry.clone()));
    let settings = ReconcilerSettings {
        stop_grace_period: Duration::from_secs(1),
        ready_timeout: Duration::from_millis(200),
        ready_poll_interval: Duration::from_millis(10),
    };
    let reconciler = Reconciler::new(engine.clone(), registry.clone(), settings)
        .with_ids(Arc::new(SequentialIdGenerator::new("d")))
        .with_clock(clock)
        .with_retry(retry);
    Harness {
        engine,
        registry,
        reconciler: Arc::new(reconciler),
    }
}

pub fn web(replicas: i64) -> DeploymentSpec {
    DeploymentSpec::new("web", "nginx:latest", replicas).with_description("front end")
}
