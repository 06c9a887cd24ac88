//! ---
//! kormit_section: "01-core-functionality"
//! kormit_subsection: "module"
//! kormit_type: "source"
//! kormit_scope: "code"
//! kormit_description: "Shared primitives and utilities for the control plane."
//! kormit_version: "v0.0.0-prealpha"
//! kormit_owner: "tbd"
//! ---
//! Core shared primitives for the Kormit workspace.
//! This crate exposes configuration loading, logging bootstrap, and the
//! clock and id-generator capabilities injected into the orchestration core.

pub mod config;
pub mod ids;
pub mod logging;
pub mod time;

pub use config::{
    ApiConfig, AppConfig, EngineKind, LoadedAppConfig, LoggingConfig, MetricsConfig,
    ReconcilerConfig, RetryConfig, RuntimeConfig,
};
pub use ids::{IdGenerator, SequentialIdGenerator, UuidIdGenerator};
pub use logging::{init_tracing, LogFormat};
pub use time::{Clock, ManualClock, SystemClock};
