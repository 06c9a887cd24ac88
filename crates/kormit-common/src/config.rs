//! ---
//! kormit_section: "01-core-functionality"
//! kormit_subsection: "module"
//! kormit_type: "source"
//! kormit_scope: "code"
//! kormit_description: "Shared primitives and utilities for the control plane."
//! kormit_version: "v0.0.0-prealpha"
//! kormit_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::{debug, info};

use crate::logging::LogFormat;

fn default_engine() -> EngineKind {
    EngineKind::Docker
}

fn default_retry_attempts() -> u32 {
    4
}

fn default_retry_base_delay() -> Duration {
    Duration::from_millis(200)
}

fn default_retry_max_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_retry_jitter() -> Duration {
    Duration::from_millis(50)
}

fn default_stop_grace_period() -> Duration {
    Duration::from_secs(10)
}

fn default_ready_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_ready_poll_interval() -> Duration {
    Duration::from_millis(250)
}

fn default_drift_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9898))
}

fn default_api_enabled() -> bool {
    true
}

fn default_api_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:8081".to_owned(),
        "http://127.0.0.1:8081".to_owned(),
        "http://kormit-frontend-dev:8080".to_owned(),
    ]
}

/// Primary configuration object for the Kormit daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    /// `None` when no candidate existed and defaults were applied.
    pub source: Option<PathBuf>,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "KORMIT_CONFIG";

    /// Load configuration from disk, respecting the `KORMIT_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration together with the effective source path.
    ///
    /// An explicit `KORMIT_CONFIG` path must exist. Candidate paths are probed in
    /// order and the built-in defaults apply when none of them exists.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        for candidate in candidates {
            let path = candidate.as_ref();
            if path.exists() {
                let config = Self::from_path(path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path.to_path_buf()),
                });
            }
        }

        info!(
            inspected = %candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            "no configuration file found; using defaults"
        );
        let config = Self::default();
        config.validate()?;
        Ok(LoadedAppConfig {
            config,
            source: None,
        })
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.runtime.validate()?;
        self.reconciler.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Container engine backing the runtime client.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Docker Engine API over the local socket.
    Docker,
    /// In-process engine simulation, used for demos and tests.
    Simulated,
}

impl std::str::FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(EngineKind::Docker),
            "simulated" | "sim" => Ok(EngineKind::Simulated),
            other => Err(format!("unknown engine: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_engine")]
    pub engine: EngineKind,
    /// Docker socket path or `tcp://` URL; local defaults apply when unset.
    #[serde(default)]
    pub docker_host: Option<String>,
    /// Restrict listings to containers carrying this `key=value` label.
    #[serde(default)]
    pub label_scope: Option<String>,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            docker_host: None,
            label_scope: None,
            retry: RetryConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(scope) = &self.label_scope {
            if !scope.contains('=') {
                return Err(anyhow!(
                    "runtime.label_scope '{}' must have the form key=value",
                    scope
                ));
            }
        }
        self.retry.validate()
    }
}

/// Exponential backoff applied to engine calls that fail with an unreachable engine.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub base_delay: Duration,
    #[serde(default = "default_retry_max_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_delay: Duration,
    #[serde(default = "default_retry_jitter")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            base_delay: default_retry_base_delay(),
            max_delay: default_retry_max_delay(),
            jitter: default_retry_jitter(),
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("runtime.retry.max_attempts must be at least 1"));
        }
        if self.max_delay < self.base_delay {
            return Err(anyhow!(
                "runtime.retry.max_delay must not be shorter than base_delay"
            ));
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Time a container is given to exit after the graceful stop signal.
    #[serde(default = "default_stop_grace_period")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub stop_grace_period: Duration,
    /// Upper bound on waiting for a started replica to report running.
    #[serde(default = "default_ready_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub ready_timeout: Duration,
    #[serde(default = "default_ready_poll_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub ready_poll_interval: Duration,
    /// Cadence of the background drift reconciliation loop.
    #[serde(default = "default_drift_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub drift_interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            stop_grace_period: default_stop_grace_period(),
            ready_timeout: default_ready_timeout(),
            ready_poll_interval: default_ready_poll_interval(),
            drift_interval: default_drift_interval(),
        }
    }
}

impl ReconcilerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ready_poll_interval.is_zero() {
            return Err(anyhow!("reconciler.ready_poll_interval must be non-zero"));
        }
        if self.drift_interval.is_zero() {
            return Err(anyhow!("reconciler.drift_interval must be non-zero"));
        }
        if self.ready_timeout < self.ready_poll_interval {
            return Err(anyhow!(
                "reconciler.ready_timeout must be at least one poll interval"
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,
    #[serde(default = "default_api_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            listen: default_api_listen(),
            cors_origins: default_cors_origins(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config: AppConfig = "".parse().expect("defaults parse");
        assert_eq!(config.runtime.engine, EngineKind::Docker);
        assert_eq!(config.runtime.retry.max_attempts, 4);
        assert_eq!(config.reconciler.stop_grace_period, Duration::from_secs(10));
        assert_eq!(config.api.listen.port(), 8080);
        assert_eq!(config.api.cors_origins.len(), 3);
    }

    #[test]
    fn durations_parse_in_declared_units() {
        let config: AppConfig = r#"
            [runtime]
            engine = "simulated"

            [runtime.retry]
            max_attempts = 2
            base_delay = 10
            max_delay = 40
            jitter = 0

            [reconciler]
            stop_grace_period = 3
            ready_timeout = 5
            ready_poll_interval = 20
            drift_interval = 60
        "#
        .parse()
        .expect("valid config");
        assert_eq!(config.runtime.engine, EngineKind::Simulated);
        assert_eq!(config.runtime.retry.base_delay, Duration::from_millis(10));
        assert_eq!(config.reconciler.stop_grace_period, Duration::from_secs(3));
        assert_eq!(
            config.reconciler.ready_poll_interval,
            Duration::from_millis(20)
        );
    }

    #[test]
    fn zero_retry_attempts_rejected() {
        let err = "[runtime.retry]\nmax_attempts = 0"
            .parse::<AppConfig>()
            .expect_err("zero attempts must fail");
        assert!(err.to_string().contains("max_attempts"));
    }

    #[test]
    fn malformed_label_scope_rejected() {
        let err = "[runtime]\nlabel_scope = \"managed\""
            .parse::<AppConfig>()
            .expect_err("scope without '=' must fail");
        assert!(err.to_string().contains("label_scope"));
    }

    #[test]
    fn engine_kind_from_str() {
        assert_eq!("Docker".parse::<EngineKind>(), Ok(EngineKind::Docker));
        assert_eq!("sim".parse::<EngineKind>(), Ok(EngineKind::Simulated));
        assert!("podman".parse::<EngineKind>().is_err());
    }
}
