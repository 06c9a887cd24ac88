//! ---
//! kormit_section: "15-testing-qa-runbook"
//! kormit_subsection: "integration-tests"
//! kormit_type: "source"
//! kormit_scope: "code"
//! kormit_description: "Validation of the configuration shipped with the workspace."
//! kormit_version: "v0.0.0-prealpha"
//! kormit_owner: "tbd"
//! ---
use std::fs;
use std::path::Path;
use std::time::Duration;

use kormit_common::{AppConfig, EngineKind, LogFormat};

fn read(path: &str) -> String {
    let manifest_dir = env!("CARGO_MANIFEST_DIR");
    let full = Path::new(manifest_dir).join("..").join(path);
    fs::read_to_string(&full)
        .unwrap_or_else(|err| panic!("failed to read {}: {}", full.display(), err))
}

#[test]
fn shipped_config_uses_frontmatter() {
    let content = read("config/kormit.toml");
    assert!(
        content.starts_with("# ---"),
        "config/kormit.toml must include frontmatter header"
    );
}

#[test]
fn shipped_config_parses_and_validates() {
    let config: AppConfig = read("config/kormit.toml").parse().expect("valid config");
    assert_eq!(config.runtime.engine, EngineKind::Docker);
    assert_eq!(config.runtime.retry.max_attempts, 4);
    assert_eq!(config.reconciler.ready_poll_interval, Duration::from_millis(250));
    assert_eq!(config.reconciler.drift_interval, Duration::from_secs(15));
    assert_eq!(config.logging.format, LogFormat::Pretty);
    assert_eq!(config.api.listen.port(), 8080);
}

#[test]
fn shipped_cors_origins_match_defaults() {
    let config: AppConfig = read("config/kormit.toml").parse().expect("valid config");
    assert_eq!(config.api.cors_origins, AppConfig::default().api.cors_origins);
}
