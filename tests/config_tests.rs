//! Tests for configuration validation and defaults.

use std::time::Duration;

use adept_openstack::{OpenstackConfig, config::ConfigError};
use rstest::*;

#[fixture]
fn valid_config() -> OpenstackConfig {
    OpenstackConfig {
        default_image: String::from("Fedora-Cloud-Base-40"),
        default_flavor: String::from("m1.small"),
        timeout_secs: 120,
        lock_dir: None,
    }
}

#[rstest]
fn valid_config_passes(valid_config: OpenstackConfig) {
    valid_config
        .validate()
        .unwrap_or_else(|err| panic!("valid config should validate: {err}"));
    assert_eq!(valid_config.poll_settings().timeout(), Duration::from_secs(120));
}

#[rstest]
#[case::image(|cfg: &mut OpenstackConfig| cfg.default_image.clear(), "ADEPT_DEFAULT_IMAGE", "default_image")]
#[case::flavor(|cfg: &mut OpenstackConfig| cfg.default_flavor = String::from("  "), "ADEPT_DEFAULT_FLAVOR", "default_flavor")]
fn missing_fields_produce_actionable_errors(
    valid_config: OpenstackConfig,
    #[case] mutate: fn(&mut OpenstackConfig),
    #[case] env_var: &str,
    #[case] toml_key: &str,
) {
    let mut cfg = valid_config;
    mutate(&mut cfg);

    let error = cfg.validate().expect_err("validation should fail");
    let ConfigError::MissingField(ref message) = error else {
        panic!("expected MissingField error, got {error:?}");
    };
    assert!(
        message.contains(env_var),
        "error should mention env var {env_var}: {message}"
    );
    assert!(
        message.contains("adept-openstack.toml"),
        "error should mention config file: {message}"
    );
    assert!(
        message.contains(toml_key),
        "error should mention TOML key {toml_key}: {message}"
    );
}

#[rstest]
fn zero_timeout_is_rejected(valid_config: OpenstackConfig) {
    let cfg = OpenstackConfig {
        timeout_secs: 0,
        ..valid_config
    };

    let err = cfg.validate().expect_err("zero timeout must fail");

    assert!(matches!(err, ConfigError::Invalid(_)));
    assert!(err.to_string().contains("ADEPT_TIMEOUT_SECS"), "unexpected error: {err}");
}

#[rstest]
#[case(None, None)]
#[case(Some("   "), None)]
#[case(Some(" /var/lock/adept "), Some("/var/lock/adept"))]
fn blank_lock_dirs_fall_back_to_the_workspace(
    valid_config: OpenstackConfig,
    #[case] configured: Option<&str>,
    #[case] expected: Option<&str>,
) {
    let cfg = OpenstackConfig {
        lock_dir: configured.map(String::from),
        ..valid_config
    };

    assert_eq!(cfg.lock_dir().as_deref().map(|dir| dir.as_str()), expected);
}

#[test]
fn defaults_are_valid() {
    let cfg = OpenstackConfig::default();
    cfg.validate()
        .unwrap_or_else(|err| panic!("defaults should validate: {err}"));
    assert_eq!(cfg.timeout(), Duration::from_secs(300));
}
