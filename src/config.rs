//! Configuration loading via `ortho-config`.

use std::ffi::OsString;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::openstack::PollSettings;
use crate::request::{DEFAULT_FLAVOR, DEFAULT_IMAGE};

/// Name of the configuration file searched by discovery.
pub const CONFIG_FILE_NAME: &str = "adept-openstack.toml";

/// Provisioning defaults layered from configuration files and the
/// environment. Command-line flags override every value.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "ADEPT",
    discovery(
        app_name = "adept-openstack",
        env_var = "ADEPT_CONFIG_PATH",
        config_file_name = "adept-openstack.toml",
        dotfile_name = ".adept-openstack.toml",
        project_file_name = "adept-openstack.toml"
    )
)]
pub struct OpenstackConfig {
    /// Image name used when the command line names none.
    #[ortho_config(default = DEFAULT_IMAGE.to_owned())]
    pub default_image: String,
    /// Flavor name used when the command line names none.
    #[ortho_config(default = DEFAULT_FLAVOR.to_owned())]
    pub default_flavor: String,
    /// Deadline applied to every poller, in seconds.
    #[ortho_config(default = 300)]
    pub timeout_secs: u64,
    /// Directory holding the host-wide address lock. Defaults to the
    /// workspace.
    pub lock_dir: Option<String>,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to {CONFIG_FILE_NAME}",
            self.description, self.env_var, self.toml_key
        ))
    }
}

impl OpenstackConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(metadata.missing());
        }
        Ok(())
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails, or the
    /// validation error for the first invalid field.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        let config = Self::load_from_iter([OsString::from("adept-openstack")])
            .map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and configuration key that supply each value.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::MissingField`] when a required value is empty.
    /// - [`ConfigError::Invalid`] when the timeout is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(
            &self.default_image,
            &FieldMetadata::new("default image", "ADEPT_DEFAULT_IMAGE", "default_image"),
        )?;
        Self::require_field(
            &self.default_flavor,
            &FieldMetadata::new("default flavor", "ADEPT_DEFAULT_FLAVOR", "default_flavor"),
        )?;
        if self.timeout_secs == 0 {
            return Err(ConfigError::Invalid(format!(
                "timeout must be positive: set ADEPT_TIMEOUT_SECS or timeout_secs in {CONFIG_FILE_NAME}"
            )));
        }
        Ok(())
    }

    /// Configured poller deadline.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Poller settings derived from the configured deadline.
    #[must_use]
    pub const fn poll_settings(&self) -> PollSettings {
        PollSettings::new(self.timeout())
    }

    /// Configured lock directory, ignoring blank values.
    #[must_use]
    pub fn lock_dir(&self) -> Option<Utf8PathBuf> {
        self.lock_dir
            .as_deref()
            .map(str::trim)
            .filter(|dir| !dir.is_empty())
            .map(Utf8PathBuf::from)
    }
}

impl Default for OpenstackConfig {
    fn default() -> Self {
        Self {
            default_image: DEFAULT_IMAGE.to_owned(),
            default_flavor: DEFAULT_FLAVOR.to_owned(),
            timeout_secs: 300,
            lock_dir: None,
        }
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a configuration value is present but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}
